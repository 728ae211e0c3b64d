//! Repository façade over the active storage strategy.
//!
//! Every strategy call goes through the same path: optional concurrency
//! permit, retry with timeout, performance accounting. Loads can be cached,
//! deferred per entity collection and change-tracked, as selected by
//! [`RepositoryOptions`].

pub mod cache;
pub mod lazy;
pub mod options;
pub mod tracking;


use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::{EntityKind, SemanticModel, SemanticModelEntity};
use crate::retry::RetryPolicy;
use crate::storage::{self, ModelLocation, StorageKind, StorageStrategy};
use crate::{Result, StoreError};

pub use cache::{CacheStats, ModelCache};
pub use lazy::{CollectionLoader, EntityCollection, LazyCollection, LoadState};
pub use options::{PerformanceMonitoringOptions, RepositoryOptions};
pub use tracking::{ChangeSet, ChangeState, ChangeTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperationStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
    pub slow: u64,
}

impl OperationStats {
    #[inline]
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total / u32::try_from(self.count).unwrap_or(u32::MAX)
    }
}

/// Per-operation timing; slow operations are logged at warn level
#[derive(Debug)]
struct PerformanceMonitor {
    options: PerformanceMonitoringOptions,
    stats: Mutex<HashMap<&'static str, OperationStats>>,
}

impl PerformanceMonitor {
    fn new(options: PerformanceMonitoringOptions) -> Self {
        Self {
            options,
            stats: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, operation: &'static str, target: &str, elapsed: Duration) {
        if !self.options.enabled {
            return;
        }

        let slow = elapsed > self.options.slow_operation_threshold;
        if slow {
            warn!(
                "Slow storage operation: {} on {} took {:?} (threshold {:?})",
                operation, target, elapsed, self.options.slow_operation_threshold
            );
        }

        if let Ok(mut stats) = self.stats.lock() {
            let entry = stats.entry(operation).or_default();
            entry.count += 1;
            entry.total += elapsed;
            entry.max = entry.max.max(elapsed);
            if slow {
                entry.slow += 1;
            }
        }
    }

    fn snapshot(&self) -> Vec<(String, OperationStats)> {
        let mut snapshot: Vec<(String, OperationStats)> = self
            .stats
            .lock()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(operation, stats)| ((*operation).to_string(), *stats))
                    .collect()
            })
            .unwrap_or_default();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }
}

/// Shared call path for strategy operations
#[derive(Clone)]
struct CallGuard {
    gate: Option<Arc<Semaphore>>,
    retry: RetryPolicy,
}

impl CallGuard {
    async fn permit(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match &self.gate {
            Some(gate) => Arc::clone(gate)
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| StoreError::Cancelled("repository is shutting down".to_string())),
            None => Ok(None),
        }
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, target: &str, attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self.permit().await?;
        self.retry.run(operation, target, attempt).await
    }
}

/// Deferred fetch of one entity collection through the repository call path
struct StrategyCollectionLoader {
    strategy: Arc<dyn StorageStrategy>,
    location: ModelLocation,
    kind: EntityKind,
    guard: CallGuard,
}

#[async_trait]
impl CollectionLoader for StrategyCollectionLoader {
    async fn load(&self) -> Result<Vec<SemanticModelEntity>> {
        self.guard
            .run("load entities", self.location.as_str(), || {
                self.strategy.load_entities(&self.location, self.kind)
            })
            .await
    }

    fn describe(&self) -> String {
        format!(
            "{} {}/{}",
            self.strategy.kind(),
            self.location,
            self.kind.collection_name()
        )
    }
}

pub struct Repository {
    strategy: Arc<dyn StorageStrategy>,
    guard: CallGuard,
    cache: ModelCache,
    monitor: PerformanceMonitor,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("strategy", &self.strategy.kind())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Repository-wide settings (concurrency limit, cache TTL, monitoring)
    /// come from `options`; per-call options select lazy loading, tracking
    /// and caching
    #[inline]
    pub fn new(strategy: Arc<dyn StorageStrategy>, options: &RepositoryOptions) -> Self {
        Self::with_retry(strategy, options, RetryPolicy::default())
    }

    #[inline]
    pub fn with_retry(
        strategy: Arc<dyn StorageStrategy>,
        options: &RepositoryOptions,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            strategy,
            guard: CallGuard {
                gate: options
                    .max_concurrent_operations()
                    .map(|limit| Arc::new(Semaphore::new(limit))),
                retry,
            },
            cache: ModelCache::new(options.cache_ttl()),
            monitor: PerformanceMonitor::new(options.performance()),
        }
    }

    /// Builds the configured strategy; the config's concurrency limit applies
    /// unless `options` sets one
    #[inline]
    pub async fn from_config(config: &Config, options: &RepositoryOptions) -> Result<Self> {
        config.validate()?;
        let strategy = storage::create_strategy(config).await?;
        let options = match (
            options.max_concurrent_operations(),
            config.storage.max_concurrent_operations,
        ) {
            (None, Some(limit)) => options.with_max_concurrent_operations(limit),
            _ => options.clone(),
        };
        Ok(Self::with_retry(
            strategy,
            &options,
            RetryPolicy::from_config(&config.storage),
        ))
    }

    #[inline]
    pub fn strategy(&self) -> &Arc<dyn StorageStrategy> {
        &self.strategy
    }

    #[inline]
    pub fn strategy_kind(&self) -> StorageKind {
        self.strategy.kind()
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, target: &str, attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = self.guard.run(operation, target, attempt).await;
        self.monitor.record(operation, target, started.elapsed());
        result
    }

    fn check_strategy_name(&self, options: &RepositoryOptions) -> Result<()> {
        let Some(name) = options.strategy_name() else {
            return Ok(());
        };

        match StorageKind::parse(name) {
            Some(kind) if kind == self.strategy.kind() => Ok(()),
            Some(kind) => Err(StoreError::Configuration(format!(
                "requested storage strategy {} but the repository uses {}",
                kind,
                self.strategy.kind()
            ))),
            None => Err(StoreError::Configuration(format!(
                "unknown storage strategy {:?}",
                name
            ))),
        }
    }

    #[inline]
    pub async fn load_model(
        &self,
        location: &ModelLocation,
        options: &RepositoryOptions,
    ) -> Result<SemanticModel> {
        self.check_strategy_name(options)?;
        let cache_key = location.cache_key(self.strategy.kind());

        if options.caching() {
            if let Some(mut model) = self.cache.get(&cache_key) {
                if options.change_tracking() {
                    model.enable_change_tracking();
                }
                return Ok(model);
            }
        }

        let mut model = if options.lazy_loading() {
            self.load_deferred(location).await?
        } else {
            self.call("load", location.as_str(), || self.strategy.load(location))
                .await?
        };

        if options.caching() {
            self.cache.insert(&cache_key, model.clone());
        }

        if options.change_tracking() {
            model.enable_change_tracking();
        }

        info!(
            "Loaded model {} from {} (lazy: {}, tracking: {})",
            location,
            self.strategy.kind(),
            options.lazy_loading(),
            options.change_tracking()
        );
        Ok(model)
    }

    async fn load_deferred(&self, location: &ModelLocation) -> Result<SemanticModel> {
        let header = self
            .call("load header", location.as_str(), || {
                self.strategy.load_header(location)
            })
            .await?;

        let deferred = |kind| {
            EntityCollection::Deferred(LazyCollection::new(
                kind,
                Arc::new(StrategyCollectionLoader {
                    strategy: Arc::clone(&self.strategy),
                    location: location.clone(),
                    kind,
                    guard: self.guard.clone(),
                }),
            ))
        };

        debug!(
            "Deferring {} entity bodies of model {}",
            header.entities.len(),
            location
        );
        Ok(SemanticModel::from_parts(
            header.name,
            header.source,
            header.description,
            deferred(EntityKind::Table),
            deferred(EntityKind::View),
            deferred(EntityKind::StoredProcedure),
        ))
    }

    /// Writes the whole model and marks it clean
    #[inline]
    pub async fn save_model(
        &self,
        location: &ModelLocation,
        model: &mut SemanticModel,
    ) -> Result<()> {
        {
            let snapshot: &SemanticModel = model;
            self.call("save", location.as_str(), || {
                self.strategy.save(location, snapshot)
            })
            .await?;
        }

        self.cache
            .invalidate(&location.cache_key(self.strategy.kind()));
        model.accept_all_changes();
        Ok(())
    }

    /// Writes only dirty entities when tracking is enabled, otherwise the whole model
    #[inline]
    pub async fn save_changes(
        &self,
        location: &ModelLocation,
        model: &mut SemanticModel,
    ) -> Result<()> {
        let Some(tracker) = model.change_tracker() else {
            return self.save_model(location, model).await;
        };

        if !tracker.has_unsaved_changes() {
            debug!("Model {} has no unsaved changes", location);
            return Ok(());
        }

        let changes = tracker.changes();
        {
            let snapshot: &SemanticModel = model;
            self.call("save changes", location.as_str(), || {
                self.strategy.save_changes(location, snapshot, &changes)
            })
            .await?;
        }

        self.cache
            .invalidate(&location.cache_key(self.strategy.kind()));
        model.accept_all_changes();
        Ok(())
    }

    #[inline]
    pub async fn delete_model(&self, location: &ModelLocation) -> Result<()> {
        self.call("delete", location.as_str(), || self.strategy.delete(location))
            .await?;
        self.cache
            .invalidate(&location.cache_key(self.strategy.kind()));
        Ok(())
    }

    #[inline]
    pub async fn model_exists(&self, location: &ModelLocation) -> Result<bool> {
        self.call("exists", location.as_str(), || self.strategy.exists(location))
            .await
    }

    #[inline]
    pub async fn list_models(&self) -> Result<Vec<ModelLocation>> {
        self.call("list", "models", || self.strategy.list()).await
    }

    #[inline]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Operation timings, empty unless performance monitoring is enabled
    #[inline]
    pub fn performance_stats(&self) -> Vec<(String, OperationStats)> {
        self.monitor.snapshot()
    }
}
