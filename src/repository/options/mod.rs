// Repository load/save options
// Values are immutable: every `with_*` call returns a new instance


use std::time::Duration;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_SLOW_OPERATION_THRESHOLD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceMonitoringOptions {
    pub enabled: bool,
    pub slow_operation_threshold: Duration,
}

impl Default for PerformanceMonitoringOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            slow_operation_threshold: DEFAULT_SLOW_OPERATION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryOptions {
    lazy_loading: bool,
    change_tracking: bool,
    caching: bool,
    cache_ttl: Duration,
    strategy_name: Option<String>,
    max_concurrent_operations: Option<usize>,
    performance: PerformanceMonitoringOptions,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            lazy_loading: false,
            change_tracking: false,
            caching: false,
            cache_ttl: DEFAULT_CACHE_TTL,
            strategy_name: None,
            max_concurrent_operations: None,
            performance: PerformanceMonitoringOptions::default(),
        }
    }
}

impl RepositoryOptions {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_lazy_loading(&self, enabled: bool) -> Self {
        Self {
            lazy_loading: enabled,
            ..self.clone()
        }
    }

    #[inline]
    pub fn with_change_tracking(&self, enabled: bool) -> Self {
        Self {
            change_tracking: enabled,
            ..self.clone()
        }
    }

    #[inline]
    pub fn with_caching(&self, enabled: bool) -> Self {
        Self {
            caching: enabled,
            ..self.clone()
        }
    }

    /// Enables caching with the given entry lifetime
    #[inline]
    pub fn with_cache_ttl(&self, ttl: Duration) -> Self {
        Self {
            caching: true,
            cache_ttl: ttl,
            ..self.clone()
        }
    }

    #[inline]
    pub fn with_strategy_name(&self, name: impl Into<String>) -> Self {
        Self {
            strategy_name: Some(name.into()),
            ..self.clone()
        }
    }

    #[inline]
    pub fn with_max_concurrent_operations(&self, limit: usize) -> Self {
        Self {
            max_concurrent_operations: Some(limit),
            ..self.clone()
        }
    }

    #[inline]
    pub fn with_performance_monitoring(&self, performance: PerformanceMonitoringOptions) -> Self {
        Self {
            performance,
            ..self.clone()
        }
    }

    #[inline]
    pub fn lazy_loading(&self) -> bool {
        self.lazy_loading
    }

    #[inline]
    pub fn change_tracking(&self) -> bool {
        self.change_tracking
    }

    #[inline]
    pub fn caching(&self) -> bool {
        self.caching
    }

    #[inline]
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    #[inline]
    pub fn strategy_name(&self) -> Option<&str> {
        self.strategy_name.as_deref()
    }

    #[inline]
    pub fn max_concurrent_operations(&self) -> Option<usize> {
        self.max_concurrent_operations
    }

    #[inline]
    pub fn performance(&self) -> PerformanceMonitoringOptions {
        self.performance
    }
}
