//! Sequences embedding generation, search and index reconciliation.
//!
//! Generation selects entities, builds their embeddable text, skips those
//! whose recorded content hash still matches, embeds the rest in batches of
//! the generator's preferred size with bounded parallelism, persists the
//! vectors through the repository and pushes records to backends that keep
//! their own copy.

#[cfg(test)]
mod tests;

use futures::{StreamExt, stream};
use itertools::Itertools;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, VectorIndexConfig};
use crate::model::{EntityId, EntityKeyBuilder, EntityKind, SemanticModel};
use crate::repository::{Repository, RepositoryOptions};
use crate::retry::RetryPolicy;
use crate::storage::ModelLocation;
use crate::vector::embedding::create_embedding_generator;
use crate::vector::{
    EmbeddingGenerator, ResolvedVectorIndex, SearchHit, VectorIndex, VectorIndexPolicy,
    VectorQuery, VectorRecord, VectorRecordMapper, create_vector_index,
};
use crate::{Result, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Upsert generated records into the index even when push-on-generate is off
    pub push: bool,
    /// Re-embed entities whose content hash is unchanged
    pub overwrite: bool,
    /// Stop at the first failure instead of collecting it
    pub fail_fast: bool,
    /// Restrict the run to these entities; `None` selects every entity
    pub entities: Option<Vec<EntityId>>,
}

impl GenerateOptions {
    fn selects(&self, id: &EntityId) -> bool {
        self.entities
            .as_ref()
            .is_none_or(|selected| selected.contains(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Embed,
    Push,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationFailure {
    pub target: String,
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateSummary {
    pub generated: usize,
    pub skipped: usize,
    pub pushed: usize,
    pub failed: usize,
    pub failures: Vec<GenerationFailure>,
    /// Set when the run stopped early on cancellation
    pub cancelled: bool,
}

impl GenerateSummary {
    fn record_failure(&mut self, target: String, stage: FailureStage, error: &StoreError) {
        warn!("Embedding {} failed for {}: {}", stage_name(stage), target, error);
        self.failed += 1;
        self.failures.push(GenerationFailure {
            target,
            stage,
            message: error.to_string(),
        });
    }
}

fn stage_name(stage: FailureStage) -> &'static str {
    match stage {
        FailureStage::Embed => "generation",
        FailureStage::Push => "push",
    }
}

/// An index record out of step with the locally recorded embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftRecord {
    pub id: String,
    pub kind: EntityKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindDrift {
    pub missing: usize,
    pub outdated: usize,
    pub orphaned: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub model: String,
    /// Entities carrying an embedding in the repository
    pub local_records: usize,
    pub index_records: usize,
    /// Embedded locally but absent from the index
    pub missing: Vec<DriftRecord>,
    /// Present in the index with a different content hash or an older timestamp
    pub outdated: Vec<DriftRecord>,
    /// Present in the index with no embedded entity behind it
    pub orphaned: Vec<DriftRecord>,
    pub dry_run: bool,
    pub upserted: usize,
    pub deleted: usize,
}

#[derive(Clone, Copy)]
enum DriftClass {
    Missing,
    Outdated,
    Orphaned,
}

impl ReconcileReport {
    #[inline]
    pub fn is_consistent(&self) -> bool {
        self.total_issues() == 0
    }

    #[inline]
    pub fn total_issues(&self) -> usize {
        self.missing.len() + self.outdated.len() + self.orphaned.len()
    }

    /// Issue counts per entity kind, kinds without drift omitted
    #[inline]
    pub fn by_kind(&self) -> BTreeMap<EntityKind, KindDrift> {
        let tagged = self
            .missing
            .iter()
            .map(|r| (r.kind, DriftClass::Missing))
            .chain(self.outdated.iter().map(|r| (r.kind, DriftClass::Outdated)))
            .chain(self.orphaned.iter().map(|r| (r.kind, DriftClass::Orphaned)));

        tagged
            .into_group_map()
            .into_iter()
            .map(|(kind, classes)| {
                let mut drift = KindDrift::default();
                for class in classes {
                    match class {
                        DriftClass::Missing => drift.missing += 1,
                        DriftClass::Outdated => drift.outdated += 1,
                        DriftClass::Orphaned => drift.orphaned += 1,
                    }
                }
                (kind, drift)
            })
            .collect()
    }

    #[inline]
    pub fn summary(&self) -> String {
        if self.is_consistent() {
            return format!(
                "Index is consistent for {}: {} local records, {} index records",
                self.model, self.local_records, self.index_records
            );
        }

        let mut summary = format!(
            "Index drift found for {}: {} missing, {} outdated, {} orphaned",
            self.model,
            self.missing.len(),
            self.outdated.len(),
            self.orphaned.len()
        );
        let per_kind = self
            .by_kind()
            .into_iter()
            .map(|(kind, d)| {
                format!(
                    "{} {}/{}/{}",
                    kind.collection_name(),
                    d.missing,
                    d.outdated,
                    d.orphaned
                )
            })
            .join(", ");
        summary.push_str(&format!(" ({})", per_kind));

        if self.dry_run {
            summary.push_str("; dry run, nothing changed");
        } else {
            summary.push_str(&format!(
                "; upserted {}, deleted {}",
                self.upserted, self.deleted
            ));
        }
        summary
    }
}

struct PendingEmbedding {
    id: EntityId,
    text: String,
    content_hash: String,
}

fn check_dimension(item: &PendingEmbedding, vector: Vec<f32>, expected: usize) -> Result<Vec<f32>> {
    if vector.len() == expected {
        return Ok(vector);
    }
    Err(StoreError::validation(
        "generate embedding",
        item.id.to_string(),
        format!(
            "generator returned {} dimensions, expected {}",
            vector.len(),
            expected
        ),
    ))
}

/// Embeds one batch in a single call. When that call fails, or returns the
/// wrong number of vectors, the items are embedded one at a time so every
/// entity gets its own outcome.
async fn embed_batch(
    generator: &dyn EmbeddingGenerator,
    batch: Vec<PendingEmbedding>,
    expected: usize,
) -> Vec<(PendingEmbedding, Result<Vec<f32>>)> {
    let batched = if batch.len() > 1 {
        let texts: Vec<String> = batch.iter().map(|item| item.text.clone()).collect();
        match generator.embed_batch(&texts).await {
            Ok(vectors) if vectors.len() == batch.len() => Some(vectors),
            Ok(vectors) => {
                warn!(
                    "Batch of {} texts returned {} embeddings, retrying one at a time",
                    batch.len(),
                    vectors.len()
                );
                None
            }
            Err(e) => {
                warn!("Batch of {} texts failed, retrying one at a time: {}", batch.len(), e);
                None
            }
        }
    } else {
        None
    };

    let mut outcomes = Vec::with_capacity(batch.len());
    match batched {
        Some(vectors) => {
            for (item, vector) in batch.into_iter().zip(vectors) {
                let result = check_dimension(&item, vector, expected);
                outcomes.push((item, result));
            }
        }
        None => {
            for item in batch {
                let result = generator
                    .embed(&item.text)
                    .await
                    .and_then(|vector| check_dimension(&item, vector, expected));
                outcomes.push((item, result));
            }
        }
    }
    outcomes
}

/// Entry point for vector operations over models held by a [`Repository`]
pub struct VectorOrchestrator {
    repository: Arc<Repository>,
    generator: Arc<dyn EmbeddingGenerator>,
    index: Arc<dyn VectorIndex>,
    resolved: ResolvedVectorIndex,
    mapper: VectorRecordMapper,
    retry: RetryPolicy,
    parallelism: usize,
    push_on_generate: bool,
}

impl std::fmt::Debug for VectorOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorOrchestrator")
            .field("repository", &self.repository)
            .field("generator", &self.generator.model_id())
            .field("resolved", &self.resolved)
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl VectorOrchestrator {
    /// Resolves the provider for the repository's strategy and connects to it.
    /// Provider misconfiguration fails here, before anything is embedded.
    #[inline]
    pub async fn new(
        repository: Arc<Repository>,
        generator: Arc<dyn EmbeddingGenerator>,
        config: &VectorIndexConfig,
    ) -> Result<Self> {
        let resolved = VectorIndexPolicy::resolve(repository.strategy_kind(), config)?;
        let index = create_vector_index(&resolved, repository.strategy()).await?;
        Ok(Self::with_index(repository, generator, index, resolved, config))
    }

    /// Builds the repository, generator and index named by `config`
    #[inline]
    pub async fn from_config(config: &Config, options: &RepositoryOptions) -> Result<Self> {
        let repository = Arc::new(Repository::from_config(config, options).await?);
        VectorIndexPolicy::resolve(repository.strategy_kind(), &config.vector_index)?;
        let generator = create_embedding_generator(config)?;
        Ok(Self::new(repository, generator, &config.vector_index)
            .await?
            .with_retry(RetryPolicy::from_config(&config.storage)))
    }

    /// Uses an already constructed backend
    #[inline]
    pub fn with_index(
        repository: Arc<Repository>,
        generator: Arc<dyn EmbeddingGenerator>,
        index: Arc<dyn VectorIndex>,
        resolved: ResolvedVectorIndex,
        config: &VectorIndexConfig,
    ) -> Self {
        Self {
            repository,
            generator,
            index,
            resolved,
            mapper: VectorRecordMapper::new(),
            retry: RetryPolicy::default(),
            parallelism: config.parallelism.max(1),
            push_on_generate: config.push_on_generate,
        }
    }

    #[inline]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    pub fn with_mapper(mut self, mapper: VectorRecordMapper) -> Self {
        self.mapper = mapper;
        self
    }

    #[inline]
    pub fn resolved(&self) -> &ResolvedVectorIndex {
        &self.resolved
    }

    #[inline]
    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    fn tracked() -> RepositoryOptions {
        RepositoryOptions::new().with_change_tracking(true)
    }

    fn record_id(model: &str, id: &EntityId) -> String {
        EntityKeyBuilder::record_id(model, id.kind, &id.schema, &id.name)
    }

    /// Embeds selected entities whose content changed, persists the vectors
    /// and pushes them to the index when requested
    #[inline]
    pub async fn generate(
        &self,
        location: &ModelLocation,
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<GenerateSummary> {
        let mut model = self
            .repository
            .load_model(location, &Self::tracked())
            .await?;
        let model_name = location.as_str();
        let expected = self.resolved.dimension;
        let mut summary = GenerateSummary::default();

        let mut pending = Vec::new();
        for entity in model.all_entities().await? {
            let id = entity.id();
            if !options.selects(&id) {
                continue;
            }
            if let Some(existing) = &entity.embedding {
                VectorIndexPolicy::check_recorded_dimension(
                    expected,
                    &format!("{}/{}", model_name, id),
                    &existing.metadata,
                )?;
            }

            let text = self.mapper.build_text(entity);
            let content_hash = VectorRecordMapper::content_hash(&text);
            if !options.overwrite && VectorRecordMapper::is_current(entity, &content_hash) {
                debug!("Embedding for {} is current, skipping", id);
                summary.skipped += 1;
                continue;
            }
            pending.push(PendingEmbedding {
                id,
                text,
                content_hash,
            });
        }

        info!(
            "Generating {} embeddings for {} ({} current)",
            pending.len(),
            model_name,
            summary.skipped
        );

        let batch_size = self.generator.batch_size().max(1);
        let batches: Vec<Vec<PendingEmbedding>> = pending
            .into_iter()
            .chunks(batch_size)
            .into_iter()
            .map(Iterator::collect)
            .collect();

        let mut outcomes = stream::iter(batches)
            .map(|batch| {
                let generator = Arc::clone(&self.generator);
                async move { embed_batch(generator.as_ref(), batch, expected).await }
            })
            .buffer_unordered(self.parallelism);

        let mut embedded = Vec::new();
        let mut abort = None;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    warn!("Generation for {} cancelled, keeping completed embeddings", model_name);
                    summary.cancelled = true;
                    break;
                }
                next = outcomes.next() => next,
            };
            let Some(batch) = next else {
                break;
            };

            for (item, result) in batch {
                match result {
                    Ok(vector) => embedded.push((item, vector)),
                    Err(error) => {
                        summary.record_failure(item.id.to_string(), FailureStage::Embed, &error);
                        let fatal =
                            options.fail_fast || matches!(error, StoreError::Configuration(_));
                        if fatal && abort.is_none() {
                            abort = Some(error);
                        }
                    }
                }
            }
            if abort.is_some() {
                break;
            }
        }
        drop(outcomes);

        let generated = self
            .persist(location, &mut model, embedded)
            .await?;
        summary.generated = generated.len();

        if let Some(error) = abort {
            error!(
                "Generation for {} aborted after {} embeddings",
                model_name, summary.generated
            );
            return Err(error);
        }

        if (options.push || self.push_on_generate)
            && self.resolved.provider.requires_push()
            && !generated.is_empty()
        {
            self.push(model_name, &model, generated, options, &mut summary)
                .await?;
        }

        info!(
            "Generation for {} finished: {} generated, {} skipped, {} pushed, {} failed",
            model_name, summary.generated, summary.skipped, summary.pushed, summary.failed
        );
        Ok(summary)
    }

    /// Writes embeddings onto the entities and saves only what changed
    async fn persist(
        &self,
        location: &ModelLocation,
        model: &mut SemanticModel,
        embedded: Vec<(PendingEmbedding, Vec<f32>)>,
    ) -> Result<Vec<PendingEmbedding>> {
        if embedded.is_empty() {
            return Ok(Vec::new());
        }

        let mut generated = Vec::with_capacity(embedded.len());
        for (item, vector) in embedded {
            let envelope = VectorRecordMapper::envelope(
                vector,
                self.generator.model_id(),
                item.content_hash.clone(),
            );
            if model
                .update_entity(&item.id, |entity| entity.embedding = Some(envelope))
                .await?
            {
                generated.push(item);
            }
        }

        self.repository.save_changes(location, model).await?;
        debug!("Persisted {} embeddings for {}", generated.len(), location);
        Ok(generated)
    }

    async fn push(
        &self,
        model_name: &str,
        model: &SemanticModel,
        generated: Vec<PendingEmbedding>,
        options: &GenerateOptions,
        summary: &mut GenerateSummary,
    ) -> Result<()> {
        let mut records: Vec<VectorRecord> = Vec::with_capacity(generated.len());
        for item in generated {
            let entity = model
                .find_entity(item.id.kind, &item.id.schema, &item.id.name)
                .await?
                .ok_or_else(|| StoreError::not_found("push vector", item.id.to_string()))?;
            records.push(self.mapper.to_record(model_name, entity, item.text)?);
        }

        let upserted = self
            .retry
            .run("upsert vectors", model_name, || self.index.upsert(&records))
            .await;
        match upserted {
            Ok(count) => {
                summary.pushed = count;
                Ok(())
            }
            Err(error) if !options.fail_fast => {
                for record in &records {
                    summary.record_failure(record.id.clone(), FailureStage::Push, &error);
                }
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Ranked hits for `query` within one model. Hybrid ranking is used only
    /// when both the backend and the configuration allow it.
    #[inline]
    pub async fn search(&self, model: &str, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if query.trim().is_empty() {
            return Err(StoreError::validation("search", model, "query text is empty"));
        }

        let vector = self.generator.embed(query).await?;
        if vector.len() != self.resolved.dimension {
            return Err(StoreError::validation(
                "search",
                model,
                format!(
                    "query embedding has {} dimensions, expected {}",
                    vector.len(),
                    self.resolved.dimension
                ),
            ));
        }

        let request = VectorQuery {
            model: model.to_string(),
            text: query.to_string(),
            vector,
            top_k: k,
            hybrid: self.resolved.hybrid_search && self.index.supports_hybrid(),
        };
        let hits = self
            .retry
            .run("vector search", model, || self.index.search(&request))
            .await?;

        debug!(
            "Search in {} returned {} hits (hybrid: {})",
            model,
            hits.len(),
            request.hybrid
        );
        Ok(hits)
    }

    /// Compares recorded content hashes with the index and, unless `dry_run`,
    /// upserts missing or outdated records and deletes orphans
    #[inline]
    pub async fn reconcile(
        &self,
        location: &ModelLocation,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        let model_name = location.as_str();
        let model = self
            .repository
            .load_model(location, &RepositoryOptions::new())
            .await?;

        let mut local = HashMap::new();
        for entity in model.all_entities().await? {
            if let Some(embedding) = &entity.embedding {
                local.insert(Self::record_id(model_name, &entity.id()), (entity, embedding));
            }
        }

        let indexed = self
            .retry
            .run("list vectors", model_name, || {
                self.index.list_records(model_name)
            })
            .await?;
        let indexed_ids: HashSet<&str> = indexed.iter().map(|r| r.id.as_str()).collect();

        let mut missing: Vec<DriftRecord> = local
            .iter()
            .filter(|(id, _)| !indexed_ids.contains(id.as_str()))
            .map(|(id, (entity, _))| DriftRecord {
                id: id.clone(),
                kind: entity.kind(),
            })
            .collect();
        let mut outdated = Vec::new();
        let mut orphaned = Vec::new();
        for record in &indexed {
            let drift = DriftRecord {
                id: record.id.clone(),
                kind: record.kind,
            };
            match local.get(&record.id) {
                Some((_, embedding))
                    if record.content_hash != embedding.metadata.content_hash
                        || record.last_updated < embedding.metadata.last_updated =>
                {
                    outdated.push(drift);
                }
                Some(_) => {}
                None => orphaned.push(drift),
            }
        }
        for list in [&mut missing, &mut outdated, &mut orphaned] {
            list.sort_by(|a, b| a.id.cmp(&b.id));
        }

        let mut report = ReconcileReport {
            model: model_name.to_string(),
            local_records: local.len(),
            index_records: indexed.len(),
            missing,
            outdated,
            orphaned,
            dry_run,
            upserted: 0,
            deleted: 0,
        };

        if dry_run || report.is_consistent() {
            info!("{}", report.summary());
            return Ok(report);
        }

        let mut records = Vec::new();
        for drift in report.missing.iter().chain(&report.outdated) {
            if let Some((entity, _)) = local.get(&drift.id) {
                records.push(self.mapper.to_record(
                    model_name,
                    entity,
                    self.mapper.build_text(entity),
                )?);
            }
        }

        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled(format!("reconcile {}", model_name)));
        }
        if !records.is_empty() {
            report.upserted = self
                .retry
                .run("upsert vectors", model_name, || self.index.upsert(&records))
                .await?;
        }

        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled(format!("reconcile {}", model_name)));
        }
        let orphan_ids: Vec<String> = report.orphaned.iter().map(|d| d.id.clone()).collect();
        if !orphan_ids.is_empty() {
            report.deleted = self
                .retry
                .run("delete vectors", model_name, || {
                    self.index.delete(model_name, &orphan_ids)
                })
                .await?;
        }

        info!("{}", report.summary());
        Ok(report)
    }
}
