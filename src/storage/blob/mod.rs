//! Blob store strategy.
//!
//! Entity blobs are written under a fresh generation prefix
//! (`<model>/g-<generation>/<collection>/<schema>.<name>.json`) and the save
//! commits by replacing `<model>/manifest.json`, which references every live
//! entity blob. Readers only follow the manifest, so an interrupted save never
//! exposes a partial model. Blobs superseded by the commit are removed
//! afterwards; blobs of a failed save are removed before returning.
//!
//! Writers hold a lease blob (`<model>/.lock`) holding a timestamp and an
//! owner token. The lease and any uncommitted generation are guarded: when a
//! save future is dropped by a timeout or a cancellation, the guards schedule
//! their removal on the runtime. A lease is only removed by its owner.

pub mod http;


use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{EntityKeyBuilder, EntityKind, SemanticModel, SemanticModelEntity};
use crate::repository::tracking::ChangeSet;
use crate::storage::dto::{IndexDocument, IndexEntry, PersistedEntityDto};
use crate::storage::{ModelLocation, StorageKind, StorageStrategy, collect_entities, validation};
use crate::{Result, StoreError};

pub use http::HttpBlobContainer;

const MANIFEST_BLOB: &str = "manifest.json";
const LOCK_BLOB: &str = ".lock";
const STALE_LOCK_SECONDS: u64 = 120;

/// Flat key/value blob namespace
#[async_trait]
pub trait BlobContainer: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()>;

    /// Writes only when `name` does not exist yet; returns false otherwise
    async fn create(&self, name: &str, bytes: Vec<u8>) -> Result<bool>;

    /// Deleting a missing blob is not an error
    async fn delete(&self, name: &str) -> Result<()>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn describe(&self) -> String;
}

/// Process-local container for tests and single-process use
#[derive(Debug, Default)]
pub struct InMemoryBlobContainer {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobContainer {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub async fn blob_names(&self) -> Vec<String> {
        self.blobs.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl BlobContainer for InMemoryBlobContainer {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(name).cloned())
    }

    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        self.blobs.write().await.insert(name.to_string(), bytes);
        Ok(())
    }

    async fn create(&self, name: &str, bytes: Vec<u8>) -> Result<bool> {
        let mut blobs = self.blobs.write().await;
        if blobs.contains_key(name) {
            return Ok(false);
        }
        blobs.insert(name.to_string(), bytes);
        Ok(true)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.blobs.write().await.remove(name);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .await
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn describe(&self) -> String {
        "in-memory blob container".to_string()
    }
}

pub struct BlobStore {
    container: Arc<dyn BlobContainer>,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("container", &self.container.describe())
            .finish()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Removes blobs from a background task when a guard is dropped mid-write
fn spawn_cleanup(container: Arc<dyn BlobContainer>, names: Vec<String>) {
    let Ok(handle) = Handle::try_current() else {
        warn!("No runtime available to remove {} abandoned blobs", names.len());
        return;
    };
    handle.spawn(async move {
        for name in names {
            if let Err(e) = container.delete(&name).await {
                warn!("Failed to remove abandoned blob {}: {}", name, e);
            }
        }
    });
}

async fn release_owned(container: &dyn BlobContainer, name: &str, content: &[u8]) {
    match container.get(name).await {
        Ok(Some(current)) if current == content => {
            if let Err(e) = container.delete(name).await {
                warn!("Failed to release blob lock {}: {}", name, e);
            }
        }
        Ok(_) => debug!("Blob lock {} is no longer ours", name),
        Err(e) => warn!("Failed to read blob lock {}: {}", name, e),
    }
}

/// Model lease; released by `release` or, if dropped first, by a spawned task
struct LeaseGuard {
    container: Arc<dyn BlobContainer>,
    name: String,
    content: Vec<u8>,
    held: bool,
}

impl LeaseGuard {
    async fn release(mut self) {
        release_owned(self.container.as_ref(), &self.name, &self.content).await;
        self.held = false;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("No runtime available to release blob lock {}", self.name);
            return;
        };
        let container = Arc::clone(&self.container);
        let name = std::mem::take(&mut self.name);
        let content = std::mem::take(&mut self.content);
        handle.spawn(async move {
            release_owned(container.as_ref(), &name, &content).await;
        });
    }
}

/// Entity blobs of a generation that no manifest references yet
struct StagedGeneration {
    container: Arc<dyn BlobContainer>,
    names: Vec<String>,
}

impl StagedGeneration {
    /// The manifest now references the blobs
    fn commit(mut self) {
        self.names.clear();
    }

    async fn discard(mut self) {
        while let Some(name) = self.names.last() {
            if let Err(e) = self.container.delete(name).await {
                warn!("Failed to remove blob {}: {}", name, e);
            }
            self.names.pop();
        }
    }
}

impl Drop for StagedGeneration {
    fn drop(&mut self) {
        if !self.names.is_empty() {
            spawn_cleanup(Arc::clone(&self.container), std::mem::take(&mut self.names));
        }
    }
}

impl BlobStore {
    #[inline]
    pub fn new(container: Arc<dyn BlobContainer>) -> Self {
        Self { container }
    }

    fn manifest_name(location: &ModelLocation) -> String {
        format!("{}/{}", location, MANIFEST_BLOB)
    }

    fn lock_name(location: &ModelLocation) -> String {
        format!("{}/{}", location, LOCK_BLOB)
    }

    fn entity_blob_name(
        location: &ModelLocation,
        generation: &str,
        entity: &SemanticModelEntity,
    ) -> String {
        format!(
            "{}/g-{}/{}/{}",
            location,
            generation,
            entity.kind().collection_name(),
            EntityKeyBuilder::file_name(&entity.schema, &entity.name)
        )
    }

    async fn read_manifest(&self, location: &ModelLocation) -> Result<Option<IndexDocument>> {
        let name = Self::manifest_name(location);
        match self.container.get(&name).await? {
            Some(bytes) => Ok(Some(IndexDocument::from_bytes(&name, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn acquire_lock(&self, location: &ModelLocation) -> Result<LeaseGuard> {
        let name = Self::lock_name(location);
        let content = format!("{} {}", unix_now(), Uuid::new_v4().simple()).into_bytes();
        for attempt in 0..2 {
            if self.container.create(&name, content.clone()).await? {
                debug!("Acquired blob lock for model {}", location);
                return Ok(LeaseGuard {
                    container: Arc::clone(&self.container),
                    name,
                    content,
                    held: true,
                });
            }

            if attempt == 0 && self.lock_is_stale(&name).await? {
                warn!("Removing stale blob lock for model {}", location);
                self.container.delete(&name).await?;
                continue;
            }
            break;
        }

        Err(StoreError::conflict(
            "acquire lock",
            location.as_str(),
            "another writer holds the model lease",
        ))
    }

    async fn lock_is_stale(&self, name: &str) -> Result<bool> {
        let Some(bytes) = self.container.get(name).await? else {
            return Ok(true);
        };
        let text = String::from_utf8_lossy(&bytes);
        let written = text.split_whitespace().next().map(str::parse::<u64>);
        Ok(match written {
            Some(Ok(written)) => unix_now().saturating_sub(written) > STALE_LOCK_SECONDS,
            // Unreadable timestamp: the writer died mid-write
            _ => true,
        })
    }

    /// Uploads entity blobs under `generation`, removing them again on failure
    async fn write_generation(
        &self,
        location: &ModelLocation,
        generation: &str,
        entities: &[&SemanticModelEntity],
    ) -> Result<(Vec<IndexEntry>, StagedGeneration)> {
        let mut entries = Vec::with_capacity(entities.len());
        let mut payloads = Vec::with_capacity(entities.len());
        for entity in entities {
            let reference = Self::entity_blob_name(location, generation, entity);
            payloads.push((
                reference.clone(),
                PersistedEntityDto::from_entity(entity).to_bytes(&reference)?,
            ));
            entries.push(IndexEntry {
                kind: entity.kind(),
                schema: entity.schema.clone(),
                name: entity.name.clone(),
                reference,
            });
        }

        let staged = StagedGeneration {
            container: Arc::clone(&self.container),
            names: entries.iter().map(|entry| entry.reference.clone()).collect(),
        };
        let uploads = payloads
            .into_iter()
            .map(|(name, bytes)| async move { self.container.put(&name, bytes).await });
        if let Err(e) = try_join_all(uploads).await {
            warn!(
                "Rolling back generation {} of model {} after failure: {}",
                generation, location, e
            );
            staged.discard().await;
            return Err(e);
        }

        Ok((entries, staged))
    }

    async fn remove_blobs<'a>(&self, names: impl Iterator<Item = &'a str>) {
        for name in names {
            if let Err(e) = self.container.delete(name).await {
                warn!("Failed to remove blob {}: {}", name, e);
            }
        }
    }

    /// Publishes `manifest`; `staged` is discarded when the write fails
    async fn commit(
        &self,
        location: &ModelLocation,
        manifest: &IndexDocument,
        previous: Option<&IndexDocument>,
        staged: StagedGeneration,
    ) -> Result<()> {
        let bytes = match manifest.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                staged.discard().await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .container
            .put(&Self::manifest_name(location), bytes)
            .await
        {
            staged.discard().await;
            return Err(e);
        }
        staged.commit();

        if let Some(previous) = previous {
            let live: HashSet<&str> = manifest
                .entities
                .iter()
                .map(|entry| entry.reference.as_str())
                .collect();
            self.remove_blobs(
                previous
                    .entities
                    .iter()
                    .map(|entry| entry.reference.as_str())
                    .filter(|reference| !live.contains(reference)),
            )
            .await;
        }
        Ok(())
    }

    async fn save_locked(&self, location: &ModelLocation, model: &SemanticModel) -> Result<()> {
        let entities = collect_entities(model).await?;
        let previous = self.read_manifest(location).await.ok().flatten();
        let generation = Uuid::new_v4().simple().to_string();

        let (entries, staged) = self
            .write_generation(location, &generation, &entities)
            .await?;
        let manifest = IndexDocument::for_model(
            model,
            entries,
            previous.as_ref().map(|p| p.created_utc),
        );
        self.commit(location, &manifest, previous.as_ref(), staged)
            .await?;

        info!(
            "Saved model {} with {} entities to {} (generation {})",
            location,
            entities.len(),
            self.container.describe(),
            generation
        );
        Ok(())
    }

    async fn save_changes_locked(
        &self,
        location: &ModelLocation,
        model: &SemanticModel,
        changes: &ChangeSet,
        previous: IndexDocument,
    ) -> Result<()> {
        let mut changed = Vec::with_capacity(changes.upserted.len());
        for id in &changes.upserted {
            if let Some(entity) = model.find_entity(id.kind, &id.schema, &id.name).await? {
                entity.validate()?;
                changed.push(entity);
            }
        }

        let generation = Uuid::new_v4().simple().to_string();
        let (written, staged) = self
            .write_generation(location, &generation, &changed)
            .await?;

        let mut entries = previous.entities.clone();
        for id in &changes.removed {
            entries.retain(|entry| !entry.is_entity(id.kind, &id.schema, &id.name));
        }
        for entry in &written {
            entries.retain(|existing| !existing.is_entity(entry.kind, &entry.schema, &entry.name));
        }
        entries.extend(written);

        let manifest = IndexDocument::for_model(model, entries, Some(previous.created_utc));
        self.commit(location, &manifest, Some(&previous), staged)
            .await?;

        info!(
            "Saved {} changed and {} removed entities for model {}",
            changes.upserted.len(),
            changes.removed.len(),
            location
        );
        Ok(())
    }
}

#[async_trait]
impl StorageStrategy for BlobStore {
    fn kind(&self) -> StorageKind {
        StorageKind::BlobStore
    }

    async fn save(&self, location: &ModelLocation, model: &SemanticModel) -> Result<()> {
        let lease = self.acquire_lock(location).await?;
        let result = self.save_locked(location, model).await;
        lease.release().await;
        result
    }

    async fn save_changes(
        &self,
        location: &ModelLocation,
        model: &SemanticModel,
        changes: &ChangeSet,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let lease = self.acquire_lock(location).await?;
        let result = match self.read_manifest(location).await {
            Ok(Some(previous)) => {
                self.save_changes_locked(location, model, changes, previous)
                    .await
            }
            Ok(None) => self.save_locked(location, model).await,
            Err(e) => Err(e),
        };
        lease.release().await;
        result
    }

    async fn delete(&self, location: &ModelLocation) -> Result<()> {
        let lease = self.acquire_lock(location).await?;
        let result = async {
            if self.read_manifest(location).await?.is_none() {
                return Err(StoreError::not_found("delete model", location.as_str()));
            }

            self.container
                .delete(&Self::manifest_name(location))
                .await?;

            let prefix = format!("{}/", location);
            let lock = Self::lock_name(location);
            let names = self.container.list(&prefix).await?;
            self.remove_blobs(
                names
                    .iter()
                    .map(String::as_str)
                    .filter(|name| *name != lock),
            )
            .await;
            Ok(())
        }
        .await;
        lease.release().await;

        if result.is_ok() {
            info!("Deleted model {}", location);
        }
        result
    }

    async fn exists(&self, location: &ModelLocation) -> Result<bool> {
        Ok(self
            .container
            .get(&Self::manifest_name(location))
            .await?
            .is_some())
    }

    async fn list(&self) -> Result<Vec<ModelLocation>> {
        let suffix = format!("/{}", MANIFEST_BLOB);
        let mut locations: Vec<ModelLocation> = self
            .container
            .list("")
            .await?
            .iter()
            .filter_map(|name| name.strip_suffix(&suffix))
            .filter(|model| validation::validate_model_key(model).is_ok())
            .filter_map(|model| ModelLocation::new(model).ok())
            .collect();
        locations.sort();
        locations.dedup();
        Ok(locations)
    }

    async fn load_header(&self, location: &ModelLocation) -> Result<IndexDocument> {
        self.read_manifest(location)
            .await?
            .ok_or_else(|| StoreError::not_found("load model", location.as_str()))
    }

    async fn load_entities(
        &self,
        location: &ModelLocation,
        kind: EntityKind,
    ) -> Result<Vec<SemanticModelEntity>> {
        let manifest = self.load_header(location).await?;

        let reads = manifest.entries_of(kind).map(|entry| async move {
            let bytes = self.container.get(&entry.reference).await?.ok_or_else(|| {
                StoreError::corrupt(
                    "load entity",
                    &entry.reference,
                    "manifest references a missing blob",
                )
            })?;
            Ok::<_, StoreError>(
                PersistedEntityDto::from_bytes(&entry.reference, &bytes)?.into_entity(),
            )
        });

        let entities = try_join_all(reads).await?;
        debug!(
            "Loaded {} {} entities for model {} from {}",
            entities.len(),
            kind,
            location,
            self.container.describe()
        );
        Ok(entities)
    }
}
