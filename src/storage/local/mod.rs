//! Hierarchical JSON files on local disk.
//!
//! ```text
//! <root>/<model>/index.json
//! <root>/<model>/tables/<schema>.<name>.json
//! <root>/<model>/views/...
//! <root>/<model>/stored_procedures/...
//! <root>/.<model>.lock
//! ```
//!
//! A full save writes the whole model into a staging directory and swaps it
//! in with two renames. Selective saves stage every changed file first, then
//! move each into place after copying the original aside, and finish by
//! replacing `index.json`. Until the manifest is replaced every step can be
//! undone, so a failure leaves the previous model readable. Files of removed
//! entities are deleted only once the new manifest no longer names them.
//! Writers on the same model are serialized by an exclusive lock file; a lock
//! older than two minutes is treated as abandoned.


use async_trait::async_trait;
use futures::future::try_join_all;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{EntityKeyBuilder, EntityKind, SemanticModel, SemanticModelEntity};
use crate::repository::tracking::ChangeSet;
use crate::storage::dto::{IndexDocument, IndexEntry, PersistedEntityDto};
use crate::storage::{ModelLocation, StorageKind, StorageStrategy, collect_entities, validation};
use crate::{Result, StoreError};

const INDEX_FILE: &str = "index.json";
const STALE_LOCK_SECONDS: u64 = 120;

#[derive(Debug, Clone)]
pub struct LocalDiskStore {
    root: PathBuf,
}

/// Removes the lock file when the writer finishes or is dropped mid-write
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Staging directory removed on drop unless committed
struct StagingDir {
    path: PathBuf,
    committed: bool,
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

struct Replacement {
    staged: PathBuf,
    target: PathBuf,
    backup: Option<PathBuf>,
    placed: bool,
}

/// Changed entity files of a selective save. Dropped before `committed` is
/// set, it restores every original; afterwards it only removes the backups.
#[derive(Default)]
struct SelectiveCommit {
    replacements: Vec<Replacement>,
    committed: bool,
}

impl SelectiveCommit {
    async fn stage(&mut self, target: PathBuf, bytes: &[u8]) -> Result<()> {
        let staged = target.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        self.replacements.push(Replacement {
            staged: staged.clone(),
            target,
            backup: None,
            placed: false,
        });
        LocalDiskStore::write_file(&staged, bytes).await
    }

    async fn place(&mut self) -> Result<()> {
        for replacement in &mut self.replacements {
            let target = replacement.target.display().to_string();
            let exists = fs::try_exists(&replacement.target)
                .await
                .map_err(|e| StoreError::io("replace entity", &target, e))?;
            if exists {
                let backup = replacement
                    .target
                    .with_extension(format!("json.{}.bak", Uuid::new_v4().simple()));
                replacement.backup = Some(backup.clone());
                fs::copy(&replacement.target, &backup)
                    .await
                    .map_err(|e| StoreError::io("back up entity", &target, e))?;
            }
            fs::rename(&replacement.staged, &replacement.target)
                .await
                .map_err(|e| StoreError::io("replace entity", &target, e))?;
            replacement.placed = true;
        }
        Ok(())
    }
}

impl Drop for SelectiveCommit {
    fn drop(&mut self) {
        for replacement in self.replacements.iter().rev() {
            if self.committed {
                if let Some(backup) = &replacement.backup {
                    let _ = std::fs::remove_file(backup);
                }
                continue;
            }

            if !replacement.placed {
                let _ = std::fs::remove_file(&replacement.staged);
            }
            match &replacement.backup {
                Some(backup) if replacement.placed => {
                    if let Err(e) = std::fs::rename(backup, &replacement.target) {
                        warn!(
                            "Failed to restore {}: {}",
                            replacement.target.display(),
                            e
                        );
                    }
                }
                Some(backup) => {
                    let _ = std::fs::remove_file(backup);
                }
                None if replacement.placed => {
                    let _ = std::fs::remove_file(&replacement.target);
                }
                None => {}
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl LocalDiskStore {
    #[inline]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn model_dir(&self, location: &ModelLocation) -> PathBuf {
        self.root.join(location.as_str())
    }

    fn lock_path(&self, location: &ModelLocation) -> PathBuf {
        self.root.join(format!(".{}.lock", location))
    }

    fn entity_path(dir: &Path, kind: EntityKind, reference: &str) -> PathBuf {
        dir.join(kind.collection_name()).join(reference)
    }

    async fn acquire_lock(&self, location: &ModelLocation) -> Result<LockGuard> {
        let target = location.as_str();
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io("create storage root", target, e))?;

        let path = self.lock_path(location);
        for attempt in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(unix_now().to_string().as_bytes())
                        .await
                        .map_err(|e| StoreError::io("write lock", target, e))?;
                    debug!("Acquired lock for model {}", location);
                    return Ok(LockGuard { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if attempt == 0 && Self::lock_is_stale(&path).await {
                        warn!("Removing stale lock for model {}", location);
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    break;
                }
                Err(e) => return Err(StoreError::io("acquire lock", target, e)),
            }
        }

        Err(StoreError::conflict(
            "acquire lock",
            target,
            "another writer holds the model lock",
        ))
    }

    async fn lock_is_stale(path: &Path) -> bool {
        let Ok(content) = fs::read_to_string(path).await else {
            return false;
        };
        match content.trim().parse::<u64>() {
            Ok(written) => unix_now().saturating_sub(written) > STALE_LOCK_SECONDS,
            // Unreadable timestamp: the writer died mid-write
            Err(_) => true,
        }
    }

    async fn read_manifest(&self, location: &ModelLocation) -> Result<IndexDocument> {
        let path = self.model_dir(location).join(INDEX_FILE);
        let target = path.display().to_string();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::not_found("load model", location.as_str()));
            }
            Err(e) => return Err(StoreError::io("load model", &target, e)),
        };
        IndexDocument::from_bytes(&target, &bytes)
    }

    async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
        let target = path.display().to_string();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io("create directory", &target, e))?;
        }
        fs::write(path, bytes)
            .await
            .map_err(|e| StoreError::io("write file", &target, e))
    }

    /// Replaces one file through a sibling temporary file
    async fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        Self::write_file(&tmp, bytes).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StoreError::io("replace file", &path.display().to_string(), e));
        }
        Ok(())
    }

    fn entry_for(entity: &SemanticModelEntity) -> IndexEntry {
        IndexEntry {
            kind: entity.kind(),
            schema: entity.schema.clone(),
            name: entity.name.clone(),
            reference: EntityKeyBuilder::file_name(&entity.schema, &entity.name),
        }
    }

    async fn swap_in(&self, staging: &mut StagingDir, location: &ModelLocation) -> Result<()> {
        let target = self.model_dir(location);
        let backup = self
            .root
            .join(format!(".backup-{}-{}", location, Uuid::new_v4().simple()));

        let had_previous = fs::try_exists(&target).await.unwrap_or(false);
        if had_previous {
            fs::rename(&target, &backup)
                .await
                .map_err(|e| StoreError::io("swap model", location.as_str(), e))?;
        }

        if let Err(e) = fs::rename(&staging.path, &target).await {
            if had_previous {
                let _ = fs::rename(&backup, &target).await;
            }
            return Err(StoreError::io("swap model", location.as_str(), e));
        }
        staging.committed = true;

        if had_previous {
            if let Err(e) = fs::remove_dir_all(&backup).await {
                warn!("Failed to remove backup {}: {}", backup.display(), e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageStrategy for LocalDiskStore {
    fn kind(&self) -> StorageKind {
        StorageKind::LocalDisk
    }

    async fn save(&self, location: &ModelLocation, model: &SemanticModel) -> Result<()> {
        let entities = collect_entities(model).await?;
        let _lock = self.acquire_lock(location).await?;

        let created = self.read_manifest(location).await.ok().map(|m| m.created_utc);

        let mut staging = StagingDir {
            path: self
                .root
                .join(format!(".staging-{}-{}", location, Uuid::new_v4().simple())),
            committed: false,
        };

        let mut entries = Vec::with_capacity(entities.len());
        for entity in &entities {
            let entry = Self::entry_for(entity);
            let bytes = PersistedEntityDto::from_entity(entity).to_bytes(&entry.reference)?;
            Self::write_file(
                &Self::entity_path(&staging.path, entry.kind, &entry.reference),
                &bytes,
            )
            .await?;
            entries.push(entry);
        }

        let manifest = IndexDocument::for_model(model, entries, created);
        Self::write_file(&staging.path.join(INDEX_FILE), &manifest.to_bytes()?).await?;

        self.swap_in(&mut staging, location).await?;
        info!(
            "Saved model {} with {} entities to {}",
            location,
            entities.len(),
            self.root.display()
        );
        Ok(())
    }

    async fn save_changes(
        &self,
        location: &ModelLocation,
        model: &SemanticModel,
        changes: &ChangeSet,
    ) -> Result<()> {
        if changes.is_empty() {
            debug!("No changes to save for model {}", location);
            return Ok(());
        }

        if !self.exists(location).await? {
            return self.save(location, model).await;
        }

        let _lock = self.acquire_lock(location).await?;
        let mut manifest = self.read_manifest(location).await?;
        let dir = self.model_dir(location);
        let mut pending = SelectiveCommit::default();
        let mut obsolete = Vec::with_capacity(changes.removed.len());

        for id in &changes.upserted {
            let Some(entity) = model.find_entity(id.kind, &id.schema, &id.name).await? else {
                continue;
            };
            entity.validate()?;
            let entry = Self::entry_for(entity);
            let bytes = PersistedEntityDto::from_entity(entity).to_bytes(&entry.reference)?;
            pending
                .stage(Self::entity_path(&dir, entry.kind, &entry.reference), &bytes)
                .await?;

            manifest.entities.retain(|e| {
                let matched = e.is_entity(entry.kind, &entry.schema, &entry.name);
                if matched && e.reference != entry.reference {
                    obsolete.push(Self::entity_path(&dir, e.kind, &e.reference));
                }
                !matched
            });
            manifest.entities.push(entry);
        }

        for id in &changes.removed {
            manifest.entities.retain(|e| {
                let matched = e.is_entity(id.kind, &id.schema, &id.name);
                if matched {
                    obsolete.push(Self::entity_path(&dir, e.kind, &e.reference));
                }
                !matched
            });
        }

        let updated = IndexDocument::for_model(model, manifest.entities, Some(manifest.created_utc));
        let manifest_bytes = updated.to_bytes()?;

        pending.place().await?;
        Self::replace_file(&dir.join(INDEX_FILE), &manifest_bytes).await?;
        pending.committed = true;
        drop(pending);

        for path in obsolete {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove obsolete entity file {}: {}", path.display(), e),
            }
        }

        info!(
            "Saved {} changed and {} removed entities for model {}",
            changes.upserted.len(),
            changes.removed.len(),
            location
        );
        Ok(())
    }

    async fn delete(&self, location: &ModelLocation) -> Result<()> {
        if !self.exists(location).await? {
            return Err(StoreError::not_found("delete model", location.as_str()));
        }

        let _lock = self.acquire_lock(location).await?;
        let trash = self
            .root
            .join(format!(".trash-{}-{}", location, Uuid::new_v4().simple()));
        fs::rename(self.model_dir(location), &trash)
            .await
            .map_err(|e| StoreError::io("delete model", location.as_str(), e))?;
        if let Err(e) = fs::remove_dir_all(&trash).await {
            warn!("Failed to clean up {}: {}", trash.display(), e);
        }

        info!("Deleted model {}", location);
        Ok(())
    }

    async fn exists(&self, location: &ModelLocation) -> Result<bool> {
        fs::try_exists(self.model_dir(location).join(INDEX_FILE))
            .await
            .map_err(|e| StoreError::io("check model", location.as_str(), e))
    }

    async fn list(&self) -> Result<Vec<ModelLocation>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::io(
                    "list models",
                    &self.root.display().to_string(),
                    e,
                ));
            }
        };

        let mut locations = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io("list models", &self.root.display().to_string(), e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if validation::validate_model_key(&name).is_err() {
                continue;
            }
            if fs::try_exists(entry.path().join(INDEX_FILE))
                .await
                .unwrap_or(false)
            {
                locations.push(ModelLocation::new(name)?);
            }
        }

        locations.sort();
        Ok(locations)
    }

    async fn load_header(&self, location: &ModelLocation) -> Result<IndexDocument> {
        self.read_manifest(location).await
    }

    async fn load_entities(
        &self,
        location: &ModelLocation,
        kind: EntityKind,
    ) -> Result<Vec<SemanticModelEntity>> {
        let manifest = self.read_manifest(location).await?;
        let dir = self.model_dir(location);

        let reads = manifest.entries_of(kind).map(|entry| {
            let path = Self::entity_path(&dir, kind, &entry.reference);
            async move {
                let target = path.display().to_string();
                let bytes = match fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        return Err(StoreError::corrupt(
                            "load entity",
                            &target,
                            "manifest references a missing entity file",
                        ));
                    }
                    Err(e) => return Err(StoreError::io("load entity", &target, e)),
                };
                Ok(PersistedEntityDto::from_bytes(&target, &bytes)?.into_entity())
            }
        });

        let entities = try_join_all(reads).await?;
        debug!(
            "Loaded {} {} entities for model {}",
            entities.len(),
            kind,
            location
        );
        Ok(entities)
    }
}
