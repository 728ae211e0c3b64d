//! Storage strategies for whole semantic models.
//!
//! Every strategy persists one model per [`ModelLocation`], writes through a
//! staged commit and keeps an [`IndexDocument`] manifest in step with the
//! entity bodies. The strategy is picked once from configuration by
//! [`create_strategy`].

pub mod blob;
pub mod document;
pub mod dto;
pub mod local;
pub mod validation;


use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::model::{EntityKind, SemanticModel, SemanticModelEntity};
use crate::repository::lazy::EntityCollection;
use crate::repository::tracking::ChangeSet;
use crate::{Result, StoreError};

pub use blob::{BlobContainer, BlobStore, HttpBlobContainer, InMemoryBlobContainer};
pub use document::DocumentStore;
pub use dto::{DocumentEntityDto, IndexDocument, IndexEntry, PersistedEntityDto};
pub use local::LocalDiskStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    #[default]
    LocalDisk,
    BlobStore,
    DocumentStore,
}

impl StorageKind {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalDisk => "local-disk",
            Self::BlobStore => "blob-store",
            Self::DocumentStore => "document-store",
        }
    }

    #[inline]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local-disk" | "local" => Some(Self::LocalDisk),
            "blob-store" | "blob" => Some(Self::BlobStore),
            "document-store" | "document" => Some(Self::DocumentStore),
            _ => None,
        }
    }
}

impl fmt::Display for StorageKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated identity of a stored model; doubles as folder, blob prefix and
/// document partition prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelLocation(String);

impl ModelLocation {
    #[inline]
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validation::validate_model_key(&name)?;
        Ok(Self(name))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable cache key for this location under a given strategy
    #[inline]
    pub fn cache_key(&self, kind: StorageKind) -> String {
        format!("{}:{}", kind, self.0)
    }
}

impl fmt::Display for ModelLocation {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait StorageStrategy: Send + Sync {
    fn kind(&self) -> StorageKind;

    async fn save(&self, location: &ModelLocation, model: &SemanticModel) -> Result<()>;

    async fn delete(&self, location: &ModelLocation) -> Result<()>;

    async fn exists(&self, location: &ModelLocation) -> Result<bool>;

    async fn list(&self) -> Result<Vec<ModelLocation>>;

    /// Reads only the manifest: header fields plus entity references
    async fn load_header(&self, location: &ModelLocation) -> Result<IndexDocument>;

    /// Reads every entity body of one kind
    async fn load_entities(
        &self,
        location: &ModelLocation,
        kind: EntityKind,
    ) -> Result<Vec<SemanticModelEntity>>;

    /// Full eager load
    async fn load(&self, location: &ModelLocation) -> Result<SemanticModel> {
        let header = self.load_header(location).await?;
        let tables = self.load_entities(location, EntityKind::Table).await?;
        let views = self.load_entities(location, EntityKind::View).await?;
        let procedures = self
            .load_entities(location, EntityKind::StoredProcedure)
            .await?;

        Ok(SemanticModel::from_parts(
            header.name,
            header.source,
            header.description,
            EntityCollection::Loaded(tables),
            EntityCollection::Loaded(views),
            EntityCollection::Loaded(procedures),
        ))
    }

    /// Persists only the listed entities; strategies without selective
    /// writes fall back to a full save
    async fn save_changes(
        &self,
        location: &ModelLocation,
        model: &SemanticModel,
        _changes: &ChangeSet,
    ) -> Result<()> {
        self.save(location, model).await
    }

    /// Access to the document store for the document-native vector provider
    fn as_document_store(&self) -> Option<&DocumentStore> {
        None
    }
}

/// Builds the strategy named by `config.storage.strategy`
#[inline]
pub async fn create_strategy(config: &Config) -> Result<Arc<dyn StorageStrategy>> {
    let strategy: Arc<dyn StorageStrategy> = match config.storage.strategy {
        StorageKind::LocalDisk => Arc::new(LocalDiskStore::new(config.local_root())),
        StorageKind::BlobStore => {
            let blob = &config.storage.blob;
            let container: Arc<dyn BlobContainer> = match &blob.endpoint {
                Some(endpoint) => {
                    let access_key = match &blob.access_key_env {
                        Some(var) => Some(std::env::var(var).map_err(|_| {
                            StoreError::Configuration(format!(
                                "environment variable {} for the blob access key is not set",
                                var
                            ))
                        })?),
                        None => None,
                    };
                    Arc::new(HttpBlobContainer::new(
                        endpoint,
                        &blob.container,
                        access_key,
                        config.storage.operation_timeout(),
                    )?)
                }
                None => Arc::new(InMemoryBlobContainer::new()),
            };
            Arc::new(BlobStore::new(container))
        }
        StorageKind::DocumentStore => Arc::new(
            DocumentStore::connect(
                &config.document_database_path(),
                &config.vector_index.document_native.vector_field_path,
            )
            .await?,
        ),
    };

    info!("Using {} storage strategy", strategy.kind());
    Ok(strategy)
}

/// Rejects a model whose entities break naming rules before anything is written
pub(crate) async fn collect_entities(model: &SemanticModel) -> Result<Vec<&SemanticModelEntity>> {
    let entities = model.all_entities().await?;
    for entity in &entities {
        entity.validate()?;
    }
    Ok(entities)
}
