//! Document store strategy on SQLite.
//!
//! Each entity is one JSON document in `entity_documents`, keyed by
//! `(partition_key, id)` where the partition is `{model}|{kind}`. The vector
//! lives inside the same document at the configured field path. The manifest
//! row in `model_documents` is written in the same transaction as the entity
//! rows.


use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::model::{EntityKeyBuilder, EntityKind, SemanticModel, SemanticModelEntity};
use crate::repository::tracking::ChangeSet;
use crate::storage::dto::{self, DocumentEntityDto, IndexDocument, IndexEntry};
use crate::storage::{ModelLocation, StorageKind, StorageStrategy, collect_entities};
use crate::{Result, StoreError};

type EntityRow = (String, String, String, String, String);

#[derive(Debug, Clone)]
pub struct DocumentStore {
    pool: Pool<Sqlite>,
    vector_field_path: String,
}

fn db_error(operation: &str, target: &str, error: sqlx::Error) -> StoreError {
    let busy = match &error {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5" | "6" | "SQLITE_BUSY" | "SQLITE_LOCKED"))
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    };

    if busy {
        StoreError::transient(operation, target, error.to_string())
    } else {
        StoreError::Other(anyhow::Error::new(error).context(format!(
            "{} failed for {}",
            operation, target
        )))
    }
}

impl DocumentStore {
    /// Opens (and creates if needed) the database file and runs migrations
    #[inline]
    pub async fn connect(database_path: &Path, vector_field_path: &str) -> Result<Self> {
        dto::validate_vector_field_path(vector_field_path)?;

        if let Some(parent) = database_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::io("create database directory", &parent.display().to_string(), e)
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| db_error("connect", &database_path.display().to_string(), e))?;

        Self::with_pool(pool, vector_field_path).await
    }

    /// Private in-memory database, for tests and throwaway use
    #[inline]
    pub async fn in_memory(vector_field_path: &str) -> Result<Self> {
        dto::validate_vector_field_path(vector_field_path)?;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| db_error("connect", "sqlite::memory:", e))?;

        // A single long-lived connection keeps the in-memory database alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| db_error("connect", "sqlite::memory:", e))?;

        Self::with_pool(pool, vector_field_path).await
    }

    async fn with_pool(pool: Pool<Sqlite>, vector_field_path: &str) -> Result<Self> {
        info!("Running document store migrations");
        sqlx::migrate!("src/storage/document/migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Other(anyhow::Error::new(e).context("migration failed")))?;
        debug!("Document store migrations completed successfully");

        Ok(Self {
            pool,
            vector_field_path: vector_field_path.to_string(),
        })
    }

    #[inline]
    pub fn vector_field_path(&self) -> &str {
        &self.vector_field_path
    }

    #[inline]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    fn row_to_dto(row: EntityRow) -> Result<DocumentEntityDto> {
        let (partition_key, id, model, kind, body) = row;
        let kind = EntityKind::parse(&kind).ok_or_else(|| {
            StoreError::corrupt("load document", &id, format!("unknown entity kind {}", kind))
        })?;
        let body = serde_json::from_str(&body)
            .map_err(|e| StoreError::corrupt("load document", &id, e.to_string()))?;
        Ok(DocumentEntityDto {
            id,
            partition_key,
            model,
            kind,
            body,
        })
    }

    /// Every entity document of a model, for in-process vector scans
    #[inline]
    pub async fn fetch_documents(&self, model: &str) -> Result<Vec<DocumentEntityDto>> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            "SELECT partition_key, id, model, kind, body FROM entity_documents
             WHERE model = ? ORDER BY partition_key, id",
        )
        .bind(model)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("fetch documents", model, e))?;

        rows.into_iter().map(Self::row_to_dto).collect()
    }

    /// Replaces the body of one existing document; false when it does not exist
    #[inline]
    pub async fn update_document_body(&self, document: &DocumentEntityDto) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE entity_documents SET body = ?, updated_at = ?
             WHERE partition_key = ? AND id = ?",
        )
        .bind(document.body.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(&document.partition_key)
        .bind(&document.id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("update document", &document.id, e))?
        .rows_affected();

        Ok(updated > 0)
    }

    async fn read_manifest(&self, location: &ModelLocation) -> Result<Option<IndexDocument>> {
        let manifest: Option<(String,)> =
            sqlx::query_as("SELECT manifest FROM model_documents WHERE model = ?")
                .bind(location.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("load manifest", location.as_str(), e))?;

        manifest
            .map(|(json,)| IndexDocument::from_bytes(location.as_str(), json.as_bytes()))
            .transpose()
    }

    async fn upsert_document(
        tx: &mut Transaction<'_, Sqlite>,
        document: &DocumentEntityDto,
        now: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO entity_documents (partition_key, id, model, kind, body, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(partition_key, id) DO UPDATE SET
                 body = excluded.body, updated_at = excluded.updated_at",
        )
        .bind(&document.partition_key)
        .bind(&document.id)
        .bind(&document.model)
        .bind(document.kind.as_str())
        .bind(document.body.to_string())
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("write document", &document.id, e))?;
        Ok(())
    }

    async fn write_manifest(
        tx: &mut Transaction<'_, Sqlite>,
        location: &ModelLocation,
        manifest: &IndexDocument,
    ) -> Result<()> {
        let json = String::from_utf8(manifest.to_bytes()?)
            .map_err(|e| StoreError::validation("serialize manifest", location.as_str(), e.to_string()))?;

        sqlx::query(
            "INSERT INTO model_documents (model, manifest, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(model) DO UPDATE SET
                 manifest = excluded.manifest, updated_at = excluded.updated_at",
        )
        .bind(location.as_str())
        .bind(json)
        .bind(manifest.created_utc.to_rfc3339())
        .bind(manifest.last_modified_utc.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("write manifest", location.as_str(), e))?;
        Ok(())
    }

    fn to_documents(
        &self,
        location: &ModelLocation,
        entities: &[&SemanticModelEntity],
    ) -> Result<Vec<DocumentEntityDto>> {
        entities
            .iter()
            .map(|entity| {
                DocumentEntityDto::from_entity(location.as_str(), entity, &self.vector_field_path)
            })
            .collect()
    }

    fn entry_for(document: &DocumentEntityDto, entity: &SemanticModelEntity) -> IndexEntry {
        IndexEntry {
            kind: document.kind,
            schema: entity.schema.clone(),
            name: entity.name.clone(),
            reference: document.id.clone(),
        }
    }
}

#[async_trait]
impl StorageStrategy for DocumentStore {
    fn kind(&self) -> StorageKind {
        StorageKind::DocumentStore
    }

    async fn save(&self, location: &ModelLocation, model: &SemanticModel) -> Result<()> {
        let entities = collect_entities(model).await?;
        let documents = self.to_documents(location, &entities)?;
        let created = self.read_manifest(location).await?.map(|m| m.created_utc);

        let entries = documents
            .iter()
            .zip(&entities)
            .map(|(document, entity)| Self::entry_for(document, entity))
            .collect();
        let manifest = IndexDocument::for_model(model, entries, created);
        let now = Utc::now().to_rfc3339();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin save", location.as_str(), e))?;

        sqlx::query("DELETE FROM entity_documents WHERE model = ?")
            .bind(location.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("clear documents", location.as_str(), e))?;

        for document in &documents {
            Self::upsert_document(&mut tx, document, &now).await?;
        }
        Self::write_manifest(&mut tx, location, &manifest).await?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit save", location.as_str(), e))?;

        info!(
            "Saved model {} with {} entity documents",
            location,
            documents.len()
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
            return Ok(());
        }

        let Some(previous) = self.read_manifest(location).await? else {
            return self.save(location, model).await;
        };

        let mut changed = Vec::with_capacity(changes.upserted.len());
        for id in &changes.upserted {
            if let Some(entity) = model.find_entity(id.kind, &id.schema, &id.name).await? {
                entity.validate()?;
                changed.push(entity);
            }
        }
        let documents = self.to_documents(location, &changed)?;

        let mut entries = previous.entities.clone();
        let mut removed_keys = Vec::with_capacity(changes.removed.len());
        for id in &changes.removed {
            entries.retain(|entry| {
                let matched = entry.is_entity(id.kind, &id.schema, &id.name);
                if matched {
                    removed_keys.push((
                        EntityKeyBuilder::partition_key(location.as_str(), entry.kind),
                        entry.reference.clone(),
                    ));
                }
                !matched
            });
        }
        for (document, entity) in documents.iter().zip(&changed) {
            entries.retain(|entry| {
                let matched = entry.is_entity(document.kind, &entity.schema, &entity.name);
                if matched && entry.reference != document.id {
                    removed_keys.push((document.partition_key.clone(), entry.reference.clone()));
                }
                !matched
            });
            entries.push(Self::entry_for(document, entity));
        }

        let manifest = IndexDocument::for_model(model, entries, Some(previous.created_utc));
        let now = Utc::now().to_rfc3339();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin save", location.as_str(), e))?;

        for document in &documents {
            Self::upsert_document(&mut tx, document, &now).await?;
        }
        for (partition_key, id) in &removed_keys {
            sqlx::query("DELETE FROM entity_documents WHERE partition_key = ? AND id = ?")
                .bind(partition_key)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("remove document", id, e))?;
        }
        Self::write_manifest(&mut tx, location, &manifest).await?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit save", location.as_str(), e))?;

        info!(
            "Saved {} changed and {} removed entity documents for model {}",
            documents.len(),
            removed_keys.len(),
            location
        );
        Ok(())
    }

    async fn delete(&self, location: &ModelLocation) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin delete", location.as_str(), e))?;

        let removed = sqlx::query("DELETE FROM model_documents WHERE model = ?")
            .bind(location.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("delete manifest", location.as_str(), e))?
            .rows_affected();

        if removed == 0 {
            return Err(StoreError::not_found("delete model", location.as_str()));
        }

        sqlx::query("DELETE FROM entity_documents WHERE model = ?")
            .bind(location.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("delete documents", location.as_str(), e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit delete", location.as_str(), e))?;

        info!("Deleted model {}", location);
        Ok(())
    }

    async fn exists(&self, location: &ModelLocation) -> Result<bool> {
        Ok(self.read_manifest(location).await?.is_some())
    }

    async fn list(&self) -> Result<Vec<ModelLocation>> {
        let models: Vec<(String,)> =
            sqlx::query_as("SELECT model FROM model_documents ORDER BY model")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error("list models", "model_documents", e))?;

        models
            .into_iter()
            .map(|(model,)| ModelLocation::new(model))
            .collect()
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
        let partition_key = EntityKeyBuilder::partition_key(location.as_str(), kind);
        let rows: Vec<EntityRow> = sqlx::query_as(
            "SELECT partition_key, id, model, kind, body FROM entity_documents
             WHERE partition_key = ? ORDER BY id",
        )
        .bind(&partition_key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("load documents", &partition_key, e))?;

        let entities = rows
            .into_iter()
            .map(|row| Self::row_to_dto(row)?.into_entity(&self.vector_field_path))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Loaded {} {} documents for model {}",
            entities.len(),
            kind,
            location
        );
        Ok(entities)
    }

    fn as_document_store(&self) -> Option<&DocumentStore> {
        Some(self)
    }
}
