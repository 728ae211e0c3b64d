// Semantic model domain types
// The aggregate root and its Table / View / StoredProcedure entities

#[cfg(test)]
mod tests;

pub mod keys;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::repository::lazy::EntityCollection;
use crate::repository::tracking::ChangeTracker;
use crate::{Result, StoreError};

pub use keys::{EntityKeyBuilder, MAX_NAME_LENGTH, MAX_RECORD_ID_LENGTH, sha256_hex};

/// Kind of a semantic model entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Table,
    View,
    StoredProcedure,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [Self::Table, Self::View, Self::StoredProcedure];

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::View => "view",
            Self::StoredProcedure => "stored_procedure",
        }
    }

    /// Folder / collection name used by the storage strategies
    #[inline]
    pub fn collection_name(self) -> &'static str {
        match self {
            Self::Table => "tables",
            Self::View => "views",
            Self::StoredProcedure => "stored_procedures",
        }
    }

    #[inline]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "table" => Some(Self::Table),
            "view" => Some(Self::View),
            "stored_procedure" => Some(Self::StoredProcedure),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an entity within a model: unique by (kind, schema, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    pub kind: EntityKind,
    pub schema: String,
    pub name: String,
}

impl EntityId {
    #[inline]
    pub fn new(kind: EntityKind, schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            schema: schema.into(),
            name: name.into(),
        }
    }

    #[inline]
    fn matches(&self, kind: EntityKind, schema: &str, name: &str) -> bool {
        self.kind == kind
            && self.schema.eq_ignore_ascii_case(schema)
            && self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for EntityId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.kind, self.schema, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_nullable: bool,
}

impl Column {
    #[inline]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            ..Self::default()
        }
    }
}

/// Kind-specific structure of an entity
#[derive(Debug, Clone, PartialEq)]
pub enum EntityDetails {
    Table {
        columns: Vec<Column>,
    },
    View {
        columns: Vec<Column>,
        definition: Option<String>,
    },
    StoredProcedure {
        parameters: Option<String>,
        definition: Option<String>,
    },
}

impl EntityDetails {
    #[inline]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Table { .. } => EntityKind::Table,
            Self::View { .. } => EntityKind::View,
            Self::StoredProcedure { .. } => EntityKind::StoredProcedure,
        }
    }

    #[inline]
    pub fn columns(&self) -> &[Column] {
        match self {
            Self::Table { columns } | Self::View { columns, .. } => columns,
            Self::StoredProcedure { .. } => &[],
        }
    }
}

/// Metadata recorded next to every stored vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingMetadata {
    #[serde(rename = "model")]
    pub model_id: String,
    pub dimensions: usize,
    pub content_hash: String,
    #[serde(rename = "lastUpdatedUtc")]
    pub last_updated: DateTime<Utc>,
    pub version: String,
}

/// A stored embedding; absence on an entity means "not yet embedded"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingEnvelope {
    pub vector: Vec<f32>,
    pub metadata: EmbeddingMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SemanticModelEntity {
    pub schema: String,
    pub name: String,
    pub description: Option<String>,
    pub semantic_description: Option<String>,
    pub semantic_description_updated: Option<DateTime<Utc>>,
    pub not_used: bool,
    pub not_used_reason: Option<String>,
    pub details: EntityDetails,
    pub embedding: Option<EmbeddingEnvelope>,
}

impl SemanticModelEntity {
    #[inline]
    pub fn new(schema: impl Into<String>, name: impl Into<String>, details: EntityDetails) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            description: None,
            semantic_description: None,
            semantic_description_updated: None,
            not_used: false,
            not_used_reason: None,
            details,
            embedding: None,
        }
    }

    #[inline]
    pub fn table(schema: impl Into<String>, name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self::new(schema, name, EntityDetails::Table { columns })
    }

    #[inline]
    pub fn view(
        schema: impl Into<String>,
        name: impl Into<String>,
        columns: Vec<Column>,
        definition: Option<String>,
    ) -> Self {
        Self::new(
            schema,
            name,
            EntityDetails::View {
                columns,
                definition,
            },
        )
    }

    #[inline]
    pub fn stored_procedure(
        schema: impl Into<String>,
        name: impl Into<String>,
        parameters: Option<String>,
        definition: Option<String>,
    ) -> Self {
        Self::new(
            schema,
            name,
            EntityDetails::StoredProcedure {
                parameters,
                definition,
            },
        )
    }

    #[inline]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[inline]
    pub fn kind(&self) -> EntityKind {
        self.details.kind()
    }

    #[inline]
    pub fn id(&self) -> EntityId {
        EntityId::new(self.kind(), self.schema.clone(), self.name.clone())
    }

    /// Sets the AI-generated description and stamps its update time
    #[inline]
    pub fn set_semantic_description(&mut self, text: impl Into<String>) {
        self.semantic_description = Some(text.into());
        self.semantic_description_updated = Some(Utc::now());
    }

    #[inline]
    pub fn mark_not_used(&mut self, reason: impl Into<String>) {
        self.not_used = true;
        self.not_used_reason = Some(reason.into());
    }

    #[inline]
    pub fn validate(&self) -> Result<()> {
        EntityKeyBuilder::validate_name("schema", &self.schema)?;
        EntityKeyBuilder::validate_name("name", &self.name)?;
        Ok(())
    }
}

/// Aggregate root: one extracted database plus its enrichment
#[derive(Debug, Clone)]
pub struct SemanticModel {
    pub name: String,
    pub source: String,
    pub description: Option<String>,
    tables: EntityCollection,
    views: EntityCollection,
    stored_procedures: EntityCollection,
    tracker: Option<ChangeTracker>,
}

impl SemanticModel {
    #[inline]
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            description: None,
            tables: EntityCollection::default(),
            views: EntityCollection::default(),
            stored_procedures: EntityCollection::default(),
            tracker: None,
        }
    }

    /// Assembles a model from collections that may still be deferred
    #[inline]
    pub fn from_parts(
        name: String,
        source: String,
        description: Option<String>,
        tables: EntityCollection,
        views: EntityCollection,
        stored_procedures: EntityCollection,
    ) -> Self {
        Self {
            name,
            source,
            description,
            tables,
            views,
            stored_procedures,
            tracker: None,
        }
    }

    #[inline]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[inline]
    pub fn collection(&self, kind: EntityKind) -> &EntityCollection {
        match kind {
            EntityKind::Table => &self.tables,
            EntityKind::View => &self.views,
            EntityKind::StoredProcedure => &self.stored_procedures,
        }
    }

    fn collection_mut(&mut self, kind: EntityKind) -> &mut EntityCollection {
        match kind {
            EntityKind::Table => &mut self.tables,
            EntityKind::View => &mut self.views,
            EntityKind::StoredProcedure => &mut self.stored_procedures,
        }
    }

    /// Entities of one kind; a deferred collection is fetched on first access
    #[inline]
    pub async fn entities(&self, kind: EntityKind) -> Result<&[SemanticModelEntity]> {
        self.collection(kind).get().await
    }

    /// All entities across kinds, loading deferred collections as needed
    #[inline]
    pub async fn all_entities(&self) -> Result<Vec<&SemanticModelEntity>> {
        let mut all = Vec::new();
        for kind in EntityKind::ALL {
            all.extend(self.entities(kind).await?.iter());
        }
        Ok(all)
    }

    #[inline]
    pub async fn find_entity(
        &self,
        kind: EntityKind,
        schema: &str,
        name: &str,
    ) -> Result<Option<&SemanticModelEntity>> {
        let entities = self.entities(kind).await?;
        Ok(entities
            .iter()
            .find(|e| e.id().matches(kind, schema, name)))
    }

    #[inline]
    pub async fn find_table(&self, schema: &str, name: &str) -> Result<Option<&SemanticModelEntity>> {
        self.find_entity(EntityKind::Table, schema, name).await
    }

    #[inline]
    pub async fn find_view(&self, schema: &str, name: &str) -> Result<Option<&SemanticModelEntity>> {
        self.find_entity(EntityKind::View, schema, name).await
    }

    #[inline]
    pub async fn find_stored_procedure(
        &self,
        schema: &str,
        name: &str,
    ) -> Result<Option<&SemanticModelEntity>> {
        self.find_entity(EntityKind::StoredProcedure, schema, name)
            .await
    }

    #[inline]
    pub async fn add_entity(&mut self, entity: SemanticModelEntity) -> Result<()> {
        entity.validate()?;
        let id = entity.id();
        let model_name = self.name.clone();
        let entities = self.collection_mut(id.kind).get_mut().await?;

        if entities
            .iter()
            .any(|e| e.id().matches(id.kind, &id.schema, &id.name))
        {
            return Err(StoreError::validation(
                "add entity",
                format!("{}/{}", model_name, id),
                "an entity with the same kind, schema and name already exists",
            ));
        }

        entities.push(entity);
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.mark_added(id);
        }
        Ok(())
    }

    #[inline]
    pub async fn remove_entity(&mut self, id: &EntityId) -> Result<Option<SemanticModelEntity>> {
        let entities = self.collection_mut(id.kind).get_mut().await?;
        let position = entities
            .iter()
            .position(|e| e.id().matches(id.kind, &id.schema, &id.name));

        let removed = position.map(|index| entities.swap_remove(index));
        if let Some(entity) = &removed {
            if let Some(tracker) = self.tracker.as_mut() {
                tracker.mark_removed(entity.id());
            }
        }
        Ok(removed)
    }

    /// Applies `update` to the matching entity; returns false when it does not exist.
    ///
    /// The update runs on a copy. The model only changes when the result
    /// validates and keeps its kind, schema and name.
    #[inline]
    pub async fn update_entity<F>(&mut self, id: &EntityId, update: F) -> Result<bool>
    where
        F: FnOnce(&mut SemanticModelEntity),
    {
        let entities = self.collection_mut(id.kind).get_mut().await?;
        let Some(entity) = entities
            .iter_mut()
            .find(|e| e.id().matches(id.kind, &id.schema, &id.name))
        else {
            return Ok(false);
        };

        let previous_id = entity.id();
        let mut updated = entity.clone();
        update(&mut updated);
        updated.validate()?;

        if updated.id() != previous_id {
            return Err(StoreError::validation(
                "update entity",
                previous_id.to_string(),
                "entity identity cannot change during an update",
            ));
        }

        *entity = updated;
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.mark_modified(previous_id);
        }
        Ok(true)
    }

    #[inline]
    pub fn set_description(&mut self, description: Option<String>) {
        self.description = description;
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.mark_header_modified();
        }
    }

    /// Whether every entity collection has been materialized
    #[inline]
    pub fn is_fully_loaded(&self) -> bool {
        EntityKind::ALL
            .iter()
            .all(|kind| self.collection(*kind).is_loaded())
    }

    /// Attaches a fresh tracker treating the current contents as clean
    #[inline]
    pub fn enable_change_tracking(&mut self) {
        self.tracker = Some(ChangeTracker::default());
    }

    #[inline]
    pub fn change_tracker(&self) -> Option<&ChangeTracker> {
        self.tracker.as_ref()
    }

    #[inline]
    pub fn is_change_tracking_enabled(&self) -> bool {
        self.tracker.is_some()
    }

    #[inline]
    pub fn has_unsaved_changes(&self) -> bool {
        self.tracker
            .as_ref()
            .is_some_and(ChangeTracker::has_unsaved_changes)
    }

    #[inline]
    pub fn accept_all_changes(&mut self) {
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.accept_all_changes();
        }
    }

    /// Order-independent structural comparison; loads deferred collections
    #[inline]
    pub async fn content_eq(&self, other: &SemanticModel) -> Result<bool> {
        if self.name != other.name
            || self.source != other.source
            || self.description != other.description
        {
            return Ok(false);
        }

        for kind in EntityKind::ALL {
            let mut left: Vec<&SemanticModelEntity> = self.entities(kind).await?.iter().collect();
            let mut right: Vec<&SemanticModelEntity> =
                other.entities(kind).await?.iter().collect();
            if left.len() != right.len() {
                return Ok(false);
            }
            left.sort_by_key(|e| e.id());
            right.sort_by_key(|e| e.id());
            if left != right {
                return Ok(false);
            }
        }

        Ok(true)
    }
}
