//! Serialized envelopes.
//!
//! * [`PersistedEntityDto`]: one indented JSON file or blob per entity, used by
//!   the local disk and blob strategies; the embedding object is optional.
//! * [`DocumentEntityDto`]: one document per entity in the document store; the
//!   vector sits at a configured field path on the same document with the
//!   metadata object next to it.
//! * [`IndexDocument`]: per-model manifest of entity references.


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{
    Column, EmbeddingEnvelope, EmbeddingMetadata, EntityDetails, EntityKind, SemanticModel,
    SemanticModelEntity,
};
use crate::storage::validation;
use crate::{Result, StoreError};

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Entity fields shared by every envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityFields {
    pub kind: EntityKind,
    pub schema: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_description_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub not_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_used_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

impl EntityFields {
    #[inline]
    pub fn from_entity(entity: &SemanticModelEntity) -> Self {
        let (columns, parameters, definition) = match &entity.details {
            EntityDetails::Table { columns } => (columns.clone(), None, None),
            EntityDetails::View {
                columns,
                definition,
            } => (columns.clone(), None, definition.clone()),
            EntityDetails::StoredProcedure {
                parameters,
                definition,
            } => (Vec::new(), parameters.clone(), definition.clone()),
        };

        Self {
            kind: entity.kind(),
            schema: entity.schema.clone(),
            name: entity.name.clone(),
            description: entity.description.clone(),
            semantic_description: entity.semantic_description.clone(),
            semantic_description_updated: entity.semantic_description_updated,
            not_used: entity.not_used,
            not_used_reason: entity.not_used_reason.clone(),
            columns,
            parameters,
            definition,
        }
    }

    #[inline]
    pub fn into_entity(self, embedding: Option<EmbeddingEnvelope>) -> SemanticModelEntity {
        let details = match self.kind {
            EntityKind::Table => EntityDetails::Table {
                columns: self.columns,
            },
            EntityKind::View => EntityDetails::View {
                columns: self.columns,
                definition: self.definition,
            },
            EntityKind::StoredProcedure => EntityDetails::StoredProcedure {
                parameters: self.parameters,
                definition: self.definition,
            },
        };

        SemanticModelEntity {
            schema: self.schema,
            name: self.name,
            description: self.description,
            semantic_description: self.semantic_description,
            semantic_description_updated: self.semantic_description_updated,
            not_used: self.not_used,
            not_used_reason: self.not_used_reason,
            details,
            embedding,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntityDto {
    #[serde(flatten)]
    pub fields: EntityFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<EmbeddingEnvelope>,
}

impl PersistedEntityDto {
    #[inline]
    pub fn from_entity(entity: &SemanticModelEntity) -> Self {
        Self {
            fields: EntityFields::from_entity(entity),
            embedding: entity.embedding.clone(),
        }
    }

    #[inline]
    pub fn into_entity(self) -> SemanticModelEntity {
        self.fields.into_entity(self.embedding)
    }

    /// Pretty-printed body, validated against size, depth and script rules
    #[inline]
    pub fn to_bytes(&self, target: &str) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self).map_err(|e| {
            StoreError::validation("serialize entity", target, e.to_string())
        })?;
        let text = serde_json::to_string_pretty(&value).map_err(|e| {
            StoreError::validation("serialize entity", target, e.to_string())
        })?;
        validation::check_serialized(target, &text, &value)?;
        Ok(text.into_bytes())
    }

    #[inline]
    pub fn from_bytes(target: &str, bytes: &[u8]) -> Result<Self> {
        validation::check_incoming(target, bytes)?;
        serde_json::from_slice(bytes)
            .map_err(|e| StoreError::corrupt("deserialize entity", target, e.to_string()))
    }
}

/// Row-level shape of an entity in the document store
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentEntityDto {
    pub id: String,
    pub partition_key: String,
    pub model: String,
    pub kind: EntityKind,
    pub body: Value,
}

impl DocumentEntityDto {
    /// Builds the document with the vector written at `vector_field_path`
    #[inline]
    pub fn from_entity(
        model: &str,
        entity: &SemanticModelEntity,
        vector_field_path: &str,
    ) -> Result<Self> {
        let id = crate::model::EntityKeyBuilder::document_id(
            entity.kind(),
            &entity.schema,
            &entity.name,
        );
        let mut body = serde_json::to_value(EntityFields::from_entity(entity))
            .map_err(|e| StoreError::validation("serialize entity", &id, e.to_string()))?;

        if let Some(embedding) = &entity.embedding {
            write_embedding(&id, &mut body, vector_field_path, embedding)?;
        }

        let text = body.to_string();
        validation::check_serialized(&id, &text, &body)?;

        Ok(Self {
            partition_key: crate::model::EntityKeyBuilder::partition_key(model, entity.kind()),
            id,
            model: model.to_string(),
            kind: entity.kind(),
            body,
        })
    }

    /// Reads the entity back, picking the vector up from `vector_field_path`
    #[inline]
    pub fn into_entity(self, vector_field_path: &str) -> Result<SemanticModelEntity> {
        let fields: EntityFields = serde_json::from_value(self.body.clone())
            .map_err(|e| StoreError::corrupt("deserialize document", &self.id, e.to_string()))?;
        let embedding = read_embedding(&self.id, &self.body, vector_field_path)?;
        Ok(fields.into_entity(embedding))
    }
}

/// Extracts the vector and metadata stored at `vector_field_path`, if any
#[inline]
pub fn read_embedding(
    target: &str,
    body: &Value,
    vector_field_path: &str,
) -> Result<Option<EmbeddingEnvelope>> {
    let (vector_path, metadata_path) = split_vector_path(vector_field_path)?;

    let Some(vector) = get_path(body, &vector_path) else {
        return Ok(None);
    };
    let vector: Vec<f32> = serde_json::from_value(vector.clone())
        .map_err(|e| StoreError::corrupt("read vector", target, e.to_string()))?;

    let Some(metadata) = get_path(body, &metadata_path) else {
        return Err(StoreError::corrupt(
            "read vector",
            target,
            "vector present without embedding metadata",
        ));
    };
    let metadata: EmbeddingMetadata = serde_json::from_value(metadata.clone())
        .map_err(|e| StoreError::corrupt("read vector", target, e.to_string()))?;

    Ok(Some(EmbeddingEnvelope { vector, metadata }))
}

/// Writes the vector at `vector_field_path` and its metadata at the sibling `metadata` field
#[inline]
pub fn write_embedding(
    target: &str,
    body: &mut Value,
    vector_field_path: &str,
    embedding: &EmbeddingEnvelope,
) -> Result<()> {
    let (vector_path, metadata_path) = split_vector_path(vector_field_path)?;
    let metadata = serde_json::to_value(&embedding.metadata)
        .map_err(|e| StoreError::validation("serialize embedding", target, e.to_string()))?;
    set_path(body, &vector_path, Value::from(embedding.vector.clone()))?;
    set_path(body, &metadata_path, metadata)
}

/// Drops the vector and its metadata; returns whether a vector was present
#[inline]
pub fn clear_embedding(body: &mut Value, vector_field_path: &str) -> Result<bool> {
    let (vector_path, metadata_path) = split_vector_path(vector_field_path)?;
    remove_path(body, &metadata_path);
    Ok(remove_path(body, &vector_path).is_some())
}

/// Checks a dotted field path such as `embedding.vector`.
/// The first segment cannot shadow an entity field.
#[inline]
pub fn validate_vector_field_path(path: &str) -> Result<()> {
    split_vector_path(path).map(|_| ())
}

fn split_vector_path(path: &str) -> Result<(Vec<String>, Vec<String>)> {
    const RESERVED: [&str; 11] = [
        "kind",
        "schema",
        "name",
        "description",
        "semanticDescription",
        "semanticDescriptionUpdated",
        "notUsed",
        "notUsedReason",
        "columns",
        "parameters",
        "definition",
    ];

    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    if path.trim().is_empty() || segments.iter().any(|s| s.trim().is_empty()) {
        return Err(StoreError::Configuration(format!(
            "vector field path {:?} must be a non-empty dotted path",
            path
        )));
    }

    if RESERVED.contains(&segments[0].as_str()) {
        return Err(StoreError::Configuration(format!(
            "vector field path {:?} collides with entity field {:?}",
            path, segments[0]
        )));
    }

    let mut metadata_path = segments.clone();
    metadata_path.pop();
    metadata_path.push("metadata".to_string());
    if metadata_path == segments {
        return Err(StoreError::Configuration(format!(
            "vector field path {:?} cannot end in 'metadata'",
            path
        )));
    }

    Ok((segments, metadata_path))
}

fn get_path<'a>(value: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(value, |current, segment| current.get(segment.as_str()))
}

fn remove_path(value: &mut Value, segments: &[String]) -> Option<Value> {
    let (last, parents) = segments.split_last()?;
    let parent = parents
        .iter()
        .try_fold(value, |current, segment| current.get_mut(segment.as_str()))?;
    parent.as_object_mut()?.remove(last)
}

fn set_path(value: &mut Value, segments: &[String], leaf: Value) -> Result<()> {
    let Some((last, parents)) = segments.split_last() else {
        return Ok(());
    };

    let mut current = value;
    for segment in parents {
        let Some(map) = current.as_object_mut() else {
            return Err(StoreError::Configuration(format!(
                "vector field path segment {:?} is not an object",
                segment
            )));
        };
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let Some(map) = current.as_object_mut() else {
        return Err(StoreError::Configuration(format!(
            "vector field path segment {:?} is not an object",
            last
        )));
    };
    map.insert(last.clone(), leaf);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub kind: EntityKind,
    pub schema: String,
    pub name: String,
    /// File name, blob name or document id
    pub reference: String,
}

impl IndexEntry {
    /// Same kind, schema and name, compared the way entity identity is
    #[inline]
    pub fn is_entity(&self, kind: EntityKind, schema: &str, name: &str) -> bool {
        self.kind == kind
            && self.schema.eq_ignore_ascii_case(schema)
            && self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_utc: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_modified_utc: DateTime<Utc>,
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    #[serde(default)]
    pub entities: Vec<IndexEntry>,
}

fn default_format_version() -> u32 {
    MANIFEST_FORMAT_VERSION
}

impl IndexDocument {
    /// Manifest for `model`; `created` carries over from a previous manifest
    #[inline]
    pub fn for_model(
        model: &SemanticModel,
        entities: Vec<IndexEntry>,
        created: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: model.name.clone(),
            source: model.source.clone(),
            description: model.description.clone(),
            created_utc: created.unwrap_or(now),
            last_modified_utc: now,
            format_version: MANIFEST_FORMAT_VERSION,
            entities,
        }
    }

    #[inline]
    pub fn entries_of(&self, kind: EntityKind) -> impl Iterator<Item = &IndexEntry> {
        self.entities.iter().filter(move |entry| entry.kind == kind)
    }

    #[inline]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| StoreError::validation("serialize manifest", &self.name, e.to_string()))
    }

    #[inline]
    pub fn from_bytes(target: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StoreError::corrupt("deserialize manifest", target, e.to_string()))
    }
}
