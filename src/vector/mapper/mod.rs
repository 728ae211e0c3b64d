//! Embeddable text, content hashes and vector records for entities.


use chrono::Utc;

use crate::model::{
    Column, EmbeddingEnvelope, EmbeddingMetadata, EntityDetails, EntityKeyBuilder, EntityKind,
    SemanticModelEntity, sha256_hex,
};
use crate::vector::VectorRecord;
use crate::{Result, StoreError};

pub const MAX_EMBEDDING_TEXT_CHARS: usize = 8000;
pub const TRUNCATION_MARKER: &str = "\n[truncated]";
/// Bumped when the text layout changes so stored hashes stop matching
pub const EMBEDDING_PIPELINE_VERSION: &str = "1";

#[derive(Debug, Clone, Copy)]
pub struct VectorRecordMapper {
    max_chars: usize,
}

impl Default for VectorRecordMapper {
    fn default() -> Self {
        Self {
            max_chars: MAX_EMBEDDING_TEXT_CHARS,
        }
    }
}

impl VectorRecordMapper {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_max_chars(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(TRUNCATION_MARKER.chars().count() + 1),
        }
    }

    /// Name, schema, descriptions and a structural summary, capped at the
    /// character budget with the truncation marker counted in
    #[inline]
    pub fn build_text(&self, entity: &SemanticModelEntity) -> String {
        let mut lines = vec![format!(
            "{}: {}.{}",
            kind_label(entity.kind()),
            entity.schema,
            entity.name
        )];

        if let Some(semantic) = non_empty(entity.semantic_description.as_deref()) {
            lines.push(format!("Semantic description: {}", semantic));
        }
        if let Some(description) = non_empty(entity.description.as_deref()) {
            lines.push(format!("Description: {}", description));
        }

        match &entity.details {
            EntityDetails::Table { columns } => push_columns(&mut lines, columns),
            EntityDetails::View {
                columns,
                definition,
            } => {
                push_columns(&mut lines, columns);
                if let Some(definition) = non_empty(definition.as_deref()) {
                    lines.push(format!("Definition: {}", definition));
                }
            }
            EntityDetails::StoredProcedure {
                parameters,
                definition,
            } => {
                if let Some(parameters) = non_empty(parameters.as_deref()) {
                    lines.push(format!("Parameters: {}", parameters));
                }
                if let Some(definition) = non_empty(definition.as_deref()) {
                    lines.push(format!("Definition: {}", definition));
                }
            }
        }

        self.truncate(lines.join("\n"))
    }

    fn truncate(&self, text: String) -> String {
        if text.chars().count() <= self.max_chars {
            return text;
        }

        let keep = self.max_chars - TRUNCATION_MARKER.chars().count();
        let mut truncated: String = text.chars().take(keep).collect();
        truncated.push_str(TRUNCATION_MARKER);
        truncated
    }

    #[inline]
    pub fn content_hash(text: &str) -> String {
        sha256_hex(text)
    }

    /// True when the stored embedding was computed from exactly `text`
    #[inline]
    pub fn is_current(entity: &SemanticModelEntity, content_hash: &str) -> bool {
        entity
            .embedding
            .as_ref()
            .is_some_and(|e| e.metadata.content_hash == content_hash)
    }

    #[inline]
    pub fn envelope(vector: Vec<f32>, model_id: &str, content_hash: String) -> EmbeddingEnvelope {
        EmbeddingEnvelope {
            metadata: EmbeddingMetadata {
                model_id: model_id.to_string(),
                dimensions: vector.len(),
                content_hash,
                last_updated: Utc::now(),
                version: EMBEDDING_PIPELINE_VERSION.to_string(),
            },
            vector,
        }
    }

    /// Record for an entity that already carries an embedding
    #[inline]
    pub fn to_record(
        &self,
        model: &str,
        entity: &SemanticModelEntity,
        text: String,
    ) -> Result<VectorRecord> {
        let embedding = entity.embedding.as_ref().ok_or_else(|| {
            StoreError::validation(
                "map vector record",
                format!("{}.{}", entity.schema, entity.name),
                "entity has no embedding",
            )
        })?;

        Ok(VectorRecord {
            id: EntityKeyBuilder::record_id(model, entity.kind(), &entity.schema, &entity.name),
            model: model.to_string(),
            kind: entity.kind(),
            schema: entity.schema.clone(),
            name: entity.name.clone(),
            text,
            vector: embedding.vector.clone(),
            embedding_model_id: embedding.metadata.model_id.clone(),
            content_hash: embedding.metadata.content_hash.clone(),
            last_updated: embedding.metadata.last_updated,
        })
    }
}

fn kind_label(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Table => "Table",
        EntityKind::View => "View",
        EntityKind::StoredProcedure => "Stored procedure",
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn push_columns(lines: &mut Vec<String>, columns: &[Column]) {
    if columns.is_empty() {
        return;
    }

    lines.push("Columns:".to_string());
    for column in columns {
        let mut flags = Vec::new();
        if column.is_primary_key {
            flags.push("primary key");
        }
        if column.is_nullable {
            flags.push("nullable");
        }

        let mut line = format!("- {} {}", column.name, column.data_type);
        if !flags.is_empty() {
            line = format!("{} ({})", line, flags.join(", "));
        }
        if let Some(description) = non_empty(column.description.as_deref()) {
            line = format!("{}: {}", line, description);
        }
        lines.push(line);
    }
}
