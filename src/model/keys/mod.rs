//! Deterministic identifiers for entities, storage keys and vector records.

#[cfg(test)]
mod tests;

use sha2::{Digest, Sha256};

use crate::model::EntityKind;
use crate::{Result, StoreError};

/// Maximum length of an entity or schema name
pub const MAX_NAME_LENGTH: usize = 128;

/// Maximum length of a vector record id
pub const MAX_RECORD_ID_LENGTH: usize = 256;

const HASH_SUFFIX_LENGTH: usize = 12;

/// Lower-case hex SHA-256 digest of `text`
#[inline]
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Builds storage keys and record ids from entity identity
pub struct EntityKeyBuilder;

impl EntityKeyBuilder {
    /// Checks a schema or entity name against the naming invariants
    #[inline]
    pub fn validate_name(field: &str, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(StoreError::validation(
                "validate name",
                field,
                "name cannot be empty",
            ));
        }

        if value.chars().count() > MAX_NAME_LENGTH {
            return Err(StoreError::validation(
                "validate name",
                field,
                format!(
                    "name exceeds {} characters: {}",
                    MAX_NAME_LENGTH,
                    value.chars().count()
                ),
            ));
        }

        if value.chars().any(char::is_control) {
            return Err(StoreError::validation(
                "validate name",
                field,
                "name contains control characters",
            ));
        }

        Ok(())
    }

    /// Maps a raw name onto characters safe for file names and document keys
    #[inline]
    pub fn sanitize_segment(raw: &str) -> String {
        let mut sanitized: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        while sanitized.contains("..") {
            sanitized = sanitized.replace("..", "_");
        }

        if sanitized.starts_with('.') {
            sanitized.replace_range(..1, "_");
        }

        sanitized
    }

    /// Unique `schema.name` stem shared by file names and document ids.
    ///
    /// Names that survive sanitizing unchanged and contain no `.` are used
    /// as is. Anything else gets a `~` plus a digest of the raw pair, so two
    /// entities never share a stem after sanitizing. `~` never appears in a
    /// sanitized segment.
    #[inline]
    pub fn entity_stem(schema: &str, name: &str) -> String {
        let safe_schema = Self::sanitize_segment(schema);
        let safe_name = Self::sanitize_segment(name);
        let lossless = safe_schema == schema
            && safe_name == name
            && !schema.contains('.')
            && !name.contains('.');
        if lossless {
            return format!("{}.{}", safe_schema, safe_name);
        }

        // Names never contain control characters
        let digest = sha256_hex(&format!("{}\u{1f}{}", schema, name));
        format!(
            "{}.{}~{}",
            safe_schema,
            safe_name,
            &digest[..HASH_SUFFIX_LENGTH]
        )
    }

    /// File or blob name of a persisted entity, e.g. `dbo.Customer.json`
    #[inline]
    pub fn file_name(schema: &str, name: &str) -> String {
        format!("{}.json", Self::entity_stem(schema, name))
    }

    /// Document id of an entity inside its partition
    #[inline]
    pub fn document_id(kind: EntityKind, schema: &str, name: &str) -> String {
        format!("{}-{}", kind.as_str(), Self::entity_stem(schema, name))
    }

    /// Partition key grouping all entities of one kind in one model
    #[inline]
    pub fn partition_key(model: &str, kind: EntityKind) -> String {
        format!("{}|{}", Self::sanitize_segment(model), kind.as_str())
    }

    /// Vector record id: `{model}:{kind}:{schema}.{name}`, lower-cased and capped.
    ///
    /// When characters had to be replaced, a segment holds `.` or `:`, or the
    /// id exceeds the cap, a `~` and a digest of the full lower-cased id are
    /// appended so distinct entities keep distinct ids.
    #[inline]
    pub fn record_id(model: &str, kind: EntityKind, schema: &str, name: &str) -> String {
        let raw = format!("{}:{}:{}.{}", model, kind.as_str(), schema, name).to_lowercase();
        let safe: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_lowercase()
                    || c.is_ascii_digit()
                    || matches!(c, '_' | '-' | ':' | '.' | '=')
                {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        let ambiguous = safe != raw
            || [schema, name]
                .iter()
                .any(|segment| segment.contains('.') || segment.contains(':'));
        if !ambiguous && safe.len() <= MAX_RECORD_ID_LENGTH {
            return safe;
        }

        let suffix = &sha256_hex(&raw)[..HASH_SUFFIX_LENGTH];
        let keep = safe.len().min(MAX_RECORD_ID_LENGTH - HASH_SUFFIX_LENGTH - 1);
        format!("{}~{}", &safe[..keep], suffix)
    }
}
