//! Vector provider resolution.
//!
//! Runs before any embedding call or backend I/O: an incompatible provider,
//! a missing backend field or a bad dimension is a configuration error.

#[cfg(test)]
mod tests;

use std::fmt;
use tracing::{debug, info};

use crate::config::VectorIndexConfig;
use crate::model::EmbeddingMetadata;
use crate::storage::StorageKind;
use crate::storage::dto::validate_vector_field_path;
use crate::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorIndexProvider {
    InMemory,
    ManagedSearch,
    DocumentNative,
}

impl VectorIndexProvider {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InMemory => "in-memory",
            Self::ManagedSearch => "managed-search",
            Self::DocumentNative => "document-native",
        }
    }

    /// `None` for `auto`
    #[inline]
    pub fn parse(value: &str) -> Result<Option<Self>> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(None),
            "in-memory" | "memory" => Ok(Some(Self::InMemory)),
            "managed-search" | "managed" => Ok(Some(Self::ManagedSearch)),
            "document-native" => Ok(Some(Self::DocumentNative)),
            other => Err(StoreError::Configuration(format!(
                "unknown vector index provider {:?} (expected auto, in-memory, managed-search or document-native)",
                other
            ))),
        }
    }

    /// Whether records must be pushed to the index after generation.
    /// Document-native vectors already live on the persisted entity document.
    #[inline]
    pub fn requires_push(self) -> bool {
        !matches!(self, Self::DocumentNative)
    }
}

impl fmt::Display for VectorIndexProvider {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceFunction {
    Cosine,
    DotProduct,
    Euclidean,
}

impl DistanceFunction {
    #[inline]
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "dot-product" | "dotproduct" => Ok(Self::DotProduct),
            "euclidean" => Ok(Self::Euclidean),
            other => Err(StoreError::Configuration(format!(
                "unsupported distance function {:?} (expected cosine, dot-product or euclidean)",
                other
            ))),
        }
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::DotProduct => "dot-product",
            Self::Euclidean => "euclidean",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    TreeBased,
    Quantized,
    Flat,
}

impl IndexType {
    #[inline]
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tree-based" | "tree" => Ok(Self::TreeBased),
            "quantized" => Ok(Self::Quantized),
            "flat" => Ok(Self::Flat),
            other => Err(StoreError::Configuration(format!(
                "unsupported index type {:?} (expected tree-based, quantized or flat)",
                other
            ))),
        }
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TreeBased => "tree-based",
            Self::Quantized => "quantized",
            Self::Flat => "flat",
        }
    }
}

/// Outcome of [`VectorIndexPolicy::resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVectorIndex {
    pub provider: VectorIndexProvider,
    pub distance: DistanceFunction,
    pub index_type: IndexType,
    pub dimension: usize,
    pub collection: String,
    /// Managed-search connection URI
    pub uri: Option<String>,
    /// Document-native field path holding the vector
    pub vector_field_path: Option<String>,
    pub provision: bool,
    pub hybrid_search: bool,
}

pub struct VectorIndexPolicy;

impl VectorIndexPolicy {
    /// Picks the provider permitted for `strategy` and validates its settings
    #[inline]
    pub fn resolve(strategy: StorageKind, config: &VectorIndexConfig) -> Result<ResolvedVectorIndex> {
        if config.expected_dimension == 0 {
            return Err(StoreError::Configuration(
                "expected embedding dimension must be a positive integer".to_string(),
            ));
        }

        let requested = VectorIndexProvider::parse(&config.provider)?;
        let managed_uri = config
            .managed_search
            .uri
            .as_deref()
            .map(str::trim)
            .filter(|uri| !uri.is_empty());

        let provider = match (strategy, requested) {
            (StorageKind::DocumentStore, None | Some(VectorIndexProvider::DocumentNative)) => {
                VectorIndexProvider::DocumentNative
            }
            (StorageKind::DocumentStore, Some(other)) => {
                return Err(StoreError::Configuration(format!(
                    "document-store models only support the document-native vector provider, not {}",
                    other
                )));
            }
            (_, Some(VectorIndexProvider::DocumentNative)) => {
                return Err(StoreError::Configuration(format!(
                    "the document-native vector provider requires the document-store strategy, not {}",
                    strategy
                )));
            }
            (_, Some(VectorIndexProvider::ManagedSearch)) => {
                if managed_uri.is_none() {
                    return Err(StoreError::Configuration(
                        "managed-search provider requires vector_index.managed_search.uri"
                            .to_string(),
                    ));
                }
                VectorIndexProvider::ManagedSearch
            }
            (_, Some(VectorIndexProvider::InMemory)) => VectorIndexProvider::InMemory,
            (_, None) if managed_uri.is_some() => VectorIndexProvider::ManagedSearch,
            (_, None) => VectorIndexProvider::InMemory,
        };

        let (distance, index_type, vector_field_path) = match provider {
            VectorIndexProvider::DocumentNative => {
                let settings = &config.document_native;
                validate_vector_field_path(&settings.vector_field_path)?;
                (
                    DistanceFunction::parse(&settings.distance_function)?,
                    IndexType::parse(&settings.index_type)?,
                    Some(settings.vector_field_path.clone()),
                )
            }
            VectorIndexProvider::ManagedSearch => (
                DistanceFunction::parse(&config.managed_search.distance_function)?,
                IndexType::parse(&config.managed_search.index_type)?,
                None,
            ),
            VectorIndexProvider::InMemory => (
                DistanceFunction::parse(&config.managed_search.distance_function)?,
                IndexType::Flat,
                None,
            ),
        };

        let resolved = ResolvedVectorIndex {
            provider,
            distance,
            index_type,
            dimension: config.expected_dimension as usize,
            collection: config.collection.clone(),
            uri: managed_uri
                .filter(|_| provider == VectorIndexProvider::ManagedSearch)
                .map(str::to_string),
            vector_field_path,
            provision: config.provision,
            hybrid_search: config.hybrid_search,
        };

        info!(
            "Resolved vector provider {} for {} strategy ({} distance, {} index, {} dimensions)",
            resolved.provider,
            strategy,
            resolved.distance.as_str(),
            resolved.index_type.as_str(),
            resolved.dimension
        );
        Ok(resolved)
    }

    /// A recorded embedding with a different dimension is fatal; the caller
    /// must not silently re-embed
    #[inline]
    pub fn check_recorded_dimension(
        expected: usize,
        target: &str,
        recorded: &EmbeddingMetadata,
    ) -> Result<()> {
        if recorded.dimensions == expected {
            return Ok(());
        }

        debug!(
            "Recorded dimension {} for {} does not match expected {}",
            recorded.dimensions, target, expected
        );
        Err(StoreError::Configuration(format!(
            "{} was embedded with {} dimensions ({}) but {} are configured",
            target, recorded.dimensions, recorded.model_id, expected
        )))
    }
}
