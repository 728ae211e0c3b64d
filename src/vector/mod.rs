//! Vector records, backend traits and provider construction.
//!
//! Each provider implements [`VectorIndexWriter`] and [`VectorSearchService`];
//! callers see the same record and hit shapes regardless of backend.

pub mod document;
pub mod embedding;
pub mod managed;
pub mod mapper;
pub mod memory;
pub mod orchestrator;
pub mod policy;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::model::EntityKind;
use crate::storage::StorageStrategy;
use crate::{Result, StoreError};

pub use document::DocumentVectorIndex;
pub use embedding::{EmbeddingGenerator, MockEmbeddingGenerator, OllamaEmbeddingGenerator};
pub use managed::ManagedVectorIndex;
pub use mapper::VectorRecordMapper;
pub use memory::InMemoryVectorIndex;
pub use orchestrator::{
    GenerateOptions, GenerateSummary, ReconcileReport, VectorOrchestrator,
};
pub use policy::{
    DistanceFunction, IndexType, ResolvedVectorIndex, VectorIndexPolicy, VectorIndexProvider,
};

/// RRF constant used when fusing vector and keyword rankings
pub const RRF_K: f32 = 60.0;

/// Storage-agnostic projection of one embedded entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorRecord {
    pub id: String,
    pub model: String,
    pub kind: EntityKind,
    pub schema: String,
    pub name: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub embedding_model_id: String,
    pub content_hash: String,
    pub last_updated: DateTime<Utc>,
}

/// Index-side view of a record used for drift detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedRecord {
    pub id: String,
    pub kind: EntityKind,
    pub content_hash: String,
    pub last_updated: DateTime<Utc>,
}

impl From<&VectorRecord> for IndexedRecord {
    #[inline]
    fn from(record: &VectorRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind,
            content_hash: record.content_hash.clone(),
            last_updated: record.last_updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub kind: EntityKind,
    pub schema: String,
    pub name: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    pub model: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub top_k: usize,
    /// Fuse keyword ranking into the result when the backend supports it
    pub hybrid: bool,
}

#[async_trait]
pub trait VectorIndexWriter: Send + Sync {
    /// Inserts or replaces records by id; returns how many were written
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize>;

    async fn delete(&self, model: &str, ids: &[String]) -> Result<usize>;

    async fn list_records(&self, model: &str) -> Result<Vec<IndexedRecord>>;
}

#[async_trait]
pub trait VectorSearchService: Send + Sync {
    /// Top-k hits ordered by descending score
    async fn search(&self, query: &VectorQuery) -> Result<Vec<SearchHit>>;

    fn supports_hybrid(&self) -> bool {
        false
    }
}

pub trait VectorIndex: VectorIndexWriter + VectorSearchService {
    fn provider(&self) -> VectorIndexProvider;
}

/// Builds the backend for a resolved provider
#[inline]
pub async fn create_vector_index(
    resolved: &ResolvedVectorIndex,
    strategy: &Arc<dyn StorageStrategy>,
) -> Result<Arc<dyn VectorIndex>> {
    let index: Arc<dyn VectorIndex> = match resolved.provider {
        VectorIndexProvider::InMemory => Arc::new(InMemoryVectorIndex::new(resolved.distance)),
        VectorIndexProvider::ManagedSearch => {
            Arc::new(ManagedVectorIndex::connect(resolved).await?)
        }
        VectorIndexProvider::DocumentNative => {
            let store = strategy.as_document_store().ok_or_else(|| {
                StoreError::Configuration(format!(
                    "document-native vectors need the document-store strategy, not {}",
                    strategy.kind()
                ))
            })?;
            Arc::new(DocumentVectorIndex::new(store.clone(), resolved.distance))
        }
    };
    Ok(index)
}

/// Similarity score for `distance`; higher is always better
#[inline]
pub fn similarity(distance: DistanceFunction, a: &[f32], b: &[f32]) -> f32 {
    match distance {
        DistanceFunction::Cosine => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                0.0
            } else {
                dot / (norm_a * norm_b)
            }
        }
        DistanceFunction::DotProduct => a.iter().zip(b).map(|(x, y)| x * y).sum(),
        DistanceFunction::Euclidean => {
            let squared: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
            1.0 / (1.0 + squared.sqrt())
        }
    }
}

/// Lower-cased alphanumeric terms of `text`
pub(crate) fn keyword_terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|term| term.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of query terms present in `text`
pub(crate) fn keyword_score(terms: &[String], text: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let matched = terms
        .iter()
        .filter(|term| haystack.contains(term.as_str()))
        .count();
    matched as f32 / terms.len() as f32
}

pub(crate) fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Reciprocal rank fusion of a vector ranking and a keyword ranking.
/// Both inputs must already be sorted best first.
pub(crate) fn reciprocal_rank_fusion(
    vector_hits: &[SearchHit],
    keyword_hits: &[SearchHit],
    limit: usize,
) -> Vec<SearchHit> {
    let mut fused: HashMap<&str, SearchHit> = HashMap::new();

    for ranking in [vector_hits, keyword_hits] {
        for (rank, hit) in ranking.iter().enumerate() {
            let contribution = 1.0 / (RRF_K + (rank + 1) as f32);
            fused
                .entry(hit.id.as_str())
                .and_modify(|existing| existing.score += contribution)
                .or_insert_with(|| SearchHit {
                    score: contribution,
                    ..hit.clone()
                });
        }
    }

    let mut hits: Vec<SearchHit> = fused.into_values().collect();
    sort_hits(&mut hits);
    hits.truncate(limit);
    hits
}
