
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

use crate::Result;
use crate::StoreError;
use crate::vector::{
    DistanceFunction, IndexedRecord, SearchHit, VectorIndex, VectorIndexProvider,
    VectorIndexWriter, VectorQuery, VectorRecord, VectorSearchService, keyword_score,
    keyword_terms, reciprocal_rank_fusion, similarity, sort_hits,
};

/// Process-local index, exhaustive scan per query
#[derive(Debug)]
pub struct InMemoryVectorIndex {
    distance: DistanceFunction,
    /// model -> record id -> record
    records: RwLock<HashMap<String, BTreeMap<String, VectorRecord>>>,
}

impl InMemoryVectorIndex {
    #[inline]
    pub fn new(distance: DistanceFunction) -> Self {
        Self {
            distance,
            records: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub async fn len(&self) -> usize {
        self.records.read().await.values().map(BTreeMap::len).sum()
    }

    #[inline]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn to_hit(record: &VectorRecord, score: f32) -> SearchHit {
        SearchHit {
            id: record.id.clone(),
            kind: record.kind,
            schema: record.schema.clone(),
            name: record.name.clone(),
            score,
        }
    }
}

#[async_trait]
impl VectorIndexWriter for InMemoryVectorIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        let mut guard = self.records.write().await;
        for record in records {
            guard
                .entry(record.model.clone())
                .or_default()
                .insert(record.id.clone(), record.clone());
        }
        debug!("Upserted {} records into in-memory index", records.len());
        Ok(records.len())
    }

    async fn delete(&self, model: &str, ids: &[String]) -> Result<usize> {
        let mut guard = self.records.write().await;
        let Some(records) = guard.get_mut(model) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| records.remove(*id).is_some()).count())
    }

    async fn list_records(&self, model: &str) -> Result<Vec<IndexedRecord>> {
        let guard = self.records.read().await;
        Ok(guard
            .get(model)
            .map(|records| records.values().map(IndexedRecord::from).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl VectorSearchService for InMemoryVectorIndex {
    async fn search(&self, query: &VectorQuery) -> Result<Vec<SearchHit>> {
        let guard = self.records.read().await;
        let Some(records) = guard.get(&query.model) else {
            return Ok(Vec::new());
        };

        let mut vector_hits = Vec::with_capacity(records.len());
        for record in records.values() {
            if record.vector.len() != query.vector.len() {
                return Err(StoreError::validation(
                    "vector search",
                    &record.id,
                    format!(
                        "stored vector has {} dimensions, query has {}",
                        record.vector.len(),
                        query.vector.len()
                    ),
                ));
            }
            let score = similarity(self.distance, &query.vector, &record.vector);
            vector_hits.push(Self::to_hit(record, score));
        }
        sort_hits(&mut vector_hits);

        if !query.hybrid {
            vector_hits.truncate(query.top_k);
            return Ok(vector_hits);
        }

        let terms = keyword_terms(&query.text);
        let mut keyword_hits: Vec<SearchHit> = records
            .values()
            .filter_map(|record| {
                let score = keyword_score(&terms, &record.text);
                (score > 0.0).then(|| Self::to_hit(record, score))
            })
            .collect();
        sort_hits(&mut keyword_hits);

        Ok(reciprocal_rank_fusion(
            &vector_hits,
            &keyword_hits,
            query.top_k,
        ))
    }

    fn supports_hybrid(&self) -> bool {
        true
    }
}

impl VectorIndex for InMemoryVectorIndex {
    fn provider(&self) -> VectorIndexProvider {
        VectorIndexProvider::InMemory
    }
}
