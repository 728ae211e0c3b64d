//! Document-native vectors: the vector lives on the entity document itself,
//! so search scans the model's documents and upserts rewrite the vector field.


use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::model::{EmbeddingEnvelope, EmbeddingMetadata, EntityKeyBuilder};
use crate::storage::DocumentStore;
use crate::storage::dto::{self, DocumentEntityDto};
use crate::vector::{
    DistanceFunction, IndexedRecord, SearchHit, VectorIndex, VectorIndexProvider,
    VectorIndexWriter, VectorQuery, VectorRecord, VectorSearchService, similarity, sort_hits,
};
use crate::{Result, StoreError};

#[derive(Debug, Clone)]
pub struct DocumentVectorIndex {
    store: DocumentStore,
    distance: DistanceFunction,
}

/// A stored document decoded just far enough for vector work
struct EmbeddedDocument {
    record_id: String,
    hit: SearchHit,
    embedding: EmbeddingEnvelope,
}

impl DocumentVectorIndex {
    #[inline]
    pub fn new(store: DocumentStore, distance: DistanceFunction) -> Self {
        Self { store, distance }
    }

    fn record_id(model: &str, document: &DocumentEntityDto) -> Result<(String, String, String)> {
        let field = |name: &str| {
            document
                .body
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    StoreError::corrupt("read document", &document.id, format!("missing {}", name))
                })
        };
        let schema = field("schema")?;
        let name = field("name")?;
        Ok((
            EntityKeyBuilder::record_id(model, document.kind, &schema, &name),
            schema,
            name,
        ))
    }

    async fn embedded_documents(&self, model: &str) -> Result<Vec<EmbeddedDocument>> {
        let path = self.store.vector_field_path();
        let mut embedded = Vec::new();

        for document in self.store.fetch_documents(model).await? {
            let Some(embedding) = dto::read_embedding(&document.id, &document.body, path)? else {
                continue;
            };
            let (record_id, schema, name) = Self::record_id(model, &document)?;
            embedded.push(EmbeddedDocument {
                hit: SearchHit {
                    id: record_id.clone(),
                    kind: document.kind,
                    schema,
                    name,
                    score: 0.0,
                },
                record_id,
                embedding,
            });
        }

        Ok(embedded)
    }
}

#[async_trait]
impl VectorIndexWriter for DocumentVectorIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        let path = self.store.vector_field_path().to_string();
        let mut written = 0;

        let mut by_model: HashMap<&str, Vec<&VectorRecord>> = HashMap::new();
        for record in records {
            by_model.entry(record.model.as_str()).or_default().push(record);
        }

        for (model, records) in by_model {
            let mut documents: HashMap<String, DocumentEntityDto> = HashMap::new();
            for document in self.store.fetch_documents(model).await? {
                let (record_id, _, _) = Self::record_id(model, &document)?;
                documents.insert(record_id, document);
            }

            for record in records {
                let Some(document) = documents.get_mut(&record.id) else {
                    warn!(
                        "No stored document for vector record {}, skipping",
                        record.id
                    );
                    continue;
                };

                let embedding = EmbeddingEnvelope {
                    vector: record.vector.clone(),
                    metadata: EmbeddingMetadata {
                        model_id: record.embedding_model_id.clone(),
                        dimensions: record.vector.len(),
                        content_hash: record.content_hash.clone(),
                        last_updated: record.last_updated,
                        version: crate::vector::mapper::EMBEDDING_PIPELINE_VERSION.to_string(),
                    },
                };
                dto::write_embedding(&document.id, &mut document.body, &path, &embedding)?;
                if self.store.update_document_body(document).await? {
                    written += 1;
                }
            }
        }

        debug!("Wrote {} vectors onto entity documents", written);
        Ok(written)
    }

    async fn delete(&self, model: &str, ids: &[String]) -> Result<usize> {
        let path = self.store.vector_field_path();
        let mut cleared = 0;

        for mut document in self.store.fetch_documents(model).await? {
            let (record_id, _, _) = Self::record_id(model, &document)?;
            if !ids.contains(&record_id) {
                continue;
            }
            if dto::clear_embedding(&mut document.body, path)?
                && self.store.update_document_body(&document).await?
            {
                cleared += 1;
            }
        }

        Ok(cleared)
    }

    async fn list_records(&self, model: &str) -> Result<Vec<IndexedRecord>> {
        Ok(self
            .embedded_documents(model)
            .await?
            .into_iter()
            .map(|doc| IndexedRecord {
                id: doc.record_id,
                kind: doc.hit.kind,
                content_hash: doc.embedding.metadata.content_hash,
                last_updated: doc.embedding.metadata.last_updated,
            })
            .collect())
    }
}

#[async_trait]
impl VectorSearchService for DocumentVectorIndex {
    async fn search(&self, query: &VectorQuery) -> Result<Vec<SearchHit>> {
        let mut hits = Vec::new();
        for doc in self.embedded_documents(&query.model).await? {
            if doc.embedding.vector.len() != query.vector.len() {
                return Err(StoreError::validation(
                    "vector search",
                    &doc.record_id,
                    format!(
                        "stored vector has {} dimensions, query has {}",
                        doc.embedding.vector.len(),
                        query.vector.len()
                    ),
                ));
            }
            let score = similarity(self.distance, &query.vector, &doc.embedding.vector);
            hits.push(SearchHit { score, ..doc.hit });
        }

        sort_hits(&mut hits);
        hits.truncate(query.top_k);
        Ok(hits)
    }
}

impl VectorIndex for DocumentVectorIndex {
    fn provider(&self) -> VectorIndexProvider {
        VectorIndexProvider::DocumentNative
    }
}
