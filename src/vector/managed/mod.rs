
use arrow::array::{Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchReader};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lancedb::index::Index;
use lancedb::index::vector::{IvfHnswSqIndexBuilder, IvfPqIndexBuilder};
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, DistanceType, Table};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::model::EntityKind;
use crate::vector::{
    DistanceFunction, IndexType, IndexedRecord, ResolvedVectorIndex, SearchHit, VectorIndex,
    VectorIndexProvider, VectorIndexWriter, VectorQuery, VectorRecord, VectorSearchService,
    sort_hits,
};
use crate::{Result, StoreError};

/// IVF training needs a populated table; below this, search stays exhaustive
const MIN_ROWS_FOR_INDEX: usize = 256;

fn lance_error(operation: &str, target: &str, error: &lancedb::Error) -> StoreError {
    let message = error.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("timeout")
        || lowered.contains("timed out")
        || lowered.contains("throttl")
        || lowered.contains("429")
        || lowered.contains("503")
    {
        StoreError::transient(operation, target, message)
    } else {
        StoreError::Other(anyhow::anyhow!("{} failed for {}: {}", operation, target, message))
    }
}

fn arrow_error(operation: &str, target: &str, error: &arrow::error::ArrowError) -> StoreError {
    StoreError::corrupt(operation, target, error.to_string())
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Managed search backed by a LanceDB table shared by all models
pub struct ManagedVectorIndex {
    connection: Connection,
    table_name: String,
    dimension: usize,
    distance: DistanceFunction,
    index_type: IndexType,
    provision: bool,
    indexed: AtomicBool,
}

impl std::fmt::Debug for ManagedVectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedVectorIndex")
            .field("table_name", &self.table_name)
            .field("dimension", &self.dimension)
            .field("distance", &self.distance)
            .field("index_type", &self.index_type)
            .finish_non_exhaustive()
    }
}

impl ManagedVectorIndex {
    /// Connects and checks the table; creates it only when provisioning is enabled
    #[inline]
    pub async fn connect(resolved: &ResolvedVectorIndex) -> Result<Self> {
        let uri = resolved.uri.as_deref().ok_or_else(|| {
            StoreError::Configuration("managed-search provider requires a URI".to_string())
        })?;

        if !uri.contains("://") {
            tokio::fs::create_dir_all(uri)
                .await
                .map_err(|e| StoreError::io("create vector directory", uri, e))?;
        }

        debug!("Connecting to LanceDB at {}", uri);
        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| lance_error("connect", uri, &e))?;

        let index = Self {
            connection,
            table_name: resolved.collection.clone(),
            dimension: resolved.dimension,
            distance: resolved.distance,
            index_type: resolved.index_type,
            provision: resolved.provision,
            indexed: AtomicBool::new(false),
        };
        index.ensure_table().await?;

        info!(
            "Managed vector index ready: table {} ({} dimensions)",
            index.table_name, index.dimension
        );
        Ok(index)
    }

    fn distance_type(&self) -> DistanceType {
        match self.distance {
            DistanceFunction::Cosine => DistanceType::Cosine,
            DistanceFunction::DotProduct => DistanceType::Dot,
            DistanceFunction::Euclidean => DistanceType::L2,
        }
    }

    /// Converts the `_distance` column into a higher-is-better score
    fn score(&self, distance: f32) -> f32 {
        match self.distance {
            DistanceFunction::Cosine | DistanceFunction::DotProduct => 1.0 - distance,
            DistanceFunction::Euclidean => 1.0 / (1.0 + distance.max(0.0).sqrt()),
        }
    }

    fn vector_width(&self) -> Result<i32> {
        i32::try_from(self.dimension).map_err(|_| {
            StoreError::Configuration(format!("dimension {} is too large", self.dimension))
        })
    }

    fn schema(&self) -> Result<Arc<Schema>> {
        Ok(Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    self.vector_width()?,
                ),
                false,
            ),
            Field::new("model", DataType::Utf8, false),
            Field::new("kind", DataType::Utf8, false),
            Field::new("schema_name", DataType::Utf8, false),
            Field::new("name", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("embedding_model", DataType::Utf8, false),
            Field::new("content_hash", DataType::Utf8, false),
            Field::new("last_updated", DataType::Utf8, false),
        ])))
    }

    async fn ensure_table(&self) -> Result<()> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| lance_error("list tables", &self.table_name, &e))?;

        if table_names.contains(&self.table_name) {
            let existing = self.detect_existing_vector_dimension().await?;
            if existing != self.dimension {
                return Err(StoreError::Configuration(format!(
                    "vector table {} holds {}-dimensional vectors but {} are configured",
                    self.table_name, existing, self.dimension
                )));
            }
            debug!("Vector table {} already exists", self.table_name);
            return Ok(());
        }

        if !self.provision {
            return Err(StoreError::Configuration(format!(
                "vector table {} does not exist and provisioning is disabled",
                self.table_name
            )));
        }

        info!(
            "Provisioning vector table {} with {} dimensions",
            self.table_name, self.dimension
        );
        self.connection
            .create_empty_table(&self.table_name, self.schema()?)
            .execute()
            .await
            .map_err(|e| lance_error("create table", &self.table_name, &e))?;
        Ok(())
    }

    async fn detect_existing_vector_dimension(&self) -> Result<usize> {
        let schema = self
            .open_table()
            .await?
            .schema()
            .await
            .map_err(|e| lance_error("read table schema", &self.table_name, &e))?;

        for field in schema.fields() {
            if field.name() == "vector" {
                if let DataType::FixedSizeList(_, size) = field.data_type() {
                    return usize::try_from(*size).map_err(|_| {
                        StoreError::corrupt("read table schema", &self.table_name, "negative width")
                    });
                }
            }
        }

        Err(StoreError::corrupt(
            "read table schema",
            &self.table_name,
            "could not find vector column or determine dimension",
        ))
    }

    async fn open_table(&self) -> Result<Table> {
        self.connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| lance_error("open table", &self.table_name, &e))
    }

    fn create_record_batch(&self, records: &[VectorRecord]) -> Result<RecordBatch> {
        let len = records.len();
        let mut flat_values = Vec::with_capacity(len * self.dimension);

        for record in records {
            if record.vector.len() != self.dimension {
                return Err(StoreError::validation(
                    "upsert vector",
                    &record.id,
                    format!(
                        "vector has {} dimensions, index expects {}",
                        record.vector.len(),
                        self.dimension
                    ),
                ));
            }
            flat_values.extend_from_slice(&record.vector);
        }

        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array = FixedSizeListArray::try_new(
            field,
            self.vector_width()?,
            Arc::new(Float32Array::from(flat_values)),
            None,
        )
        .map_err(|e| arrow_error("build vector array", &self.table_name, &e))?;

        let strings = |f: fn(&VectorRecord) -> &str| -> Arc<dyn Array> {
            Arc::new(StringArray::from(records.iter().map(f).collect::<Vec<_>>()))
        };
        let timestamps: Vec<String> = records
            .iter()
            .map(|r| r.last_updated.to_rfc3339())
            .collect();

        let arrays: Vec<Arc<dyn Array>> = vec![
            strings(|r| r.id.as_str()),
            Arc::new(vector_array),
            strings(|r| r.model.as_str()),
            strings(|r| r.kind.as_str()),
            strings(|r| r.schema.as_str()),
            strings(|r| r.name.as_str()),
            strings(|r| r.text.as_str()),
            strings(|r| r.embedding_model_id.as_str()),
            strings(|r| r.content_hash.as_str()),
            Arc::new(StringArray::from(timestamps)),
        ];

        RecordBatch::try_new(self.schema()?, arrays)
            .map_err(|e| arrow_error("build record batch", &self.table_name, &e))
    }

    /// Builds the configured vector index once enough rows exist to train it
    async fn maybe_create_index(&self, table: &Table) -> Result<()> {
        if !self.provision || self.index_type == IndexType::Flat || self.indexed.load(Ordering::SeqCst)
        {
            return Ok(());
        }

        let rows = table
            .count_rows(None)
            .await
            .map_err(|e| lance_error("count rows", &self.table_name, &e))?;
        if rows < MIN_ROWS_FOR_INDEX {
            debug!(
                "Deferring {} index on {}: {} rows",
                self.index_type.as_str(),
                self.table_name,
                rows
            );
            return Ok(());
        }

        let index = match self.index_type {
            IndexType::Quantized => {
                Index::IvfPq(IvfPqIndexBuilder::default().distance_type(self.distance_type()))
            }
            IndexType::TreeBased => Index::IvfHnswSq(
                IvfHnswSqIndexBuilder::default().distance_type(self.distance_type()),
            ),
            IndexType::Flat => return Ok(()),
        };

        table
            .create_index(&["vector"], index)
            .execute()
            .await
            .map_err(|e| lance_error("create vector index", &self.table_name, &e))?;
        self.indexed.store(true, Ordering::SeqCst);
        info!(
            "Created {} vector index on {}",
            self.index_type.as_str(),
            self.table_name
        );
        Ok(())
    }

    fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
        batch
            .column_by_name(name)
            .ok_or_else(|| StoreError::corrupt("read vector batch", name, "missing column"))?
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| StoreError::corrupt("read vector batch", name, "invalid column type"))
    }

    fn parse_kind(value: &str) -> Result<EntityKind> {
        EntityKind::parse(value).ok_or_else(|| {
            StoreError::corrupt("read vector batch", value, "unknown entity kind")
        })
    }
}

#[async_trait]
impl VectorIndexWriter for ManagedVectorIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let batch = self.create_record_batch(records)?;
        let schema = batch.schema();
        let reader: Box<dyn RecordBatchReader + Send> =
            Box::new(RecordBatchIterator::new(std::iter::once(Ok(batch)), schema));

        let table = self.open_table().await?;
        let mut merge = table.merge_insert(&["id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(reader)
            .await
            .map_err(|e| lance_error("upsert vectors", &self.table_name, &e))?;

        self.maybe_create_index(&table).await?;
        debug!("Upserted {} vectors into {}", records.len(), self.table_name);
        Ok(records.len())
    }

    async fn delete(&self, model: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let table = self.open_table().await?;
        let id_list = ids.iter().map(|id| quote(id)).collect::<Vec<_>>().join(", ");
        let predicate = format!("model = {} AND id IN ({})", quote(model), id_list);

        let before = table
            .count_rows(Some(predicate.clone()))
            .await
            .map_err(|e| lance_error("count rows", &self.table_name, &e))?;
        table
            .delete(&predicate)
            .await
            .map_err(|e| lance_error("delete vectors", &self.table_name, &e))?;

        debug!("Deleted {} vectors of {} from {}", before, model, self.table_name);
        Ok(before)
    }

    async fn list_records(&self, model: &str) -> Result<Vec<IndexedRecord>> {
        let table = self.open_table().await?;
        let mut stream = table
            .query()
            .only_if(format!("model = {}", quote(model)))
            .select(Select::Columns(vec![
                "id".to_string(),
                "kind".to_string(),
                "content_hash".to_string(),
                "last_updated".to_string(),
            ]))
            .execute()
            .await
            .map_err(|e| lance_error("list vectors", &self.table_name, &e))?;

        let mut records = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| lance_error("read vectors", &self.table_name, &e))?
        {
            let ids = Self::string_column(&batch, "id")?;
            let kinds = Self::string_column(&batch, "kind")?;
            let hashes = Self::string_column(&batch, "content_hash")?;
            let updated = Self::string_column(&batch, "last_updated")?;

            for row in 0..batch.num_rows() {
                let last_updated = DateTime::parse_from_rfc3339(updated.value(row))
                    .map_err(|e| StoreError::corrupt("read vectors", ids.value(row), e.to_string()))?
                    .with_timezone(&Utc);
                records.push(IndexedRecord {
                    id: ids.value(row).to_string(),
                    kind: Self::parse_kind(kinds.value(row))?,
                    content_hash: hashes.value(row).to_string(),
                    last_updated,
                });
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl VectorSearchService for ManagedVectorIndex {
    async fn search(&self, query: &VectorQuery) -> Result<Vec<SearchHit>> {
        if query.vector.len() != self.dimension {
            return Err(StoreError::validation(
                "vector search",
                &query.model,
                format!(
                    "query has {} dimensions, index expects {}",
                    query.vector.len(),
                    self.dimension
                ),
            ));
        }

        let table = self.open_table().await?;
        let mut stream = table
            .vector_search(query.vector.as_slice())
            .map_err(|e| lance_error("vector search", &self.table_name, &e))?
            .column("vector")
            .distance_type(self.distance_type())
            .only_if(format!("model = {}", quote(&query.model)))
            .limit(query.top_k)
            .execute()
            .await
            .map_err(|e| lance_error("vector search", &self.table_name, &e))?;

        let mut hits = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| lance_error("read search results", &self.table_name, &e))?
        {
            let ids = Self::string_column(&batch, "id")?;
            let kinds = Self::string_column(&batch, "kind")?;
            let schemas = Self::string_column(&batch, "schema_name")?;
            let names = Self::string_column(&batch, "name")?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

            for row in 0..batch.num_rows() {
                let distance = distances
                    .map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });
                hits.push(SearchHit {
                    id: ids.value(row).to_string(),
                    kind: Self::parse_kind(kinds.value(row))?,
                    schema: schemas.value(row).to_string(),
                    name: names.value(row).to_string(),
                    score: self.score(distance),
                });
            }
        }

        if hits.is_empty() {
            warn!("No vectors matched model {} in {}", query.model, self.table_name);
        }
        sort_hits(&mut hits);
        Ok(hits)
    }
}

impl VectorIndex for ManagedVectorIndex {
    fn provider(&self) -> VectorIndexProvider {
        VectorIndexProvider::ManagedSearch
    }
}
