use super::*;
use crate::model::{Column, SemanticModelEntity};
use crate::storage::StorageStrategy;
use crate::storage::local::LocalDiskStore;
use crate::vector::{InMemoryVectorIndex, MockEmbeddingGenerator, VectorIndexWriter};
use async_trait::async_trait;
use tempfile::TempDir;

const DIMENSION: usize = 8;

fn location() -> ModelLocation {
    ModelLocation::new("orders-db").expect("valid location")
}

fn vector_config() -> VectorIndexConfig {
    VectorIndexConfig {
        expected_dimension: DIMENSION as u32,
        embedding_service: "mock".to_string(),
        parallelism: 2,
        ..VectorIndexConfig::default()
    }
}

async fn seeded_repository(temp: &TempDir) -> Arc<Repository> {
    let strategy: Arc<dyn StorageStrategy> = Arc::new(LocalDiskStore::new(temp.path()));
    let repository = Repository::new(strategy, &RepositoryOptions::new());

    let mut model = SemanticModel::new("orders-db", "sqlserver://orders");
    model
        .add_entity(
            SemanticModelEntity::table(
                "dbo",
                "Customer",
                vec![Column::new("Id", "int"), Column::new("Name", "nvarchar")],
            )
            .with_description("Customers who placed orders"),
        )
        .await
        .expect("should add");
    model
        .add_entity(SemanticModelEntity::view(
            "sales",
            "OpenOrders",
            Vec::new(),
            Some("SELECT * FROM dbo.Orders WHERE Closed = 0".to_string()),
        ))
        .await
        .expect("should add");
    repository
        .save_model(&location(), &mut model)
        .await
        .expect("should seed");

    Arc::new(repository)
}

async fn orchestrator(
    repository: Arc<Repository>,
    generator: Arc<dyn EmbeddingGenerator>,
) -> (VectorOrchestrator, Arc<InMemoryVectorIndex>) {
    let config = vector_config();
    let resolved = VectorIndexPolicy::resolve(repository.strategy_kind(), &config)
        .expect("should resolve");
    let index = Arc::new(InMemoryVectorIndex::new(resolved.distance));
    let orchestrator = VectorOrchestrator::with_index(
        repository,
        generator,
        Arc::clone(&index) as Arc<dyn VectorIndex>,
        resolved,
        &config,
    )
    .with_retry(RetryPolicy::none());
    (orchestrator, index)
}

/// Returns vectors of the wrong length for texts mentioning `poison`
struct PoisonedGenerator {
    inner: MockEmbeddingGenerator,
    poison: &'static str,
}

#[async_trait]
impl EmbeddingGenerator for PoisonedGenerator {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.contains(self.poison) {
            Ok(vec![1.0; DIMENSION + 1])
        } else {
            self.inner.embed(text).await
        }
    }
}

#[tokio::test]
async fn second_generate_skips_unchanged_entities() {
    let temp = TempDir::new().expect("should create temp dir");
    let repository = seeded_repository(&temp).await;
    let generator = Arc::new(MockEmbeddingGenerator::new(DIMENSION));
    let (orchestrator, _) = orchestrator(Arc::clone(&repository), generator.clone()).await;
    let cancel = CancellationToken::new();

    let first = orchestrator
        .generate(&location(), &GenerateOptions::default(), &cancel)
        .await
        .expect("should generate");
    assert_eq!(first.generated, 2);
    assert_eq!(first.skipped, 0);
    assert_eq!(first.failed, 0);

    let model = repository
        .load_model(&location(), &RepositoryOptions::new())
        .await
        .expect("should load");
    let customer = model
        .find_table("dbo", "Customer")
        .await
        .expect("should search")
        .expect("customer exists");
    let embedding = customer.embedding.as_ref().expect("embedding persisted");
    assert_eq!(embedding.vector.len(), DIMENSION);
    assert_eq!(embedding.metadata.dimensions, DIMENSION);
    assert_eq!(embedding.metadata.content_hash.len(), 64);

    let second = orchestrator
        .generate(&location(), &GenerateOptions::default(), &cancel)
        .await
        .expect("should generate");
    assert_eq!(second.generated, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn overwrite_and_selection_control_what_is_embedded() {
    let temp = TempDir::new().expect("should create temp dir");
    let repository = seeded_repository(&temp).await;
    let generator = Arc::new(MockEmbeddingGenerator::new(DIMENSION));
    let (orchestrator, _) = orchestrator(repository, generator.clone()).await;
    let cancel = CancellationToken::new();

    orchestrator
        .generate(&location(), &GenerateOptions::default(), &cancel)
        .await
        .expect("should generate");

    let options = GenerateOptions {
        overwrite: true,
        entities: Some(vec![EntityId::new(EntityKind::Table, "dbo", "Customer")]),
        ..GenerateOptions::default()
    };
    let summary = orchestrator
        .generate(&location(), &options, &cancel)
        .await
        .expect("should generate");

    assert_eq!(summary.generated, 1);
    assert_eq!(summary.skipped, 0);
    assert_eq!(generator.calls(), 3);
}

#[tokio::test]
async fn wrong_dimension_is_recorded_per_entity() {
    let temp = TempDir::new().expect("should create temp dir");
    let repository = seeded_repository(&temp).await;
    let generator = Arc::new(PoisonedGenerator {
        inner: MockEmbeddingGenerator::new(DIMENSION),
        poison: "OpenOrders",
    });
    let (orchestrator, _) = orchestrator(Arc::clone(&repository), generator).await;

    let summary = orchestrator
        .generate(&location(), &GenerateOptions::default(), &CancellationToken::new())
        .await
        .expect("batch should complete");

    assert_eq!(summary.generated, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].stage, FailureStage::Embed);
    assert!(summary.failures[0].target.contains("OpenOrders"));

    let model = repository
        .load_model(&location(), &RepositoryOptions::new())
        .await
        .expect("should load");
    let view = model
        .find_view("sales", "OpenOrders")
        .await
        .expect("should search")
        .expect("view exists");
    assert!(view.embedding.is_none());
}

#[tokio::test]
async fn fail_fast_returns_the_first_error() {
    let temp = TempDir::new().expect("should create temp dir");
    let repository = seeded_repository(&temp).await;
    let generator = Arc::new(PoisonedGenerator {
        inner: MockEmbeddingGenerator::new(DIMENSION),
        poison: "Customer",
    });
    let (orchestrator, _) = orchestrator(repository, generator).await;

    let options = GenerateOptions {
        fail_fast: true,
        ..GenerateOptions::default()
    };
    let result = orchestrator
        .generate(&location(), &options, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(StoreError::Validation { .. })));
}

#[tokio::test]
async fn recorded_dimension_mismatch_stops_before_embedding() {
    let temp = TempDir::new().expect("should create temp dir");
    let repository = seeded_repository(&temp).await;

    let mut model = repository
        .load_model(&location(), &RepositoryOptions::new())
        .await
        .expect("should load");
    let customer = EntityId::new(EntityKind::Table, "dbo", "Customer");
    model
        .update_entity(&customer, |entity| {
            entity.embedding = Some(VectorRecordMapper::envelope(
                vec![0.5; DIMENSION / 2],
                "older-model",
                "0".repeat(64),
            ));
        })
        .await
        .expect("should update");
    repository
        .save_model(&location(), &mut model)
        .await
        .expect("should save");

    let generator = Arc::new(MockEmbeddingGenerator::new(DIMENSION));
    let (orchestrator, _) = orchestrator(Arc::clone(&repository), generator.clone()).await;

    for overwrite in [false, true] {
        let options = GenerateOptions {
            overwrite,
            ..GenerateOptions::default()
        };
        let result = orchestrator
            .generate(&location(), &options, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StoreError::Configuration(_))), "{result:?}");
    }
    assert_eq!(generator.calls(), 0);

    let reloaded = repository
        .load_model(&location(), &RepositoryOptions::new())
        .await
        .expect("should reload");
    let view = reloaded
        .find_view("sales", "OpenOrders")
        .await
        .expect("should search")
        .expect("view exists");
    assert!(view.embedding.is_none());
}

#[tokio::test]
async fn pending_texts_are_embedded_in_batches() {
    let temp = TempDir::new().expect("should create temp dir");
    let repository = seeded_repository(&temp).await;
    let mut model = repository
        .load_model(&location(), &RepositoryOptions::new())
        .await
        .expect("should load");
    for name in ["Invoice", "Payment", "Shipment"] {
        model
            .add_entity(SemanticModelEntity::table("dbo", name, vec![Column::new("Id", "int")]))
            .await
            .expect("should add");
    }
    repository
        .save_model(&location(), &mut model)
        .await
        .expect("should save");

    let generator = Arc::new(MockEmbeddingGenerator::new(DIMENSION).with_batch_size(2));
    let (orchestrator, _) = orchestrator(Arc::clone(&repository), generator.clone()).await;

    let summary = orchestrator
        .generate(&location(), &GenerateOptions::default(), &CancellationToken::new())
        .await
        .expect("should generate");

    assert_eq!(summary.generated, 5);
    assert_eq!(generator.calls(), 5);
    // Two full batches and a single leftover embedded on its own
    assert_eq!(generator.batches(), 2);
}

/// Rejects any batch call that includes `poison`; single texts always succeed
struct PickyBatchGenerator {
    inner: MockEmbeddingGenerator,
    poison: &'static str,
}

#[async_trait]
impl EmbeddingGenerator for PickyBatchGenerator {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn batch_size(&self) -> usize {
        2
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.inner.embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|text| text.contains(self.poison)) {
            return Err(StoreError::transient("embed", "batch", "payload rejected"));
        }
        self.inner.embed_batch(texts).await
    }
}

#[tokio::test]
async fn failed_batch_falls_back_to_single_texts() {
    let temp = TempDir::new().expect("should create temp dir");
    let repository = seeded_repository(&temp).await;
    let generator = Arc::new(PickyBatchGenerator {
        inner: MockEmbeddingGenerator::new(DIMENSION),
        poison: "OpenOrders",
    });
    let (orchestrator, _) = orchestrator(Arc::clone(&repository), generator.clone()).await;

    let summary = orchestrator
        .generate(&location(), &GenerateOptions::default(), &CancellationToken::new())
        .await
        .expect("should generate");

    assert_eq!(summary.generated, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(generator.inner.batches(), 0);
    assert_eq!(generator.inner.calls(), 2);
}

#[tokio::test]
async fn push_upserts_generated_records() {
    let temp = TempDir::new().expect("should create temp dir");
    let repository = seeded_repository(&temp).await;
    let generator = Arc::new(MockEmbeddingGenerator::new(DIMENSION));
    let (orchestrator, index) = orchestrator(repository, generator).await;

    let options = GenerateOptions {
        push: true,
        ..GenerateOptions::default()
    };
    let summary = orchestrator
        .generate(&location(), &options, &CancellationToken::new())
        .await
        .expect("should generate");

    assert_eq!(summary.pushed, 2);
    let records = index.list_records("orders-db").await.expect("should list");
    assert_eq!(records.len(), 2);
    assert!(
        records
            .iter()
            .any(|r| r.id == "orders-db:table:dbo.customer")
    );
}

#[tokio::test]
async fn cancelled_run_persists_nothing_new() {
    let temp = TempDir::new().expect("should create temp dir");
    let repository = seeded_repository(&temp).await;
    let generator = Arc::new(MockEmbeddingGenerator::new(DIMENSION));
    let (orchestrator, _) = orchestrator(repository, generator).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = orchestrator
        .generate(&location(), &GenerateOptions::default(), &cancel)
        .await
        .expect("cancellation still yields a summary");

    assert!(summary.cancelled);
    assert_eq!(summary.generated, 0);
}

#[tokio::test]
async fn search_uses_hybrid_only_when_supported() {
    let temp = TempDir::new().expect("should create temp dir");
    let repository = seeded_repository(&temp).await;
    let generator = Arc::new(MockEmbeddingGenerator::new(DIMENSION));
    let (orchestrator, _) = orchestrator(repository, generator).await;

    orchestrator
        .generate(
            &location(),
            &GenerateOptions {
                push: true,
                ..GenerateOptions::default()
            },
            &CancellationToken::new(),
        )
        .await
        .expect("should generate");

    let hits = orchestrator
        .search("orders-db", "customers who placed orders", 5)
        .await
        .expect("should search");
    assert_eq!(hits.len(), 2);
    assert!(hits[0].score >= hits[1].score);

    assert!(
        orchestrator
            .search("orders-db", "anything", 0)
            .await
            .expect("k of zero")
            .is_empty()
    );
    assert!(matches!(
        orchestrator.search("orders-db", "  ", 3).await,
        Err(StoreError::Validation { .. })
    ));
}

#[tokio::test]
async fn reconcile_reports_and_repairs_drift() {
    let temp = TempDir::new().expect("should create temp dir");
    let repository = seeded_repository(&temp).await;
    let generator = Arc::new(MockEmbeddingGenerator::new(DIMENSION));
    let (orchestrator, index) = orchestrator(repository, generator.clone()).await;
    let cancel = CancellationToken::new();

    orchestrator
        .generate(&location(), &GenerateOptions::default(), &cancel)
        .await
        .expect("should generate");

    let orphan = VectorRecord {
        id: "orders-db:table:dbo.legacy".to_string(),
        model: "orders-db".to_string(),
        kind: EntityKind::Table,
        schema: "dbo".to_string(),
        name: "Legacy".to_string(),
        text: "Table: dbo.Legacy".to_string(),
        vector: generator.vector_for("legacy"),
        embedding_model_id: "mock-8".to_string(),
        content_hash: "stale".to_string(),
        last_updated: chrono::Utc::now(),
    };
    index.upsert(&[orphan]).await.expect("should upsert");

    let dry = orchestrator
        .reconcile(&location(), true, &cancel)
        .await
        .expect("should reconcile");
    assert_eq!(dry.missing.len(), 2);
    assert_eq!(dry.orphaned.len(), 1);
    assert_eq!(dry.total_issues(), 3);
    assert_eq!(dry.upserted, 0);
    assert!(dry.summary().contains("dry run"));
    let tables = dry.by_kind()[&EntityKind::Table];
    assert_eq!((tables.missing, tables.orphaned), (1, 1));

    let fixed = orchestrator
        .reconcile(&location(), false, &cancel)
        .await
        .expect("should reconcile");
    assert_eq!(fixed.upserted, 2);
    assert_eq!(fixed.deleted, 1);

    let clean = orchestrator
        .reconcile(&location(), true, &cancel)
        .await
        .expect("should reconcile");
    assert!(clean.is_consistent());
    assert!(clean.summary().contains("consistent"));
}

#[test]
fn report_groups_issues_by_kind() {
    let report = ReconcileReport {
        model: "orders-db".to_string(),
        local_records: 3,
        index_records: 2,
        missing: vec![DriftRecord {
            id: "a".to_string(),
            kind: EntityKind::View,
        }],
        outdated: vec![DriftRecord {
            id: "b".to_string(),
            kind: EntityKind::View,
        }],
        orphaned: vec![DriftRecord {
            id: "c".to_string(),
            kind: EntityKind::StoredProcedure,
        }],
        dry_run: false,
        upserted: 2,
        deleted: 1,
    };

    let grouped = report.by_kind();
    assert_eq!(grouped.len(), 2);
    assert_eq!(
        grouped[&EntityKind::View],
        KindDrift {
            missing: 1,
            outdated: 1,
            orphaned: 0
        }
    );
    assert!(report.summary().contains("1 missing, 1 outdated, 1 orphaned"));
    assert!(report.summary().contains("upserted 2, deleted 1"));
}
