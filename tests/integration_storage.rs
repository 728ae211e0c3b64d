#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

//! Save/load round trips through the repository for every storage strategy
use semantic_store::config::Config;
use semantic_store::model::{Column, EntityKind, SemanticModel, SemanticModelEntity};
use semantic_store::repository::{Repository, RepositoryOptions};
use semantic_store::storage::{
    BlobStore, DocumentStore, InMemoryBlobContainer, LocalDiskStore, ModelLocation, StorageKind,
    StorageStrategy,
};
use semantic_store::vector::VectorRecordMapper;
use std::sync::Arc;
use tempfile::TempDir;

async fn realistic_model() -> SemanticModel {
    let mut model = SemanticModel::new("orders-db", "sqlserver://orders.internal/Orders")
        .with_description("Order management database");

    let mut customer = SemanticModelEntity::table(
        "dbo",
        "Customer",
        vec![
            Column {
                is_primary_key: true,
                ..Column::new("CustomerId", "int")
            },
            Column {
                is_nullable: true,
                description: Some("Marketing email address".to_string()),
                ..Column::new("Email", "nvarchar(256)")
            },
        ],
    )
    .with_description("Customers who have placed at least one order");
    customer.set_semantic_description("Customer master data keyed by CustomerId");
    customer.embedding = Some(VectorRecordMapper::envelope(
        vec![0.25, -0.5, 0.75, 0.0],
        "nomic-embed-text",
        "0".repeat(64),
    ));
    model.add_entity(customer).await.expect("should add table");

    model
        .add_entity(SemanticModelEntity::view(
            "sales",
            "OpenOrders",
            vec![Column::new("OrderId", "int")],
            Some("SELECT OrderId FROM dbo.Orders WHERE ClosedAt IS NULL".to_string()),
        ))
        .await
        .expect("should add view");

    let mut procedure = SemanticModelEntity::stored_procedure(
        "dbo",
        "usp_CloseOrder",
        Some("@OrderId int".to_string()),
        Some("UPDATE dbo.Orders SET ClosedAt = SYSUTCDATETIME() WHERE OrderId = @OrderId".to_string()),
    );
    procedure.mark_not_used("Superseded by the fulfilment service");
    model
        .add_entity(procedure)
        .await
        .expect("should add procedure");

    model
}

async fn assert_round_trip(strategy: Arc<dyn StorageStrategy>) {
    let repository = Repository::new(strategy, &RepositoryOptions::new());
    let location = ModelLocation::new("orders-db").expect("valid location");
    let mut original = realistic_model().await;

    repository
        .save_model(&location, &mut original)
        .await
        .expect("should save");
    assert!(repository.model_exists(&location).await.expect("should check"));

    for options in [
        RepositoryOptions::new(),
        RepositoryOptions::new().with_lazy_loading(true),
    ] {
        let loaded = repository
            .load_model(&location, &options)
            .await
            .expect("should load");
        assert!(
            loaded.content_eq(&original).await.expect("should compare"),
            "round trip through {} should preserve the model",
            repository.strategy_kind()
        );
    }

    let loaded = repository
        .load_model(&location, &RepositoryOptions::new())
        .await
        .expect("should load");
    let customer = loaded
        .find_table("dbo", "Customer")
        .await
        .expect("should search")
        .expect("customer exists");
    let embedding = customer.embedding.as_ref().expect("embedding survives");
    assert_eq!(embedding.vector, vec![0.25, -0.5, 0.75, 0.0]);
    assert_eq!(embedding.metadata.model_id, "nomic-embed-text");
    assert!(
        loaded
            .find_view("sales", "OpenOrders")
            .await
            .expect("should search")
            .expect("view exists")
            .embedding
            .is_none()
    );

    assert_eq!(
        repository.list_models().await.expect("should list"),
        vec![location.clone()]
    );
    repository
        .delete_model(&location)
        .await
        .expect("should delete");
    assert!(!repository.model_exists(&location).await.expect("should check"));
}

#[tokio::test]
async fn local_disk_round_trip() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    assert_round_trip(Arc::new(LocalDiskStore::new(temp_dir.path()))).await;
}

#[tokio::test]
async fn blob_store_round_trip() {
    assert_round_trip(Arc::new(BlobStore::new(Arc::new(InMemoryBlobContainer::new())))).await;
}

#[tokio::test]
async fn document_store_round_trip() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = DocumentStore::connect(&temp_dir.path().join("documents.db"), "embedding.vector")
        .await
        .expect("should open document store");
    assert_round_trip(Arc::new(store)).await;
}

#[tokio::test]
async fn tracked_changes_survive_reload() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = Config::with_base_dir(temp_dir.path());
    config.storage.strategy = StorageKind::LocalDisk;
    let repository = Repository::from_config(&config, &RepositoryOptions::new())
        .await
        .expect("should build repository");
    let location = ModelLocation::new("orders-db").expect("valid location");

    let mut model = realistic_model().await;
    repository
        .save_model(&location, &mut model)
        .await
        .expect("should save");

    let mut tracked = repository
        .load_model(&location, &RepositoryOptions::new().with_change_tracking(true))
        .await
        .expect("should load");
    assert!(!tracked.has_unsaved_changes());

    let id = tracked
        .find_view("sales", "OpenOrders")
        .await
        .expect("should search")
        .expect("view exists")
        .id();
    tracked
        .update_entity(&id, |view| {
            view.set_semantic_description("Orders still awaiting fulfilment");
        })
        .await
        .expect("should update");
    assert!(tracked.has_unsaved_changes());

    repository
        .save_changes(&location, &mut tracked)
        .await
        .expect("should save changes");
    assert!(!tracked.has_unsaved_changes());

    let reloaded = repository
        .load_model(&location, &RepositoryOptions::new())
        .await
        .expect("should reload");
    let view = reloaded
        .find_entity(EntityKind::View, "sales", "OpenOrders")
        .await
        .expect("should search")
        .expect("view exists");
    assert_eq!(
        view.semantic_description.as_deref(),
        Some("Orders still awaiting fulfilment")
    );
}

/// Entities whose names only differ in characters that sanitizing rewrites
async fn lookalike_model() -> SemanticModel {
    let mut model = SemanticModel::new("lookalikes", "sqlserver://lookalikes");
    let tables = [
        ("dbo", "Order Details", "a"),
        ("dbo", "Order_Details", "b"),
        ("dbo", "Order/Details", "c"),
        ("a.b", "c", "d"),
        ("a", "b.c", "e"),
    ];
    for (schema, name, column) in tables {
        model
            .add_entity(SemanticModelEntity::table(
                schema,
                name,
                vec![Column::new(column, "int")],
            ))
            .await
            .expect("distinct identities should be accepted");
    }
    model
}

async fn assert_lookalikes_survive(strategy: Arc<dyn StorageStrategy>) {
    let repository = Repository::new(strategy, &RepositoryOptions::new());
    let location = ModelLocation::new("lookalikes").expect("valid location");
    let mut original = lookalike_model().await;

    repository
        .save_model(&location, &mut original)
        .await
        .expect("should save");
    let loaded = repository
        .load_model(&location, &RepositoryOptions::new())
        .await
        .expect("should load");

    assert!(
        loaded.content_eq(&original).await.expect("should compare"),
        "{} merged entities with lookalike names",
        repository.strategy_kind()
    );
    let details = loaded
        .find_table("dbo", "Order Details")
        .await
        .expect("should search")
        .expect("spaced name exists");
    assert_eq!(details.details.columns()[0].name, "a");
    let dotted = loaded
        .find_table("a", "b.c")
        .await
        .expect("should search")
        .expect("dotted name exists");
    assert_eq!(dotted.details.columns()[0].name, "e");

    // Selective saves must address the same distinct keys
    let mut tracked = repository
        .load_model(&location, &RepositoryOptions::new().with_change_tracking(true))
        .await
        .expect("should load");
    let id = tracked
        .find_table("dbo", "Order_Details")
        .await
        .expect("should search")
        .expect("underscored name exists")
        .id();
    tracked
        .update_entity(&id, |table| table.description = Some("line items".to_string()))
        .await
        .expect("should update");
    repository
        .save_changes(&location, &mut tracked)
        .await
        .expect("should save changes");

    let reloaded = repository
        .load_model(&location, &RepositoryOptions::new())
        .await
        .expect("should reload");
    assert!(reloaded.content_eq(&tracked).await.expect("should compare"));
    assert_eq!(
        reloaded
            .entities(EntityKind::Table)
            .await
            .expect("should list")
            .len(),
        5
    );
}

#[tokio::test]
async fn local_disk_keeps_lookalike_names_apart() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    assert_lookalikes_survive(Arc::new(LocalDiskStore::new(temp_dir.path()))).await;
}

#[tokio::test]
async fn blob_store_keeps_lookalike_names_apart() {
    assert_lookalikes_survive(Arc::new(BlobStore::new(Arc::new(InMemoryBlobContainer::new()))))
        .await;
}

#[tokio::test]
async fn document_store_keeps_lookalike_names_apart() {
    let store = DocumentStore::in_memory("embedding.vector")
        .await
        .expect("should open document store");
    assert_lookalikes_survive(Arc::new(store)).await;
}
