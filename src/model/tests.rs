use super::*;

fn orders_model() -> SemanticModel {
    SemanticModel::new("orders-db", "sqlserver://orders").with_description("Order processing")
}

fn customer() -> SemanticModelEntity {
    SemanticModelEntity::table(
        "dbo",
        "Customer",
        vec![Column::new("Id", "int"), Column::new("Name", "nvarchar")],
    )
    .with_description("Customers who place orders")
}

#[test]
fn entity_kind_names_round_trip() {
    for kind in EntityKind::ALL {
        assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(EntityKind::StoredProcedure.collection_name(), "stored_procedures");
    assert_eq!(EntityKind::parse("function"), None);
}

#[test]
fn entity_id_display() {
    let id = customer().id();
    assert_eq!(id.to_string(), "table:dbo.Customer");
}

#[test]
fn entity_validation_rejects_empty_names() {
    let entity = SemanticModelEntity::table("dbo", "", Vec::new());
    assert!(matches!(
        entity.validate(),
        Err(StoreError::Validation { .. })
    ));
}

#[test]
fn semantic_description_stamps_update_time() {
    let mut entity = customer();
    assert!(entity.semantic_description_updated.is_none());

    entity.set_semantic_description("A person or company that buys products");
    assert!(entity.semantic_description.is_some());
    assert!(entity.semantic_description_updated.is_some());
}

#[tokio::test]
async fn add_and_find_entities() {
    let mut model = orders_model();
    model.add_entity(customer()).await.expect("should add customer");
    model
        .add_entity(SemanticModelEntity::view(
            "sales",
            "ActiveCustomers",
            vec![Column::new("Id", "int")],
            Some("SELECT Id FROM dbo.Customer".to_string()),
        ))
        .await
        .expect("should add view");

    let found = model
        .find_table("DBO", "customer")
        .await
        .expect("lookup should succeed");
    assert!(found.is_some(), "lookup is case-insensitive");

    assert!(
        model
            .find_view("sales", "ActiveCustomers")
            .await
            .expect("lookup should succeed")
            .is_some()
    );
    assert_eq!(model.all_entities().await.expect("should list").len(), 2);
}

#[tokio::test]
async fn duplicate_entity_is_rejected() {
    let mut model = orders_model();
    model.add_entity(customer()).await.expect("should add customer");

    let result = model
        .add_entity(SemanticModelEntity::table("DBO", "CUSTOMER", Vec::new()))
        .await;
    assert!(matches!(result, Err(StoreError::Validation { .. })));
}

#[tokio::test]
async fn update_cannot_change_identity() {
    let mut model = orders_model();
    model.add_entity(customer()).await.expect("should add customer");
    let id = EntityId::new(EntityKind::Table, "dbo", "Customer");

    let result = model
        .update_entity(&id, |entity| entity.name = "Client".to_string())
        .await;
    assert!(matches!(result, Err(StoreError::Validation { .. })));

    let missing = EntityId::new(EntityKind::Table, "dbo", "Nope");
    assert!(
        !model
            .update_entity(&missing, |_| {})
            .await
            .expect("missing entity is not an error")
    );
}

#[tokio::test]
async fn rejected_update_leaves_entity_untouched() {
    let mut model = orders_model();
    model.add_entity(customer()).await.expect("should add customer");
    model.enable_change_tracking();
    let id = EntityId::new(EntityKind::Table, "dbo", "Customer");

    let renamed = model
        .update_entity(&id, |entity| {
            entity.name = "Renamed".to_string();
            entity.description = Some("changed".to_string());
        })
        .await;
    assert!(matches!(renamed, Err(StoreError::Validation { .. })));

    let too_long = model
        .update_entity(&id, |entity| entity.name = "x".repeat(MAX_NAME_LENGTH + 1))
        .await;
    assert!(matches!(too_long, Err(StoreError::Validation { .. })));

    let names: Vec<_> = model
        .entities(EntityKind::Table)
        .await
        .expect("should list")
        .iter()
        .map(|e| e.name.clone())
        .collect();
    assert_eq!(names, vec!["Customer".to_string()]);
    let stored = model
        .find_table("dbo", "Customer")
        .await
        .expect("should search")
        .expect("customer exists");
    assert_eq!(stored, &customer());
    assert!(!model.has_unsaved_changes());
}

#[tokio::test]
async fn change_tracking_follows_mutations() {
    let mut model = orders_model();
    model.add_entity(customer()).await.expect("should add customer");
    assert!(!model.has_unsaved_changes(), "tracking is off by default");

    model.enable_change_tracking();
    assert!(!model.has_unsaved_changes());

    let id = EntityId::new(EntityKind::Table, "dbo", "Customer");
    model
        .update_entity(&id, |entity| {
            entity.set_semantic_description("Buyer of products");
        })
        .await
        .expect("should update");
    assert!(model.has_unsaved_changes());

    model.accept_all_changes();
    assert!(!model.has_unsaved_changes());

    model.set_description(Some("Renamed".to_string()));
    let tracker = model.change_tracker().expect("tracker should exist");
    assert!(tracker.changes().header_modified);
}

#[tokio::test]
async fn content_eq_ignores_entity_order() {
    let mut left = orders_model();
    let mut right = orders_model();
    let order = SemanticModelEntity::table("dbo", "Order", vec![Column::new("Id", "int")]);

    left.add_entity(customer()).await.expect("should add");
    left.add_entity(order.clone()).await.expect("should add");
    right.add_entity(order).await.expect("should add");
    right.add_entity(customer()).await.expect("should add");

    assert!(left.content_eq(&right).await.expect("should compare"));

    right
        .update_entity(&EntityId::new(EntityKind::Table, "dbo", "Order"), |e| {
            e.mark_not_used("legacy");
        })
        .await
        .expect("should update");
    assert!(!left.content_eq(&right).await.expect("should compare"));
}

#[test]
fn embedding_metadata_uses_camel_case_fields() {
    let metadata = EmbeddingMetadata {
        model_id: "nomic-embed-text".to_string(),
        dimensions: 3,
        content_hash: sha256_hex("hello"),
        last_updated: Utc::now(),
        version: "1".to_string(),
    };

    let json = serde_json::to_value(&metadata).expect("should serialize");
    assert_eq!(json["model"], "nomic-embed-text");
    assert_eq!(json["dimensions"], 3);
    assert!(json.get("contentHash").is_some());
    assert!(json.get("lastUpdatedUtc").is_some());
}
