use super::*;

#[test]
fn record_id_format() {
    let id = EntityKeyBuilder::record_id("orders-db", EntityKind::Table, "dbo", "Customer");
    assert_eq!(id, "orders-db:table:dbo.customer");
}

#[test]
fn record_id_replaces_unsafe_characters() {
    let id = EntityKeyBuilder::record_id(
        "Orders DB",
        EntityKind::StoredProcedure,
        "sales",
        "usp Get/Top [Customers]",
    );
    assert!(id.starts_with("orders_db:stored_procedure:sales.usp_get_top__customers_~"));
    assert!(id.chars().all(|c| !c.is_ascii_uppercase()));
}

#[test]
fn lookalike_record_ids_stay_distinct() {
    let spaced = EntityKeyBuilder::record_id("m", EntityKind::Table, "dbo", "Order Details");
    let underscored = EntityKeyBuilder::record_id("m", EntityKind::Table, "dbo", "Order_Details");
    assert_ne!(spaced, underscored);
    assert_eq!(underscored, "m:table:dbo.order_details");

    assert_ne!(
        EntityKeyBuilder::record_id("m", EntityKind::Table, "a.b", "c"),
        EntityKeyBuilder::record_id("m", EntityKind::Table, "a", "b.c")
    );
    assert_eq!(
        EntityKeyBuilder::record_id("m", EntityKind::Table, "DBO", "Customer"),
        EntityKeyBuilder::record_id("m", EntityKind::Table, "dbo", "customer")
    );
}

#[test]
fn long_record_ids_are_capped_and_stay_distinct() {
    let long_a = "a".repeat(300);
    let long_b = format!("{}b", "a".repeat(299));

    let id_a = EntityKeyBuilder::record_id("m", EntityKind::Table, "dbo", &long_a);
    let id_b = EntityKeyBuilder::record_id("m", EntityKind::Table, "dbo", &long_b);

    assert_eq!(id_a.len(), MAX_RECORD_ID_LENGTH);
    assert_eq!(id_b.len(), MAX_RECORD_ID_LENGTH);
    assert_ne!(id_a, id_b);
}

#[test]
fn sanitize_segment_blocks_traversal() {
    assert_eq!(EntityKeyBuilder::sanitize_segment("../etc/passwd"), "__etc_passwd");
    assert_eq!(EntityKeyBuilder::sanitize_segment(".hidden"), "_hidden");
    assert_eq!(EntityKeyBuilder::sanitize_segment("dbo"), "dbo");
    assert!(!EntityKeyBuilder::sanitize_segment("a..b").contains(".."));
}

#[test]
fn file_and_document_keys() {
    assert_eq!(EntityKeyBuilder::file_name("dbo", "Customer"), "dbo.Customer.json");
    let spaced = EntityKeyBuilder::file_name("dbo", "Order Details");
    assert!(spaced.starts_with("dbo.Order_Details~"));
    assert!(spaced.ends_with(".json"));
    assert_eq!(
        EntityKeyBuilder::document_id(EntityKind::View, "dbo", "vCustomers"),
        "view-dbo.vCustomers"
    );
    assert_eq!(
        EntityKeyBuilder::partition_key("orders-db", EntityKind::Table),
        "orders-db|table"
    );
}

#[test]
fn validate_name_rules() {
    assert!(EntityKeyBuilder::validate_name("name", "Customer").is_ok());
    assert!(EntityKeyBuilder::validate_name("name", "").is_err());
    assert!(EntityKeyBuilder::validate_name("name", "   ").is_err());
    assert!(EntityKeyBuilder::validate_name("name", &"x".repeat(128)).is_ok());
    assert!(EntityKeyBuilder::validate_name("name", &"x".repeat(129)).is_err());
    assert!(EntityKeyBuilder::validate_name("name", "bad\u{0}name").is_err());
}

#[test]
fn sha256_hex_is_stable() {
    assert_eq!(
        sha256_hex("abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn sanitized_names_never_share_a_key() {
    let pairs = [
        ("dbo", "Order Details"),
        ("dbo", "Order_Details"),
        ("dbo", "Order/Details"),
        ("a.b", "c"),
        ("a", "b.c"),
        ("a_b", "c"),
    ];

    let files: std::collections::HashSet<_> = pairs
        .iter()
        .map(|(schema, name)| EntityKeyBuilder::file_name(schema, name))
        .collect();
    assert_eq!(files.len(), pairs.len());

    let documents: std::collections::HashSet<_> = pairs
        .iter()
        .map(|(schema, name)| EntityKeyBuilder::document_id(EntityKind::Table, schema, name))
        .collect();
    assert_eq!(documents.len(), pairs.len());
}

#[test]
fn entity_stem_is_stable() {
    assert_eq!(
        EntityKeyBuilder::entity_stem("a.b", "c"),
        EntityKeyBuilder::entity_stem("a.b", "c")
    );
    assert_eq!(EntityKeyBuilder::entity_stem("dbo", "Customer"), "dbo.Customer");
}
