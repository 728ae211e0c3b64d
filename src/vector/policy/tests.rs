use super::*;
use chrono::Utc;

fn config(provider: &str) -> VectorIndexConfig {
    VectorIndexConfig {
        provider: provider.to_string(),
        ..VectorIndexConfig::default()
    }
}

fn managed(provider: &str) -> VectorIndexConfig {
    let mut config = config(provider);
    config.managed_search.uri = Some("/var/lib/semantic-store/vectors".to_string());
    config
}

#[test]
fn resolution_table() {
    let cases = [
        (StorageKind::DocumentStore, config("auto"), VectorIndexProvider::DocumentNative),
        (StorageKind::DocumentStore, config("document-native"), VectorIndexProvider::DocumentNative),
        (StorageKind::LocalDisk, managed("auto"), VectorIndexProvider::ManagedSearch),
        (StorageKind::BlobStore, managed("auto"), VectorIndexProvider::ManagedSearch),
        (StorageKind::LocalDisk, config("auto"), VectorIndexProvider::InMemory),
        (StorageKind::BlobStore, config("auto"), VectorIndexProvider::InMemory),
        (StorageKind::LocalDisk, managed("in-memory"), VectorIndexProvider::InMemory),
    ];

    for (strategy, config, expected) in cases {
        let resolved = VectorIndexPolicy::resolve(strategy, &config).expect("should resolve");
        assert_eq!(resolved.provider, expected, "{strategy} + {}", config.provider);
    }
}

#[test]
fn document_store_rejects_external_providers() {
    for provider in ["managed-search", "in-memory"] {
        let result = VectorIndexPolicy::resolve(StorageKind::DocumentStore, &managed(provider));
        assert!(
            matches!(result, Err(StoreError::Configuration(_))),
            "{provider} should be rejected"
        );
    }
}

#[test]
fn document_native_requires_document_store() {
    let result = VectorIndexPolicy::resolve(StorageKind::LocalDisk, &config("document-native"));
    assert!(matches!(result, Err(StoreError::Configuration(_))));
}

#[test]
fn explicit_managed_search_requires_uri() {
    let result = VectorIndexPolicy::resolve(StorageKind::BlobStore, &config("managed-search"));
    assert!(matches!(result, Err(StoreError::Configuration(_))));

    let mut blank = config("managed-search");
    blank.managed_search.uri = Some("   ".to_string());
    let result = VectorIndexPolicy::resolve(StorageKind::BlobStore, &blank);
    assert!(matches!(result, Err(StoreError::Configuration(_))));
}

#[test]
fn backend_fields_are_validated() {
    let mut bad_distance = managed("managed-search");
    bad_distance.managed_search.distance_function = "manhattan".to_string();
    assert!(VectorIndexPolicy::resolve(StorageKind::LocalDisk, &bad_distance).is_err());

    let mut bad_index = managed("managed-search");
    bad_index.managed_search.index_type = "graph".to_string();
    assert!(VectorIndexPolicy::resolve(StorageKind::LocalDisk, &bad_index).is_err());

    let mut bad_path = config("auto");
    bad_path.document_native.vector_field_path = String::new();
    assert!(VectorIndexPolicy::resolve(StorageKind::DocumentStore, &bad_path).is_err());

    let mut zero = config("auto");
    zero.expected_dimension = 0;
    assert!(matches!(
        VectorIndexPolicy::resolve(StorageKind::LocalDisk, &zero),
        Err(StoreError::Configuration(_))
    ));

    let unknown = config("pinecone");
    assert!(VectorIndexPolicy::resolve(StorageKind::LocalDisk, &unknown).is_err());
}

#[test]
fn resolved_settings_follow_provider() {
    let mut document = config("auto");
    document.document_native.vector_field_path = "search.vector".to_string();
    document.document_native.distance_function = "dot-product".to_string();
    let resolved =
        VectorIndexPolicy::resolve(StorageKind::DocumentStore, &document).expect("should resolve");
    assert_eq!(resolved.vector_field_path.as_deref(), Some("search.vector"));
    assert_eq!(resolved.distance, DistanceFunction::DotProduct);
    assert_eq!(resolved.index_type, IndexType::Quantized);
    assert_eq!(resolved.uri, None);

    let mut lance = managed("auto");
    lance.managed_search.index_type = "tree-based".to_string();
    let resolved = VectorIndexPolicy::resolve(StorageKind::LocalDisk, &lance).expect("should resolve");
    assert_eq!(resolved.index_type, IndexType::TreeBased);
    assert_eq!(resolved.dimension, 768);
    assert!(resolved.uri.is_some());
    assert!(resolved.provider.requires_push());
    assert!(!VectorIndexProvider::DocumentNative.requires_push());
}

#[test]
fn recorded_dimension_mismatch_is_fatal() {
    let metadata = EmbeddingMetadata {
        model_id: "nomic-embed-text".to_string(),
        dimensions: 384,
        content_hash: "abc".to_string(),
        last_updated: Utc::now(),
        version: "1".to_string(),
    };

    assert!(VectorIndexPolicy::check_recorded_dimension(384, "dbo.Customer", &metadata).is_ok());
    assert!(matches!(
        VectorIndexPolicy::check_recorded_dimension(768, "dbo.Customer", &metadata),
        Err(StoreError::Configuration(_))
    ));
}
