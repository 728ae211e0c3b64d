#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

//! Provider resolution and backend construction from configuration
use semantic_store::StoreError;
use semantic_store::config::VectorIndexConfig;
use semantic_store::storage::{
    BlobStore, DocumentStore, InMemoryBlobContainer, LocalDiskStore, StorageKind,
    StorageStrategy,
};
use semantic_store::vector::{
    VectorIndexPolicy, VectorIndexProvider, VectorQuery, create_vector_index,
};
use std::sync::Arc;
use tempfile::TempDir;

fn managed_config(temp_dir: &TempDir, provider: &str, provision: bool) -> VectorIndexConfig {
    let mut config = VectorIndexConfig {
        provider: provider.to_string(),
        expected_dimension: 4,
        provision,
        ..VectorIndexConfig::default()
    };
    config.managed_search.uri = Some(temp_dir.path().join("lance").to_string_lossy().into_owned());
    config
}

#[test]
fn policy_resolution_table() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let auto = VectorIndexConfig::default();
    let configured = managed_config(&temp_dir, "auto", false);

    let cases = [
        (StorageKind::DocumentStore, &auto, Some(VectorIndexProvider::DocumentNative)),
        (StorageKind::DocumentStore, &configured, Some(VectorIndexProvider::DocumentNative)),
        (StorageKind::LocalDisk, &configured, Some(VectorIndexProvider::ManagedSearch)),
        (StorageKind::BlobStore, &configured, Some(VectorIndexProvider::ManagedSearch)),
        (StorageKind::LocalDisk, &auto, Some(VectorIndexProvider::InMemory)),
        (StorageKind::BlobStore, &auto, Some(VectorIndexProvider::InMemory)),
    ];

    for (strategy, config, expected) in cases {
        let resolved = VectorIndexPolicy::resolve(strategy, config).ok().map(|r| r.provider);
        assert_eq!(resolved, expected, "{} with provider {}", strategy, config.provider);
    }

    let explicit = managed_config(&temp_dir, "managed-search", false);
    assert!(matches!(
        VectorIndexPolicy::resolve(StorageKind::DocumentStore, &explicit),
        Err(StoreError::Configuration(_))
    ));
}

#[tokio::test]
async fn provisioned_managed_search_is_searchable() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let strategy: Arc<dyn StorageStrategy> = Arc::new(LocalDiskStore::new(temp_dir.path()));
    let config = managed_config(&temp_dir, "managed-search", true);

    let resolved =
        VectorIndexPolicy::resolve(strategy.kind(), &config).expect("should resolve");
    let index = create_vector_index(&resolved, &strategy)
        .await
        .expect("should provision table");
    assert_eq!(index.provider(), VectorIndexProvider::ManagedSearch);

    let hits = index
        .search(&VectorQuery {
            model: "orders-db".to_string(),
            text: "customers".to_string(),
            vector: vec![1.0, 0.0, 0.0, 0.0],
            top_k: 3,
            hybrid: false,
        })
        .await
        .expect("empty table should search");
    assert!(hits.is_empty());
}

#[tokio::test]
async fn unprovisioned_managed_search_fails_fast() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let strategy: Arc<dyn StorageStrategy> =
        Arc::new(BlobStore::new(Arc::new(InMemoryBlobContainer::new())));
    let config = managed_config(&temp_dir, "managed-search", false);

    let resolved =
        VectorIndexPolicy::resolve(strategy.kind(), &config).expect("should resolve");
    let result = create_vector_index(&resolved, &strategy).await;
    assert!(matches!(result, Err(StoreError::Configuration(_))));
}

#[tokio::test]
async fn document_native_index_wraps_the_document_store() {
    let strategy: Arc<dyn StorageStrategy> = Arc::new(
        DocumentStore::in_memory("embedding.vector")
            .await
            .expect("should open store"),
    );

    let resolved = VectorIndexPolicy::resolve(strategy.kind(), &VectorIndexConfig::default())
        .expect("should resolve");
    let index = create_vector_index(&resolved, &strategy)
        .await
        .expect("should build index");

    assert_eq!(index.provider(), VectorIndexProvider::DocumentNative);
    assert!(!index.supports_hybrid());
    assert!(
        index
            .list_records("orders-db")
            .await
            .expect("should list")
            .is_empty()
    );
}
