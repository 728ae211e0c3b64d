use super::*;
use crate::model::Column;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::Duration;

struct CountingLoader {
    calls: AtomicUsize,
    fail_first: AtomicBool,
}

impl CountingLoader {
    fn new(fail_first: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first: AtomicBool::new(fail_first),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CollectionLoader for CountingLoader {
    async fn load(&self) -> Result<Vec<SemanticModelEntity>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;

        if self.fail_first.swap(false, Ordering::SeqCst) {
            return Err(StoreError::transient("load", "test", "simulated outage"));
        }

        Ok(vec![
            SemanticModelEntity::table("dbo", "Customer", vec![Column::new("Id", "int")]),
            SemanticModelEntity::table("dbo", "Order", vec![Column::new("Id", "int")]),
        ])
    }

    fn describe(&self) -> String {
        "counting loader".to_string()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_access_loads_once() {
    let loader = CountingLoader::new(false);
    let lazy = Arc::new(LazyCollection::new(
        EntityKind::Table,
        Arc::clone(&loader) as Arc<dyn CollectionLoader>,
    ));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let lazy = Arc::clone(&lazy);
        handles.push(tokio::spawn(async move {
            lazy.get().await.map(<[SemanticModelEntity]>::len)
        }));
    }

    for handle in handles {
        let len = handle
            .await
            .expect("task should not panic")
            .expect("load should succeed");
        assert_eq!(len, 2);
    }

    assert_eq!(loader.calls(), 1);
    assert_eq!(lazy.state(), LoadState::Loaded);
}

#[tokio::test]
async fn starts_unloaded_and_defers_fetch() {
    let loader = CountingLoader::new(false);
    let lazy = LazyCollection::new(
        EntityKind::View,
        Arc::clone(&loader) as Arc<dyn CollectionLoader>,
    );

    assert_eq!(lazy.state(), LoadState::Unloaded);
    assert_eq!(loader.calls(), 0);

    lazy.get().await.expect("load should succeed");
    lazy.get().await.expect("second access should hit the cell");
    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn failed_state_is_terminal_until_reset() {
    let loader = CountingLoader::new(true);
    let lazy = LazyCollection::new(
        EntityKind::Table,
        Arc::clone(&loader) as Arc<dyn CollectionLoader>,
    );

    assert!(lazy.get().await.is_err());
    assert_eq!(lazy.state(), LoadState::Failed);

    // Still failed: the loader is not invoked again
    assert!(lazy.get().await.is_err());
    assert_eq!(loader.calls(), 1);

    assert!(lazy.reset());
    assert_eq!(lazy.state(), LoadState::Unloaded);

    let entities = lazy.get().await.expect("retry after reset should succeed");
    assert_eq!(entities.len(), 2);
    assert_eq!(loader.calls(), 2);
    assert!(!lazy.reset(), "reset only applies to failed collections");
}

#[tokio::test]
async fn get_mut_materializes_deferred_collection() {
    let loader = CountingLoader::new(false);
    let mut collection = EntityCollection::Deferred(LazyCollection::new(
        EntityKind::Table,
        Arc::clone(&loader) as Arc<dyn CollectionLoader>,
    ));

    assert!(collection.is_deferred());
    assert!(!collection.is_loaded());

    let entities = collection.get_mut().await.expect("should materialize");
    entities.push(SemanticModelEntity::table("dbo", "Invoice", Vec::new()));

    assert!(!collection.is_deferred());
    assert_eq!(collection.get().await.expect("loaded").len(), 3);
    assert_eq!(loader.calls(), 1);
}
