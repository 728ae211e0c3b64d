use super::*;
use std::sync::atomic::{AtomicU32, Ordering};

fn fast_policy() -> RetryPolicy {
    RetryPolicy::default()
        .with_base_delay(Duration::from_millis(1))
        .with_timeout(Duration::from_millis(200))
}

#[test]
fn backoff_doubles_each_attempt() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(1), Duration::from_millis(200));
    assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    assert_eq!(policy.delay_for(3), Duration::from_millis(800));
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let calls = AtomicU32::new(0);

    let result = fast_policy()
        .run("save", "orders-db", || async {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < 3 {
                Err(StoreError::transient("save", "orders-db", "throttled"))
            } else {
                Ok(call)
            }
        })
        .await
        .expect("third attempt should succeed");

    assert_eq!(result, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gives_up_after_three_retries() {
    let calls = AtomicU32::new(0);

    let result: Result<()> = fast_policy()
        .run("load", "orders-db", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::transient("load", "orders-db", "network blip"))
        })
        .await;

    assert!(matches!(result, Err(StoreError::Transient { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let calls = AtomicU32::new(0);

    let result: Result<()> = fast_policy()
        .run("load", "orders-db", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::not_found("load", "orders-db"))
        })
        .await;

    assert!(matches!(result, Err(StoreError::NotFound { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timeouts_surface_as_transient() {
    let policy = RetryPolicy::none().with_timeout(Duration::from_millis(10));

    let result: Result<()> = policy
        .run("search", "semantic-entities", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(StoreError::Transient { .. })));
}

#[test]
fn policy_follows_storage_config() {
    let config = StorageConfig {
        max_retries: 5,
        operation_timeout_secs: 12,
        ..StorageConfig::default()
    };
    let policy = RetryPolicy::from_config(&config);
    assert_eq!(policy.max_retries, 5);
    assert_eq!(policy.operation_timeout, Duration::from_secs(12));
}
