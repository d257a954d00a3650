use std::sync::Arc;

use idempotency_common::{now_ms, IdempotencyError, RecordMeta, ResponseEnvelope};
use idempotency_core::{ExecuteOutcome, Manager, ManagerConfig, MemoryStore, RetryPolicy};

#[tokio::test]
async fn execute_runs_the_operation_on_first_call() {
    let store = Arc::new(MemoryStore::new());
    let manager = Manager::new(store, ManagerConfig::default());

    let outcome = manager
        .execute("k1", "h1", RecordMeta::default(), || async {
            Ok(ResponseEnvelope { body: b"created".to_vec(), status_code: 201, content_type: None, headers: Default::default() })
        })
        .await
        .unwrap();

    assert!(matches!(outcome, ExecuteOutcome::Executed(_)));
    assert_eq!(outcome.into_response().status_code, 201);
}

#[tokio::test]
async fn execute_replays_without_rerunning_the_operation() {
    let store = Arc::new(MemoryStore::new());
    let manager = Manager::new(store, ManagerConfig::default());

    manager
        .execute("k1", "h1", RecordMeta::default(), || async {
            Ok(ResponseEnvelope { body: b"created".to_vec(), status_code: 201, content_type: None, headers: Default::default() })
        })
        .await
        .unwrap();

    let ran_again = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let ran_again_clone = ran_again.clone();
    let outcome = manager
        .execute("k1", "h1", RecordMeta::default(), || async move {
            ran_again_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(ResponseEnvelope { body: b"should-not-run".to_vec(), status_code: 500, content_type: None, headers: Default::default() })
        })
        .await
        .unwrap();

    assert!(!ran_again.load(std::sync::atomic::Ordering::SeqCst));
    assert!(matches!(outcome, ExecuteOutcome::Replayed(_)));
    assert_eq!(outcome.into_response().status_code, 201);
}

#[tokio::test]
async fn execute_returns_request_mismatch_for_reused_key() {
    let store = Arc::new(MemoryStore::new());
    let manager = Manager::new(store, ManagerConfig::default());

    manager
        .execute("k1", "h1", RecordMeta::default(), || async {
            Ok(ResponseEnvelope { body: vec![], status_code: 200, content_type: None, headers: Default::default() })
        })
        .await
        .unwrap();

    let err = manager
        .execute("k1", "h2", RecordMeta::default(), || async {
            Ok(ResponseEnvelope { body: vec![], status_code: 200, content_type: None, headers: Default::default() })
        })
        .await
        .unwrap_err();

    assert_eq!(err, IdempotencyError::RequestMismatch);
}

#[tokio::test]
async fn execute_releases_lock_as_failed_when_operation_errors() {
    let store = Arc::new(MemoryStore::new());
    let manager = Manager::new(store.clone(), ManagerConfig::default());

    let err = manager
        .execute::<_, _>("k1", "h1", RecordMeta::default(), || async { Err(IdempotencyError::StorageError("db down".to_string())) })
        .await;
    // with_storage_retry only wraps store calls, not the user op, so this
    // propagates immediately without retrying the op itself.
    assert!(err.is_err());

    let retry = store.start_processing("k1", "h1", 30_000, 86_400_000, RecordMeta::default(), now_ms()).await.unwrap();
    assert!(retry.acquired, "a failed operation must release the lock so a retry can proceed");
}

#[tokio::test]
async fn execute_with_retry_waits_out_a_concurrent_holder() {
    let store = Arc::new(MemoryStore::new());
    let mut config = ManagerConfig::default();
    config.lock_ttl_ms = 50;
    config.retry_policy = RetryPolicy { max_retries: 10, base_backoff_ms: 5, max_backoff_ms: 50, jitter_fraction: 0.0 };
    let manager = Manager::new(store.clone(), config);

    // Simulate a peer holding the lock with a short-lived lease.
    store.start_processing("k1", "h1", 50, 86_400_000, RecordMeta::default(), now_ms()).await.unwrap();

    let outcome = manager
        .execute_with_retry("k1", "h1", RecordMeta::default(), || async {
            Ok(ResponseEnvelope { body: b"done".to_vec(), status_code: 200, content_type: None, headers: Default::default() })
        })
        .await
        .unwrap();

    assert!(matches!(outcome, ExecuteOutcome::Executed(_)));
}
