use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use idempotency_axum::{ConcurrentRequestHandling, IdempotencyState, MiddlewareConfig};
use idempotency_core::{BackendConfig, MemoryStore, Store};
use idempotency_server::config::ServerConfig;
use idempotency_server::Server;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tower::ServiceExt;

const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(10);

async fn start_node(middleware: MiddlewareConfig) -> SocketAddr {
    let (ready_tx, ready_rx) = oneshot::channel();
    let server = Server::new(ServerConfig {
        address: "127.0.0.1:0".parse().unwrap(),
        backend: BackendConfig::Memory { max_records: None },
        middleware,
    });
    tokio::spawn(async move {
        server.run(ready_tx).await.expect("server failed");
    });
    timeout(SERVER_READY_TIMEOUT, ready_rx)
        .await
        .expect("server did not become ready in time")
        .expect("server ready signal dropped")
}

// --- Scenario 1: happy path ---

#[tokio::test]
async fn happy_path_replays_without_rerunning_the_handler() {
    let addr = start_node(MiddlewareConfig::default()).await;
    let http = reqwest::Client::new();
    let url = format!("http://{addr}/payments");

    let r1 = http
        .post(&url)
        .header("Idempotency-Key", "k1")
        .json(&serde_json::json!({"amount": 100}))
        .send()
        .await
        .unwrap();
    assert_eq!(r1.status(), reqwest::StatusCode::CREATED);
    assert!(r1.headers().get("Idempotency-Replayed").is_none());
    let body1: serde_json::Value = r1.json().await.unwrap();

    let r2 = http
        .post(&url)
        .header("Idempotency-Key", "k1")
        .json(&serde_json::json!({"amount": 100}))
        .send()
        .await
        .unwrap();
    assert_eq!(r2.status(), reqwest::StatusCode::CREATED);
    assert_eq!(r2.headers().get("Idempotency-Replayed").unwrap(), "true");
    let body2: serde_json::Value = r2.json().await.unwrap();

    assert_eq!(body1, body2, "replayed body must be byte-identical to the original");
}

// --- Scenario 2: mismatch ---

#[tokio::test]
async fn reusing_a_key_with_a_different_body_returns_422() {
    let addr = start_node(MiddlewareConfig::default()).await;
    let http = reqwest::Client::new();
    let url = format!("http://{addr}/payments");

    http.post(&url)
        .header("Idempotency-Key", "k1")
        .json(&serde_json::json!({"amount": 100}))
        .send()
        .await
        .unwrap();

    let r2 = http
        .post(&url)
        .header("Idempotency-Key", "k1")
        .json(&serde_json::json!({"amount": 200}))
        .send()
        .await
        .unwrap();

    assert_eq!(r2.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn missing_key_returns_400() {
    let addr = start_node(MiddlewareConfig::default()).await;
    let http = reqwest::Client::new();
    let url = format!("http://{addr}/payments");

    let response = http.post(&url).json(&serde_json::json!({"amount": 1})).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

// --- Scenarios 3-5: concurrency and lock takeover, exercised directly against a
// slow handler wired through the real middleware so contention is deterministic
// rather than a race against an instant demo handler. ---

fn slow_app(store: Arc<dyn Store>, config: MiddlewareConfig, delay: Duration) -> Router {
    let state = IdempotencyState::new(store, config);
    Router::new()
        .route(
            "/slow",
            post(move || {
                let delay = delay;
                async move {
                    tokio::time::sleep(delay).await;
                    (StatusCode::CREATED, "{\"done\":true}")
                }
            }),
        )
        .layer(axum::middleware::from_fn_with_state(state, idempotency_axum::idempotency_layer))
}

fn slow_request(key: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/slow")
        .header("Idempotency-Key", key)
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap()
}

async fn status_of(response: Response) -> StatusCode {
    response.status()
}

#[tokio::test]
async fn concurrent_reject_returns_409_with_retry_after() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mut config = MiddlewareConfig::default();
    config.concurrent_request_handling = ConcurrentRequestHandling::Reject;
    let app = slow_app(store, config, Duration::from_millis(200));

    let slow_app1 = app.clone();
    let fast_app = app;

    let (slow, fast) = tokio::join!(
        async {
            let response = slow_app1.oneshot(slow_request("k2")).await.unwrap();
            status_of(response).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            fast_app.oneshot(slow_request("k2")).await.unwrap()
        }
    );

    assert_eq!(slow, StatusCode::CREATED);
    assert_eq!(fast.status(), StatusCode::CONFLICT);
    assert!(fast.headers().get(axum::http::header::RETRY_AFTER).is_some());
}

#[tokio::test]
async fn concurrent_wait_blocks_until_the_peer_terminates_then_replays() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mut config = MiddlewareConfig::default();
    config.concurrent_request_handling = ConcurrentRequestHandling::Wait;
    config.retry_interval_ms = 20;
    config.max_wait_time_ms = 5_000;
    let app = slow_app(store, config, Duration::from_millis(150));

    let first_app = app.clone();
    let second_app = app;

    let (first, second) = tokio::join!(
        async {
            let response = first_app.oneshot(slow_request("k3")).await.unwrap();
            status_of(response).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let response = second_app.oneshot(slow_request("k3")).await.unwrap();
            (response.status(), response.headers().get("Idempotency-Replayed").is_some())
        }
    );

    assert_eq!(first, StatusCode::CREATED);
    assert_eq!(second.0, StatusCode::CREATED);
    assert!(second.1, "waiter must observe the replay flag once the holder terminates");
}

#[tokio::test]
async fn expired_lock_is_taken_over_and_the_stale_holder_cannot_overwrite_it() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    let original = store
        .start_processing("k4", "hash-a", 10, 86_400_000, Default::default(), 1_000)
        .await
        .unwrap();
    assert!(original.acquired);

    // lock_ttl=10ms has long since passed by the time this runs at now_ms=2_000.
    let takeover = store
        .start_processing("k4", "hash-a", 30_000, 86_400_000, Default::default(), 2_000)
        .await
        .unwrap();
    assert!(takeover.acquired);
    assert_ne!(takeover.lock_token, original.lock_token);

    let envelope = idempotency_common::ResponseEnvelope {
        body: b"stale".to_vec(),
        status_code: 201,
        content_type: None,
        headers: Default::default(),
    };
    let stale_write = store
        .record("k4", &original.lock_token.unwrap(), envelope, false, None, None, 86_400_000, 1_000_000, 3_000)
        .await;
    assert!(stale_write.is_err(), "the original, stale token must not be able to overwrite the new holder's record");

    let fresh_envelope = idempotency_common::ResponseEnvelope {
        body: b"fresh".to_vec(),
        status_code: 201,
        content_type: None,
        headers: Default::default(),
    };
    store
        .record("k4", &takeover.lock_token.unwrap(), fresh_envelope, false, None, None, 86_400_000, 1_000_000, 3_001)
        .await
        .unwrap();

    let checked = store.check("k4", "hash-a", 3_002).await.unwrap();
    assert_eq!(checked.response.unwrap().body, b"fresh".to_vec());
}

// --- Scenario 6: bulk cleanup ---

#[tokio::test]
async fn bulk_cleanup_deletes_every_expired_record() {
    let store = MemoryStore::new();
    for i in 0..1_000 {
        // record_ttl_ms=1_000 at now_ms=0 puts expires_at at 1_000, long before
        // the far-future "now" the cleanup sweep runs at below.
        store
            .start_processing(&format!("bulk-{i}"), "h", 30_000, 1_000, Default::default(), 0)
            .await
            .unwrap();
    }

    let result = store
        .cleanup(
            idempotency_core::CleanupRequest { batch_size: 100, max_records: None, key_prefix: None, client_id: None, force_before: None, dry_run: false },
            now_far_future(),
        )
        .await
        .unwrap();

    assert_eq!(result.deleted_count, 1_000);

    let checked = store.check("bulk-0", "h", now_far_future()).await.unwrap();
    assert!(!checked.found);
}

fn now_far_future() -> u64 {
    4_102_444_800_000
}
