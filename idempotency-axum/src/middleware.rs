use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use idempotency_common::{
    now_ms, request_fingerprint, sha256_hex, IdempotencyError, IdempotencyKey, RecordMeta, RecordStatus, ResponseEnvelope,
};
use idempotency_core::{LockResult, Store};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{ConcurrentRequestHandling, MiddlewareConfig};

/// Shared state the middleware needs: the backend and its tuning. Cloned per
/// request (both fields are cheap: `Arc` and a small config struct), the
/// same shape as the teacher's `AppState`.
#[derive(Clone)]
pub struct IdempotencyState {
    pub store: Arc<dyn Store>,
    pub config: Arc<MiddlewareConfig>,
}

impl IdempotencyState {
    pub fn new(store: Arc<dyn Store>, config: MiddlewareConfig) -> Self {
        Self { store, config: Arc::new(config) }
    }
}

/// Releases a held lock as `FAILED` if dropped before [`LockGuard::disarm`]
/// is called — the concrete mechanism behind "the connection aborted before
/// headers were sent" in SPEC_FULL.md §4.5. A dropped future (client
/// disconnect, load shedding) skips straight past any `.await` still
/// in-flight, so ordinary control flow can never guarantee `release_lock`
/// runs; this guard makes it unconditional.
struct LockGuard {
    store: Arc<dyn Store>,
    key: String,
    lock_token: String,
    armed: bool,
}

impl LockGuard {
    fn new(store: Arc<dyn Store>, key: String, lock_token: String) -> Self {
        Self { store, key, lock_token, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let key = self.key.clone();
        let lock_token = self.lock_token.clone();
        warn!(%key, "idempotency lock dropped without a terminal record; releasing as FAILED");
        tokio::spawn(async move {
            let _ = store
                .release_lock(
                    &key,
                    &lock_token,
                    true,
                    Some("CONNECTION_ABORTED".to_string()),
                    Some("handler future was dropped before completion".to_string()),
                    now_ms(),
                )
                .await;
        });
    }
}

/// The axum middleware function, installed with
/// `axum::middleware::from_fn_with_state(state, idempotency_layer)`.
pub async fn idempotency_layer(State(state): State<IdempotencyState>, request: Request, next: Next) -> Response {
    let config = state.config.clone();

    if !config.applies_to(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let raw_key = match request.headers().get(&config.key_header).and_then(|v| v.to_str().ok()) {
        Some(k) => k.to_string(),
        None => {
            if config.require_key {
                return error_response(StatusCode::BAD_REQUEST, "MISSING_IDEMPOTENCY_KEY", "Idempotency key header is required");
            }
            return next.run(request).await;
        }
    };

    let key = match IdempotencyKey::new(&raw_key, &config.key_prefix, config.max_key_length) {
        Ok(k) => k,
        Err(err) => return error_to_response(&err),
    };

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let client_id = client_ip(request.headers());
    let fingerprint_headers = filtered_headers(request.headers(), &config.fingerprint_headers);

    let (parts, body) = request.into_parts();
    let body_bytes = match to_bytes(body, config.max_request_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "INVALID_KEY_FORMAT", "request body exceeds the configured limit"),
    };
    let body_value = body_value_for_hashing(&body_bytes);
    let request_hash = request_fingerprint(&method, &path, &fingerprint_headers, body_value.as_ref());

    let meta = RecordMeta { endpoint: Some(path.clone()), method: Some(method.clone()), client_id };

    let mut lock = match state
        .store
        .start_processing(key.as_str(), &request_hash, config.lock_timeout_ms, config.default_ttl_ms, meta.clone(), now_ms())
        .await
    {
        Ok(lock) => lock,
        Err(err) => return error_to_response(&err),
    };

    if !lock.acquired {
        if lock.request_mismatch {
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, "REQUEST_MISMATCH", "Idempotency-Key was reused with a different request");
        }
        if lock.existing_status == Some(RecordStatus::Completed) {
            let response = lock.existing_response.take().expect("COMPLETED replay always carries a response");
            return replay_response(response, &config.replay_header);
        }

        // PROCESSING elsewhere: reject or wait.
        return match config.concurrent_request_handling {
            ConcurrentRequestHandling::Reject => concurrent_request_response(config.lock_timeout_ms),
            ConcurrentRequestHandling::Wait => {
                wait_for_peer(&state, key.as_str(), &request_hash, &config).await
            }
        };
    }

    let lock_token = lock.lock_token.clone().expect("acquired implies a lock token");
    let mut guard = LockGuard::new(state.store.clone(), key.as_str().to_string(), lock_token.clone());

    let request = Request::from_parts(parts, Body::from(body_bytes));
    let response = next.run(request).await;
    let (resp_parts, resp_body) = response.into_parts();
    let resp_bytes = match to_bytes(resp_body, config.max_response_size + 1).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to buffer handler response for idempotency recording");
            // Correctness of the caller-visible response outranks storage
            // bookkeeping: release the lock and return an opaque 500 rather
            // than silently dropping the response.
            guard.disarm();
            drop(guard);
            let store = state.store.clone();
            tokio::spawn(async move {
                let _ = store.release_lock(key.as_str(), &lock_token, true, None, None, now_ms()).await;
            });
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mark_failed = resp_parts.status.as_u16() >= 500;
    let envelope = ResponseEnvelope {
        body: resp_bytes.to_vec(),
        status_code: resp_parts.status.as_u16(),
        content_type: resp_parts
            .headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        headers: filtered_headers(&resp_parts.headers, &config.captured_response_headers),
    };

    match state
        .store
        .record(key.as_str(), &lock_token, envelope, mark_failed, None, None, config.default_ttl_ms, config.max_response_size, now_ms())
        .await
    {
        Ok(_) => {
            debug!(key = key.as_str(), mark_failed, "idempotency record committed");
            guard.disarm();
        }
        Err(err) => {
            // The record write failed, so the lock must still be released here rather
            // than left for the caller to fight with a PROCESSING record for the rest
            // of its TTL. Release explicitly instead of relying on the guard's Drop,
            // so the release carries the real failure reason.
            warn!(key = key.as_str(), error = %err, "failed to record idempotency response; releasing lock so retries aren't blocked");
            guard.disarm();
            drop(guard);
            let store = state.store.clone();
            let key_owned = key.clone();
            let lock_token_owned = lock_token.clone();
            let message = err.to_string();
            tokio::spawn(async move {
                let _ = store
                    .release_lock(key_owned.as_str(), &lock_token_owned, true, Some("RECORD_WRITE_FAILED".to_string()), Some(message), now_ms())
                    .await;
            });
        }
    }

    Response::from_parts(resp_parts, Body::from(resp_bytes))
}

async fn wait_for_peer(state: &IdempotencyState, key: &str, request_hash: &str, config: &MiddlewareConfig) -> Response {
    let deadline = now_ms().saturating_add(config.max_wait_time_ms);
    loop {
        if now_ms() >= deadline {
            return error_response(StatusCode::REQUEST_TIMEOUT, "TIMEOUT", "timed out waiting for the in-flight request to complete");
        }

        tokio::time::sleep(Duration::from_millis(config.retry_interval_ms)).await;

        let checked = match state.store.check(key, request_hash, now_ms()).await {
            Ok(checked) => checked,
            Err(err) => return error_to_response(&err),
        };

        if checked.found && checked.request_mismatch {
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, "REQUEST_MISMATCH", "Idempotency-Key was reused with a different request");
        }

        if !checked.found {
            // The peer's record vanished (expired or cleaned up) before it
            // terminated; give this caller a fresh shot at acquiring the lock.
            return retry_acquisition(state, key, request_hash, config).await;
        }

        match checked.status {
            Some(RecordStatus::Completed) => {
                let response = checked.response.expect("COMPLETED check always carries a response");
                return replay_response(response, &config.replay_header);
            }
            Some(RecordStatus::Failed) => {
                if config.wait_on_failed_replays {
                    if let Some(response) = checked.response {
                        return replay_response(response, &config.replay_header);
                    }
                }
                return concurrent_request_response(config.lock_timeout_ms);
            }
            _ => continue,
        }
    }
}

async fn retry_acquisition(state: &IdempotencyState, key: &str, request_hash: &str, config: &MiddlewareConfig) -> Response {
    match state
        .store
        .start_processing(key, request_hash, config.lock_timeout_ms, config.default_ttl_ms, RecordMeta::default(), now_ms())
        .await
    {
        Ok(lock) if lock.acquired => {
            // A fresh caller acquired the lock but has no handler response to
            // run here (this is the wait-mode branch, not the acquiring
            // branch) — surface a retriable signal so the client resends.
            let _ = state
                .store
                .release_lock(key, &lock.lock_token.unwrap_or_default(), false, None, None, now_ms())
                .await;
            concurrent_request_response(config.lock_timeout_ms)
        }
        Ok(_) => concurrent_request_response(config.lock_timeout_ms),
        Err(err) => error_to_response(&err),
    }
}

fn replay_response(envelope: ResponseEnvelope, replay_header: &str) -> Response {
    let mut builder = Response::builder().status(envelope.status_code);
    if let Some(content_type) = &envelope.content_type {
        builder = builder.header(axum::http::header::CONTENT_TYPE, content_type);
    }
    for (name, value) in &envelope.headers {
        builder = builder.header(name, value);
    }
    builder = builder.header(replay_header, "true");
    builder.body(Body::from(envelope.body)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn concurrent_request_response(retry_after_ms: u64) -> Response {
    let mut response = error_response(StatusCode::CONFLICT, "CONCURRENT_REQUEST", "a request with this idempotency key is already in flight");
    let retry_after_secs = retry_after_ms.div_ceil(1000).max(1);
    response.headers_mut().insert(
        axum::http::header::RETRY_AFTER,
        HeaderValue::from_str(&retry_after_secs.to_string()).unwrap_or_else(|_| HeaderValue::from_static("1")),
    );
    response
}

fn error_to_response(err: &IdempotencyError) -> Response {
    let status = StatusCode::from_u16(err.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = error_response(status, err.code(), &err.to_string());
    if let Some(retry_after_ms) = err.retry_after_ms() {
        let retry_after_secs = retry_after_ms.div_ceil(1000).max(1);
        response.headers_mut().insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from_str(&retry_after_secs.to_string()).unwrap_or_else(|_| HeaderValue::from_static("1")),
        );
    }
    response
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, axum::Json(serde_json::json!({ "error": code, "message": message }))).into_response()
}

fn filtered_headers(headers: &HeaderMap, allow_list: &[String]) -> BTreeMap<String, String> {
    allow_list
        .iter()
        .filter_map(|name| headers.get(name).and_then(|v| v.to_str().ok()).map(|v| (name.to_ascii_lowercase(), v.to_string())))
        .collect()
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
}

/// Best-effort JSON parse of the request body for fingerprinting. Bodies
/// that aren't valid JSON still participate in the hash — as the SHA-256 of
/// their raw bytes — rather than being silently excluded, so two distinct
/// non-JSON bodies never collapse onto the same fingerprint.
fn body_value_for_hashing(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => Some(value),
        Err(_) => Some(Value::String(sha256_hex(body))),
    }
}
