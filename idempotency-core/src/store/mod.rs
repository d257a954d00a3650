pub mod memory;
pub mod redis_kv;
pub mod sql;

use async_trait::async_trait;
use idempotency_common::{Record, RecordMeta, RecordStatus, ResponseEnvelope, Result};

/// Result of [`Store::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub found: bool,
    pub status: Option<RecordStatus>,
    pub response: Option<ResponseEnvelope>,
    pub request_mismatch: bool,
    pub created_at: Option<u64>,
    pub updated_at: Option<u64>,
}

impl CheckResult {
    pub fn not_found() -> Self {
        Self { found: false, status: None, response: None, request_mismatch: false, created_at: None, updated_at: None }
    }
}

/// Result of [`Store::start_processing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResult {
    pub acquired: bool,
    pub lock_token: Option<String>,
    pub lock_expires_at: Option<u64>,
    pub request_mismatch: bool,
    pub existing_status: Option<RecordStatus>,
    pub existing_response: Option<ResponseEnvelope>,
}

impl LockResult {
    pub fn acquired(lock_token: String, lock_expires_at: u64) -> Self {
        Self {
            acquired: true,
            lock_token: Some(lock_token),
            lock_expires_at: Some(lock_expires_at),
            request_mismatch: false,
            existing_status: None,
            existing_response: None,
        }
    }

    pub fn mismatch(existing_status: RecordStatus) -> Self {
        Self {
            acquired: false,
            lock_token: None,
            lock_expires_at: None,
            request_mismatch: true,
            existing_status: Some(existing_status),
            existing_response: None,
        }
    }

    pub fn replay(existing_status: RecordStatus, existing_response: Option<ResponseEnvelope>) -> Self {
        Self {
            acquired: false,
            lock_token: None,
            lock_expires_at: None,
            request_mismatch: false,
            existing_status: Some(existing_status),
            existing_response,
        }
    }

    pub fn contended() -> Self {
        Self {
            acquired: false,
            lock_token: None,
            lock_expires_at: None,
            request_mismatch: false,
            existing_status: Some(RecordStatus::Processing),
            existing_response: None,
        }
    }
}

/// Result of [`Store::release_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseResult {
    pub released: bool,
}

/// Result of [`Store::extend_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendResult {
    pub extended: bool,
    pub lock_expires_at: Option<u64>,
}

/// Result of [`Store::cleanup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupResult {
    pub deleted_count: u64,
    pub scanned_count: u64,
    pub next_expiration_estimate_ms: Option<u64>,
}

/// Parameters accepted by [`Store::cleanup`]. Grouped into a struct since most
/// fields are optional filters layered onto the base "past its TTL" sweep.
#[derive(Debug, Clone, Default)]
pub struct CleanupRequest {
    pub batch_size: usize,
    pub max_records: Option<u64>,
    pub key_prefix: Option<String>,
    pub client_id: Option<String>,
    pub force_before: Option<u64>,
    pub dry_run: bool,
}

/// The central contract every storage backend satisfies.
///
/// All six operations below are atomic with respect to any other operation on
/// the same `key`: two concurrent callers racing on `start_processing` see a
/// linearized outcome — exactly one observes `acquired=true`. Implementors
/// must never expose a native backend error type to callers; everything is
/// mapped into [`idempotency_common::IdempotencyError::StorageError`] at the
/// boundary.
#[async_trait]
pub trait Store: Send + Sync {
    async fn check(&self, key: &str, request_hash: &str, now_ms: u64) -> Result<CheckResult>;

    async fn start_processing(
        &self,
        key: &str,
        request_hash: &str,
        lock_ttl_ms: u64,
        record_ttl_ms: u64,
        meta: RecordMeta,
        now_ms: u64,
    ) -> Result<LockResult>;

    async fn record(
        &self,
        key: &str,
        lock_token: &str,
        response: ResponseEnvelope,
        mark_failed: bool,
        error_code: Option<String>,
        error_message: Option<String>,
        ttl_ms: u64,
        max_response_size: usize,
        now_ms: u64,
    ) -> Result<Record>;

    async fn release_lock(
        &self,
        key: &str,
        lock_token: &str,
        mark_failed: bool,
        error_code: Option<String>,
        error_message: Option<String>,
        now_ms: u64,
    ) -> Result<ReleaseResult>;

    async fn extend_lock(&self, key: &str, lock_token: &str, extension_ms: u64, now_ms: u64) -> Result<ExtendResult>;

    async fn cleanup(&self, request: CleanupRequest, now_ms: u64) -> Result<CleanupResult>;

    /// Non-destructive liveness probe.
    async fn health_check(&self) -> Result<()>;

    /// Release backend resources (connection pools, background timers). Safe
    /// to call more than once.
    async fn close(&self) -> Result<()>;
}
