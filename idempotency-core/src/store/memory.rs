use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use idempotency_common::{
    generate_lock_token, ErrorInfo, IdempotencyError, Record, RecordMeta, RecordStatus, ResponseEnvelope, Result,
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::store::{CheckResult, CleanupRequest, CleanupResult, ExtendResult, LockResult, ReleaseResult, Store};

/// In-process backend: a single map guarded by one async lock, mirroring the
/// teacher's `AppState`/`DbState` shape. Appropriate for a single server
/// instance or tests; offers no cross-process durability.
pub struct MemoryStore {
    records: RwLock<HashMap<String, Record>>,
    clock: Arc<dyn Clock>,
    max_records: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { records: RwLock::new(HashMap::new()), clock, max_records: None }
    }

    /// Bound the table size; once reached, the oldest record by `created_at`
    /// is evicted to make room for a new key (LRU-by-creation, per §4.2).
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        self
    }

    fn live(record: &Record, now_ms: u64) -> bool {
        !record.is_expired(now_ms)
    }

    async fn evict_oldest_if_full(&self, table: &mut HashMap<String, Record>) {
        let Some(limit) = self.max_records else { return };
        if table.len() < limit {
            return;
        }
        if let Some(oldest_key) = table.iter().min_by_key(|(_, r)| r.created_at).map(|(k, _)| k.clone()) {
            debug!(key = %oldest_key, "evicting oldest idempotency record to respect max_records");
            table.remove(&oldest_key);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn check(&self, key: &str, request_hash: &str, now_ms: u64) -> Result<CheckResult> {
        let table = self.records.read().await;
        let Some(record) = table.get(key).filter(|r| Self::live(r, now_ms)) else {
            return Ok(CheckResult::not_found());
        };

        if record.request_hash != request_hash {
            return Ok(CheckResult {
                found: true,
                status: Some(record.status),
                response: None,
                request_mismatch: true,
                created_at: Some(record.created_at),
                updated_at: Some(record.updated_at),
            });
        }

        Ok(CheckResult {
            found: true,
            status: Some(record.status),
            response: record.response.clone(),
            request_mismatch: false,
            created_at: Some(record.created_at),
            updated_at: Some(record.updated_at),
        })
    }

    async fn start_processing(
        &self,
        key: &str,
        request_hash: &str,
        lock_ttl_ms: u64,
        record_ttl_ms: u64,
        meta: RecordMeta,
        now_ms: u64,
    ) -> Result<LockResult> {
        let mut table = self.records.write().await;

        let existing = table.get(key).filter(|r| Self::live(r, now_ms));
        match existing {
            None => {
                self.evict_oldest_if_full(&mut table).await;
                let token = generate_lock_token();
                let record = Record::new_processing(
                    key.to_string(),
                    request_hash.to_string(),
                    token.clone(),
                    meta,
                    now_ms,
                    lock_ttl_ms,
                    record_ttl_ms,
                );
                let lock_expires_at = record.lock_expires_at.unwrap();
                table.insert(key.to_string(), record);
                Ok(LockResult::acquired(token, lock_expires_at))
            }
            Some(record) if record.request_hash != request_hash => Ok(LockResult::mismatch(record.status)),
            Some(record) if record.status == RecordStatus::Completed => {
                Ok(LockResult::replay(record.status, record.response.clone()))
            }
            Some(record) if record.has_live_lock(now_ms) => Ok(LockResult::contended()),
            Some(_) => {
                // PROCESSING with an expired lock, or FAILED: takeover.
                debug!(%key, "taking over lock: previous holder's lease expired or it failed");
                let token = generate_lock_token();
                let record = table.get_mut(key).expect("checked above");
                record.status = RecordStatus::Processing;
                record.request_hash = request_hash.to_string();
                record.lock_token = Some(token.clone());
                record.lock_expires_at = Some(now_ms.saturating_add(lock_ttl_ms));
                record.expires_at = now_ms.saturating_add(record_ttl_ms);
                record.updated_at = now_ms;
                let lock_expires_at = record.lock_expires_at.unwrap();
                Ok(LockResult::acquired(token, lock_expires_at))
            }
        }
    }

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
    ) -> Result<Record> {
        let envelope_len = response.serialized_len();
        if envelope_len > max_response_size {
            return Err(IdempotencyError::ResponseTooLarge { max: max_response_size, actual: envelope_len });
        }

        let mut table = self.records.write().await;
        let record = table.get_mut(key).ok_or(IdempotencyError::RecordNotFound)?;

        if record.lock_token.as_deref() != Some(lock_token) {
            return Err(IdempotencyError::LockAcquisitionFailed);
        }

        let error = error_code.map(|code| ErrorInfo {
            error_code: code,
            error_message: error_message.unwrap_or_default(),
        });
        record.complete(response, error, mark_failed, now_ms, ttl_ms);
        Ok(record.clone())
    }

    async fn release_lock(
        &self,
        key: &str,
        lock_token: &str,
        mark_failed: bool,
        error_code: Option<String>,
        error_message: Option<String>,
        now_ms: u64,
    ) -> Result<ReleaseResult> {
        let mut table = self.records.write().await;
        let Some(record) = table.get_mut(key) else {
            return Ok(ReleaseResult { released: false });
        };
        if record.lock_token.as_deref() != Some(lock_token) {
            return Err(IdempotencyError::LockAcquisitionFailed);
        }

        if mark_failed {
            let error = error_code.map(|code| ErrorInfo {
                error_code: code,
                error_message: error_message.unwrap_or_default(),
            });
            record.status = RecordStatus::Failed;
            record.error = error;
            record.updated_at = now_ms;
            record.lock_token = None;
            record.lock_expires_at = None;
        } else {
            table.remove(key);
        }
        Ok(ReleaseResult { released: true })
    }

    async fn extend_lock(&self, key: &str, lock_token: &str, extension_ms: u64, now_ms: u64) -> Result<ExtendResult> {
        let mut table = self.records.write().await;
        let record = table.get_mut(key).ok_or(IdempotencyError::RecordNotFound)?;

        if record.lock_token.as_deref() != Some(lock_token) {
            return Err(IdempotencyError::LockAcquisitionFailed);
        }
        if !record.has_live_lock(now_ms) {
            return Err(IdempotencyError::LockExpired);
        }

        let new_deadline = now_ms.saturating_add(extension_ms);
        record.lock_expires_at = Some(new_deadline);
        record.updated_at = now_ms;
        Ok(ExtendResult { extended: true, lock_expires_at: Some(new_deadline) })
    }

    async fn cleanup(&self, request: CleanupRequest, now_ms: u64) -> Result<CleanupResult> {
        let mut table = self.records.write().await;

        let candidates: Vec<String> = table
            .iter()
            .filter(|(_, r)| {
                let past_ttl = r.is_expired(now_ms)
                    || request.force_before.map(|cutoff| r.created_at < cutoff).unwrap_or(false);
                let prefix_ok = request.key_prefix.as_ref().map(|p| r.key.starts_with(p)).unwrap_or(true);
                let client_ok = request
                    .client_id
                    .as_ref()
                    .map(|c| r.meta.client_id.as_deref() == Some(c.as_str()))
                    .unwrap_or(true);
                past_ttl && prefix_ok && client_ok
            })
            .map(|(k, _)| k.clone())
            .collect();

        let scanned_count = table.len() as u64;

        // `batch_size` bounds each internal chunk, not the overall result: walk the
        // whole candidate set in chunks so a single call still deletes everything
        // eligible, only stopping early once `max_records` (if set) is hit.
        let chunk_size = request.batch_size.max(1);
        let mut deleted_count = 0u64;
        for chunk in candidates.chunks(chunk_size) {
            for key in chunk {
                if let Some(max) = request.max_records {
                    if deleted_count >= max {
                        break;
                    }
                }
                if !request.dry_run {
                    table.remove(key);
                }
                deleted_count += 1;
            }
            if let Some(max) = request.max_records {
                if deleted_count >= max {
                    break;
                }
            }
        }

        let next_expiration_estimate_ms = table
            .values()
            .filter(|r| r.status != RecordStatus::Processing || r.has_live_lock(now_ms))
            .map(|r| r.expires_at)
            .min();

        debug!(deleted_count, scanned_count, "memory store cleanup pass complete");

        Ok(CleanupResult { deleted_count, scanned_count, next_expiration_estimate_ms })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
