use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Centralised here so every backend and test measures "now" the same way;
/// `Store` implementations that need a mockable clock (see
/// `idempotency-core::MemoryStore`) take one as a collaborator instead of
/// calling this directly.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `now + ttl_ms`, saturating rather than overflowing on pathological TTLs.
pub fn expires_at(now_ms: u64, ttl_ms: u64) -> u64 {
    now_ms.saturating_add(ttl_ms)
}

/// `true` iff `now_ms >= deadline_ms`.
pub fn is_expired(now_ms: u64, deadline_ms: u64) -> bool {
    now_ms >= deadline_ms
}

/// The lifecycle state of a [`Record`], per the state machine in SPEC_FULL.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    Processing,
    Completed,
    Failed,
}

/// A self-describing, byte-exact capture of an HTTP response.
///
/// The serializer round-trips: `parse(serialize(r)) == r` for any envelope
/// this subsystem produces. Absence is modelled with `Option` fields skipped
/// on serialization, giving exactly one wire representation for "no value"
/// (never a separate `null`-vs-absent distinction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Raw response body bytes, exactly as sent to the original caller.
    pub body: Vec<u8>,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content_type: Option<String>,
    /// Only the headers the middleware was configured to capture; not
    /// necessarily every header the original handler set.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ResponseEnvelope {
    pub fn serialized_len(&self) -> usize {
        // Matches what a backend actually persists: the JSON envelope, not
        // just the raw body, since `max_response_size` bounds storage cost.
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(self.body.len())
    }
}

/// Failure context captured when a record transitions to `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error_code: String,
    pub error_message: String,
}

/// Metadata attached at `start_processing` time; informational only, never
/// part of the request hash unless a backend is explicitly configured to do so.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<String>,
}

/// The persisted state associated with one idempotency key.
///
/// Owned by the `Store`; callers only ever see owned copies returned from
/// store operations, never a live handle into backend state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub request_hash: String,
    pub status: RecordStatus,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response: Option<ResponseEnvelope>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ErrorInfo>,

    pub meta: RecordMeta,

    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<u64>,
    pub expires_at: u64,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lock_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lock_expires_at: Option<u64>,
}

impl Record {
    /// Construct a brand-new `PROCESSING` record, as `start_processing` does
    /// on first acquisition.
    pub fn new_processing(
        key: String,
        request_hash: String,
        lock_token: String,
        meta: RecordMeta,
        now: u64,
        lock_ttl_ms: u64,
        record_ttl_ms: u64,
    ) -> Self {
        Self {
            key,
            request_hash,
            status: RecordStatus::Processing,
            response: None,
            error: None,
            meta,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: expires_at(now, record_ttl_ms),
            lock_token: Some(lock_token),
            lock_expires_at: Some(expires_at(now, lock_ttl_ms)),
        }
    }

    /// `true` iff `now_ms >= self.expires_at` — a logically absent record.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        is_expired(now_ms, self.expires_at)
    }

    /// `true` iff this record is `PROCESSING` and its lock lease has not yet
    /// elapsed — i.e. a genuine concurrent contender, not a takeover target.
    pub fn has_live_lock(&self, now_ms: u64) -> bool {
        self.status == RecordStatus::Processing
            && self.lock_expires_at.map(|deadline| !is_expired(now_ms, deadline)).unwrap_or(false)
    }

    /// Transition this record into a terminal state, recording the response
    /// and clearing the lock fields as the state machine requires.
    pub fn complete(
        &mut self,
        response: ResponseEnvelope,
        error: Option<ErrorInfo>,
        mark_failed: bool,
        now: u64,
        ttl_ms: u64,
    ) {
        self.status = if mark_failed { RecordStatus::Failed } else { RecordStatus::Completed };
        self.response = Some(response);
        self.error = error;
        self.updated_at = now;
        self.completed_at = Some(now);
        self.expires_at = expires_at(now, ttl_ms);
        self.lock_token = None;
        self.lock_expires_at = None;
    }
}
