use idempotency_common::{generate_lock_token, IdempotencyError, Record, RecordMeta, RecordStatus, ResponseEnvelope, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};

use crate::store::{CheckResult, CleanupRequest, CleanupResult, ExtendResult, LockResult, ReleaseResult, Store};

/// Remote KV backend. Every write compiles to one Lua script so the
/// read-modify-write sequence is atomic in the store itself; `redis::Script`
/// caches scripts by their SHA1 and transparently falls back from `EVALSHA`
/// to `EVAL` on a `NOSCRIPT` reply, so there is no manual script-loading path
/// to maintain here.
pub struct RedisStore {
    conn: ConnectionManager,
    key_namespace: String,
}

/// `KEYS[1]` = storage key. `ARGV[1]` = request_hash, `ARGV[2]` = now_ms,
/// `ARGV[3]` = lock_ttl_ms, `ARGV[4]` = record_ttl_ms, `ARGV[5]` = new lock
/// token, `ARGV[6]` = meta JSON. Returns a JSON result object the Rust side
/// decodes into a [`LockResult`].
const START_PROCESSING_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
local now = tonumber(ARGV[2])
local lock_ttl = tonumber(ARGV[3])
local record_ttl = tonumber(ARGV[4])
local token = ARGV[5]

local function fresh(hash, meta)
    local rec = {}
    rec.request_hash = hash
    rec.status = 'PROCESSING'
    rec.response = cjson.null
    rec.error = cjson.null
    rec.meta = cjson.decode(meta)
    rec.created_at = now
    rec.updated_at = now
    rec.completed_at = cjson.null
    rec.expires_at = now + record_ttl
    rec.lock_token = token
    rec.lock_expires_at = now + lock_ttl
    return rec
end

if not raw then
    local rec = fresh(ARGV[1], ARGV[6])
    redis.call('SET', KEYS[1], cjson.encode(rec))
    redis.call('PEXPIREAT', KEYS[1], rec.expires_at)
    return cjson.encode({acquired=true, lock_token=token, lock_expires_at=rec.lock_expires_at})
end

local rec = cjson.decode(raw)
if rec.expires_at <= now then
    local fresh_rec = fresh(ARGV[1], ARGV[6])
    redis.call('SET', KEYS[1], cjson.encode(fresh_rec))
    redis.call('PEXPIREAT', KEYS[1], fresh_rec.expires_at)
    return cjson.encode({acquired=true, lock_token=token, lock_expires_at=fresh_rec.lock_expires_at})
end

if rec.request_hash ~= ARGV[1] then
    return cjson.encode({acquired=false, request_mismatch=true, existing_status=rec.status})
end

if rec.status == 'COMPLETED' then
    return cjson.encode({acquired=false, existing_status=rec.status, existing_response=rec.response})
end

if rec.status == 'PROCESSING' and rec.lock_expires_at > now then
    return cjson.encode({acquired=false, existing_status='PROCESSING'})
end

-- PROCESSING with an expired lock, or FAILED: takeover.
rec.status = 'PROCESSING'
rec.lock_token = token
rec.lock_expires_at = now + lock_ttl
rec.expires_at = now + record_ttl
rec.updated_at = now
redis.call('SET', KEYS[1], cjson.encode(rec))
redis.call('PEXPIREAT', KEYS[1], rec.expires_at)
return cjson.encode({acquired=true, lock_token=token, lock_expires_at=rec.lock_expires_at})
"#;

/// `ARGV[1]` = lock_token, `ARGV[2]` = response JSON, `ARGV[3]` = mark_failed
/// ("1"/"0"), `ARGV[4]` = error JSON or empty string, `ARGV[5]` = ttl_ms,
/// `ARGV[6]` = now_ms. Returns the updated record JSON, or an error marker.
const RECORD_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return cjson.encode({error='NOT_FOUND'})
end
local rec = cjson.decode(raw)
if rec.lock_token ~= ARGV[1] then
    return cjson.encode({error='LOCK_MISMATCH'})
end

local now = tonumber(ARGV[6])
rec.status = (ARGV[3] == '1') and 'FAILED' or 'COMPLETED'
rec.response = cjson.decode(ARGV[2])
if ARGV[4] ~= '' then
    rec.error = cjson.decode(ARGV[4])
else
    rec.error = cjson.null
end
rec.updated_at = now
rec.completed_at = now
rec.expires_at = now + tonumber(ARGV[5])
rec.lock_token = cjson.null
rec.lock_expires_at = cjson.null

redis.call('SET', KEYS[1], cjson.encode(rec))
redis.call('PEXPIREAT', KEYS[1], rec.expires_at)
return cjson.encode({record=rec})
"#;

/// `ARGV[1]` = lock_token, `ARGV[2]` = mark_failed, `ARGV[3]` = error JSON or
/// empty, `ARGV[4]` = now_ms.
const RELEASE_LOCK_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return cjson.encode({released=false})
end
local rec = cjson.decode(raw)
if rec.lock_token ~= ARGV[1] then
    return cjson.encode({error='LOCK_MISMATCH'})
end

if ARGV[2] == '1' then
    local now = tonumber(ARGV[4])
    rec.status = 'FAILED'
    if ARGV[3] ~= '' then
        rec.error = cjson.decode(ARGV[3])
    end
    rec.updated_at = now
    rec.lock_token = cjson.null
    rec.lock_expires_at = cjson.null
    redis.call('SET', KEYS[1], cjson.encode(rec))
else
    redis.call('DEL', KEYS[1])
end
return cjson.encode({released=true})
"#;

/// `ARGV[1]` = lock_token, `ARGV[2]` = extension_ms, `ARGV[3]` = now_ms.
const EXTEND_LOCK_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return cjson.encode({error='NOT_FOUND'})
end
local rec = cjson.decode(raw)
if rec.lock_token ~= ARGV[1] then
    return cjson.encode({error='LOCK_MISMATCH'})
end
local now = tonumber(ARGV[3])
if rec.status ~= 'PROCESSING' or rec.lock_expires_at <= now then
    return cjson.encode({error='LOCK_EXPIRED'})
end
rec.lock_expires_at = now + tonumber(ARGV[2])
rec.updated_at = now
redis.call('SET', KEYS[1], cjson.encode(rec))
return cjson.encode({extended=true, lock_expires_at=rec.lock_expires_at})
"#;

impl RedisStore {
    pub async fn connect(redis_url: &str, key_namespace: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| IdempotencyError::StorageError(e.to_string()))?;
        let conn = ConnectionManager::new(client).await.map_err(|e| IdempotencyError::StorageError(e.to_string()))?;
        Ok(Self { conn, key_namespace: key_namespace.into() })
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{{{}}}", self.key_namespace, key)
    }
}

fn storage_err(e: redis::RedisError) -> IdempotencyError {
    IdempotencyError::StorageError(e.to_string())
}

fn serialization_err(e: serde_json::Error) -> IdempotencyError {
    IdempotencyError::SerializationError(e.to_string())
}

#[async_trait::async_trait]
impl Store for RedisStore {
    async fn check(&self, key: &str, request_hash: &str, now_ms: u64) -> Result<CheckResult> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.storage_key(key)).await.map_err(storage_err)?;
        let Some(raw) = raw else { return Ok(CheckResult::not_found()) };

        let record: Record = serde_json::from_str(&raw).map_err(serialization_err)?;
        if record.is_expired(now_ms) {
            return Ok(CheckResult::not_found());
        }

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
            response: record.response,
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
        let token = generate_lock_token();
        let meta_json = serde_json::to_string(&meta).map_err(serialization_err)?;
        let mut conn = self.conn.clone();

        let raw: String = Script::new(START_PROCESSING_SCRIPT)
            .key(self.storage_key(key))
            .arg(request_hash)
            .arg(now_ms)
            .arg(lock_ttl_ms)
            .arg(record_ttl_ms)
            .arg(&token)
            .arg(meta_json)
            .invoke_async(&mut conn)
            .await
            .map_err(storage_err)?;

        let value: serde_json::Value = serde_json::from_str(&raw).map_err(serialization_err)?;
        let acquired = value["acquired"].as_bool().unwrap_or(false);

        if acquired {
            return Ok(LockResult::acquired(
                value["lock_token"].as_str().unwrap_or(&token).to_string(),
                value["lock_expires_at"].as_u64().unwrap_or(0),
            ));
        }
        if value["request_mismatch"].as_bool().unwrap_or(false) {
            let status = parse_status(value["existing_status"].as_str());
            return Ok(LockResult::mismatch(status));
        }
        let status = parse_status(value["existing_status"].as_str());
        if status == RecordStatus::Completed {
            let response = serde_json::from_value(value["existing_response"].clone()).ok();
            return Ok(LockResult::replay(status, response));
        }
        Ok(LockResult::contended())
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

        let response_json = serde_json::to_string(&response).map_err(serialization_err)?;
        let error_json = match (&error_code, &error_message) {
            (Some(code), msg) => serde_json::to_string(&serde_json::json!({
                "error_code": code,
                "error_message": msg.clone().unwrap_or_default(),
            }))
            .map_err(serialization_err)?,
            _ => String::new(),
        };

        let mut conn = self.conn.clone();
        let raw: String = Script::new(RECORD_SCRIPT)
            .key(self.storage_key(key))
            .arg(lock_token)
            .arg(response_json)
            .arg(if mark_failed { "1" } else { "0" })
            .arg(error_json)
            .arg(ttl_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(storage_err)?;

        let value: serde_json::Value = serde_json::from_str(&raw).map_err(serialization_err)?;
        match value["error"].as_str() {
            Some("NOT_FOUND") => Err(IdempotencyError::RecordNotFound),
            Some("LOCK_MISMATCH") => Err(IdempotencyError::LockAcquisitionFailed),
            _ => serde_json::from_value(value["record"].clone()).map_err(serialization_err),
        }
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
        let error_json = match (&error_code, &error_message) {
            (Some(code), msg) => serde_json::to_string(&serde_json::json!({
                "error_code": code,
                "error_message": msg.clone().unwrap_or_default(),
            }))
            .map_err(serialization_err)?,
            _ => String::new(),
        };

        let mut conn = self.conn.clone();
        let raw: String = Script::new(RELEASE_LOCK_SCRIPT)
            .key(self.storage_key(key))
            .arg(lock_token)
            .arg(if mark_failed { "1" } else { "0" })
            .arg(error_json)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(storage_err)?;

        let value: serde_json::Value = serde_json::from_str(&raw).map_err(serialization_err)?;
        if value["error"].as_str() == Some("LOCK_MISMATCH") {
            return Err(IdempotencyError::LockAcquisitionFailed);
        }
        Ok(ReleaseResult { released: value["released"].as_bool().unwrap_or(false) })
    }

    async fn extend_lock(&self, key: &str, lock_token: &str, extension_ms: u64, now_ms: u64) -> Result<ExtendResult> {
        let mut conn = self.conn.clone();
        let raw: String = Script::new(EXTEND_LOCK_SCRIPT)
            .key(self.storage_key(key))
            .arg(lock_token)
            .arg(extension_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(storage_err)?;

        let value: serde_json::Value = serde_json::from_str(&raw).map_err(serialization_err)?;
        match value["error"].as_str() {
            Some("NOT_FOUND") => Err(IdempotencyError::RecordNotFound),
            Some("LOCK_MISMATCH") => Err(IdempotencyError::LockAcquisitionFailed),
            Some("LOCK_EXPIRED") => Err(IdempotencyError::LockExpired),
            _ => Ok(ExtendResult {
                extended: true,
                lock_expires_at: value["lock_expires_at"].as_u64(),
            }),
        }
    }

    async fn cleanup(&self, request: CleanupRequest, now_ms: u64) -> Result<CleanupResult> {
        // Redis already expires keys natively via PEXPIREAT; this sweep exists
        // for the prefix/client_id-scoped bookkeeping the native TTL can't
        // express, and to report counts back to the caller.
        let mut conn = self.conn.clone();
        let pattern = format!("{}{{{}*}}", self.key_namespace, request.key_prefix.clone().unwrap_or_default());

        let mut cursor: u64 = 0;
        let mut scanned_count = 0u64;
        let mut deleted_count = 0u64;
        let mut next_expiration_estimate_ms: Option<u64> = None;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(request.batch_size.max(1) as i64)
                .query_async(&mut conn)
                .await
                .map_err(storage_err)?;
            cursor = next_cursor;

            for storage_key in &keys {
                scanned_count += 1;
                let raw: Option<String> = conn.get(storage_key).await.map_err(storage_err)?;
                let Some(raw) = raw else { continue };
                let Ok(record) = serde_json::from_str::<Record>(&raw) else { continue };

                let past_ttl = record.is_expired(now_ms)
                    || request.force_before.map(|cutoff| record.created_at < cutoff).unwrap_or(false);
                let client_ok = request
                    .client_id
                    .as_ref()
                    .map(|c| record.meta.client_id.as_deref() == Some(c.as_str()))
                    .unwrap_or(true);

                if past_ttl && client_ok {
                    if !request.dry_run {
                        let _: () = conn.del(storage_key).await.map_err(storage_err)?;
                    }
                    deleted_count += 1;
                    if let Some(max) = request.max_records {
                        if deleted_count >= max {
                            return Ok(CleanupResult { deleted_count, scanned_count, next_expiration_estimate_ms });
                        }
                    }
                } else {
                    next_expiration_estimate_ms =
                        Some(next_expiration_estimate_ms.map_or(record.expires_at, |cur| cur.min(record.expires_at)));
                }
            }

            if cursor == 0 {
                break;
            }
        }

        debug!(deleted_count, scanned_count, "redis store cleanup pass complete");
        Ok(CleanupResult { deleted_count, scanned_count, next_expiration_estimate_ms })
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(storage_err)?;
        if pong != "PONG" {
            warn!(%pong, "unexpected PING reply from redis");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager has no explicit teardown; dropping the last
        // handle closes the underlying connection.
        Ok(())
    }
}

fn parse_status(raw: Option<&str>) -> RecordStatus {
    match raw {
        Some("COMPLETED") => RecordStatus::Completed,
        Some("FAILED") => RecordStatus::Failed,
        _ => RecordStatus::Processing,
    }
}
