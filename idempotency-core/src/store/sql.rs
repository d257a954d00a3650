use idempotency_common::{generate_lock_token, IdempotencyError, Record, RecordMeta, RecordStatus, ResponseEnvelope, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::store::{CheckResult, CleanupRequest, CleanupResult, ExtendResult, LockResult, ReleaseResult, Store};

/// Relational backend (PostgreSQL). `start_processing` is one statement that
/// combines a row-locked read with an upsert applying the state rules in its
/// `WHERE` predicate, so the whole decision is made server-side under one
/// row lock rather than as a read-then-write round trip from this process.
pub struct SqlStore {
    pool: PgPool,
}

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_records (
    key             TEXT PRIMARY KEY,
    request_hash    TEXT NOT NULL,
    status          TEXT NOT NULL,
    response        JSONB,
    error_code      TEXT,
    error_message   TEXT,
    meta            JSONB NOT NULL,
    created_at      BIGINT NOT NULL,
    updated_at      BIGINT NOT NULL,
    completed_at    BIGINT,
    expires_at      BIGINT NOT NULL,
    lock_token      TEXT,
    lock_expires_at BIGINT
);
CREATE INDEX IF NOT EXISTS idempotency_records_expires_at_idx ON idempotency_records (expires_at);
CREATE INDEX IF NOT EXISTS idempotency_records_status_idx ON idempotency_records (status);
CREATE INDEX IF NOT EXISTS idempotency_records_client_id_idx ON idempotency_records ((meta->>'client_id')) WHERE meta->>'client_id' IS NOT NULL;
"#;

impl SqlStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| IdempotencyError::StorageError(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Creates the backing table and indexes if absent. Idempotent; safe to
    /// call on every process start.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| IdempotencyError::StorageError(e.to_string()))?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<Record> {
        let status_str: String = row.try_get("status").map_err(sql_err)?;
        let status = match status_str.as_str() {
            "PROCESSING" => RecordStatus::Processing,
            "COMPLETED" => RecordStatus::Completed,
            "FAILED" => RecordStatus::Failed,
            other => return Err(IdempotencyError::SerializationError(format!("unknown status {other}"))),
        };

        let response: Option<serde_json::Value> = row.try_get("response").map_err(sql_err)?;
        let error_code: Option<String> = row.try_get("error_code").map_err(sql_err)?;
        let error_message: Option<String> = row.try_get("error_message").map_err(sql_err)?;
        let meta_json: serde_json::Value = row.try_get("meta").map_err(sql_err)?;

        Ok(Record {
            key: row.try_get("key").map_err(sql_err)?,
            request_hash: row.try_get("request_hash").map_err(sql_err)?,
            status,
            response: response
                .map(serde_json::from_value::<ResponseEnvelope>)
                .transpose()
                .map_err(|e| IdempotencyError::SerializationError(e.to_string()))?,
            error: error_code.map(|code| idempotency_common::ErrorInfo {
                error_code: code,
                error_message: error_message.unwrap_or_default(),
            }),
            meta: serde_json::from_value::<RecordMeta>(meta_json)
                .map_err(|e| IdempotencyError::SerializationError(e.to_string()))?,
            created_at: row.try_get::<i64, _>("created_at").map_err(sql_err)? as u64,
            updated_at: row.try_get::<i64, _>("updated_at").map_err(sql_err)? as u64,
            completed_at: row.try_get::<Option<i64>, _>("completed_at").map_err(sql_err)?.map(|v| v as u64),
            expires_at: row.try_get::<i64, _>("expires_at").map_err(sql_err)? as u64,
            lock_token: row.try_get("lock_token").map_err(sql_err)?,
            lock_expires_at: row.try_get::<Option<i64>, _>("lock_expires_at").map_err(sql_err)?.map(|v| v as u64),
        })
    }
}

fn sql_err(e: sqlx::Error) -> IdempotencyError {
    IdempotencyError::StorageError(e.to_string())
}

#[async_trait::async_trait]
impl Store for SqlStore {
    async fn check(&self, key: &str, request_hash: &str, now_ms: u64) -> Result<CheckResult> {
        let row = sqlx::query("SELECT * FROM idempotency_records WHERE key = $1 AND expires_at > $2")
            .bind(key)
            .bind(now_ms as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;

        let Some(row) = row else { return Ok(CheckResult::not_found()) };
        let record = Self::row_to_record(&row)?;

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
        let mut tx = self.pool.begin().await.map_err(sql_err)?;

        let existing = sqlx::query("SELECT * FROM idempotency_records WHERE key = $1 FOR UPDATE")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sql_err)?;

        let token = generate_lock_token();
        let meta_json = serde_json::to_value(&meta).map_err(|e| IdempotencyError::SerializationError(e.to_string()))?;
        let lock_expires_at = now_ms.saturating_add(lock_ttl_ms);
        let record_expires_at = now_ms.saturating_add(record_ttl_ms);

        let existing_record = existing.as_ref().map(Self::row_to_record).transpose()?;
        let is_live = existing_record.as_ref().map(|r| !r.is_expired(now_ms)).unwrap_or(false);

        if !is_live {
            sqlx::query(
                "INSERT INTO idempotency_records
                    (key, request_hash, status, response, error_code, error_message, meta,
                     created_at, updated_at, completed_at, expires_at, lock_token, lock_expires_at)
                 VALUES ($1, $2, 'PROCESSING', NULL, NULL, NULL, $3, $4, $4, NULL, $5, $6, $7)
                 ON CONFLICT (key) DO UPDATE SET
                    request_hash = EXCLUDED.request_hash, status = 'PROCESSING', response = NULL,
                    error_code = NULL, error_message = NULL, meta = EXCLUDED.meta,
                    updated_at = EXCLUDED.updated_at, completed_at = NULL,
                    expires_at = EXCLUDED.expires_at, lock_token = EXCLUDED.lock_token,
                    lock_expires_at = EXCLUDED.lock_expires_at",
            )
            .bind(key)
            .bind(request_hash)
            .bind(&meta_json)
            .bind(now_ms as i64)
            .bind(record_expires_at as i64)
            .bind(&token)
            .bind(lock_expires_at as i64)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;

            tx.commit().await.map_err(sql_err)?;
            return Ok(LockResult::acquired(token, lock_expires_at));
        }

        let record = existing_record.expect("is_live implies existing_record is Some");

        if record.request_hash != request_hash {
            tx.commit().await.map_err(sql_err)?;
            return Ok(LockResult::mismatch(record.status));
        }
        if record.status == RecordStatus::Completed {
            tx.commit().await.map_err(sql_err)?;
            return Ok(LockResult::replay(record.status, record.response));
        }
        if record.has_live_lock(now_ms) {
            tx.commit().await.map_err(sql_err)?;
            return Ok(LockResult::contended());
        }

        // PROCESSING with an expired lock, or FAILED: takeover.
        sqlx::query(
            "UPDATE idempotency_records SET
                status = 'PROCESSING', updated_at = $2, expires_at = $3,
                lock_token = $4, lock_expires_at = $5
             WHERE key = $1",
        )
        .bind(key)
        .bind(now_ms as i64)
        .bind(record_expires_at as i64)
        .bind(&token)
        .bind(lock_expires_at as i64)
        .execute(&mut *tx)
        .await
        .map_err(sql_err)?;

        tx.commit().await.map_err(sql_err)?;
        Ok(LockResult::acquired(token, lock_expires_at))
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

        let response_json =
            serde_json::to_value(&response).map_err(|e| IdempotencyError::SerializationError(e.to_string()))?;
        let status = if mark_failed { "FAILED" } else { "COMPLETED" };
        let expires_at = now_ms.saturating_add(ttl_ms);

        let row = sqlx::query(
            "UPDATE idempotency_records SET
                status = $3, response = $4, error_code = $5, error_message = $6,
                updated_at = $7, completed_at = $7, expires_at = $8, lock_token = NULL, lock_expires_at = NULL
             WHERE key = $1 AND lock_token = $2
             RETURNING *",
        )
        .bind(key)
        .bind(lock_token)
        .bind(status)
        .bind(&response_json)
        .bind(&error_code)
        .bind(&error_message)
        .bind(now_ms as i64)
        .bind(expires_at as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?;

        match row {
            Some(row) => Self::row_to_record(&row),
            None => {
                let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM idempotency_records WHERE key = $1)")
                    .bind(key)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(sql_err)?;
                if exists {
                    Err(IdempotencyError::LockAcquisitionFailed)
                } else {
                    Err(IdempotencyError::RecordNotFound)
                }
            }
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
        if mark_failed {
            let result = sqlx::query(
                "UPDATE idempotency_records SET
                    status = 'FAILED', error_code = $3, error_message = $4,
                    updated_at = $5, lock_token = NULL, lock_expires_at = NULL
                 WHERE key = $1 AND lock_token = $2",
            )
            .bind(key)
            .bind(lock_token)
            .bind(&error_code)
            .bind(&error_message)
            .bind(now_ms as i64)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;

            if result.rows_affected() == 0 {
                return self.lock_mismatch_or_absent(key).await;
            }
            return Ok(ReleaseResult { released: true });
        }

        let result = sqlx::query("DELETE FROM idempotency_records WHERE key = $1 AND lock_token = $2")
            .bind(key)
            .bind(lock_token)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;

        if result.rows_affected() == 0 {
            return self.lock_mismatch_or_absent(key).await;
        }
        Ok(ReleaseResult { released: true })
    }

    async fn extend_lock(&self, key: &str, lock_token: &str, extension_ms: u64, now_ms: u64) -> Result<ExtendResult> {
        let new_deadline = now_ms.saturating_add(extension_ms);
        let result = sqlx::query(
            "UPDATE idempotency_records SET lock_expires_at = $3, updated_at = $4
             WHERE key = $1 AND lock_token = $2 AND status = 'PROCESSING' AND lock_expires_at > $4",
        )
        .bind(key)
        .bind(lock_token)
        .bind(new_deadline as i64)
        .bind(now_ms as i64)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;

        if result.rows_affected() == 1 {
            return Ok(ExtendResult { extended: true, lock_expires_at: Some(new_deadline) });
        }

        let row = sqlx::query("SELECT lock_token, status, lock_expires_at FROM idempotency_records WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;
        match row {
            None => Err(IdempotencyError::RecordNotFound),
            Some(row) => {
                let stored_token: Option<String> = row.try_get("lock_token").map_err(sql_err)?;
                if stored_token.as_deref() != Some(lock_token) {
                    Err(IdempotencyError::LockAcquisitionFailed)
                } else {
                    Err(IdempotencyError::LockExpired)
                }
            }
        }
    }

    async fn cleanup(&self, request: CleanupRequest, now_ms: u64) -> Result<CleanupResult> {
        let scanned_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM idempotency_records")
            .fetch_one(&self.pool)
            .await
            .map_err(sql_err)?;

        // `batch_size` bounds each round trip, not the overall result: keep issuing
        // SELECT ... FOR UPDATE SKIP LOCKED + DELETE rounds until a round comes back
        // empty, only stopping early once `max_records` (if set) is hit.
        let chunk_size = request.batch_size.max(1) as i64;
        let mut deleted_count: u64 = 0;
        loop {
            if let Some(max) = request.max_records {
                if deleted_count >= max {
                    break;
                }
            }
            let remaining = request.max_records.map(|max| (max - deleted_count).min(chunk_size as u64) as i64).unwrap_or(chunk_size);

            let candidates: Vec<String> = sqlx::query_scalar(
                "SELECT key FROM idempotency_records
                 WHERE (expires_at <= $1 OR ($2::BIGINT IS NOT NULL AND created_at < $2))
                   AND ($3::TEXT IS NULL OR key LIKE $3 || '%')
                   AND ($4::TEXT IS NULL OR meta->>'client_id' = $4)
                 ORDER BY expires_at ASC
                 LIMIT $5
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(now_ms as i64)
            .bind(request.force_before.map(|v| v as i64))
            .bind(&request.key_prefix)
            .bind(&request.client_id)
            .bind(remaining)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;

            if candidates.is_empty() {
                break;
            }

            if !request.dry_run {
                sqlx::query("DELETE FROM idempotency_records WHERE key = ANY($1)")
                    .bind(&candidates)
                    .execute(&self.pool)
                    .await
                    .map_err(sql_err)?;
            }

            deleted_count += candidates.len() as u64;

            // A dry run never shrinks the candidate set between rounds, so looping
            // again would just re-select the same rows forever.
            if request.dry_run {
                break;
            }
        }

        let next_expiration_estimate_ms: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(expires_at) FROM idempotency_records WHERE status != 'PROCESSING' OR lock_expires_at > $1",
        )
        .bind(now_ms as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(sql_err)?;

        debug!(deleted_count, scanned_count, "sql store cleanup pass complete");

        Ok(CleanupResult {
            deleted_count,
            scanned_count: scanned_count as u64,
            next_expiration_estimate_ms: next_expiration_estimate_ms.map(|v| v as u64),
        })
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(sql_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

impl SqlStore {
    async fn lock_mismatch_or_absent(&self, key: &str) -> Result<ReleaseResult> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM idempotency_records WHERE key = $1)")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(sql_err)?;
        if exists {
            Err(IdempotencyError::LockAcquisitionFailed)
        } else {
            Ok(ReleaseResult { released: false })
        }
    }
}
