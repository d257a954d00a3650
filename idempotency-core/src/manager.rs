use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use idempotency_common::{now_ms, IdempotencyError, RecordMeta, ResponseEnvelope, Result};
use rand::Rng;
use tracing::{debug, warn};

use crate::store::Store;

/// Retry policy for transient storage faults, and for re-polling a
/// concurrently-held lock in `execute_with_retry`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound on the jitter fraction added to each backoff, e.g. `0.5`
    /// for "0-50% jitter".
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_backoff_ms: 100, max_backoff_ms: 10_000, jitter_fraction: 0.5 }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter: `min(base * 2^attempt, cap)`, then a
    /// random extra delay of up to `jitter_fraction` of that value.
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_backoff_ms.saturating_mul(1u64 << attempt.min(20));
        let capped = exp.min(self.max_backoff_ms);
        let jitter_ceiling = (capped as f64 * self.jitter_fraction) as u64;
        let jitter = if jitter_ceiling == 0 { 0 } else { rand::thread_rng().gen_range(0..=jitter_ceiling) };
        Duration::from_millis(capped + jitter)
    }
}

/// Configuration for one `Manager` instance — the lock/record lifetimes it
/// applies to every `execute` call.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub lock_ttl_ms: u64,
    pub record_ttl_ms: u64,
    pub max_response_size: usize,
    pub retry_policy: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 30_000,
            record_ttl_ms: 24 * 60 * 60 * 1000,
            max_response_size: 1024 * 1024,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Outcome of a single `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// The operation ran and its response was newly recorded.
    Executed(ResponseEnvelope),
    /// A prior, completed execution's response was replayed without running
    /// the operation again.
    Replayed(ResponseEnvelope),
}

impl ExecuteOutcome {
    pub fn into_response(self) -> ResponseEnvelope {
        match self {
            ExecuteOutcome::Executed(r) | ExecuteOutcome::Replayed(r) => r,
        }
    }
}

/// Stateless orchestration façade: check -> acquire lock -> run operation ->
/// record -> release. Holds no state beyond the injected `Store` handle and
/// its retry policy, so two `Manager`s over two distinct idempotency domains
/// (e.g. "payment creation" and "webhook delivery") may share a backend or
/// not, freely.
pub struct Manager<S: Store + ?Sized> {
    store: Arc<S>,
    config: ManagerConfig,
}

impl<S: Store + ?Sized> Manager<S> {
    pub fn new(store: Arc<S>, config: ManagerConfig) -> Self {
        Self { store, config }
    }

    /// Run `op` under idempotency protection for `key`/`request_hash`. Does
    /// not retry on `CONCURRENT_REQUEST` — callers needing that should use
    /// [`Manager::execute_with_retry`].
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        request_hash: &str,
        meta: RecordMeta,
        op: F,
    ) -> Result<ExecuteOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ResponseEnvelope>>,
    {
        let lock = self
            .with_storage_retry(|| {
                let meta = meta.clone();
                async {
                    self.store
                        .start_processing(key, request_hash, self.config.lock_ttl_ms, self.config.record_ttl_ms, meta, now_ms())
                        .await
                }
            })
            .await?;

        if !lock.acquired {
            if lock.request_mismatch {
                return Err(IdempotencyError::RequestMismatch);
            }
            if let Some(response) = lock.existing_response {
                return Ok(ExecuteOutcome::Replayed(response));
            }
            return Err(IdempotencyError::ConcurrentRequest { retry_after_ms: self.config.lock_ttl_ms });
        }

        let lock_token = lock.lock_token.expect("acquired implies a lock token");

        match op().await {
            Ok(response) => {
                let recorded = self
                    .with_storage_retry(|| async {
                        self.store
                            .record(
                                key,
                                &lock_token,
                                response.clone(),
                                false,
                                None,
                                None,
                                self.config.record_ttl_ms,
                                self.config.max_response_size,
                                now_ms(),
                            )
                            .await
                    })
                    .await?;
                Ok(ExecuteOutcome::Executed(recorded.response.unwrap_or(response)))
            }
            Err(err) => {
                warn!(%key, error = %err, "operation failed under idempotency lock; releasing as FAILED");
                // Best effort: correctness of the caller-visible error outranks
                // storage bookkeeping, so a failure here is swallowed.
                let _ = self
                    .store
                    .release_lock(key, &lock_token, true, Some(err.code().to_string()), Some(err.to_string()), now_ms())
                    .await;
                Err(err)
            }
        }
    }

    /// As [`Manager::execute`], but re-enters the whole check -> acquire loop
    /// when a concurrent holder is observed, sleeping for a backoff delay
    /// between attempts, until the peer terminates or the retry budget is
    /// exhausted.
    pub async fn execute_with_retry<F, Fut>(
        &self,
        key: &str,
        request_hash: &str,
        meta: RecordMeta,
        mut op: F,
    ) -> Result<ExecuteOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ResponseEnvelope>>,
    {
        let mut attempt = 0;
        loop {
            match self.execute(key, request_hash, meta.clone(), || op()).await {
                Err(IdempotencyError::ConcurrentRequest { retry_after_ms }) if attempt < self.config.retry_policy.max_retries => {
                    debug!(%key, attempt, "peer holds the lock; retrying after backoff");
                    let delay = self.config.retry_policy.backoff_for_attempt(attempt).min(Duration::from_millis(retry_after_ms.max(1)));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run `f`, retrying on `StorageError` with backoff up to the configured
    /// `max_retries`; any other error propagates immediately.
    async fn with_storage_retry<T, F, Fut>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Err(IdempotencyError::StorageError(msg)) if attempt < self.config.retry_policy.max_retries => {
                    warn!(attempt, error = %msg, "transient storage error; retrying");
                    tokio::time::sleep(self.config.retry_policy.backoff_for_attempt(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
