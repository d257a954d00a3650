use std::sync::Arc;
use std::time::Duration;

use idempotency_common::now_ms;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::store::{CleanupRequest, CleanupResult, Store};

/// Periodic or on-demand eviction of expired records.
///
/// Holds no state of its own beyond the store handle and sweep
/// configuration; `spawn` hands back a `JoinHandle` the caller can abort on
/// shutdown, matching the rest of the workspace's "caller owns the task"
/// convention.
pub struct Sweeper<S: Store + ?Sized> {
    store: Arc<S>,
    batch_size: usize,
    max_records_per_pass: Option<u64>,
}

impl<S: Store + ?Sized + 'static> Sweeper<S> {
    pub fn new(store: Arc<S>, batch_size: usize) -> Self {
        Self { store, batch_size, max_records_per_pass: None }
    }

    pub fn with_max_records_per_pass(mut self, max: u64) -> Self {
        self.max_records_per_pass = Some(max);
        self
    }

    /// Run one sweep pass now.
    pub async fn run_once(&self) -> idempotency_common::Result<CleanupResult> {
        let request = CleanupRequest {
            batch_size: self.batch_size,
            max_records: self.max_records_per_pass,
            key_prefix: None,
            client_id: None,
            force_before: None,
            dry_run: false,
        };
        let result = self.store.cleanup(request, now_ms()).await?;
        debug!(deleted = result.deleted_count, scanned = result.scanned_count, "sweeper pass complete");
        Ok(result)
    }

    /// Spawn a background task that calls `run_once` every `interval`, for
    /// the lifetime of the returned handle.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; skip it so the first real sweep
            // happens after a full interval, matching a typical cron-style sweep.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(result) if result.deleted_count > 0 => {
                        info!(deleted = result.deleted_count, "sweeper evicted expired idempotency records");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "sweeper pass failed"),
                }
            }
        })
    }
}
