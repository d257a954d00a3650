use std::net::SocketAddr;
use std::time::Duration;

use idempotency_axum::MiddlewareConfig;
use idempotency_core::BackendConfig;
use serde::{Deserialize, Serialize};

/// How often the background sweeper runs against the configured backend.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Everything read from the JSON config file passed via `--config`. The bind
/// address is CLI-only (it varies per invocation far more than the rest), the
/// same split the teacher drew between `--topology` and its `ServerConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub middleware: MiddlewareFileConfig,
}

/// A serde-friendly mirror of [`MiddlewareConfig`]'s tunables. Kept separate
/// from `idempotency_axum::MiddlewareConfig` itself since that struct holds a
/// `Vec<Method>`/`Vec<ExcludeRule>` that don't derive `Deserialize` directly;
/// this translates the wire-friendly shape into the real config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareFileConfig {
    pub require_key: bool,
    pub default_ttl_ms: u64,
    pub lock_timeout_ms: u64,
    pub max_response_size: usize,
    pub wait_on_concurrent: bool,
    pub max_wait_time_ms: u64,
    pub retry_interval_ms: u64,
}

impl Default for MiddlewareFileConfig {
    fn default() -> Self {
        let defaults = MiddlewareConfig::default();
        Self {
            require_key: defaults.require_key,
            default_ttl_ms: defaults.default_ttl_ms,
            lock_timeout_ms: defaults.lock_timeout_ms,
            max_response_size: defaults.max_response_size,
            wait_on_concurrent: false,
            max_wait_time_ms: defaults.max_wait_time_ms,
            retry_interval_ms: defaults.retry_interval_ms,
        }
    }
}

impl MiddlewareFileConfig {
    pub fn into_middleware_config(self) -> MiddlewareConfig {
        let mut config = MiddlewareConfig::default();
        config.require_key = self.require_key;
        config.default_ttl_ms = self.default_ttl_ms;
        config.lock_timeout_ms = self.lock_timeout_ms;
        config.max_response_size = self.max_response_size;
        config.concurrent_request_handling = if self.wait_on_concurrent {
            idempotency_axum::ConcurrentRequestHandling::Wait
        } else {
            idempotency_axum::ConcurrentRequestHandling::Reject
        };
        config.max_wait_time_ms = self.max_wait_time_ms;
        config.retry_interval_ms = self.retry_interval_ms;
        config
    }
}

/// Fully resolved server configuration: CLI-supplied bind address plus the
/// file-supplied backend and middleware tuning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub backend: BackendConfig,
    pub middleware: MiddlewareConfig,
}
