use axum::http::Method;
use regex::Regex;

/// How the middleware behaves when it observes a key that is already
/// `PROCESSING` elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrentRequestHandling {
    /// Respond immediately with `409 CONCURRENT_REQUEST` and `Retry-After`.
    Reject,
    /// Poll until the peer terminates, `max_wait_time` elapses (`408`), or
    /// the peer's record vanished (record expired mid-wait — retry).
    Wait,
}

/// A single exclusion rule tested against the request path.
#[derive(Debug, Clone)]
pub enum ExcludeRule {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl ExcludeRule {
    fn matches(&self, path: &str) -> bool {
        match self {
            ExcludeRule::Exact(p) => path == p,
            ExcludeRule::Prefix(p) => path.starts_with(p.as_str()),
            ExcludeRule::Regex(re) => re.is_match(path),
        }
    }
}

/// Tunables for [`crate::middleware::idempotency_layer`]. Field names mirror
/// SPEC_FULL.md §6's configuration table, translated to Rust's snake_case
/// and millisecond durations.
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    pub key_header: String,
    pub replay_header: String,
    pub methods: Vec<Method>,
    pub exclude_paths: Vec<ExcludeRule>,
    pub require_key: bool,
    pub fingerprint_headers: Vec<String>,
    pub key_prefix: String,
    pub max_key_length: usize,
    pub default_ttl_ms: u64,
    pub lock_timeout_ms: u64,
    pub max_response_size: usize,
    pub max_request_body_bytes: usize,
    pub concurrent_request_handling: ConcurrentRequestHandling,
    pub max_wait_time_ms: u64,
    pub retry_interval_ms: u64,
    /// When `true`, observing a concurrent `FAILED` record in wait mode
    /// replays the failure envelope instead of returning `409`. Default
    /// `false`: a stale failure might mask a now-resolved transient
    /// condition, so the safer default is to let the client retry fresh.
    pub wait_on_failed_replays: bool,
    /// Response headers to capture into the stored envelope, beyond
    /// `Content-Type` which is always captured.
    pub captured_response_headers: Vec<String>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            key_header: "Idempotency-Key".to_string(),
            replay_header: "Idempotency-Replayed".to_string(),
            methods: vec![Method::POST, Method::PUT, Method::PATCH],
            exclude_paths: Vec::new(),
            require_key: true,
            fingerprint_headers: Vec::new(),
            key_prefix: String::new(),
            max_key_length: idempotency_common::DEFAULT_MAX_KEY_LENGTH,
            default_ttl_ms: 24 * 60 * 60 * 1000,
            lock_timeout_ms: 30_000,
            max_response_size: 1024 * 1024,
            max_request_body_bytes: 2 * 1024 * 1024,
            concurrent_request_handling: ConcurrentRequestHandling::Reject,
            max_wait_time_ms: 10_000,
            retry_interval_ms: 250,
            wait_on_failed_replays: false,
            captured_response_headers: Vec::new(),
        }
    }
}

impl MiddlewareConfig {
    pub fn applies_to(&self, method: &Method, path: &str) -> bool {
        if !self.methods.contains(method) {
            return false;
        }
        !self.exclude_paths.iter().any(|rule| rule.matches(path))
    }
}
