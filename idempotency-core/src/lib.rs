//! Storage backends, the `Manager` orchestration façade, and the `Sweeper`
//! cleanup task for the idempotency subsystem. Depends only on
//! `idempotency-common` and the storage/async crates each backend needs;
//! knows nothing about HTTP.

pub mod clock;
pub mod config;
pub mod manager;
pub mod store;
pub mod sweeper;

pub use clock::{Clock, SystemClock};
pub use config::BackendConfig;
pub use manager::{ExecuteOutcome, Manager, ManagerConfig, RetryPolicy};
pub use store::memory::MemoryStore;
pub use store::redis_kv::RedisStore;
pub use store::sql::SqlStore;
pub use store::{CheckResult, CleanupRequest, CleanupResult, ExtendResult, LockResult, ReleaseResult, Store};
pub use sweeper::Sweeper;
