use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy for the idempotency subsystem.
///
/// Every backend maps its own native error type into `IdempotencyError::StorageError`
/// at the boundary; nothing backend-specific ever escapes a store call.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyError {
    #[error("idempotency key has invalid format")]
    InvalidKeyFormat,

    #[error("idempotency key exceeds maximum length of {0}")]
    KeyTooLong(usize),

    #[error("idempotency key reused with a different request")]
    RequestMismatch,

    #[error("a request with this key is already being processed")]
    ConcurrentRequest { retry_after_ms: u64 },

    #[error("lock token did not match the current holder")]
    LockAcquisitionFailed,

    #[error("lock lease has expired")]
    LockExpired,

    #[error("no record exists for this key")]
    RecordNotFound,

    #[error("response exceeds maximum size of {max} bytes (was {actual})")]
    ResponseTooLarge { max: usize, actual: usize },

    #[error("failed to serialize or deserialize a stored record: {0}")]
    SerializationError(String),

    #[error("transient storage failure: {0}")]
    StorageError(String),

    #[error("record has passed its expiration deadline")]
    TtlExceeded,
}

impl IdempotencyError {
    /// Whether the caller may reasonably retry the operation that produced this error.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            IdempotencyError::ConcurrentRequest { .. } | IdempotencyError::StorageError(_)
        )
    }

    /// Suggested delay before retrying, when known.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            IdempotencyError::ConcurrentRequest { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// The HTTP status code the middleware surfaces for this error.
    pub fn http_status_code(&self) -> u16 {
        match self {
            IdempotencyError::InvalidKeyFormat | IdempotencyError::KeyTooLong(_) => 400,
            IdempotencyError::RequestMismatch => 422,
            IdempotencyError::ConcurrentRequest { .. } => 409,
            IdempotencyError::LockAcquisitionFailed
            | IdempotencyError::LockExpired
            | IdempotencyError::RecordNotFound
            | IdempotencyError::ResponseTooLarge { .. }
            | IdempotencyError::SerializationError(_)
            | IdempotencyError::TtlExceeded => 500,
            IdempotencyError::StorageError(_) => 503,
        }
    }

    /// Short machine-readable error code, used as the `error` field of the HTTP envelope.
    pub fn code(&self) -> &'static str {
        match self {
            IdempotencyError::InvalidKeyFormat => "INVALID_KEY_FORMAT",
            IdempotencyError::KeyTooLong(_) => "KEY_TOO_LONG",
            IdempotencyError::RequestMismatch => "REQUEST_MISMATCH",
            IdempotencyError::ConcurrentRequest { .. } => "CONCURRENT_REQUEST",
            IdempotencyError::LockAcquisitionFailed => "LOCK_ACQUISITION_FAILED",
            IdempotencyError::LockExpired => "LOCK_EXPIRED",
            IdempotencyError::RecordNotFound => "RECORD_NOT_FOUND",
            IdempotencyError::ResponseTooLarge { .. } => "RESPONSE_TOO_LARGE",
            IdempotencyError::SerializationError(_) => "SERIALIZATION_ERROR",
            IdempotencyError::StorageError(_) => "STORAGE_ERROR",
            IdempotencyError::TtlExceeded => "TTL_EXCEEDED",
        }
    }
}

/// Result type for idempotency subsystem operations.
pub type Result<T> = std::result::Result<T, IdempotencyError>;
