use idempotency_common::IdempotencyError;

#[test]
fn invalid_key_format_message() {
    let err = IdempotencyError::InvalidKeyFormat;
    assert_eq!(err.to_string(), "idempotency key has invalid format");
    assert_eq!(err.code(), "INVALID_KEY_FORMAT");
    assert_eq!(err.http_status_code(), 400);
}

#[test]
fn key_too_long_carries_the_limit() {
    let err = IdempotencyError::KeyTooLong(256);
    assert_eq!(err.to_string(), "idempotency key exceeds maximum length of 256");
    assert_eq!(err.http_status_code(), 400);
}

#[test]
fn request_mismatch_maps_to_422() {
    let err = IdempotencyError::RequestMismatch;
    assert_eq!(err.http_status_code(), 422);
    assert_eq!(err.code(), "REQUEST_MISMATCH");
    assert!(!err.retriable());
}

#[test]
fn concurrent_request_is_retriable_with_a_delay() {
    let err = IdempotencyError::ConcurrentRequest { retry_after_ms: 500 };
    assert!(err.retriable());
    assert_eq!(err.retry_after_ms(), Some(500));
    assert_eq!(err.http_status_code(), 409);
}

#[test]
fn storage_error_is_retriable_with_no_fixed_delay() {
    let err = IdempotencyError::StorageError("connection reset".to_string());
    assert!(err.retriable());
    assert_eq!(err.retry_after_ms(), None);
    assert_eq!(err.http_status_code(), 503);
}

#[test]
fn non_retriable_errors_report_no_retry_delay() {
    for err in [
        IdempotencyError::InvalidKeyFormat,
        IdempotencyError::RequestMismatch,
        IdempotencyError::LockAcquisitionFailed,
        IdempotencyError::LockExpired,
        IdempotencyError::RecordNotFound,
        IdempotencyError::TtlExceeded,
    ] {
        assert!(!err.retriable(), "{err:?} should not be retriable");
        assert_eq!(err.retry_after_ms(), None);
    }
}

#[test]
fn response_too_large_reports_both_sizes() {
    let err = IdempotencyError::ResponseTooLarge { max: 1024, actual: 4096 };
    assert_eq!(err.to_string(), "response exceeds maximum size of 1024 bytes (was 4096)");
    assert_eq!(err.http_status_code(), 500);
}

#[test]
fn equality_is_structural() {
    let a = IdempotencyError::KeyTooLong(256);
    let b = IdempotencyError::KeyTooLong(256);
    let c = IdempotencyError::KeyTooLong(128);
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn serializes_round_trip_through_json() {
    let err = IdempotencyError::ConcurrentRequest { retry_after_ms: 250 };
    let json = serde_json::to_string(&err).unwrap();
    let decoded: IdempotencyError = serde_json::from_str(&json).unwrap();
    assert_eq!(err, decoded);
}

#[test]
fn every_variant_has_a_distinct_code() {
    let codes: Vec<&str> = [
        IdempotencyError::InvalidKeyFormat,
        IdempotencyError::KeyTooLong(1),
        IdempotencyError::RequestMismatch,
        IdempotencyError::ConcurrentRequest { retry_after_ms: 1 },
        IdempotencyError::LockAcquisitionFailed,
        IdempotencyError::LockExpired,
        IdempotencyError::RecordNotFound,
        IdempotencyError::ResponseTooLarge { max: 1, actual: 2 },
        IdempotencyError::SerializationError("x".to_string()),
        IdempotencyError::StorageError("x".to_string()),
        IdempotencyError::TtlExceeded,
    ]
    .iter()
    .map(|e| e.code())
    .collect();

    let mut sorted = codes.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), codes.len(), "expected every variant to have a unique code");
}
