use idempotency_common::{IdempotencyError, IdempotencyKey};

#[test]
fn accepts_valid_key() {
    let key = IdempotencyKey::with_default_limit("order_123-abc:v2.0", "").unwrap();
    assert_eq!(key.as_str(), "order_123-abc:v2.0");
}

#[test]
fn rejects_empty_key() {
    assert_eq!(IdempotencyKey::with_default_limit("", "").unwrap_err(), IdempotencyError::InvalidKeyFormat);
}

#[test]
fn rejects_disallowed_characters() {
    for raw in ["has space", "slash/in/key", "emoji🙂", "semi;colon"] {
        assert_eq!(
            IdempotencyKey::with_default_limit(raw, "").unwrap_err(),
            IdempotencyError::InvalidKeyFormat,
            "expected {raw:?} to be rejected"
        );
    }
}

#[test]
fn applies_prefix_before_length_check() {
    let raw = "a".repeat(250);
    let err = IdempotencyKey::new(&raw, "tenant-9", 256).unwrap_err();
    assert_eq!(err, IdempotencyError::KeyTooLong(256));
}

#[test]
fn prefix_is_included_in_stored_key() {
    let key = IdempotencyKey::with_default_limit("k1", "tenant-9").unwrap();
    assert_eq!(key.as_str(), "tenant-9:k1");
}

#[test]
fn rejects_key_over_max_length() {
    let raw = "a".repeat(257);
    assert_eq!(IdempotencyKey::with_default_limit(&raw, "").unwrap_err(), IdempotencyError::KeyTooLong(256));
}

#[test]
fn accepts_key_at_exactly_max_length() {
    let raw = "a".repeat(256);
    assert!(IdempotencyKey::with_default_limit(&raw, "").is_ok());
}
