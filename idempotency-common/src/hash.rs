use std::collections::BTreeMap;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::canonical::canonicalize;

/// Compute the SHA-256 hex digest of the canonical request fingerprint.
///
/// The fingerprint is the canonical hash of the ordered tuple
/// `(UPPERCASE(method), path, selected_headers_sorted_map, body_value_or_absent)`.
/// `headers` is expected to already be filtered down to the configured
/// allow-list; passing an empty map means no headers participate. `body` is
/// included only when `Some` and not `Value::Null`.
pub fn request_fingerprint(
    method: &str,
    path: &str,
    headers: &BTreeMap<String, String>,
    body: Option<&Value>,
) -> String {
    let body_value = match body {
        Some(v) if !v.is_null() => v.clone(),
        _ => Value::Null,
    };

    let tuple = json!({
        "method": method.to_ascii_uppercase(),
        "path": path,
        "headers": headers,
        "body": body_value,
    });

    sha256_hex(&canonicalize(&tuple))
}

/// SHA-256 hex digest of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
