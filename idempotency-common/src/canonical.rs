use serde_json::Value;

/// Produce a deterministic byte sequence for `value`, suitable as hash input.
///
/// Relies on `serde_json`'s default map representation (`BTreeMap`, not the
/// `preserve_order` feature) to get lexicographic, code-point-ordered object
/// keys for free; arrays keep their given order; numbers render through
/// `serde_json`'s shortest round-trip formatting. Absent fields must be
/// modelled as `Value::Object` entries that were never inserted — this crate
/// never serializes `Value::Null` to mean "absent" and `Value::Null` to mean
/// "present but null" at the same time, so omission is the single
/// representation for absence.
pub fn canonicalize(value: &Value) -> Vec<u8> {
    // `serde_json::to_vec` on a `Value` never fails: every `Value` variant is
    // already valid JSON data.
    serde_json::to_vec(value).expect("Value serialization is infallible")
}
