use std::fmt;

use crate::error::{IdempotencyError, Result};

/// Default ceiling on a key's length, including any configured prefix.
pub const DEFAULT_MAX_KEY_LENGTH: usize = 256;

/// A validated, namespaced idempotency key.
///
/// Construction is the only way to obtain one, so every `IdempotencyKey` in
/// scope is known to satisfy `^[A-Za-z0-9_\-:.]+$` and the configured length
/// ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Validate and namespace a client-supplied raw key.
    ///
    /// `prefix`, when non-empty, is prepended with a `:` separator before the
    /// length check runs — the invariant is on the *stored* key, not the
    /// client-visible one.
    pub fn new(raw: &str, prefix: &str, max_length: usize) -> Result<Self> {
        if raw.is_empty() {
            return Err(IdempotencyError::InvalidKeyFormat);
        }
        if !raw.chars().all(is_allowed_char) {
            return Err(IdempotencyError::InvalidKeyFormat);
        }

        let namespaced = if prefix.is_empty() {
            raw.to_string()
        } else {
            format!("{prefix}:{raw}")
        };

        if namespaced.len() > max_length {
            return Err(IdempotencyError::KeyTooLong(max_length));
        }

        Ok(Self(namespaced))
    }

    /// Validate and namespace using [`DEFAULT_MAX_KEY_LENGTH`].
    pub fn with_default_limit(raw: &str, prefix: &str) -> Result<Self> {
        Self::new(raw, prefix, DEFAULT_MAX_KEY_LENGTH)
    }

    /// The fully namespaced key, as stored in the backend.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the key, returning the namespaced string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.')
}
