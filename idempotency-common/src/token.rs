use rand::distributions::Alphanumeric;
use rand::Rng;

/// Prefix every fencing token carries, so a token can be recognised on sight
/// in logs and never confused with a raw idempotency key.
pub const LOCK_TOKEN_PREFIX: &str = "lock_";

/// Number of random alphanumeric characters appended after the prefix.
const TOKEN_ENTROPY_CHARS: usize = 32;

/// Mint a fresh, opaque fencing token.
///
/// Tokens are compared as opaque byte strings by every `Store` backend —
/// nothing about their internal structure is meaningful beyond the `lock_`
/// prefix. 32 random alphanumeric characters (~190 bits of entropy) makes
/// collisions cryptographically improbable.
pub fn generate_lock_token() -> String {
    let entropy: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_ENTROPY_CHARS)
        .map(char::from)
        .collect();
    format!("{LOCK_TOKEN_PREFIX}{entropy}")
}
