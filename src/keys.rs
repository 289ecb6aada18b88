//! API key secret generation and hashing.
//!
//! Grounded on `orchestrator/auth.rs`'s token generation (random bytes, hex-encoded) and
//! `subtle::ConstantTimeEq` usage, adapted from an ephemeral per-job token to a persistent,
//! hashed, user-scoped API key.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Stable prefix every secret is displayed with.
pub const KEY_PREFIX: &str = "ci_";

/// Generate a new secret: `ci_` followed by >=240 bits of random entropy, URL-safe encoded.
/// 32 raw bytes = 256 bits, comfortably over the 240-bit floor.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a secret for storage/lookup. Never store or log the plaintext secret itself.
pub fn hash_secret(secret: &str) -> String {
    let digest = blake3::hash(secret.as_bytes());
    digest.to_hex().to_string()
}

/// Constant-time comparison of two hash strings, for the rare case a hash is compared directly
/// rather than solely relied upon as an index lookup key.
pub fn hashes_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Generate a new secret together with the hash that gets stored, re-hashing the secret and
/// comparing against the first hash before either is handed back to the caller. A mismatch here
/// means `hash_secret` is non-deterministic and the freshly minted key would never authenticate.
pub fn mint() -> (String, String) {
    let secret = generate_secret();
    let hash = hash_secret(&secret);
    assert!(
        hashes_equal(&hash, &hash_secret(&secret)),
        "hash_secret produced different hashes for the same secret"
    );
    (secret, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_has_prefix_and_entropy() {
        let secret = generate_secret();
        assert!(secret.starts_with(KEY_PREFIX));
        // 32 raw bytes encode to 43 base64url chars; plus the 3-char prefix.
        assert_eq!(secret.len(), KEY_PREFIX.len() + 43);
    }

    #[test]
    fn hash_is_deterministic_and_plaintext_never_equals_hash() {
        let secret = generate_secret();
        let h1 = hash_secret(&secret);
        let h2 = hash_secret(&secret);
        assert_eq!(h1, h2);
        assert_ne!(h1, secret);
    }

    #[test]
    fn hashes_equal_is_constant_time_and_correct() {
        let a = hash_secret("one");
        let b = hash_secret("one");
        let c = hash_secret("two");
        assert!(hashes_equal(&a, &b));
        assert!(!hashes_equal(&a, &c));
    }

    #[test]
    fn two_generated_secrets_differ() {
        assert_ne!(generate_secret(), generate_secret());
    }
}
