//! Key Codec
//!
//! Maps arbitrary cache keys to filesystem-safe identifiers.

use sha2::{Digest, Sha256};

/// Length of an encoded identifier (SHA-256 as hex)
pub const ENCODED_KEY_LEN: usize = 64;

/// Encode a cache key as a lowercase hex SHA-256 digest.
///
/// The digest is unsalted, so the same key maps to the same file name across
/// process restarts.
pub fn encode_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check whether a file name could have been produced by [`encode_key`]
pub fn is_encoded_key(name: &str) -> bool {
    name.len() == ENCODED_KEY_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

// =============================================================================
// Tests
// =============================================================================
