//! Content hashing and integrity comparison.
//!
//! Hashes are SHA-256 digests of the reconstructed plaintext, stored as
//! lowercase hex.

use sha2::{Digest, Sha256};

/// Name of the digest algorithm used for content hashes.
pub const HASH_ALGORITHM: &str = "SHA-256";

/// Length of a hex-encoded digest.
pub const HASH_HEX_LEN: usize = 64;

/// Compute the hex digest of a text.
pub fn compute_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check that a stored hash looks like a digest we produced.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_HEX_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Compare a text against its expected hash.
///
/// An empty expected hash is vacuously valid: rows written before hashing
/// existed have none. A malformed expected hash never matches.
pub fn verify_integrity(text: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    if !is_valid_hash(expected) {
        return false;
    }
    compute_hash(text).eq_ignore_ascii_case(expected)
}
