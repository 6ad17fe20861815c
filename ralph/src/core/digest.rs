//! Short content hashes for correlation (not uniqueness enforcement).

use sha2::{Digest, Sha256};

/// Hex characters kept from the SHA-256 digest.
pub const SHORT_HASH_LEN: usize = 12;

/// First [`SHORT_HASH_LEN`] hex chars of the SHA-256 of `text`.
pub fn short_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let mut encoded = hex::encode(hasher.finalize());
    encoded.truncate(SHORT_HASH_LEN);
    encoded
}
