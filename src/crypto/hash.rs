//! Hashing utilities for anti-entropy sync
//!
//! SHA-256 based digests used for entity content hashes and Merkle
//! tree nodes. Digests travel on the wire as lowercase hex strings.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Hash of two child digests, left then right
pub fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().to_vec()
}

/// Content hash of any serializable value.
///
/// `serde_json` without `preserve_order` keeps object keys sorted, so two
/// peers serializing equal values produce identical bytes.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_hex(&bytes))
}
