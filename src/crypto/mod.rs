//! Cryptographic primitives
//!
//! SHA-256 hashing and the Merkle tree used by anti-entropy sync.

pub mod hash;
pub mod merkle;

pub use hash::{content_hash, hash_pair, sha256, sha256_hex};
pub use merkle::{MerkleNode, MerkleTree, EMPTY_ROOT};
