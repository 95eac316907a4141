//! Merkle tree over an entity collection
//!
//! One leaf per entity, ordered by entity id. Two peers holding the same
//! entities with the same content always compute the same root, so a single
//! digest comparison tells whether a collection needs reconciling.

use super::hash::{hash_pair, sha256};
use std::collections::BTreeMap;

/// Root digest reported for an empty collection
pub const EMPTY_ROOT: &str = "EMPTY";

/// A node in the merkle tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleNode {
    /// One entity: its id, its content hash and the leaf digest
    Leaf {
        id: String,
        content_hash: String,
        hash: Vec<u8>,
    },
    /// Internal node; digest is derived from the children, in order
    Branch {
        hash: Vec<u8>,
        children: Vec<MerkleNode>,
    },
}

impl MerkleNode {
    /// Create a leaf node for an entity
    pub fn leaf(id: &str, content_hash: &str) -> Self {
        let mut data = Vec::with_capacity(id.len() + content_hash.len() + 1);
        data.extend_from_slice(id.as_bytes());
        data.push(b':');
        data.extend_from_slice(content_hash.as_bytes());

        MerkleNode::Leaf {
            id: id.to_string(),
            content_hash: content_hash.to_string(),
            hash: sha256(&data),
        }
    }

    /// Create an internal node from two children
    pub fn internal(left: MerkleNode, right: MerkleNode) -> Self {
        let hash = hash_pair(left.hash(), right.hash());
        MerkleNode::Branch {
            hash,
            children: vec![left, right],
        }
    }

    /// Digest of this node
    pub fn hash(&self) -> &[u8] {
        match self {
            MerkleNode::Leaf { hash, .. } | MerkleNode::Branch { hash, .. } => hash,
        }
    }

    /// Digests of the direct children (empty for leaves)
    pub fn child_hashes(&self) -> Vec<&[u8]> {
        match self {
            MerkleNode::Leaf { .. } => Vec::new(),
            MerkleNode::Branch { children, .. } => children.iter().map(|c| c.hash()).collect(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, MerkleNode::Leaf { .. })
    }
}

/// Merkle tree built from `(entity id, content hash)` pairs
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    root: Option<MerkleNode>,
    leaf_ids: Vec<String>,
}

impl MerkleTree {
    /// Build a tree. Input order does not matter; leaves are sorted by id.
    /// Duplicate ids keep the last content hash given.
    pub fn build<I, S, H>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, H)>,
        S: Into<String>,
        H: Into<String>,
    {
        let sorted: BTreeMap<String, String> = entries
            .into_iter()
            .map(|(id, hash)| (id.into(), hash.into()))
            .collect();

        let leaf_ids: Vec<String> = sorted.keys().cloned().collect();
        let mut nodes: Vec<MerkleNode> = sorted
            .iter()
            .map(|(id, hash)| MerkleNode::leaf(id, hash))
            .collect();

        if nodes.is_empty() {
            return Self::default();
        }

        // Build tree bottom-up; an odd node is paired with itself
        while nodes.len() > 1 {
            let mut next_level = Vec::with_capacity(nodes.len().div_ceil(2));
            let mut iter = nodes.into_iter();

            while let Some(left) = iter.next() {
                let right = iter.next().unwrap_or_else(|| left.clone());
                next_level.push(MerkleNode::internal(left, right));
            }

            nodes = next_level;
        }

        Self {
            root: nodes.into_iter().next(),
            leaf_ids,
        }
    }

    /// Hex digest of the root, or [`EMPTY_ROOT`] for an empty tree
    pub fn root_hash(&self) -> String {
        match &self.root {
            Some(node) => hex::encode(node.hash()),
            None => EMPTY_ROOT.to_string(),
        }
    }

    pub fn root(&self) -> Option<&MerkleNode> {
        self.root.as_ref()
    }

    /// Entity ids covered by this tree, sorted
    pub fn leaf_ids(&self) -> &[String] {
        &self.leaf_ids
    }

    pub fn len(&self) -> usize {
        self.leaf_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_ids.is_empty()
    }
}
