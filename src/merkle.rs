//! Merkle Tree Aggregation
//!
//! Binary SHA-256 tree over an ordered batch of serialized items. Leaves
//! are `H(item)`; a parent is `H(["left","right"])` as canonical JSON.
//! When a level has an odd number of nodes the last one is paired with
//! itself, and inclusion proofs follow the same rule.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::canonical::{canonical_json, sha256_hex, GENESIS_HASH};
use crate::error::Result;
use crate::ledger::LedgerEntry;

/// Merkle tree node. Children are owned; a self-paired node owns a copy.
#[derive(Debug, Clone, PartialEq)]
pub struct MerkleNode {
    pub hash: String,
    pub left: Option<Box<MerkleNode>>,
    pub right: Option<Box<MerkleNode>>,
    pub is_leaf: bool,
    /// Serialized item, leaves only
    pub data: Option<String>,
}

impl MerkleNode {
    /// Create leaf node from a serialized item
    pub fn leaf(item: &str) -> Self {
        Self {
            hash: hash_leaf(item),
            left: None,
            right: None,
            is_leaf: true,
            data: Some(item.to_string()),
        }
    }

    /// Create internal node from two child nodes
    pub fn internal(left: MerkleNode, right: MerkleNode) -> Self {
        Self {
            hash: hash_pair(&left.hash, &right.hash),
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
            is_leaf: false,
            data: None,
        }
    }
}

/// One step of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling_hash: String,
    /// Sibling sits to the left of the running hash
    pub sibling_is_left: bool,
}

/// Inclusion proof from one leaf to the root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_hash: String,
    pub root_hash: String,
    pub path: Vec<ProofStep>,
}

impl MerkleProof {
    /// Verify this proof
    pub fn verify(&self) -> bool {
        MerkleTree::verify_proof(self)
    }

    /// Get proof size
    pub fn size(&self) -> usize {
        self.path.len()
    }
}

/// Compact description of a built tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleSummary {
    pub root_hash: String,
    pub leaf_count: usize,
    pub height: usize,
}

/// Merkle tree for one aggregation batch
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    root: Option<MerkleNode>,
    /// Node hashes per level, leaves first
    levels: Vec<Vec<String>>,
}

/// `H(item)`
pub fn hash_leaf(item: &str) -> String {
    sha256_hex(item.as_bytes())
}

/// `H(canonical([left, right]))`, order-sensitive
pub fn hash_pair(left: &str, right: &str) -> String {
    sha256_hex(json!([left, right]).to_string().as_bytes())
}

impl MerkleTree {
    /// Build a tree over `items` in order
    pub fn build<S: AsRef<str>>(items: &[S]) -> Self {
        if items.is_empty() {
            return Self::default();
        }

        let mut nodes: Vec<MerkleNode> = items
            .iter()
            .map(|item| MerkleNode::leaf(item.as_ref()))
            .collect();
        let mut levels = vec![nodes.iter().map(|n| n.hash.clone()).collect::<Vec<_>>()];

        while nodes.len() > 1 {
            let mut next_level = Vec::with_capacity((nodes.len() + 1) / 2);
            let mut iter = nodes.into_iter();

            while let Some(left) = iter.next() {
                let right = match iter.next() {
                    Some(right) => right,
                    None => left.clone(),
                };
                next_level.push(MerkleNode::internal(left, right));
            }

            levels.push(next_level.iter().map(|n| n.hash.clone()).collect());
            nodes = next_level;
        }

        let root = nodes.pop();
        debug!(
            "Built Merkle tree over {} items, height {}",
            items.len(),
            levels.len()
        );

        Self { root, levels }
    }

    /// Build a tree over ledger entries, each serialized canonically
    pub fn build_from_entries(entries: &[LedgerEntry]) -> Result<Self> {
        let items = entries
            .iter()
            .map(canonical_json)
            .collect::<Result<Vec<String>>>()?;
        Ok(Self::build(&items))
    }

    /// Root hash, or [`GENESIS_HASH`] for an empty tree
    pub fn root_hash(&self) -> String {
        self.root
            .as_ref()
            .map(|root| root.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string())
    }

    pub fn root(&self) -> Option<&MerkleNode> {
        self.root.as_ref()
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Number of levels including the leaves
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    pub fn leaf_hashes(&self) -> &[String] {
        self.levels.first().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn summary(&self) -> MerkleSummary {
        MerkleSummary {
            root_hash: self.root_hash(),
            leaf_count: self.leaf_count(),
            height: self.height(),
        }
    }

    /// Sibling path from the leaf at `leaf_index` to the root
    pub fn prove_inclusion(&self, leaf_index: usize) -> Option<MerkleProof> {
        let root = self.root.as_ref()?;
        let leaf_hash = self.leaf_hashes().get(leaf_index)?.clone();

        let mut path = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut index = leaf_index;

        for level in &self.levels[..self.levels.len() - 1] {
            let step = if index % 2 == 0 {
                // Self-paired when there is no right neighbour
                let sibling = level.get(index + 1).unwrap_or(&level[index]);
                ProofStep {
                    sibling_hash: sibling.clone(),
                    sibling_is_left: false,
                }
            } else {
                ProofStep {
                    sibling_hash: level[index - 1].clone(),
                    sibling_is_left: true,
                }
            };
            path.push(step);
            index /= 2;
        }

        Some(MerkleProof {
            leaf_hash,
            root_hash: root.hash.clone(),
            path,
        })
    }

    /// Recombine `proof` from its leaf and compare with its root
    pub fn verify_proof(proof: &MerkleProof) -> bool {
        let computed = proof.path.iter().fold(proof.leaf_hash.clone(), |current, step| {
            if step.sibling_is_left {
                hash_pair(&step.sibling_hash, &current)
            } else {
                hash_pair(&current, &step.sibling_hash)
            }
        });

        computed == proof.root_hash
    }

    /// Whether `items` produce `claimed_root`
    pub fn verify_root<S: AsRef<str>>(items: &[S], claimed_root: &str) -> bool {
        Self::build(items).root_hash() == claimed_root
    }
}
