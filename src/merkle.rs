// =============================================================================
// MOONWIRE v1.1 - Active-Transfer Merkle Tree
// =============================================================================
//
// The set of active transfers for a channel is represented off-chain by a
// merkle root committed into every signed channel update. Both peers must
// compute identical roots, so leaves are the hashed core transfer states
// sorted by transfer id; adding or removing a transfer is the only source of
// root change.
//
// Complexity:
// - Tree construction: O(n)
// - Proof generation: O(log n)
// - Proof verification: O(log n)
//
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::crypto::keccak256;
use crate::types::{Bytes32, Transfer};

/// Root of the empty tree (no active transfers)
pub const EMPTY_ROOT: Bytes32 = Bytes32([0u8; 32]);

/// Hash two child nodes together
pub fn hash_pair(left: &Bytes32, right: &Bytes32) -> Bytes32 {
    let mut combined = Vec::with_capacity(64);
    combined.extend_from_slice(&left.0);
    combined.extend_from_slice(&right.0);
    keccak256(&combined)
}

// =============================================================================
// Merkle Proof
// =============================================================================

/// Direction of the sibling in a proof step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofDirection {
    Left,
    Right,
}

/// A single step in a merkle proof
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: Bytes32,
    pub direction: ProofDirection,
}

/// Merkle inclusion proof for one leaf
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_hash: Bytes32,
    pub leaf_index: usize,
    pub steps: Vec<ProofStep>,
    pub root: Bytes32,
}

impl MerkleProof {
    /// Recompute the root from the leaf and steps
    pub fn verify(&self) -> bool {
        let mut current = self.leaf_hash;
        for step in &self.steps {
            current = match step.direction {
                ProofDirection::Left => hash_pair(&step.hash, &current),
                ProofDirection::Right => hash_pair(&current, &step.hash),
            };
        }
        current == self.root
    }

    /// Just the sibling hashes, in leaf-to-root order (what the adjudicator
    /// takes alongside the leaf index)
    pub fn sibling_hashes(&self) -> Vec<Bytes32> {
        self.steps.iter().map(|s| s.hash).collect()
    }
}

// =============================================================================
// Merkle Tree
// =============================================================================

/// A merkle tree over a fixed set of leaves
#[derive(Clone, Debug)]
pub struct MerkleTree {
    /// All nodes, bottom to top, left to right
    nodes: Vec<Bytes32>,
    leaf_count: usize,
}

impl MerkleTree {
    /// Build from leaf hashes. Leaves are padded to a power of two by
    /// duplicating the last leaf.
    pub fn from_leaves(leaves: &[Bytes32]) -> Self {
        if leaves.is_empty() {
            return MerkleTree {
                nodes: vec![EMPTY_ROOT],
                leaf_count: 0,
            };
        }

        let leaf_count = leaves.len();
        let padded_count = leaf_count.next_power_of_two();

        let mut level: Vec<Bytes32> = leaves.to_vec();
        while level.len() < padded_count {
            level.push(*level.last().unwrap());
        }

        let mut nodes = level.clone();
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len() / 2);
            for chunk in level.chunks(2) {
                next.push(hash_pair(&chunk[0], &chunk[1]));
            }
            nodes.extend_from_slice(&next);
            level = next;
        }

        MerkleTree { nodes, leaf_count }
    }

    pub fn root(&self) -> Bytes32 {
        *self.nodes.last().unwrap_or(&EMPTY_ROOT)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Generate an inclusion proof for the leaf at `leaf_index`
    pub fn generate_proof(&self, leaf_index: usize) -> Option<MerkleProof> {
        if leaf_index >= self.leaf_count {
            return None;
        }

        let leaf_hash = self.nodes[leaf_index];
        let mut steps = Vec::new();
        let mut current_index = leaf_index;
        let mut level_start = 0;
        let mut level_size = self.leaf_count.next_power_of_two();

        while level_size > 1 {
            let sibling_index = if current_index % 2 == 0 {
                current_index + 1
            } else {
                current_index - 1
            };
            let direction = if current_index % 2 == 0 {
                ProofDirection::Right
            } else {
                ProofDirection::Left
            };
            steps.push(ProofStep {
                hash: self.nodes[level_start + sibling_index],
                direction,
            });

            level_start += level_size;
            level_size /= 2;
            current_index /= 2;
        }

        Some(MerkleProof {
            leaf_hash,
            leaf_index,
            steps,
            root: self.root(),
        })
    }
}

// =============================================================================
// Active-Transfer Commitment
// =============================================================================

/// Leaves for a set of active transfers: hashed core states sorted by
/// transfer id so both peers derive the same tree.
fn sorted_leaves(transfers: &[Transfer]) -> Vec<Bytes32> {
    let mut ordered: Vec<&Transfer> = transfers.iter().collect();
    ordered.sort_by_key(|t| t.transfer_id);
    ordered.iter().map(|t| t.leaf_hash()).collect()
}

/// The channel merkle root for a set of active transfers
pub fn active_transfer_root(transfers: &[Transfer]) -> Bytes32 {
    MerkleTree::from_leaves(&sorted_leaves(transfers)).root()
}

/// Inclusion proof for one transfer of the active set
pub fn active_transfer_proof(transfers: &[Transfer], transfer_id: &Bytes32) -> Option<MerkleProof> {
    let mut ordered: Vec<&Transfer> = transfers.iter().collect();
    ordered.sort_by_key(|t| t.transfer_id);
    let index = ordered.iter().position(|t| t.transfer_id == *transfer_id)?;
    MerkleTree::from_leaves(&sorted_leaves(transfers)).generate_proof(index)
}

// =============================================================================
// Tests
// =============================================================================
