//! Inclusion proofs.
//!
//! A [`MerkleProof`] carries one sibling per level, bottom-up. Bit `l` of
//! `leaf_index` says whether the running hash is the right (1) or left (0)
//! child at level `l`, the same rule `append` uses.
//!
//! The serde form is the export format consumed by downstream verifiers:
//!
//! ```json
//! { "leaf": "0x…", "root": "0x…", "siblings": ["0x…", …], "leaf_index": 0 }
//! ```

use bincode::{Decode, Encode};
use donation_ledger_costs::{cost_return_on_error, CostResult, CostsExt, OperationCost};
use serde::{Deserialize, Serialize};

use crate::{
    hash::empty_root, hex_digest, store::load_node, Digest, Leaf, MerkleError, MerkleState,
    NodeStore, MAX_HEIGHT,
};


/// Largest accepted binary proof. A proof for the tallest tree is well under
/// 2 KiB.
const MAX_ENCODED_PROOF_BYTES: usize = 16 * 1024;

/// Proof that `leaf` sits at `leaf_index` in the tree whose root is `root`.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct MerkleProof {
    /// The proved leaf.
    pub leaf: Leaf,
    /// Root the proof claims to reproduce.
    #[serde(with = "crate::hex_serde")]
    pub root: Digest,
    /// Sibling digests from the leaf level up.
    #[serde(with = "crate::hex_serde::vec")]
    pub siblings: Vec<Digest>,
    /// Position of the leaf.
    pub leaf_index: u64,
}

impl MerkleProof {
    /// Reconstruct the sibling path of `leaf_index` against `state`.
    ///
    /// Siblings whose subtree lies entirely at or beyond `leaf_count` are the
    /// canonical empty roots and are not read from the store. The assembled
    /// proof is checked against `state`'s root before it is returned, so a
    /// store that drifted from the state surfaces here as corrupted data.
    pub fn generate<S: NodeStore + ?Sized>(
        state: &MerkleState,
        leaf_index: u64,
        store: &S,
    ) -> CostResult<Self, MerkleError> {
        let mut cost = OperationCost::default();
        let tree_id = state.tree_id();

        if leaf_index >= state.leaf_count() {
            return Err(MerkleError::IndexOutOfRange {
                tree_id: *tree_id,
                leaf_index,
                leaf_count: state.leaf_count(),
            })
            .wrap_with_cost(cost);
        }

        let leaf = cost_return_on_error!(&mut cost, load_node(store, tree_id, 0, leaf_index));

        let mut siblings = Vec::with_capacity(state.height() as usize);
        for level in 0..state.height() {
            let sibling_index = (leaf_index >> level) ^ 1;
            let sibling = if (sibling_index << level) >= state.leaf_count() {
                empty_root(level)
            } else {
                cost_return_on_error!(&mut cost, load_node(store, tree_id, level, sibling_index))
            };
            siblings.push(sibling);
        }

        let proof = MerkleProof {
            leaf: Leaf::from_digest(leaf),
            root: *state.root(),
            siblings,
            leaf_index,
        };

        let computed = proof.compute_root();
        cost.hash_node_calls += state.height() as u32;
        if computed.as_ref() != Some(state.root()) {
            return Err(MerkleError::CorruptedData(format!(
                "stored path for leaf {} of tree {} reproduces {}, state root is {}",
                leaf_index,
                tree_id,
                computed.map_or_else(|| "nothing".to_string(), |r| hex_digest(&r)),
                hex_digest(state.root())
            )))
            .wrap_with_cost(cost);
        }

        Ok(proof).wrap_with_cost(cost)
    }

    /// Number of levels the proof spans.
    pub fn height(&self) -> usize {
        self.siblings.len()
    }

    /// Encode to bytes using bincode.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, MerkleError> {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_no_limit();
        bincode::encode_to_vec(self, config)
            .map_err(|e| MerkleError::InvalidProof(format!("encode error: {}", e)))
    }

    /// Decode from bytes using bincode.
    ///
    /// Rejects proofs with more than [`MAX_HEIGHT`] siblings.
    pub fn decode_from_slice(bytes: &[u8]) -> Result<Self, MerkleError> {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_limit::<MAX_ENCODED_PROOF_BYTES>();
        let (proof, read): (Self, usize) = bincode::decode_from_slice(bytes, config)
            .map_err(|e| MerkleError::InvalidProof(format!("decode error: {}", e)))?;
        if read != bytes.len() {
            return Err(MerkleError::InvalidProof(format!(
                "{} trailing bytes after proof",
                bytes.len() - read
            )));
        }
        if proof.siblings.len() > MAX_HEIGHT as usize {
            return Err(MerkleError::InvalidProof(format!(
                "proof has {} siblings (max {})",
                proof.siblings.len(),
                MAX_HEIGHT
            )));
        }
        Ok(proof)
    }

    /// Render in the JSON export format.
    pub fn to_json(&self) -> Result<String, MerkleError> {
        serde_json::to_string(self)
            .map_err(|e| MerkleError::InvalidProof(format!("json encode error: {}", e)))
    }

    /// Parse the JSON export format.
    pub fn from_json(json: &str) -> Result<Self, MerkleError> {
        serde_json::from_str(json)
            .map_err(|e| MerkleError::InvalidProof(format!("json decode error: {}", e)))
    }
}
