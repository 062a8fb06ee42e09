use thiserror::Error;

use crate::{EncodingError, TreeId};

/// Errors from Merkle ledger operations.
#[derive(Debug, Error)]
pub enum MerkleError {
    /// Height is zero or above the supported maximum.
    #[error("invalid tree height {height} (must be between 1 and {max})")]
    InvalidHeight {
        /// Height that was asked for.
        height: u8,
        /// Largest supported height.
        max: u8,
    },
    /// Every leaf position is taken.
    #[error("tree {tree_id} is full (capacity {capacity})")]
    TreeFull {
        /// The full tree.
        tree_id: TreeId,
        /// Its leaf capacity, `2^height`.
        capacity: u64,
    },
    /// No leaf has been appended at this index.
    #[error("leaf index {leaf_index} out of range for tree {tree_id} (leaf count {leaf_count})")]
    IndexOutOfRange {
        /// Tree that was asked.
        tree_id: TreeId,
        /// Requested leaf.
        leaf_index: u64,
        /// Leaves the tree holds.
        leaf_count: u64,
    },
    /// Proof is malformed or does not reproduce the expected root.
    #[error("invalid proof: {0}")]
    InvalidProof(String),
    /// Stored nodes disagree with the tree state.
    #[error("corrupted data: {0}")]
    CorruptedData(String),
    /// The node store failed.
    #[error("store error: {0}")]
    StoreError(String),
    /// A record could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}
