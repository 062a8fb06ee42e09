//! Append-only Merkle ledger of donation records.
//!
//! A binary tree of fixed height `h` holding up to `2^h` leaves, filled left
//! to right. Every leaf is the Blake3 digest of a 56-byte encoded
//! [`DonationRecord`]; every internal node is `blake3(left || right)`.
//! Unpopulated positions take the canonical empty digests, starting from
//! `ZERO_VALUE = blake3(0^32 || 0^32)` at the leaf level, so proofs against a
//! sparsely filled tree are well defined.
//!
//! Appends touch only the path from the new leaf to the root. They are split
//! into a read-only [`PreparedAppend`] and a single batched commit, so a
//! staged append that is never committed leaves no trace in the store.

#![deny(missing_docs)]

pub mod codec;
mod error;
pub(crate) mod hash;
pub mod hex_serde;
pub(crate) mod proof;
mod store;
pub(crate) mod tree;
mod tree_id;
mod verify;

#[cfg(test)]
mod tests;

pub use codec::{DonationRecord, EncodingError, Leaf, ENCODED_RECORD_LEN};
pub use error::MerkleError;
pub use hash::{
    capacity_for_height, empty_root, hash_bytes, hex_digest, node_hash, zero_value, Digest,
    MAX_HEIGHT,
};
pub use proof::MerkleProof;
pub use store::{node_key, MemNodeStore, NodeStore};
pub use tree::{root_of, AppendResult, MerkleState, PreparedAppend};
pub use tree_id::TreeId;
pub use verify::verify;
