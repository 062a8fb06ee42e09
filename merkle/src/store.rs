use std::{collections::HashMap, sync::RwLock};

use donation_ledger_costs::{CostResult, CostsExt, OperationCost};

use crate::{Digest, MerkleError, TreeId};

/// Key-value storage for materialized node digests.
///
/// Writes only happen through [`put_batch`](NodeStore::put_batch), which must
/// apply all entries or none: a reader never observes half of an append
/// path.
pub trait NodeStore: Send + Sync {
    /// Fetch the value stored under `key`.
    fn get(&self, key: &[u8]) -> CostResult<Option<Vec<u8>>, MerkleError>;
    /// Atomically write every `(key, value)` pair.
    fn put_batch(&self, batch: Vec<(Vec<u8>, Vec<u8>)>) -> CostResult<(), MerkleError>;
}

/// Storage key of a node: `tree_id (32) | level (1) | index (8, BE)`.
///
/// Big-endian index keeps a level's nodes in append order under byte-wise
/// ordering.
pub fn node_key(tree_id: &TreeId, level: u8, index: u64) -> [u8; 41] {
    let mut key = [0u8; 41];
    key[..32].copy_from_slice(tree_id.as_bytes());
    key[32] = level;
    key[33..].copy_from_slice(&index.to_be_bytes());
    key
}

/// Read a node that must exist, checking it is a well-formed digest.
pub(crate) fn load_node<S: NodeStore + ?Sized>(
    store: &S,
    tree_id: &TreeId,
    level: u8,
    index: u64,
) -> CostResult<Digest, MerkleError> {
    store
        .get(&node_key(tree_id, level, index))
        .map(|result| match result {
            Ok(Some(bytes)) => bytes.try_into().map_err(|bytes: Vec<u8>| {
                MerkleError::CorruptedData(format!(
                    "node at level {} index {} of tree {} is {} bytes, expected 32",
                    level,
                    index,
                    tree_id,
                    bytes.len()
                ))
            }),
            Ok(None) => Err(MerkleError::CorruptedData(format!(
                "expected node at level {} index {} of tree {} but found none",
                level, index, tree_id
            ))),
            Err(e) => Err(e),
        })
}

/// In-memory node store.
#[derive(Debug, Default)]
pub struct MemNodeStore {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemNodeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored nodes across all trees.
    pub fn len(&self) -> usize {
        self.data.read().map(|data| data.len()).unwrap_or_default()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeStore for MemNodeStore {
    fn get(&self, key: &[u8]) -> CostResult<Option<Vec<u8>>, MerkleError> {
        match self.data.read() {
            Ok(data) => {
                let value = data.get(key).cloned();
                let loaded = value.as_ref().map_or(0, |v| v.len() as u64);
                Ok(value).wrap_with_cost(OperationCost::with_seek(loaded))
            }
            Err(_) => Err(MerkleError::StoreError("node store lock poisoned".into()))
                .wrap_with_cost(OperationCost::default()),
        }
    }

    fn put_batch(&self, batch: Vec<(Vec<u8>, Vec<u8>)>) -> CostResult<(), MerkleError> {
        let mut data = match self.data.write() {
            Ok(data) => data,
            Err(_) => {
                return Err(MerkleError::StoreError("node store lock poisoned".into()))
                    .wrap_with_cost(OperationCost::default());
            }
        };
        let mut cost = OperationCost::default();
        for (key, value) in batch {
            cost.storage_written_bytes += (key.len() + value.len()) as u64;
            data.insert(key, value);
        }
        Ok(()).wrap_with_cost(cost)
    }
}
