use bincode::{Decode, Encode};
use donation_ledger_costs::{cost_return_on_error, CostResult, CostsExt, OperationCost};
use serde::{Deserialize, Serialize};

use crate::{
    hash::{capacity_for_height, empty_root, node_hash, validate_height},
    store::{load_node, node_key},
    Digest, Leaf, MerkleError, MerkleProof, NodeStore, TreeId,
};

/// Snapshot of one ledger tree.
///
/// `root` is always the hash closure of exactly `leaf_count` leaves in
/// append order. `height` is fixed at creation. `node_count` counts the node
/// digests materialized in the store, root included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct MerkleState {
    tree_id: TreeId,
    height: u8,
    #[serde(with = "crate::hex_serde")]
    root: Digest,
    leaf_count: u64,
    node_count: u64,
}

/// Result of a committed append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    /// The tree after the append.
    pub state: MerkleState,
    /// Position the leaf was written to.
    pub leaf_index: u64,
    /// Sibling digests from the leaf level up, one per level.
    pub audit_path: Vec<Digest>,
}

/// An append whose new path has been computed but not yet written.
///
/// Dropping it has no effect on the store or on the state it was prepared
/// from.
#[derive(Debug, Clone)]
#[must_use = "a prepared append does nothing until committed"]
pub struct PreparedAppend {
    previous_root: Digest,
    new_state: MerkleState,
    leaf_index: u64,
    leaf: Leaf,
    audit_path: Vec<Digest>,
    nodes: Vec<(Vec<u8>, Vec<u8>)>,
}

impl MerkleState {
    /// Create an empty tree.
    ///
    /// Height must be between 1 and [`MAX_HEIGHT`](crate::MAX_HEIGHT).
    pub fn initialize(tree_id: TreeId, height: u8) -> Result<Self, MerkleError> {
        validate_height(height)?;
        Ok(Self {
            tree_id,
            height,
            root: empty_root(height),
            leaf_count: 0,
            node_count: 0,
        })
    }

    /// Reconstitute a state received from elsewhere, checking it is
    /// internally consistent.
    pub fn from_parts(
        tree_id: TreeId,
        height: u8,
        root: Digest,
        leaf_count: u64,
        node_count: u64,
    ) -> Result<Self, MerkleError> {
        validate_height(height)?;
        let capacity = capacity_for_height(height);
        if leaf_count > capacity {
            return Err(MerkleError::CorruptedData(format!(
                "leaf count {} exceeds capacity {} for height {}",
                leaf_count, capacity, height
            )));
        }
        Ok(Self {
            tree_id,
            height,
            root,
            leaf_count,
            node_count,
        })
    }

    /// Identity of the tree.
    pub fn tree_id(&self) -> &TreeId {
        &self.tree_id
    }

    /// Number of levels below the root. Fixed at initialization.
    pub fn height(&self) -> u8 {
        self.height
    }

    /// Current root digest.
    pub fn root(&self) -> &Digest {
        &self.root
    }

    /// Leaves appended so far; also the index of the next leaf.
    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// Node digests materialized in the store, root included.
    pub fn node_count(&self) -> u64 {
        self.node_count
    }

    /// Maximum number of leaves: `2^height`.
    pub fn capacity(&self) -> u64 {
        capacity_for_height(self.height)
    }

    /// True once every leaf position is taken.
    pub fn is_full(&self) -> bool {
        self.leaf_count >= self.capacity()
    }

    /// Compute the path for appending `leaf` at `leaf_count` without writing
    /// anything.
    ///
    /// Only left siblings are read from the store; right siblings of the
    /// newest leaf are always empty subtrees.
    pub fn prepare_append<S: NodeStore + ?Sized>(
        &self,
        leaf: Leaf,
        store: &S,
    ) -> CostResult<PreparedAppend, MerkleError> {
        let mut cost = OperationCost::default();

        if self.is_full() {
            return Err(MerkleError::TreeFull {
                tree_id: self.tree_id,
                capacity: self.capacity(),
            })
            .wrap_with_cost(cost);
        }

        let leaf_index = self.leaf_count;
        let height = self.height as usize;
        let mut audit_path = Vec::with_capacity(height);
        let mut nodes = Vec::with_capacity(height + 1);
        let mut new_nodes = 0u64;
        let mut current = *leaf.digest();

        for level in 0..self.height {
            let index = leaf_index >> level;
            // A node is materialized by the first leaf of its subtree.
            if leaf_index & ((1u64 << level) - 1) == 0 {
                new_nodes += 1;
            }
            nodes.push((
                node_key(&self.tree_id, level, index).to_vec(),
                current.to_vec(),
            ));

            let (left, right) = if index & 1 == 1 {
                let sibling = cost_return_on_error!(
                    &mut cost,
                    load_node(store, &self.tree_id, level, index - 1)
                );
                audit_path.push(sibling);
                (sibling, current)
            } else {
                let sibling = empty_root(level);
                audit_path.push(sibling);
                (current, sibling)
            };
            current = node_hash(&left, &right);
            cost.hash_node_calls += 1;
        }

        if leaf_index == 0 {
            new_nodes += 1;
        }
        nodes.push((
            node_key(&self.tree_id, self.height, 0).to_vec(),
            current.to_vec(),
        ));

        let new_state = MerkleState {
            root: current,
            leaf_count: self.leaf_count + 1,
            node_count: self.node_count + new_nodes,
            ..*self
        };

        Ok(PreparedAppend {
            previous_root: self.root,
            new_state,
            leaf_index,
            leaf,
            audit_path,
            nodes,
        })
        .wrap_with_cost(cost)
    }

    /// Append `leaf` and write the new path in one batch.
    ///
    /// `self` is left untouched; the returned state is the new canonical
    /// snapshot. On error nothing has been written.
    pub fn append<S: NodeStore + ?Sized>(
        &self,
        leaf: Leaf,
        store: &S,
    ) -> CostResult<AppendResult, MerkleError> {
        self.prepare_append(leaf, store)
            .flat_map_ok(|prepared| prepared.commit(store))
    }
}

/// Root of `state`.
pub fn root_of(state: &MerkleState) -> Digest {
    state.root
}

impl PreparedAppend {
    /// Root before the append.
    pub fn previous_root(&self) -> &Digest {
        &self.previous_root
    }

    /// State the tree will be in once committed.
    pub fn new_state(&self) -> &MerkleState {
        &self.new_state
    }

    /// Position the leaf goes to.
    pub fn leaf_index(&self) -> u64 {
        self.leaf_index
    }

    /// The leaf being appended.
    pub fn leaf(&self) -> &Leaf {
        &self.leaf
    }

    /// Sibling digests from the leaf level up.
    pub fn audit_path(&self) -> &[Digest] {
        &self.audit_path
    }

    /// Inclusion proof of the new leaf against the new root.
    pub fn proof(&self) -> MerkleProof {
        MerkleProof {
            leaf: self.leaf,
            root: self.new_state.root,
            siblings: self.audit_path.clone(),
            leaf_index: self.leaf_index,
        }
    }

    /// Write the staged path.
    pub fn commit<S: NodeStore + ?Sized>(self, store: &S) -> CostResult<AppendResult, MerkleError> {
        store.put_batch(self.nodes).map_ok(|()| AppendResult {
            state: self.new_state,
            leaf_index: self.leaf_index,
            audit_path: self.audit_path,
        })
    }
}
