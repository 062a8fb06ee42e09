//! Cache of tree snapshots and generated proofs.
//!
//! Entries are non-owning copies of canonical state. A hit is never older
//! than `max_age`, never older than the last `put` for its key, and never
//! survives an [`invalidate`](StateCache::invalidate) of its tree. Each
//! invalidation bumps a per-tree generation; a fetch that started under an
//! older generation does not repopulate the cache.

use std::{
    collections::HashMap,
    future::Future,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use donation_ledger_merkle::{MerkleProof, MerkleState, TreeId};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    inserted_at: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    states: HashMap<TreeId, Entry<MerkleState>>,
    proofs: HashMap<(TreeId, u64), Entry<MerkleProof>>,
    generations: HashMap<TreeId, u64>,
}

impl CacheInner {
    fn generation(&self, tree_id: &TreeId) -> u64 {
        self.generations.get(tree_id).copied().unwrap_or_default()
    }
}

/// Snapshot and proof cache keyed by tree and leaf index.
#[derive(Debug)]
pub struct StateCache {
    max_age: Duration,
    inner: RwLock<CacheInner>,
}

impl StateCache {
    /// Create an empty cache whose entries expire after `max_age`.
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            inner: RwLock::new(CacheInner::default()),
        }
    }

    // Writes below never leave the maps half-updated, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn fresh<T: Clone>(&self, entry: Option<&Entry<T>>) -> Option<T> {
        entry
            .filter(|e| e.inserted_at.elapsed() <= self.max_age)
            .map(|e| e.value.clone())
    }

    /// Cached snapshot of `tree_id`, if present and fresh.
    pub fn get_state(&self, tree_id: &TreeId) -> Option<MerkleState> {
        self.fresh(self.read().states.get(tree_id))
    }

    /// Cache `state` for its tree.
    pub fn put_state(&self, state: MerkleState) {
        let mut inner = self.write();
        Self::insert_state(&mut inner, state);
    }

    fn insert_state(inner: &mut CacheInner, state: MerkleState) {
        let tree_id = *state.tree_id();
        // Proofs against another root are stale once this snapshot is current.
        inner
            .proofs
            .retain(|(tree, _), entry| tree != &tree_id || &entry.value.root == state.root());
        inner.states.insert(
            tree_id,
            Entry {
                value: state,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Cached proof for `leaf_index` in `tree_id`, if present and fresh.
    pub fn get_proof(&self, tree_id: &TreeId, leaf_index: u64) -> Option<MerkleProof> {
        self.fresh(self.read().proofs.get(&(*tree_id, leaf_index)))
    }

    /// Cache `proof` for `tree_id`.
    ///
    /// Ignored when a fresher snapshot of the tree with a different root is
    /// cached. Returns whether the proof was stored.
    pub fn put_proof(&self, tree_id: &TreeId, proof: MerkleProof) -> bool {
        let mut inner = self.write();
        Self::insert_proof(&mut inner, tree_id, proof)
    }

    fn insert_proof(inner: &mut CacheInner, tree_id: &TreeId, proof: MerkleProof) -> bool {
        if let Some(state) = inner.states.get(tree_id) {
            if state.value.root() != &proof.root {
                debug!(
                    tree_id = %tree_id,
                    leaf_index = proof.leaf_index,
                    "not caching proof for a superseded root"
                );
                return false;
            }
        }
        inner.proofs.insert(
            (*tree_id, proof.leaf_index),
            Entry {
                value: proof,
                inserted_at: Instant::now(),
            },
        );
        true
    }

    /// Drop every entry of `tree_id`.
    pub fn invalidate(&self, tree_id: &TreeId) {
        let mut inner = self.write();
        inner.states.remove(tree_id);
        inner.proofs.retain(|(tree, _), _| tree != tree_id);
        *inner.generations.entry(*tree_id).or_default() += 1;
        debug!(tree_id = %tree_id, "cache invalidated");
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.states.clear();
        inner.proofs.clear();
        for generation in inner.generations.values_mut() {
            *generation += 1;
        }
    }

    /// Current invalidation generation of `tree_id`.
    pub fn generation(&self, tree_id: &TreeId) -> u64 {
        self.read().generation(tree_id)
    }

    /// Serve the snapshot of `tree_id` from cache, or fetch and cache it.
    ///
    /// `force_refresh` skips the lookup but still repopulates.
    pub async fn state_or_fetch<F, E>(
        &self,
        tree_id: &TreeId,
        force_refresh: bool,
        fetch: F,
    ) -> Result<MerkleState, E>
    where
        F: Future<Output = Result<MerkleState, E>>,
    {
        if !force_refresh {
            if let Some(state) = self.get_state(tree_id) {
                return Ok(state);
            }
        }
        let generation = self.generation(tree_id);
        let state = fetch.await?;
        let mut inner = self.write();
        if inner.generation(tree_id) == generation {
            Self::insert_state(&mut inner, state);
        }
        Ok(state)
    }

    /// Serve the proof of `leaf_index` from cache, or fetch and cache it.
    pub async fn proof_or_fetch<F, E>(
        &self,
        tree_id: &TreeId,
        leaf_index: u64,
        force_refresh: bool,
        fetch: F,
    ) -> Result<MerkleProof, E>
    where
        F: Future<Output = Result<MerkleProof, E>>,
    {
        if !force_refresh {
            if let Some(proof) = self.get_proof(tree_id, leaf_index) {
                return Ok(proof);
            }
        }
        let generation = self.generation(tree_id);
        let proof = fetch.await?;
        let mut inner = self.write();
        if inner.generation(tree_id) == generation {
            Self::insert_proof(&mut inner, tree_id, proof.clone());
        }
        Ok(proof)
    }
}
