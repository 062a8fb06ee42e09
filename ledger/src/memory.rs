//! In-memory [`ExternalLedger`].
//!
//! Keeps its own copy of every tree and re-derives each submitted root
//! before accepting it, the way an on-chain program would. Faults can be
//! injected to exercise retries and reconciliation.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use donation_ledger_merkle::{
    empty_root, hex_digest, MemNodeStore, MerkleProof, MerkleState, TreeId, MAX_HEIGHT,
};
use tracing::debug;

use crate::{
    pipeline::ValidityProof,
    submitter::{ExternalLedger, SubmitRequest, SubmitResponse},
    TransientError,
};

#[derive(Debug, Default)]
struct Faults {
    unreachable: u32,
    lost_responses: u32,
    rejections: Vec<String>,
    latency: Duration,
}

/// External ledger held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryExternalLedger {
    store: MemNodeStore,
    trees: Mutex<HashMap<TreeId, MerkleState>>,
    faults: Mutex<Faults>,
    submissions: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryExternalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` submissions before they reach the ledger.
    pub fn fail_next(&self, count: u32) {
        lock(&self.faults).unreachable = count;
    }

    /// Apply the next `count` submissions but report them unreachable.
    pub fn lose_next_responses(&self, count: u32) {
        lock(&self.faults).lost_responses = count;
    }

    /// Refuse the next submission with `reason`.
    pub fn reject_next(&self, reason: impl Into<String>) {
        lock(&self.faults).rejections.push(reason.into());
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.faults).latency = latency;
    }

    /// Number of `submit` calls received.
    pub fn submissions(&self) -> u32 {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Current state of `tree_id`.
    pub fn state(&self, tree_id: &TreeId) -> Option<MerkleState> {
        lock(&self.trees).get(tree_id).copied()
    }

    /// Replace the state of a tree, as if another writer had moved it.
    pub fn overwrite_state(&self, state: MerkleState) {
        lock(&self.trees).insert(*state.tree_id(), state);
    }

    async fn delay(&self) {
        let latency = lock(&self.faults).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn apply(&self, request: &SubmitRequest) -> Result<MerkleState, String> {
        let mut trees = lock(&self.trees);
        let height = request.proof.siblings.len();
        let current = match trees.get(&request.tree_id) {
            Some(state) => *state,
            None => {
                if height == 0 || height > MAX_HEIGHT as usize {
                    return Err(format!("proof height {height} is not supported"));
                }
                let height = height as u8;
                if request.old_root != empty_root(height) {
                    return Err(format!("unknown tree {}", request.tree_id));
                }
                MerkleState::initialize(request.tree_id, height).map_err(|e| e.to_string())?
            }
        };

        if current.root() != &request.old_root {
            return Err(format!(
                "stale root: update built on {}, ledger is at {}",
                hex_digest(&request.old_root),
                hex_digest(current.root())
            ));
        }
        if request.leaf_index != current.leaf_count() || request.proof.leaf != request.leaf {
            return Err(format!(
                "leaf must be appended at index {}",
                current.leaf_count()
            ));
        }
        if let Some(bytes) = &request.validity_proof {
            ValidityProof::from_bytes(bytes).map_err(|e| e.to_string())?;
        }

        let prepared = current
            .prepare_append(request.leaf, &self.store)
            .unwrap()
            .map_err(|e| e.to_string())?;
        if prepared.new_state().root() != request.staged_root() {
            return Err(format!(
                "staged root {} does not match recomputed {}",
                hex_digest(request.staged_root()),
                hex_digest(prepared.new_state().root())
            ));
        }
        let state = prepared
            .commit(&self.store)
            .unwrap()
            .map_err(|e| e.to_string())?
            .state;
        trees.insert(request.tree_id, state);
        Ok(state)
    }
}

#[async_trait]
impl ExternalLedger for InMemoryExternalLedger {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, TransientError> {
        self.delay().await;
        self.submissions.fetch_add(1, Ordering::SeqCst);

        let rejection = {
            let mut faults = lock(&self.faults);
            if faults.unreachable > 0 {
                faults.unreachable -= 1;
                return Err(TransientError::Unreachable("connection refused".to_string()));
            }
            faults.rejections.pop()
        };
        if let Some(reason) = rejection {
            return Ok(SubmitResponse::Rejected { reason });
        }

        let state = match self.apply(&request) {
            Ok(state) => state,
            Err(reason) => return Ok(SubmitResponse::Rejected { reason }),
        };
        debug!(
            tree_id = %request.tree_id,
            leaf_index = request.leaf_index,
            root = %hex_digest(state.root()),
            "external ledger applied update"
        );

        let mut faults = lock(&self.faults);
        if faults.lost_responses > 0 {
            faults.lost_responses -= 1;
            return Err(TransientError::Unreachable("connection reset".to_string()));
        }
        Ok(SubmitResponse::Committed {
            new_root: *state.root(),
        })
    }

    async fn query_state(&self, tree_id: &TreeId) -> Result<Option<MerkleState>, TransientError> {
        self.delay().await;
        Ok(self.state(tree_id))
    }

    async fn query_proof(
        &self,
        tree_id: &TreeId,
        leaf_index: u64,
    ) -> Result<Option<MerkleProof>, TransientError> {
        self.delay().await;
        let Some(state) = self.state(tree_id) else {
            return Ok(None);
        };
        if leaf_index >= state.leaf_count() {
            return Ok(None);
        }
        MerkleProof::generate(&state, leaf_index, &self.store)
            .unwrap()
            .map(Some)
            .map_err(|e| TransientError::Unreachable(format!("external ledger error: {e}")))
    }
}
