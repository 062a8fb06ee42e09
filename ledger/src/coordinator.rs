//! Per-tree update coordination.
//!
//! Every append to a tree runs under that tree's update slot, so at most one
//! root transition is in flight per tree. An append stages the new path
//! locally, checks its proofs, submits it to the external ledger and only
//! then writes the staged nodes. Transient failures are retried with backoff;
//! before each retry the coordinator asks the external ledger where the tree
//! actually is, since an unanswered submission may still have been applied.
//!
//! A staged update whose outcome is unknown (its future was dropped, or
//! every retry went unanswered) stays attached to the tree and is resolved
//! against the external ledger at the start of the next append.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::Duration,
};

use donation_ledger_merkle::{
    hex_digest, AppendResult, Digest, DonationRecord, Leaf, MerkleProof, MerkleState, NodeStore,
    PreparedAppend, TreeId,
};
use tracing::{debug, info, warn};

use crate::{
    cache::StateCache,
    config::{ConflictPolicy, LedgerConfig, RetryConfig},
    pipeline::{ProofPipeline, ValidityProof},
    submitter::{RecordSubmitter, SubmissionOutcome},
    Error, ProofError, Result,
};

/// Observable phase of a tree's update slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    /// No append in flight.
    Idle,
    /// An append holds the slot.
    Updating,
    /// The last append failed. Cleared when the next append starts.
    Failed,
}

/// An append in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub tree_id: TreeId,
    pub old_root: Digest,
    pub new_leaf: Leaf,
    pub attempt_count: u32,
}

/// A committed append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Canonical state after the append.
    pub state: MerkleState,
    /// Where the leaf went.
    pub leaf_index: u64,
    /// Inclusion proof of the leaf against `state`'s root.
    pub proof: MerkleProof,
    /// Attempts it took, first included.
    pub attempts: u32,
}

#[derive(Debug)]
struct SlotStatus {
    state: MerkleState,
    phase: UpdatePhase,
    closed: bool,
    in_doubt: Option<PreparedAppend>,
}

#[derive(Debug)]
struct TreeSlot {
    update: tokio::sync::Mutex<()>,
    status: Mutex<SlotStatus>,
}

impl TreeSlot {
    fn status(&self) -> MutexGuard<'_, SlotStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resets the phase when an append ends, including when its future is
/// dropped.
struct PhaseGuard<'a> {
    slot: &'a TreeSlot,
    outcome: UpdatePhase,
}

impl<'a> PhaseGuard<'a> {
    fn enter(slot: &'a TreeSlot) -> Self {
        slot.status().phase = UpdatePhase::Updating;
        Self {
            slot,
            outcome: UpdatePhase::Idle,
        }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.slot.status().phase = self.outcome;
    }
}

enum Reconciled {
    Applied,
    NotApplied,
}

/// Serializes appends per tree and drives them to the external ledger.
pub struct UpdateCoordinator {
    retry: RetryConfig,
    conflict_policy: ConflictPolicy,
    call_timeout: Duration,
    store: Arc<dyn NodeStore>,
    cache: Arc<StateCache>,
    pipeline: ProofPipeline,
    submitter: RecordSubmitter,
    trees: RwLock<HashMap<TreeId, Arc<TreeSlot>>>,
}

impl std::fmt::Debug for UpdateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCoordinator")
            .field("retry", &self.retry)
            .field("conflict_policy", &self.conflict_policy)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl UpdateCoordinator {
    pub fn new(
        config: &LedgerConfig,
        store: Arc<dyn NodeStore>,
        cache: Arc<StateCache>,
        pipeline: ProofPipeline,
        submitter: RecordSubmitter,
    ) -> Self {
        Self {
            retry: config.retry,
            conflict_policy: config.coordinator.conflict_policy,
            call_timeout: config.coordinator.call_timeout,
            store,
            cache,
            pipeline,
            submitter,
            trees: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, tree_id: &TreeId) -> Result<Arc<TreeSlot>> {
        self.trees
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tree_id)
            .cloned()
            .ok_or(Error::UnknownTree(*tree_id))
    }

    /// Start coordinating a tree at `state`.
    pub fn register(&self, state: MerkleState) -> Result<()> {
        let mut trees = self.trees.write().unwrap_or_else(|e| e.into_inner());
        let tree_id = *state.tree_id();
        if trees.contains_key(&tree_id) {
            return Err(Error::TreeAlreadyRegistered(tree_id));
        }
        trees.insert(
            tree_id,
            Arc::new(TreeSlot {
                update: tokio::sync::Mutex::new(()),
                status: Mutex::new(SlotStatus {
                    state,
                    phase: UpdatePhase::Idle,
                    closed: false,
                    in_doubt: None,
                }),
            }),
        );
        debug!(tree_id = %tree_id, height = state.height(), "tree registered");
        Ok(())
    }

    /// Refuse further appends to `tree_id`. Waits for an in-flight append to
    /// finish. The tree stays readable.
    pub async fn close(&self, tree_id: &TreeId) -> Result<()> {
        let slot = self.slot(tree_id)?;
        let _update = slot.update.lock().await;
        slot.status().closed = true;
        info!(tree_id = %tree_id, "tree closed");
        Ok(())
    }

    /// Canonical state of `tree_id`.
    pub fn state(&self, tree_id: &TreeId) -> Result<MerkleState> {
        Ok(self.slot(tree_id)?.status().state)
    }

    pub fn phase(&self, tree_id: &TreeId) -> Result<UpdatePhase> {
        Ok(self.slot(tree_id)?.status().phase)
    }

    pub fn is_closed(&self, tree_id: &TreeId) -> Result<bool> {
        Ok(self.slot(tree_id)?.status().closed)
    }

    /// Inclusion proof of `leaf_index` against the canonical state.
    pub fn proof(&self, tree_id: &TreeId, leaf_index: u64) -> Result<MerkleProof> {
        let slot = self.slot(tree_id)?;
        // Held while reading nodes so a concurrent commit cannot move the
        // store past the state.
        let status = slot.status();
        self.pipeline
            .generate(&status.state, leaf_index, self.store.as_ref())
    }

    /// Default deadline for external calls.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// The submitter used to reach the external ledger.
    pub fn submitter(&self) -> &RecordSubmitter {
        &self.submitter
    }

    /// Append `record` to `tree_id`.
    ///
    /// `validity_proof` is an encoded [`ValidityProof`] envelope whose public
    /// inputs must match `record`. `deadline` bounds each external call and
    /// defaults to the configured call timeout.
    pub async fn append(
        &self,
        tree_id: &TreeId,
        record: &DonationRecord,
        validity_proof: Option<Vec<u8>>,
        deadline: Option<Duration>,
    ) -> Result<AppendOutcome> {
        let leaf = record.leaf()?;
        if let Some(bytes) = &validity_proof {
            ValidityProof::from_bytes(bytes)?.check_binding(record)?;
        }
        let timeout = deadline.unwrap_or(self.call_timeout);

        let slot = self.slot(tree_id)?;
        let _update = match self.conflict_policy {
            ConflictPolicy::Queue => slot.update.lock().await,
            ConflictPolicy::Reject => slot
                .update
                .try_lock()
                .map_err(|_| Error::ConcurrentUpdateInProgress(*tree_id))?,
        };

        if slot.status().closed {
            return Err(Error::TreeClosed(*tree_id));
        }
        let mut phase = PhaseGuard::enter(&slot);

        let result = async {
            let state = self.settle_in_doubt(&slot, tree_id, timeout).await?;
            self.run_update(&slot, state, leaf, validity_proof, timeout)
                .await
        }
        .await;

        phase.outcome = match &result {
            Ok(_) => UpdatePhase::Idle,
            Err(e) => {
                warn!(tree_id = %tree_id, error = %e, "append failed");
                UpdatePhase::Failed
            }
        };
        result
    }

    /// Resolve what an earlier append left behind, retrying transient
    /// failures under the same policy as a submission.
    async fn settle_in_doubt(
        &self,
        slot: &TreeSlot,
        tree_id: &TreeId,
        timeout: Duration,
    ) -> Result<MerkleState> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.resolve_in_doubt(slot, timeout).await {
                Ok(state) => return Ok(state),
                Err(e) => self.back_off(tree_id, attempt, e).await?,
            }
        }
    }

    /// Wait before attempt `attempt + 1`, or give up with `error`.
    async fn back_off(&self, tree_id: &TreeId, attempt: u32, error: Error) -> Result<()> {
        if !error.is_transient() {
            return Err(error);
        }
        if attempt > self.retry.max_retries {
            return Err(Error::UpdateFailed {
                attempts: attempt,
                last_error: Box::new(error),
            });
        }
        let delay = self.retry.delay_for_attempt(attempt);
        warn!(
            tree_id = %tree_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// Settle a staged update left behind by an earlier append.
    async fn resolve_in_doubt(&self, slot: &TreeSlot, timeout: Duration) -> Result<MerkleState> {
        let (state, prepared) = {
            let mut status = slot.status();
            match status.in_doubt.take() {
                Some(prepared) => (status.state, prepared),
                None => return Ok(status.state),
            }
        };
        let tree_id = *state.tree_id();
        let pending = PendingUpdate {
            tree_id,
            old_root: *state.root(),
            new_leaf: *prepared.leaf(),
            attempt_count: 0,
        };

        let reconciled = self
            .reconcile(&pending, &state, prepared.new_state().root(), prepared.leaf_index(), timeout)
            .await;
        match reconciled {
            Ok(Reconciled::Applied) => {
                info!(
                    tree_id = %tree_id,
                    leaf_index = prepared.leaf_index(),
                    "adopting update applied by the external ledger"
                );
                Ok(self.commit(slot, prepared)?.state)
            }
            Ok(Reconciled::NotApplied) => {
                debug!(tree_id = %tree_id, "discarding unapplied update");
                Ok(state)
            }
            Err(e) => {
                slot.status().in_doubt = Some(prepared);
                Err(e)
            }
        }
    }

    async fn run_update(
        &self,
        slot: &TreeSlot,
        state: MerkleState,
        leaf: Leaf,
        validity_proof: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<AppendOutcome> {
        let prepared = state.prepare_append(leaf, self.store.as_ref()).unwrap()?;
        let proof = prepared.proof();
        let staged_root = *prepared.new_state().root();
        let leaf_index = prepared.leaf_index();

        let mut pending = PendingUpdate {
            tree_id: *state.tree_id(),
            old_root: *state.root(),
            new_leaf: leaf,
            attempt_count: 0,
        };

        loop {
            pending.attempt_count += 1;
            let attempt = pending.attempt_count;

            let result = if attempt > 1 {
                match self
                    .reconcile(&pending, &state, &staged_root, leaf_index, timeout)
                    .await
                {
                    Ok(Reconciled::Applied) => Ok(()),
                    Ok(Reconciled::NotApplied) => {
                        self.try_submit(slot, &pending, &prepared, &proof, &validity_proof, timeout)
                            .await
                    }
                    Err(e) => Err(e),
                }
            } else {
                self.try_submit(slot, &pending, &prepared, &proof, &validity_proof, timeout)
                    .await
            };

            match result {
                Ok(()) => break,
                Err(e) => self.back_off(&pending.tree_id, attempt, e).await?,
            }
        }

        let committed = self.commit(slot, prepared)?;
        info!(
            tree_id = %pending.tree_id,
            leaf_index,
            root = %hex_digest(committed.state.root()),
            attempts = pending.attempt_count,
            "append committed"
        );
        Ok(AppendOutcome {
            state: committed.state,
            leaf_index,
            proof,
            attempts: pending.attempt_count,
        })
    }

    async fn try_submit(
        &self,
        slot: &TreeSlot,
        pending: &PendingUpdate,
        prepared: &PreparedAppend,
        proof: &MerkleProof,
        validity_proof: &Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<()> {
        match validity_proof {
            Some(bytes) => {
                self.pipeline
                    .verify_against_external(proof, bytes, timeout)
                    .await?;
            }
            None if !self.pipeline.verify(proof) => {
                return Err(ProofError::InvalidProof(format!(
                    "staged proof for leaf {} does not reproduce its root",
                    proof.leaf_index
                ))
                .into());
            }
            None => {}
        }

        // From here the external ledger may apply the update without us
        // hearing back.
        slot.status().in_doubt = Some(prepared.clone());
        let outcome = self
            .submitter
            .submit(
                pending.tree_id,
                pending.old_root,
                proof.clone(),
                validity_proof.clone(),
                timeout,
            )
            .await;

        match outcome {
            SubmissionOutcome::Accepted(root) if &root == prepared.new_state().root() => Ok(()),
            SubmissionOutcome::Accepted(root) => Err(Error::RootMismatch {
                tree_id: pending.tree_id,
                leaf_index: prepared.leaf_index(),
                expected: *prepared.new_state().root(),
                actual: Some(root),
            }),
            SubmissionOutcome::Rejected(reason) => {
                slot.status().in_doubt = None;
                Err(Error::Rejected(reason))
            }
            SubmissionOutcome::Unreachable(e) => Err(e.into()),
        }
    }

    /// Where is the external ledger relative to `state` and the staged root?
    async fn reconcile(
        &self,
        pending: &PendingUpdate,
        state: &MerkleState,
        staged_root: &Digest,
        leaf_index: u64,
        timeout: Duration,
    ) -> Result<Reconciled> {
        let remote = self
            .submitter
            .query_state(&pending.tree_id, timeout)
            .await?;
        let remote_root = remote.as_ref().map(|s| *s.root());
        debug!(
            tree_id = %pending.tree_id,
            leaf_index,
            attempt = pending.attempt_count,
            remote_root = ?remote_root.as_ref().map(hex_digest),
            "reconciling with external ledger"
        );

        match remote_root {
            Some(root) if &root == staged_root => Ok(Reconciled::Applied),
            Some(root) if root == pending.old_root => Ok(Reconciled::NotApplied),
            None if state.leaf_count() == 0 => Ok(Reconciled::NotApplied),
            actual => Err(Error::RootMismatch {
                tree_id: pending.tree_id,
                leaf_index,
                expected: pending.old_root,
                actual,
            }),
        }
    }

    fn commit(&self, slot: &TreeSlot, prepared: PreparedAppend) -> Result<AppendResult> {
        let tree_id = *prepared.new_state().tree_id();
        let mut status = slot.status();
        let committed = match prepared.clone().commit(self.store.as_ref()).unwrap() {
            Ok(committed) => committed,
            Err(e) => {
                status.in_doubt = Some(prepared);
                return Err(e.into());
            }
        };
        status.state = committed.state;
        status.in_doubt = None;
        drop(status);
        self.cache.invalidate(&tree_id);
        Ok(committed)
    }
}
