//! Boundary to the external ledger that holds the authoritative roots.
//!
//! No cryptography happens here: the submitter packages a staged update,
//! forwards it, and maps whatever comes back into a [`SubmissionOutcome`].

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use bincode::{Decode, Encode};
use donation_ledger_merkle::{hex_digest, Digest, Leaf, MerkleProof, MerkleState, TreeId};
use tracing::{debug, warn};

use crate::TransientError;

const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// A staged root transition as sent to the external ledger.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SubmitRequest {
    /// Tree being appended to.
    pub tree_id: TreeId,
    /// Root the update was computed against.
    pub old_root: Digest,
    /// The new leaf.
    pub leaf: Leaf,
    /// Where the leaf goes.
    pub leaf_index: u64,
    /// Inclusion proof of `leaf` against the staged root.
    pub proof: MerkleProof,
    /// Encoded validity proof envelope, if any.
    pub validity_proof: Option<Vec<u8>>,
}

impl SubmitRequest {
    /// Root the update moves the tree to.
    pub fn staged_root(&self) -> &Digest {
        &self.proof.root
    }

    /// Encode as an instruction payload.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_no_limit();
        bincode::encode_to_vec(self, config)
    }

    /// Decode an instruction payload.
    pub fn decode_from_slice(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_limit::<MAX_REQUEST_BYTES>();
        Ok(bincode::decode_from_slice(bytes, config)?.0)
    }
}

/// What the external ledger answered.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum SubmitResponse {
    /// The transition was applied.
    Committed {
        /// Root after the transition.
        new_root: Digest,
    },
    /// The transition was refused.
    Rejected {
        /// Why.
        reason: String,
    },
}

/// The external state-transition target.
#[async_trait]
pub trait ExternalLedger: Send + Sync {
    /// Apply a staged update.
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, TransientError>;

    /// Authoritative state of `tree_id`, or `None` if it holds no such tree.
    async fn query_state(&self, tree_id: &TreeId) -> Result<Option<MerkleState>, TransientError>;

    /// Proof of `leaf_index` as the external ledger sees it.
    async fn query_proof(
        &self,
        tree_id: &TreeId,
        leaf_index: u64,
    ) -> Result<Option<MerkleProof>, TransientError>;
}

/// Result of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Applied; the external ledger now has this root.
    Accepted(Digest),
    /// Refused; retrying the same request will not help.
    Rejected(String),
    /// No answer. The update may or may not have been applied.
    Unreachable(TransientError),
}

/// Forwards staged updates and queries to an [`ExternalLedger`], each under a
/// deadline.
#[derive(Clone)]
pub struct RecordSubmitter {
    ledger: Arc<dyn ExternalLedger>,
}

impl std::fmt::Debug for RecordSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSubmitter").finish_non_exhaustive()
    }
}

async fn with_deadline<T>(
    operation: &'static str,
    deadline: Duration,
    call: impl Future<Output = Result<T, TransientError>>,
) -> Result<T, TransientError> {
    tokio::time::timeout(deadline, call)
        .await
        .unwrap_or_else(|_| {
            Err(TransientError::DeadlineExceeded {
                operation,
                timeout_ms: deadline.as_millis() as u64,
            })
        })
}

impl RecordSubmitter {
    pub fn new(ledger: Arc<dyn ExternalLedger>) -> Self {
        Self { ledger }
    }

    /// Package and send a staged update.
    pub async fn submit(
        &self,
        tree_id: TreeId,
        old_root: Digest,
        proof: MerkleProof,
        validity_proof: Option<Vec<u8>>,
        deadline: Duration,
    ) -> SubmissionOutcome {
        let request = SubmitRequest {
            tree_id,
            old_root,
            leaf: proof.leaf,
            leaf_index: proof.leaf_index,
            proof,
            validity_proof,
        };
        let leaf_index = request.leaf_index;
        debug!(
            tree_id = %tree_id,
            leaf_index,
            staged_root = %hex_digest(request.staged_root()),
            "submitting update"
        );

        match with_deadline("submit", deadline, self.ledger.submit(request)).await {
            Ok(SubmitResponse::Committed { new_root }) => SubmissionOutcome::Accepted(new_root),
            Ok(SubmitResponse::Rejected { reason }) => {
                warn!(tree_id = %tree_id, leaf_index, %reason, "update rejected");
                SubmissionOutcome::Rejected(reason)
            }
            Err(e) => {
                warn!(tree_id = %tree_id, leaf_index, error = %e, "external ledger unreachable");
                SubmissionOutcome::Unreachable(e)
            }
        }
    }

    /// Authoritative state of `tree_id`.
    pub async fn query_state(
        &self,
        tree_id: &TreeId,
        deadline: Duration,
    ) -> Result<Option<MerkleState>, TransientError> {
        with_deadline("query_state", deadline, self.ledger.query_state(tree_id)).await
    }

    /// External proof of `leaf_index`.
    pub async fn query_proof(
        &self,
        tree_id: &TreeId,
        leaf_index: u64,
        deadline: Duration,
    ) -> Result<Option<MerkleProof>, TransientError> {
        with_deadline(
            "query_proof",
            deadline,
            self.ledger.query_proof(tree_id, leaf_index),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use donation_ledger_merkle::{DonationRecord, MemNodeStore};

    use super::*;
    use crate::memory::InMemoryExternalLedger;

    fn staged() -> (MerkleState, MerkleProof) {
        let store = MemNodeStore::new();
        let leaf = DonationRecord::new([3u8; 32], 5, 60, 2).leaf().unwrap();
        let state = MerkleState::initialize(TreeId::new([1u8; 32]), 2).unwrap();
        let prepared = state.prepare_append(leaf, &store).unwrap().unwrap();
        (state, prepared.proof())
    }

    #[test]
    fn test_request_bincode_round_trip() {
        let (state, proof) = staged();
        let request = SubmitRequest {
            tree_id: *state.tree_id(),
            old_root: *state.root(),
            leaf: proof.leaf,
            leaf_index: 0,
            proof,
            validity_proof: Some(vec![1, 2, 3]),
        };
        let bytes = request.encode_to_vec().unwrap();
        assert_eq!(SubmitRequest::decode_from_slice(&bytes).unwrap(), request);
    }

    #[tokio::test]
    async fn test_outcomes() {
        let (state, proof) = staged();
        let ledger = Arc::new(InMemoryExternalLedger::new());
        let submitter = RecordSubmitter::new(ledger.clone());
        let deadline = Duration::from_secs(1);

        ledger.fail_next(1);
        assert_matches!(
            submitter
                .submit(*state.tree_id(), *state.root(), proof.clone(), None, deadline)
                .await,
            SubmissionOutcome::Unreachable(TransientError::Unreachable(_))
        );

        assert_eq!(
            submitter
                .submit(*state.tree_id(), *state.root(), proof.clone(), None, deadline)
                .await,
            SubmissionOutcome::Accepted(proof.root)
        );

        // Same update again: the old root is no longer current.
        assert_matches!(
            submitter
                .submit(*state.tree_id(), *state.root(), proof, None, deadline)
                .await,
            SubmissionOutcome::Rejected(_)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let (state, _) = staged();
        let ledger = Arc::new(InMemoryExternalLedger::new());
        ledger.set_latency(Duration::from_secs(10));
        let submitter = RecordSubmitter::new(ledger);

        assert_matches!(
            submitter
                .query_state(state.tree_id(), Duration::from_millis(500))
                .await,
            Err(TransientError::DeadlineExceeded {
                operation: "query_state",
                timeout_ms: 500
            })
        );
    }
}
