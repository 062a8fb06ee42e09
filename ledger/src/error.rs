use donation_ledger_merkle::{hex_digest, Digest, EncodingError, MerkleError, TreeId};
use thiserror::Error;

use crate::config::ConfigError;

/// Failures of inclusion or validity proof checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    /// The proof was checked and does not hold.
    #[error("invalid proof: {0}")]
    InvalidProof(String),
    /// The validity proof envelope is malformed or of an unknown version.
    #[error("unsupported proof format: {0}")]
    UnsupportedProofFormat(String),
    /// The validity verifier could not give an answer.
    #[error("validity verifier unavailable: {0}")]
    VerifierUnavailable(String),
}

/// Failures talking to the external ledger that may succeed on retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransientError {
    /// Transport failure.
    #[error("external ledger unreachable: {0}")]
    Unreachable(String),
    /// The call did not finish before its deadline.
    #[error("{operation} exceeded its {timeout_ms}ms deadline")]
    DeadlineExceeded {
        /// Which external call timed out.
        operation: &'static str,
        /// The deadline that was applied.
        timeout_ms: u64,
    },
}

/// How a caller should react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The input record or request is malformed. Never retry unchanged.
    InvalidData,
    /// A proof did not verify or the external ledger refused it.
    InvalidProof,
    /// Infrastructure failure; retrying later may succeed.
    Transient,
    /// Another update on the same tree is in flight; retry once it finishes.
    Concurrency,
    /// Capacity, lifecycle or cross-system consistency failure.
    Structural,
}

/// Errors returned by the ledger.
#[derive(Debug, Error)]
pub enum Error {
    // Input data errors
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("record for campaign {actual} submitted to campaign {expected}")]
    CampaignMismatch { expected: u64, actual: u64 },
    #[error("tally overflow: {0}")]
    ArithmeticOverflow(String),
    #[error(transparent)]
    Config(#[from] ConfigError),

    // Tree errors
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error("unknown tree {0}")]
    UnknownTree(TreeId),
    #[error("tree {0} is closed to new appends")]
    TreeClosed(TreeId),
    #[error("tree {0} is already registered")]
    TreeAlreadyRegistered(TreeId),
    #[error(
        "root mismatch on tree {tree_id} at leaf {leaf_index}: expected {}, external ledger has {}",
        hex_digest(.expected),
        describe_root(.actual)
    )]
    RootMismatch {
        tree_id: TreeId,
        leaf_index: u64,
        expected: Digest,
        actual: Option<Digest>,
    },

    // Proof errors
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error("external ledger rejected update: {0}")]
    Rejected(String),

    // Infrastructure errors
    #[error(transparent)]
    Transient(#[from] TransientError),
    #[error("update failed after {attempts} attempts: {last_error}")]
    UpdateFailed {
        attempts: u32,
        last_error: Box<Error>,
    },

    // Concurrency errors
    #[error("an update is already in progress on tree {0}")]
    ConcurrentUpdateInProgress(TreeId),
}

impl Error {
    /// Category deciding the caller's retry strategy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Encoding(_)
            | Error::CampaignMismatch { .. }
            | Error::ArithmeticOverflow(_)
            | Error::Config(_) => ErrorCategory::InvalidData,
            Error::Merkle(MerkleError::InvalidProof(_)) => ErrorCategory::InvalidProof,
            Error::Merkle(MerkleError::Encoding(_)) => ErrorCategory::InvalidData,
            Error::Merkle(_)
            | Error::UnknownTree(_)
            | Error::TreeClosed(_)
            | Error::TreeAlreadyRegistered(_)
            | Error::RootMismatch { .. } => ErrorCategory::Structural,
            Error::Proof(ProofError::VerifierUnavailable(_)) => ErrorCategory::Transient,
            Error::Proof(_) | Error::Rejected(_) => ErrorCategory::InvalidProof,
            Error::Transient(_) | Error::UpdateFailed { .. } => ErrorCategory::Transient,
            Error::ConcurrentUpdateInProgress(_) => ErrorCategory::Concurrency,
        }
    }

    /// Whether the coordinator may retry the operation that produced this
    /// error.
    ///
    /// `UpdateFailed` is terminal: its retries are already spent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transient(_) | Error::Proof(ProofError::VerifierUnavailable(_))
        )
    }
}

fn describe_root(root: &Option<Digest>) -> String {
    root.as_ref()
        .map_or_else(|| "no tree".to_string(), hex_digest)
}

/// Result alias for ledger operations.
pub type Result<T> = std::result::Result<T, Error>;
