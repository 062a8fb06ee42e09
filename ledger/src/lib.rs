//! Compressed, proof-verified donation ledger.
//!
//! Donations are appended to one fixed-height Merkle tree per campaign
//! instead of being stored as individual records. Each append is staged
//! locally, proved, checked against an optional validity proof, submitted to
//! an external ledger that holds the authoritative roots, and only then
//! committed.
//!
//! The tree itself lives in `donation-ledger-merkle`; this crate adds the
//! asynchronous parts: [`UpdateCoordinator`] (one in-flight update per tree,
//! retries, reconciliation), [`RecordSubmitter`] (the external boundary),
//! [`StateCache`] and the [`DonationLedger`] facade.

pub mod cache;
pub mod config;
pub mod coordinator;
mod error;
pub mod ledger;
pub mod memory;
pub mod pipeline;
pub mod submitter;
pub mod verifiers;

pub use cache::StateCache;
pub use config::{
    BackoffStrategy, CacheConfig, ConfigError, ConflictPolicy, CoordinatorConfig, LedgerConfig,
    RetryConfig,
};
pub use coordinator::{AppendOutcome, PendingUpdate, UpdateCoordinator, UpdatePhase};
pub use donation_ledger_merkle as merkle;
pub use error::{Error, ErrorCategory, ProofError, Result, TransientError};
pub use ledger::{CampaignKey, CampaignTally, DonationEvent, DonationLedger, DonationReceipt};
pub use memory::InMemoryExternalLedger;
pub use pipeline::{ProofPipeline, PublicInputs, ValidityProof, ValidityVerifier};
pub use submitter::{
    ExternalLedger, RecordSubmitter, SubmissionOutcome, SubmitRequest, SubmitResponse,
};
