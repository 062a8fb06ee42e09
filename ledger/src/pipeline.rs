//! Proof pipeline: inclusion proofs plus delegated validity proofs.
//!
//! Inclusion proofs are checked locally. Validity proofs (for example a
//! zero-knowledge proof that a donation's hidden fields satisfy the donation
//! predicate) are opaque here and handed to an injected
//! [`ValidityVerifier`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use donation_ledger_merkle::{
    hex_digest, Digest, DonationRecord, Leaf, MerkleProof, MerkleState, NodeStore,
};
use tracing::{debug, warn};

use crate::{Error, ProofError};

/// Current validity proof envelope version.
pub const VALIDITY_PROOF_VERSION: u8 = 1;

/// Length of the encoded public inputs: amount, donor commitment, timestamp.
pub const PUBLIC_INPUTS_LEN: usize = 8 + 32 + 8;

const HEADER_LEN: usize = 1 + PUBLIC_INPUTS_LEN;

/// Values a validity proof commits to publicly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicInputs {
    /// Donated amount.
    pub amount: u64,
    /// Donor commitment; the record's `donor_id`.
    pub donor_commitment: [u8; 32],
    /// Unix seconds.
    pub timestamp: i64,
}

impl PublicInputs {
    /// The inputs a proof for `record` must carry.
    pub fn for_record(record: &DonationRecord) -> Self {
        Self {
            amount: record.amount(),
            donor_commitment: *record.donor_id(),
            timestamp: record.timestamp(),
        }
    }

    /// `amount (8, LE) | donor_commitment (32) | timestamp (8, LE)`.
    pub fn to_bytes(&self) -> [u8; PUBLIC_INPUTS_LEN] {
        let mut out = [0u8; PUBLIC_INPUTS_LEN];
        out[0..8].copy_from_slice(&self.amount.to_le_bytes());
        out[8..40].copy_from_slice(&self.donor_commitment);
        out[40..48].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }
}

/// Versioned validity proof envelope.
///
/// ```text
/// version (1) | amount (8, LE) | donor_commitment (32) | timestamp (8, LE) | payload
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidityProof {
    version: u8,
    public_inputs: PublicInputs,
    payload: Vec<u8>,
}

impl ValidityProof {
    /// Wrap a proof payload at the current envelope version.
    pub fn new(public_inputs: PublicInputs, payload: Vec<u8>) -> Self {
        Self {
            version: VALIDITY_PROOF_VERSION,
            public_inputs,
            payload,
        }
    }

    /// Envelope for `record` carrying `payload`.
    pub fn for_record(record: &DonationRecord, payload: Vec<u8>) -> Self {
        Self::new(PublicInputs::for_record(record), payload)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn public_inputs(&self) -> &PublicInputs {
        &self.public_inputs
    }

    /// The opaque proof bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize the envelope.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.version);
        out.extend_from_slice(&self.public_inputs.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse an envelope.
    ///
    /// Empty input, input shorter than the header, an unknown version or an
    /// empty payload are all [`ProofError::UnsupportedProofFormat`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProofError> {
        if bytes.is_empty() {
            return Err(ProofError::UnsupportedProofFormat(
                "validity proof is empty".to_string(),
            ));
        }
        if bytes.len() < HEADER_LEN {
            return Err(ProofError::UnsupportedProofFormat(format!(
                "validity proof is {} bytes, header alone is {}",
                bytes.len(),
                HEADER_LEN
            )));
        }
        let version = bytes[0];
        if version != VALIDITY_PROOF_VERSION {
            return Err(ProofError::UnsupportedProofFormat(format!(
                "validity proof version {} (supported: {})",
                version, VALIDITY_PROOF_VERSION
            )));
        }
        let payload = bytes[HEADER_LEN..].to_vec();
        if payload.is_empty() {
            return Err(ProofError::UnsupportedProofFormat(
                "validity proof has no payload".to_string(),
            ));
        }

        let mut amount = [0u8; 8];
        amount.copy_from_slice(&bytes[1..9]);
        let mut donor_commitment = [0u8; 32];
        donor_commitment.copy_from_slice(&bytes[9..41]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[41..49]);

        Ok(Self {
            version,
            public_inputs: PublicInputs {
                amount: u64::from_le_bytes(amount),
                donor_commitment,
                timestamp: i64::from_le_bytes(timestamp),
            },
            payload,
        })
    }

    /// Check the public inputs are exactly `record`'s.
    pub fn check_binding(&self, record: &DonationRecord) -> Result<(), ProofError> {
        let expected = PublicInputs::for_record(record);
        if self.public_inputs != expected {
            return Err(ProofError::InvalidProof(format!(
                "validity proof public inputs {:?} do not match the donation {:?}",
                self.public_inputs, expected
            )));
        }
        Ok(())
    }
}

/// External validity proof checker.
///
/// Must return `Ok` only if `proof` attests that the hidden fields behind
/// `leaf` satisfy the donation predicate and binds to `root`.
#[async_trait]
pub trait ValidityVerifier: Send + Sync {
    /// Check `proof` for `leaf` under `root`.
    async fn verify(
        &self,
        leaf: &Leaf,
        proof: &ValidityProof,
        root: &Digest,
    ) -> Result<(), ProofError>;
}

/// Generates inclusion proofs and runs the full proof check before
/// submission.
#[derive(Clone)]
pub struct ProofPipeline {
    verifier: Arc<dyn ValidityVerifier>,
}

impl std::fmt::Debug for ProofPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofPipeline").finish_non_exhaustive()
    }
}

impl ProofPipeline {
    /// Pipeline delegating validity proofs to `verifier`.
    pub fn new(verifier: Arc<dyn ValidityVerifier>) -> Self {
        Self { verifier }
    }

    /// Inclusion proof of `leaf_index` against `state`.
    pub fn generate<S: NodeStore + ?Sized>(
        &self,
        state: &MerkleState,
        leaf_index: u64,
        store: &S,
    ) -> Result<MerkleProof, Error> {
        Ok(MerkleProof::generate(state, leaf_index, store).unwrap()?)
    }

    /// Recompute the root of `proof` and compare it to its claimed root.
    pub fn verify(&self, proof: &MerkleProof) -> bool {
        proof.verify()
    }

    /// Local inclusion check, then envelope checks, then the external
    /// verifier under `timeout`.
    ///
    /// A verifier that misses the deadline is reported as
    /// [`ProofError::VerifierUnavailable`].
    pub async fn verify_against_external(
        &self,
        proof: &MerkleProof,
        validity_proof: &[u8],
        timeout: Duration,
    ) -> Result<ValidityProof, ProofError> {
        if !proof.verify() {
            return Err(ProofError::InvalidProof(format!(
                "inclusion proof for leaf {} does not reproduce {}",
                proof.leaf_index,
                hex_digest(&proof.root)
            )));
        }

        let envelope = ValidityProof::from_bytes(validity_proof)?;

        debug!(
            leaf_index = proof.leaf_index,
            root = %hex_digest(&proof.root),
            payload_len = envelope.payload().len(),
            "verifying validity proof"
        );
        match tokio::time::timeout(
            timeout,
            self.verifier.verify(&proof.leaf, &envelope, &proof.root),
        )
        .await
        {
            Ok(Ok(())) => Ok(envelope),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    leaf_index = proof.leaf_index,
                    timeout_ms = timeout.as_millis() as u64,
                    "validity verifier missed its deadline"
                );
                Err(ProofError::VerifierUnavailable(format!(
                    "no answer within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }
}
