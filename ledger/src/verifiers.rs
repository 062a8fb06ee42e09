//! Deterministic [`ValidityVerifier`]s for wiring without a prover and for
//! tests.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use donation_ledger_merkle::{hash_bytes, Digest, Leaf};

use crate::{
    pipeline::{PublicInputs, ValidityProof, ValidityVerifier},
    ProofError,
};

/// Accepts every well-formed envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllVerifier;

#[async_trait]
impl ValidityVerifier for AcceptAllVerifier {
    async fn verify(&self, _: &Leaf, _: &ValidityProof, _: &Digest) -> Result<(), ProofError> {
        Ok(())
    }
}

/// Rejects every proof with a fixed reason.
#[derive(Debug, Clone)]
pub struct RejectingVerifier {
    reason: String,
}

impl RejectingVerifier {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ValidityVerifier for RejectingVerifier {
    async fn verify(&self, _: &Leaf, _: &ValidityProof, _: &Digest) -> Result<(), ProofError> {
        Err(ProofError::InvalidProof(self.reason.clone()))
    }
}

/// Accepts a proof whose payload is the attestation of its public inputs,
/// `blake3(public_inputs)`.
///
/// Stands in for a real circuit: a payload produced for one set of inputs
/// does not verify for another.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublicInputsVerifier;

impl PublicInputsVerifier {
    /// The payload this verifier accepts for `inputs`.
    pub fn attest(inputs: &PublicInputs) -> Vec<u8> {
        hash_bytes(&inputs.to_bytes()).to_vec()
    }
}

#[async_trait]
impl ValidityVerifier for PublicInputsVerifier {
    async fn verify(
        &self,
        _: &Leaf,
        proof: &ValidityProof,
        _: &Digest,
    ) -> Result<(), ProofError> {
        if proof.payload() == Self::attest(proof.public_inputs()).as_slice() {
            Ok(())
        } else {
            Err(ProofError::InvalidProof(
                "payload does not attest the public inputs".to_string(),
            ))
        }
    }
}

/// Reports itself unavailable for the first `failures` calls, then accepts.
#[derive(Debug)]
pub struct FlakyVerifier {
    remaining_failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyVerifier {
    pub fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of `verify` calls so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ValidityVerifier for FlakyVerifier {
    async fn verify(&self, _: &Leaf, _: &ValidityProof, _: &Digest) -> Result<(), ProofError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(ProofError::VerifierUnavailable("prover busy".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Accepts after sleeping for `delay`.
#[derive(Debug, Clone, Copy)]
pub struct SlowVerifier {
    delay: Duration,
}

impl SlowVerifier {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ValidityVerifier for SlowVerifier {
    async fn verify(&self, _: &Leaf, _: &ValidityProof, _: &Digest) -> Result<(), ProofError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
