//! Leaf codec: the fixed-width byte layout of a donation record.
//!
//! ```text
//! donor_id (32) | amount (8, LE) | timestamp (8, LE) | campaign_id (8, LE)
//! ```
//!
//! Every system that needs to agree on leaf identity must produce these exact
//! 56 bytes; the leaf is their Blake3 digest.

use std::fmt;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{hash_bytes, hex_digest, Digest};

/// Length of an encoded [`DonationRecord`].
pub const ENCODED_RECORD_LEN: usize = 56;

/// Errors from encoding or decoding donation records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    /// Donations must move a positive amount.
    #[error("donation amount must be non-zero")]
    ZeroAmount,
    /// Timestamps are unix seconds and may not precede the epoch.
    #[error("timestamp {0} is before the unix epoch")]
    NegativeTimestamp(i64),
    /// A transported amount wider than the 64-bit field.
    #[error("amount {0} does not fit in 64 bits")]
    AmountOutOfRange(u128),
    /// A transported timestamp wider than the 64-bit field.
    #[error("timestamp {0} does not fit in 64 bits")]
    TimestampOutOfRange(i128),
    /// Encoded input of the wrong size.
    #[error("encoded record must be {expected} bytes, got {actual}")]
    InvalidLength {
        /// Always [`ENCODED_RECORD_LEN`].
        expected: usize,
        /// Bytes received.
        actual: usize,
    },
}

/// One donation. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct DonationRecord {
    #[serde(with = "crate::hex_serde")]
    donor_id: [u8; 32],
    amount: u64,
    timestamp: i64,
    campaign_id: u64,
}

impl DonationRecord {
    /// Create a record. Domain checks happen in [`encode`].
    pub const fn new(donor_id: [u8; 32], amount: u64, timestamp: i64, campaign_id: u64) -> Self {
        Self {
            donor_id,
            amount,
            timestamp,
            campaign_id,
        }
    }

    /// Create a record from values carried in wider transport types.
    pub fn try_from_wide(
        donor_id: [u8; 32],
        amount: u128,
        timestamp: i128,
        campaign_id: u64,
    ) -> Result<Self, EncodingError> {
        let amount = u64::try_from(amount).map_err(|_| EncodingError::AmountOutOfRange(amount))?;
        let timestamp =
            i64::try_from(timestamp).map_err(|_| EncodingError::TimestampOutOfRange(timestamp))?;
        Ok(Self::new(donor_id, amount, timestamp, campaign_id))
    }

    /// Donor public key or commitment.
    pub fn donor_id(&self) -> &[u8; 32] {
        &self.donor_id
    }

    /// Donated amount in base units.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Unix seconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Campaign the donation belongs to.
    pub fn campaign_id(&self) -> u64 {
        self.campaign_id
    }

    /// See [`encode`].
    pub fn encode(&self) -> Result<[u8; ENCODED_RECORD_LEN], EncodingError> {
        encode(self)
    }

    /// See [`decode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, EncodingError> {
        decode(bytes)
    }

    /// The leaf this record occupies in the ledger.
    pub fn leaf(&self) -> Result<Leaf, EncodingError> {
        Leaf::from_record(self)
    }

    fn validate(&self) -> Result<(), EncodingError> {
        if self.amount == 0 {
            return Err(EncodingError::ZeroAmount);
        }
        if self.timestamp < 0 {
            return Err(EncodingError::NegativeTimestamp(self.timestamp));
        }
        Ok(())
    }
}

/// Encode a record into its 56-byte wire form.
///
/// Fails for records outside the valid domain: zero amounts and timestamps
/// before the epoch.
pub fn encode(record: &DonationRecord) -> Result<[u8; ENCODED_RECORD_LEN], EncodingError> {
    record.validate()?;
    let mut out = [0u8; ENCODED_RECORD_LEN];
    out[0..32].copy_from_slice(&record.donor_id);
    out[32..40].copy_from_slice(&record.amount.to_le_bytes());
    out[40..48].copy_from_slice(&record.timestamp.to_le_bytes());
    out[48..56].copy_from_slice(&record.campaign_id.to_le_bytes());
    Ok(out)
}

/// Decode the 56-byte wire form. Rejects anything [`encode`] would not
/// produce.
pub fn decode(bytes: &[u8]) -> Result<DonationRecord, EncodingError> {
    let bytes: &[u8; ENCODED_RECORD_LEN] =
        bytes
            .try_into()
            .map_err(|_| EncodingError::InvalidLength {
                expected: ENCODED_RECORD_LEN,
                actual: bytes.len(),
            })?;
    let mut donor_id = [0u8; 32];
    donor_id.copy_from_slice(&bytes[0..32]);
    let record = DonationRecord {
        donor_id,
        amount: u64::from_le_bytes(le8(&bytes[32..40])),
        timestamp: i64::from_le_bytes(le8(&bytes[40..48])),
        campaign_id: u64::from_le_bytes(le8(&bytes[48..56])),
    };
    record.validate()?;
    Ok(record)
}

/// Hash encoded bytes into a leaf digest.
pub fn hash(bytes: &[u8]) -> Digest {
    hash_bytes(bytes)
}

fn le8(slice: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(slice);
    out
}

/// A ledger leaf: the digest of an encoded donation record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Leaf(#[serde(with = "crate::hex_serde")] Digest);

impl Leaf {
    /// Encode and hash `record`.
    pub fn from_record(record: &DonationRecord) -> Result<Self, EncodingError> {
        Ok(Self(hash(&encode(record)?)))
    }

    /// Rebuild a leaf from a digest received over the wire.
    pub const fn from_digest(digest: Digest) -> Self {
        Self(digest)
    }

    /// The leaf digest.
    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_digest(&self.0))
    }
}

impl fmt::Debug for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Leaf({})", hex_digest(&self.0))
    }
}
