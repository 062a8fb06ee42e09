use std::fmt;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::{hash_bytes, hex_digest, Digest};

/// Identity of a ledger tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeId(#[serde(with = "crate::hex_serde")] Digest);

impl TreeId {
    /// Wrap raw identity bytes (for example an account address).
    pub const fn new(bytes: Digest) -> Self {
        Self(bytes)
    }

    /// Identity of the donation tree of `creator`'s campaign `campaign_id`:
    /// `blake3("campaign" || creator || campaign_id_le)`.
    pub fn for_campaign(creator: &[u8; 32], campaign_id: u64) -> Self {
        let mut seed = Vec::with_capacity(8 + 32 + 8);
        seed.extend_from_slice(b"campaign");
        seed.extend_from_slice(creator);
        seed.extend_from_slice(&campaign_id.to_le_bytes());
        Self(hash_bytes(&seed))
    }

    /// Raw identity bytes.
    pub fn as_bytes(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_digest(&self.0))
    }
}

impl fmt::Debug for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeId({})", hex::encode(&self.0[..8]))
    }
}
