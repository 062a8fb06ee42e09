//! Serde helpers for the textual form of digests: lowercase hex with a `0x`
//! prefix.
//!
//! Use with `#[serde(with = "donation_ledger_merkle::hex_serde")]` on a
//! `[u8; 32]` field, or `hex_serde::vec` on a `Vec<[u8; 32]>`.

use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

use crate::{hex_digest, Digest};

/// Parse a `0x`-prefixed hex string into a digest.
pub fn parse_digest(s: &str) -> Result<Digest, String> {
    let body = s
        .strip_prefix("0x")
        .ok_or_else(|| format!("digest {s:?} is missing the 0x prefix"))?;
    let bytes = hex::decode(body).map_err(|e| format!("digest {s:?} is not hex: {e}"))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("digest must be 32 bytes, got {}", b.len()))
}

/// Serialize a digest as `0x…` hex.
pub fn serialize<S: Serializer>(digest: &Digest, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex_digest(digest))
}

/// Deserialize a digest from `0x…` hex.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Digest, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_digest(&s).map_err(D::Error::custom)
}

/// Same encoding for a sequence of digests.
pub mod vec {
    use serde::{de::Error as _, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    use super::parse_digest;
    use crate::{hex_digest, Digest};

    /// Serialize digests as an array of `0x…` strings.
    pub fn serialize<S: Serializer>(digests: &[Digest], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(digests.len()))?;
        for digest in digests {
            seq.serialize_element(&hex_digest(digest))?;
        }
        seq.end()
    }

    /// Deserialize an array of `0x…` strings.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Digest>, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings
            .iter()
            .map(|s| parse_digest(s).map_err(D::Error::custom))
            .collect()
    }
}
