use std::sync::LazyLock;

use crate::MerkleError;

/// A 32-byte Blake3 digest.
pub type Digest = [u8; 32];

/// Largest supported tree height. Bounds proofs to 32 siblings and trees to
/// `2^32` leaves.
pub const MAX_HEIGHT: u8 = 32;

/// Empty subtree roots, indexed by level. Level 0 is `ZERO_VALUE`.
static EMPTY_ROOTS: LazyLock<[Digest; MAX_HEIGHT as usize + 1]> = LazyLock::new(|| {
    let mut roots = [[0u8; 32]; MAX_HEIGHT as usize + 1];
    roots[0] = node_hash(&[0u8; 32], &[0u8; 32]);
    for level in 1..roots.len() {
        roots[level] = node_hash(&roots[level - 1], &roots[level - 1]);
    }
    roots
});

/// Blake3 of arbitrary bytes.
pub fn hash_bytes(bytes: &[u8]) -> Digest {
    *blake3::hash(bytes).as_bytes()
}

/// Hash of an internal node: `blake3(left || right)`.
pub fn node_hash(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// `ZERO_VALUE = H(0, 0)`: the digest of an unpopulated leaf position.
///
/// This is a protocol constant shared with every external verifier.
pub fn zero_value() -> Digest {
    EMPTY_ROOTS[0]
}

/// Root of an entirely empty subtree whose root sits at `level`.
///
/// Levels above [`MAX_HEIGHT`] are clamped to it.
pub fn empty_root(level: u8) -> Digest {
    EMPTY_ROOTS[level.min(MAX_HEIGHT) as usize]
}

/// Number of leaves a tree of `height` can hold.
pub fn capacity_for_height(height: u8) -> u64 {
    1u64 << height.min(MAX_HEIGHT)
}

/// Lowercase `0x`-prefixed hex, the textual form of every digest.
pub fn hex_digest(digest: &Digest) -> String {
    format!("0x{}", hex::encode(digest))
}

pub(crate) fn validate_height(height: u8) -> Result<(), MerkleError> {
    if !(1..=MAX_HEIGHT).contains(&height) {
        return Err(MerkleError::InvalidHeight {
            height,
            max: MAX_HEIGHT,
        });
    }
    Ok(())
}
