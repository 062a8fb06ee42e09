//! Proof verification.
//!
//! Pure functions: no storage, no I/O. Recomputes the root from the leaf and
//! its siblings and compares it to a claimed root.

use crate::{hex_digest, node_hash, Digest, MerkleError, MerkleProof, MAX_HEIGHT};

impl MerkleProof {
    /// Fold the leaf with its siblings into a root.
    ///
    /// Returns `None` for structurally impossible proofs: more than
    /// [`MAX_HEIGHT`] siblings, or an index that does not fit in the number
    /// of levels.
    pub fn compute_root(&self) -> Option<Digest> {
        let levels = self.siblings.len();
        if levels > MAX_HEIGHT as usize {
            return None;
        }
        if self.leaf_index.checked_shr(levels as u32).unwrap_or(0) != 0 {
            return None;
        }

        let mut current = *self.leaf.digest();
        for (level, sibling) in self.siblings.iter().enumerate() {
            current = if (self.leaf_index >> level) & 1 == 1 {
                node_hash(sibling, &current)
            } else {
                node_hash(&current, sibling)
            };
        }
        Some(current)
    }

    /// True when the proof reproduces its own claimed root.
    pub fn verify(&self) -> bool {
        self.compute_root() == Some(self.root)
    }

    /// Check the proof reproduces its root and that the root is
    /// `expected_root`.
    ///
    /// A proof generated against an older root fails here even when its leaf
    /// and path are internally consistent.
    pub fn verify_against_root(&self, expected_root: &Digest) -> Result<(), MerkleError> {
        let computed = self.compute_root().ok_or_else(|| {
            MerkleError::InvalidProof(format!(
                "leaf index {} cannot be addressed with {} siblings",
                self.leaf_index,
                self.siblings.len()
            ))
        })?;
        if computed != self.root {
            return Err(MerkleError::InvalidProof(format!(
                "root hash mismatch for leaf {}: claimed {}, computed {}",
                self.leaf_index,
                hex_digest(&self.root),
                hex_digest(&computed)
            )));
        }
        if &self.root != expected_root {
            return Err(MerkleError::InvalidProof(format!(
                "stale root for leaf {}: expected {}, proof is against {}",
                self.leaf_index,
                hex_digest(expected_root),
                hex_digest(&self.root)
            )));
        }
        Ok(())
    }
}

/// Free-function form of [`MerkleProof::verify`].
pub fn verify(proof: &MerkleProof) -> bool {
    proof.verify()
}
