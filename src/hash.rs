//! Content addressing for blocks using BLAKE3

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A content-addressed block identified by its BLAKE3 hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockDigest(String);

impl BlockDigest {
    /// Create a digest from a hash string
    pub fn new(hash: String) -> Self {
        Self(hash)
    }

    /// Create a digest from raw bytes by computing BLAKE3
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    /// Get the digest as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash every block of a window in parallel.
///
/// The window is split into `block_size` slices; the final slice may be
/// shorter and is hashed as-is. Each task reads a non-overlapping slice
/// and fills its own slot, so the result needs no lock; the returned
/// vector pairs each digest with its absolute block position
/// (`base_position` is the position of the first block in the window).
pub fn hash_window(window: &[u8], block_size: usize, base_position: u64) -> Vec<(u64, BlockDigest)> {
    window
        .par_chunks(block_size)
        .enumerate()
        .map(|(i, chunk)| (base_position + i as u64, BlockDigest::from_bytes(chunk)))
        .collect()
}
