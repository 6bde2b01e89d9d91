//! This trait is an abstraction for the primary storage of the actual data.
//!
//! The index engine works independent of how the primary data is stored. Likely the primary data
//! is stored in a file alongside the index. But it could also be in memory or on a remote server.
use thiserror::Error;

use crate::types::Block;

#[derive(Error, Debug)]
pub enum PrimaryError {
    #[error("Out of bounds error.")]
    OutOfBounds,
    #[error("IO error.")]
    Io(#[from] std::io::Error),
    // Catch-all for errors that could happen within the primary storage.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// The contract the index engine consumes from primary storage.
///
/// Implementations must guarantee the short-key invariant: for any two distinct keys `a != b`
/// with short keys `Ka = index_key(a)` and `Kb = index_key(b)`, either their bucket ids differ or
/// `Ka` and `Kb` differ in at least one byte beyond the bucket-id prefix. Without this the index
/// cannot disambiguate two keys that collide on their short form.
pub trait PrimaryStorage {
    /// Reduce `key` to the short key the index actually stores. Must be deterministic and at
    /// least `ceil(bucketsBits / 8) + 1` bytes long.
    fn index_key(&self, key: &[u8]) -> Result<Vec<u8>, PrimaryError>;

    /// Fetch the original key and value stored at `block`. The index calls this to verify that a
    /// prefix match found in a record list was not a false positive.
    fn get(&self, block: Block) -> Result<(Vec<u8>, Vec<u8>), PrimaryError>;

    /// Append `key`/`value` to primary storage, returning the block it was written at.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<Block, PrimaryError>;
}
