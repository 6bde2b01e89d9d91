use std::io;

use thiserror::Error;

use crate::primary::PrimaryError;

/// Errors returned by the index engine and store facade.
#[derive(Error, Debug)]
pub enum Error {
    /// An mmap operation (`at`/`write`) would read or write past the mapped region.
    #[error("mmap operation out of bounds")]
    OutOfBounds,
    /// The key handed to `Index::put`/`Index::get` is shorter than
    /// `ceil(bucketsBits/8) + 1` bytes, violating the primary's short-key contract.
    #[error("index key is shorter than the minimum required length")]
    KeyTooShort,
    /// The on-disk index header's version doesn't match what this build expects.
    #[error("index version mismatch: index has {0}, this build expects {1}")]
    VersionMismatch(u8, u8),
    /// The on-disk index header's `bucketsBits` doesn't match the caller-provided value.
    #[error("buckets bits mismatch: index has {0}, caller requested {1}")]
    BucketsBitsMismatch(u8, u8),
    /// `bucketsBits` is not a multiple of 8, which this implementation requires.
    #[error("buckets bits must be a non-zero multiple of 8 and at most 32, got {0}")]
    InvalidBucketsBits(u8),
    /// An error surfaced by the primary storage implementation.
    #[error(transparent)]
    Primary(#[from] PrimaryError),
    /// An I/O error from the index data file, the bucket table file, or the mmap.
    #[error(transparent)]
    Io(#[from] io::Error),
}
