//! A bucketed, prefix-trimmed, append-only hash index for content-addressed blockstores.
//!
//! Keys are hash-like byte strings; values are small fixed-shape locators ("blocks") into a
//! separate primary storage. The index itself only ever sees the short key a [`primary::PrimaryStorage`]
//! implementation reduces a caller's key to — see that trait for the contract it must uphold.
//!
//! [`store::Store`] is the facade most callers want: it coordinates primary storage and the
//! index engine and exposes `Get`/`Put`/`Has`/`GetSize`/`Flush`/`Sync`/`Close`, plus an optional
//! background flush worker. [`index::Index`] is the lower-level engine it wraps, for callers
//! that want direct control over when the index (as opposed to primary storage) is touched.
pub mod buckets;
pub mod error;
pub mod index;
pub mod mmap;
pub mod primary;
pub mod recordlist;
pub mod store;
pub mod types;

pub use error::Error;
pub use index::Index;
pub use primary::PrimaryStorage;
pub use store::Store;
pub use types::{Block, Work};
