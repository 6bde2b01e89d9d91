//! The bucket table: a fixed-size array of file offsets, one per bucket, persisted as its own
//! file so it can be mmapped independently of the index data file.
use std::convert::TryInto;
use std::fs::File;

use memmap2::{MmapMut, MmapOptions};

use crate::error::Error;

/// Size in bytes of a single bucket table entry.
const ENTRY_SIZE: u64 = 8;

/// `2^buckets_bits` `u64 LE` file offsets, one per bucket. Entry `0` means "bucket is empty".
///
/// The table is mmapped rather than read fully into memory, so very large `buckets_bits` values
/// don't force a multi-gigabyte up-front read.
pub struct BucketTable {
    mmap: MmapMut,
    file: File,
    buckets_bits: u8,
}

impl BucketTable {
    /// Open (creating and zero-filling if necessary) the bucket table backing `file`.
    pub fn open(file: File, buckets_bits: u8) -> Result<Self, Error> {
        let len = table_len(buckets_bits);
        file.set_len(len)?;
        // Safety: the file is exclusively owned by this `BucketTable` for the life of the
        // mapping; nothing else truncates or writes to it concurrently.
        let mmap = unsafe { MmapOptions::new().len(len as usize).map_mut(&file)? };
        Ok(Self {
            mmap,
            file,
            buckets_bits,
        })
    }

    /// Number of buckets in the table (`2^buckets_bits`). A `u64` because `buckets_bits` may be
    /// 32, at which point `2^32` no longer fits a `u32`.
    pub fn num_buckets(&self) -> u64 {
        1u64 << self.buckets_bits
    }

    /// Read the file offset stored for `bucket`. `0` means the bucket is empty.
    pub fn get(&self, bucket: u32) -> Result<u64, Error> {
        let offset = self.byte_offset(bucket)?;
        Ok(u64::from_le_bytes(
            self.mmap[offset..offset + 8]
                .try_into()
                .expect("slice is exactly 8 bytes"),
        ))
    }

    /// Set the file offset stored for `bucket`.
    pub fn put(&mut self, bucket: u32, file_offset: u64) -> Result<(), Error> {
        let offset = self.byte_offset(bucket)?;
        self.mmap[offset..offset + 8].copy_from_slice(&file_offset.to_le_bytes());
        Ok(())
    }

    /// Write any dirty mmap pages back to the file.
    pub fn flush(&self) -> Result<(), Error> {
        self.mmap.flush()?;
        Ok(())
    }

    /// fsync the backing file.
    pub fn sync(&self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }

    fn byte_offset(&self, bucket: u32) -> Result<usize, Error> {
        if u64::from(bucket) >= self.num_buckets() {
            return Err(Error::OutOfBounds);
        }
        Ok(bucket as usize * ENTRY_SIZE as usize)
    }
}

fn table_len(buckets_bits: u8) -> u64 {
    (1u64 << buckets_bits) * ENTRY_SIZE
}
