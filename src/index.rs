//! The index engine: ties [`crate::mmap`], [`crate::buckets`] and [`crate::recordlist`] together
//! into the prefix-trimmed, bucketed hash index described by the external layout.
//!
//! On-disk layout of the index data file:
//!
//! ```text
//!     |                  Once              |                    Repeated                 |
//!     |                                    |                                             |
//!     |       4 bytes      | Variable size |         4 bytes        |  Variable size | … |
//!     | Size of the header |   [`Header`]  | Size of the Recordlist |   Recordlist   | … |
//! ```
//!
//! The header is written once, when the file is created, and never moves; record lists are
//! appended strictly after it. The bucket table is a separate, fixed-size file (see
//! [`crate::buckets`]) mapping each bucket id to the file offset of its most recent record list.
use std::cmp;
use std::collections::HashMap;
use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::warn;

use crate::buckets::BucketTable;
use crate::error::Error;
use crate::mmap::AppendMmap;
use crate::primary::PrimaryStorage;
use crate::recordlist::{self, first_non_common_byte, Record, RecordList};
use crate::types::Block;

/// On-disk index format version this build reads and writes.
pub const INDEX_VERSION: u8 = 2;

/// Size in bytes of the `u32 LE` size prefix preceding the header and every record list.
pub const SIZE_PREFIX_SIZE: u64 = 4;

/// The fixed-shape header stored at the front of the index data file.
///
/// The serialized form is `[version: u8][bucketsBits: u8]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub buckets_bits: u8,
}

impl Header {
    fn new(buckets_bits: u8) -> Self {
        Self {
            version: INDEX_VERSION,
            buckets_bits,
        }
    }
}

impl From<Header> for Vec<u8> {
    fn from(header: Header) -> Self {
        vec![header.version, header.buckets_bits]
    }
}

impl From<&[u8]> for Header {
    fn from(bytes: &[u8]) -> Self {
        Self {
            version: bytes[0],
            buckets_bits: bytes[1],
        }
    }
}

/// The bits of `key` not consumed by the bucket id. Only whole bytes are trimmed.
fn strip_bucket_prefix(key: &[u8], buckets_bits: u8) -> &[u8] {
    &key[usize::from(buckets_bits / 8)..]
}

/// The bucket id a key maps to: its first `bucketsBits` bits, read big-endian/MSB-first.
fn bucket_id(key: &[u8], buckets_bits: u8) -> u32 {
    let prefix_bytes = usize::from(buckets_bits / 8);
    let mut buf = [0u8; 4];
    buf[4 - prefix_bytes..].copy_from_slice(&key[..prefix_bytes]);
    u32::from_be_bytes(buf)
}

/// The shortest a key handed to `put`/`get` may be: the bucket-id prefix plus one byte.
fn min_key_len(buckets_bits: u8) -> usize {
    usize::from(buckets_bits / 8) + 1
}

/// The path of the bucket table belonging to the index data file at `index_path`.
pub fn bucket_table_path(index_path: &Path) -> PathBuf {
    let mut path = index_path.as_os_str().to_owned();
    path.push(".bucks");
    PathBuf::from(path)
}

/// Read the header from the front of an index data file. Returns the header and its size in
/// bytes (not counting the `u32` size prefix). Exposed so read-only inspection tools can read the
/// header without going through `Index::open`'s mmap setup.
pub fn read_header(file: &mut File) -> std::io::Result<(Header, u64)> {
    file.seek(SeekFrom::Start(0))?;
    let mut size_buf = [0u8; SIZE_PREFIX_SIZE as usize];
    file.read_exact(&mut size_buf)?;
    let header_size = u32::from_le_bytes(size_buf) as u64;
    let mut header_bytes = vec![0u8; header_size as usize];
    file.read_exact(&mut header_bytes)?;
    Ok((Header::from(&header_bytes[..]), header_size))
}

/// Create a brand-new index data file with just the header written.
fn write_fresh_header(file: &mut File, header: Header) -> std::io::Result<()> {
    let header_bytes: Vec<u8> = header.into();
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
    file.write_all(&header_bytes)?;
    file.sync_data()?;
    Ok(())
}

/// Scan the record lists following the header, truncating the file at the first one that is
/// incomplete (a partial write left by a crash between the size prefix and the payload).
fn truncate_corrupt_tail(file: &mut File, data_start: u64) -> std::io::Result<()> {
    let file_len = file.metadata()?.len();
    let mut pos = data_start;
    while pos < file_len {
        if pos + SIZE_PREFIX_SIZE > file_len {
            break;
        }
        file.seek(SeekFrom::Start(pos))?;
        let mut size_buf = [0u8; SIZE_PREFIX_SIZE as usize];
        file.read_exact(&mut size_buf)?;
        let size = u64::from(u32::from_le_bytes(size_buf));
        let record_end = pos + SIZE_PREFIX_SIZE + size;
        if record_end > file_len {
            break;
        }
        pos = record_end;
    }
    if pos != file_len {
        warn!(
            "index data file has a corrupt tail ({} trailing bytes), truncating",
            file_len - pos
        );
        file.set_len(pos)?;
    }
    file.seek(SeekFrom::End(0))?;
    Ok(())
}

/// Mutable engine state, guarded by a single lock: writers hold it for the whole `put`; readers
/// take a snapshot (the relevant record list, copied out) and release it before consulting
/// primary storage.
struct EngineState {
    data: AppendMmap,
    buckets: BucketTable,
    cache: HashMap<u32, Arc<Vec<u8>>>,
    /// Bytes of record lists appended since the last flush.
    work: u64,
}

/// The bucketed, prefix-trimmed hash index.
///
/// `P` is the primary storage the index stores locators into; see [`PrimaryStorage`].
pub struct Index<P> {
    state: RwLock<EngineState>,
    buckets_bits: u8,
    pub primary: P,
}

impl<P: PrimaryStorage> Index<P> {
    /// Open (creating if necessary) the index at `index_path`, backed by `primary`.
    ///
    /// `buckets_bits` must be a non-zero multiple of 8, at most 32 (this implementation
    /// restricts it to whole-byte boundaries so the bucket-id prefix can be stripped from keys
    /// without bit-level shifting). On reopen it must match the value the index was created
    /// with.
    pub fn open(index_path: impl AsRef<Path>, primary: P, buckets_bits: u8) -> Result<Self, Error> {
        if buckets_bits == 0 || buckets_bits % 8 != 0 || buckets_bits > 32 {
            return Err(Error::InvalidBucketsBits(buckets_bits));
        }
        let index_path = index_path.as_ref();

        let bucket_table_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(bucket_table_path(index_path))?;
        let buckets = BucketTable::open(bucket_table_file, buckets_bits)?;

        let mut data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(index_path)?;
        if data_file.metadata()?.len() == 0 {
            write_fresh_header(&mut data_file, Header::new(buckets_bits))?;
        } else {
            let (header, header_size) = read_header(&mut data_file)?;
            if header.version != INDEX_VERSION {
                return Err(Error::VersionMismatch(header.version, INDEX_VERSION));
            }
            if header.buckets_bits != buckets_bits {
                return Err(Error::BucketsBitsMismatch(header.buckets_bits, buckets_bits));
            }
            let data_start = SIZE_PREFIX_SIZE + header_size;
            truncate_corrupt_tail(&mut data_file, data_start)?;
        }

        let data = AppendMmap::open(data_file)?;

        Ok(Self {
            state: RwLock::new(EngineState {
                data,
                buckets,
                cache: HashMap::new(),
                work: 0,
            }),
            buckets_bits,
            primary,
        })
    }

    pub fn buckets_bits(&self) -> u8 {
        self.buckets_bits
    }

    /// Insert or update `key` to point at `block`. Re-putting an already-present key replaces
    /// its stored block; it is not a no-op and does not duplicate the record.
    pub fn put(&self, key: &[u8], block: Block) -> Result<(), Error> {
        let min_len = min_key_len(self.buckets_bits);
        if key.len() < min_len {
            return Err(Error::KeyTooShort);
        }
        let bucket = bucket_id(key, self.buckets_bits);
        let index_key = strip_bucket_prefix(key, self.buckets_bits);

        let mut state = self.state.write().expect("lock poisoned");
        let current_data = self.load_record_list(&mut state, bucket)?;

        let new_data = if current_data.is_empty() {
            Some(recordlist::encode_record(&index_key[..1], block))
        } else {
            let records = RecordList::new(&current_data);
            let (pos, prev) = records.find_key_position(index_key);

            match prev {
                Some(prev) if index_key.starts_with(prev.key) => {
                    let (full_prev_key, _) = self.primary.get(prev.block)?;
                    // `prev.key` is a *trimmed* prefix; the record list stores short keys, so the
                    // full previous key must go through `index_key` the same way the read path
                    // does (see `get` below) before it's comparable to `index_key` here — skipping
                    // that step would compare against primary's full (untrimmed) key representation.
                    let prev_short_key = self.primary.index_key(&full_prev_key)?;
                    let prev_index_key = strip_bucket_prefix(&prev_short_key, self.buckets_bits);
                    if prev_index_key == index_key {
                        // Already present: replace this record's block in place rather than
                        // leaving it untouched, so that a re-`put` actually updates the value.
                        Some(records.splice(prev.pos..pos, &[(prev.key, block)]))
                    } else {
                        splice_ambiguous(&records, prev.pos, pos, index_key, prev_index_key, prev.block, block)
                    }
                }
                _ => Some(splice_insert(&current_data, &records, pos, prev, index_key, block)),
            }
        };

        // `None` means the new key and its left neighbor's full short key are a strict byte
        // prefix of one another — a violation of the primary's short-key invariant that no
        // prefix-trimmed record list can represent. The put is silently dropped rather than
        // corrupting the bucket; see `splice_ambiguous`.
        let new_data = match new_data {
            Some(new_data) => new_data,
            None => return Ok(()),
        };

        let payload_offset = self.append_record_list(&mut state, &new_data)?;
        state.buckets.put(bucket, payload_offset)?;
        state.work += new_data.len() as u64;
        state.cache.insert(bucket, Arc::new(new_data));
        Ok(())
    }

    /// Look up the short key `key` (the output of `primary.index_key` for some original key),
    /// returning the block it was last `put` at, or `None` if it isn't present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Block>, Error> {
        let min_len = min_key_len(self.buckets_bits);
        if key.len() < min_len {
            return Err(Error::KeyTooShort);
        }
        let bucket = bucket_id(key, self.buckets_bits);
        let index_key = strip_bucket_prefix(key, self.buckets_bits);

        let current_data = {
            // Fast path: a cache hit only needs a shared read lock, so concurrent reads don't
            // serialize behind one another. Only a cache miss needs to escalate to an exclusive
            // lock to populate the cache.
            let state = self.state.read().expect("lock poisoned");
            if let Some(cached) = state.cache.get(&bucket) {
                Arc::clone(cached)
            } else {
                drop(state);
                let mut state = self.state.write().expect("lock poisoned");
                self.load_record_list(&mut state, bucket)?
            }
        };
        if current_data.is_empty() {
            return Ok(None);
        }

        let records = RecordList::new(&current_data);
        for block in records.possible_matches(index_key) {
            // A record whose stored prefix is a prefix of `index_key` is only a *possible*
            // match: a never-put key can coincide with a stored prefix by chance. Re-derive the
            // short key of whatever is actually stored at `block` and compare in full before
            // trusting it.
            let (primary_key, _value) = self.primary.get(block)?;
            let stored_key = self.primary.index_key(&primary_key)?;
            if stored_key == key {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.get(key)?.is_some())
    }

    /// Write the unflushed tail of the data file and the bucket table to disk, and drop the
    /// read cache (subsequent reads go through the freshly flushed mmap/bucket table).
    pub fn flush(&self) -> Result<usize, Error> {
        let mut state = self.state.write().expect("lock poisoned");
        let bytes = state.data.flush()?;
        state.buckets.flush()?;
        state.cache.clear();
        state.work = 0;
        Ok(bytes)
    }

    /// fsync the data file, then the bucket table.
    pub fn sync(&self) -> Result<(), Error> {
        let state = self.state.read().expect("lock poisoned");
        state.data.sync()?;
        state.buckets.sync()?;
        Ok(())
    }

    /// Bytes of record lists appended since the last flush, for the background worker's
    /// threshold check.
    pub fn work(&self) -> u64 {
        self.state.read().expect("lock poisoned").work
    }

    pub fn close(self) -> Result<(), Error> {
        let state = self.state.into_inner().expect("lock poisoned");
        state.buckets.flush()?;
        state.data.close()?;
        Ok(())
    }

    /// Load the record list currently stored for `bucket`, from the cache if present or else
    /// from the mmap (and cache it for next time). Returns an empty vec for an empty bucket.
    fn load_record_list(&self, state: &mut EngineState, bucket: u32) -> Result<Arc<Vec<u8>>, Error> {
        if let Some(cached) = state.cache.get(&bucket) {
            return Ok(Arc::clone(cached));
        }
        let offset = state.buckets.get(bucket)?;
        if offset == 0 {
            return Ok(Arc::new(Vec::new()));
        }
        let size_bytes = state.data.at(offset - SIZE_PREFIX_SIZE, SIZE_PREFIX_SIZE)?;
        let size = u32::from_le_bytes(size_bytes.try_into().expect("slice is exactly 4 bytes")) as u64;
        let data = Arc::new(state.data.at(offset, size)?.to_vec());
        state.cache.insert(bucket, Arc::clone(&data));
        Ok(data)
    }

    /// Append a record list's size-prefixed bytes to the data file, returning the offset of its
    /// payload (after the size prefix) — what the bucket table stores.
    fn append_record_list(&self, state: &mut EngineState, payload: &[u8]) -> Result<u64, Error> {
        state.data.write(&(payload.len() as u32).to_le_bytes())?;
        let payload_offset = state.data.write(payload)?;
        Ok(payload_offset)
    }
}

/// Handle the ambiguous case: `index_key` fully contains the stored (trimmed) previous key, but
/// the two keys are genuinely distinct. The previous record's stored prefix may need to grow to
/// stay distinguishable from the new key; by construction (a trimmed prefix always sorts before
/// the key it was trimmed from) this can only ever require rewriting the left neighbor, never
/// the right one — the next record in the list is already guaranteed to be distinguishable from
/// the new key, since it was already distinguishable from the previous one.
///
/// Returns `None` if `index_key` and `prev_index_key` are a strict byte prefix of one another
/// (distinct only in length, not in any shared byte). The primary's short-key invariant requires
/// two distinct keys to differ in some byte beyond the bucket-id prefix, so this is a contract
/// violation; since it's unrepresentable as a disambiguating prefix pair, the put is dropped by
/// the caller instead of this function indexing a key one byte past either slice's end.
#[allow(clippy::too_many_arguments)]
fn splice_ambiguous(
    records: &RecordList<'_>,
    prev_pos: usize,
    pos: usize,
    index_key: &[u8],
    prev_index_key: &[u8],
    prev_block: Block,
    block: Block,
) -> Option<Vec<u8>> {
    let trim_pos = first_non_common_byte(index_key, prev_index_key);
    if trim_pos >= index_key.len() || trim_pos >= prev_index_key.len() {
        return None;
    }
    let trimmed_prev = &prev_index_key[..=trim_pos];
    let trimmed_new = &index_key[..=trim_pos];
    if trimmed_prev < trimmed_new {
        Some(records.splice(prev_pos..pos, &[(trimmed_prev, prev_block), (trimmed_new, block)]))
    } else {
        Some(records.splice(prev_pos..pos, &[(trimmed_new, block), (trimmed_prev, prev_block)]))
    }
}

/// The ordinary insert case: find the minimal prefix of `index_key` that still distinguishes it
/// from its immediate neighbors in the list, and splice it in.
fn splice_insert(
    current_data: &[u8],
    records: &RecordList<'_>,
    pos: usize,
    prev: Option<Record<'_>>,
    index_key: &[u8],
    block: Block,
) -> Vec<u8> {
    let prev_dist = prev.map_or(0, |record| first_non_common_byte(index_key, record.key));
    let next_dist = if pos < current_data.len() {
        let next = records.read_record(pos);
        first_non_common_byte(index_key, next.key)
    } else {
        0
    };
    // Clamped defensively: the short-key invariant guarantees this never reaches
    // `index_key.len()`, but the clamp is cheaper than trusting every primary implementation.
    let trim_pos = cmp::min(cmp::max(prev_dist, next_dist), index_key.len() - 1);
    let trimmed = &index_key[..=trim_pos];
    records.splice(pos..pos, &[(trimmed, block)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap as StdHashMap;

    /// A trivial in-memory primary storage for testing the engine in isolation.
    struct TestPrimary {
        entries: RefCell<Vec<(Vec<u8>, Vec<u8>)>>,
        #[allow(dead_code)]
        keyed: RefCell<StdHashMap<Vec<u8>, usize>>,
    }

    impl TestPrimary {
        fn new() -> Self {
            Self {
                entries: RefCell::new(Vec::new()),
                keyed: RefCell::new(StdHashMap::new()),
            }
        }
    }

    impl PrimaryStorage for TestPrimary {
        fn index_key(&self, key: &[u8]) -> Result<Vec<u8>, crate::primary::PrimaryError> {
            Ok(key.to_vec())
        }

        fn get(&self, block: Block) -> Result<(Vec<u8>, Vec<u8>), crate::primary::PrimaryError> {
            Ok(self.entries.borrow()[block.offset as usize].clone())
        }

        fn put(&self, key: &[u8], value: &[u8]) -> Result<Block, crate::primary::PrimaryError> {
            let mut entries = self.entries.borrow_mut();
            let idx = entries.len();
            entries.push((key.to_vec(), value.to_vec()));
            self.keyed.borrow_mut().insert(key.to_vec(), idx);
            Ok(Block::new(idx as u64, value.len() as u32))
        }
    }

    fn open_index(buckets_bits: u8) -> (Index<TestPrimary>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storethehash.index");
        let index = Index::open(&path, TestPrimary::new(), buckets_bits).unwrap();
        (index, dir)
    }

    fn put_kv(index: &Index<TestPrimary>, key: &[u8], value: &[u8]) {
        let block = index.primary.put(key, value).unwrap();
        index.put(key, block).unwrap();
    }

    #[test]
    fn s1_single_key_trims_to_one_byte() {
        let (index, _dir) = open_index(8);
        put_kv(&index, &[7, 42], b"hello");
        let block = index.get(&[7, 42]).unwrap().unwrap();
        let (key, value) = index.primary.get(block).unwrap();
        assert_eq!(key, vec![7, 42]);
        assert_eq!(value, b"hello");
    }

    #[test]
    fn s2_distinct_keys_stay_minimal() {
        let (index, _dir) = open_index(8);
        put_kv(&index, &[1, 0xAA], b"a");
        put_kv(&index, &[1, 0xBB], b"b");
        let a = index.get(&[1, 0xAA]).unwrap().unwrap();
        let b = index.get(&[1, 0xBB]).unwrap().unwrap();
        assert_eq!(index.primary.get(a).unwrap().1, b"a");
        assert_eq!(index.primary.get(b).unwrap().1, b"b");
    }

    #[test]
    fn s3_common_prefix_keys_both_resolve() {
        let (index, _dir) = open_index(8);
        put_kv(&index, &[1, 1, 2, 3, 4], b"first");
        put_kv(&index, &[1, 1, 2, 3, 9], b"second");
        let first = index.get(&[1, 1, 2, 3, 4]).unwrap().unwrap();
        let second = index.get(&[1, 1, 2, 3, 9]).unwrap().unwrap();
        assert_eq!(index.primary.get(first).unwrap().1, b"first");
        assert_eq!(index.primary.get(second).unwrap().1, b"second");
    }

    #[test]
    fn s4_ambiguous_left_neighbor_rewrite() {
        let (index, _dir) = open_index(8);
        // Both keys share the 8-bit bucket prefix and, beyond it, the bytes `[5, 6]` — same
        // length, genuinely distinct — so the left neighbor's one-byte stored prefix must grow
        // once the second key is inserted.
        put_kv(&index, &[1, 5, 6, 9, 9, 9, 9], b"short-ish");
        put_kv(&index, &[1, 5, 6, 7, 8, 9, 10], b"long-ish");
        let a = index.get(&[1, 5, 6, 9, 9, 9, 9]).unwrap().unwrap();
        let b = index.get(&[1, 5, 6, 7, 8, 9, 10]).unwrap().unwrap();
        assert_eq!(index.primary.get(a).unwrap().1, b"short-ish");
        assert_eq!(index.primary.get(b).unwrap().1, b"long-ish");
        assert!(index.get(&[1, 5, 6, 9, 8, 8, 8]).unwrap().is_none());
    }

    #[test]
    fn ambiguous_strict_prefix_keys_are_dropped_not_panicked() {
        // A key that is a strict byte-prefix of another, longer one put afterwards violates the
        // primary's short-key invariant (distinct keys must differ in some byte beyond the
        // bucket-id prefix, not just in length). No prefix-trimmed record can represent this, so
        // the ambiguous `put` is silently dropped instead of panicking or corrupting the bucket.
        let (index, _dir) = open_index(8);
        put_kv(&index, &[1, 5], b"short");
        put_kv(&index, &[1, 5, 9, 9], b"long");
        let short = index.get(&[1, 5]).unwrap().unwrap();
        assert_eq!(index.primary.get(short).unwrap().1, b"short");
        assert!(index.get(&[1, 5, 9, 9]).unwrap().is_none());
    }

    #[test]
    fn replacing_an_existing_key_updates_in_place() {
        let (index, _dir) = open_index(8);
        put_kv(&index, &[2, 2], b"v1");
        put_kv(&index, &[2, 2], b"v2");
        let block = index.get(&[2, 2]).unwrap().unwrap();
        assert_eq!(index.primary.get(block).unwrap().1, b"v2");
    }

    #[test]
    fn get_missing_key_is_none() {
        let (index, _dir) = open_index(8);
        put_kv(&index, &[1, 1], b"present");
        assert!(index.get(&[9, 9]).unwrap().is_none());
    }

    #[test]
    fn key_too_short_is_an_error() {
        let (index, _dir) = open_index(16);
        assert!(matches!(index.get(&[1, 2]), Err(Error::KeyTooShort)));
    }

    #[test]
    fn flush_then_reads_still_work() {
        let (index, _dir) = open_index(8);
        put_kv(&index, &[3, 3], b"durable");
        index.flush().unwrap();
        let block = index.get(&[3, 3]).unwrap().unwrap();
        assert_eq!(index.primary.get(block).unwrap().1, b"durable");
    }

    #[test]
    fn header_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storethehash.index");
        {
            let index = Index::open(&path, TestPrimary::new(), 8).unwrap();
            put_kv(&index, &[4, 4], b"persisted");
            index.flush().unwrap();
            index.sync().unwrap();
        }
        let index = Index::open(&path, TestPrimary::new(), 8).unwrap();
        assert_eq!(index.buckets_bits(), 8);
    }

    #[test]
    fn reopen_with_wrong_buckets_bits_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storethehash.index");
        Index::open(&path, TestPrimary::new(), 8).unwrap();
        let result = Index::open(&path, TestPrimary::new(), 16);
        assert!(matches!(result, Err(Error::BucketsBitsMismatch(8, 16))));
    }

    #[test]
    fn invalid_buckets_bits_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storethehash.index");
        let result = Index::open(&path, TestPrimary::new(), 5);
        assert!(matches!(result, Err(Error::InvalidBucketsBits(5))));
    }
}
