//! Prints, as JSON, the key lengths stored in each non-empty bucket of an index.
//!
//! `indexstats <indexPath>`. A read-only inspection tool: walks the bucket table rather than the
//! index engine, so it never touches the mmap or the bucket cache.
use std::collections::BTreeMap;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};

use hashidx::buckets::BucketTable;
use hashidx::index::{bucket_table_path, read_header, SIZE_PREFIX_SIZE};
use hashidx::recordlist::RecordList;

/// `offset` is the *payload* offset the bucket table stores (i.e. just after the record list's
/// `u32` size prefix), so the size prefix itself sits at `offset - SIZE_PREFIX_SIZE`.
fn read_record_list(data_file: &mut File, offset: u64) -> Vec<u8> {
    data_file
        .seek(SeekFrom::Start(offset - SIZE_PREFIX_SIZE))
        .unwrap();
    let mut size_buf = [0u8; SIZE_PREFIX_SIZE as usize];
    data_file.read_exact(&mut size_buf).unwrap();
    let size = u32::from_le_bytes(size_buf) as usize;
    let mut payload = vec![0u8; size];
    data_file.read_exact(&mut payload).unwrap();
    payload
}

fn index_stats(index_path: &str) -> BTreeMap<u32, Vec<usize>> {
    let mut stats = BTreeMap::new();

    let mut data_file = File::open(index_path).unwrap();
    let (header, _header_size) = read_header(&mut data_file).unwrap();

    let bucket_table_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(bucket_table_path(index_path.as_ref()))
        .unwrap();
    let buckets = BucketTable::open(bucket_table_file, header.buckets_bits).unwrap();

    for bucket in 0..buckets.num_buckets() {
        let bucket = bucket as u32;
        let offset = buckets.get(bucket).unwrap();
        if offset == 0 {
            continue;
        }
        let payload = read_record_list(&mut data_file, offset);
        let keys_length: Vec<usize> = RecordList::new(&payload)
            .iter()
            .map(|record| record.key.len())
            .collect();
        stats.insert(bucket, keys_length);
    }
    stats
}

fn main() {
    fil_logger::init();
    let mut args = env::args().skip(1);
    match args.next() {
        Some(index_path) => {
            let stats = index_stats(&index_path);
            println!("{}", serde_json::to_string(&stats).unwrap());
        }
        None => println!("usage: indexstats <index-file>"),
    }
}
