//! Prints, as hex, the keys stored in each non-empty bucket of an index.
//!
//! `indexinfo <indexPath>`. A read-only inspection tool, companion to `indexstats`.
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

fn index_info(index_path: &str) -> BTreeMap<u32, Vec<String>> {
    let mut info = BTreeMap::new();

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
        let keys: Vec<String> = RecordList::new(&payload)
            .iter()
            .map(|record| record.key.iter().map(|byte| format!("{:02x}", byte)).collect())
            .collect();
        info.insert(bucket, keys);
    }
    info
}

fn main() {
    fil_logger::init();
    let mut args = env::args().skip(1);
    match args.next() {
        Some(index_path) => {
            for (bucket, keys) in index_info(&index_path).iter() {
                println!("{}: {}", bucket, keys.join(" "));
            }
        }
        None => println!("usage: indexinfo <index-file>"),
    }
}
