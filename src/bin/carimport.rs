//! Imports every block of a CAR file into a hash index, keyed by CID.
//!
//! `carimport <indexPath> <dataPath> <carFile>`. Exits 0 on success, 1 on any argument, open, or
//! load error.
use std::convert::TryFrom;
use std::env;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::process;

use cid::Cid;
use indicatif::{ProgressBar, ProgressStyle};

use hashidx::primary::PrimaryError;
use hashidx::Store;
use hashidx_primary_cid::{read_block, read_data, CidPrimary};

/// Chosen to match the pack's own CAR-importing examples; 2^24 buckets keeps the bucket table a
/// manageable 128 MiB while giving a multi-million-entry index a short, well-spread prefix.
const BUCKETS_BITS: u8 = 24;

/// Wraps a reader so every byte pulled through it advances a progress bar, mirroring the Go
/// original's `pb.v1` proxy reader.
struct ProgressReader<R> {
    inner: R,
    bar: ProgressBar,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bar.inc(n as u64);
        Ok(n)
    }
}

fn run(index_path: &str, data_path: &str, car_path: &str) -> Result<(), String> {
    let primary =
        CidPrimary::open(data_path).map_err(|error| format!("error opening data file: {}", error))?;
    let store = Store::open(index_path, primary, BUCKETS_BITS)
        .map_err(|error| format!("error opening blockstore: {}", error))?;
    store.start_default();

    let file = File::open(car_path).map_err(|error| format!("error opening CAR file: {}", error))?;
    let file_size = file
        .metadata()
        .map_err(|error| format!("error sizing CAR file: {}", error))?
        .len();

    let bar = ProgressBar::new(file_size);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
            .expect("static template is valid")
            .progress_chars("=> "),
    );

    let mut reader = ProgressReader {
        inner: BufReader::with_capacity(1 << 20, file),
        bar: bar.clone(),
    };

    // The CAR header (a varint-framed IPLD block naming the roots) isn't needed here; skip it.
    read_data(&mut reader).map_err(|error| format!("error reading CAR header: {}", error))?;

    loop {
        match read_data(&mut reader) {
            Ok((block, _bytes_read)) => {
                let (cid_bytes, data) = read_block(&block)
                    .map_err(|error| format!("error loading car file to blockstore: {}", error))?;
                Cid::try_from(&cid_bytes[..])
                    .map_err(|error| format!("error loading car file to blockstore: {}", error))?;
                store
                    .put(&cid_bytes, &data)
                    .map_err(|error| format!("error loading car file to blockstore: {}", error))?;
            }
            Err(error) if is_eof(&error) => break,
            Err(error) => return Err(format!("error loading car file to blockstore: {}", error)),
        }
    }
    bar.finish();

    store
        .close()
        .map_err(|error| format!("error closing blockstore: {}", error))?;
    Ok(())
}

fn is_eof(error: &PrimaryError) -> bool {
    matches!(error, PrimaryError::Io(io_error) if io_error.kind() == io::ErrorKind::UnexpectedEof)
}

fn main() {
    fil_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() != 3 {
        eprintln!("usage: carimport <indexPath> <dataPath> <carFile>");
        process::exit(1);
    }

    if let Err(message) = run(&args[0], &args[1], &args[2]) {
        eprintln!("{}", message);
        process::exit(1);
    }
}
