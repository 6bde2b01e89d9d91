//! A database-like facade over the index engine: stores and retrieves key/value pairs, keeping
//! the index and primary storage in sync, and optionally runs a background flush worker.
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;

use crate::error::Error;
use crate::index::Index;
use crate::primary::PrimaryStorage;
use crate::types::Work;

/// Default number of bytes of record lists appended before the background worker flushes.
pub const DEFAULT_FLUSH_THRESHOLD: Work = 4 * 1024 * 1024;
/// Default interval at which the background worker checks the accumulated work counter.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct Worker {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// A database to store and retrieve key-value pairs. Coordinates writes between primary storage
/// and the index, and exposes an optional background flush worker.
pub struct Store<P> {
    index: Arc<Index<P>>,
    worker: Mutex<Option<Worker>>,
}

impl<P: PrimaryStorage> Store<P> {
    /// Open (creating if necessary) the store at `index_path`, backed by `primary`.
    pub fn open(index_path: impl AsRef<Path>, primary: P, buckets_bits: u8) -> Result<Self, Error> {
        let index = Arc::new(Index::open(index_path, primary, buckets_bits)?);
        Ok(Self {
            index,
            worker: Mutex::new(None),
        })
    }

    /// Returns the value stored for `key`, or `None` if it isn't present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let index_key = self.index.primary.index_key(key)?;
        match self.index.get(&index_key)? {
            Some(block) => {
                let (_primary_key, value) = self.index.primary.get(block)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &[u8]) -> Result<bool, Error> {
        let index_key = self.index.primary.index_key(key)?;
        self.index.has(&index_key)
    }

    /// The size in bytes of the value stored for `key`, or `None` if it isn't present. Does not
    /// read the value itself.
    pub fn get_size(&self, key: &[u8]) -> Result<Option<u32>, Error> {
        let index_key = self.index.primary.index_key(key)?;
        Ok(self.index.get(&index_key)?.map(|block| block.size))
    }

    /// Store `value` under `key`, replacing any value previously stored under the same key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let block = self.index.primary.put(key, value)?;
        let index_key = self.index.primary.index_key(key)?;
        self.index.put(&index_key, block)?;
        Ok(())
    }

    /// Flush the index (and, transitively, the bucket table) to disk.
    pub fn flush(&self) -> Result<usize, Error> {
        self.index.flush()
    }

    /// fsync the index data file and the bucket table.
    pub fn sync(&self) -> Result<(), Error> {
        self.index.sync()
    }

}

impl<P: PrimaryStorage + Send + Sync + 'static> Store<P> {
    /// Stop the background worker (if running) and close the index.
    pub fn close(self) -> Result<(), Error> {
        self.stop();
        let index = Arc::try_unwrap(self.index)
            .unwrap_or_else(|_| panic!("Store::close called while other references to the index are alive"));
        index.close()
    }

    /// Launch the background flush worker: it wakes every `poll_interval` and calls `Flush` if
    /// the accumulated work (bytes of record lists appended since the last flush) has crossed
    /// `flush_threshold`. A no-op if the worker is already running. Mutually exclusive with
    /// user-initiated `Flush` — both paths go through the index's own write lock, so at most one
    /// flush is ever in flight.
    pub fn start(&self, flush_threshold: Work, poll_interval: Duration) {
        let mut worker = self.worker.lock().expect("lock poisoned");
        if worker.is_some() {
            return;
        }
        let index = Arc::clone(&self.index);
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(poll_interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if index.work() >= flush_threshold {
                        if let Err(err) = index.flush() {
                            warn!("background flush failed: {}", err);
                        }
                    }
                }
            }
        });
        *worker = Some(Worker { stop: stop_tx, handle });
    }

    /// Launch the background worker with the default threshold and poll interval.
    pub fn start_default(&self) {
        self.start(DEFAULT_FLUSH_THRESHOLD, DEFAULT_POLL_INTERVAL);
    }

    /// Stop the background worker, if one is running, and wait for it to exit.
    pub fn stop(&self) {
        let worker = self.worker.lock().expect("lock poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            let _ = worker.handle.join();
        }
    }
}

impl<P: PrimaryStorage + Send + Sync + 'static> Drop for Store<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct VecPrimary {
        entries: StdMutex<Vec<(Vec<u8>, Vec<u8>)>>,
    }

    impl VecPrimary {
        fn new() -> Self {
            Self {
                entries: StdMutex::new(Vec::new()),
            }
        }
    }

    impl PrimaryStorage for VecPrimary {
        fn index_key(&self, key: &[u8]) -> Result<Vec<u8>, crate::primary::PrimaryError> {
            Ok(key.to_vec())
        }

        fn get(
            &self,
            block: crate::types::Block,
        ) -> Result<(Vec<u8>, Vec<u8>), crate::primary::PrimaryError> {
            Ok(self.entries.lock().unwrap()[block.offset as usize].clone())
        }

        fn put(&self, key: &[u8], value: &[u8]) -> Result<crate::types::Block, crate::primary::PrimaryError> {
            let mut entries = self.entries.lock().unwrap();
            let idx = entries.len();
            entries.push((key.to_vec(), value.to_vec()));
            Ok(crate::types::Block::new(idx as u64, value.len() as u32))
        }
    }

    fn open_store() -> (Store<VecPrimary>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storethehash.index");
        let store = Store::open(&path, VecPrimary::new(), 8).unwrap();
        (store, dir)
    }

    #[test]
    fn put_then_get_roundtrips() {
        let (store, _dir) = open_store();
        store.put(&[1, 2], b"hello").unwrap();
        assert_eq!(store.get(&[1, 2]).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn has_and_get_size() {
        let (store, _dir) = open_store();
        store.put(&[3, 4], b"value").unwrap();
        assert!(store.has(&[3, 4]).unwrap());
        assert!(!store.has(&[9, 9]).unwrap());
        assert_eq!(store.get_size(&[3, 4]).unwrap(), Some(5));
        assert_eq!(store.get_size(&[9, 9]).unwrap(), None);
    }

    #[test]
    fn put_replaces_existing_value() {
        let (store, _dir) = open_store();
        store.put(&[5, 5], b"old").unwrap();
        store.put(&[5, 5], b"new").unwrap();
        assert_eq!(store.get(&[5, 5]).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn flush_and_sync_succeed() {
        let (store, _dir) = open_store();
        store.put(&[6, 6], b"durable").unwrap();
        store.flush().unwrap();
        store.sync().unwrap();
        assert_eq!(store.get(&[6, 6]).unwrap(), Some(b"durable".to_vec()));
    }

    #[test]
    fn background_worker_starts_and_stops_cleanly() {
        let (store, _dir) = open_store();
        store.put(&[7, 7], b"data").unwrap();
        store.start(1, Duration::from_millis(20));
        thread::sleep(Duration::from_millis(80));
        store.stop();
        assert_eq!(store.get(&[7, 7]).unwrap(), Some(b"data".to_vec()));
    }
}
