//! In-memory primary storage implementation.
//!
//! It's using a vector of tuples containing the key-value pairs. Intended as a test fixture, not
//! for production use — nothing here is persisted.

use std::convert::TryFrom;
use std::sync::Mutex;

use hashidx::primary::{PrimaryError, PrimaryStorage};
use hashidx::types::Block;

#[derive(Debug, Default)]
pub struct InMemory(Mutex<Vec<(Vec<u8>, Vec<u8>)>>);

impl InMemory {
    /// It can be initialized with some key value pairs.
    pub fn new(data: &[(Vec<u8>, Vec<u8>)]) -> Self {
        InMemory(Mutex::new(data.to_vec()))
    }
}

impl PrimaryStorage for InMemory {
    fn index_key(&self, key: &[u8]) -> Result<Vec<u8>, PrimaryError> {
        Ok(key.to_vec())
    }

    fn get(&self, block: Block) -> Result<(Vec<u8>, Vec<u8>), PrimaryError> {
        let pos = usize::try_from(block.offset).expect(">=64 bit platform needed");
        Ok(self.0.lock().expect("lock poisoned")[pos].clone())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<Block, PrimaryError> {
        let mut entries = self.0.lock().expect("lock poisoned");
        let pos = entries.len();
        entries.push((key.to_vec(), value.to_vec()));
        Ok(Block::new(
            u64::try_from(pos).expect("64 bit platform needed"),
            value.len() as u32,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::InMemory;

    use hashidx::primary::PrimaryStorage;

    #[test]
    fn get() {
        let aa = (b"aa".to_vec(), vec![0x10]);
        let yy = (b"yy".to_vec(), vec![0x11]);
        let efg = (b"efg".to_vec(), vec![0x12]);
        let storage = InMemory::new(&[aa.clone(), yy.clone(), efg.clone()]);

        let result_aa = storage.get(hashidx::types::Block::new(0, 1)).unwrap();
        assert_eq!(result_aa, aa);
        let result_efg = storage.get(hashidx::types::Block::new(2, 1)).unwrap();
        assert_eq!(result_efg, efg);
        let result_yy = storage.get(hashidx::types::Block::new(1, 1)).unwrap();
        assert_eq!(result_yy, yy);
    }

    #[test]
    fn put() {
        let aa = (b"aa".to_vec(), vec![0x10]);
        let yy = (b"yy".to_vec(), vec![0x11]);
        let efg = (b"efg".to_vec(), vec![0x12]);
        let storage = InMemory::new(&[]);

        let put_aa = storage.put(&aa.0, &aa.1).unwrap();
        assert_eq!(put_aa.offset, 0);
        let put_yy = storage.put(&yy.0, &yy.1).unwrap();
        assert_eq!(put_yy.offset, 1);
        let put_efg = storage.put(&efg.0, &efg.1).unwrap();
        assert_eq!(put_efg.offset, 2);

        let result_aa = storage.get(put_aa).unwrap();
        assert_eq!(result_aa, aa);
        let result_efg = storage.get(put_efg).unwrap();
        assert_eq!(result_efg, efg);
        let result_yy = storage.get(put_yy).unwrap();
        assert_eq!(result_yy, yy);
    }
}
