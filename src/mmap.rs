//! An append-only file backed by a private, fixed-size anonymous mapping.
//!
//! The mapping is the single source of truth for reads during the life of the process: every
//! byte ever written through [`AppendMmap::write`] is visible through [`AppendMmap::at`]
//! immediately, whether or not it has reached the file yet. [`AppendMmap::flush`] is the only
//! operation that extends the file; [`AppendMmap::sync`] is the only one that calls `fsync`.
//!
//! The mapping is anonymous rather than a direct mapping of the file so that its virtual size can
//! be much larger than the file's current size without pre-extending the file on disk: on open,
//! the file's existing bytes are copied into the head of a fresh anonymous mapping.
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use memmap2::{MmapMut, MmapOptions};

use crate::error::Error;

/// Virtual size of the mapping on platforms where a `usize` can represent it.
#[cfg(target_pointer_width = "64")]
const MMAP_SIZE: usize = 16 << 30;
#[cfg(not(target_pointer_width = "64"))]
const MMAP_SIZE: usize = 2 << 30;

/// An append-only region backed by an anonymous private mapping.
pub struct AppendMmap {
    mmap: MmapMut,
    file: File,
    /// Number of bytes of the mapping that have already been written to `file`.
    file_append_pos: usize,
    /// Number of bytes of the mapping that have been written to by `write`.
    append_pos: usize,
    /// Virtual size of the mapping.
    size: usize,
}

impl AppendMmap {
    /// Open the append region over `file`, copying the file's existing contents into the head
    /// of a fresh anonymous mapping.
    pub fn open(mut file: File) -> Result<Self, Error> {
        let file_size = file.seek(SeekFrom::End(0))? as usize;
        let mut mmap = MmapOptions::new().len(MMAP_SIZE).map_anon()?;

        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut mmap[..file_size])?;

        Ok(Self {
            mmap,
            file,
            file_append_pos: file_size,
            append_pos: file_size,
            size: MMAP_SIZE,
        })
    }

    /// Current append position: the number of bytes written through `write` so far, whether or
    /// not they have been flushed to the file.
    pub fn append_pos(&self) -> u64 {
        self.append_pos as u64
    }

    /// A bounds-checked view into the mapping.
    pub fn at(&self, offset: u64, len: u64) -> Result<&[u8], Error> {
        let offset = offset as usize;
        let len = len as usize;
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(Error::OutOfBounds);
        }
        Ok(&self.mmap[offset..offset + len])
    }

    /// Copy `bytes` into the mapping at the current append position, advancing it.
    ///
    /// Returns the offset at which `bytes` was written.
    pub fn write(&mut self, bytes: &[u8]) -> Result<u64, Error> {
        let start = self.append_pos;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= self.size)
            .ok_or(Error::OutOfBounds)?;
        self.mmap[start..end].copy_from_slice(bytes);
        self.append_pos = end;
        Ok(start as u64)
    }

    /// Write the unflushed tail of the mapping to the file. Returns the number of bytes newly
    /// flushed. Idempotent when nothing has changed since the last flush.
    pub fn flush(&mut self) -> Result<usize, Error> {
        if self.file_append_pos == self.append_pos {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(self.file_append_pos as u64))?;
        self.file
            .write_all(&self.mmap[self.file_append_pos..self.append_pos])?;
        let flushed = self.append_pos - self.file_append_pos;
        self.file_append_pos = self.append_pos;
        Ok(flushed)
    }

    /// fsync the backing file.
    pub fn sync(&self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Unmap and close the backing file. Dropping an `AppendMmap` does the same thing
    /// implicitly; `close` exists so callers can observe I/O errors.
    pub fn close(self) -> Result<(), Error> {
        drop(self.mmap);
        drop(self.file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file() -> File {
        tempfile::tempfile().unwrap()
    }

    #[test]
    fn write_then_read_before_flush() {
        let mut mmap = AppendMmap::open(temp_file()).unwrap();
        let offset = mmap.write(b"hello").unwrap();
        assert_eq!(offset, 0);
        assert_eq!(mmap.at(offset, 5).unwrap(), b"hello");
    }

    #[test]
    fn flush_is_idempotent_and_persists() {
        let mut mmap = AppendMmap::open(temp_file()).unwrap();
        mmap.write(b"hello").unwrap();
        let flushed = mmap.flush().unwrap();
        assert_eq!(flushed, 5);
        let flushed_again = mmap.flush().unwrap();
        assert_eq!(flushed_again, 0);
    }

    #[test]
    fn reopen_sees_flushed_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        {
            let mut mmap = AppendMmap::open(file.reopen().unwrap()).unwrap();
            mmap.write(b"hello").unwrap();
            mmap.flush().unwrap();
            mmap.sync().unwrap();
        }
        let mut mmap = AppendMmap::open(file.reopen().unwrap()).unwrap();
        assert_eq!(mmap.at(0, 5).unwrap(), b"hello");
        // And it's still appendable from the end.
        let offset = mmap.write(b"!").unwrap();
        assert_eq!(offset, 5);
        let _ = file.flush();
    }

    #[test]
    fn write_out_of_bounds() {
        let mut mmap = AppendMmap::open(temp_file()).unwrap();
        let huge = vec![0u8; MMAP_SIZE + 1];
        assert!(matches!(mmap.write(&huge), Err(Error::OutOfBounds)));
    }

    #[test]
    fn at_out_of_bounds() {
        let mmap = AppendMmap::open(temp_file()).unwrap();
        assert!(matches!(mmap.at(0, MMAP_SIZE as u64 + 1), Err(Error::OutOfBounds)));
    }
}
