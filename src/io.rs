//! Random-access backing stores
//!
//! A container lives entirely inside one [`BackingStore`]: header at offset 0,
//! followed by the cluster array. Two stores ship with the crate: an
//! in-memory buffer and a disk file.

use crate::error::{ClusterError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A resizable random-access byte sequence
pub trait BackingStore {
    /// Current length in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow (zero-filled) or truncate to `len` bytes
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Fill `buf` from `offset`; the whole range must exist
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`, growing the store if the range ends past it
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Make previous writes durable
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: BackingStore + ?Sized> BackingStore for Box<T> {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(offset, data)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }
}

fn out_of_bounds(offset: u64, len: usize, store_len: u64) -> ClusterError {
    ClusterError::Truncated {
        expected: offset.saturating_add(len as u64),
        actual: store_len,
    }
}

/// In-memory store backed by a `Vec<u8>`
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    bytes: Vec<u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore { bytes: Vec::new() }
    }

    /// Wrap existing bytes, e.g. a container image loaded elsewhere
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        MemoryStore { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Direct mutable access, intended for tests that corrupt images
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl BackingStore for MemoryStore {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.bytes.resize(len as usize, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| out_of_bounds(offset, buf.len(), self.len()))?;
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let (start, end) = usize::try_from(offset)
            .ok()
            .and_then(|start| Some((start, start.checked_add(data.len())?)))
            .ok_or_else(|| {
                ClusterError::InvalidArgument(format!(
                    "write of {} bytes at offset {} exceeds memory",
                    data.len(),
                    offset
                ))
            })?;
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// Disk-backed store over a single file
pub struct FileStore {
    file: File,
    path: PathBuf,
    len: u64,
}

impl FileStore {
    /// Create (or truncate) a file
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(FileStore {
            file,
            path: path.as_ref().to_path_buf(),
            len: 0,
        })
    }

    /// Open an existing file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();

        Ok(FileStore {
            file,
            path: path.as_ref().to_path_buf(),
            len,
        })
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackingStore for FileStore {
    fn len(&self) -> u64 {
        self.len
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.len {
            return Err(out_of_bounds(offset, buf.len(), self.len));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.len = self.len.max(offset + data.len() as u64);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
