//! Raw block devices the volume engine runs on.
//!
//! The engine only needs positional reads and writes plus a flush. Both
//! implementations here serialize access through a mutex so a single device
//! can be shared by the FAT, the cluster manager and the directory codec.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A byte-addressable device holding one FAT volume.
pub trait BlockDevice: Send + Sync {
    /// Fill `buf` from `offset`. Short reads are errors.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write all of `buf` at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Push buffered writes to stable storage.
    fn flush(&self) -> io::Result<()>;

    /// Hint that `len` bytes at `offset` no longer hold useful data.
    fn discard(&self, _offset: u64, _len: u64) -> io::Result<()> {
        Ok(())
    }

    /// Device size in bytes.
    fn size(&self) -> u64;
}

fn out_of_range(offset: u64, len: usize, size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("access of {len} bytes at {offset} is beyond device end ({size} bytes)"),
    )
}

/// Device backed by a regular file or a raw disk node.
pub struct FileDevice {
    file: Mutex<File>,
    size: u64,
}

impl FileDevice {
    pub fn new(file: File) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }

    /// Open an existing image for reading and writing.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Self::new(file)
    }

    /// Create (or truncate) an image of `size` bytes. The file is sparse on
    /// filesystems that support it.
    pub fn create(path: &Path, size: u64) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Self::new(file)
    }

    fn file(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(out_of_range(offset, buf.len(), self.size));
        }
        let mut file = self.file();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(out_of_range(offset, buf.len(), self.size));
        }
        let mut file = self.file();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    fn flush(&self) -> io::Result<()> {
        let mut file = self.file();
        file.flush()?;
        file.sync_data()
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// In-memory device, mostly for tests and scratch volumes.
pub struct MemoryDevice {
    data: Mutex<Vec<u8>>,
}

impl MemoryDevice {
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size]),
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data().clone()
    }

    fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let data = self.data();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| out_of_range(offset, buf.len(), data.len() as u64))?;
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.data();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| out_of_range(offset, buf.len(), data.len() as u64))?;
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn discard(&self, offset: u64, len: u64) -> io::Result<()> {
        let mut data = self.data();
        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(len) as usize).min(data.len());
        data[start..end].fill(0);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data().len() as u64
    }
}
