//! Backing-store I/O for coffer containers
//!
//! A coffer lives in one random-access byte store. The engine only needs
//! positional reads and writes plus resizing, so anything that can offer
//! those (a file, a memory buffer) can host a container.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// Random-access byte storage hosting one container
pub trait Storage: Send {
    /// Fill `buf` from `offset`; reading past the end is an error
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` at `offset`, extending the store if needed
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Current size in bytes
    fn len(&mut self) -> io::Result<u64>;

    /// Resize; growth is zero-filled
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Flush buffered writes to durable storage
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Storage for File {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

/// Create (truncating) a read/write file suitable as container storage
pub fn create_file<P: AsRef<Path>>(path: P) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Open an existing file read/write as container storage
pub fn open_file<P: AsRef<Path>>(path: P) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// In-memory storage
///
/// Clones share the same buffer, so a test can keep one handle to inspect
/// the raw bytes while a container owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing container bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        MemoryStorage {
            data: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Current size in bytes
    pub fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

impl Storage for MemoryStorage {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.lock();
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of storage")
            })?;
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock();
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        let end = start + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length overflow"))?;
        self.data.lock().resize(len, 0);
        Ok(())
    }
}
