//! Container manifest and physical I/O channel
//!
//! The manifest owns the backing store. Every physical read or write in a
//! container (header, block headers, payload, page growth) goes through
//! one coarse lock held here, so operations on the store are linearized
//! no matter how many streams are open.

use crate::config::ContainerConfig;
use crate::error::{CofferError, Result};
use crate::header::{Header, FIXED_PREFIX_SIZE};
use crate::io::Storage;
use crate::pointer::{decode_be, Layout};
use parking_lot::Mutex;
use tracing::{debug, trace};

struct ManifestIo {
    storage: Box<dyn Storage>,
    header: Header,
    /// Cached physical length of the store
    len: u64,
}

/// Container manifest: header state plus the physical channel
pub struct Manifest {
    layout: Layout,
    io: Mutex<ManifestIo>,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl Manifest {
    /// Lay out a fresh container in `storage`
    ///
    /// Any previous contents are discarded. The root pointers are null
    /// until [`Manifest::set_roots`] is called.
    pub fn create<S: Storage + 'static>(mut storage: S, config: &ContainerConfig) -> Result<Self> {
        let layout = config.layout()?;
        let header = Header::new(layout);

        storage.set_len(0)?;
        storage.write_at(0, &header.to_bytes())?;

        debug!(
            pointer_width = layout.pointer_width,
            block_size = layout.block_size,
            "laid out new container manifest"
        );

        Ok(Manifest {
            layout,
            io: Mutex::new(ManifestIo {
                storage: Box::new(storage),
                header,
                len: layout.header_size(),
            }),
        })
    }

    /// Open the manifest of an existing container
    pub fn open<S: Storage + 'static>(mut storage: S) -> Result<Self> {
        let len = storage.len()?;
        if len < FIXED_PREFIX_SIZE as u64 {
            return Err(CofferError::Corrupt(
                "insufficient bytes for header".to_string(),
            ));
        }

        let mut prefix = [0u8; FIXED_PREFIX_SIZE];
        storage.read_at(0, &mut prefix)?;
        let header_len = Header::encoded_len(&prefix)?;
        if len < header_len as u64 {
            return Err(CofferError::Corrupt(format!(
                "header needs {} bytes, store has {}",
                header_len, len
            )));
        }

        let mut bytes = vec![0u8; header_len];
        storage.read_at(0, &mut bytes)?;
        let header = Header::from_bytes(&bytes)?;
        let layout = header.layout;

        if !layout.is_compact() && (len - layout.header_size()) % layout.block_size != 0 {
            return Err(CofferError::Corrupt(format!(
                "store length {} is not a whole number of {}-byte blocks",
                len, layout.block_size
            )));
        }

        if header.table_root == 0 || (!layout.is_compact() && header.free_list_root == 0) {
            return Err(CofferError::Corrupt(
                "manifest root pointer is null".to_string(),
            ));
        }

        Ok(Manifest {
            layout,
            io: Mutex::new(ManifestIo {
                storage: Box::new(storage),
                header,
                len,
            }),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Copy of the current header
    pub fn header(&self) -> Header {
        self.io.lock().header
    }

    /// Record the table and free-list root pointers
    pub(crate) fn set_roots(&self, table_root: u64, free_list_root: u64) -> Result<()> {
        let mut io = self.io.lock();
        io.header.table_root = table_root;
        io.header.free_list_root = free_list_root;
        let bytes = io.header.to_bytes();
        io.storage.write_at(0, &bytes)?;
        Ok(())
    }

    /// Physical length of the backing store
    pub fn file_len(&self) -> u64 {
        self.io.lock().len
    }

    /// Number of whole blocks after the header
    pub fn page_count(&self) -> u64 {
        if self.layout.is_compact() {
            return 0;
        }
        (self.file_len() - self.layout.header_size()) / self.layout.block_size
    }

    /// Pointers of every block in the store, in physical order
    pub fn page_pointers(&self) -> Vec<u64> {
        let header = self.layout.header_size();
        (0..self.page_count())
            .map(|i| {
                self.layout
                    .to_block_pointer(header + i * self.layout.block_size)
            })
            .collect()
    }

    /// Pointer of the physically last block, if any
    pub fn last_page(&self) -> Option<u64> {
        let count = self.page_count();
        if count == 0 {
            return None;
        }
        let offset = self.layout.header_size() + (count - 1) * self.layout.block_size;
        Some(self.layout.to_block_pointer(offset))
    }

    /// Pointer of the block physically preceding `pointer`
    pub fn previous_page(&self, pointer: u64) -> Option<u64> {
        let offset = self.layout.to_absolute(pointer);
        let header = self.layout.header_size();
        if offset < header + self.layout.block_size {
            return None;
        }
        Some(self.layout.to_block_pointer(offset - self.layout.block_size))
    }

    fn check_block(&self, io: &ManifestIo, pointer: u64, extent: u64) -> Result<u64> {
        if pointer == 0 {
            return Err(CofferError::Corrupt("null block pointer".to_string()));
        }
        let offset = self.layout.to_absolute(pointer);
        if offset < self.layout.header_size() || offset.saturating_add(extent) > io.len {
            return Err(CofferError::Corrupt(format!(
                "block pointer {} lies outside the container",
                pointer
            )));
        }
        Ok(offset)
    }

    /// Read a block header: (used size, next pointer)
    ///
    /// Compact blocks have no next pointer; it reads as 0.
    pub fn read_block_header(&self, pointer: u64) -> Result<(u64, u64)> {
        let mut io = self.io.lock();
        let size = self.layout.block_header_size();
        let offset = self.check_block(&io, pointer, size)?;

        let mut buf = vec![0u8; size as usize];
        io.storage.read_at(offset, &mut buf)?;

        let width = self.layout.pointer_width;
        let used = decode_be(&buf, width)?;
        let next = if self.layout.is_compact() {
            0
        } else {
            decode_be(&buf[self.layout.width()..], width)?
        };
        Ok((used, next))
    }

    /// Write a block header
    pub fn write_block_header(&self, pointer: u64, used: u64, next: u64) -> Result<()> {
        let mut io = self.io.lock();
        let size = self.layout.block_header_size();
        let offset = self.check_block(&io, pointer, size)?;

        let mut buf = Vec::with_capacity(size as usize);
        self.layout.encode_pointer(used, &mut buf);
        if !self.layout.is_compact() {
            self.layout.encode_pointer(next, &mut buf);
        }
        io.storage.write_at(offset, &buf)?;
        Ok(())
    }

    /// Read raw bytes at an absolute offset
    pub fn read_part(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut io = self.io.lock();
        if offset.saturating_add(buf.len() as u64) > io.len {
            return Err(CofferError::Corrupt(format!(
                "read of {} bytes at {} runs past end of container",
                buf.len(),
                offset
            )));
        }
        io.storage.read_at(offset, buf)?;
        Ok(())
    }

    /// Write raw bytes at an absolute offset inside the container
    pub fn write_part(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut io = self.io.lock();
        if offset < self.layout.header_size() || offset.saturating_add(data.len() as u64) > io.len
        {
            return Err(CofferError::OutOfRange(format!(
                "write of {} bytes at {} lies outside allocated blocks",
                data.len(),
                offset
            )));
        }
        io.storage.write_at(offset, data)?;
        Ok(())
    }

    /// Append one zeroed block to the store and return its pointer
    pub fn allocate_page(&self) -> Result<u64> {
        if self.layout.is_compact() {
            return Err(CofferError::InvalidOperation(
                "compact containers cannot grow".to_string(),
            ));
        }

        let mut io = self.io.lock();
        let offset = io.len;
        let pointer = self.layout.to_block_pointer(offset);
        self.layout.check_fits(pointer, "block pointer")?;

        let new_len = offset + self.layout.block_size;
        io.storage.set_len(new_len)?;
        io.len = new_len;

        trace!(pointer, "appended page");
        Ok(pointer)
    }

    /// Drop `count` blocks from the physical end of the store
    pub(crate) fn truncate_pages(&self, count: u64) -> Result<()> {
        let mut io = self.io.lock();
        let shrink = count * self.layout.block_size;
        let new_len = io.len.saturating_sub(shrink);
        if new_len < self.layout.header_size() {
            return Err(CofferError::OutOfRange(format!(
                "cannot truncate {} blocks from a container of {} bytes",
                count, io.len
            )));
        }
        io.storage.set_len(new_len)?;
        io.len = new_len;
        debug!(count, new_len, "truncated trailing pages");
        Ok(())
    }

    /// Flush the backing store
    pub fn sync(&self) -> Result<()> {
        self.io.lock().storage.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Addressing;
    use crate::io::MemoryStorage;

    fn small_config(addressing: Addressing) -> ContainerConfig {
        ContainerConfig {
            pointer_width: 2,
            block_size: 64,
            addressing,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_writes_header() {
        let storage = MemoryStorage::new();
        let manifest = Manifest::create(storage.clone(), &small_config(Addressing::Block)).unwrap();
        assert_eq!(storage.size(), manifest.layout().header_size());
        assert_eq!(&storage.to_vec()[..8], b"COFR\x00\x01\x00\x00");
        assert_eq!(manifest.page_count(), 0);
        assert_eq!(manifest.last_page(), None);
    }

    #[test]
    fn test_allocate_page_block_addressing() {
        let storage = MemoryStorage::new();
        let manifest = Manifest::create(storage.clone(), &small_config(Addressing::Block)).unwrap();
        assert_eq!(manifest.allocate_page().unwrap(), 1);
        assert_eq!(manifest.allocate_page().unwrap(), 2);
        assert_eq!(manifest.page_count(), 2);
        assert_eq!(storage.size(), 16 + 2 * 64);
        assert_eq!(manifest.last_page(), Some(2));
        assert_eq!(manifest.previous_page(2), Some(1));
        assert_eq!(manifest.previous_page(1), None);
    }

    #[test]
    fn test_allocate_page_absolute_addressing() {
        let manifest =
            Manifest::create(MemoryStorage::new(), &small_config(Addressing::Absolute)).unwrap();
        assert_eq!(manifest.allocate_page().unwrap(), 16);
        assert_eq!(manifest.allocate_page().unwrap(), 80);
        assert_eq!(manifest.page_pointers(), vec![16, 80]);
    }

    #[test]
    fn test_allocate_page_capacity_exceeded() {
        let config = ContainerConfig {
            pointer_width: 1,
            block_size: 100,
            addressing: Addressing::Absolute,
            ..Default::default()
        };
        let manifest = Manifest::create(MemoryStorage::new(), &config).unwrap();
        // header is 13 bytes: pages at 13, 113, 213
        assert_eq!(manifest.allocate_page().unwrap(), 13);
        assert_eq!(manifest.allocate_page().unwrap(), 113);
        assert_eq!(manifest.allocate_page().unwrap(), 213);
        assert!(matches!(
            manifest.allocate_page(),
            Err(CofferError::CapacityExceeded(_))
        ));
        // The failed allocation did not grow the store
        assert_eq!(manifest.page_count(), 3);
    }

    #[test]
    fn test_block_header_round_trip() {
        let manifest =
            Manifest::create(MemoryStorage::new(), &small_config(Addressing::Block)).unwrap();
        let p = manifest.allocate_page().unwrap();
        assert_eq!(manifest.read_block_header(p).unwrap(), (0, 0));
        manifest.write_block_header(p, 17, 5).unwrap();
        assert_eq!(manifest.read_block_header(p).unwrap(), (17, 5));
    }

    #[test]
    fn test_block_header_out_of_bounds() {
        let manifest =
            Manifest::create(MemoryStorage::new(), &small_config(Addressing::Block)).unwrap();
        assert!(matches!(
            manifest.read_block_header(3),
            Err(CofferError::Corrupt(_))
        ));
        assert!(matches!(
            manifest.read_block_header(0),
            Err(CofferError::Corrupt(_))
        ));
    }

    #[test]
    fn test_write_part_rejects_header_region() {
        let manifest =
            Manifest::create(MemoryStorage::new(), &small_config(Addressing::Block)).unwrap();
        manifest.allocate_page().unwrap();
        assert!(matches!(
            manifest.write_part(0, b"oops"),
            Err(CofferError::OutOfRange(_))
        ));
        manifest.write_part(20, b"fine").unwrap();
        let mut buf = [0u8; 4];
        manifest.read_part(20, &mut buf).unwrap();
        assert_eq!(&buf, b"fine");
    }

    #[test]
    fn test_truncate_pages() {
        let storage = MemoryStorage::new();
        let manifest = Manifest::create(storage.clone(), &small_config(Addressing::Block)).unwrap();
        for _ in 0..4 {
            manifest.allocate_page().unwrap();
        }
        manifest.truncate_pages(3).unwrap();
        assert_eq!(manifest.page_count(), 1);
        assert_eq!(storage.size(), 16 + 64);
        assert!(manifest.truncate_pages(2).is_err());
    }

    #[test]
    fn test_open_round_trip() {
        let storage = MemoryStorage::new();
        {
            let manifest =
                Manifest::create(storage.clone(), &small_config(Addressing::Block)).unwrap();
            let a = manifest.allocate_page().unwrap();
            let b = manifest.allocate_page().unwrap();
            manifest.set_roots(b, a).unwrap();
        }

        let manifest = Manifest::open(storage).unwrap();
        let header = manifest.header();
        assert_eq!(header.table_root, 2);
        assert_eq!(header.free_list_root, 1);
        assert_eq!(manifest.page_count(), 2);
    }

    #[test]
    fn test_open_rejects_null_roots() {
        let storage = MemoryStorage::new();
        Manifest::create(storage.clone(), &small_config(Addressing::Block)).unwrap();
        assert!(matches!(
            Manifest::open(storage),
            Err(CofferError::Corrupt(_))
        ));
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let mut bytes = vec![0u8; 64];
        bytes[..8].copy_from_slice(b"NOTCOFFR");
        assert!(matches!(
            Manifest::open(MemoryStorage::from_bytes(bytes)),
            Err(CofferError::InvalidMagic)
        ));
    }
}
