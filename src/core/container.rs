//! Container: the engine's thread-safe entry point
//!
//! A container ties together the manifest (physical channel), the free
//! list (allocator) and the metadata table. Lock order is always
//! table → entry stream → free list → manifest.

use crate::allocator::freelist::FreeList;
use crate::allocator::BlockAllocator;
use crate::catalog::{Entry, EntryFlags, MetadataTable, Offstream};
use crate::compact;
use crate::config::ContainerConfig;
use crate::error::{CofferError, Result};
use crate::handle::StreamHandle;
use crate::introspect::{BlockAudit, ChainInfo, ChainOwner, ContainerStats};
use crate::io::Storage;
use crate::manifest::Manifest;
use crate::pointer::Layout;
use crate::stream::BlockStream;
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// An open coffer container
pub struct Container {
    manifest: Arc<Manifest>,
    free_list: Option<Arc<FreeList>>,
    table: RwLock<MetadataTable>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("layout", self.manifest.layout())
            .field("free_list", &self.free_list)
            .field("table", &*self.table.read())
            .finish()
    }
}

impl Container {
    /// Lay out a new, empty container in `storage`
    pub fn create<S: Storage + 'static>(storage: S, config: &ContainerConfig) -> Result<Self> {
        let manifest = Arc::new(Manifest::create(storage, config)?);
        let free_list = Arc::new(FreeList::create(manifest.clone())?);
        let table = MetadataTable::create(manifest.clone(), free_list.clone())?;
        manifest.set_roots(table.root(), free_list.root())?;

        let layout = manifest.layout();
        info!(
            pointer_width = layout.pointer_width,
            block_size = layout.block_size,
            block_addressing = layout.is_block_addressed(),
            single_file = layout.is_single_file(),
            "created container"
        );

        Ok(Container {
            manifest,
            free_list: Some(free_list),
            table: RwLock::new(table),
        })
    }

    /// Open an existing container; compact images open read-only
    pub fn open<S: Storage + 'static>(storage: S) -> Result<Self> {
        let manifest = Arc::new(Manifest::open(storage)?);
        let header = manifest.header();

        let (free_list, table) = if manifest.layout().is_compact() {
            let table = MetadataTable::open(manifest.clone(), None, header.table_root)?;
            (None, table)
        } else {
            let free_list = Arc::new(FreeList::open(manifest.clone(), header.free_list_root)?);
            let allocator: Arc<dyn BlockAllocator> = free_list.clone();
            let table = MetadataTable::open(manifest.clone(), Some(allocator), header.table_root)?;
            (Some(free_list), table)
        };

        info!(
            pointer_width = manifest.layout().pointer_width,
            compact = manifest.layout().is_compact(),
            entries = table.len(),
            file_len = manifest.file_len(),
            "opened container"
        );

        Ok(Container {
            manifest,
            free_list,
            table: RwLock::new(table),
        })
    }

    pub fn layout(&self) -> Layout {
        *self.manifest.layout()
    }

    pub fn is_read_only(&self) -> bool {
        self.free_list.is_none()
    }

    fn free_list(&self) -> Result<&Arc<FreeList>> {
        self.free_list.as_ref().ok_or_else(|| {
            CofferError::InvalidOperation("compact containers have no allocator".to_string())
        })
    }

    pub fn create_entry(&self, name: &str, flags: EntryFlags, parent: u64) -> Result<Entry> {
        self.table.write().create_entry(name, flags, parent)
    }

    pub fn delete_entry(&self, id: u64) -> Result<()> {
        self.table.write().delete_entry(id)
    }

    pub fn move_entry(&self, id: u64, new_parent: u64) -> Result<()> {
        self.table.write().move_entry(id, new_parent)
    }

    pub fn rename(&self, id: u64, name: &str) -> Result<()> {
        self.table.write().rename(id, name)
    }

    pub fn set_hidden(&self, id: u64, hidden: bool) -> Result<()> {
        self.table.write().set_hidden(id, hidden)
    }

    pub fn set_protected(&self, id: u64, protected: bool) -> Result<()> {
        self.table.write().set_protected(id, protected)
    }

    pub fn set_timestamps(
        &self,
        id: u64,
        created: DateTime<Utc>,
        modified: DateTime<Utc>,
    ) -> Result<()> {
        self.table.write().set_timestamps(id, created, modified)
    }

    pub fn touch(&self, id: u64) -> Result<()> {
        self.table.write().touch(id)
    }

    pub fn get_entry(&self, id: u64) -> Result<Entry> {
        self.table.read().get_entry(id)
    }

    pub fn get_entry_by_path(&self, path: &str) -> Result<Entry> {
        self.table.read().get_entry_by_path(path)
    }

    pub fn root_entries(&self) -> Vec<Entry> {
        self.table.read().root_entries()
    }

    pub fn children(&self, id: u64) -> Result<Vec<Entry>> {
        self.table.read().children(id)
    }

    pub fn path_of(&self, id: u64) -> Result<String> {
        self.table.read().path_of(id)
    }

    /// Every entry in table order
    pub fn entries(&self) -> Vec<Entry> {
        self.table.read().entries()
    }

    /// Content stream of a file entry, shared with every other handle on it
    pub fn content(&self, id: u64) -> Result<StreamHandle> {
        self.table.read().content(id)
    }

    pub fn add_offstream(&self, id: u64, name: &str) -> Result<Offstream> {
        self.table.write().add_offstream(id, name)
    }

    pub fn remove_offstream(&self, id: u64, index: usize) -> Result<()> {
        self.table.write().remove_offstream(id, index)
    }

    pub fn offstream(&self, id: u64, index: usize) -> Result<Offstream> {
        self.table.read().offstream(id, index)
    }

    pub fn offstream_names(&self, id: u64) -> Result<Vec<String>> {
        self.table.read().offstream_names(id)
    }

    pub fn find_offstream(&self, id: u64, name: &str) -> Result<Option<Offstream>> {
        self.table.read().find_offstream(id, name)
    }

    /// Truncate free blocks at the end of the store
    ///
    /// Returns the number of blocks removed.
    pub fn optimize(&self) -> Result<u64> {
        self.free_list()?.optimize()
    }

    /// Free block pointers in ascending order (empty for compact images)
    pub fn free_blocks(&self) -> Vec<u64> {
        self.free_list
            .as_ref()
            .map(|list| list.free_pointers())
            .unwrap_or_default()
    }

    /// Serialized metadata table bytes
    pub fn table_records(&self) -> Result<Vec<u8>> {
        self.table.read().raw_records()
    }

    /// Every live chain with its owner
    pub fn live_chains(&self) -> Result<Vec<ChainInfo>> {
        let table = self.table.read();
        let mut chains = vec![ChainInfo {
            owner: ChainOwner::Table,
            blocks: table.chain().to_vec(),
        }];

        if let Some(free_list) = &self.free_list {
            chains.push(ChainInfo {
                owner: ChainOwner::FreeList,
                blocks: free_list.chain(),
            });
        }

        let blocks_of = |root: u64| -> Result<Vec<_>> {
            Ok(BlockStream::open(self.manifest.clone(), None, root)?
                .chain()
                .to_vec())
        };

        for entry in table.entries() {
            let id = entry.id();
            if entry.content_root() != 0 {
                chains.push(ChainInfo {
                    owner: ChainOwner::Content { id },
                    blocks: blocks_of(entry.content_root())?,
                });
            }
            for (index, &root) in entry.offstream_roots().iter().enumerate() {
                chains.push(ChainInfo {
                    owner: ChainOwner::Offstream { id, index },
                    blocks: blocks_of(root)?,
                });
            }
            if entry.is_name_exported() {
                chains.push(ChainInfo {
                    owner: ChainOwner::Name { id },
                    blocks: blocks_of(entry.name_root())?,
                });
            }
        }

        Ok(chains)
    }

    /// Classify every block as live, free, leaked or double-booked
    pub fn audit_blocks(&self) -> Result<BlockAudit> {
        let free_list = self.free_list()?;
        let mut claims: AHashMap<u64, usize> = AHashMap::new();

        let mut audit = BlockAudit::default();
        for chain in self.live_chains()? {
            for block in chain.blocks {
                *claims.entry(block.pointer).or_default() += 1;
                audit.live.push(block.pointer);
            }
        }
        for pointer in free_list.free_pointers() {
            *claims.entry(pointer).or_default() += 1;
            audit.free.push(pointer);
        }

        for pointer in self.manifest.page_pointers() {
            match claims.get(&pointer).copied().unwrap_or(0) {
                0 => audit.leaked.push(pointer),
                1 => {}
                _ => audit.double_booked.push(pointer),
            }
        }

        audit.live.sort_unstable();
        Ok(audit)
    }

    pub fn stats(&self) -> ContainerStats {
        let table = self.table.read();
        let layout = self.manifest.layout();
        let page_count = self.manifest.page_count();
        let free_blocks = self
            .free_list
            .as_ref()
            .map_or(0, |list| list.len() as u64);

        ContainerStats {
            pointer_width: layout.pointer_width,
            block_size: layout.block_size,
            compact: layout.is_compact(),
            file_len: self.manifest.file_len(),
            page_count,
            live_blocks: page_count.saturating_sub(free_blocks),
            free_blocks,
            entries: table.len(),
            table_len: table.chain().iter().map(|b| b.used).sum(),
        }
    }

    /// Write a read-only compact image of this container into `storage`
    ///
    /// Returns the image size in bytes.
    pub fn export_compact<S: Storage>(&self, storage: S) -> Result<u64> {
        let table = self.table.read();
        let size = compact::write_image(&self.manifest, &table, storage)?;
        info!(entries = table.len(), bytes = size, "exported compact image");
        Ok(size)
    }

    /// Flush the backing store
    pub fn flush(&self) -> Result<()> {
        self.manifest.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStorage;

    fn config() -> ContainerConfig {
        ContainerConfig {
            pointer_width: 2,
            block_size: 128,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_sets_roots() {
        let storage = MemoryStorage::new();
        let container = Container::create(storage.clone(), &config()).unwrap();
        let header = container.manifest.header();
        assert_eq!(header.free_list_root, 1);
        assert_eq!(header.table_root, 2);

        let reopened = Container::open(storage).unwrap();
        assert!(reopened.root_entries().is_empty());
        assert!(!reopened.is_read_only());
    }

    #[test]
    fn test_content_survives_reopen() {
        let storage = MemoryStorage::new();
        {
            let container = Container::create(storage.clone(), &config()).unwrap();
            let entry = container
                .create_entry("data.bin", EntryFlags::empty(), 0)
                .unwrap();
            let mut content = container.content(entry.id()).unwrap();
            content.write(&[42u8; 500]).unwrap();
            container.flush().unwrap();
        }

        let container = Container::open(storage).unwrap();
        let entry = container.get_entry_by_path("data.bin").unwrap();
        let mut content = container.content(entry.id()).unwrap();
        assert_eq!(content.read_to_end().unwrap(), vec![42u8; 500]);
    }

    #[test]
    fn test_audit_of_fresh_and_used_container() {
        let container = Container::create(MemoryStorage::new(), &config()).unwrap();
        assert!(container.audit_blocks().unwrap().is_consistent());

        let entry = container.create_entry("f", EntryFlags::empty(), 0).unwrap();
        let mut content = container.content(entry.id()).unwrap();
        content.write(&[1u8; 1000]).unwrap();
        content.set_len(100).unwrap();

        let audit = container.audit_blocks().unwrap();
        assert!(audit.is_consistent(), "{:?}", audit);
        assert!(!audit.free.is_empty());
    }

    #[test]
    fn test_stats() {
        let container = Container::create(MemoryStorage::new(), &config()).unwrap();
        container.create_entry("a", EntryFlags::empty(), 0).unwrap();
        let stats = container.stats();
        assert_eq!(stats.pointer_width, 2);
        assert_eq!(stats.entries, 1);
        // free list, table, content of "a"
        assert_eq!(stats.page_count, 3);
        assert_eq!(stats.free_blocks, 0);

        let json = stats.to_json().unwrap();
        assert!(json.contains("\"page_count\": 3"));
    }

    #[test]
    fn test_live_chain_owners() {
        let container = Container::create(MemoryStorage::new(), &config()).unwrap();
        let entry = container.create_entry("f", EntryFlags::empty(), 0).unwrap();
        container.add_offstream(entry.id(), "side").unwrap();

        let owners: Vec<ChainOwner> = container
            .live_chains()
            .unwrap()
            .into_iter()
            .map(|c| c.owner)
            .collect();
        assert_eq!(
            owners,
            vec![
                ChainOwner::Table,
                ChainOwner::FreeList,
                ChainOwner::Content { id: 1 },
                ChainOwner::Offstream { id: 1, index: 0 },
            ]
        );
    }

    #[test]
    fn test_compact_export_is_read_only() {
        let container = Container::create(MemoryStorage::new(), &config()).unwrap();
        let dir = container
            .create_entry("dir", EntryFlags::DIRECTORY, 0)
            .unwrap();
        let file = container
            .create_entry("file", EntryFlags::empty(), dir.id())
            .unwrap();
        container.content(file.id()).unwrap().write(b"payload").unwrap();

        let image = MemoryStorage::new();
        container.export_compact(image.clone()).unwrap();

        let compact = Container::open(image).unwrap();
        assert!(compact.is_read_only());
        assert!(compact.layout().is_compact());

        let entry = compact.get_entry_by_path("/dir/file").unwrap();
        let mut content = compact.content(entry.id()).unwrap();
        assert_eq!(content.read_to_end().unwrap(), b"payload");
        assert!(matches!(
            content.write(b"x"),
            Err(CofferError::InvalidOperation(_))
        ));
        assert!(matches!(
            compact.create_entry("new", EntryFlags::empty(), 0),
            Err(CofferError::InvalidOperation(_))
        ));
        assert!(matches!(
            compact.delete_entry(entry.id()),
            Err(CofferError::InvalidOperation(_))
        ));
        assert!(matches!(
            compact.optimize(),
            Err(CofferError::InvalidOperation(_))
        ));
    }
}
