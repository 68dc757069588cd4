//! Metadata table
//!
//! The table is one block chain holding entry records back to back. It is
//! scanned once at open time into an id index and a parent → children
//! adjacency; after that every change is written through immediately by
//! splicing the affected record in place and shifting the recorded
//! offsets of every later record.

pub mod entry;
pub mod offstream;

pub use entry::{Entry, EntryFlags};
pub use offstream::Offstream;

use self::entry::now_millis;
use crate::allocator::BlockAllocator;
use crate::error::{CofferError, Result};
use crate::handle::{StreamHandle, StreamRegistry};
use crate::manifest::Manifest;
use crate::pointer::Layout;
use crate::stream::{BlockStream, ChainBlock};
use crate::validation::{join_path, split_path, validate_entry_name, validate_offstream_name};
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

const PATH_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(capacity) => capacity,
    None => panic!("path cache capacity must be non-zero"),
};

/// In-memory view of the metadata table, written through on every change
pub struct MetadataTable {
    manifest: Arc<Manifest>,
    layout: Layout,
    allocator: Option<Arc<dyn BlockAllocator>>,
    stream: BlockStream,
    entries: AHashMap<u64, Entry>,
    /// Child ids per parent in table order; key 0 holds the roots
    children: AHashMap<u64, Vec<u64>>,
    path_cache: Mutex<LruCache<String, u64>>,
    /// Content and offstream chains with live handles
    streams: StreamRegistry,
}

impl std::fmt::Debug for MetadataTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataTable")
            .field("root", &self.stream.root())
            .field("entries", &self.entries.len())
            .field("table_len", &self.stream.len())
            .finish()
    }
}

impl MetadataTable {
    /// Create an empty table
    pub fn create(manifest: Arc<Manifest>, allocator: Arc<dyn BlockAllocator>) -> Result<Self> {
        let stream = BlockStream::create(manifest.clone(), allocator.clone())?;
        Ok(Self::with_stream(manifest, Some(allocator), stream))
    }

    /// Load the table rooted at `root`
    ///
    /// Without an allocator the table is load-only.
    pub fn open(
        manifest: Arc<Manifest>,
        allocator: Option<Arc<dyn BlockAllocator>>,
        root: u64,
    ) -> Result<Self> {
        let stream = BlockStream::open(manifest.clone(), allocator.clone(), root)?;
        let mut table = Self::with_stream(manifest, allocator, stream);
        table.load_entries()?;
        debug!(root, entries = table.entries.len(), "loaded metadata table");
        Ok(table)
    }

    fn with_stream(
        manifest: Arc<Manifest>,
        allocator: Option<Arc<dyn BlockAllocator>>,
        stream: BlockStream,
    ) -> Self {
        let layout = *manifest.layout();
        let mut children = AHashMap::new();
        children.insert(0, Vec::new());

        MetadataTable {
            manifest,
            layout,
            allocator,
            stream,
            entries: AHashMap::new(),
            children,
            path_cache: Mutex::new(LruCache::new(PATH_CACHE_CAPACITY)),
            streams: StreamRegistry::default(),
        }
    }

    fn load_entries(&mut self) -> Result<()> {
        self.stream.seek(0);
        let bytes = self.stream.read_to_end()?;

        let mut order = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let (mut entry, len) = Entry::decode(&bytes[offset..], &self.layout)?;
            entry.table_offset = offset as u64;
            if entry.is_name_exported() {
                entry.name = self.read_exported_name(entry.name_pointer)?;
            }
            if self.entries.contains_key(&entry.id) {
                return Err(CofferError::Corrupt(format!(
                    "duplicate entry id {} in table",
                    entry.id
                )));
            }
            order.push(entry.id);
            self.entries.insert(entry.id, entry);
            offset += len;
        }

        for id in order {
            let parent = self.entries[&id].parent;
            if parent != 0 {
                let valid = !self.layout.is_single_file()
                    && self.entries.get(&parent).is_some_and(Entry::is_directory);
                if !valid {
                    return Err(CofferError::Corrupt(format!(
                        "entry {} has invalid parent {}",
                        id, parent
                    )));
                }
            }
            self.children.entry(parent).or_default().push(id);
        }
        Ok(())
    }

    fn read_exported_name(&self, root: u64) -> Result<String> {
        let mut stream = BlockStream::open(self.manifest.clone(), None, root)?;
        let bytes = stream.read_to_end()?;
        String::from_utf8(bytes)
            .map_err(|_| CofferError::Corrupt(format!("exported name at {} is not UTF-8", root)))
    }

    /// Root block of the table chain
    pub fn root(&self) -> u64 {
        self.stream.root()
    }

    /// Blocks of the table chain
    pub fn chain(&self) -> &[ChainBlock] {
        self.stream.chain()
    }

    /// Serialized table bytes as currently persisted
    pub fn raw_records(&self) -> Result<Vec<u8>> {
        BlockStream::open(self.manifest.clone(), None, self.stream.root())?.read_to_end()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_read_only(&self) -> bool {
        self.layout.is_compact() || self.allocator.is_none()
    }

    fn check_writable(&self) -> Result<Arc<dyn BlockAllocator>> {
        if self.layout.is_compact() {
            return Err(CofferError::InvalidOperation(
                "compact containers are read-only".to_string(),
            ));
        }
        self.allocator
            .clone()
            .ok_or_else(|| CofferError::InvalidOperation("table is read-only".to_string()))
    }

    fn check_hierarchy(&self) -> Result<()> {
        if self.layout.is_single_file() {
            return Err(CofferError::InvalidOperation(
                "single-file containers have no directory hierarchy".to_string(),
            ));
        }
        Ok(())
    }

    fn entry_ref(&self, id: u64) -> Result<&Entry> {
        self.entries
            .get(&id)
            .ok_or_else(|| CofferError::NotFound(format!("entry {}", id)))
    }

    fn unprotected(&self, id: u64) -> Result<Entry> {
        let entry = self.entry_ref(id)?;
        if entry.is_protected() {
            return Err(CofferError::InvalidOperation(format!(
                "entry '{}' is protected",
                entry.name
            )));
        }
        Ok(entry.clone())
    }

    fn find_child(&self, parent: u64, name: &str) -> Option<u64> {
        self.children
            .get(&parent)?
            .iter()
            .copied()
            .find(|id| self.entries.get(id).is_some_and(|e| e.name == name))
    }

    fn check_directory(&self, id: u64) -> Result<()> {
        if id != 0 && !self.entry_ref(id)?.is_directory() {
            return Err(CofferError::InvalidOperation(format!(
                "entry {} is not a directory",
                id
            )));
        }
        Ok(())
    }

    /// Smallest unused id, starting at 1
    fn next_id(&self) -> Result<u64> {
        let id = (1..=u64::MAX)
            .find(|id| !self.entries.contains_key(id))
            .ok_or_else(|| CofferError::CapacityExceeded("entry ids exhausted".to_string()))?;
        self.layout.check_fits(id, "entry id")?;
        Ok(id)
    }

    fn should_export(&self, name: &str) -> bool {
        2 * name.len() as u64 >= self.layout.payload_capacity()
    }

    fn write_name_chain(&self, allocator: &Arc<dyn BlockAllocator>, name: &str) -> Result<u64> {
        let mut stream = BlockStream::create(self.manifest.clone(), allocator.clone())?;
        let root = stream.root();
        if let Err(err) = stream.write(name.as_bytes()) {
            stream.destroy_all_blocks()?;
            return Err(err);
        }
        Ok(root)
    }

    /// Release a chain, invalidating any handles still open on it
    fn release_chain(&self, allocator: &Arc<dyn BlockAllocator>, root: u64) -> Result<()> {
        self.streams.destroy(root, || {
            BlockStream::open(self.manifest.clone(), Some(allocator.clone()), root)
        })
    }

    /// Shared handle on the chain at `root` of `entry`
    fn stream_handle(&self, entry: &Entry, root: u64) -> Result<StreamHandle> {
        let protected = entry.is_protected();
        self.streams.handle(root, || {
            let mut stream =
                BlockStream::open(self.manifest.clone(), self.allocator.clone(), root)?;
            stream.set_read_only(protected);
            Ok(stream)
        })
    }

    fn release_entry_chains(&self, allocator: &Arc<dyn BlockAllocator>, entry: &Entry) -> Result<()> {
        for &root in &entry.offstreams {
            self.release_chain(allocator, root)?;
        }
        if entry.content != 0 {
            self.release_chain(allocator, entry.content)?;
        }
        if entry.is_name_exported() && entry.name_pointer != 0 {
            self.release_chain(allocator, entry.name_pointer)?;
        }
        Ok(())
    }

    fn shift_offsets(&mut self, after: u64, delta: i64) {
        if delta == 0 {
            return;
        }
        for entry in self.entries.values_mut() {
            if entry.table_offset > after {
                entry.table_offset = entry.table_offset.saturating_add_signed(delta);
            }
        }
    }

    /// Commit an updated entry: re-serialize it and splice the record over
    /// the stored one
    ///
    /// Every later record's offset shifts by the change in record length
    /// and cached path lookups are dropped. Callers validate the change
    /// first; this only persists it.
    pub(crate) fn entry_changed(&mut self, mut updated: Entry) -> Result<()> {
        self.check_writable()?;
        let current = self.entry_ref(updated.id)?;
        let offset = current.table_offset;
        let old_len = current.table_length;

        let record = updated.encode(&self.layout);
        self.stream.seek(offset);
        self.stream.replace(old_len, &record)?;

        let new_len = record.len() as u64;
        self.shift_offsets(offset, new_len as i64 - old_len as i64);
        updated.table_offset = offset;
        updated.table_length = new_len;
        self.entries.insert(updated.id, updated);
        self.path_cache.lock().clear();
        Ok(())
    }

    /// Create a file or directory entry under `parent` (0 for the root)
    pub fn create_entry(&mut self, name: &str, flags: EntryFlags, parent: u64) -> Result<Entry> {
        let allocator = self.check_writable()?;

        if flags.intersects(EntryFlags::MANAGED) {
            return Err(CofferError::InvalidOperation(
                "offstream and exported-name flags are managed by the table".to_string(),
            ));
        }
        validate_entry_name(name, self.layout.is_single_file())?;

        if self.layout.is_single_file() {
            if parent != 0 || flags.contains(EntryFlags::DIRECTORY) {
                self.check_hierarchy()?;
            }
        } else {
            self.check_directory(parent)?;
            if self.find_child(parent, name).is_some() {
                return Err(CofferError::AlreadyExists(name.to_string()));
            }
        }

        let id = self.next_id()?;
        let mut entry = Entry::new(id, name, flags, parent);
        if self.layout.has_extended_attributes() {
            let now = now_millis();
            entry.created = Some(now);
            entry.modified = Some(now);
        }

        if entry.is_file() {
            let content = BlockStream::create(self.manifest.clone(), allocator.clone())?;
            entry.content = content.root();
        }

        if self.should_export(name) {
            match self.write_name_chain(&allocator, name) {
                Ok(root) => {
                    entry.name_pointer = root;
                    entry.flags.insert(EntryFlags::NAME_EXPORTED);
                }
                Err(err) => {
                    self.release_entry_chains(&allocator, &entry)?;
                    return Err(err);
                }
            }
        }

        let record = entry.encode(&self.layout);
        let offset = self.stream.len();
        self.stream.seek(offset);
        if let Err(err) = self.stream.write(&record) {
            self.release_entry_chains(&allocator, &entry)?;
            return Err(err);
        }
        entry.table_offset = offset;
        entry.table_length = record.len() as u64;

        self.children.entry(parent).or_default().push(id);
        self.entries.insert(id, entry.clone());

        debug!(id, name, parent, directory = entry.is_directory(), "created entry");
        Ok(entry)
    }

    /// Delete an entry and, for directories, everything below it
    pub fn delete_entry(&mut self, id: u64) -> Result<()> {
        let allocator = self.check_writable()?;
        self.entry_ref(id)?;

        let mut doomed = Vec::new();
        self.collect_subtree(id, &mut doomed);
        if let Some(entry) = doomed
            .iter()
            .filter_map(|id| self.entries.get(id))
            .find(|e| e.is_protected())
        {
            return Err(CofferError::InvalidOperation(format!(
                "entry '{}' is protected",
                entry.name
            )));
        }

        for victim in &doomed {
            self.remove_entry(&allocator, *victim)?;
        }
        self.path_cache.lock().clear();

        debug!(id, removed = doomed.len(), "deleted entry");
        Ok(())
    }

    /// Post-order: children before their parent
    fn collect_subtree(&self, id: u64, out: &mut Vec<u64>) {
        if let Some(children) = self.children.get(&id) {
            for &child in children {
                self.collect_subtree(child, out);
            }
        }
        out.push(id);
    }

    fn remove_entry(&mut self, allocator: &Arc<dyn BlockAllocator>, id: u64) -> Result<()> {
        let entry = self.entry_ref(id)?.clone();

        self.stream.seek(entry.table_offset);
        self.stream.replace(entry.table_length, &[])?;
        self.shift_offsets(entry.table_offset, -(entry.table_length as i64));

        self.entries.remove(&id);
        self.children.remove(&id);
        if let Some(siblings) = self.children.get_mut(&entry.parent) {
            siblings.retain(|&child| child != id);
        }

        self.release_entry_chains(allocator, &entry)
    }

    /// Re-parent an entry; permitted on protected entries
    pub fn move_entry(&mut self, id: u64, new_parent: u64) -> Result<()> {
        self.check_writable()?;
        self.check_hierarchy()?;

        let entry = self.entry_ref(id)?.clone();
        self.check_directory(new_parent)?;

        let mut cursor = new_parent;
        while cursor != 0 {
            if cursor == id {
                return Err(CofferError::InvalidOperation(format!(
                    "cannot move '{}' into itself",
                    entry.name
                )));
            }
            cursor = self.entry_ref(cursor)?.parent;
        }

        if entry.parent == new_parent {
            return Ok(());
        }
        if self.find_child(new_parent, &entry.name).is_some() {
            return Err(CofferError::AlreadyExists(entry.name));
        }

        let old_parent = entry.parent;
        let mut updated = entry;
        updated.parent = new_parent;
        self.entry_changed(updated)?;

        if let Some(siblings) = self.children.get_mut(&old_parent) {
            siblings.retain(|&child| child != id);
        }
        self.children.entry(new_parent).or_default().push(id);

        debug!(id, old_parent, new_parent, "moved entry");
        Ok(())
    }

    /// Rename an entry, exporting or inlining the name as its length requires
    pub fn rename(&mut self, id: u64, name: &str) -> Result<()> {
        let allocator = self.check_writable()?;
        let entry = self.unprotected(id)?;
        validate_entry_name(name, self.layout.is_single_file())?;

        if !self.layout.is_single_file()
            && name != entry.name
            && self.find_child(entry.parent, name).is_some()
        {
            return Err(CofferError::AlreadyExists(name.to_string()));
        }

        let mut updated = entry.clone();
        updated.name = name.to_string();
        let mut fresh_chain = None;

        if self.should_export(name) {
            if entry.is_name_exported() {
                let mut chain = BlockStream::open(
                    self.manifest.clone(),
                    Some(allocator.clone()),
                    entry.name_pointer,
                )?;
                chain.write(name.as_bytes())?;
                chain.set_len(name.len() as u64)?;
            } else {
                let root = self.write_name_chain(&allocator, name)?;
                updated.name_pointer = root;
                updated.flags.insert(EntryFlags::NAME_EXPORTED);
                fresh_chain = Some(root);
            }
        } else {
            updated.name_pointer = 0;
            updated.flags.remove(EntryFlags::NAME_EXPORTED);
        }

        if let Err(err) = self.entry_changed(updated) {
            if let Some(root) = fresh_chain {
                self.release_chain(&allocator, root)?;
            }
            return Err(err);
        }

        if entry.is_name_exported() && !self.should_export(name) {
            self.release_chain(&allocator, entry.name_pointer)?;
        }

        debug!(id, from = %entry.name, to = name, "renamed entry");
        Ok(())
    }

    fn update_flag(&mut self, id: u64, flag: EntryFlags, value: bool) -> Result<()> {
        self.check_writable()?;
        let mut updated = self.entry_ref(id)?.clone();
        if updated.flags.contains(flag) == value {
            return Ok(());
        }
        updated.flags.set(flag, value);
        self.entry_changed(updated.clone())?;

        if flag == EntryFlags::PROTECTED {
            let roots = updated.offstreams.iter().copied().chain(Some(updated.content));
            for root in roots.filter(|&root| root != 0) {
                self.streams.set_read_only(root, value);
            }
        }
        Ok(())
    }

    pub fn set_hidden(&mut self, id: u64, hidden: bool) -> Result<()> {
        self.update_flag(id, EntryFlags::HIDDEN, hidden)
    }

    /// Protect or unprotect an entry (always permitted)
    pub fn set_protected(&mut self, id: u64, protected: bool) -> Result<()> {
        self.update_flag(id, EntryFlags::PROTECTED, protected)
    }

    /// Overwrite both timestamps (extended-attribute containers only)
    pub fn set_timestamps(
        &mut self,
        id: u64,
        created: DateTime<Utc>,
        modified: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        if !self.layout.has_extended_attributes() {
            return Err(CofferError::InvalidOperation(
                "container does not store timestamps".to_string(),
            ));
        }

        let mut updated = self.entry_ref(id)?.clone();
        updated.created = DateTime::from_timestamp_millis(created.timestamp_millis());
        updated.modified = DateTime::from_timestamp_millis(modified.timestamp_millis());
        self.entry_changed(updated)
    }

    /// Set the modified timestamp to now
    pub fn touch(&mut self, id: u64) -> Result<()> {
        let created = self.entry_ref(id)?.created.unwrap_or_else(now_millis);
        self.set_timestamps(id, created, now_millis())
    }

    /// Content stream of a file entry
    ///
    /// Every handle on the same entry shares one stream, each with its own
    /// cursor. Protected entries and compact containers yield read-only
    /// streams; deleting the entry invalidates all of its handles.
    pub fn content(&self, id: u64) -> Result<StreamHandle> {
        let entry = self.entry_ref(id)?;
        if entry.is_directory() {
            return Err(CofferError::InvalidOperation(format!(
                "'{}' is a directory",
                entry.name
            )));
        }

        self.stream_handle(entry, entry.content)
    }

    /// Attach a new, empty offstream to an entry
    pub fn add_offstream(&mut self, id: u64, name: &str) -> Result<Offstream> {
        let allocator = self.check_writable()?;
        let entry = self.unprotected(id)?;
        validate_offstream_name(name)?;

        if self.offstream_names(id)?.iter().any(|existing| existing == name) {
            return Err(CofferError::AlreadyExists(format!(
                "offstream '{}' on entry {}",
                name, id
            )));
        }

        let stream = BlockStream::create(self.manifest.clone(), allocator.clone())?;
        let root = stream.root();
        let offstream = match Offstream::initialize(self.streams.adopt(stream), name) {
            Ok(offstream) => offstream,
            Err(err) => {
                self.release_chain(&allocator, root)?;
                return Err(err);
            }
        };

        let mut updated = entry;
        updated.offstreams.push(root);
        updated.flags.insert(EntryFlags::HAS_OFFSTREAMS);
        if let Err(err) = self.entry_changed(updated) {
            drop(offstream);
            self.release_chain(&allocator, root)?;
            return Err(err);
        }

        debug!(id, name, root, "attached offstream");
        Ok(offstream)
    }

    /// Detach and destroy the offstream at `index`
    pub fn remove_offstream(&mut self, id: u64, index: usize) -> Result<()> {
        let allocator = self.check_writable()?;
        let entry = self.unprotected(id)?;
        if index >= entry.offstreams.len() {
            return Err(CofferError::OutOfRange(format!(
                "offstream index {} on entry {} with {} offstreams",
                index,
                id,
                entry.offstreams.len()
            )));
        }

        let mut updated = entry;
        let root = updated.offstreams.remove(index);
        if updated.offstreams.is_empty() {
            updated.flags.remove(EntryFlags::HAS_OFFSTREAMS);
        }
        self.entry_changed(updated)?;
        self.release_chain(&allocator, root)?;

        debug!(id, index, root, "removed offstream");
        Ok(())
    }

    /// Open the offstream at `index`
    pub fn offstream(&self, id: u64, index: usize) -> Result<Offstream> {
        let entry = self.entry_ref(id)?;
        let root = *entry.offstreams.get(index).ok_or_else(|| {
            CofferError::OutOfRange(format!(
                "offstream index {} on entry {} with {} offstreams",
                index,
                id,
                entry.offstreams.len()
            ))
        })?;

        Offstream::load(self.stream_handle(entry, root)?)
    }

    /// Names of an entry's offstreams in attachment order
    pub fn offstream_names(&self, id: u64) -> Result<Vec<String>> {
        let count = self.entry_ref(id)?.offstreams.len();
        (0..count)
            .map(|index| Ok(self.offstream(id, index)?.name().to_string()))
            .collect()
    }

    /// Open the offstream named `name`, if attached
    pub fn find_offstream(&self, id: u64, name: &str) -> Result<Option<Offstream>> {
        let count = self.entry_ref(id)?.offstreams.len();
        for index in 0..count {
            let offstream = self.offstream(id, index)?;
            if offstream.name() == name {
                return Ok(Some(offstream));
            }
        }
        Ok(None)
    }

    pub fn get_entry(&self, id: u64) -> Result<Entry> {
        self.entry_ref(id).cloned()
    }

    /// Resolve a `/`-separated path from the roots
    ///
    /// In single-file containers the path is the entry name and the first
    /// entry in table order with that name wins.
    pub fn get_entry_by_path(&self, path: &str) -> Result<Entry> {
        let not_found = || CofferError::NotFound(path.to_string());

        if self.layout.is_single_file() {
            let id = self.find_child(0, path).ok_or_else(not_found)?;
            return self.get_entry(id);
        }

        if let Some(id) = self.path_cache.lock().get(path).copied() {
            if let Some(entry) = self.entries.get(&id) {
                return Ok(entry.clone());
            }
        }

        let segments = split_path(path);
        if segments.is_empty() {
            return Err(not_found());
        }

        let mut current = 0;
        for segment in segments {
            current = self.find_child(current, segment).ok_or_else(not_found)?;
        }

        self.path_cache.lock().put(path.to_string(), current);
        self.get_entry(current)
    }

    /// Entries with no parent, in table order
    pub fn root_entries(&self) -> Vec<Entry> {
        self.child_entries(0)
    }

    /// Children of a directory (0 for the roots), in table order
    pub fn children(&self, id: u64) -> Result<Vec<Entry>> {
        if id != 0 {
            self.entry_ref(id)?;
        }
        Ok(self.child_entries(id))
    }

    fn child_entries(&self, id: u64) -> Vec<Entry> {
        self.children
            .get(&id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|child| self.entries.get(child).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Absolute path of an entry
    pub fn path_of(&self, id: u64) -> Result<String> {
        let mut names = Vec::new();
        let mut cursor = id;
        while cursor != 0 {
            let entry = self.entry_ref(cursor)?;
            names.push(entry.name.as_str());
            cursor = entry.parent;
        }
        names.reverse();
        Ok(join_path(names))
    }

    /// Every entry, ordered by record position
    pub fn entries(&self) -> Vec<Entry> {
        let mut all: Vec<Entry> = self.entries.values().cloned().collect();
        all.sort_by_key(|e| e.table_offset);
        all
    }
}
