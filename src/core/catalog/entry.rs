//! Table entries and their record codec
//!
//! Record layout (all pointer-sized fields are `w` bytes, big-endian):
//!
//! ```text
//! flags u8
//! name        NUL-terminated UTF-8, or a w-byte name chain root if NAME_EXPORTED
//! id          w
//! content     w                      files only
//! offstreams  w * n, then a w-byte 0  only if HAS_OFFSTREAMS
//! created     i64 ms, big-endian      only with extended attributes
//! modified    i64 ms, big-endian      only with extended attributes
//! parent      w
//! ```

use crate::error::{CofferError, Result};
use crate::pointer::Layout;
use bitflags::bitflags;
use chrono::{DateTime, Utc};

bitflags! {
    /// Per-entry flag byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u8 {
        const DIRECTORY = 0b0000_0001;
        const HIDDEN = 0b0000_0010;
        const PROTECTED = 0b0000_0100;
        /// Maintained by the table: the record lists offstream roots
        const HAS_OFFSTREAMS = 0b0000_1000;
        /// Maintained by the table: the name lives in its own chain
        const NAME_EXPORTED = 0b0001_0000;
    }
}

impl EntryFlags {
    /// Flags only the table may set
    pub const MANAGED: EntryFlags = EntryFlags::HAS_OFFSTREAMS.union(EntryFlags::NAME_EXPORTED);
}

/// A file or directory record
///
/// Entries handed out by the table are snapshots; changes go through the
/// table's mutation methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub(crate) id: u64,
    pub(crate) flags: EntryFlags,
    pub(crate) name: String,
    pub(crate) name_pointer: u64,
    pub(crate) parent: u64,
    pub(crate) content: u64,
    pub(crate) offstreams: Vec<u64>,
    pub(crate) created: Option<DateTime<Utc>>,
    pub(crate) modified: Option<DateTime<Utc>>,
    pub(crate) table_offset: u64,
    pub(crate) table_length: u64,
}

impl Entry {
    pub(crate) fn new(id: u64, name: &str, flags: EntryFlags, parent: u64) -> Self {
        Entry {
            id,
            flags,
            name: name.to_string(),
            name_pointer: 0,
            parent,
            content: 0,
            offstreams: Vec::new(),
            created: None,
            modified: None,
            table_offset: 0,
            table_length: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent entry id, 0 for root entries
    pub fn parent(&self) -> u64 {
        self.parent
    }

    /// Root of the content chain (0 for directories)
    pub fn content_root(&self) -> u64 {
        self.content
    }

    /// Root of the exported name chain (0 if the name is inline)
    pub fn name_root(&self) -> u64 {
        self.name_pointer
    }

    /// Offstream chain roots in attachment order
    pub fn offstream_roots(&self) -> &[u64] {
        &self.offstreams
    }

    pub fn offstream_count(&self) -> usize {
        self.offstreams.len()
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    /// Byte offset of this entry's record in the table stream
    pub fn table_offset(&self) -> u64 {
        self.table_offset
    }

    /// Byte length of this entry's record in the table stream
    pub fn table_length(&self) -> u64 {
        self.table_length
    }

    pub fn is_directory(&self) -> bool {
        self.flags.contains(EntryFlags::DIRECTORY)
    }

    pub fn is_file(&self) -> bool {
        !self.is_directory()
    }

    pub fn is_hidden(&self) -> bool {
        self.flags.contains(EntryFlags::HIDDEN)
    }

    pub fn is_protected(&self) -> bool {
        self.flags.contains(EntryFlags::PROTECTED)
    }

    pub fn is_name_exported(&self) -> bool {
        self.flags.contains(EntryFlags::NAME_EXPORTED)
    }

    /// Serialize this entry as a table record
    pub(crate) fn encode(&self, layout: &Layout) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.name.len() + 8 * layout.width() + 16);
        out.push(self.flags.bits());

        if self.is_name_exported() {
            layout.encode_pointer(self.name_pointer, &mut out);
        } else {
            out.extend_from_slice(self.name.as_bytes());
            out.push(0);
        }

        layout.encode_pointer(self.id, &mut out);

        if self.is_file() {
            layout.encode_pointer(self.content, &mut out);
        }

        if self.flags.contains(EntryFlags::HAS_OFFSTREAMS) {
            for &root in &self.offstreams {
                layout.encode_pointer(root, &mut out);
            }
            layout.encode_pointer(0, &mut out);
        }

        if layout.has_extended_attributes() {
            out.extend_from_slice(&timestamp_millis(self.created).to_be_bytes());
            out.extend_from_slice(&timestamp_millis(self.modified).to_be_bytes());
        }

        layout.encode_pointer(self.parent, &mut out);
        out
    }

    /// Parse one record from the front of `bytes`
    ///
    /// Exported names are left empty; the caller resolves them from the
    /// name chain. Returns the entry and the record length.
    pub(crate) fn decode(bytes: &[u8], layout: &Layout) -> Result<(Entry, usize)> {
        let mut reader = RecordReader {
            bytes,
            position: 0,
            layout,
        };

        let flags_byte = reader.byte()?;
        let flags = EntryFlags::from_bits(flags_byte).ok_or_else(|| {
            CofferError::Corrupt(format!("unknown entry flag bits {:#04x}", flags_byte))
        })?;

        let (name, name_pointer) = if flags.contains(EntryFlags::NAME_EXPORTED) {
            let pointer = reader.pointer()?;
            if pointer == 0 {
                return Err(CofferError::Corrupt("null exported name root".to_string()));
            }
            (String::new(), pointer)
        } else {
            (reader.name()?, 0)
        };

        let id = reader.pointer()?;
        if id == 0 {
            return Err(CofferError::Corrupt("entry with id 0".to_string()));
        }

        let is_directory = flags.contains(EntryFlags::DIRECTORY);
        let content = if is_directory { 0 } else { reader.pointer()? };
        if !is_directory && content == 0 {
            return Err(CofferError::Corrupt(format!(
                "file entry {} has no content root",
                id
            )));
        }

        let mut offstreams = Vec::new();
        if flags.contains(EntryFlags::HAS_OFFSTREAMS) {
            loop {
                let root = reader.pointer()?;
                if root == 0 {
                    break;
                }
                offstreams.push(root);
            }
        }

        let (created, modified) = if layout.has_extended_attributes() {
            (reader.timestamp()?, reader.timestamp()?)
        } else {
            (None, None)
        };

        let parent = reader.pointer()?;

        let entry = Entry {
            id,
            flags,
            name,
            name_pointer,
            parent,
            content,
            offstreams,
            created,
            modified,
            table_offset: 0,
            table_length: reader.position as u64,
        };
        Ok((entry, reader.position))
    }
}

/// Current time at the millisecond resolution records store
pub(crate) fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

fn timestamp_millis(value: Option<DateTime<Utc>>) -> i64 {
    value.map_or(0, |t| t.timestamp_millis())
}

struct RecordReader<'a> {
    bytes: &'a [u8],
    position: usize,
    layout: &'a Layout,
}

impl RecordReader<'_> {
    fn take(&mut self, count: usize) -> Result<&[u8]> {
        let end = self
            .position
            .checked_add(count)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| CofferError::Corrupt("truncated table record".to_string()))?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn pointer(&mut self) -> Result<u64> {
        let width = self.layout.width();
        let layout = self.layout;
        let bytes = self.take(width)?;
        layout.decode_pointer(bytes)
    }

    fn name(&mut self) -> Result<String> {
        let rest = &self.bytes[self.position..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| CofferError::Corrupt("unterminated entry name".to_string()))?;
        let name = std::str::from_utf8(&rest[..len])
            .map_err(|_| CofferError::Corrupt("entry name is not UTF-8".to_string()))?
            .to_string();
        self.position += len + 1;
        Ok(name)
    }

    fn timestamp(&mut self) -> Result<Option<DateTime<Utc>>> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        let millis = i64::from_be_bytes(raw);
        DateTime::from_timestamp_millis(millis)
            .map(Some)
            .ok_or_else(|| CofferError::Corrupt(format!("timestamp {} out of range", millis)))
    }
}
