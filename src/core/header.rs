use crate::error::{CofferError, Result};
use crate::pointer::{decode_be, Layout};
use bitflags::bitflags;

pub const MAGIC: [u8; 8] = *b"COFR\x00\x01\x00\x00";
pub const FORMAT_VERSION: u8 = 1;

/// Magic + version + flags: the part of the header readable without
/// knowing the pointer width
pub const FIXED_PREFIX_SIZE: usize = 10;

/// Low three bits of the flags byte select the pointer width (value + 1)
const WIDTH_SELECTOR_MASK: u8 = 0b0000_0111;

/// Bit 3 has no meaning in version 1 and must stay clear
const RESERVED_BIT: u8 = 0b0000_1000;

bitflags! {
    /// Container-wide configuration bits stored in the header flags byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContainerFlags: u8 {
        /// Pointers are 1-based block indices instead of byte offsets
        const BLOCK_ADDRESSING = 0b0001_0000;
        /// Read-only image, one variable-sized block per stream
        const COMPACT = 0b0010_0000;
        /// Flat entry namespace, no directories
        const SINGLE_FILE = 0b0100_0000;
        /// Entries carry created/modified timestamps
        const EXTENDED_ATTRIBUTES = 0b1000_0000;
    }
}

/// Coffer manifest header (offset 0)
///
/// ```text
/// magic[8] | version u8 | flags u8 | block_size (w) | table_root (w) | free_list_root (w, omitted when compact)
/// ```
///
/// `w` is the pointer width selected by the low bits of the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Magic number: "COFR\x00\x01\x00\x00"
    pub magic: [u8; 8],

    /// Format version
    pub version: u8,

    /// Geometry decoded from the flags byte and block size
    pub layout: Layout,

    /// Root block of the metadata table chain
    pub table_root: u64,

    /// Root block of the free-space list chain (0 in compact mode)
    pub free_list_root: u64,
}

impl Header {
    /// Create a header for the given layout with null roots
    pub fn new(layout: Layout) -> Self {
        Header {
            magic: MAGIC,
            version: FORMAT_VERSION,
            layout,
            table_root: 0,
            free_list_root: 0,
        }
    }

    /// Encode the flags byte (width selector plus container flags)
    pub fn flags_byte(&self) -> u8 {
        (self.layout.pointer_width - 1) | self.layout.flags.bits()
    }

    /// Validate magic and version
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(CofferError::InvalidMagic);
        }

        if self.version != FORMAT_VERSION {
            return Err(CofferError::UnsupportedVersion(self.version));
        }

        let layout = &self.layout;
        if layout.is_compact() {
            if layout.is_block_addressed() {
                return Err(CofferError::Corrupt(
                    "compact containers cannot use block addressing".to_string(),
                ));
            }
        } else if layout.block_size <= layout.block_header_size() {
            return Err(CofferError::Corrupt(format!(
                "block size {} cannot hold a {}-byte block header",
                layout.block_size,
                layout.block_header_size()
            )));
        }

        Ok(())
    }

    /// Total encoded size of a header whose fixed prefix is `prefix`
    ///
    /// Used by readers that fetch the prefix first to learn the pointer width.
    pub fn encoded_len(prefix: &[u8]) -> Result<usize> {
        let layout = Self::layout_from_prefix(prefix, 0)?;
        Ok(layout.header_size() as usize)
    }

    fn layout_from_prefix(prefix: &[u8], block_size: u64) -> Result<Layout> {
        if prefix.len() < FIXED_PREFIX_SIZE {
            return Err(CofferError::Corrupt(
                "insufficient bytes for header".to_string(),
            ));
        }

        if prefix[..8] != MAGIC {
            return Err(CofferError::InvalidMagic);
        }

        if prefix[8] != FORMAT_VERSION {
            return Err(CofferError::UnsupportedVersion(prefix[8]));
        }

        let flags_byte = prefix[9];
        if flags_byte & RESERVED_BIT != 0 {
            return Err(CofferError::Corrupt(format!(
                "reserved header flag bit set: {:#04x}",
                flags_byte
            )));
        }

        let width = (flags_byte & WIDTH_SELECTOR_MASK) + 1;
        let flags = ContainerFlags::from_bits_truncate(flags_byte);
        Layout::new(width, block_size, flags)
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let layout = &self.layout;
        let mut bytes = Vec::with_capacity(layout.header_size() as usize);

        bytes.extend_from_slice(&self.magic);
        bytes.push(self.version);
        bytes.push(self.flags_byte());
        layout.encode_pointer(layout.block_size, &mut bytes);
        layout.encode_pointer(self.table_root, &mut bytes);
        if !layout.is_compact() {
            layout.encode_pointer(self.free_list_root, &mut bytes);
        }

        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let partial = Self::layout_from_prefix(bytes, 0)?;
        let needed = partial.header_size() as usize;
        if bytes.len() < needed {
            return Err(CofferError::Corrupt(format!(
                "header needs {} bytes, found {}",
                needed,
                bytes.len()
            )));
        }

        let width = partial.pointer_width;
        let w = partial.width();
        let mut offset = FIXED_PREFIX_SIZE;

        let block_size = decode_be(&bytes[offset..], width)?;
        offset += w;

        let table_root = decode_be(&bytes[offset..], width)?;
        offset += w;

        let free_list_root = if partial.is_compact() {
            0
        } else {
            decode_be(&bytes[offset..], width)?
        };

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[..8]);

        let header = Header {
            magic,
            version: bytes[8],
            layout: Layout::new(width, block_size, partial.flags)?,
            table_root,
            free_list_root,
        };

        header.validate()?;

        Ok(header)
    }
}
