//! Pointer encoding and address arithmetic
//!
//! Every pointer-sized field in a coffer (block pointers, used-sizes, the
//! block size, entry ids) is a big-endian unsigned integer of the
//! container's configured pointer width (1-8 bytes). Pointer `0` is the
//! null sentinel and never names a real block.
//!
//! With block addressing enabled, a pointer is a 1-based block index
//! relative to the end of the fixed header; otherwise it is an absolute
//! byte offset into the backing store.

use crate::error::{CofferError, Result};
use crate::header::{ContainerFlags, FIXED_PREFIX_SIZE};

/// Smallest supported pointer width in bytes
pub const MIN_POINTER_WIDTH: u8 = 1;

/// Largest supported pointer width in bytes
pub const MAX_POINTER_WIDTH: u8 = 8;

/// Largest value a pointer of `width` bytes can hold
pub fn max_addressable_value(width: u8) -> u64 {
    match width {
        0 => 0,
        w if w >= MAX_POINTER_WIDTH => u64::MAX,
        w => (1u64 << (u32::from(w) * 8)) - 1,
    }
}

/// Immutable geometry of a container, derived from its manifest
///
/// Everything that needs pointer arithmetic (manifest, streams, table
/// records) works from a copy of this struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Pointer width in bytes (1-8)
    pub pointer_width: u8,

    /// Physical block size in bytes (0 in compact mode)
    pub block_size: u64,

    /// Addressing/compact/single-file/extended flags
    pub flags: ContainerFlags,
}

impl Layout {
    pub fn new(pointer_width: u8, block_size: u64, flags: ContainerFlags) -> Result<Self> {
        if !(MIN_POINTER_WIDTH..=MAX_POINTER_WIDTH).contains(&pointer_width) {
            return Err(CofferError::InvalidConfig(format!(
                "pointer width must be between {} and {} bytes, got {}",
                MIN_POINTER_WIDTH, MAX_POINTER_WIDTH, pointer_width
            )));
        }

        Ok(Layout {
            pointer_width,
            block_size,
            flags,
        })
    }

    pub fn is_compact(&self) -> bool {
        self.flags.contains(ContainerFlags::COMPACT)
    }

    pub fn is_block_addressed(&self) -> bool {
        self.flags.contains(ContainerFlags::BLOCK_ADDRESSING)
    }

    pub fn is_single_file(&self) -> bool {
        self.flags.contains(ContainerFlags::SINGLE_FILE)
    }

    pub fn has_extended_attributes(&self) -> bool {
        self.flags.contains(ContainerFlags::EXTENDED_ATTRIBUTES)
    }

    /// Width of one pointer field in bytes
    pub fn width(&self) -> usize {
        usize::from(self.pointer_width)
    }

    /// Size of the fixed manifest header
    pub fn header_size(&self) -> u64 {
        let w = u64::from(self.pointer_width);
        let roots = if self.is_compact() { 1 } else { 2 };
        FIXED_PREFIX_SIZE as u64 + w + roots * w
    }

    /// Size of a block header (used-size, plus next pointer unless compact)
    pub fn block_header_size(&self) -> u64 {
        let w = u64::from(self.pointer_width);
        if self.is_compact() {
            w
        } else {
            2 * w
        }
    }

    /// Payload bytes available in one block
    pub fn payload_capacity(&self) -> u64 {
        self.block_size.saturating_sub(self.block_header_size())
    }

    pub fn max_pointer(&self) -> u64 {
        max_addressable_value(self.pointer_width)
    }

    /// Convert a block pointer to an absolute byte offset
    pub fn to_absolute(&self, pointer: u64) -> u64 {
        if pointer == 0 || !self.is_block_addressed() {
            return pointer;
        }
        // Saturates so corrupt pointers land past the end instead of wrapping
        self.header_size()
            .saturating_add((pointer - 1).saturating_mul(self.block_size))
    }

    /// Convert an absolute byte offset to a block pointer
    ///
    /// Offsets inside the header map to the null pointer.
    pub fn to_block_pointer(&self, offset: u64) -> u64 {
        if !self.is_block_addressed() {
            return offset;
        }
        let header = self.header_size();
        if offset < header || self.block_size == 0 {
            return 0;
        }
        (offset - header) / self.block_size + 1
    }

    /// Append `value` as a pointer-width big-endian field
    pub fn encode_pointer(&self, value: u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&encode_be(value, self.pointer_width));
    }

    /// Read a pointer-width big-endian field from the front of `bytes`
    pub fn decode_pointer(&self, bytes: &[u8]) -> Result<u64> {
        decode_be(bytes, self.pointer_width)
    }

    /// Fail with a capacity error if `value` does not fit the pointer width
    pub fn check_fits(&self, value: u64, what: &str) -> Result<()> {
        if value > self.max_pointer() {
            return Err(CofferError::CapacityExceeded(format!(
                "{} {} does not fit in a {}-byte pointer",
                what, value, self.pointer_width
            )));
        }
        Ok(())
    }
}

/// Encode the low `width` bytes of `value`, big-endian
pub(crate) fn encode_be(value: u64, width: u8) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    bytes[8 - usize::from(width)..].to_vec()
}

/// Decode a `width`-byte big-endian integer from the front of `bytes`
pub(crate) fn decode_be(bytes: &[u8], width: u8) -> Result<u64> {
    let width = usize::from(width);
    if bytes.len() < width {
        return Err(CofferError::Corrupt(format!(
            "expected {} pointer bytes, found {}",
            width,
            bytes.len()
        )));
    }
    Ok(bytes[..width]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}
