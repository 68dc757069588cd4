//! Block allocation for coffer containers
//!
//! Streams never talk to the physical store to get space; they ask a
//! [`BlockAllocator`]. The container-wide allocator is the persisted
//! [`freelist::FreeList`], which recycles released blocks before growing
//! the store.

pub mod freelist;

use crate::error::Result;

/// Block allocator trait
///
/// Defines how block chains obtain and give back whole blocks.
pub trait BlockAllocator: Send + Sync {
    /// Obtain one block, reusing a released block when possible
    fn acquire_page(&self) -> Result<u64>;

    /// Return a block to the allocator
    fn release(&self, pointer: u64) -> Result<()>;

    /// Return several blocks at once
    fn release_all(&self, pointers: &[u64]) -> Result<()> {
        for &pointer in pointers {
            self.release(pointer)?;
        }
        Ok(())
    }
}
