//! Persisted free-block list
//!
//! Released blocks are remembered in an ordered set and persisted as a
//! block chain of pointer-width entries in ascending order. The list is
//! self-hosting: its own chain lives in the same container, so growing or
//! shrinking it moves blocks between the set and the chain.
//!
//! The chain draws blocks from a private [`ReservePages`] source instead
//! of from the list itself. Each full rewrite first decides how many
//! blocks the chain must span, stocks the reserve from the set (or hands
//! surplus chain blocks to the set), and only then encodes the list. When
//! the remaining pointers would leave a non-terminal block short, the
//! encoded list is padded with zero bytes up to the block boundary.

use super::BlockAllocator;
use crate::error::{CofferError, Result};
use crate::manifest::Manifest;
use crate::pointer::encode_be;
use crate::stream::{BlockStream, ChainBlock};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Block source for the free list's own chain
#[derive(Debug)]
struct ReservePages {
    manifest: Arc<Manifest>,
    stock: Mutex<Vec<u64>>,
    spill: Mutex<Vec<u64>>,
}

impl ReservePages {
    fn new(manifest: Arc<Manifest>) -> Self {
        ReservePages {
            manifest,
            stock: Mutex::new(Vec::new()),
            spill: Mutex::new(Vec::new()),
        }
    }

    fn restock(&self, pointer: u64) {
        self.stock.lock().push(pointer);
    }

    /// Spilled blocks plus unused stock
    fn take_returned(&self) -> Vec<u64> {
        let mut returned = std::mem::take(&mut *self.spill.lock());
        returned.append(&mut self.stock.lock());
        returned
    }
}

impl BlockAllocator for ReservePages {
    fn acquire_page(&self) -> Result<u64> {
        if let Some(pointer) = self.stock.lock().pop() {
            return Ok(pointer);
        }
        self.manifest.allocate_page()
    }

    fn release(&self, pointer: u64) -> Result<()> {
        self.spill.lock().push(pointer);
        Ok(())
    }

    fn release_all(&self, pointers: &[u64]) -> Result<()> {
        self.spill.lock().extend_from_slice(pointers);
        Ok(())
    }
}

/// Pending single-entry change to the persisted list
enum Edit {
    Insert { index: u64, pointer: u64 },
    Remove { index: u64 },
}

struct FreeListState {
    free: BTreeSet<u64>,
    stream: BlockStream,
}

/// Container-wide free-block allocator
pub struct FreeList {
    manifest: Arc<Manifest>,
    reserve: Arc<ReservePages>,
    state: Mutex<FreeListState>,
}

impl std::fmt::Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FreeList")
            .field("root", &state.stream.root())
            .field("free", &state.free.len())
            .finish()
    }
}

impl FreeList {
    /// Create an empty free list in a fresh container
    pub fn create(manifest: Arc<Manifest>) -> Result<Self> {
        let reserve = Arc::new(ReservePages::new(manifest.clone()));
        let stream = BlockStream::create(manifest.clone(), reserve.clone())?;
        debug!(root = stream.root(), "created free list");

        Ok(FreeList {
            manifest,
            reserve,
            state: Mutex::new(FreeListState {
                free: BTreeSet::new(),
                stream,
            }),
        })
    }

    /// Load the free list rooted at `root`
    pub fn open(manifest: Arc<Manifest>, root: u64) -> Result<Self> {
        let reserve = Arc::new(ReservePages::new(manifest.clone()));
        let mut stream = BlockStream::open(manifest.clone(), Some(reserve.clone()), root)?;
        let bytes = stream.read_to_end()?;

        let layout = *manifest.layout();
        let mut free = BTreeSet::new();
        let mut chunks = bytes.chunks(layout.width());
        for chunk in chunks.by_ref() {
            if chunk.iter().all(|&b| b == 0) {
                break;
            }
            if chunk.len() < layout.width() {
                return Err(CofferError::Corrupt(
                    "truncated pointer in free list".to_string(),
                ));
            }
            free.insert(layout.decode_pointer(chunk)?);
        }
        if chunks.flatten().any(|&b| b != 0) {
            return Err(CofferError::Corrupt(
                "pointer after padding in free list".to_string(),
            ));
        }

        debug!(root, free = free.len(), "opened free list");
        Ok(FreeList {
            manifest,
            reserve,
            state: Mutex::new(FreeListState { free, stream }),
        })
    }

    /// Root block of the list's own chain
    pub fn root(&self) -> u64 {
        self.state.lock().stream.root()
    }

    /// Blocks of the list's own chain
    pub fn chain(&self) -> Vec<ChainBlock> {
        self.state.lock().stream.chain().to_vec()
    }

    /// Free block pointers in ascending order
    pub fn free_pointers(&self) -> Vec<u64> {
        self.state.lock().free.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().free.is_empty()
    }

    /// Take the lowest free block, if any
    pub fn acquire(&self) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        let Some(pointer) = state.free.pop_first() else {
            return Ok(None);
        };

        if let Err(err) = self.store(&mut state, Some(Edit::Remove { index: 0 })) {
            state.free.insert(pointer);
            return Err(err);
        }
        Ok(Some(pointer))
    }

    /// Shrink the store by dropping free blocks at its physical end
    ///
    /// Returns the number of blocks removed.
    pub fn optimize(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let mut total = 0;

        loop {
            let mut run = Vec::new();
            let mut cursor = self.manifest.last_page();
            while let Some(pointer) = cursor {
                if !state.free.remove(&pointer) {
                    break;
                }
                run.push(pointer);
                cursor = self.manifest.previous_page(pointer);
            }

            if run.is_empty() {
                break;
            }

            if let Err(err) = self.manifest.truncate_pages(run.len() as u64) {
                state.free.extend(run);
                return Err(err);
            }
            total += run.len() as u64;
            self.store(&mut state, None)?;
        }

        info!(
            blocks = total,
            file_len = self.manifest.file_len(),
            "optimized container"
        );
        Ok(total)
    }

    fn check_releasable(&self, pointer: u64) -> Result<()> {
        let layout = self.manifest.layout();
        let offset = layout.to_absolute(pointer);
        let header = layout.header_size();
        let in_range = pointer != 0
            && offset >= header
            && (offset - header) % layout.block_size == 0
            && offset.saturating_add(layout.block_size) <= self.manifest.file_len();
        if !in_range {
            return Err(CofferError::OutOfRange(format!(
                "pointer {} does not name a block of this container",
                pointer
            )));
        }
        Ok(())
    }

    /// Number of blocks the list's own chain should span
    ///
    /// `total` counts every block the list accounts for: free blocks plus
    /// the blocks of its chain. With `n` chain blocks the list holds
    /// `total - n` pointers, so the smallest `n` with
    /// `(total - n) * w <= n * capacity` is the answer.
    fn chain_blocks(&self, total: u64) -> u64 {
        let layout = self.manifest.layout();
        let w = layout.width() as u64;
        let capacity = layout.payload_capacity();
        (total * w).div_ceil(capacity + w).max(1)
    }

    /// Whether `len` bytes fill exactly `blocks` blocks under the chain
    /// invariant, with no empty terminal block
    fn spans_exactly(&self, len: u64, blocks: u64) -> bool {
        let capacity = self.manifest.layout().payload_capacity();
        len <= blocks * capacity && (blocks == 1 || len > (blocks - 1) * capacity)
    }

    /// Persist the in-memory set
    ///
    /// A single-entry edit is spliced in place when the list carries no
    /// padding and the chain keeps its block count; anything else rewrites
    /// the whole list.
    fn store(&self, state: &mut FreeListState, edit: Option<Edit>) -> Result<()> {
        let layout = *self.manifest.layout();
        let w = layout.width() as u64;
        let capacity = layout.payload_capacity();
        let count = state.free.len() as u64;

        if let Some(edit) = edit {
            let before = match edit {
                Edit::Insert { .. } => count - 1,
                Edit::Remove { .. } => count + 1,
            };
            let blocks = state.stream.chain().len() as u64;
            let splice = w < capacity
                && state.stream.len() == before * w
                && self.spans_exactly(count * w, blocks);
            if splice {
                match edit {
                    Edit::Insert { index, pointer } => {
                        state.stream.seek(index * w);
                        state
                            .stream
                            .replace(0, &encode_be(pointer, layout.pointer_width))?;
                    }
                    Edit::Remove { index } => {
                        state.stream.seek(index * w);
                        state.stream.replace(w, &[])?;
                    }
                }
                return Ok(());
            }
        }

        if let Err(err) = self.rewrite(state) {
            state.free.extend(self.reserve.take_returned());
            return Err(err);
        }
        Ok(())
    }

    /// Rewrite the whole list, resizing its chain to [`Self::chain_blocks`]
    ///
    /// Blocks the chain gains come out of the free set through the reserve;
    /// blocks it loses go into the set before it is encoded. When fewer
    /// pointers remain than the chain needs to stay valid, the tail is
    /// padded with zero bytes, which never decode as a pointer.
    fn rewrite(&self, state: &mut FreeListState) -> Result<()> {
        let layout = *self.manifest.layout();
        let capacity = layout.payload_capacity();
        let current = state.stream.chain().len() as u64;
        let blocks = self.chain_blocks(state.free.len() as u64 + current);

        if blocks > current {
            for _ in current..blocks {
                if let Some(pointer) = state.free.pop_first() {
                    self.reserve.restock(pointer);
                }
            }
        } else {
            let dropped: Vec<u64> = state.stream.chain()[blocks as usize..]
                .iter()
                .map(|b| b.pointer)
                .collect();
            state.free.extend(dropped);
        }

        let mut bytes = Vec::with_capacity(state.free.len() * layout.width());
        for &pointer in &state.free {
            layout.encode_pointer(pointer, &mut bytes);
        }
        if blocks > 1 {
            let floor = ((blocks - 1) * capacity + 1) as usize;
            if bytes.len() < floor {
                bytes.resize(floor, 0);
            }
        }

        state.stream.seek(0);
        state.stream.write(&bytes)?;
        state.stream.set_len(bytes.len() as u64)?;
        state.stream.drop_empty_tail()?;

        // Dropped tail blocks are already in the set; anything else here
        // is stock the chain did not consume
        let mut leftover = false;
        for pointer in self.reserve.take_returned() {
            leftover |= state.free.insert(pointer);
        }
        if leftover {
            return Err(CofferError::Corrupt(format!(
                "free list chain did not settle at {} blocks",
                blocks
            )));
        }

        debug!(
            blocks,
            free = state.free.len(),
            padded = bytes.len() > state.free.len() * layout.width(),
            "rewrote free list"
        );
        Ok(())
    }
}

impl BlockAllocator for FreeList {
    fn acquire_page(&self) -> Result<u64> {
        match self.acquire()? {
            Some(pointer) => Ok(pointer),
            None => self.manifest.allocate_page(),
        }
    }

    fn release(&self, pointer: u64) -> Result<()> {
        self.check_releasable(pointer)?;
        let mut state = self.state.lock();
        if !state.free.insert(pointer) {
            return Ok(());
        }

        let index = state.free.range(..pointer).count() as u64;
        if let Err(err) = self.store(&mut state, Some(Edit::Insert { index, pointer })) {
            state.free.remove(&pointer);
            return Err(err);
        }
        Ok(())
    }

    fn release_all(&self, pointers: &[u64]) -> Result<()> {
        for &pointer in pointers {
            self.check_releasable(pointer)?;
        }

        let mut state = self.state.lock();
        let mut added = false;
        for &pointer in pointers {
            added |= state.free.insert(pointer);
        }
        if added {
            self.store(&mut state, None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfig;
    use crate::io::MemoryStorage;

    /// 2-byte pointers, 12-byte blocks: 8 payload bytes, 4 pointers per block
    fn setup() -> (MemoryStorage, Arc<Manifest>, FreeList) {
        setup_with(2, 12)
    }

    fn setup_with(pointer_width: u8, block_size: u64) -> (MemoryStorage, Arc<Manifest>, FreeList) {
        let storage = MemoryStorage::new();
        let config = ContainerConfig {
            pointer_width,
            block_size,
            ..Default::default()
        };
        let manifest = Arc::new(Manifest::create(storage.clone(), &config).unwrap());
        let free_list = FreeList::create(manifest.clone()).unwrap();
        (storage, manifest, free_list)
    }

    /// Every page is free, part of the list's chain or one of `outside`
    /// pages held elsewhere; never free and in the chain at once
    fn assert_accounted(manifest: &Manifest, free_list: &FreeList, outside: usize) {
        let chain: Vec<u64> = free_list.chain().iter().map(|b| b.pointer).collect();
        let free = free_list.free_pointers();
        for pointer in &chain {
            assert!(!free.contains(pointer), "{} is free and in the list chain", pointer);
        }
        assert_eq!(free.len() + chain.len() + outside, manifest.page_count() as usize);
    }

    fn grow(manifest: &Manifest, count: usize) -> Vec<u64> {
        (0..count).map(|_| manifest.allocate_page().unwrap()).collect()
    }

    fn reopen(manifest: &Arc<Manifest>, free_list: &FreeList) -> FreeList {
        FreeList::open(manifest.clone(), free_list.root()).unwrap()
    }

    #[test]
    fn test_new_list_is_empty() {
        let (_, manifest, free_list) = setup();
        assert!(free_list.is_empty());
        assert_eq!(free_list.root(), 1);
        assert_eq!(manifest.page_count(), 1);
    }

    #[test]
    fn test_release_and_acquire_lowest_first() {
        let (_, manifest, free_list) = setup();
        let pages = grow(&manifest, 3);

        free_list.release(pages[2]).unwrap();
        free_list.release(pages[0]).unwrap();
        assert_eq!(free_list.free_pointers(), vec![pages[0], pages[2]]);

        assert_eq!(free_list.acquire().unwrap(), Some(pages[0]));
        assert_eq!(free_list.acquire().unwrap(), Some(pages[2]));
        assert_eq!(free_list.acquire().unwrap(), None);
    }

    #[test]
    fn test_double_release_is_noop() {
        let (_, manifest, free_list) = setup();
        let pages = grow(&manifest, 1);
        free_list.release(pages[0]).unwrap();
        free_list.release(pages[0]).unwrap();
        assert_eq!(free_list.len(), 1);
    }

    #[test]
    fn test_release_rejects_foreign_pointers() {
        let (_, manifest, free_list) = setup();
        grow(&manifest, 2);
        assert!(matches!(
            free_list.release(0),
            Err(CofferError::OutOfRange(_))
        ));
        assert!(matches!(
            free_list.release(99),
            Err(CofferError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_acquire_page_falls_back_to_growth() {
        let (_, manifest, free_list) = setup();
        let before = manifest.page_count();
        let pointer = free_list.acquire_page().unwrap();
        assert_eq!(manifest.page_count(), before + 1);
        assert_eq!(manifest.last_page(), Some(pointer));
    }

    #[test]
    fn test_persisted_list_survives_reopen() {
        let (_, manifest, free_list) = setup();
        let pages = grow(&manifest, 10);
        for &pointer in pages.iter().step_by(2) {
            free_list.release(pointer).unwrap();
        }

        let reopened = reopen(&manifest, &free_list);
        assert_eq!(reopened.free_pointers(), free_list.free_pointers());
    }

    #[test]
    fn test_list_spans_multiple_blocks() {
        let (_, manifest, free_list) = setup();
        let pages = grow(&manifest, 20);
        free_list.release_all(&pages).unwrap();

        // Stocking moved some free blocks into the list's own chain
        let chain: Vec<u64> = free_list.chain().iter().map(|b| b.pointer).collect();
        assert!(chain.len() > 1);
        let free = free_list.free_pointers();
        for pointer in &chain {
            assert!(!free.contains(pointer));
        }

        // Nothing was lost: every page is either free or holds the list
        assert_eq!(free.len() + chain.len(), pages.len() + 1);
        let reopened = reopen(&manifest, &free_list);
        assert_eq!(reopened.free_pointers(), free);
    }

    #[test]
    fn test_list_shrink_returns_own_blocks() {
        let (_, manifest, free_list) = setup();
        let pages = grow(&manifest, 20);
        free_list.release_all(&pages).unwrap();
        let total = manifest.page_count() as usize;

        while free_list.acquire().unwrap().is_some() {}

        // Only the root block of the list remains in use by the list
        assert_eq!(free_list.chain().len(), 1);
        assert!(free_list.is_empty());
        assert_eq!(manifest.page_count() as usize, total);
    }

    #[test]
    fn test_optimize_truncates_trailing_run() {
        let (storage, manifest, free_list) = setup();
        let pages = grow(&manifest, 6);
        free_list.release(pages[1]).unwrap();
        free_list.release(pages[4]).unwrap();
        free_list.release(pages[5]).unwrap();

        assert_eq!(free_list.optimize().unwrap(), 2);
        assert_eq!(manifest.page_count(), 5);
        assert_eq!(free_list.free_pointers(), vec![pages[1]]);
        assert_eq!(storage.size(), manifest.file_len());
    }

    #[test]
    fn test_optimize_without_trailing_free_blocks() {
        let (_, manifest, free_list) = setup();
        let pages = grow(&manifest, 3);
        free_list.release(pages[0]).unwrap();
        assert_eq!(free_list.optimize().unwrap(), 0);
        assert_eq!(manifest.page_count(), 4);
    }

    #[test]
    fn test_optimize_everything_free() {
        let (_, manifest, free_list) = setup();
        let pages = grow(&manifest, 12);
        free_list.release_all(&pages).unwrap();

        let removed = free_list.optimize().unwrap();
        assert!(removed > 0);
        assert!(free_list.is_empty());
        // Only the blocks holding the list itself survive
        assert_eq!(manifest.page_count() as usize, free_list.chain().len());
    }

    #[test]
    fn test_capacity_not_a_multiple_of_pointer_width() {
        // Payload capacities of 5, 4, 3, 58 and 1 byte
        for (width, block_size) in [(2u8, 9u64), (3, 10), (4, 11), (3, 64), (8, 17)] {
            let (_, manifest, free_list) = setup_with(width, block_size);
            let pages = grow(&manifest, 40);

            for (released, &pointer) in pages.iter().enumerate() {
                free_list.release(pointer).unwrap();
                assert_accounted(&manifest, &free_list, pages.len() - released - 1);
            }
            let reopened = reopen(&manifest, &free_list);
            assert_eq!(reopened.free_pointers(), free_list.free_pointers());

            let mut taken = 0;
            while free_list.acquire().unwrap().is_some() {
                taken += 1;
                assert_accounted(&manifest, &free_list, taken);
            }
            assert!(free_list.is_empty());
            assert_eq!(manifest.page_count(), 41);
        }
    }

    #[test]
    fn test_padded_list_survives_reopen() {
        // 5 payload bytes: three 2-byte pointers need a second block, and
        // once it is taken from the set only two pointers remain
        let (_, manifest, free_list) = setup_with(2, 9);
        let pages = grow(&manifest, 3);
        free_list.release_all(&pages).unwrap();

        assert_eq!(free_list.chain().len(), 2);
        assert_eq!(free_list.len(), 2);
        assert_accounted(&manifest, &free_list, 0);

        let reopened = reopen(&manifest, &free_list);
        assert_eq!(reopened.free_pointers(), free_list.free_pointers());
    }

    #[test]
    fn test_batch_release_with_uneven_capacity() {
        let (_, manifest, free_list) = setup_with(3, 64);
        let pages = grow(&manifest, 100);
        free_list.release_all(&pages[..50]).unwrap();
        free_list.release_all(&pages[50..]).unwrap();
        assert_accounted(&manifest, &free_list, 0);

        let removed = free_list.optimize().unwrap();
        assert_eq!(manifest.page_count(), 101 - removed);
        assert!(free_list.is_empty());
        assert_accounted(&manifest, &free_list, 0);
    }
}
