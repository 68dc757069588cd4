//! Block-chain streams
//!
//! A [`BlockStream`] presents a resizable, seekable byte sequence stored as
//! a singly linked chain of blocks. Each block starts with a header
//! `(used size, next pointer)`; the chain ends at a block whose next
//! pointer is 0.
//!
//! Chain invariant: every block except the last is completely full. The
//! last block may be partially or completely empty. Because of this the
//! block holding logical byte `p` is always `p / capacity`, so the stream
//! keeps an in-memory table of `(pointer, used)` descriptors indexed by
//! chain position and never walks the chain after opening it.
//!
//! The root block of a chain never moves: growth appends, shrinking keeps
//! the root, and splices only unlink blocks after the one being edited.

use crate::allocator::BlockAllocator;
use crate::error::{CofferError, Result};
use crate::manifest::Manifest;
use crate::pointer::Layout;
use std::io;
use std::sync::Arc;
use tracing::{trace, warn};

/// One block of a chain as seen by introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ChainBlock {
    /// Block pointer
    pub pointer: u64,
    /// Payload bytes in use
    pub used: u64,
}

/// Block-sized look-ahead buffer keyed by chain index
struct ReadWindow {
    index: usize,
    data: Vec<u8>,
}

/// Resizable byte stream backed by a chain of blocks
pub struct BlockStream {
    manifest: Arc<Manifest>,
    allocator: Option<Arc<dyn BlockAllocator>>,
    layout: Layout,
    /// Payload bytes per block; unbounded for compact single-block streams
    capacity: u64,
    chain: Vec<ChainBlock>,
    length: u64,
    position: u64,
    read_only: bool,
    destroyed: bool,
    window: Option<ReadWindow>,
}

impl std::fmt::Debug for BlockStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStream")
            .field("root", &self.root())
            .field("length", &self.length)
            .field("position", &self.position)
            .field("blocks", &self.chain.len())
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl BlockStream {
    /// Allocate a root block and return an empty stream on it
    pub fn create(manifest: Arc<Manifest>, allocator: Arc<dyn BlockAllocator>) -> Result<Self> {
        if manifest.layout().is_compact() {
            return Err(CofferError::InvalidOperation(
                "compact containers are read-only".to_string(),
            ));
        }

        let root = allocator.acquire_page()?;
        if let Err(err) = manifest.write_block_header(root, 0, 0) {
            allocator.release(root)?;
            return Err(err);
        }

        trace!(root, "created chain");
        Ok(Self::from_chain(
            manifest,
            Some(allocator),
            vec![ChainBlock {
                pointer: root,
                used: 0,
            }],
        ))
    }

    /// Open the chain rooted at `root`
    ///
    /// Without an allocator the stream is read-only.
    pub fn open(
        manifest: Arc<Manifest>,
        allocator: Option<Arc<dyn BlockAllocator>>,
        root: u64,
    ) -> Result<Self> {
        if root == 0 {
            return Err(CofferError::Corrupt("null stream root".to_string()));
        }

        let layout = *manifest.layout();
        let mut chain = Vec::new();

        if layout.is_compact() {
            let (used, _) = manifest.read_block_header(root)?;
            let end = layout
                .to_absolute(root)
                .saturating_add(layout.block_header_size())
                .saturating_add(used);
            if end > manifest.file_len() {
                return Err(CofferError::Corrupt(format!(
                    "compact block {} runs past end of container",
                    root
                )));
            }
            chain.push(ChainBlock {
                pointer: root,
                used,
            });
        } else {
            let capacity = layout.payload_capacity();
            let limit = manifest.page_count();
            let mut pointer = root;
            loop {
                let (used, next) = manifest.read_block_header(pointer)?;
                if used > capacity {
                    return Err(CofferError::Corrupt(format!(
                        "block {} claims {} used bytes, capacity is {}",
                        pointer, used, capacity
                    )));
                }
                chain.push(ChainBlock { pointer, used });

                if next == 0 {
                    break;
                }
                if used != capacity {
                    return Err(CofferError::Corrupt(format!(
                        "block {} links onward but is not full",
                        pointer
                    )));
                }
                if chain.len() as u64 >= limit {
                    return Err(CofferError::Corrupt(format!(
                        "chain rooted at {} is cyclic",
                        root
                    )));
                }
                pointer = next;
            }
        }

        Ok(Self::from_chain(manifest, allocator, chain))
    }

    fn from_chain(
        manifest: Arc<Manifest>,
        allocator: Option<Arc<dyn BlockAllocator>>,
        chain: Vec<ChainBlock>,
    ) -> Self {
        let layout = *manifest.layout();
        let capacity = if layout.is_compact() {
            u64::MAX
        } else {
            layout.payload_capacity()
        };
        let length = chain.iter().map(|b| b.used).sum();
        let read_only = layout.is_compact() || allocator.is_none();

        BlockStream {
            manifest,
            allocator,
            layout,
            capacity,
            chain,
            length,
            position: 0,
            read_only,
            destroyed: false,
            window: None,
        }
    }

    /// Mark the stream read-only (compact and allocator-less streams stay read-only)
    pub(crate) fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only || self.layout.is_compact() || self.allocator.is_none();
    }

    /// Root block pointer
    pub fn root(&self) -> u64 {
        self.chain.first().map_or(0, |b| b.pointer)
    }

    /// Logical length in bytes
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the chain has been released
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Blocks of the chain in link order
    pub fn chain(&self) -> &[ChainBlock] {
        &self.chain
    }

    /// Move the cursor; positions past the end are allowed
    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    /// Read into `buf` from the cursor, returning the number of bytes read
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_next(buf)
    }

    /// Read up to `count` bytes from the cursor
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let available = self.length.saturating_sub(self.position);
        let count = count.min(usize::try_from(available).unwrap_or(usize::MAX));
        let mut buf = vec![0u8; count];
        let read = self.read_next(&mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Read everything from the cursor to the end
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        self.read_bytes(usize::MAX)
    }

    /// Write `data` at the cursor, growing the stream as needed
    ///
    /// Writing past the end zero-fills the gap.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_next(data)
    }

    /// Truncate or extend the stream; growth is zero-filled
    pub fn set_len(&mut self, new_len: u64) -> Result<()> {
        self.writable_allocator()?;
        match new_len.cmp(&self.length) {
            std::cmp::Ordering::Greater => {
                let old = self.length;
                self.grow(new_len)?;
                self.zero_fill(old, new_len)
            }
            std::cmp::Ordering::Less => self.shrink(new_len),
            std::cmp::Ordering::Equal => Ok(()),
        }
    }

    /// Splice: replace `original_len` bytes at the cursor with `data`
    ///
    /// Bytes outside `[cursor, cursor + original_len)` are preserved and the
    /// stream length changes by `data.len() - original_len`. The cursor ends
    /// up just past the inserted bytes.
    pub fn replace(&mut self, original_len: u64, data: &[u8]) -> Result<()> {
        self.writable_allocator()?;

        let position = self.position;
        if position > self.length || original_len > self.length - position {
            return Err(CofferError::OutOfRange(format!(
                "cannot replace {} bytes at {} in a stream of {} bytes",
                original_len, position, self.length
            )));
        }

        let new_len = data.len() as u64;
        if new_len > original_len {
            self.open_gap(position + original_len, new_len - original_len)?;
        }
        self.write_at(position, data)?;
        if new_len < original_len {
            self.close_gap(position + new_len, original_len - new_len)?;
        }

        self.position = position + new_len;
        Ok(())
    }

    /// Release every block of the chain back to the allocator
    pub fn destroy_all_blocks(mut self) -> Result<()> {
        self.release_blocks()
    }

    /// Release every block and leave the stream empty and unusable
    ///
    /// Used where other holders of the stream must observe the release.
    pub(crate) fn release_blocks(&mut self) -> Result<()> {
        if self.destroyed {
            return Err(destroyed());
        }
        let allocator = self.allocator.clone().ok_or_else(|| {
            CofferError::InvalidOperation("stream has no allocator".to_string())
        })?;

        let pointers: Vec<u64> = self.chain.iter().map(|b| b.pointer).collect();
        trace!(root = self.root(), blocks = pointers.len(), "destroying chain");
        self.chain.clear();
        self.length = 0;
        self.window = None;
        self.destroyed = true;
        allocator.release_all(&pointers)
    }

    fn writable_allocator(&self) -> Result<Arc<dyn BlockAllocator>> {
        if self.destroyed {
            return Err(destroyed());
        }
        if self.read_only {
            return Err(CofferError::InvalidOperation(
                "stream is read-only".to_string(),
            ));
        }
        self.allocator.clone().ok_or_else(|| {
            CofferError::InvalidOperation("stream has no allocator".to_string())
        })
    }

    /// Chain index and in-block offset of logical position `position`
    fn locate(&self, position: u64) -> (usize, u64) {
        let index = position / self.capacity;
        let last = self.chain.len() - 1;
        if index as usize > last {
            (last, position - last as u64 * self.capacity)
        } else {
            (index as usize, position % self.capacity)
        }
    }

    fn payload_offset(&self, pointer: u64, offset: u64) -> u64 {
        self.layout.to_absolute(pointer) + self.layout.block_header_size() + offset
    }

    fn read_next(&mut self, buf: &mut [u8]) -> Result<usize> {
        let read = self.read_at(self.position, buf)?;
        self.position += read as u64;
        Ok(read)
    }

    fn write_next(&mut self, data: &[u8]) -> Result<()> {
        self.writable_allocator()?;
        if data.is_empty() {
            return Ok(());
        }

        let start = self.position;
        let end = start.checked_add(data.len() as u64).ok_or_else(|| {
            CofferError::OutOfRange(format!("write of {} bytes at {}", data.len(), start))
        })?;

        if end > self.length {
            let old = self.length;
            self.grow(end)?;
            if start > old {
                self.zero_fill(old, start)?;
            }
        }
        self.write_at(start, data)?;
        self.position = end;
        Ok(())
    }

    fn read_at(&mut self, mut position: u64, buf: &mut [u8]) -> Result<usize> {
        if position >= self.length {
            return Ok(0);
        }
        let total = (self.length - position).min(buf.len() as u64) as usize;

        let mut done = 0;
        while done < total {
            let (index, offset) = self.locate(position);
            let block = self.chain[index];
            let take = ((block.used - offset) as usize).min(total - done);
            let target = &mut buf[done..done + take];

            if self.layout.is_compact() {
                self.manifest
                    .read_part(self.payload_offset(block.pointer, offset), target)?;
            } else {
                let window = self.window_for(index)?;
                let start = offset as usize;
                target.copy_from_slice(&window[start..start + take]);
            }

            done += take;
            position += take as u64;
        }
        Ok(total)
    }

    fn window_for(&mut self, index: usize) -> Result<&[u8]> {
        let stale = self.window.as_ref().map_or(true, |w| w.index != index);
        if stale {
            let block = self.chain[index];
            let mut data = vec![0u8; block.used as usize];
            self.manifest
                .read_part(self.payload_offset(block.pointer, 0), &mut data)?;
            self.window = Some(ReadWindow { index, data });
        }
        Ok(self.window.as_ref().map_or(&[][..], |w| w.data.as_slice()))
    }

    /// Overwrite bytes that already exist in the stream
    fn write_at(&mut self, mut position: u64, data: &[u8]) -> Result<()> {
        self.window = None;
        let mut done = 0;
        while done < data.len() {
            let (index, offset) = self.locate(position);
            let block = self.chain[index];
            let take = ((block.used - offset) as usize).min(data.len() - done);
            self.manifest.write_part(
                self.payload_offset(block.pointer, offset),
                &data[done..done + take],
            )?;
            done += take;
            position += take as u64;
        }
        Ok(())
    }

    fn read_range(&mut self, start: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.read_at(start, &mut buf)?;
        Ok(buf)
    }

    fn zero_fill(&mut self, start: u64, end: u64) -> Result<()> {
        let chunk = self.capacity.min(64 * 1024) as usize;
        let zeros = vec![0u8; chunk];
        let mut position = start;
        while position < end {
            let take = ((end - position) as usize).min(chunk);
            self.write_at(position, &zeros[..take])?;
            position += take as u64;
        }
        Ok(())
    }

    /// Extend the logical length without touching payload bytes
    ///
    /// The tail block is filled to capacity before any block is linked.
    /// All new blocks are acquired up front so a capacity failure leaves
    /// the chain exactly as it was.
    fn grow(&mut self, new_len: u64) -> Result<()> {
        let allocator = self.writable_allocator()?;
        self.window = None;

        let extra = new_len - self.length;
        let tail = self.chain.len() - 1;
        let room = self.capacity - self.chain[tail].used;

        if extra <= room {
            let used = self.chain[tail].used + extra;
            self.manifest
                .write_block_header(self.chain[tail].pointer, used, 0)?;
            self.chain[tail].used = used;
            self.length = new_len;
            return Ok(());
        }

        let overflow = extra - room;
        let count = overflow.div_ceil(self.capacity);
        let pages = acquire_pages(allocator.as_ref(), count)?;

        let mut remaining = overflow;
        let blocks: Vec<ChainBlock> = pages
            .iter()
            .map(|&pointer| {
                let used = remaining.min(self.capacity);
                remaining -= used;
                ChainBlock { pointer, used }
            })
            .collect();

        // Link back to front: the old tail is rewritten last
        let linked = self.link_blocks(&blocks, 0).and_then(|_| {
            self.manifest
                .write_block_header(self.chain[tail].pointer, self.capacity, pages[0])
        });
        if let Err(err) = linked {
            allocator.release_all(&pages)?;
            return Err(err);
        }

        self.chain[tail].used = self.capacity;
        self.chain.extend(blocks);
        self.length = new_len;
        trace!(root = self.root(), added = count, "grew chain");
        Ok(())
    }

    /// Unlink the empty terminal block a boundary shrink leaves behind
    pub(crate) fn drop_empty_tail(&mut self) -> Result<()> {
        let allocator = self.writable_allocator()?;
        let tail = self.chain.len() - 1;
        if tail == 0 || self.chain[tail].used > 0 {
            return Ok(());
        }

        let pointer = self.chain[tail].pointer;
        self.manifest
            .write_block_header(self.chain[tail - 1].pointer, self.capacity, 0)?;
        self.chain.pop();
        self.window = None;
        trace!(root = self.root(), pointer, "dropped empty tail block");
        allocator.release(pointer)
    }

    /// Write headers for `blocks` linked in order, the last pointing at `next`
    fn link_blocks(&self, blocks: &[ChainBlock], next: u64) -> Result<()> {
        let mut next = next;
        for block in blocks.iter().rev() {
            self.manifest
                .write_block_header(block.pointer, block.used, next)?;
            next = block.pointer;
        }
        Ok(())
    }

    /// Cut the stream down to `new_len`, releasing emptied tail blocks
    ///
    /// A tail block is released only when the deficit exceeds its used
    /// size; a deficit that exactly empties it leaves an empty terminal
    /// block in place.
    fn shrink(&mut self, new_len: u64) -> Result<()> {
        let allocator = self.writable_allocator()?;
        self.window = None;

        let mut deficit = self.length - new_len;
        let mut keep = self.chain.len();
        let mut released = Vec::new();
        while keep > 1 && deficit > self.chain[keep - 1].used {
            deficit -= self.chain[keep - 1].used;
            released.push(self.chain[keep - 1].pointer);
            keep -= 1;
        }

        let tail = keep - 1;
        let used = self.chain[tail].used - deficit;
        self.manifest
            .write_block_header(self.chain[tail].pointer, used, 0)?;
        self.chain[tail].used = used;
        self.chain.truncate(keep);
        self.length = new_len;

        if !released.is_empty() {
            trace!(root = self.root(), released = released.len(), "shrank chain");
            allocator.release_all(&released)?;
        }
        Ok(())
    }

    /// Make room for `size` bytes at `at`; the gap content is unspecified
    fn open_gap(&mut self, at: u64, size: u64) -> Result<()> {
        if at < self.length && size % self.capacity == 0 {
            return self.insert_blocks(at, size / self.capacity);
        }

        let tail = self.read_range(at, self.length - at)?;
        self.grow(self.length + size)?;
        self.write_at(at + size, &tail)
    }

    /// Remove `size` bytes at `at`
    fn close_gap(&mut self, at: u64, size: u64) -> Result<()> {
        if at + size == self.length {
            return self.shrink(at);
        }
        if size % self.capacity == 0 {
            return self.remove_blocks(at, size / self.capacity);
        }

        let tail = self.read_range(at + size, self.length - at - size)?;
        self.write_at(at, &tail)?;
        self.shrink(self.length - size)
    }

    /// Split the block holding `at` and link `count` fresh blocks after it
    ///
    /// The bytes from `at` to the end of the split block move into the last
    /// new block at the same in-block offset, so every block before the old
    /// successor stays full and nothing after the split block is rewritten.
    fn insert_blocks(&mut self, at: u64, count: u64) -> Result<()> {
        let allocator = self.writable_allocator()?;
        self.window = None;

        let (index, offset) = self.locate(at);
        let block = self.chain[index];
        let mut moved = vec![0u8; (block.used - offset) as usize];
        self.manifest
            .read_part(self.payload_offset(block.pointer, offset), &mut moved)?;

        let pages = acquire_pages(allocator.as_ref(), count)?;
        let last = pages.len() - 1;
        let blocks: Vec<ChainBlock> = pages
            .iter()
            .enumerate()
            .map(|(i, &pointer)| ChainBlock {
                pointer,
                used: if i == last { block.used } else { self.capacity },
            })
            .collect();
        let successor = self.chain.get(index + 1).map_or(0, |b| b.pointer);

        let linked = self
            .manifest
            .write_part(self.payload_offset(pages[last], offset), &moved)
            .and_then(|_| self.link_blocks(&blocks, successor))
            .and_then(|_| {
                self.manifest
                    .write_block_header(block.pointer, self.capacity, pages[0])
            });
        if let Err(err) = linked {
            allocator.release_all(&pages)?;
            return Err(err);
        }

        self.chain[index].used = self.capacity;
        self.chain.splice(index + 1..index + 1, blocks);
        self.length += count * self.capacity;
        trace!(root = self.root(), index, count, "spliced blocks into chain");
        Ok(())
    }

    /// Remove `count` whole blocks' worth of bytes starting at `at`
    ///
    /// The block holding `at` absorbs the surviving bytes of the block
    /// `count` positions later; the blocks in between are unlinked.
    fn remove_blocks(&mut self, at: u64, count: u64) -> Result<()> {
        let allocator = self.writable_allocator()?;
        self.window = None;

        let (index, offset) = self.locate(at);
        let survivor_index = index + count as usize;
        let survivor = self.chain[survivor_index];

        let mut moved = vec![0u8; (survivor.used - offset) as usize];
        self.manifest
            .read_part(self.payload_offset(survivor.pointer, offset), &mut moved)?;

        let pointer = self.chain[index].pointer;
        let successor = self
            .chain
            .get(survivor_index + 1)
            .map_or(0, |b| b.pointer);

        self.manifest
            .write_part(self.payload_offset(pointer, offset), &moved)?;
        self.manifest
            .write_block_header(pointer, survivor.used, successor)?;

        let released: Vec<u64> = self.chain[index + 1..=survivor_index]
            .iter()
            .map(|b| b.pointer)
            .collect();
        self.chain[index].used = survivor.used;
        self.chain.drain(index + 1..=survivor_index);
        self.length -= count * self.capacity;

        trace!(root = self.root(), index, count, "unlinked blocks from chain");
        allocator.release_all(&released)
    }
}

fn destroyed() -> CofferError {
    CofferError::InvalidOperation("stream has been destroyed".to_string())
}

/// Acquire `count` blocks, giving them all back if any acquisition fails
fn acquire_pages(allocator: &dyn BlockAllocator, count: u64) -> Result<Vec<u64>> {
    let mut pages = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match allocator.acquire_page() {
            Ok(pointer) => pages.push(pointer),
            Err(err) => {
                if !pages.is_empty() {
                    warn!(
                        acquired = pages.len(),
                        "rolling back partial block acquisition"
                    );
                    allocator.release_all(&pages)?;
                }
                return Err(err);
            }
        }
    }
    Ok(pages)
}

impl io::Read for BlockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_next(buf)?)
    }
}

impl io::Write for BlockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_next(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for BlockStream {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(offset) => Some(offset),
            io::SeekFrom::End(delta) => self.length.checked_add_signed(delta),
            io::SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        self.position = target;
        Ok(target)
    }
}
