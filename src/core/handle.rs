//! Shared handles onto entry streams
//!
//! A [`BlockStream`] caches its chain layout and length in memory, so two
//! independent streams over the same root would each believe their own
//! cached view. Content and offstream chains are therefore opened once per
//! root and shared: every [`StreamHandle`] on a root locks the same
//! stream and keeps only its own cursor.

use crate::error::Result;
use crate::stream::{BlockStream, ChainBlock};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::io;
use std::sync::{Arc, Weak};

/// Cursor onto a block chain shared with every other handle on its root
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Mutex<BlockStream>>,
    position: u64,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream", &*self.shared.lock())
            .field("position", &self.position)
            .finish()
    }
}

impl StreamHandle {
    fn new(shared: Arc<Mutex<BlockStream>>) -> Self {
        StreamHandle {
            shared,
            position: 0,
        }
    }

    /// Run `op` on the shared stream positioned at this handle's cursor
    fn with<T>(&mut self, op: impl FnOnce(&mut BlockStream) -> Result<T>) -> Result<T> {
        let mut stream = self.shared.lock();
        stream.seek(self.position);
        let result = op(&mut stream);
        self.position = stream.position();
        result
    }

    /// Root block pointer (0 once the chain has been destroyed)
    pub fn root(&self) -> u64 {
        self.shared.lock().root()
    }

    pub fn len(&self) -> u64 {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.lock().is_read_only()
    }

    /// Whether the chain behind this handle has been released
    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().is_destroyed()
    }

    /// Blocks of the chain in link order
    pub fn chain(&self) -> Vec<ChainBlock> {
        self.shared.lock().chain().to_vec()
    }

    /// Move this handle's cursor; other handles are unaffected
    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.with(|stream| stream.read(buf))
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        self.with(|stream| stream.read_bytes(count))
    }

    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        self.with(BlockStream::read_to_end)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.with(|stream| stream.write(data))
    }

    pub fn set_len(&mut self, new_len: u64) -> Result<()> {
        self.with(|stream| stream.set_len(new_len))
    }

    /// Splice at the cursor; see [`BlockStream::replace`]
    pub fn replace(&mut self, original_len: u64, data: &[u8]) -> Result<()> {
        self.with(|stream| stream.replace(original_len, data))
    }
}

impl io::Read for StreamHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(StreamHandle::read(self, buf)?)
    }
}

impl io::Write for StreamHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        StreamHandle::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for StreamHandle {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(offset) => Some(offset),
            io::SeekFrom::End(delta) => self.len().checked_add_signed(delta),
            io::SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        self.position = target;
        Ok(target)
    }
}

/// Streams currently open through at least one handle, keyed by root
#[derive(Default)]
pub(crate) struct StreamRegistry {
    open: Mutex<AHashMap<u64, Weak<Mutex<BlockStream>>>>,
}

impl StreamRegistry {
    fn live(&self, root: u64) -> Option<Arc<Mutex<BlockStream>>> {
        self.open.lock().get(&root).and_then(Weak::upgrade)
    }

    /// Handle on the chain at `root`, opening it with `open` only if no
    /// handle on it is alive
    pub(crate) fn handle(
        &self,
        root: u64,
        open: impl FnOnce() -> Result<BlockStream>,
    ) -> Result<StreamHandle> {
        let mut streams = self.open.lock();
        if let Some(shared) = streams.get(&root).and_then(Weak::upgrade) {
            return Ok(StreamHandle::new(shared));
        }

        let shared = Arc::new(Mutex::new(open()?));
        streams.retain(|_, stream| stream.strong_count() > 0);
        streams.insert(root, Arc::downgrade(&shared));
        Ok(StreamHandle::new(shared))
    }

    /// Register a freshly created stream and hand out the first handle
    pub(crate) fn adopt(&self, stream: BlockStream) -> StreamHandle {
        let root = stream.root();
        let shared = Arc::new(Mutex::new(stream));
        self.open.lock().insert(root, Arc::downgrade(&shared));
        StreamHandle::new(shared)
    }

    /// Apply an entry's protection to its open stream, if any
    pub(crate) fn set_read_only(&self, root: u64, read_only: bool) {
        if let Some(shared) = self.live(root) {
            shared.lock().set_read_only(read_only);
        }
    }

    /// Release the chain at `root`
    ///
    /// An open stream is destroyed in place so every handle on it sees the
    /// chain gone; otherwise the chain is opened with `open` and destroyed.
    pub(crate) fn destroy(
        &self,
        root: u64,
        open: impl FnOnce() -> Result<BlockStream>,
    ) -> Result<()> {
        let shared = self.open.lock().remove(&root).and_then(|s| s.upgrade());
        match shared {
            Some(shared) => {
                let mut stream = shared.lock();
                stream.release_blocks()
            }
            None => open()?.destroy_all_blocks(),
        }
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self.open.lock();
        let live = open.values().filter(|s| s.strong_count() > 0).count();
        f.debug_struct("StreamRegistry").field("open", &live).finish()
    }
}

