//! # Coffer - single-file multi-stream container
//!
//! `coffer-rs` stores a hierarchy of files, each with a content stream and
//! any number of named side streams ("offstreams"), inside one host file.
//! Space is managed in fixed-size blocks linked into chains; released
//! blocks are recycled through a free list that is itself stored in the
//! container.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use coffer_rs::{Coffer, ContainerConfig, Result};
//!
//! # fn main() -> Result<()> {
//! let mut coffer = Coffer::create("data.coffer", &ContainerConfig::default())?;
//!
//! coffer.write("documents/report.txt", b"Hello, World!")?;
//! let content = coffer.read("documents/report.txt")?;
//! let names = coffer.list("documents")?;
//!
//! coffer.flush()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom geometry
//!
//! ```rust
//! use coffer_rs::{CofferBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let mut coffer = CofferBuilder::new()
//!     .pointer_width(2)
//!     .block_size(256)
//!     .extended_attributes(true)
//!     .build()?;
//!
//! coffer.write("a.txt", &[7u8; 1000])?;
//! assert_eq!(coffer.read("a.txt")?.len(), 1000);
//! # Ok(())
//! # }
//! ```
//!
//! The lower-level [`Container`] exposes entries, streams, offstreams and
//! introspection directly, and can be shared between threads.

pub mod core;

#[allow(unused_imports)]
pub(crate) use self::core::{
    allocator, catalog, compact, config, container, error, handle, header, introspect, io,
    manifest, pointer, stream, validation,
};

pub use crate::core::{
    allocator::{freelist::FreeList, BlockAllocator},
    catalog::{Entry, EntryFlags, MetadataTable, Offstream},
    config::{Addressing, ContainerConfig},
    container::Container,
    error::{CofferError, Result},
    handle::StreamHandle,
    header::{ContainerFlags, Header},
    introspect::{chains_to_json, BlockAudit, ChainInfo, ChainOwner, ContainerStats},
    io::{MemoryStorage, Storage},
    manifest::Manifest,
    pointer::Layout,
    stream::{BlockStream, ChainBlock},
};

use crate::validation::split_path;
use std::path::Path;
use tracing::{debug, info};

/// High-level, path-oriented coffer API
///
/// A thin wrapper around [`Container`] that addresses entries by path and
/// creates missing parent directories on write.
///
/// # Examples
///
/// ```rust
/// use coffer_rs::{Coffer, ContainerConfig, Result};
///
/// # fn main() -> Result<()> {
/// let mut coffer = Coffer::in_memory(&ContainerConfig::default())?;
/// coffer.write("notes/todo.txt", b"write docs")?;
/// assert!(coffer.exists("notes/todo.txt")?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Coffer {
    inner: Container,
}

impl Coffer {
    /// Create a new coffer file at `path`, replacing any existing file
    ///
    /// Missing parent directories of `path` are created.
    pub fn create<P: AsRef<Path>>(path: P, config: &ContainerConfig) -> Result<Self> {
        let path = path.as_ref();
        info!("Creating coffer at {:?}", path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = io::create_file(path)?;
        let inner = Container::create(file, config)?;
        Ok(Coffer { inner })
    }

    /// Open an existing coffer file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening coffer at {:?}", path);
        let file = io::open_file(path)?;
        let inner = Container::open(file)?;
        Ok(Coffer { inner })
    }

    /// Create a coffer backed by memory
    pub fn in_memory(config: &ContainerConfig) -> Result<Self> {
        let inner = Container::create(MemoryStorage::new(), config)?;
        Ok(Coffer { inner })
    }

    /// Wrap an already opened container
    pub fn from_container(inner: Container) -> Self {
        Coffer { inner }
    }

    fn lookup(&self, path: &str) -> Result<Option<Entry>> {
        match self.inner.get_entry_by_path(path) {
            Ok(entry) => Ok(Some(entry)),
            Err(CofferError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Write `content` to the file at `path`
    ///
    /// Creates the file (and, in hierarchical coffers, its parent
    /// directories) if needed; otherwise replaces its content.
    pub fn write<P: AsRef<str>>(&mut self, path: P, content: &[u8]) -> Result<()> {
        let path = path.as_ref();
        debug!("Writing {} bytes to {}", content.len(), path);

        let entry = match self.lookup(path)? {
            Some(entry) => entry,
            None => {
                let (parent, name) = self.prepare_parent(path)?;
                self.inner.create_entry(name, EntryFlags::empty(), parent)?
            }
        };

        let mut stream = self.inner.content(entry.id())?;
        stream.seek(0);
        stream.write(content)?;
        stream.set_len(content.len() as u64)?;

        if self.inner.layout().has_extended_attributes() {
            self.inner.touch(entry.id())?;
        }
        Ok(())
    }

    /// Parent id and leaf name for a new file at `path`
    fn prepare_parent<'a>(&mut self, path: &'a str) -> Result<(u64, &'a str)> {
        if self.inner.layout().is_single_file() {
            return Ok((0, path));
        }

        let mut segments = split_path(path);
        let name = segments
            .pop()
            .ok_or_else(|| CofferError::InvalidName(format!("'{}' names no file", path)))?;
        let parent = self.ensure_directories(&segments)?;
        Ok((parent, name))
    }

    fn ensure_directories(&mut self, segments: &[&str]) -> Result<u64> {
        let mut parent = 0;
        for segment in segments {
            let existing = self
                .inner
                .children(parent)?
                .into_iter()
                .find(|entry| entry.name() == *segment);

            parent = match existing {
                Some(entry) if entry.is_directory() => entry.id(),
                Some(entry) => {
                    return Err(CofferError::InvalidOperation(format!(
                        "'{}' is a file",
                        entry.name()
                    )))
                }
                None => {
                    self.inner
                        .create_entry(segment, EntryFlags::DIRECTORY, parent)?
                        .id()
                }
            };
        }
        Ok(parent)
    }

    /// Read the full content of the file at `path`
    pub fn read<P: AsRef<str>>(&self, path: P) -> Result<Vec<u8>> {
        let path = path.as_ref();
        debug!("Reading {}", path);
        let entry = self.inner.get_entry_by_path(path)?;
        self.inner.content(entry.id())?.read_to_end()
    }

    /// Delete the entry at `path`, including everything below a directory
    pub fn delete<P: AsRef<str>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        debug!("Deleting {}", path);
        let entry = self.inner.get_entry_by_path(path)?;
        self.inner.delete_entry(entry.id())
    }

    /// Create a directory and any missing ancestors, returning its id
    pub fn create_dir_all<P: AsRef<str>>(&mut self, path: P) -> Result<u64> {
        let path = path.as_ref();
        if self.inner.layout().is_single_file() {
            return Err(CofferError::InvalidOperation(
                "single-file coffers have no directories".to_string(),
            ));
        }
        let segments = split_path(path);
        self.ensure_directories(&segments)
    }

    /// Names of the entries directly under `path` ("" or "/" for the roots)
    pub fn list<P: AsRef<str>>(&self, path: P) -> Result<Vec<String>> {
        let path = path.as_ref();
        debug!("Listing {}", path);

        let entries = if split_path(path).is_empty() {
            self.inner.root_entries()
        } else {
            let dir = self.inner.get_entry_by_path(path)?;
            if !dir.is_directory() {
                return Err(CofferError::InvalidOperation(format!(
                    "'{}' is not a directory",
                    path
                )));
            }
            self.inner.children(dir.id())?
        };

        Ok(entries.into_iter().map(|e| e.name().to_string()).collect())
    }

    /// Whether an entry exists at `path`
    pub fn exists<P: AsRef<str>>(&self, path: P) -> Result<bool> {
        Ok(self.lookup(path.as_ref())?.is_some())
    }

    /// Entry record for `path`
    pub fn entry<P: AsRef<str>>(&self, path: P) -> Result<Entry> {
        self.inner.get_entry_by_path(path.as_ref())
    }

    /// Truncate trailing free blocks, returning how many were removed
    pub fn optimize(&mut self) -> Result<u64> {
        self.inner.optimize()
    }

    pub fn stats(&self) -> ContainerStats {
        self.inner.stats()
    }

    /// Underlying container
    pub fn container(&self) -> &Container {
        &self.inner
    }

    pub fn into_inner(self) -> Container {
        self.inner
    }

    /// Flush pending writes to the backing store
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}

/// Builder for coffers with custom geometry
///
/// # Examples
///
/// ```rust,no_run
/// use coffer_rs::{Addressing, CofferBuilder};
///
/// # fn main() -> coffer_rs::Result<()> {
/// let coffer = CofferBuilder::new()
///     .path("/data/archive.coffer")
///     .pointer_width(3)
///     .block_size(1024)
///     .addressing(Addressing::Absolute)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CofferBuilder {
    path: Option<String>,
    config: ContainerConfig,
}

impl CofferBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back the coffer with a file (memory when unset)
    pub fn path<S: Into<String>>(mut self, path: S) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Start from a complete configuration, e.g. one parsed from TOML
    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pointer_width(mut self, width: u8) -> Self {
        self.config.pointer_width = width;
        self
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.config.block_size = block_size;
        self
    }

    pub fn addressing(mut self, addressing: Addressing) -> Self {
        self.config.addressing = addressing;
        self
    }

    /// Flat namespace without directories
    pub fn single_file(mut self, enabled: bool) -> Self {
        self.config.single_file = enabled;
        self
    }

    /// Store created/modified timestamps
    pub fn extended_attributes(mut self, enabled: bool) -> Self {
        self.config.extended_attributes = enabled;
        self
    }

    pub fn build(self) -> Result<Coffer> {
        self.config.validate()?;
        match self.path {
            Some(path) => Coffer::create(path, &self.config),
            None => Coffer::in_memory(&self.config),
        }
    }
}
