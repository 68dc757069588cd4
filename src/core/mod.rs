//! Coffer storage engine
//!
//! The engine is layered bottom-up:
//!
//! - [`pointer`] - pointer width, addressing mode and the pointer codec
//! - [`header`] / [`manifest`] - the fixed header and the physical channel
//! - [`allocator`] - block allocation, backed by the self-hosted free list
//! - [`stream`] - block-chain streams with splice support
//! - [`handle`] - shared, per-cursor handles onto entry streams
//! - [`catalog`] - the metadata table, entries and offstreams
//! - [`container`] - the thread-safe facade tying it all together
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header: magic | version | flags | block size │
//! │         table root | free-list root          │
//! ├──────────────────────────────────────────────┤
//! │ Block 1   [used | next | payload ...]        │
//! │ Block 2   [used | next | payload ...]        │
//! │ ...                                          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Every stream (table, free list, file content, offstreams, long names)
//! is a chain of blocks. All blocks but the last in a chain are full.

pub mod allocator;
pub mod catalog;
pub(crate) mod compact;
pub mod config;
pub mod container;
pub mod error;
pub mod handle;
pub mod header;
pub mod introspect;
pub mod io;
pub mod manifest;
pub mod pointer;
pub mod stream;
pub mod validation;

pub use container::Container;
pub use error::{CofferError, Result};
