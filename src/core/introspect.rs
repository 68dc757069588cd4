//! Read-only introspection over a container's blocks
//!
//! Diagnostic tools walk the container through these types instead of
//! reaching into stream internals.

use crate::error::Result;
use crate::stream::ChainBlock;
use serde::Serialize;

/// What a live chain belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum ChainOwner {
    /// The metadata table
    Table,
    /// The free-block list itself
    FreeList,
    /// Content of entry `id`
    Content { id: u64 },
    /// Offstream `index` of entry `id`
    Offstream { id: u64, index: usize },
    /// Exported name of entry `id`
    Name { id: u64 },
}

/// One live chain and its blocks in link order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainInfo {
    pub owner: ChainOwner,
    pub blocks: Vec<ChainBlock>,
}

impl ChainInfo {
    /// Logical length of the chain in bytes
    pub fn len(&self) -> u64 {
        self.blocks.iter().map(|b| b.used).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Container-wide statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    pub pointer_width: u8,
    pub block_size: u64,
    pub compact: bool,
    pub file_len: u64,
    pub page_count: u64,
    pub live_blocks: u64,
    pub free_blocks: u64,
    pub entries: usize,
    pub table_len: u64,
}

impl ContainerStats {
    /// Pretty-printed JSON report
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// JSON dump of chains for diagnostic tooling
pub fn chains_to_json(chains: &[ChainInfo]) -> Result<String> {
    Ok(serde_json::to_string_pretty(chains)?)
}

/// Classification of every block in a non-compact container
///
/// In a consistent container every block is either live or free, never
/// both, and nothing is leaked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockAudit {
    pub live: Vec<u64>,
    pub free: Vec<u64>,
    /// Blocks neither live nor free
    pub leaked: Vec<u64>,
    /// Blocks claimed more than once (by two chains, or a chain and the free list)
    pub double_booked: Vec<u64>,
}

impl BlockAudit {
    pub fn is_consistent(&self) -> bool {
        self.leaked.is_empty() && self.double_booked.is_empty()
    }
}
