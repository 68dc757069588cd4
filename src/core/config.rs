//! Container creation settings
//!
//! A `ContainerConfig` is consumed once, when a new container is laid out.
//! After that the geometry lives in the manifest header and cannot change.

use crate::error::{CofferError, Result};
use crate::header::ContainerFlags;
use crate::pointer::{max_addressable_value, Layout};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POINTER_WIDTH: u8 = 4;
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// How block pointers are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Addressing {
    /// Pointers are absolute byte offsets
    Absolute,
    /// Pointers are 1-based block indices after the header
    Block,
}

/// Settings for laying out a new container
///
/// # Examples
///
/// ```
/// use coffer_rs::ContainerConfig;
///
/// let config = ContainerConfig::from_toml_str(r#"
///     pointer_width = 2
///     block_size = 256
///     extended_attributes = true
/// "#).unwrap();
///
/// assert_eq!(config.pointer_width, 2);
/// assert!(config.layout().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Pointer width in bytes (1-8)
    pub pointer_width: u8,

    /// Block size in bytes, header included
    pub block_size: u64,

    /// Pointer interpretation
    pub addressing: Addressing,

    /// Flat namespace without directories
    pub single_file: bool,

    /// Store created/modified timestamps on entries
    pub extended_attributes: bool,

    /// Compact images are produced by export only; creating one is rejected
    pub compact: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            pointer_width: DEFAULT_POINTER_WIDTH,
            block_size: DEFAULT_BLOCK_SIZE,
            addressing: Addressing::Block,
            single_file: false,
            extended_attributes: false,
            compact: false,
        }
    }
}

impl ContainerConfig {
    /// Parse a configuration from TOML; missing keys take defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ContainerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Container flags implied by this configuration
    pub fn flags(&self) -> ContainerFlags {
        let mut flags = ContainerFlags::empty();
        flags.set(
            ContainerFlags::BLOCK_ADDRESSING,
            self.addressing == Addressing::Block,
        );
        flags.set(ContainerFlags::COMPACT, self.compact);
        flags.set(ContainerFlags::SINGLE_FILE, self.single_file);
        flags.set(
            ContainerFlags::EXTENDED_ATTRIBUTES,
            self.extended_attributes,
        );
        flags
    }

    /// Check that a container can be built from scratch with these settings
    pub fn validate(&self) -> Result<()> {
        self.layout().map(|_| ())
    }

    /// Validated geometry for a new container
    pub fn layout(&self) -> Result<Layout> {
        if self.compact {
            return Err(CofferError::InvalidConfig(
                "compact containers are read-only and cannot be created directly".to_string(),
            ));
        }

        let layout = Layout::new(self.pointer_width, self.block_size, self.flags())?;

        if self.block_size <= layout.block_header_size() {
            return Err(CofferError::InvalidConfig(format!(
                "block size {} cannot hold a {}-byte block header and payload",
                self.block_size,
                layout.block_header_size()
            )));
        }

        if self.block_size > max_addressable_value(self.pointer_width) {
            return Err(CofferError::InvalidConfig(format!(
                "block size {} does not fit in a {}-byte pointer",
                self.block_size, self.pointer_width
            )));
        }

        if !layout.is_block_addressed() && layout.header_size() > layout.max_pointer() {
            return Err(CofferError::InvalidConfig(format!(
                "{}-byte pointers cannot address the first block",
                self.pointer_width
            )));
        }

        Ok(layout)
    }
}
