//! Named side-channel streams attached to entries
//!
//! An offstream is an ordinary block chain whose first
//! [`OFFSTREAM_NAME_LEN`] bytes hold the zero-padded name. Positions and
//! lengths exposed here exclude that prefix.

use crate::error::{CofferError, Result};
use crate::handle::StreamHandle;
use crate::stream::ChainBlock;
use crate::validation::{validate_offstream_name, OFFSTREAM_NAME_LEN};

const PREFIX: u64 = OFFSTREAM_NAME_LEN as u64;

/// Byte stream attached to an entry under a short name
#[derive(Debug)]
pub struct Offstream {
    name: String,
    stream: StreamHandle,
}

impl Offstream {
    /// Write the name field into an empty chain
    pub(crate) fn initialize(mut stream: StreamHandle, name: &str) -> Result<Self> {
        validate_offstream_name(name)?;
        let mut field = [0u8; OFFSTREAM_NAME_LEN];
        field[..name.len()].copy_from_slice(name.as_bytes());

        stream.seek(0);
        stream.write(&field)?;
        stream.seek(PREFIX);

        Ok(Offstream {
            name: name.to_string(),
            stream,
        })
    }

    /// Wrap an existing offstream chain, reading its name field
    pub(crate) fn load(mut stream: StreamHandle) -> Result<Self> {
        if stream.len() < PREFIX {
            return Err(CofferError::Corrupt(format!(
                "offstream at {} is shorter than its name field",
                stream.root()
            )));
        }

        stream.seek(0);
        let field = stream.read_bytes(OFFSTREAM_NAME_LEN)?;
        stream.seek(PREFIX);
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let name = std::str::from_utf8(&field[..end])
            .map_err(|_| CofferError::Corrupt("offstream name is not UTF-8".to_string()))?
            .to_string();

        Ok(Offstream { name, stream })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> u64 {
        self.stream.root()
    }

    pub fn len(&self) -> u64 {
        self.stream.len().saturating_sub(PREFIX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> u64 {
        self.stream.position().saturating_sub(PREFIX)
    }

    pub fn is_read_only(&self) -> bool {
        self.stream.is_read_only()
    }

    pub fn chain(&self) -> Vec<ChainBlock> {
        self.stream.chain()
    }

    pub fn seek(&mut self, position: u64) {
        self.stream.seek(position.saturating_add(PREFIX));
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        self.stream.read_bytes(count)
    }

    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        self.stream.read_to_end()
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write(data)
    }

    pub fn set_len(&mut self, len: u64) -> Result<()> {
        let len = len.checked_add(PREFIX).ok_or_else(|| {
            CofferError::OutOfRange(format!("offstream length {} too large", len))
        })?;
        self.stream.set_len(len)
    }

    /// Splice at the current position; see [`StreamHandle::replace`]
    pub fn replace(&mut self, original_len: u64, data: &[u8]) -> Result<()> {
        self.stream.replace(original_len, data)
    }

    /// Underlying chain, name field included
    pub fn stream(&self) -> &StreamHandle {
        &self.stream
    }
}
