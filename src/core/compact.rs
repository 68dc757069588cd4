//! Compact (read-only) container images
//!
//! A compact image stores every stream as one variable-sized block,
//! `used (w) | payload`, addressed by absolute byte offset. There is no
//! free list and no next pointers, so the image is laid out once in a
//! single pass and can only be read afterwards.

use crate::catalog::{Entry, MetadataTable};
use crate::error::Result;
use crate::header::{ContainerFlags, Header};
use crate::io::Storage;
use crate::manifest::Manifest;
use crate::pointer::Layout;
use crate::stream::BlockStream;
use std::sync::Arc;
use tracing::debug;

/// Geometry of the compact image derived from a source container
pub(crate) fn compact_layout(source: &Layout) -> Result<Layout> {
    let mut flags = ContainerFlags::COMPACT;
    flags.set(ContainerFlags::SINGLE_FILE, source.is_single_file());
    flags.set(
        ContainerFlags::EXTENDED_ATTRIBUTES,
        source.has_extended_attributes(),
    );
    Layout::new(source.pointer_width, 0, flags)
}

/// In-memory image under construction
struct ImageBuilder {
    layout: Layout,
    bytes: Vec<u8>,
}

impl ImageBuilder {
    fn new(layout: Layout) -> Self {
        // Header is filled in last, once the table root is known
        let bytes = vec![0u8; layout.header_size() as usize];
        ImageBuilder { layout, bytes }
    }

    /// Append one block and return its pointer
    fn push_block(&mut self, payload: &[u8]) -> Result<u64> {
        let pointer = self.bytes.len() as u64;
        self.layout.check_fits(pointer, "compact block pointer")?;
        self.layout
            .check_fits(payload.len() as u64, "compact block size")?;

        self.layout
            .encode_pointer(payload.len() as u64, &mut self.bytes);
        self.bytes.extend_from_slice(payload);
        Ok(pointer)
    }

    fn finish(mut self, table_root: u64) -> Vec<u8> {
        let mut header = Header::new(self.layout);
        header.table_root = table_root;
        let encoded = header.to_bytes();
        self.bytes[..encoded.len()].copy_from_slice(&encoded);
        self.bytes
    }
}

fn chain_bytes(manifest: &Arc<Manifest>, root: u64) -> Result<Vec<u8>> {
    BlockStream::open(manifest.clone(), None, root)?.read_to_end()
}

/// Copy every stream of `entry` into the image and remap its pointers
fn copy_entry(
    manifest: &Arc<Manifest>,
    builder: &mut ImageBuilder,
    entry: &Entry,
) -> Result<Entry> {
    let mut copy = entry.clone();

    if entry.content != 0 {
        copy.content = builder.push_block(&chain_bytes(manifest, entry.content)?)?;
    }

    copy.offstreams = entry
        .offstreams
        .iter()
        .map(|&root| builder.push_block(&chain_bytes(manifest, root)?))
        .collect::<Result<_>>()?;

    if entry.is_name_exported() {
        copy.name_pointer = builder.push_block(entry.name.as_bytes())?;
    }

    Ok(copy)
}

/// Write a compact image of `table` into `target`, returning its size
pub(crate) fn write_image<S: Storage>(
    manifest: &Arc<Manifest>,
    table: &MetadataTable,
    mut target: S,
) -> Result<u64> {
    let layout = compact_layout(manifest.layout())?;
    let mut builder = ImageBuilder::new(layout);

    let mut records = Vec::new();
    for entry in table.entries() {
        let copy = copy_entry(manifest, &mut builder, &entry)?;
        records.extend(copy.encode(&layout));
    }
    let table_root = builder.push_block(&records)?;

    let image = builder.finish(table_root);
    target.set_len(0)?;
    target.write_at(0, &image)?;
    target.sync()?;

    debug!(
        entries = table.len(),
        bytes = image.len(),
        table_root,
        "wrote compact image"
    );
    Ok(image.len() as u64)
}
