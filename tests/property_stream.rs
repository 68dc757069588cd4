//! Property-based tests for block-chain streams
//!
//! Every stream operation is mirrored on a plain `Vec<u8>` and the chain
//! layout is checked after each step. Geometries cover every pointer
//! width with tiny payloads, most of which are not a whole number of
//! pointers, so short byte strings already cross many block boundaries.

use coffer_rs::{
    Addressing, BlockStream, ContainerConfig, FreeList, Manifest, MemoryStorage,
};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

/// 2-byte pointers, 20-byte blocks: 16 payload bytes per block
const BLOCK_SIZE: u64 = 20;
const CAPACITY: u64 = 16;

/// Pointer width and payload capacity
///
/// One-byte pointers get larger blocks so a long stream still fits in 255
/// block pointers.
fn geometry(min_width: u8) -> impl Strategy<Value = (u8, u64)> {
    (min_width..=8u8).prop_flat_map(|width| {
        let min = if width == 1 { 32 } else { u64::from(width) + 1 };
        (Just(width), min..min + 24)
    })
}

#[derive(Debug, Clone)]
enum Op {
    Write { at: u16, data: Vec<u8> },
    Replace { at: u16, len: u16, data: Vec<u8> },
    SetLen(u16),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u16>(), prop::collection::vec(any::<u8>(), 0..70))
            .prop_map(|(at, data)| Op::Write { at, data }),
        (
            any::<u16>(),
            any::<u16>(),
            prop::collection::vec(any::<u8>(), 0..70)
        )
            .prop_map(|(at, len, data)| Op::Replace { at, len, data }),
        (0u16..300).prop_map(Op::SetLen),
    ]
}

fn setup(addressing: Addressing) -> (Arc<Manifest>, Arc<FreeList>) {
    setup_with(addressing, 2, BLOCK_SIZE)
}

fn setup_with(
    addressing: Addressing,
    pointer_width: u8,
    block_size: u64,
) -> (Arc<Manifest>, Arc<FreeList>) {
    let config = ContainerConfig {
        pointer_width,
        block_size,
        addressing,
        ..Default::default()
    };
    let manifest = Arc::new(Manifest::create(MemoryStorage::new(), &config).unwrap());
    let free_list = Arc::new(FreeList::create(manifest.clone()).unwrap());
    (manifest, free_list)
}

/// Apply `op` to both the stream and the model
fn apply(stream: &mut BlockStream, model: &mut Vec<u8>, op: &Op) {
    match op {
        Op::Write { at, data } => {
            let position = *at as usize % (model.len() + 40);
            stream.seek(position as u64);
            stream.write(data).unwrap();
            if data.is_empty() {
                return;
            }

            let end = position + data.len();
            if model.len() < end {
                model.resize(end, 0);
            }
            model[position..end].copy_from_slice(data);
        }
        Op::Replace { at, len, data } => {
            let position = *at as usize % (model.len() + 1);
            let original = *len as usize % (model.len() - position + 1);
            stream.seek(position as u64);
            stream.replace(original as u64, data).unwrap();
            model.splice(position..position + original, data.iter().copied());
        }
        Op::SetLen(len) => {
            stream.set_len(*len as u64).unwrap();
            model.resize(*len as usize, 0);
        }
    }
}

fn assert_chain_shape(stream: &BlockStream, capacity: u64) {
    let chain = stream.chain();
    assert!(!chain.is_empty());
    for block in &chain[..chain.len() - 1] {
        assert_eq!(block.used, capacity, "non-terminal block {} not full", block.pointer);
    }
    assert!(chain[chain.len() - 1].used <= capacity);
    assert_eq!(chain.iter().map(|b| b.used).sum::<u64>(), stream.len());
}

fn assert_conserved(manifest: &Manifest, free_list: &FreeList, stream: &BlockStream) {
    let mut claimed = BTreeSet::new();
    let free_chain = free_list.chain();
    let live = stream
        .chain()
        .iter()
        .chain(free_chain.iter())
        .map(|b| b.pointer);
    for pointer in live.chain(free_list.free_pointers()) {
        assert!(claimed.insert(pointer), "block {} claimed twice", pointer);
    }
    let pages: BTreeSet<u64> = manifest.page_pointers().into_iter().collect();
    assert_eq!(claimed, pages);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_stream_matches_model(
        (width, capacity) in geometry(1),
        ops in prop::collection::vec(op(), 1..40),
    ) {
        let block_size = 2 * u64::from(width) + capacity;
        let (manifest, free_list) = setup_with(Addressing::Block, width, block_size);
        let mut stream = BlockStream::create(manifest.clone(), free_list.clone()).unwrap();
        let root = stream.root();
        let mut model = Vec::new();

        for op in &ops {
            apply(&mut stream, &mut model, op);

            prop_assert_eq!(stream.len(), model.len() as u64);
            prop_assert_eq!(stream.root(), root);
            assert_chain_shape(&stream, capacity);
            assert_conserved(&manifest, &free_list, &stream);

            stream.seek(0);
            prop_assert_eq!(stream.read_to_end().unwrap(), model.clone());
        }

        let mut reopened = BlockStream::open(manifest, None, root).unwrap();
        prop_assert_eq!(reopened.chain(), stream.chain());
        prop_assert_eq!(reopened.read_to_end().unwrap(), model);
    }

    #[test]
    fn prop_splice_preserves_outside_bytes(
        (width, capacity) in geometry(2),
        initial in prop::collection::vec(any::<u8>(), 0..120),
        at in any::<u16>(),
        len in any::<u16>(),
        data in prop::collection::vec(any::<u8>(), 0..120),
    ) {
        let block_size = 2 * u64::from(width) + capacity;
        let (manifest, free_list) = setup_with(Addressing::Absolute, width, block_size);
        let mut stream = BlockStream::create(manifest, free_list).unwrap();
        stream.write(&initial).unwrap();

        let position = at as usize % (initial.len() + 1);
        let original = len as usize % (initial.len() - position + 1);
        stream.seek(position as u64);
        stream.replace(original as u64, &data).unwrap();

        prop_assert_eq!(stream.position(), (position + data.len()) as u64);
        prop_assert_eq!(
            stream.len(),
            (initial.len() - original + data.len()) as u64
        );

        stream.seek(0);
        let bytes = stream.read_to_end().unwrap();
        prop_assert_eq!(&bytes[..position], &initial[..position]);
        prop_assert_eq!(&bytes[position..position + data.len()], &data[..]);
        prop_assert_eq!(
            &bytes[position + data.len()..],
            &initial[position + original..]
        );
        assert_chain_shape(&stream, capacity);
    }

    #[test]
    fn prop_out_of_range_splice_is_rejected(
        initial in prop::collection::vec(any::<u8>(), 0..60),
        overshoot in 1u64..20,
    ) {
        let (manifest, free_list) = setup(Addressing::Block);
        let mut stream = BlockStream::create(manifest, free_list).unwrap();
        stream.write(&initial).unwrap();
        let chain = stream.chain().to_vec();

        stream.seek(0);
        let result = stream.replace(initial.len() as u64 + overshoot, b"x");
        prop_assert!(result.is_err());
        prop_assert_eq!(stream.chain(), &chain[..]);
    }
}

#[test]
fn test_boundary_lengths() {
    let (manifest, free_list) = setup(Addressing::Block);
    let mut stream = BlockStream::create(manifest, free_list).unwrap();

    for len in [CAPACITY, CAPACITY - 1, CAPACITY + 1, 2 * CAPACITY, 0] {
        stream.set_len(len).unwrap();
        assert_chain_shape(&stream, CAPACITY);
        let blocks = stream.chain().len() as u64;
        assert_eq!(blocks, len.div_ceil(CAPACITY).max(1));
    }
}

#[test]
fn test_shrink_to_block_boundary_keeps_empty_terminal() {
    let (manifest, free_list) = setup(Addressing::Block);
    let mut stream = BlockStream::create(manifest, free_list).unwrap();

    stream.set_len(2 * CAPACITY).unwrap();
    stream.set_len(CAPACITY).unwrap();
    assert_chain_shape(&stream, CAPACITY);
    let used: Vec<u64> = stream.chain().iter().map(|b| b.used).collect();
    assert_eq!(used, vec![CAPACITY, 0]);

    // Growth refills the empty terminal before linking anything new
    stream.set_len(CAPACITY + 3).unwrap();
    let used: Vec<u64> = stream.chain().iter().map(|b| b.used).collect();
    assert_eq!(used, vec![CAPACITY, 3]);
}

#[test]
fn test_release_with_uneven_capacity() {
    // 5 payload bytes hold two and a half 2-byte pointers
    let (manifest, free_list) = setup_with(Addressing::Block, 2, 9);
    let mut stream = BlockStream::create(manifest.clone(), free_list.clone()).unwrap();

    stream.write(&[7u8; 20]).unwrap();
    stream.set_len(0).unwrap();
    assert_chain_shape(&stream, 5);
    assert_conserved(&manifest, &free_list, &stream);

    stream.write(&[8u8; 60]).unwrap();
    assert_conserved(&manifest, &free_list, &stream);
    stream.seek(0);
    assert_eq!(stream.read_to_end().unwrap(), vec![8u8; 60]);
}
