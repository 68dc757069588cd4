//! Corruption detection at open time
//!
//! Damaged headers and broken chains must be reported as format errors,
//! never as panics or silently wrong data.

use coffer_rs::{CofferError, Container, ContainerConfig, EntryFlags, MemoryStorage};

fn populated() -> Vec<u8> {
    let storage = MemoryStorage::new();
    let config = ContainerConfig {
        pointer_width: 2,
        block_size: 32,
        ..Default::default()
    };
    let container = Container::create(storage.clone(), &config).unwrap();
    let entry = container.create_entry("f", EntryFlags::empty(), 0).unwrap();
    container.content(entry.id()).unwrap().write(&[5u8; 100]).unwrap();
    drop(container);
    storage.to_vec()
}

fn open(bytes: Vec<u8>) -> coffer_rs::Result<Container> {
    Container::open(MemoryStorage::from_bytes(bytes))
}

#[test]
fn test_intact_image_opens() {
    let container = open(populated()).unwrap();
    assert_eq!(container.entries().len(), 1);
}

#[test]
fn test_bad_magic() {
    let mut bytes = populated();
    bytes[0] = b'X';
    assert!(matches!(open(bytes), Err(CofferError::InvalidMagic)));
}

#[test]
fn test_unsupported_version() {
    let mut bytes = populated();
    bytes[8] = 2;
    assert!(matches!(open(bytes), Err(CofferError::UnsupportedVersion(2))));
}

#[test]
fn test_reserved_flag_bit() {
    let mut bytes = populated();
    bytes[9] |= 0b0000_1000;
    assert!(matches!(open(bytes), Err(CofferError::Corrupt(_))));
}

#[test]
fn test_truncated_header() {
    let bytes = populated();
    for len in [0, 5, 9, 12] {
        let result = open(bytes[..len].to_vec());
        assert!(matches!(result, Err(CofferError::Corrupt(_))), "length {}", len);
    }
}

#[test]
fn test_partial_block() {
    let mut bytes = populated();
    bytes.truncate(bytes.len() - 3);
    assert!(matches!(open(bytes), Err(CofferError::Corrupt(_))));
}

#[test]
fn test_null_table_root() {
    let mut bytes = populated();
    // flags byte is followed by block size (2) then table root (2)
    bytes[12] = 0;
    bytes[13] = 0;
    assert!(matches!(open(bytes), Err(CofferError::Corrupt(_))));
}

#[test]
fn test_oversized_used_field() {
    let mut bytes = populated();
    // Table root is block 2; header is 16 bytes, blocks are 32
    let table_block = 16 + 32;
    bytes[table_block] = 0xFF;
    bytes[table_block + 1] = 0xFF;
    assert!(matches!(open(bytes), Err(CofferError::Corrupt(_))));
}

#[test]
fn test_cyclic_chain() {
    let mut bytes = populated();
    // Content of "f" starts at block 3 and spans four blocks; point its
    // second block back at the first
    let first = 16 + 2 * 32;
    let second_pointer = u16::from_be_bytes([bytes[first + 2], bytes[first + 3]]) as usize;
    let second = 16 + (second_pointer - 1) * 32;
    bytes[second + 2] = 0;
    bytes[second + 3] = 3;

    let container = open(bytes).unwrap();
    let entry = container.get_entry_by_path("f").unwrap();
    assert!(matches!(
        container.content(entry.id()),
        Err(CofferError::Corrupt(_))
    ));
}
