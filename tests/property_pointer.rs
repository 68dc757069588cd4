//! Pointer codec and address arithmetic across every geometry

use coffer_rs::{ContainerFlags, Layout};
use proptest::prelude::*;

fn flags() -> impl Strategy<Value = ContainerFlags> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(block, single, extended)| {
        let mut flags = ContainerFlags::empty();
        flags.set(ContainerFlags::BLOCK_ADDRESSING, block);
        flags.set(ContainerFlags::SINGLE_FILE, single);
        flags.set(ContainerFlags::EXTENDED_ATTRIBUTES, extended);
        flags
    })
}

proptest! {
    #[test]
    fn prop_block_pointer_round_trip(
        width in 1u8..=8,
        block_size in 16u64..5000,
        flags in flags(),
        raw in any::<u64>(),
    ) {
        let layout = Layout::new(width, block_size, flags).unwrap();
        prop_assert_eq!(layout.to_absolute(0), 0);

        // Keep the absolute offset representable in a u64
        let limit = ((u64::MAX - layout.header_size()) / block_size).min(layout.max_pointer());
        let pointer = raw % limit + 1;
        let absolute = layout.to_absolute(pointer);
        prop_assert_eq!(layout.to_block_pointer(absolute), pointer);
    }

    #[test]
    fn prop_pointer_codec_round_trip(width in 1u8..=8, raw in any::<u64>()) {
        let layout = Layout::new(width, 4096, ContainerFlags::BLOCK_ADDRESSING).unwrap();
        let value = raw & layout.max_pointer();

        let mut bytes = Vec::new();
        layout.encode_pointer(value, &mut bytes);
        prop_assert_eq!(bytes.len(), width as usize);
        prop_assert_eq!(layout.decode_pointer(&bytes).unwrap(), value);
    }

    #[test]
    fn prop_values_past_width_are_rejected(width in 1u8..8, excess in 1u64..1000) {
        let layout = Layout::new(width, 4096, ContainerFlags::empty()).unwrap();
        let value = layout.max_pointer() + excess;
        prop_assert!(layout.check_fits(value, "pointer").is_err());
        prop_assert!(layout.check_fits(layout.max_pointer(), "pointer").is_ok());
    }
}

#[test]
fn test_header_sizes() {
    let full = Layout::new(2, 256, ContainerFlags::BLOCK_ADDRESSING).unwrap();
    assert_eq!(full.header_size(), 16);
    assert_eq!(full.block_header_size(), 4);
    assert_eq!(full.payload_capacity(), 252);

    let compact = Layout::new(4, 0, ContainerFlags::COMPACT).unwrap();
    assert_eq!(compact.header_size(), 18);
    assert_eq!(compact.block_header_size(), 4);
}
