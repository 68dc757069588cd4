#![no_main]
use arbitrary::Arbitrary;
use coffer_rs::{Container, ContainerConfig, EntryFlags, MemoryStorage};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    Write { at: u16, data: Vec<u8> },
    Replace { at: u16, len: u16, data: Vec<u8> },
    SetLen(u16),
    Optimize,
}

#[derive(Debug, Arbitrary)]
struct Input {
    pointer_width: u8,
    block_size: u8,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let config = ContainerConfig {
        pointer_width: input.pointer_width % 4 + 1,
        block_size: u64::from(input.block_size) + 2,
        ..Default::default()
    };
    let container = match Container::create(MemoryStorage::new(), &config) {
        Ok(container) => container,
        Err(_) => return,
    };
    let entry = match container.create_entry("fuzz", EntryFlags::empty(), 0) {
        Ok(entry) => entry,
        Err(_) => return,
    };

    let mut model: Vec<u8> = Vec::new();
    for op in input.ops {
        let mut stream = container.content(entry.id()).unwrap();
        let applied = match op {
            Op::Write { at, data } => {
                let position = at as usize % (model.len() + 32);
                stream.seek(position as u64);
                let ok = stream.write(&data).is_ok();
                if ok && !data.is_empty() {
                    let end = position + data.len();
                    if model.len() < end {
                        model.resize(end, 0);
                    }
                    model[position..end].copy_from_slice(&data);
                }
                ok
            }
            Op::Replace { at, len, data } => {
                let position = at as usize % (model.len() + 1);
                let original = len as usize % (model.len() - position + 1);
                stream.seek(position as u64);
                let ok = stream.replace(original as u64, &data).is_ok();
                if ok {
                    model.splice(position..position + original, data);
                }
                ok
            }
            Op::SetLen(len) => {
                let ok = stream.set_len(u64::from(len)).is_ok();
                if ok {
                    model.resize(len as usize, 0);
                }
                ok
            }
            Op::Optimize => container.optimize().is_ok(),
        };

        // Capacity errors on tiny pointer widths end the run
        if !applied {
            return;
        }

        let mut stream = container.content(entry.id()).unwrap();
        assert_eq!(stream.read_to_end().unwrap(), model);
        assert!(container.audit_blocks().unwrap().is_consistent());
    }
});
