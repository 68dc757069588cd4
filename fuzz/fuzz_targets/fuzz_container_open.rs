#![no_main]
use coffer_rs::{Container, MemoryStorage};
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must either fail to open or yield a container whose
// entries and streams can be walked without panicking.
fuzz_target!(|data: &[u8]| {
    let container = match Container::open(MemoryStorage::from_bytes(data.to_vec())) {
        Ok(container) => container,
        Err(_) => return,
    };

    for entry in container.entries() {
        if entry.is_file() {
            if let Ok(mut content) = container.content(entry.id()) {
                let _ = content.read_to_end();
            }
        }
        for index in 0..entry.offstream_count() {
            if let Ok(mut side) = container.offstream(entry.id(), index) {
                let _ = side.read_to_end();
            }
        }
        let _ = container.path_of(entry.id());
    }

    let _ = container.live_chains();
    let _ = container.stats();
});
