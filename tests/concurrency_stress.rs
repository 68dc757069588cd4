//! Concurrent use of one container from several threads

use coffer_rs::{Container, ContainerConfig, EntryFlags, MemoryStorage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn shared() -> Arc<Container> {
    let config = ContainerConfig {
        pointer_width: 3,
        block_size: 128,
        ..Default::default()
    };
    Arc::new(Container::create(MemoryStorage::new(), &config).unwrap())
}

#[test]
fn test_concurrent_writers_in_separate_directories() {
    let container = shared();

    let handles: Vec<_> = (0..6)
        .map(|thread_id| {
            let container = container.clone();
            std::thread::spawn(move || {
                let dir = container
                    .create_entry(&format!("t{}", thread_id), EntryFlags::DIRECTORY, 0)
                    .unwrap();
                for i in 0..25 {
                    let entry = container
                        .create_entry(&format!("f{}", i), EntryFlags::empty(), dir.id())
                        .unwrap();
                    let data = vec![thread_id as u8; 50 + i * 20];
                    container.content(entry.id()).unwrap().write(&data).unwrap();
                    if i % 3 == 0 {
                        container.delete_entry(entry.id()).unwrap();
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(container.root_entries().len(), 6);
    for thread_id in 0..6u8 {
        let dir = container
            .get_entry_by_path(&format!("t{}", thread_id))
            .unwrap();
        let children = container.children(dir.id()).unwrap();
        // 25 files, every third (i = 0, 3, ..., 24) deleted
        assert_eq!(children.len(), 16);
        for child in children {
            let bytes = container.content(child.id()).unwrap().read_to_end().unwrap();
            assert!(bytes.iter().all(|&b| b == thread_id));
        }
    }
    assert!(container.audit_blocks().unwrap().is_consistent());
}

#[test]
fn test_readers_alongside_writer() {
    let container = shared();
    for i in 0..20 {
        let entry = container
            .create_entry(&format!("seed{}", i), EntryFlags::empty(), 0)
            .unwrap();
        container
            .content(entry.id())
            .unwrap()
            .write(format!("data{}", i).as_bytes())
            .unwrap();
    }

    let reads = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    {
        let container = container.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..100 {
                let entry = container
                    .create_entry(&format!("new{}", i), EntryFlags::empty(), 0)
                    .unwrap();
                container.content(entry.id()).unwrap().write(&[1u8; 300]).unwrap();
                container.delete_entry(entry.id()).unwrap();
            }
        }));
    }

    for _ in 0..4 {
        let container = container.clone();
        let reads = reads.clone();
        handles.push(std::thread::spawn(move || {
            for round in 0..200 {
                let name = format!("seed{}", round % 20);
                let entry = container.get_entry_by_path(&name).unwrap();
                let bytes = container.content(entry.id()).unwrap().read_to_end().unwrap();
                assert_eq!(bytes, format!("data{}", round % 20).into_bytes());
                reads.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(reads.load(Ordering::Relaxed), 800);
    assert_eq!(container.root_entries().len(), 20);
    assert!(container.audit_blocks().unwrap().is_consistent());
}
