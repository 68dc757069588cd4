use coffer_rs::{Container, ContainerConfig, EntryFlags, MemoryStorage};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn container(block_size: u64) -> Container {
    let config = ContainerConfig {
        pointer_width: 4,
        block_size,
        ..Default::default()
    };
    Container::create(MemoryStorage::new(), &config).unwrap()
}

/// Sequential append of 1 MiB in fixed-size writes
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_append");
    group.throughput(Throughput::Bytes(1 << 20));

    for block_size in [512u64, 4096, 16384] {
        group.bench_with_input(
            BenchmarkId::from_parameter(block_size),
            &block_size,
            |b, &block_size| {
                let chunk = vec![0x5Au8; 8192];
                b.iter_with_setup(
                    || {
                        let container = container(block_size);
                        let entry = container
                            .create_entry("bench", EntryFlags::empty(), 0)
                            .unwrap();
                        (container, entry.id())
                    },
                    |(container, id)| {
                        let mut stream = container.content(id).unwrap();
                        for _ in 0..128 {
                            stream.write(&chunk).unwrap();
                        }
                        black_box(stream.len());
                    },
                );
            },
        );
    }

    group.finish();
}

/// Sequential read of a 1 MiB stream
fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_read");
    group.throughput(Throughput::Bytes(1 << 20));

    for block_size in [512u64, 4096, 16384] {
        let container = container(block_size);
        let entry = container
            .create_entry("bench", EntryFlags::empty(), 0)
            .unwrap();
        container
            .content(entry.id())
            .unwrap()
            .write(&vec![0xA5u8; 1 << 20])
            .unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(block_size),
            &block_size,
            |b, _| {
                b.iter(|| {
                    let mut stream = container.content(entry.id()).unwrap();
                    black_box(stream.read_to_end().unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Splice insertions near the front of a 256 KiB stream
fn bench_splice(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_splice");
    group.sample_size(20);

    for insert in [1usize, 100, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(insert), &insert, |b, &insert| {
            let data = vec![7u8; insert];
            b.iter_with_setup(
                || {
                    let container = container(4096);
                    let entry = container
                        .create_entry("bench", EntryFlags::empty(), 0)
                        .unwrap();
                    container
                        .content(entry.id())
                        .unwrap()
                        .write(&vec![1u8; 256 * 1024])
                        .unwrap();
                    (container, entry.id())
                },
                |(container, id)| {
                    let mut stream = container.content(id).unwrap();
                    stream.seek(10);
                    stream.replace(0, &data).unwrap();
                    black_box(stream.len());
                },
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_read, bench_splice);
criterion_main!(benches);
