use cartridge_streams::{MemoryStore, StreamContainer, StreamContainerBuilder};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};

fn populated(cluster_size: u32, streams: usize, stream_len: usize) -> StreamContainer<MemoryStore> {
    let container = StreamContainerBuilder::new()
        .cluster_size(cluster_size)
        .create(MemoryStore::new())
        .unwrap();
    for i in 0..streams {
        container
            .add()
            .unwrap()
            .append(&vec![i as u8; stream_len])
            .unwrap();
    }
    container
}

/// Benchmark sequential appends across cluster sizes
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    let chunk = vec![0x42u8; 1024];

    for cluster_size in [64u32, 512, 4096] {
        group.throughput(Throughput::Bytes(256 * chunk.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(cluster_size),
            &cluster_size,
            |b, &cluster_size| {
                b.iter(|| {
                    let container = populated(cluster_size, 0, 0);
                    let stream = container.add().unwrap();
                    for _ in 0..256 {
                        stream.append(&chunk).unwrap();
                    }
                    black_box(stream.len().unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark random reads from one long stream
fn bench_random_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_reads");

    for cluster_size in [64u32, 4096] {
        let container = populated(cluster_size, 1, 1 << 20);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let offsets: Vec<u64> = (0..1000).map(|_| rng.gen_range(0..(1 << 20) - 256)).collect();

        group.throughput(Throughput::Elements(offsets.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(cluster_size),
            &offsets,
            |b, offsets| {
                let stream = container.open_read(0).unwrap();
                let mut buf = [0u8; 256];
                b.iter(|| {
                    for &offset in offsets {
                        black_box(stream.read_at(offset, &mut buf).unwrap());
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark removing an interior stream (tail relocation + descriptor shift)
fn bench_remove_interior(c: &mut Criterion) {
    let mut group = c.benchmark_group("remove_interior");
    group.sample_size(20);

    for streams in [16usize, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(streams), &streams, |b, &streams| {
            b.iter_with_setup(
                || populated(256, streams, 4096),
                |container| {
                    container.remove(1).unwrap();
                    black_box(container.stream_count());
                },
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_random_reads, bench_remove_interior);
criterion_main!(benches);
