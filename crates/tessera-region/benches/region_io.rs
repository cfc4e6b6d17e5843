//! Region file write and read throughput.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tessera_core::ChunkPos;
use tessera_region::{CompressionScheme, RegionFile, RegionOptions};
use tessera_test::{payload, TempDir};

const CHUNK_BYTES: usize = 24 * 1024;

fn write_slots(c: &mut Criterion) {
    let mut group = c.benchmark_group("region_write");
    group.throughput(Throughput::Bytes(CHUNK_BYTES as u64 * 64));
    let data = payload(11, CHUNK_BYTES);

    for scheme in [CompressionScheme::None, CompressionScheme::Zlib] {
        group.bench_with_input(BenchmarkId::from_parameter(scheme), &scheme, |b, &scheme| {
            let dir = TempDir::new("bench-write");
            let options = RegionOptions {
                compression: scheme,
                ..RegionOptions::default()
            };
            let mut region = RegionFile::open(dir.join("r.0.0.mca"), options).unwrap();
            b.iter(|| {
                for i in 0..64 {
                    region.write(ChunkPos::new(i % 32, i / 32), black_box(&data)).unwrap();
                }
            });
        });
    }
    group.finish();
}

fn read_slots(c: &mut Criterion) {
    let mut group = c.benchmark_group("region_read");
    group.throughput(Throughput::Bytes(CHUNK_BYTES as u64 * 64));
    let data = payload(12, CHUNK_BYTES);

    for scheme in [CompressionScheme::None, CompressionScheme::Zlib] {
        let dir = TempDir::new("bench-read");
        let options = RegionOptions {
            compression: scheme,
            ..RegionOptions::default()
        };
        let mut region = RegionFile::open(dir.join("r.0.0.mca"), options).unwrap();
        for i in 0..64 {
            region.write(ChunkPos::new(i % 32, i / 32), &data).unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(scheme), &scheme, |b, _| {
            b.iter(|| {
                for i in 0..64 {
                    black_box(region.read(ChunkPos::new(i % 32, i / 32)).unwrap());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, write_slots, read_slots);
criterion_main!(benches);
