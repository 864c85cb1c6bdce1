//! Benchmark: end-to-end extraction and the decode stage alone
//!
//! Compare:
//! - decoder widths on the same pbzx stream
//! - full extraction into a fresh directory

use std::io::Cursor;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

use unxip_core::pbzx::ChunkSplitter;
use unxip_core::testing::{pbzx_stream, ArchiveBuilder};
use unxip_core::{bounded, ByteCursor, CancelToken, CountPolicy, ReaderSource, Unxip, UnxipOptions};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 61) as u8 ^ (i / 4099) as u8).collect()
}

fn bench_decode_width(c: &mut Criterion) {
    let data = payload(8 * 1024 * 1024);
    let stream = pbzx_stream(&data, 256 * 1024, true).unwrap();

    let mut group = c.benchmark_group("pbzx_decode");
    group.throughput(Throughput::Bytes(data.len() as u64));
    for width in [1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter(|| {
                let (tx, rx) = bounded::<Bytes, _>(CountPolicy::new(16));
                let consumer = std::thread::spawn(move || {
                    let mut total = 0;
                    while let Some(chunk) = rx.pop().unwrap() {
                        total += chunk.len();
                    }
                    total
                });
                let mut cursor = ByteCursor::new(ReaderSource::new(Cursor::new(stream.clone())));
                ChunkSplitter::new(width, tx, CancelToken::new())
                    .unwrap()
                    .run(&mut cursor)
                    .unwrap();
                black_box(consumer.join().unwrap())
            })
        });
    }
    group.finish();
}

fn bench_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract");

    for file_count in [100, 1000].iter() {
        let mut builder = ArchiveBuilder::new().directory("tree", 0o755);
        for i in 0..*file_count {
            builder = builder.file(&format!("tree/file_{}.dat", i), 0o644, payload(4096 + i));
        }
        let archive = builder.chunk_size(1024 * 1024).build().unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(file_count),
            &archive,
            |b, archive| {
                b.iter_batched(
                    || TempDir::new().unwrap(),
                    |dest| {
                        let stats = Unxip::new(UnxipOptions::default())
                            .run(Cursor::new(archive.clone()), dest.path())
                            .unwrap();
                        black_box(stats)
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_decode_width, bench_extract);
criterion_main!(benches);
