//! Micro-benchmarks for the skiplist memtable and the LSM engine built
//! on top of it.
//!
//! ```bash
//! cargo bench --bench memtable
//! ```

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use tempfile::TempDir;
use vekv::engine::{Engine, EngineConfig};
use vekv::memtable::Memtable;

const VALUE_128B: &[u8; 128] = &[0xAB; 128];

fn open_memtable_only(dir: &std::path::Path) -> Engine {
    Engine::open(
        dir,
        EngineConfig {
            flush_threshold: 64 * 1024 * 1024,
        },
    )
    .expect("open")
}

fn open_small_buffer(dir: &std::path::Path) -> Engine {
    Engine::open(
        dir,
        EngineConfig {
            flush_threshold: 4 * 1024,
        },
    )
    .expect("open")
}

fn bench_memtable_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("memtable_insert");

    group.bench_function("skiplist_only", |b| {
        let memtable = Memtable::new();
        let mut seq = 0u64;
        b.iter(|| {
            memtable.insert(black_box(seq), black_box(VALUE_128B.to_vec())).unwrap();
            seq += 1;
        });
    });

    group.finish();
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");

    group.bench_function("memtable_only", |b| {
        let dir = TempDir::new().unwrap();
        let mut engine = open_memtable_only(dir.path());
        let mut seq = 0u64;
        b.iter(|| {
            engine.put(black_box(seq), black_box(VALUE_128B.to_vec())).unwrap();
            seq += 1;
        });
    });

    group.bench_function("sequential_with_flush", |b| {
        let dir = TempDir::new().unwrap();
        let mut engine = open_small_buffer(dir.path());
        let mut seq = 0u64;
        b.iter(|| {
            engine.put(black_box(seq), black_box(VALUE_128B.to_vec())).unwrap();
            seq += 1;
        });
    });

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");

    {
        let dir = TempDir::new().unwrap();
        let mut engine = open_memtable_only(dir.path());
        let n = 10_000u64;
        for i in 0..n {
            engine.put(i, VALUE_128B.to_vec()).unwrap();
        }

        group.bench_function("memtable_hit", |b| {
            let mut i = 0u64;
            b.iter(|| {
                let _ = black_box(engine.get(black_box(i % n)).unwrap());
                i += 1;
            });
        });
    }

    {
        let dir = TempDir::new().unwrap();
        let n = 5_000u64;
        {
            let mut engine = open_small_buffer(dir.path());
            for i in 0..n {
                engine.put(i, VALUE_128B.to_vec()).unwrap();
            }
        }
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();

        group.bench_function("sstable_hit", |b| {
            let mut i = 0u64;
            b.iter(|| {
                let _ = black_box(engine.get(black_box(i % n)).unwrap());
                i += 1;
            });
        });
    }

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");

    let dir = TempDir::new().unwrap();
    let mut engine = open_memtable_only(dir.path());
    let n = 10_000u64;
    for i in 0..n {
        engine.put(i, VALUE_128B.to_vec()).unwrap();
    }

    for &range_size in &[10u64, 100, 1000] {
        group.throughput(Throughput::Elements(range_size));
        group.bench_function(BenchmarkId::new("memtable", format!("{range_size}_keys")), |b| {
            let mut offset = 0u64;
            b.iter(|| {
                let lo = offset % (n - range_size);
                let hi = lo + range_size;
                let results = engine.scan(black_box(lo), black_box(hi)).unwrap();
                black_box(&results);
                offset += 1;
            });
        });
    }

    group.finish();
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction");
    group.sample_size(10);

    for &count in &[1_000u64, 5_000] {
        group.bench_function(BenchmarkId::new("flush_and_compact", count), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let engine = open_small_buffer(dir.path());
                    (dir, engine, count)
                },
                |(_dir, mut engine, count)| {
                    for i in 0..count {
                        engine.put(i, VALUE_128B.to_vec()).unwrap();
                    }
                    black_box(&engine);
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_memtable_insert,
    bench_put,
    bench_get,
    bench_scan,
    bench_compaction,
);
criterion_main!(benches);
