//! Micro-benchmarks for the HNSW approximate nearest-neighbor index and
//! the append-only vector log it sits alongside.
//!
//! ```bash
//! cargo bench --bench hnsw
//! ```

use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use rand::Rng;
use rand::rngs::ThreadRng;
use tempfile::TempDir;
use vekv::hnsw::{Hnsw, HnswConfig};
use vekv::vector::KVecTable;

const DIM: usize = 768;

fn random_vec(rng: &mut ThreadRng) -> Vec<f32> {
    (0..DIM).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect()
}

fn populated_graph(n: u64, rng: &mut ThreadRng) -> Hnsw {
    let mut graph = Hnsw::new(HnswConfig::default());
    for i in 0..n {
        graph.insert(i, random_vec(rng)).unwrap();
    }
    graph
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("hnsw_insert");
    group.sample_size(10);

    for &n in &[1_000u64, 5_000] {
        group.bench_function(BenchmarkId::new("sequential", n), |b| {
            b.iter_batched(
                || {
                    let mut rng = rand::rng();
                    let vecs: Vec<Vec<f32>> = (0..n).map(|_| random_vec(&mut rng)).collect();
                    (Hnsw::new(HnswConfig::default()), vecs)
                },
                |(mut graph, vecs)| {
                    for (i, v) in vecs.into_iter().enumerate() {
                        graph.insert(i as u64, black_box(v)).unwrap();
                    }
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("hnsw_query");

    let mut rng = rand::rng();
    let graph = populated_graph(5_000, &mut rng);

    group.bench_function("top_10_of_5000", |b| {
        b.iter(|| {
            let query = random_vec(&mut rng);
            let results = graph.query(black_box(&query), 10).unwrap();
            black_box(&results);
        });
    });

    group.finish();
}

fn bench_kvec_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("kvec_flush");
    group.sample_size(10);

    for &threads in &[1usize, 4] {
        group.bench_function(BenchmarkId::new("threads", threads), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let table = KVecTable::new().with_flush_threads(threads);
                    let mut rng = rand::rng();
                    for i in 0..2_000u64 {
                        table.put(i, random_vec(&mut rng)).unwrap();
                    }
                    (dir, table)
                },
                |(dir, table)| {
                    table.flush(dir.path()).unwrap();
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_query, bench_kvec_flush);
criterion_main!(benches);
