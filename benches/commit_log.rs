//! Benchmark for the commit log's append hot path (C7): durability cost
//! per changeset at a few representative payload sizes.
//!
//! Run: cargo bench --bench commit_log

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;

use arcadb::commitlog::CommitLog;

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("commitlog_append");
    for &payload_size in &[64usize, 4096, 65536] {
        group.bench_with_input(BenchmarkId::from_parameter(payload_size), &payload_size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let mut log = CommitLog::open(dir.path()).unwrap();
            let payload = vec![0xABu8; size];
            let mut version = 0u64;
            b.iter(|| {
                log.append(version, black_box(&payload)).unwrap();
                version += 1;
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
