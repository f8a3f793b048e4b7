//! Benchmarks for the B+-tree array's hot paths: sequential append (C4)
//! and a width-predicated scan over a packed leaf (C3).
//!
//! Run: cargo bench --bench scan_and_btree

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;

use arcadb::arena::Arena;
use arcadb::btree::{self, Root};
use arcadb::codec::pack;
use arcadb::config::GrowthPolicy;

fn build_column(n: u64) -> (TempDir, Arena, Root) {
    let dir = TempDir::new().unwrap();
    let mut arena = Arena::create(&dir.path().join("bench.db"), GrowthPolicy::conservative()).unwrap();
    let mut root: Root = None;
    for k in 0..n {
        root = Some(btree::bptree_insert(&mut arena, root, k, k as i64).unwrap());
    }
    (dir, arena, root)
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_append");
    for &n in &[1_000u64, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let dir = TempDir::new().unwrap();
                let mut arena =
                    Arena::create(&dir.path().join("bench.db"), GrowthPolicy::conservative()).unwrap();
                let mut root: Root = None;
                for k in 0..n {
                    root = Some(btree::bptree_insert(&mut arena, root, k, black_box(k as i64)).unwrap());
                }
                black_box(root);
            });
        });
    }
    group.finish();
}

fn bench_find_all_scan(c: &mut Criterion) {
    let width = 16u8;
    let count = 4096usize;
    let words = pack::words_for(width, count as u32);
    let mut payload = vec![0u64; words];
    for i in 0..count {
        pack::set_bits(&mut payload, width, i, (i % 1000) as i64);
    }

    c.bench_function("codec_find_all_width16_4096", |b| {
        b.iter(|| {
            let mut hits = Vec::new();
            pack::find_all(&payload, width, black_box(500), 0, count, 0, |idx| {
                hits.push(idx);
                true
            });
            black_box(&hits);
        });
    });
}

fn bench_get(c: &mut Criterion) {
    let (_dir, mut arena, root) = build_column(100_000);
    c.bench_function("btree_get_100k", |b| {
        b.iter(|| {
            black_box(btree::bptree_get(&mut arena, root, black_box(50_000)).unwrap());
        });
    });
}

criterion_group!(benches, bench_append, bench_find_all_scan, bench_get);
criterion_main!(benches);
