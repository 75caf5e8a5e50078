//! Benchmarks for the shared buffer pool
//!
//! Target: acquire + release from the reserve without touching the allocator

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fleetd::infrastructure::pool::BufferPool;
use std::sync::Arc;

fn bench_acquire_release(c: &mut Criterion) {
    let pool = Arc::new(BufferPool::create(4, 4096).unwrap());

    c.bench_function("pool_acquire_release", |b| {
        b.iter(|| {
            let buf = pool.acquire().unwrap();
            black_box(&buf[0]);
        })
    });
}

fn bench_acquire_beyond_reserve(c: &mut Criterion) {
    let pool = Arc::new(BufferPool::create(4, 4096).unwrap());

    c.bench_function("pool_acquire_grow_8", |b| {
        b.iter(|| {
            // Half of these come from the allocator
            let held: Vec<_> = (0..8).map(|_| pool.acquire().unwrap()).collect();
            black_box(held.len());
        })
    });
}

criterion_group!(benches, bench_acquire_release, bench_acquire_beyond_reserve);
criterion_main!(benches);
