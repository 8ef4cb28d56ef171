use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use tickpool::{GcRoot, MemoryPool, PoolOptions};

/// Benchmark: allocate/deallocate churn through the thread-local fast path,
/// with one sleep transition per batch to drive reclamation.
fn bench_alloc_free_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free_batches");

    for nodes_per_group in [8usize, 32, 128] {
        group.bench_with_input(
            BenchmarkId::new("nodes_per_group", nodes_per_group),
            &nodes_per_group,
            |b, &nodes_per_group| {
                let root = GcRoot::new();
                let pool = MemoryPool::<u64>::new(
                    &root,
                    PoolOptions::new()
                        .nodes_per_group(nodes_per_group)
                        .initial_groups(4),
                );
                let mut shard = root.attach();

                b.iter(|| {
                    let guard = shard.awake();
                    let mut addrs = Vec::with_capacity(256);
                    for i in 0..256u64 {
                        let slot = pool.alloc(&guard);
                        slot.write(i);
                        addrs.push(slot.as_ptr() as usize);
                    }
                    for addr in &addrs {
                        unsafe { pool.dealloc(&guard, &*(*addr as *const u64)) };
                    }
                    drop(guard);
                    black_box(&pool);
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: the same churn against the system allocator, as a baseline for
/// what the pool's recycling saves.
fn bench_against_boxes(c: &mut Criterion) {
    let mut group = c.benchmark_group("against_boxes");

    group.bench_function("pool_256", |b| {
        let root = GcRoot::new();
        let pool = MemoryPool::<u64>::new(
            &root,
            PoolOptions::new().nodes_per_group(32).initial_groups(8),
        );
        let mut shard = root.attach();
        b.iter(|| {
            let guard = shard.awake();
            let mut addrs = Vec::with_capacity(256);
            for i in 0..256u64 {
                let slot = pool.alloc(&guard);
                slot.write(i);
                addrs.push(slot.as_ptr() as usize);
            }
            for addr in &addrs {
                unsafe { pool.dealloc(&guard, &*(*addr as *const u64)) };
            }
            drop(guard);
        });
    });

    group.bench_function("boxes_256", |b| {
        b.iter(|| {
            let mut boxes = Vec::with_capacity(256);
            for i in 0..256u64 {
                boxes.push(Box::new(i));
            }
            black_box(&boxes);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free_batches, bench_against_boxes);
criterion_main!(benches);
