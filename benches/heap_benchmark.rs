//! Benchmarks for the shared-memory arena allocator and the primitives that
//! live in it.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use forkpool::Heap;
use forkpool::sync::{Mutex, Semaphore};
use std::sync::Arc;

fn bench_allocate_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_allocate_free");

    for size in [16usize, 256, 4096].iter() {
        let heap = Heap::new();
        group.bench_with_input(BenchmarkId::new("single", size), size, |b, &size| {
            b.iter(|| {
                let block = heap.allocate(black_box(size)).unwrap();
                heap.free(block).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_fragmented_heap(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_fragmented");

    for count in [64usize, 512].iter() {
        group.bench_with_input(BenchmarkId::new("churn", count), count, |b, &count| {
            let heap = Heap::new();
            // Leave every other block allocated so frees cannot coalesce fully.
            let blocks: Vec<_> = (0..count).map(|_| heap.allocate(64).unwrap()).collect();
            let mut pinned = Vec::new();
            for (i, block) in blocks.into_iter().enumerate() {
                if i % 2 == 0 {
                    pinned.push(block);
                } else {
                    heap.free(block).unwrap();
                }
            }
            b.iter(|| {
                let block = heap.allocate(black_box(48)).unwrap();
                heap.free(block).unwrap();
            });
            for block in pinned {
                heap.free(block).unwrap();
            }
        });
    }

    group.finish();
}

fn bench_primitives(c: &mut Criterion) {
    let heap = Arc::new(Heap::new());
    let mut group = c.benchmark_group("shared_primitives");

    let sem = Semaphore::new(&heap, 1).unwrap();
    group.bench_function("semaphore_acquire_release", |b| {
        b.iter(|| {
            sem.acquire(None).unwrap();
            sem.release().unwrap();
        });
    });

    let mutex = Mutex::new(&heap).unwrap();
    group.bench_function("mutex_lock", |b| {
        b.iter(|| {
            let guard = mutex.lock().unwrap();
            black_box(&guard);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_allocate_free,
    bench_fragmented_heap,
    bench_primitives
);
criterion_main!(benches);
