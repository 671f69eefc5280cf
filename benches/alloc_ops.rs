use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quantum_alloc::Director;

use std::alloc::{alloc, dealloc, Layout};

/// Benchmark allocate-deallocate pairs across the size range
fn bench_allocate_deallocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_deallocate");

    for size in [16u64, 256, 4 * 1024, 64 * 1024, 1024 * 1024].iter() {
        // quantum-alloc: claim and release one block
        group.bench_with_input(BenchmarkId::new("quantum_alloc", size), size, |b, &size| {
            let director = Director::create(0, None, false, 8, 8, 4, 16, 0).unwrap();
            let director = unsafe { director.as_ref() };

            b.iter(|| {
                let address = director.allocate(black_box(size)).unwrap();
                director.deallocate(black_box(address));
            });

            unsafe { Director::destroy(director as *const Director as *mut Director, false) };
        });

        // System allocator: same pattern through std::alloc
        group.bench_with_input(BenchmarkId::new("system", size), size, |b, &size| {
            let layout = Layout::from_size_align(size as usize, 8).unwrap();

            b.iter(|| unsafe {
                let ptr = alloc(layout);
                dealloc(black_box(ptr), layout);
            });
        });
    }

    group.finish();
}

/// Benchmark size queries against live allocations
fn bench_size_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("size_query");

    for count in [16usize, 256, 4096].iter() {
        group.bench_with_input(BenchmarkId::new("quantum_alloc", count), count, |b, &count| {
            let director = Director::create(0, None, false, 8, 8, 4, 16, 0).unwrap();
            let director = unsafe { director.as_ref() };

            let addresses: Vec<u64> = (0..count)
                .map(|i| director.allocate(8 << (i % 8)).unwrap())
                .collect();
            let mut cursor = 0;

            b.iter(|| {
                cursor = (cursor + 1) % addresses.len();
                black_box(director.allocation_size(addresses[cursor]));
            });

            for &address in &addresses {
                director.deallocate(address);
            }

            unsafe { Director::destroy(director as *const Director as *mut Director, false) };
        });
    }

    group.finish();
}

/// Benchmark bulk allocation against looped singles
fn bench_bulk(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_allocate");

    for count in [8usize, 64, 512].iter() {
        group.bench_with_input(BenchmarkId::new("bulk", count), count, |b, &count| {
            let director = Director::create(0, None, false, 8, 8, 4, 16, 0).unwrap();
            let director = unsafe { director.as_ref() };
            let mut addresses = vec![0u64; count];

            b.iter(|| {
                let allocated = director.allocate_bulk(64, &mut addresses, false);
                director.deallocate_bulk(&addresses[..allocated]);
            });

            unsafe { Director::destroy(director as *const Director as *mut Director, false) };
        });

        group.bench_with_input(BenchmarkId::new("singles", count), count, |b, &count| {
            let director = Director::create(0, None, false, 8, 8, 4, 16, 0).unwrap();
            let director = unsafe { director.as_ref() };
            let mut addresses = vec![0u64; count];

            b.iter(|| {
                for slot in addresses.iter_mut() {
                    *slot = director.allocate(64).unwrap();
                }
                for &address in addresses.iter() {
                    director.deallocate(address);
                }
            });

            unsafe { Director::destroy(director as *const Director as *mut Director, false) };
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_allocate_deallocate,
    bench_size_query,
    bench_bulk
);
criterion_main!(benches);
