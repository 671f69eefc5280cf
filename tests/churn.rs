//! Concurrent churn over one shared allocator instance.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use quantum_alloc::{Director, STATS_SIZE};

/// Raw director handle that can cross threads. Safe here because every
/// operation on the director is lock-free and the handle outlives the
/// threads.
#[derive(Clone, Copy)]
struct Handle(*mut Director);

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    fn get(&self) -> &Director {
        unsafe { &*self.0 }
    }
}

/// Cheap deterministic per-thread size sequence.
fn next_size(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    // Sizes from 8 bytes up to 1M.
    8 + (*state >> 33) % ((1 << 20) - 8)
}

#[test]
fn concurrent_churn_leaves_no_residue() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 2_000;

    let director =
        Director::create(0, None, false, 8, 8, 4, 32, 0).expect("create failed");
    let handle = Handle(director.as_ptr());

    let failures = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();

    for thread_index in 0..THREADS {
        let failures = Arc::clone(&failures);

        workers.push(thread::spawn(move || {
            let mut state = 0x9E3779B9u64.wrapping_add(thread_index as u64);

            for _ in 0..ITERATIONS {
                let size = next_size(&mut state);

                let address = match handle.get().allocate(size) {
                    Some(address) => address,
                    None => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };

                let allocated = handle.get().allocation_size(address);
                assert!(allocated >= size);
                assert!(allocated.is_power_of_two());

                // Tag the block and verify nobody else touched it.
                let tag = (thread_index as u64) << 48 | address;
                unsafe {
                    *(address as *mut u64) = tag;
                    *((address + allocated - 8) as *mut u64) = tag;
                }

                thread::yield_now();

                unsafe {
                    assert_eq!(*(address as *const u64), tag, "block overwritten");
                    assert_eq!(
                        *((address + allocated - 8) as *const u64),
                        tag,
                        "block tail overwritten"
                    );
                }

                handle.get().deallocate(address);
            }
        }));
    }

    for worker in workers {
        worker.join().expect("worker panicked");
    }

    // Transient capacity misses are tolerable, silent corruption is not.
    assert_eq!(failures.load(Ordering::Relaxed), 0, "allocator ran dry");

    // After quiescence nothing is live.
    let mut counts = [0u64; STATS_SIZE];
    let mut sizes = [0u64; STATS_SIZE];
    handle.get().stats(&mut counts, &mut sizes);

    for order in 3..=52 {
        assert_eq!(counts[order], 0, "order {} still live", order);
    }

    assert_eq!(handle.get().next_allocation(0), 0);

    unsafe { Director::destroy(handle.0, false) };
}

#[test]
fn concurrent_distinct_addresses() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let director =
        Director::create(0, None, false, 8, 8, 2, 8, 0).expect("create failed");
    let handle = Handle(director.as_ptr());

    let mut workers = Vec::new();

    for _ in 0..THREADS {
        workers.push(thread::spawn(move || {
            let mut held = Vec::with_capacity(PER_THREAD);
            for _ in 0..PER_THREAD {
                held.push(handle.get().allocate(64).expect("allocate failed"));
            }
            held
        }));
    }

    let mut all: Vec<u64> = workers
        .into_iter()
        .flat_map(|worker| worker.join().unwrap())
        .collect();

    // No two live allocations may overlap; with one size class that
    // means all addresses are distinct.
    let total = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), total);

    for &address in &all {
        handle.get().deallocate(address);
    }

    unsafe { Director::destroy(handle.0, false) };
}

#[test]
fn concurrent_set_reference_single_winner() {
    const THREADS: usize = 8;

    let director = Director::create(0, None, false, 1, 1, 1, 0, 0).expect("create failed");
    let handle = Handle(director.as_ptr());

    let winners = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();

    for thread_index in 0..THREADS {
        let winners = Arc::clone(&winners);

        workers.push(thread::spawn(move || {
            // All race the same expected value; exactly one must win.
            if handle.get().set_reference(0, thread_index as u64 + 1) {
                winners.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::Relaxed), 1);
    assert_ne!(handle.get().get_reference(), 0);

    unsafe { Director::destroy(handle.0, false) };
}

#[test]
fn secure_churn_zeroes_before_reuse() {
    const ITERATIONS: usize = 300;

    let director = Director::create(0, None, true, 4, 4, 2, 8, 0).expect("create failed");
    let handle = Handle(director.as_ptr());

    for i in 0..ITERATIONS {
        let size = 64 << (i % 5);
        let address = handle.get().allocate(size).expect("allocate failed");
        let allocated = handle.get().allocation_size(address);

        // Secure mode promises zeroed content on arrival.
        unsafe {
            for offset in (0..allocated).step_by(8) {
                assert_eq!(
                    *((address + offset) as *const u64),
                    0,
                    "dirty block handed out"
                );
            }

            std::ptr::write_bytes(address as *mut u8, 0xA5, allocated as usize);
        }

        handle.get().deallocate(address);
    }

    unsafe { Director::destroy(handle.0, false) };
}
