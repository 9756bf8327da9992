use std::{ptr::NonNull, sync::Arc, thread};

use hpha::{Descriptor, HphaSchema};
use rand::{Rng, SeedableRng, rngs::SmallRng};

const THREADS: usize = 8;
const ITERATIONS: usize = 5_000;

struct Live {
    ptr: NonNull<u8>,
    size: usize,
    tag: u8,
}

// SAFETY: an allocation is only touched by the thread holding its `Live`.
unsafe impl Send for Live {}

fn churn(heap: &HphaSchema, seed: u64) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut live: Vec<Live> = Vec::new();

    for i in 0..ITERATIONS {
        if live.is_empty() || rng.random_bool(0.6) {
            let size = if rng.random_bool(0.8) {
                rng.random_range(1..=256)
            } else {
                rng.random_range(257..32 * 1024)
            };
            let alignment = 1 << rng.random_range(0..8);
            let ptr = heap.allocate(size, alignment).unwrap();
            assert_eq!(ptr.as_ptr().addr() % alignment, 0);

            let tag = (i as u8) ^ (seed as u8);
            unsafe { ptr.as_ptr().write_bytes(tag, size) };
            live.push(Live { ptr, size, tag });
        } else {
            let entry = live.swap_remove(rng.random_range(0..live.len()));
            let bytes = unsafe { std::slice::from_raw_parts(entry.ptr.as_ptr(), entry.size) };
            assert!(bytes.iter().all(|&b| b == entry.tag), "corrupted block");
            unsafe { heap.deallocate(entry.ptr, entry.size, 0) };
        }
    }

    for entry in live {
        unsafe { heap.deallocate(entry.ptr, entry.size, 0) };
    }
}

#[test]
fn test_concurrent_churn() {
    let heap = HphaSchema::new(Descriptor::default()).unwrap();

    thread::scope(|scope| {
        for seed in 0..THREADS as u64 {
            let heap = &heap;
            scope.spawn(move || churn(heap, seed));
        }
    });

    assert_eq!(heap.num_allocated_bytes(), 0);

    heap.garbage_collect();
    assert_eq!(heap.unallocated_memory(false), 0);
    assert_eq!(heap.block_source().acquired_bytes(), 0);
}

#[test]
fn test_concurrent_garbage_collection() {
    let heap = Arc::new(HphaSchema::new(Descriptor::default()).unwrap());

    thread::scope(|scope| {
        for seed in 0..THREADS as u64 / 2 {
            let heap = heap.as_ref();
            scope.spawn(move || churn(heap, 100 + seed));
        }

        let heap = heap.as_ref();
        scope.spawn(move || {
            for _ in 0..200 {
                heap.garbage_collect();
                thread::yield_now();
            }
        });
    });

    assert_eq!(heap.num_allocated_bytes(), 0);
}

#[test]
fn test_cross_thread_free() {
    let heap = HphaSchema::new(Descriptor::default()).unwrap();

    let mut batches: Vec<Vec<Live>> = (0..4).map(|_| Vec::new()).collect();
    for i in 0..1_000 {
        let size = 8 + (i % 400);
        let ptr = heap.allocate(size, 8).unwrap();
        batches[i % 4].push(Live { ptr, size, tag: 0 });
    }

    thread::scope(|scope| {
        for batch in batches {
            let heap = &heap;
            scope.spawn(move || {
                for entry in batch {
                    let freed = unsafe { heap.try_deallocate(entry.ptr) }.unwrap();
                    assert!(freed >= entry.size);
                }
            });
        }
    });

    assert_eq!(heap.num_allocated_bytes(), 0);
}
