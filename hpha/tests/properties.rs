use std::{ptr::NonNull, sync::Arc};

use hpha::{AllocatorAllocate, Descriptor, HeapError, HphaSchema};
use rand::{Rng, SeedableRng, rngs::SmallRng};

fn heap() -> HphaSchema {
    HphaSchema::new(Descriptor::default()).unwrap()
}

fn general_only() -> HphaSchema {
    HphaSchema::new(Descriptor {
        is_pool_allocations: false,
        ..Default::default()
    })
    .unwrap()
}

unsafe fn fill(ptr: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
        unsafe { ptr.as_ptr().add(i).write(seed.wrapping_add(i as u8)) };
    }
}

unsafe fn check(ptr: NonNull<u8>, len: usize, seed: u8) -> bool {
    (0..len).all(|i| unsafe { ptr.as_ptr().add(i).read() } == seed.wrapping_add(i as u8))
}

#[test]
fn test_alignment_and_size_for_every_power_of_two() {
    let heap = heap();
    let mut rng = SmallRng::seed_from_u64(0xA11C);
    let mut live = Vec::new();

    for shift in 0..=12 {
        let alignment = 1usize << shift;
        for _ in 0..32 {
            let size = rng.random_range(0..20_000);
            let ptr = heap.allocate(size, alignment).unwrap();

            assert_eq!(ptr.as_ptr().addr() % alignment, 0, "size {size} alignment {alignment}");
            assert!(unsafe { heap.allocation_size(ptr) } >= size);
            live.push((ptr, size, alignment));
        }
    }

    for (ptr, size, alignment) in live {
        unsafe { heap.deallocate(ptr, size, alignment) };
    }
    assert_eq!(heap.num_allocated_bytes(), 0);
}

#[test]
fn test_reuse_after_free() {
    let heap = heap();
    let mut rng = SmallRng::seed_from_u64(7);

    for _ in 0..2_000 {
        let size = rng.random_range(1..4_096);
        let ptr = heap.allocate(size, 8).unwrap();
        let usable = unsafe { heap.allocation_size(ptr) };
        assert!(usable >= size);

        unsafe {
            fill(ptr, size, size as u8);
            assert!(check(ptr, size, size as u8));
            heap.deallocate(ptr, size, 8);
        }
    }

    assert_eq!(heap.num_allocated_bytes(), 0);
    // A single live block at a time never needs more than one page per class
    assert!(heap.block_source().acquired_bytes() <= 40 * 4096);
}

#[test]
fn test_grow_in_place_preserves_prefix() {
    let heap = general_only();

    let ptr = heap.allocate(100, 8).unwrap();
    unsafe {
        fill(ptr, 100, 3);

        let reached = heap.resize(ptr, 1_000);
        assert!(reached >= 1_000);
        assert!(check(ptr, 100, 3));

        let moved = heap.reallocate(Some(ptr), 50_000, 8).unwrap();
        assert!(check(moved, 100, 3));
        heap.deallocate(moved, 50_000, 8);
    }
}

#[test]
fn test_shrink_keeps_prefix() {
    let heap = heap();
    let ptr = heap.allocate(8_000, 16).unwrap();

    unsafe {
        fill(ptr, 8_000, 11);
        let shrunk = heap.reallocate(Some(ptr), 500, 16).unwrap();
        assert_eq!(shrunk, ptr);
        assert!(check(shrunk, 500, 11));
        assert!(heap.allocation_size(shrunk) < 8_000);

        let smaller = heap.reallocate(Some(shrunk), 40, 16).unwrap();
        assert!(check(smaller, 40, 11));
        heap.deallocate(smaller, 40, 16);
    }
}

#[test]
fn test_request_above_capacity_fails() {
    let heap = HphaSchema::new(Descriptor {
        capacity: 256 * 1024,
        ..Default::default()
    })
    .unwrap();

    let keep = heap.allocate(1_000, 8).unwrap();
    let allocated = heap.num_allocated_bytes();

    assert!(heap.allocate(heap.capacity() + 1, 8).is_none());
    assert_eq!(
        heap.try_allocate(usize::MAX, 8),
        Err(HeapError::CapacityExceeded {
            requested: usize::MAX,
            capacity: 256 * 1024
        })
    );
    assert_eq!(heap.num_allocated_bytes(), allocated);

    unsafe { heap.deallocate(keep, 1_000, 8) };
}

#[test]
fn test_adjacent_blocks_coalesce_in_either_order() {
    for reverse in [false, true] {
        let heap = general_only();

        let a = heap.allocate(1_000, 8).unwrap();
        let b = heap.allocate(1_000, 8).unwrap();
        // Pins the tail so `a` and `b` can only merge with each other
        let pin = heap.allocate(1_000, 8).unwrap();

        let combined =
            unsafe { heap.allocation_size(a) + heap.allocation_size(b) } + hpha::GENERAL_OVERHEAD;
        let blocks = heap.block_source().acquired_blocks();

        unsafe {
            if reverse {
                heap.deallocate(b, 1_000, 8);
                heap.deallocate(a, 1_000, 8);
            } else {
                heap.deallocate(a, 1_000, 8);
                heap.deallocate(b, 1_000, 8);
            }
        }

        let merged = heap.allocate(combined, 8).unwrap();
        assert_eq!(merged, a, "reverse: {reverse}");
        assert_eq!(heap.block_source().acquired_blocks(), blocks);

        unsafe {
            heap.deallocate(merged, combined, 8);
            heap.deallocate(pin, 1_000, 8);
        }
    }
}

#[test]
fn test_scenario_pooled_small_allocations() {
    let heap = HphaSchema::new(Descriptor {
        pool_page_size: 4096,
        is_pool_allocations: true,
        ..Default::default()
    })
    .unwrap();

    let ptrs: Vec<_> = (0..100).map(|_| heap.allocate(16, 8).unwrap()).collect();

    for &ptr in &ptrs {
        assert_eq!(ptr.as_ptr().addr() % 8, 0);
        assert_eq!(unsafe { heap.allocation_size(ptr) }, 16);
    }
    assert!(heap.num_allocated_bytes() >= 1600);
    // 100 slots of 16 bytes fit a single 4 KiB pool page
    assert_eq!(heap.block_source().acquired_blocks(), 1);

    for ptr in ptrs {
        unsafe { heap.deallocate(ptr, 16, 8) };
    }
}

#[test]
fn test_scenario_fixed_block_exhaustion() {
    let heap = HphaSchema::new(Descriptor {
        fixed_memory_block_byte_size: 64 * 1024,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(heap.capacity(), 64 * 1024);

    let mut rng = SmallRng::seed_from_u64(64);
    let mut live = Vec::new();

    loop {
        let size = rng.random_range(1..3_000);
        let Some(ptr) = heap.allocate(size, 8) else {
            break;
        };
        let seed = live.len() as u8;
        unsafe { fill(ptr, size, seed) };
        live.push((ptr, size, seed));
        assert!(live.len() < 10_000, "fixed block never ran out");
    }

    assert!(!live.is_empty());
    for &(ptr, size, seed) in &live {
        assert!(unsafe { check(ptr, size, seed) });
    }

    // Fixed block pages are never handed back
    for (ptr, size, _) in live {
        unsafe { heap.deallocate(ptr, size, 8) };
    }
    assert_eq!(heap.garbage_collect(), 0);
    assert_eq!(heap.block_source().released_blocks(), 0);
}

#[test]
fn test_scenario_free_then_reallocate_reuses_page() {
    let heap = heap();

    let ptr = heap.allocate(10_000, 8).unwrap();
    let blocks = heap.block_source().acquired_blocks();
    unsafe { heap.deallocate(ptr, 10_000, 8) };

    let again = heap.allocate(10_000, 8).unwrap();
    assert_eq!(heap.block_source().acquired_blocks(), blocks);
    unsafe { heap.deallocate(again, 10_000, 8) };
}

#[test]
fn test_nested_schemas() {
    let parent = Arc::new(heap());
    let child = HphaSchema::new(Descriptor {
        sub_allocator: Some(parent.clone() as Arc<dyn AllocatorAllocate>),
        capacity: 1 << 20,
        ..Default::default()
    })
    .unwrap();

    assert!(child.sub_allocator().is_some());

    let ptr = child.allocate(300, 8).unwrap();
    assert!(parent.num_allocated_bytes() >= 4096);
    assert!(child.num_allocated_bytes() >= 300);

    unsafe { child.deallocate(ptr, 300, 8) };
    child.garbage_collect();
    assert_eq!(parent.num_allocated_bytes(), 0);
}

#[test]
fn test_nested_fixed_block_returned_on_drop() {
    let parent = Arc::new(heap());

    {
        let child = HphaSchema::new(Descriptor {
            sub_allocator: Some(parent.clone() as Arc<dyn AllocatorAllocate>),
            fixed_memory_block_byte_size: 128 * 1024,
            ..Default::default()
        })
        .unwrap();
        assert!(parent.num_allocated_bytes() >= 128 * 1024);

        let ptr = child.allocate(5_000, 8).unwrap();
        unsafe { child.deallocate(ptr, 5_000, 8) };
    }

    assert_eq!(parent.num_allocated_bytes(), 0);
}

#[test]
fn test_tracked_allocation() {
    let heap = HphaSchema::new(Descriptor {
        capacity: 64 * 1024,
        ..Default::default()
    })
    .unwrap();

    let record = hpha::AllocationRecord {
        name: Some("mesh buffer"),
        file_name: Some(file!()),
        line_num: line!(),
        ..Default::default()
    };

    let ptr = heap.allocate_tracked(128, 8, &record).unwrap();
    assert!(heap.allocate_tracked(1 << 20, 8, &record).is_none());
    unsafe { heap.deallocate(ptr, 128, 8) };
}
