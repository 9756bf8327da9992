use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Instant,
};

use hpha::{Descriptor, HphaSchema};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{Rng, SeedableRng, rngs::SmallRng};

const MAX_LIVE_PER_THREAD: usize = 4_096;

struct Live {
    ptr: NonNull<u8>,
    size: usize,
    pattern: u8,
}

#[derive(Default)]
struct Totals {
    allocations: AtomicUsize,
    failures: AtomicUsize,
    corruptions: AtomicUsize,
}

fn parse_arg(index: usize, default: Option<usize>) -> usize {
    match std::env::args().nth(index) {
        Some(value) => value.parse().unwrap_or_else(|_| {
            eprintln!("Invalid number: {value}");
            std::process::exit(1);
        }),
        None => default.unwrap_or_else(|| {
            eprintln!("Missing argument #{index}");
            std::process::exit(1);
        }),
    }
}

fn verify(entry: &Live) -> bool {
    // SAFETY: the block is live and was filled with `size` bytes of the pattern.
    let bytes = unsafe { std::slice::from_raw_parts(entry.ptr.as_ptr(), entry.size) };
    match bytes.iter().position(|&b| b != entry.pattern) {
        Some(offset) => {
            log::error!(
                "Block at {:p} ({} bytes) corrupted at offset {}: {:#04x} != {:#04x}",
                entry.ptr,
                entry.size,
                offset,
                bytes[offset],
                entry.pattern
            );
            false
        }
        None => true,
    }
}

fn worker(heap: &HphaSchema, seed: u64, iterations: usize, totals: &Totals, progress: &ProgressBar) {
    #[cfg(feature = "tracy")]
    let _span = tracy_client::span!("worker");

    let mut rng = SmallRng::seed_from_u64(seed);
    let mut live: Vec<Live> = Vec::with_capacity(MAX_LIVE_PER_THREAD);

    for i in 0..iterations {
        let roll = rng.random_range(0..100);

        if live.len() < MAX_LIVE_PER_THREAD && (roll < 55 || live.is_empty()) {
            let size = match rng.random_range(0..10) {
                0 => rng.random_range(4_097..256 * 1024),
                1..=2 => rng.random_range(257..=4_096),
                _ => rng.random_range(1..=256),
            };
            let alignment = 1 << rng.random_range(0..7);

            match heap.allocate(size, alignment) {
                Some(ptr) => {
                    let pattern = (seed as u8) ^ (i as u8);
                    // SAFETY: fresh allocation of at least `size` bytes.
                    unsafe { ptr.as_ptr().write_bytes(pattern, size) };
                    live.push(Live { ptr, size, pattern });
                    totals.allocations.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    totals.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else if roll < 85 {
            let entry = live.swap_remove(rng.random_range(0..live.len()));
            if !verify(&entry) {
                totals.corruptions.fetch_add(1, Ordering::Relaxed);
            }
            // SAFETY: the block is live and dropped from the list.
            unsafe { heap.deallocate(entry.ptr, entry.size, 0) };
        } else {
            let index = rng.random_range(0..live.len());
            let new_size = rng.random_range(1..16 * 1024);
            let entry = &mut live[index];
            if !verify(entry) {
                totals.corruptions.fetch_add(1, Ordering::Relaxed);
            }

            // SAFETY: the block is live; on success the old pointer is replaced.
            if let Some(ptr) = unsafe { heap.reallocate(Some(entry.ptr), new_size, 0) } {
                let kept = entry.size.min(new_size);
                entry.ptr = ptr;
                entry.size = kept;
            } else {
                totals.failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        if i % 1_024 == 0 {
            progress.inc(1_024usize.min(iterations - i) as u64);
        }
    }

    for entry in live {
        if !verify(&entry) {
            totals.corruptions.fetch_add(1, Ordering::Relaxed);
        }
        // SAFETY: last use of the block.
        unsafe { heap.deallocate(entry.ptr, entry.size, 0) };
    }
}

fn main() {
    if std::env::args().len() < 3 {
        eprintln!(
            "Usage: {} <threads> <iterations> [capacity_mib]",
            std::env::args().next().unwrap_or_else(|| "hpha-stress".into())
        );
        std::process::exit(1);
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let threads = parse_arg(1, None).max(1);
    let iterations = parse_arg(2, None);
    let capacity_mib = parse_arg(3, Some(1024));

    let heap = match HphaSchema::new(Descriptor {
        capacity: capacity_mib << 20,
        ..Default::default()
    }) {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("Cannot create heap: {err}");
            std::process::exit(1);
        }
    };

    println!(
        "Stressing heap: {threads} threads x {} iterations, capacity {}",
        humanize_bytes::humanize_quantity!(iterations),
        humanize_bytes::humanize_bytes_binary!(heap.capacity())
    );

    let progress = ProgressBar::new((threads * iterations) as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
    ) {
        progress.set_style(style.progress_chars("#>-"));
    }

    let totals = Totals::default();
    let now = Instant::now();

    thread::scope(|scope| {
        for seed in 0..threads as u64 {
            let (heap, totals, progress) = (&heap, &totals, &progress);
            scope.spawn(move || worker(heap, seed, iterations, totals, progress));
        }
    });

    progress.finish_and_clear();
    let elapsed = now.elapsed();

    let stats = heap.stats();
    let unallocated = heap.unallocated_memory(false);
    let released = heap.garbage_collect();
    let failures = totals.failures.load(Ordering::Relaxed);

    println!("Finished in {elapsed:?}");
    println!(
        " Allocations: {} ({} failed)",
        humanize_bytes::humanize_quantity!(totals.allocations.load(Ordering::Relaxed)),
        failures
    );
    println!(
        " Peak allocated: {}",
        humanize_bytes::humanize_bytes_binary!(stats.peak_allocated_bytes)
    );
    println!(
        " Acquired: {} in {} pool and {} general pages",
        humanize_bytes::humanize_bytes_binary!(stats.acquired_bytes),
        stats.pool_pages,
        stats.general_pages
    );
    println!(
        " Unallocated before collection: {}",
        humanize_bytes::humanize_bytes_binary!(unallocated)
    );
    println!(
        " Released by garbage collection: {}",
        humanize_bytes::humanize_bytes_binary!(released)
    );

    if failures != 0 {
        log::warn!("{failures} allocation requests failed");
    }

    let corruptions = totals.corruptions.load(Ordering::Relaxed);
    if corruptions != 0 || heap.num_allocated_bytes() != 0 {
        log::error!(
            "FAILED: {corruptions} corrupted blocks, {} bytes still allocated",
            heap.num_allocated_bytes()
        );
        std::process::exit(2);
    }

    println!("OK");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_detects_corruption() {
        let mut buffer = vec![0x5Au8; 64];
        let entry = Live {
            ptr: NonNull::new(buffer.as_mut_ptr()).unwrap(),
            size: buffer.len(),
            pattern: 0x5A,
        };
        assert!(verify(&entry));

        buffer[17] = 0;
        let entry = Live {
            ptr: NonNull::new(buffer.as_mut_ptr()).unwrap(),
            ..entry
        };
        assert!(!verify(&entry));
    }
}
