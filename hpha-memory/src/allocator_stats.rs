use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub allocations: usize,
    pub deallocations: usize,
    pub failed_allocations: usize,
    pub allocated_bytes: usize,
    pub peak_allocated_bytes: usize,
    pub acquired_bytes: usize,
    pub pool_pages: usize,
    pub general_pages: usize,
    pub capacity: usize,
}

/// Lock-free counters behind [`AllocatorStats`].
#[derive(Debug, Default)]
pub struct AllocatorCounters {
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    failed_allocations: AtomicUsize,
    peak_allocated_bytes: AtomicUsize,
}

impl AllocatorCounters {
    #[inline]
    pub fn record_allocation(&self, allocated_bytes: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.peak_allocated_bytes
            .fetch_max(allocated_bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_deallocation(&self) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failure(&self) {
        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Fills the counter fields of `stats`; gauges are left to the caller.
    pub fn snapshot(&self, stats: &mut AllocatorStats) {
        stats.allocations = self.allocations.load(Ordering::Relaxed);
        stats.deallocations = self.deallocations.load(Ordering::Relaxed);
        stats.failed_allocations = self.failed_allocations.load(Ordering::Relaxed);
        stats.peak_allocated_bytes = self.peak_allocated_bytes.load(Ordering::Relaxed);
    }
}
