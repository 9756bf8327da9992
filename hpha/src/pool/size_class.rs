use hpha_memory::align::align_up;

/// Step between consecutive pooled size classes.
pub const POOL_GRANULARITY: usize = 8;

/// Largest request the pools ever serve.
pub const POOL_MAX_ALLOCATION_SIZE: usize = 256;

/// Minimum number of slots a pool page must hold for the largest class.
const MIN_SLOTS_PER_PAGE: usize = 4;

/// Fixed progression of pooled size classes: 8, 16, 24, ... up to the pool
/// limit. Chosen once at construction.
#[derive(Debug, Clone, Copy)]
pub struct SizeClasses {
    max_size: usize,
}

impl SizeClasses {
    pub fn new(pool_page_size: usize) -> Self {
        let max_size = (pool_page_size / MIN_SLOTS_PER_PAGE)
            .min(POOL_MAX_ALLOCATION_SIZE)
            / POOL_GRANULARITY
            * POOL_GRANULARITY;

        Self { max_size }
    }

    #[inline(always)]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[inline(always)]
    pub fn count(&self) -> usize {
        self.max_size / POOL_GRANULARITY
    }

    /// Slot size needed for a request: at least one granule, rounded up to the
    /// alignment. Slots of that size in an aligned page are aligned too.
    #[inline(always)]
    pub fn slot_size_for(size: usize, alignment: usize) -> usize {
        align_up(size.max(1), alignment.max(POOL_GRANULARITY))
    }

    /// Class serving `size` bytes at `alignment`, if any. A request of exactly
    /// a class size lands in that class.
    #[inline]
    pub fn index_for(&self, size: usize, alignment: usize) -> Option<usize> {
        if size > self.max_size || alignment > self.max_size {
            return None;
        }

        let slot = Self::slot_size_for(size, alignment);
        if slot > self.max_size {
            return None;
        }

        Some(slot / POOL_GRANULARITY - 1)
    }

    #[inline(always)]
    pub fn unit_size(&self, index: usize) -> usize {
        debug_assert!(index < self.count());
        (index + 1) * POOL_GRANULARITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_progression() {
        let classes = SizeClasses::new(4096);
        assert_eq!(classes.max_size(), 256);
        assert_eq!(classes.count(), 32);
        assert_eq!(classes.unit_size(0), 8);
        assert_eq!(classes.unit_size(31), 256);
    }

    #[test]
    fn test_small_pages_limit_classes() {
        let classes = SizeClasses::new(1024);
        assert_eq!(classes.max_size(), 256);

        let classes = SizeClasses::new(512);
        assert_eq!(classes.max_size(), 128);
        assert_eq!(classes.index_for(129, 8), None);
    }

    #[test]
    fn test_boundaries_round_down_to_their_class() {
        let classes = SizeClasses::new(4096);

        for index in 0..classes.count() {
            let unit = classes.unit_size(index);
            assert_eq!(classes.index_for(unit, 8), Some(index));
            if unit < classes.max_size() {
                assert_eq!(classes.index_for(unit + 1, 8), Some(index + 1));
            }
        }
    }

    #[test]
    fn test_zero_and_tiny_requests() {
        let classes = SizeClasses::new(4096);
        assert_eq!(classes.index_for(0, 1), Some(0));
        assert_eq!(classes.index_for(1, 1), Some(0));
        assert_eq!(classes.index_for(9, 1), Some(1));
    }

    #[test]
    fn test_alignment_rounds_slot() {
        let classes = SizeClasses::new(4096);

        // 24 bytes at 16 byte alignment needs a 32 byte slot
        let index = classes.index_for(24, 16).unwrap();
        assert_eq!(classes.unit_size(index), 32);

        let index = classes.index_for(48, 64).unwrap();
        assert_eq!(classes.unit_size(index), 64);
        assert_eq!(classes.unit_size(index) % 64, 0);

        let index = classes.index_for(200, 128).unwrap();
        assert_eq!(classes.unit_size(index), 256);

        assert_eq!(classes.index_for(8, 512), None);
    }

    #[test]
    fn test_large_requests_are_not_pooled() {
        let classes = SizeClasses::new(4096);
        assert_eq!(classes.index_for(257, 8), None);
        assert_eq!(classes.index_for(10_000, 8), None);
    }
}
