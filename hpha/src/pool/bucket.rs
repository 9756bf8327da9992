use std::ptr::NonNull;

use hpha_memory::FreeSlotList;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{HeapError, Result};

/// Bookkeeping of one pool page: live slot count and an occupancy bitmap used
/// to catch double frees.
struct PoolPage {
    base: NonNull<u8>,
    live: u32,
    occupied: Box<[u64]>,
}

impl PoolPage {
    fn new(base: NonNull<u8>, slots: usize) -> Self {
        Self {
            base,
            live: 0,
            occupied: vec![0; slots.div_ceil(64)].into_boxed_slice(),
        }
    }

    #[inline(always)]
    fn set(&mut self, slot: usize) -> bool {
        let (word, bit) = (slot / 64, 1u64 << (slot % 64));
        let was_free = self.occupied[word] & bit == 0;
        self.occupied[word] |= bit;
        was_free
    }

    #[inline(always)]
    fn clear(&mut self, slot: usize) -> bool {
        let (word, bit) = (slot / 64, 1u64 << (slot % 64));
        let was_used = self.occupied[word] & bit != 0;
        self.occupied[word] &= !bit;
        was_used
    }
}

pub(crate) struct BucketState {
    free: FreeSlotList,
    pages: FxHashMap<usize, PoolPage>,
}

// SAFETY: page bases and free slots point into pages owned by this bucket;
// all access goes through the bucket mutex.
unsafe impl Send for BucketState {}

/// One pooled size class: its pages and the free slots spread over them.
pub(crate) struct Bucket {
    unit_size: usize,
    page_size: usize,
    slots_per_page: usize,
    state: Mutex<BucketState>,
}

impl Bucket {
    pub fn new(unit_size: usize, page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(unit_size >= FreeSlotList::min_slot_size());

        Self {
            unit_size,
            page_size,
            slots_per_page: page_size / unit_size,
            state: Mutex::new(BucketState {
                free: FreeSlotList::new(),
                pages: FxHashMap::default(),
            }),
        }
    }

    #[inline(always)]
    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    #[inline(always)]
    pub fn lock(&self) -> BucketGuard<'_> {
        BucketGuard {
            bucket: self,
            state: self.state.lock(),
        }
    }
}

/// Locked view of a bucket.
pub(crate) struct BucketGuard<'a> {
    bucket: &'a Bucket,
    state: MutexGuard<'a, BucketState>,
}

impl BucketGuard<'_> {
    #[inline(always)]
    fn page_base(&self, addr: usize) -> usize {
        addr & !(self.bucket.page_size - 1)
    }

    #[inline(always)]
    fn slot_index(&self, addr: usize, base: usize) -> Option<usize> {
        let offset = addr - base;
        let index = offset / self.bucket.unit_size;
        (offset % self.bucket.unit_size == 0 && index < self.bucket.slots_per_page).then_some(index)
    }

    /// Pops a free slot, O(1).
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let slot = self.state.free.pop()?;
        let addr = slot.as_ptr().addr();
        let base = self.page_base(addr);
        let index = self.slot_index(addr, base);

        let page = self
            .state
            .pages
            .get_mut(&base)
            .expect("free slot outside of the bucket's pages");
        let index = index.expect("misaligned free slot");

        let was_free = page.set(index);
        debug_assert!(was_free, "free slot {slot:p} was marked as used");
        page.live += 1;

        Some(slot)
    }

    /// Carves a fresh page into slots and returns the first one.
    ///
    /// # Safety
    ///
    /// `page` must be `page_size` bytes, aligned to `page_size` and exclusively
    /// owned by this bucket from now on.
    pub unsafe fn insert_page(&mut self, page: NonNull<u8>) -> NonNull<u8> {
        let base = page.as_ptr().addr();
        debug_assert_eq!(base & (self.bucket.page_size - 1), 0);

        let mut pool_page = PoolPage::new(page, self.bucket.slots_per_page);
        pool_page.set(0);
        pool_page.live = 1;

        self.state.pages.insert(base, pool_page);

        // SAFETY: caller hands over the whole page.
        unsafe {
            self.state
                .free
                .carve(page, self.bucket.page_size, self.bucket.unit_size)
        }
    }

    /// Returns a slot to the free list.
    ///
    /// # Safety
    ///
    /// If `slot` is a live slot of this bucket it must not be used afterwards.
    pub unsafe fn push(&mut self, slot: NonNull<u8>) -> Result<()> {
        let addr = slot.as_ptr().addr();
        let base = self.page_base(addr);
        let index = self
            .slot_index(addr, base)
            .ok_or(HeapError::InvalidPointer(addr))?;

        let page = self
            .state
            .pages
            .get_mut(&base)
            .ok_or(HeapError::InvalidPointer(addr))?;

        if !page.clear(index) {
            return Err(HeapError::DoubleFree(addr));
        }
        page.live -= 1;

        // SAFETY: the slot was live and is now owned by the free list.
        unsafe { self.state.free.push(slot) };

        Ok(())
    }

    /// Detaches every page without live slots and returns their bases.
    pub fn take_empty_pages(&mut self) -> Vec<NonNull<u8>> {
        let empty: FxHashSet<usize> = self
            .state
            .pages
            .iter()
            .filter(|(_, page)| page.live == 0)
            .map(|(&base, _)| base)
            .collect();

        if empty.is_empty() {
            return Vec::new();
        }

        let mask = !(self.bucket.page_size - 1);
        let removed = self
            .state
            .free
            .retain(|slot| !empty.contains(&(slot.as_ptr().addr() & mask)));
        debug_assert_eq!(removed, empty.len() * self.bucket.slots_per_page);

        empty
            .iter()
            .filter_map(|base| self.state.pages.remove(base))
            .map(|page| page.base)
            .collect()
    }

    /// Detaches every page, live or not.
    pub fn take_all_pages(&mut self) -> Vec<NonNull<u8>> {
        self.state.free = FreeSlotList::new();
        self.state.pages.drain().map(|(_, page)| page.base).collect()
    }

    #[inline]
    pub fn free_slots(&self) -> usize {
        self.state.free.len()
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.state.pages.len()
    }

    #[inline]
    pub fn live_slots(&self) -> usize {
        self.state.pages.values().map(|page| page.live as usize).sum()
    }
}
