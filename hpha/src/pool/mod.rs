//! Pool allocator: small requests served from pages split into equally sized
//! slots, one bucket (and one lock) per size class.

mod bucket;
mod size_class;

use std::{ptr::NonNull, sync::Arc};

use hpha_memory::BlockSource;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::Result;
use bucket::Bucket;
use size_class::SizeClasses;

pub use size_class::{POOL_GRANULARITY, POOL_MAX_ALLOCATION_SIZE};

pub(crate) struct PoolAllocator {
    classes: SizeClasses,
    page_size: usize,
    buckets: Box<[Bucket]>,
    /// Pool page base -> bucket index. Written only when pages come and go.
    page_table: RwLock<FxHashMap<usize, u32>>,
    source: Arc<BlockSource>,
}

impl PoolAllocator {
    pub fn new(page_size: usize, source: Arc<BlockSource>) -> Self {
        let classes = SizeClasses::new(page_size);
        let buckets = (0..classes.count())
            .map(|index| Bucket::new(classes.unit_size(index), page_size))
            .collect();

        log::debug!(
            "Pool allocator: {} size classes up to {} bytes, {} byte pages",
            classes.count(),
            classes.max_size(),
            page_size
        );

        Self {
            classes,
            page_size,
            buckets,
            page_table: RwLock::new(FxHashMap::default()),
            source,
        }
    }

    #[inline(always)]
    pub fn class_for(&self, size: usize, alignment: usize) -> Option<usize> {
        self.classes.index_for(size, alignment)
    }

    #[inline(always)]
    pub fn unit_size(&self, index: usize) -> usize {
        self.buckets[index].unit_size()
    }

    #[inline(always)]
    pub fn max_size(&self) -> usize {
        self.classes.max_size()
    }

    /// Allocates one slot of class `index`.
    ///
    /// A new page is acquired with no lock held. If another thread refilled
    /// the bucket in the meantime the fresh page is handed back to the source.
    pub fn allocate(&self, index: usize) -> Result<NonNull<u8>> {
        let bucket = &self.buckets[index];

        if let Some(slot) = bucket.lock().pop() {
            return Ok(slot);
        }

        #[cfg(feature = "tracy")]
        let _span = tracy_client::span!("PoolAllocator::grow");

        let page = self.source.acquire_block(self.page_size, self.page_size)?;

        let mut guard = bucket.lock();

        if self.source.can_release() {
            if let Some(slot) = guard.pop() {
                drop(guard);
                // SAFETY: the page was just acquired and never handed out.
                unsafe {
                    self.source
                        .release_block(page, self.page_size, self.page_size)
                };
                return Ok(slot);
            }
        }

        self.page_table
            .write()
            .insert(page.as_ptr().addr(), index as u32);

        log::debug!(
            "Pool bucket {} ({} bytes) grew by a page at {:p}",
            index,
            bucket.unit_size(),
            page
        );

        // SAFETY: the page is pool page sized and aligned and now belongs to the bucket.
        Ok(unsafe { guard.insert_page(page) })
    }

    /// Bucket owning `ptr`, if it lies in a pool page.
    #[inline]
    pub fn bucket_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let base = ptr.as_ptr().addr() & !(self.page_size - 1);
        self.page_table
            .read()
            .get(&base)
            .map(|&index| index as usize)
    }

    /// Returns `ptr` to bucket `index` and yields the slot size.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after a successful call.
    pub unsafe fn deallocate(&self, index: usize, ptr: NonNull<u8>) -> Result<usize> {
        let bucket = &self.buckets[index];
        // SAFETY: forwarded from the caller.
        unsafe { bucket.lock().push(ptr)? };
        Ok(bucket.unit_size())
    }

    /// Releases every page without live slots. Locks one bucket at a time for
    /// the full scan of its free list. Returns the number of bytes released.
    pub fn garbage_collect(&self) -> usize {
        #[cfg(feature = "tracy")]
        let _span = tracy_client::span!("PoolAllocator::garbage_collect");

        if !self.source.can_release() {
            return 0;
        }

        let mut released = 0;

        for bucket in self.buckets.iter() {
            let pages = {
                let mut guard = bucket.lock();
                let pages = guard.take_empty_pages();
                if !pages.is_empty() {
                    let mut table = self.page_table.write();
                    for page in &pages {
                        table.remove(&page.as_ptr().addr());
                    }
                }
                pages
            };

            for page in pages {
                // SAFETY: the page has no live slots and was detached from the bucket.
                unsafe {
                    self.source
                        .release_block(page, self.page_size, self.page_size)
                };
                released += self.page_size;
            }
        }

        released
    }

    pub fn free_bytes(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.lock().free_slots() * bucket.unit_size())
            .sum()
    }

    pub fn page_count(&self) -> usize {
        self.page_table.read().len()
    }

    pub fn report(&self) {
        for (index, bucket) in self.buckets.iter().enumerate() {
            let guard = bucket.lock();
            if guard.page_count() == 0 {
                continue;
            }
            log::info!(
                "  pool bucket {:>2} ({:>3} B): {} pages, {} live slots, {} free slots",
                index,
                bucket.unit_size(),
                guard.page_count(),
                guard.live_slots(),
                guard.free_slots()
            );
        }
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        if !self.source.can_release() {
            return;
        }

        for bucket in self.buckets.iter() {
            for page in bucket.lock().take_all_pages() {
                // SAFETY: the allocator is going away, nothing references its pages.
                unsafe {
                    self.source
                        .release_block(page, self.page_size, self.page_size)
                };
            }
        }
    }
}
