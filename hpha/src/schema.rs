use std::{
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

#[cfg(feature = "memory_stats")]
use hpha_memory::{AllocatorCounters, AllocatorStats};
use hpha_memory::{AllocatorAllocate, BlockSource, BlockSourceDesc};

use crate::{
    Descriptor, HeapError, Result,
    general::GeneralAllocator,
    pool::PoolAllocator,
};

/// Alignment used when the caller passes `0`.
pub const DEFAULT_ALIGNMENT: usize = 8;

/// Caller-side context attached to a tracked allocation. Only used for
/// diagnostics when the allocation fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllocationRecord<'a> {
    pub flags: i32,
    pub name: Option<&'a str>,
    pub file_name: Option<&'a str>,
    pub line_num: u32,
    pub suppress_stack_record: bool,
}

/// High performance heap allocator schema.
///
/// Small requests go to per size class pools, everything else to a
/// boundary-tag general heap. Both draw their pages from one [`BlockSource`]
/// that enforces the capacity. The schema is `Send + Sync`; every entry point
/// takes `&self`.
///
/// ```
/// use hpha::{Descriptor, HphaSchema};
///
/// let heap = HphaSchema::new(Descriptor::default()).unwrap();
/// let ptr = heap.allocate(48, 16).unwrap();
/// assert!(unsafe { heap.allocation_size(ptr) } >= 48);
/// unsafe { heap.deallocate(ptr, 48, 16) };
/// ```
pub struct HphaSchema {
    pool: Option<PoolAllocator>,
    general: GeneralAllocator,
    source: Arc<BlockSource>,
    sub_allocator: Option<Arc<dyn AllocatorAllocate>>,
    allocated_bytes: AtomicUsize,
    #[cfg(feature = "memory_stats")]
    counters: AllocatorCounters,
}

#[inline]
fn effective_alignment(alignment: usize) -> Result<usize> {
    match alignment {
        0 => Ok(DEFAULT_ALIGNMENT),
        a if a.is_power_of_two() => Ok(a),
        a => Err(HeapError::InvalidAlignment(a)),
    }
}

impl HphaSchema {
    /// Builds a schema drawing pages from the system, the sub-allocator or a
    /// fixed block it acquires itself.
    ///
    /// A caller-owned `fixed_memory_block` needs
    /// [`HphaSchema::with_fixed_memory_block`].
    pub fn new(desc: Descriptor) -> Result<Self> {
        if desc.fixed_memory_block.is_some() {
            return Err(HeapError::InvalidDescriptor(
                "a caller-owned fixed memory block requires with_fixed_memory_block",
            ));
        }
        // SAFETY: there is no caller-owned memory to vouch for.
        unsafe { Self::build(desc) }
    }

    /// Builds a schema over the caller-owned `fixed_memory_block`.
    ///
    /// # Safety
    ///
    /// `desc.fixed_memory_block` must be valid for reads and writes of
    /// `desc.fixed_memory_block_byte_size` bytes, not be used by anything else
    /// and outlive the schema.
    pub unsafe fn with_fixed_memory_block(desc: Descriptor) -> Result<Self> {
        unsafe { Self::build(desc) }
    }

    unsafe fn build(desc: Descriptor) -> Result<Self> {
        desc.validate()?;

        // SAFETY: forwarded from the caller.
        let source = unsafe {
            BlockSource::new(BlockSourceDesc {
                block_alignment: desc.memory_block_alignment,
                chunk_size: desc.system_chunk_size(),
                capacity: desc.capacity,
                fixed_block: desc.fixed_memory_block,
                fixed_block_size: desc.fixed_memory_block_byte_size,
                sub_allocator: desc.sub_allocator.clone(),
            })
        }?;
        let source = Arc::new(source);

        let pool = desc
            .is_pool_allocations
            .then(|| PoolAllocator::new(desc.pool_page_size, Arc::clone(&source)));
        let general = GeneralAllocator::new(desc.page_size, Arc::clone(&source));

        log::debug!(
            "Heap schema: {:?} pages, capacity {} bytes, pooling {}",
            source.origin(),
            source.capacity(),
            if pool.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            pool,
            general,
            source,
            sub_allocator: desc.sub_allocator,
            allocated_bytes: AtomicUsize::new(0),
            #[cfg(feature = "memory_stats")]
            counters: AllocatorCounters::default(),
        })
    }

    /// Allocates `byte_size` bytes aligned to `alignment` (`0` for the default
    /// of 8). Returns `None` on failure.
    #[inline]
    pub fn allocate(&self, byte_size: usize, alignment: usize) -> Option<NonNull<u8>> {
        match self.try_allocate(byte_size, alignment) {
            Ok(ptr) => Some(ptr),
            Err(err) => {
                log::warn!("Failed to allocate {byte_size} bytes (alignment {alignment}): {err}");
                None
            }
        }
    }

    /// [`HphaSchema::allocate`] with caller context reported on failure.
    pub fn allocate_tracked(
        &self,
        byte_size: usize,
        alignment: usize,
        record: &AllocationRecord<'_>,
    ) -> Option<NonNull<u8>> {
        match self.try_allocate(byte_size, alignment) {
            Ok(ptr) => Some(ptr),
            Err(err) => {
                log::warn!(
                    "Failed to allocate {} bytes (alignment {}) for '{}' at {}:{} (flags {:#x}): {}",
                    byte_size,
                    alignment,
                    record.name.unwrap_or("<unnamed>"),
                    record.file_name.unwrap_or("<unknown>"),
                    record.line_num,
                    record.flags,
                    err
                );
                None
            }
        }
    }

    pub fn try_allocate(&self, byte_size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let result = self.allocate_inner(byte_size, alignment);

        match result {
            Ok((ptr, usable)) => {
                let _total = self.allocated_bytes.fetch_add(usable, Ordering::Relaxed) + usable;
                #[cfg(feature = "memory_stats")]
                self.counters.record_allocation(_total);
                Ok(ptr)
            }
            Err(err) => {
                #[cfg(feature = "memory_stats")]
                self.counters.record_failure();
                Err(err)
            }
        }
    }

    fn allocate_inner(&self, byte_size: usize, alignment: usize) -> Result<(NonNull<u8>, usize)> {
        let alignment = effective_alignment(alignment)?;
        let size = byte_size.max(1);

        let capacity = self.capacity();
        if size > capacity {
            return Err(HeapError::CapacityExceeded {
                requested: size,
                capacity,
            });
        }
        if alignment > capacity {
            return Err(HeapError::OutOfMemory);
        }

        if let Some(pool) = &self.pool {
            if let Some(index) = pool.class_for(size, alignment) {
                match pool.allocate(index) {
                    Ok(ptr) => return Ok((ptr, pool.unit_size(index))),
                    Err(err) => log::debug!(
                        "Pool class {} failed ({}), falling back to the general heap",
                        index,
                        err
                    ),
                }
            }
        }

        self.general.allocate(size, alignment)
    }

    /// Frees `ptr`. `byte_size` and `alignment` are hints, ownership is looked
    /// up from the pointer.
    ///
    /// Freeing a pointer twice or one this schema never returned panics in
    /// debug builds and is logged and ignored otherwise.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after this call.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, byte_size: usize, alignment: usize) {
        // SAFETY: forwarded from the caller.
        match unsafe { self.try_deallocate(ptr) } {
            Ok(freed) => debug_assert!(
                freed >= byte_size,
                "deallocation size hint {byte_size} (alignment {alignment}) exceeds block of {freed} bytes"
            ),
            Err(err) => {
                log::error!("Invalid deallocation of {ptr:p}: {err}");
                if cfg!(debug_assertions) {
                    panic!("invalid deallocation of {ptr:p}: {err}");
                }
            }
        }
    }

    /// Frees `ptr` and returns the usable size it had. Double and foreign frees
    /// are reported as errors and leave the heap untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after a successful call.
    pub unsafe fn try_deallocate(&self, ptr: NonNull<u8>) -> Result<usize> {
        let freed = match self.pool_bucket_of(ptr) {
            // SAFETY: forwarded from the caller.
            Some((pool, index)) => unsafe { pool.deallocate(index, ptr)? },
            None => unsafe { self.general.deallocate(ptr)? },
        };

        self.allocated_bytes.fetch_sub(freed, Ordering::Relaxed);
        #[cfg(feature = "memory_stats")]
        self.counters.record_deallocation();

        Ok(freed)
    }

    #[inline]
    fn pool_bucket_of(&self, ptr: NonNull<u8>) -> Option<(&PoolAllocator, usize)> {
        let pool = self.pool.as_ref()?;
        pool.bucket_of(ptr).map(|index| (pool, index))
    }

    #[inline]
    fn adjust_allocated(&self, old: usize, new: usize) {
        if new > old {
            self.allocated_bytes.fetch_add(new - old, Ordering::Relaxed);
        } else {
            self.allocated_bytes.fetch_sub(old - new, Ordering::Relaxed);
        }
    }

    /// Reallocates `ptr` to `new_size` bytes. `None` allocates, a zero size
    /// frees and returns `None`. On failure `ptr` stays valid and untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this schema and must not be used
    /// after a successful move.
    pub unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        new_alignment: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: forwarded from the caller.
        match unsafe { self.try_reallocate(ptr, new_size, new_alignment) } {
            Ok(ptr) => ptr,
            Err(err) => {
                log::warn!("Failed to reallocate {ptr:?} to {new_size} bytes: {err}");
                None
            }
        }
    }

    /// # Safety
    ///
    /// Same as [`HphaSchema::reallocate`].
    pub unsafe fn try_reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        new_alignment: usize,
    ) -> Result<Option<NonNull<u8>>> {
        let Some(ptr) = ptr else {
            return self.try_allocate(new_size, new_alignment).map(Some);
        };

        if new_size == 0 {
            // SAFETY: forwarded from the caller.
            unsafe { self.try_deallocate(ptr)? };
            return Ok(None);
        }

        let alignment = effective_alignment(new_alignment)?;

        let old_usable = match self.pool_bucket_of(ptr) {
            Some((pool, index)) => {
                let unit_size = pool.unit_size(index);
                if new_size <= unit_size && ptr.as_ptr().addr() % alignment == 0 {
                    return Ok(Some(ptr));
                }
                unit_size
            }
            None => {
                let old = self
                    .general
                    .allocation_size(ptr)
                    .ok_or(HeapError::InvalidPointer(ptr.as_ptr().addr()))?;

                // SAFETY: `ptr` is a live general allocation.
                if let Some(new) = unsafe { self.general.reallocate_in_place(ptr, new_size, alignment) } {
                    self.adjust_allocated(old, new);
                    return Ok(Some(ptr));
                }
                old
            }
        };

        let new_ptr = self.try_allocate(new_size, alignment)?;

        // SAFETY: both blocks are live, distinct and at least this large.
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                old_usable.min(new_size),
            );
            self.try_deallocate(ptr)?;
        }

        Ok(Some(new_ptr))
    }

    /// Grows or shrinks `ptr` without moving it. Returns the usable size
    /// reached, which may be below `new_size`; `0` for pointers this schema
    /// does not own.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this schema.
    pub unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> usize {
        if let Some((pool, index)) = self.pool_bucket_of(ptr) {
            return pool.unit_size(index);
        }

        // SAFETY: forwarded from the caller.
        match unsafe { self.general.resize(ptr, new_size) } {
            Ok((old, new)) => {
                self.adjust_allocated(old, new);
                new
            }
            Err(err) => {
                log::error!("Cannot resize {ptr:p}: {err}");
                0
            }
        }
    }

    /// Usable bytes of the allocation at `ptr`, `0` if this schema does not
    /// own it.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this schema or a pointer it does not
    /// own.
    pub unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        match self.pool_bucket_of(ptr) {
            Some((pool, index)) => pool.unit_size(index),
            None => self.general.allocation_size(ptr).unwrap_or(0),
        }
    }

    /// `true` if `ptr` points into one of this schema's pages.
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.pool_bucket_of(ptr).is_some() || self.general.owns(ptr)
    }

    /// Usable bytes held by live allocations.
    #[inline]
    pub fn num_allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.source.capacity()
    }

    /// Largest single request that can currently succeed: the largest free
    /// general block or the biggest page the remaining capacity can still
    /// provide.
    pub fn max_allocation_size(&self) -> usize {
        self.general
            .largest_free_block()
            .max(self.general.max_growth())
    }

    /// Free bytes inside the pages already acquired. With `is_print` a
    /// per-bucket and per-page breakdown is logged.
    pub fn unallocated_memory(&self, is_print: bool) -> usize {
        let pool_free = self.pool.as_ref().map_or(0, PoolAllocator::free_bytes);
        let general_free = self.general.free_bytes();

        if is_print {
            #[cfg(feature = "tracy")]
            let _span = tracy_client::span!("HphaSchema::unallocated_memory");

            log::info!(
                "Heap schema: {} bytes allocated, {} bytes acquired of {} capacity, {} bytes unallocated (pool {}, general {})",
                self.num_allocated_bytes(),
                self.source.acquired_bytes(),
                self.capacity(),
                pool_free + general_free,
                pool_free,
                general_free
            );
            if let Some(pool) = &self.pool {
                pool.report();
            }
            self.general.report();
        }

        pool_free + general_free
    }

    #[inline]
    pub fn sub_allocator(&self) -> Option<&Arc<dyn AllocatorAllocate>> {
        self.sub_allocator.as_ref()
    }

    /// Returns empty pages to the block source. Holds each bucket lock, then
    /// the general heap lock, for the duration of its scan.
    pub fn garbage_collect(&self) -> usize {
        let pool_released = self.pool.as_ref().map_or(0, PoolAllocator::garbage_collect);
        let general_released = self.general.garbage_collect();

        log::debug!(
            "Garbage collection released {} bytes (pool {}, general {})",
            pool_released + general_released,
            pool_released,
            general_released
        );

        pool_released + general_released
    }

    /// Page source shared by both allocators.
    #[inline]
    pub fn block_source(&self) -> &BlockSource {
        &self.source
    }

    /// Largest request the pools serve, `0` with pooling off.
    #[inline]
    pub fn max_pooled_size(&self) -> usize {
        self.pool.as_ref().map_or(0, PoolAllocator::max_size)
    }

    #[cfg(feature = "memory_stats")]
    pub fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats {
            allocated_bytes: self.num_allocated_bytes(),
            acquired_bytes: self.source.acquired_bytes(),
            pool_pages: self.pool.as_ref().map_or(0, PoolAllocator::page_count),
            general_pages: self.general.page_count(),
            capacity: self.capacity(),
            ..Default::default()
        };
        self.counters.snapshot(&mut stats);
        stats
    }
}

impl AllocatorAllocate for HphaSchema {
    #[inline]
    fn allocate(&self, byte_size: usize, alignment: usize) -> Option<NonNull<u8>> {
        HphaSchema::allocate(self, byte_size, alignment)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, byte_size: usize, alignment: usize) {
        unsafe { HphaSchema::deallocate(self, ptr, byte_size, alignment) }
    }

    #[inline]
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        new_alignment: usize,
    ) -> Option<NonNull<u8>> {
        unsafe { HphaSchema::reallocate(self, ptr, new_size, new_alignment) }
    }

    #[inline]
    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> usize {
        unsafe { HphaSchema::resize(self, ptr, new_size) }
    }

    #[inline]
    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { HphaSchema::allocation_size(self, ptr) }
    }

    fn num_allocated_bytes(&self) -> usize {
        HphaSchema::num_allocated_bytes(self)
    }

    fn capacity(&self) -> usize {
        HphaSchema::capacity(self)
    }

    fn max_allocation_size(&self) -> usize {
        HphaSchema::max_allocation_size(self)
    }

    fn unallocated_memory(&self, is_print: bool) -> usize {
        HphaSchema::unallocated_memory(self, is_print)
    }

    fn sub_allocator(&self) -> Option<&Arc<dyn AllocatorAllocate>> {
        HphaSchema::sub_allocator(self)
    }

    fn garbage_collect(&self) {
        HphaSchema::garbage_collect(self);
    }
}
