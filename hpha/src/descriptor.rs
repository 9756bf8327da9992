use std::{fmt, ptr::NonNull, sync::Arc};

use hpha_memory::{AllocatorAllocate, OS_PAGE_SIZE};

use crate::{HeapError, Result};

/// Largest capacity a schema accepts by default.
#[cfg(target_pointer_width = "64")]
pub const MAX_ALLOCATOR_SIZE: usize = 1 << 40;
#[cfg(not(target_pointer_width = "64"))]
pub const MAX_ALLOCATOR_SIZE: usize = 1 << 30;

/// Page sizes must be multiples of this.
pub const PAGE_SIZE_GRANULARITY: usize = 1024;

/// Configuration of a heap schema, captured once at construction.
///
/// By default pages come from the system allocator. A pre-allocated arena can
/// be supplied through `fixed_memory_block`, or requested through
/// `fixed_memory_block_byte_size` alone, in which case the schema acquires and
/// owns it.
#[derive(Clone)]
pub struct Descriptor {
    /// Alignment of every page requested from the block source.
    pub memory_block_alignment: usize,
    /// Unit of growth for the general heap, multiple of 1024 bytes.
    pub page_size: usize,
    /// Page size used for pooled small allocations. Power of two, less or
    /// equal to `page_size` and dividing it.
    pub pool_page_size: usize,
    /// Serve small requests from size-class pools.
    pub is_pool_allocations: bool,
    /// Size of the fixed memory block, `0` to grow on demand.
    pub fixed_memory_block_byte_size: usize,
    /// Caller-owned memory for the fixed block. When `None` and the size is
    /// non-zero, the block comes from `sub_allocator` or the system.
    pub fixed_memory_block: Option<NonNull<u8>>,
    /// Allocator pages (or the fixed block) are acquired from. Falls back to the
    /// system allocator when `None`.
    pub sub_allocator: Option<Arc<dyn AllocatorAllocate>>,
    /// Granularity of general heap growth, `0` means `page_size`.
    pub system_chunk_size: usize,
    /// Maximum number of bytes the schema may hold.
    pub capacity: usize,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            memory_block_alignment: OS_PAGE_SIZE,
            page_size: OS_PAGE_SIZE,
            pool_page_size: 4 * 1024,
            is_pool_allocations: true,
            fixed_memory_block_byte_size: 0,
            fixed_memory_block: None,
            sub_allocator: None,
            system_chunk_size: 0,
            capacity: MAX_ALLOCATOR_SIZE,
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("memory_block_alignment", &self.memory_block_alignment)
            .field("page_size", &self.page_size)
            .field("pool_page_size", &self.pool_page_size)
            .field("is_pool_allocations", &self.is_pool_allocations)
            .field(
                "fixed_memory_block_byte_size",
                &self.fixed_memory_block_byte_size,
            )
            .field("fixed_memory_block", &self.fixed_memory_block)
            .field("sub_allocator", &self.sub_allocator.is_some())
            .field("system_chunk_size", &self.system_chunk_size)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Descriptor {
    pub fn validate(&self) -> Result<()> {
        if !self.memory_block_alignment.is_power_of_two() {
            return Err(HeapError::InvalidDescriptor(
                "memory block alignment must be a power of two",
            ));
        }
        if self.page_size == 0 || self.page_size % PAGE_SIZE_GRANULARITY != 0 {
            return Err(HeapError::InvalidDescriptor(
                "page size must be a non-zero multiple of 1024 bytes",
            ));
        }
        if !self.pool_page_size.is_power_of_two() || self.pool_page_size < PAGE_SIZE_GRANULARITY {
            return Err(HeapError::InvalidDescriptor(
                "pool page size must be a power of two of at least 1024 bytes",
            ));
        }
        if self.pool_page_size > self.page_size || self.page_size % self.pool_page_size != 0 {
            return Err(HeapError::InvalidDescriptor(
                "page size must be a multiple of the pool page size",
            ));
        }
        if self.system_chunk_size % PAGE_SIZE_GRANULARITY != 0 {
            return Err(HeapError::InvalidDescriptor(
                "system chunk size must be a multiple of 1024 bytes",
            ));
        }
        if self.fixed_memory_block.is_some() && self.fixed_memory_block_byte_size == 0 {
            return Err(HeapError::InvalidDescriptor(
                "fixed memory block given without its size",
            ));
        }
        if self.capacity == 0 {
            return Err(HeapError::InvalidDescriptor("capacity must be non-zero"));
        }
        Ok(())
    }

    /// Effective chunk size for general heap growth.
    #[inline]
    pub fn system_chunk_size(&self) -> usize {
        if self.system_chunk_size == 0 {
            self.page_size
        } else {
            self.system_chunk_size
        }
    }
}
