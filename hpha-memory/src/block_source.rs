use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{
    AllocatorAllocate, BlockError,
    align::{checked_align_up, round_up_to},
};

/// Construction parameters for a [`BlockSource`].
#[derive(Clone)]
pub struct BlockSourceDesc {
    /// Minimum alignment of every block handed out.
    pub block_alignment: usize,
    /// Granularity used by [`BlockSource::round_to_chunk`].
    pub chunk_size: usize,
    /// Ceiling on the bytes held at any time.
    pub capacity: usize,
    /// Caller-owned memory to carve blocks from. Requires `fixed_block_size`.
    pub fixed_block: Option<NonNull<u8>>,
    /// When non-zero without `fixed_block`, a block of this size is acquired
    /// up front (from `sub_allocator` or the system) and owned by the source.
    pub fixed_block_size: usize,
    pub sub_allocator: Option<Arc<dyn AllocatorAllocate>>,
}

/// Where the blocks of a [`BlockSource`] come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    Fixed,
    SubAllocator,
    System,
}

enum FixedOwner {
    Caller,
    SubAllocator(Arc<dyn AllocatorAllocate>),
    System(Layout),
}

struct FixedBlock {
    base: NonNull<u8>,
    size: usize,
    offset: AtomicUsize,
    owner: FixedOwner,
}

impl FixedBlock {
    fn carve(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, BlockError> {
        let base = self.base.as_ptr().addr();
        let mut start = 0;

        self.offset
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |offset| {
                let begin = checked_align_up(base + offset, alignment)? - base;
                let end = begin.checked_add(size)?;
                if end > self.size {
                    return None;
                }
                start = begin;
                Some(end)
            })
            .map_err(|_| BlockError::Exhausted)?;

        // SAFETY: `start + size <= self.size`, so the result stays inside the block.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) })
    }

    fn remaining(&self) -> usize {
        self.size - self.offset.load(Ordering::Acquire).min(self.size)
    }
}

enum Origin {
    Fixed(FixedBlock),
    SubAllocator(Arc<dyn AllocatorAllocate>),
    System,
}

/// Page/block source: produces raw aligned memory on demand and takes it back.
///
/// Every acquisition is reserved against the capacity before any memory is
/// touched, so concurrent callers can never push the total past the ceiling.
pub struct BlockSource {
    origin: Origin,
    block_alignment: usize,
    chunk_size: usize,
    capacity: usize,
    acquired_bytes: AtomicUsize,
    acquired_blocks: AtomicUsize,
    released_blocks: AtomicUsize,
}

// SAFETY: the only raw pointer is the base of the fixed block, which is never
// dereferenced by the source itself; carving is coordinated through atomics.
unsafe impl Send for BlockSource {}
unsafe impl Sync for BlockSource {}

impl BlockSource {
    /// Creates a source from `desc`.
    ///
    /// # Safety
    ///
    /// If `desc.fixed_block` is set it must be valid for reads and writes of
    /// `desc.fixed_block_size` bytes and outlive the source.
    pub unsafe fn new(desc: BlockSourceDesc) -> Result<Self, BlockError> {
        let block_alignment = desc.block_alignment.max(1);
        if !block_alignment.is_power_of_two() || desc.chunk_size == 0 {
            return Err(BlockError::InvalidLayout {
                size: desc.chunk_size,
                alignment: desc.block_alignment,
            });
        }

        let mut capacity = desc.capacity;

        let origin = if desc.fixed_block_size != 0 {
            let size = desc.fixed_block_size;
            let (base, owner) = match (desc.fixed_block, &desc.sub_allocator) {
                (Some(base), _) => (base, FixedOwner::Caller),
                (None, Some(sub)) => {
                    let base = sub
                        .allocate(size, block_alignment)
                        .ok_or(BlockError::SubAllocatorFailed(size))?;
                    (base, FixedOwner::SubAllocator(Arc::clone(sub)))
                }
                (None, None) => {
                    let layout = Layout::from_size_align(size, block_alignment).map_err(|_| {
                        BlockError::InvalidLayout {
                            size,
                            alignment: block_alignment,
                        }
                    })?;
                    // SAFETY: `size` is non-zero.
                    let base = NonNull::new(unsafe { std::alloc::alloc(layout) })
                        .ok_or(BlockError::SystemFailed(size))?;
                    (base, FixedOwner::System(layout))
                }
            };

            capacity = capacity.min(size);

            log::debug!(
                "Fixed memory block of {} bytes at {:p} ({})",
                size,
                base,
                match owner {
                    FixedOwner::Caller => "caller owned",
                    _ => "owned",
                }
            );

            Origin::Fixed(FixedBlock {
                base,
                size,
                offset: AtomicUsize::new(0),
                owner,
            })
        } else if desc.fixed_block.is_some() {
            return Err(BlockError::InvalidLayout {
                size: 0,
                alignment: block_alignment,
            });
        } else if let Some(sub) = desc.sub_allocator {
            Origin::SubAllocator(sub)
        } else {
            Origin::System
        };

        Ok(Self {
            origin,
            block_alignment,
            chunk_size: desc.chunk_size,
            capacity,
            acquired_bytes: AtomicUsize::new(0),
            acquired_blocks: AtomicUsize::new(0),
            released_blocks: AtomicUsize::new(0),
        })
    }

    /// Acquires `size` bytes aligned to at least `alignment` (and to the
    /// source's block alignment).
    pub fn acquire_block(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, BlockError> {
        #[cfg(feature = "tracy")]
        let _span = tracy_client::span!("BlockSource::acquire_block");

        let alignment = alignment.max(self.block_alignment);
        if size == 0 || !alignment.is_power_of_two() {
            return Err(BlockError::InvalidLayout { size, alignment });
        }

        self.reserve(size)?;

        let result = match &self.origin {
            Origin::Fixed(fixed) => fixed.carve(size, alignment),
            Origin::SubAllocator(sub) => sub
                .allocate(size, alignment)
                .ok_or(BlockError::SubAllocatorFailed(size)),
            Origin::System => Layout::from_size_align(size, alignment)
                .map_err(|_| BlockError::InvalidLayout { size, alignment })
                .and_then(|layout| {
                    // SAFETY: `size` is non-zero.
                    NonNull::new(unsafe { std::alloc::alloc(layout) })
                        .ok_or(BlockError::SystemFailed(size))
                }),
        };

        match result {
            Ok(block) => {
                self.acquired_blocks.fetch_add(1, Ordering::Relaxed);
                log::debug!("Acquired block of {size} bytes at {block:p}");
                Ok(block)
            }
            Err(err) => {
                self.acquired_bytes.fetch_sub(size, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    /// Returns a block obtained from [`BlockSource::acquire_block`].
    ///
    /// Blocks carved from a fixed memory block are never handed back; the
    /// memory is reclaimed only when the source is dropped.
    ///
    /// # Safety
    ///
    /// `block` must come from `acquire_block` on this source with the same
    /// `size` and `alignment`, and must not be used afterwards.
    pub unsafe fn release_block(&self, block: NonNull<u8>, size: usize, alignment: usize) {
        let alignment = alignment.max(self.block_alignment);

        match &self.origin {
            Origin::Fixed(_) => return,
            // SAFETY: caller guarantees the block came from this sub-allocator.
            Origin::SubAllocator(sub) => unsafe { sub.deallocate(block, size, alignment) },
            Origin::System => {
                // SAFETY: caller guarantees size/alignment match the acquisition.
                unsafe {
                    let layout = Layout::from_size_align_unchecked(size, alignment);
                    std::alloc::dealloc(block.as_ptr(), layout);
                }
            }
        }

        self.acquired_bytes.fetch_sub(size, Ordering::AcqRel);
        self.released_blocks.fetch_add(1, Ordering::Relaxed);

        log::debug!("Released block of {size} bytes at {block:p}");
    }

    fn reserve(&self, size: usize) -> Result<(), BlockError> {
        self.acquired_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(size).filter(|&total| total <= self.capacity)
            })
            .map(|_| ())
            .map_err(|_| BlockError::CapacityExceeded {
                requested: size,
                capacity: self.capacity,
            })
    }

    /// Rounds `size` up to the configured chunk granularity.
    #[inline]
    pub fn round_to_chunk(&self, size: usize) -> Option<usize> {
        round_up_to(size, self.chunk_size)
    }

    /// `false` when blocks are carved from a fixed memory block.
    #[inline]
    pub fn can_release(&self) -> bool {
        !matches!(self.origin, Origin::Fixed(_))
    }

    pub fn origin(&self) -> BlockOrigin {
        match self.origin {
            Origin::Fixed(_) => BlockOrigin::Fixed,
            Origin::SubAllocator(_) => BlockOrigin::SubAllocator,
            Origin::System => BlockOrigin::System,
        }
    }

    #[inline]
    pub fn block_alignment(&self) -> usize {
        self.block_alignment
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn acquired_bytes(&self) -> usize {
        self.acquired_bytes.load(Ordering::Acquire)
    }

    /// Number of successful acquisitions over the lifetime of the source.
    #[inline]
    pub fn acquired_blocks(&self) -> usize {
        self.acquired_blocks.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn released_blocks(&self) -> usize {
        self.released_blocks.load(Ordering::Relaxed)
    }

    /// Bytes that can still be acquired before hitting the capacity or the end
    /// of the fixed block.
    pub fn remaining(&self) -> usize {
        let by_capacity = self.capacity.saturating_sub(self.acquired_bytes());
        match &self.origin {
            Origin::Fixed(fixed) => by_capacity.min(fixed.remaining()),
            _ => by_capacity,
        }
    }
}

impl Drop for BlockSource {
    fn drop(&mut self) {
        let Origin::Fixed(fixed) = &self.origin else {
            return;
        };

        match &fixed.owner {
            FixedOwner::Caller => {}
            // SAFETY: the block was acquired from `sub` in `new` with these parameters.
            FixedOwner::SubAllocator(sub) => unsafe {
                sub.deallocate(fixed.base, fixed.size, self.block_alignment)
            },
            // SAFETY: the block was allocated with `layout` in `new`.
            FixedOwner::System(layout) => unsafe {
                std::alloc::dealloc(fixed.base.as_ptr(), *layout)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system_desc(capacity: usize) -> BlockSourceDesc {
        BlockSourceDesc {
            block_alignment: 4096,
            chunk_size: 4096,
            capacity,
            fixed_block: None,
            fixed_block_size: 0,
            sub_allocator: None,
        }
    }

    #[test]
    fn test_system_acquire_release() {
        let source = unsafe { BlockSource::new(system_desc(1 << 20)) }.unwrap();
        assert_eq!(source.origin(), BlockOrigin::System);

        let block = source.acquire_block(8192, 4096).unwrap();
        assert_eq!(block.as_ptr().addr() % 4096, 0);
        assert_eq!(source.acquired_bytes(), 8192);
        assert_eq!(source.acquired_blocks(), 1);

        unsafe {
            block.as_ptr().write_bytes(0xAB, 8192);
            source.release_block(block, 8192, 4096);
        }

        assert_eq!(source.acquired_bytes(), 0);
        assert_eq!(source.released_blocks(), 1);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let source = unsafe { BlockSource::new(system_desc(8192)) }.unwrap();

        let first = source.acquire_block(4096, 4096).unwrap();
        let second = source.acquire_block(4096, 4096).unwrap();
        let third = source.acquire_block(4096, 4096);

        assert!(matches!(third, Err(BlockError::CapacityExceeded { .. })));
        assert_eq!(source.acquired_bytes(), 8192);
        assert_eq!(source.remaining(), 0);

        unsafe {
            source.release_block(first, 4096, 4096);
            source.release_block(second, 4096, 4096);
        }
        assert_eq!(source.remaining(), 8192);
    }

    #[repr(C, align(4096))]
    struct Arena<const N: usize>([u8; N]);

    #[test]
    fn test_fixed_block_bump_and_exhaustion() {
        let mut buffer = Box::new(Arena([0u8; 16 * 1024]));
        let desc = BlockSourceDesc {
            block_alignment: 16,
            chunk_size: 1024,
            capacity: usize::MAX,
            fixed_block: NonNull::new(buffer.0.as_mut_ptr()),
            fixed_block_size: buffer.0.len(),
            sub_allocator: None,
        };
        let source = unsafe { BlockSource::new(desc) }.unwrap();

        assert_eq!(source.origin(), BlockOrigin::Fixed);
        assert_eq!(source.capacity(), 16 * 1024);
        assert!(!source.can_release());

        let a = source.acquire_block(1024, 16).unwrap();
        let b = source.acquire_block(1024, 16).unwrap();
        assert!(b.as_ptr().addr() >= a.as_ptr().addr() + 1024);

        let range = buffer.0.as_ptr_range();
        assert!(range.contains(&(a.as_ptr() as *const u8)));
        assert!(range.contains(&(b.as_ptr() as *const u8)));

        let mut acquired = 2;
        while source.acquire_block(1024, 16).is_ok() {
            acquired += 1;
        }
        assert_eq!(acquired, 16);
        assert!(source.acquire_block(16, 16).is_err());
    }

    #[test]
    fn test_fixed_block_failed_carve_returns_reservation() {
        let mut buffer = vec![0u8; 4096];
        let desc = BlockSourceDesc {
            block_alignment: 16,
            chunk_size: 1024,
            capacity: usize::MAX,
            fixed_block: NonNull::new(buffer.as_mut_ptr()),
            fixed_block_size: buffer.len(),
            sub_allocator: None,
        };
        let source = unsafe { BlockSource::new(desc) }.unwrap();

        // Alignment padding makes this carve fail even though capacity allows it.
        let _first = source.acquire_block(100, 16).unwrap();
        assert!(source.acquire_block(4096 - 100, 2048).is_err());
        assert_eq!(source.acquired_bytes(), 100);
    }

    #[test]
    fn test_owned_fixed_block() {
        let desc = BlockSourceDesc {
            fixed_block_size: 64 * 1024,
            ..system_desc(usize::MAX)
        };
        let source = unsafe { BlockSource::new(desc) }.unwrap();

        assert_eq!(source.origin(), BlockOrigin::Fixed);
        assert_eq!(source.capacity(), 64 * 1024);

        let block = source.acquire_block(4096, 4096).unwrap();
        assert_eq!(block.as_ptr().addr() % 4096, 0);
    }

    #[test]
    fn test_round_to_chunk() {
        let desc = BlockSourceDesc {
            chunk_size: 64 * 1024,
            ..system_desc(usize::MAX)
        };
        let source = unsafe { BlockSource::new(desc) }.unwrap();

        assert_eq!(source.round_to_chunk(1), Some(64 * 1024));
        assert_eq!(source.round_to_chunk(64 * 1024), Some(64 * 1024));
        assert_eq!(source.round_to_chunk(64 * 1024 + 1), Some(128 * 1024));
    }

    #[test]
    fn test_invalid_layouts() {
        let source = unsafe { BlockSource::new(system_desc(usize::MAX)) }.unwrap();
        assert!(matches!(
            source.acquire_block(0, 16),
            Err(BlockError::InvalidLayout { .. })
        ));

        let desc = BlockSourceDesc {
            block_alignment: 48,
            ..system_desc(usize::MAX)
        };
        assert!(unsafe { BlockSource::new(desc) }.is_err());
    }
}
