use std::{ptr::NonNull, sync::Arc};

/// Allocate/deallocate contract shared by every heap schema.
///
/// Implementations report failure through `None`/`0` rather than panicking so
/// real-time callers can react without unwinding. A schema can be handed to
/// another one as its sub-allocator, which is how arenas are nested.
pub trait AllocatorAllocate: Send + Sync {
    /// Returns a block of at least `byte_size` bytes aligned to `alignment`,
    /// or `None` when the request cannot be satisfied.
    fn allocate(&self, byte_size: usize, alignment: usize) -> Option<NonNull<u8>>;

    /// Returns `ptr` to the allocator. `byte_size` and `alignment` are hints;
    /// pass `0` when unknown.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate`/`reallocate` on this allocator and must
    /// not have been released already.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, byte_size: usize, alignment: usize);

    /// Moves or resizes `ptr` to `new_size` bytes, preserving
    /// `min(old, new_size)` bytes of content.
    ///
    /// # Safety
    ///
    /// Same requirements as [`AllocatorAllocate::deallocate`] for `ptr`.
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        new_alignment: usize,
    ) -> Option<NonNull<u8>>;

    /// Grows or shrinks `ptr` without moving it and returns the size reached,
    /// which may be smaller than `new_size`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this allocator.
    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> usize;

    /// Usable size of a live allocation, `0` for pointers this allocator does
    /// not own.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this allocator or a foreign pointer
    /// that is never dereferenced.
    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize;

    fn num_allocated_bytes(&self) -> usize;

    fn capacity(&self) -> usize;

    fn max_allocation_size(&self) -> usize;

    fn unallocated_memory(&self, is_print: bool) -> usize;

    fn sub_allocator(&self) -> Option<&Arc<dyn AllocatorAllocate>> {
        None
    }

    fn garbage_collect(&self) {}
}
