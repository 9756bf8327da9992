//! General allocator: boundary-tagged blocks in variable sized pages with
//! segregated first-fit free lists, block splitting and immediate coalescing.
//!
//! Serves every request the pools don't: large sizes, large alignments and
//! the whole heap when pooling is disabled.

mod bins;
mod tag;

use std::{collections::BTreeMap, ptr::NonNull, sync::Arc};

use hpha_memory::{BlockSource, align::align_up};
use parking_lot::Mutex;

use crate::{HeapError, Result};
use bins::FreeBins;
use tag::{BLOCK_ALIGN, Block, HEADER_SIZE, MIN_BLOCK_SIZE, block_size_for, format_page};

/// Per-block bookkeeping of the general heap.
pub const GENERAL_OVERHEAD: usize = HEADER_SIZE;

struct GeneralState {
    bins: FreeBins,
    /// Page start -> page (and byte size).
    pages: BTreeMap<usize, (NonNull<u8>, usize)>,
}

// SAFETY: every pointer in the state refers to pages owned by this allocator;
// all access goes through the allocator mutex.
unsafe impl Send for GeneralState {}

impl GeneralState {
    fn owns(&self, addr: usize) -> bool {
        self.pages
            .range(..=addr)
            .next_back()
            .is_some_and(|(&start, &(_, size))| addr < start + size)
    }

    /// Header slot in front of `ptr` when `ptr` is 16 byte aligned and lies in
    /// one of our pages. Whether a block really starts there is up to the
    /// caller.
    fn block_of(&self, ptr: NonNull<u8>) -> Result<Block> {
        let addr = ptr.as_ptr().addr();
        if addr % BLOCK_ALIGN != 0 || !self.owns(addr.wrapping_sub(HEADER_SIZE)) {
            return Err(HeapError::InvalidPointer(addr));
        }
        // SAFETY: `ptr` lies inside one of our pages past its first header.
        Ok(unsafe { Block::from_payload(ptr) })
    }

    /// Takes `block` (already out of the bins) and trims it to `req` bytes
    /// starting `lead` bytes in. Leading and trailing leftovers return to the
    /// bins.
    unsafe fn carve(&mut self, block: Block, lead: usize, req: usize) -> Block {
        unsafe {
            let mut block = block;

            if lead > 0 {
                let size = block.size();
                let rest = block.offset(lead);
                rest.write(size - lead, false, lead);
                rest.next().set_prev_size(size - lead);
                block.set_size(lead, false);
                self.bins.insert(block);
                block = rest;
            }

            block.set_used(true);
            self.split(block, req);
            block
        }
    }

    /// Shrinks the used `block` to `keep` bytes if the tail is worth a block
    /// of its own. The tail is freed and merged with its successor.
    unsafe fn split(&mut self, block: Block, keep: usize) {
        unsafe {
            let size = block.size();
            if size < keep + MIN_BLOCK_SIZE {
                return;
            }

            let tail = block.offset(keep);
            tail.write(size - keep, true, keep);
            tail.next().set_prev_size(size - keep);
            block.set_size(keep, true);

            self.release(tail);
        }
    }

    /// Marks `block` free, merges it with free neighbours and bins the result.
    unsafe fn release(&mut self, block: Block) {
        unsafe {
            // Stays visible after a merge into `prev`; a second free sees it
            block.set_used(false);

            let mut start = block;
            let mut size = block.size();

            let next = block.next();
            if !next.is_used() {
                self.bins.remove(next);
                size += next.size();
            }

            if let Some(prev) = block.prev() {
                if !prev.is_used() {
                    self.bins.remove(prev);
                    size += prev.size();
                    start = prev;
                }
            }

            start.set_size(size, false);
            start.next().set_prev_size(size);
            self.bins.insert(start);
        }
    }

    /// Grows the used `block` by swallowing a free successor when the result
    /// reaches `req` bytes (or, with `partial`, any size at all).
    unsafe fn absorb_next(&mut self, block: Block, req: usize, partial: bool) -> bool {
        unsafe {
            let size = block.size();
            let next = block.next();
            if next.is_used() || (!partial && size + next.size() < req) {
                return false;
            }

            self.bins.remove(next);
            let merged = size + next.size();
            block.set_size(merged, true);
            block.next().set_prev_size(merged);
            true
        }
    }
}

/// Offset into `block` at which a payload aligned to `alignment` can start,
/// when a `req` byte block fits there. A non-zero offset is always large enough
/// to remain a free block.
unsafe fn fit(block: Block, req: usize, alignment: usize) -> Option<usize> {
    let size = unsafe { block.size() };

    if alignment <= BLOCK_ALIGN {
        return (size >= req).then_some(0);
    }

    let start = block.addr();
    let mut lead = align_up(start + HEADER_SIZE, alignment) - HEADER_SIZE - start;
    if lead != 0 && lead < MIN_BLOCK_SIZE {
        lead = align_up(start + HEADER_SIZE + MIN_BLOCK_SIZE, alignment) - HEADER_SIZE - start;
    }

    (lead.checked_add(req)? <= size).then_some(lead)
}

pub(crate) struct GeneralAllocator {
    state: Mutex<GeneralState>,
    page_size: usize,
    source: Arc<BlockSource>,
}

impl GeneralAllocator {
    pub fn new(page_size: usize, source: Arc<BlockSource>) -> Self {
        debug_assert_eq!(page_size % BLOCK_ALIGN, 0);

        Self {
            state: Mutex::new(GeneralState {
                bins: FreeBins::new(),
                pages: BTreeMap::new(),
            }),
            page_size,
            source,
        }
    }

    /// Allocates `size` bytes aligned to `alignment`. Returns the payload and
    /// its usable size.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<(NonNull<u8>, usize)> {
        let req = block_size_for(size).ok_or(HeapError::OutOfMemory)?;

        {
            let mut state = self.state.lock();
            // SAFETY: the bins only link free blocks of our pages.
            if let Some((block, lead)) = unsafe { state.bins.find(req, |b| fit(b, req, alignment)) } {
                unsafe {
                    state.bins.remove(block);
                    let block = state.carve(block, lead, req);
                    return Ok((block.payload(), block.usable_size()));
                }
            }
        }

        self.grow(req, alignment)
    }

    /// Acquires a page big enough for `req` at `alignment` (with no lock held)
    /// and serves the request from it.
    fn grow(&self, req: usize, alignment: usize) -> Result<(NonNull<u8>, usize)> {
        #[cfg(feature = "tracy")]
        let _span = tracy_client::span!("GeneralAllocator::grow");

        let padding = if alignment > BLOCK_ALIGN {
            alignment + MIN_BLOCK_SIZE
        } else {
            0
        };
        let needed = req
            .checked_add(padding)
            .and_then(|needed| needed.checked_add(HEADER_SIZE))
            .ok_or(HeapError::OutOfMemory)?;
        let page_size = self.page_size_for(needed)?;

        let base = self.source.acquire_block(page_size, BLOCK_ALIGN)?;

        log::debug!("General heap grew by {page_size} bytes at {base:p}");

        let mut state = self.state.lock();
        state.pages.insert(base.as_ptr().addr(), (base, page_size));

        // SAFETY: the page was just acquired for `page_size` bytes and is ours.
        unsafe {
            let first = format_page(base, page_size);
            match fit(first, req, alignment) {
                Some(lead) => {
                    let block = state.carve(first, lead, req);
                    Ok((block.payload(), block.usable_size()))
                }
                None => {
                    state.bins.insert(first);
                    Err(HeapError::OutOfMemory)
                }
            }
        }
    }

    /// Page size to acquire for `needed` bytes: at least a full page, or just
    /// the chunk-rounded need once the remaining capacity can't fit a page.
    fn page_size_for(&self, needed: usize) -> Result<usize> {
        let preferred = self
            .source
            .round_to_chunk(needed.max(self.page_size))
            .ok_or(HeapError::OutOfMemory)?;
        if preferred <= self.source.remaining() {
            return Ok(preferred);
        }

        self.source
            .round_to_chunk(needed)
            .ok_or(HeapError::OutOfMemory)
    }

    /// Largest request with alignment of at most 16 a fresh page could still
    /// serve.
    pub fn max_growth(&self) -> usize {
        let chunk = self.source.chunk_size();
        let growable = self.source.remaining() / chunk * chunk;
        growable.saturating_sub(2 * HEADER_SIZE)
    }

    /// Frees `ptr` and returns the usable size it had.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after a successful call.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<usize> {
        let mut state = self.state.lock();
        let block = state.block_of(ptr)?;

        unsafe {
            if !block.is_used() {
                return Err(HeapError::DoubleFree(ptr.as_ptr().addr()));
            }

            let usable = block.usable_size();
            state.release(block);
            Ok(usable)
        }
    }

    /// Resizes `ptr` in place to hold `new_size` bytes at `alignment`. Returns
    /// the new usable size, or `None` when the block has to move.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this allocator.
    pub unsafe fn reallocate_in_place(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        alignment: usize,
    ) -> Option<usize> {
        if ptr.as_ptr().addr() % alignment != 0 {
            return None;
        }
        let req = block_size_for(new_size)?;

        let mut state = self.state.lock();
        let block = state.block_of(ptr).ok()?;

        unsafe {
            debug_assert!(block.is_used());

            if block.size() < req && !state.absorb_next(block, req, false) {
                return None;
            }
            state.split(block, req);
            Some(block.usable_size())
        }
    }

    /// Best-effort in place resize. Returns `(old usable, new usable)`; the new
    /// size may fall short of `new_size` when the next block is in use.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this allocator.
    pub unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> Result<(usize, usize)> {
        let req = block_size_for(new_size).unwrap_or(usize::MAX & !(BLOCK_ALIGN - 1));

        let mut state = self.state.lock();
        let block = state.block_of(ptr)?;

        unsafe {
            let old = block.usable_size();
            if block.size() < req {
                state.absorb_next(block, req, true);
            }
            state.split(block, req.min(block.size()));
            Ok((old, block.usable_size()))
        }
    }

    /// Usable bytes of the allocation at `ptr`, `None` if it is not ours.
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let state = self.state.lock();
        let block = state.block_of(ptr).ok()?;
        // SAFETY: `block_of` checked the header lies in one of our pages.
        unsafe { block.is_used().then(|| block.usable_size()) }
    }

    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.state.lock().owns(ptr.as_ptr().addr())
    }

    /// Releases pages that hold a single free block. Returns the number of
    /// bytes released.
    pub fn garbage_collect(&self) -> usize {
        #[cfg(feature = "tracy")]
        let _span = tracy_client::span!("GeneralAllocator::garbage_collect");

        if !self.source.can_release() {
            return 0;
        }

        let empty = {
            let mut state = self.state.lock();

            let empty: Vec<_> = state
                .pages
                .values()
                .copied()
                .filter(|&(base, size)| {
                    let first = Block::at(base);
                    // SAFETY: every page starts with a valid header.
                    unsafe { !first.is_used() && first.size() == size - HEADER_SIZE }
                })
                .collect();

            for &(base, _) in &empty {
                state.pages.remove(&base.as_ptr().addr());
                // SAFETY: the page's only block is free and therefore binned.
                unsafe { state.bins.remove(Block::at(base)) };
            }

            empty
        };

        let mut released = 0;
        for (base, size) in empty {
            // SAFETY: the page is detached and holds no live allocation.
            unsafe { self.source.release_block(base, size, BLOCK_ALIGN) };
            released += size;
        }
        released
    }

    /// Usable size of the largest free block.
    pub fn largest_free_block(&self) -> usize {
        let state = self.state.lock();
        // SAFETY: the bins only link free blocks of our pages.
        unsafe { state.bins.largest().saturating_sub(HEADER_SIZE) }
    }

    pub fn free_bytes(&self) -> usize {
        self.state.lock().bins.free_bytes()
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Page to block walk, logged page by page.
    pub fn report(&self) {
        let state = self.state.lock();

        for &(base, size) in state.pages.values() {
            let (mut used, mut used_bytes, mut free, mut free_bytes) = (0, 0, 0, 0);

            // SAFETY: headers chain from the first block to the sentinel.
            unsafe {
                let mut block = Block::at(base);
                while !block.is_sentinel() {
                    if block.is_used() {
                        used += 1;
                        used_bytes += block.usable_size();
                    } else {
                        free += 1;
                        free_bytes += block.usable_size();
                    }
                    block = block.next();
                }
            }

            log::info!(
                "  general page {base:p} ({size} B): {used} used blocks ({used_bytes} B), {free} free blocks ({free_bytes} B)"
            );
        }
    }
}

impl Drop for GeneralAllocator {
    fn drop(&mut self) {
        if !self.source.can_release() {
            return;
        }

        let state = self.state.get_mut();
        for (_, (base, size)) in std::mem::take(&mut state.pages) {
            // SAFETY: the allocator is going away, nothing references its pages.
            unsafe { self.source.release_block(base, size, BLOCK_ALIGN) };
        }
        state.bins = FreeBins::new();
    }
}
