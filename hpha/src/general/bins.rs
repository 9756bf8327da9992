use super::tag::{Block, FreeLinks, HEADER_SIZE};

const BIN_COUNT: usize = usize::BITS as usize;

const _: () = assert!(BIN_COUNT <= u64::BITS as usize);

/// Power-of-two segregated free lists with a bitmap of the non-empty bins.
///
/// Bin `n` holds free blocks whose size lies in `[2^n, 2^(n+1))`.
pub struct FreeBins {
    heads: [Option<Block>; BIN_COUNT],
    non_empty: u64,
    free_bytes: usize,
    len: usize,
}

#[inline(always)]
fn bin_index(size: usize) -> usize {
    debug_assert!(size > 0);
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

impl FreeBins {
    pub const fn new() -> Self {
        Self {
            heads: [None; BIN_COUNT],
            non_empty: 0,
            free_bytes: 0,
            len: 0,
        }
    }

    /// Usable bytes held by free blocks.
    #[inline(always)]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// `block` must be a free block not already present in any bin.
    pub unsafe fn insert(&mut self, block: Block) {
        let size = unsafe { block.size() };
        let bin = bin_index(size);
        let head = self.heads[bin];

        unsafe {
            block.links().write(FreeLinks {
                next: head,
                prev: None,
            });
            if let Some(head) = head {
                (*head.links()).prev = Some(block);
            }
        }

        self.heads[bin] = Some(block);
        self.non_empty |= 1 << bin;
        self.free_bytes += size - HEADER_SIZE;
        self.len += 1;
    }

    /// # Safety
    ///
    /// `block` must be present in these bins with the size it was inserted
    /// with.
    pub unsafe fn remove(&mut self, block: Block) {
        let size = unsafe { block.size() };
        let bin = bin_index(size);
        let links = unsafe { block.links().read() };

        match links.prev {
            Some(prev) => unsafe { (*prev.links()).next = links.next },
            None => {
                debug_assert_eq!(self.heads[bin], Some(block));
                self.heads[bin] = links.next;
            }
        }
        if let Some(next) = links.next {
            unsafe { (*next.links()).prev = links.prev };
        }

        if self.heads[bin].is_none() {
            self.non_empty &= !(1 << bin);
        }
        self.free_bytes -= size - HEADER_SIZE;
        self.len -= 1;
    }

    /// First block, walking bins upwards from the one of `min_size`, for
    /// which `fit` returns an offset. Blocks too small for `min_size` are
    /// skipped without calling `fit`.
    ///
    /// # Safety
    ///
    /// Every linked block must be a valid free block.
    pub unsafe fn find(
        &self,
        min_size: usize,
        mut fit: impl FnMut(Block) -> Option<usize>,
    ) -> Option<(Block, usize)> {
        let mut candidates = self.non_empty & (u64::MAX << bin_index(min_size));

        while candidates != 0 {
            let bin = candidates.trailing_zeros() as usize;
            candidates &= candidates - 1;

            let mut cursor = self.heads[bin];
            while let Some(block) = cursor {
                unsafe {
                    if block.size() >= min_size {
                        if let Some(offset) = fit(block) {
                            return Some((block, offset));
                        }
                    }
                    cursor = (*block.links()).next;
                }
            }
        }

        None
    }

    /// Size of the largest free block, `0` if there is none.
    pub unsafe fn largest(&self) -> usize {
        if self.non_empty == 0 {
            return 0;
        }

        let bin = 63 - self.non_empty.leading_zeros() as usize;
        let mut largest = 0;
        let mut cursor = self.heads[bin];
        while let Some(block) = cursor {
            unsafe {
                largest = largest.max(block.size());
                cursor = (*block.links()).next;
            }
        }
        largest
    }
}
