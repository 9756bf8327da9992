//! Boundary tags of the general heap.
//!
//! Every block starts with a 16 byte [`BlockHeader`] holding its own size
//! (low bit: in use) and the size of the physically previous block (`0` for
//! the first block of a page). Free blocks keep their free-list links right
//! after the header. Each page ends with a zero-sized, in-use sentinel.
//!
//! ```text
//! | hdr | payload ... | hdr | links ...  free | hdr | payload ... | hdr(0) |
//! ```

use std::ptr::NonNull;

pub const BLOCK_ALIGN: usize = 16;
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + BLOCK_ALIGN;

const USED: usize = 1;

const _: () = assert!(HEADER_SIZE == BLOCK_ALIGN);
const _: () = assert!(MIN_BLOCK_SIZE >= HEADER_SIZE + size_of::<FreeLinks>());

#[repr(C, align(16))]
pub struct BlockHeader {
    size: usize,
    prev_size: usize,
}

#[repr(C)]
pub struct FreeLinks {
    pub next: Option<Block>,
    pub prev: Option<Block>,
}

/// Handle to a block header inside a general page. Copyable and non-owning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block(NonNull<BlockHeader>);

/// Block size (header included) needed to serve `size` payload bytes.
#[inline]
pub const fn block_size_for(size: usize) -> Option<usize> {
    let Some(total) = size.checked_add(HEADER_SIZE + BLOCK_ALIGN - 1) else {
        return None;
    };
    let total = total & !(BLOCK_ALIGN - 1);
    Some(if total < MIN_BLOCK_SIZE {
        MIN_BLOCK_SIZE
    } else {
        total
    })
}

impl Block {
    #[inline(always)]
    pub fn at(ptr: NonNull<u8>) -> Self {
        debug_assert_eq!(ptr.as_ptr().addr() % BLOCK_ALIGN, 0);
        Self(ptr.cast())
    }

    /// # Safety
    ///
    /// `payload` must have been produced by [`Block::payload`].
    #[inline(always)]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self(unsafe { payload.byte_sub(HEADER_SIZE) }.cast())
    }

    #[inline(always)]
    pub fn payload(self) -> NonNull<u8> {
        // SAFETY: every block is at least `MIN_BLOCK_SIZE` bytes.
        unsafe { self.0.cast::<u8>().add(HEADER_SIZE) }
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0.as_ptr().addr()
    }

    #[inline(always)]
    pub fn as_ptr(self) -> NonNull<u8> {
        self.0.cast()
    }

    /// # Safety
    ///
    /// `offset` must stay inside the page of this block.
    #[inline(always)]
    pub unsafe fn offset(self, offset: usize) -> Self {
        Self(unsafe { self.0.byte_add(offset) })
    }

    /// # Safety
    ///
    /// The header must be initialized.
    #[inline(always)]
    pub unsafe fn size(self) -> usize {
        unsafe { (*self.0.as_ptr()).size & !USED }
    }

    /// Bytes available to the caller.
    #[inline(always)]
    pub unsafe fn usable_size(self) -> usize {
        unsafe { self.size() - HEADER_SIZE }
    }

    #[inline(always)]
    pub unsafe fn is_used(self) -> bool {
        unsafe { (*self.0.as_ptr()).size & USED != 0 }
    }

    #[inline(always)]
    pub unsafe fn prev_size(self) -> usize {
        unsafe { (*self.0.as_ptr()).prev_size }
    }

    #[inline(always)]
    pub unsafe fn write(self, size: usize, used: bool, prev_size: usize) {
        debug_assert_eq!(size % BLOCK_ALIGN, 0);
        unsafe {
            self.0.as_ptr().write(BlockHeader {
                size: size | used as usize,
                prev_size,
            })
        };
    }

    /// Updates size and state, keeping `prev_size`.
    #[inline(always)]
    pub unsafe fn set_size(self, size: usize, used: bool) {
        debug_assert_eq!(size % BLOCK_ALIGN, 0);
        unsafe { (*self.0.as_ptr()).size = size | used as usize };
    }

    #[inline(always)]
    pub unsafe fn set_used(self, used: bool) {
        unsafe { self.set_size(self.size(), used) };
    }

    #[inline(always)]
    pub unsafe fn set_prev_size(self, prev_size: usize) {
        unsafe { (*self.0.as_ptr()).prev_size = prev_size };
    }

    /// Physically following block; the page sentinel for the last block.
    ///
    /// # Safety
    ///
    /// Must not be called on the sentinel.
    #[inline(always)]
    pub unsafe fn next(self) -> Self {
        unsafe {
            debug_assert!(self.size() != 0, "next() called on a page sentinel");
            self.offset(self.size())
        }
    }

    /// Physically preceding block, `None` for the first block of a page.
    #[inline(always)]
    pub unsafe fn prev(self) -> Option<Self> {
        unsafe {
            let prev_size = self.prev_size();
            (prev_size != 0).then(|| Self(self.0.byte_sub(prev_size)))
        }
    }

    #[inline(always)]
    pub unsafe fn is_sentinel(self) -> bool {
        unsafe { self.size() == 0 }
    }

    /// Free-list links stored in the payload of a free block.
    #[inline(always)]
    pub fn links(self) -> *mut FreeLinks {
        self.payload().as_ptr().cast()
    }
}

/// Formats a fresh page as one free block followed by the sentinel and returns
/// that block.
///
/// # Safety
///
/// `base` must be valid for `size` bytes, 16 byte aligned, and `size` a
/// multiple of 16 of at least `MIN_BLOCK_SIZE + HEADER_SIZE`.
pub unsafe fn format_page(base: NonNull<u8>, size: usize) -> Block {
    debug_assert!(size >= MIN_BLOCK_SIZE + HEADER_SIZE);

    let first = Block::at(base);
    let block_size = size - HEADER_SIZE;

    unsafe {
        first.write(block_size, false, 0);
        first.offset(block_size).write(0, true, block_size);
    }

    first
}
