use std::ptr::NonNull;

/// Intrusive LIFO list of free, equally sized slots.
///
/// Each free slot stores the pointer to the next free slot in its first word,
/// so slots must be at least pointer sized and pointer aligned. The list never
/// owns the memory it links; pages stay owned by whoever carved them.
pub struct FreeSlotList {
    head: *mut u8,
    len: usize,
}

// SAFETY: the list only links memory owned by the structure embedding it;
// callers serialize access (a bucket keeps its list behind a mutex).
unsafe impl Send for FreeSlotList {}

impl Default for FreeSlotList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeSlotList {
    #[inline(always)]
    pub const fn min_slot_size() -> usize {
        std::mem::size_of::<*mut u8>()
    }

    pub const fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            len: 0,
        }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Pushes `slot` on top of the list.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes of a pointer, pointer aligned, not
    /// already in any list and not in use by anyone else.
    #[inline]
    pub unsafe fn push(&mut self, slot: NonNull<u8>) {
        debug_assert!(
            slot.as_ptr().addr() % std::mem::align_of::<*mut u8>() == 0,
            "Slot not properly aligned"
        );

        unsafe { slot.as_ptr().cast::<*mut u8>().write(self.head) };
        self.head = slot.as_ptr();
        self.len += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let slot = NonNull::new(self.head)?;

        // SAFETY: every slot in the list was written by `push`.
        self.head = unsafe { slot.as_ptr().cast::<*mut u8>().read() };
        self.len -= 1;

        Some(slot)
    }

    /// Splits `page` into `slot_size` slots and pushes every slot except the
    /// first one, which is returned to the caller. Pops then yield ascending
    /// addresses.
    ///
    /// # Safety
    ///
    /// `page` must be valid for writes of `page_size` bytes, aligned to at
    /// least a pointer, and exclusively owned by the caller.
    pub unsafe fn carve(&mut self, page: NonNull<u8>, page_size: usize, slot_size: usize) -> NonNull<u8> {
        assert!(
            slot_size >= Self::min_slot_size(),
            "Slot size must hold a pointer"
        );
        assert!(page_size >= slot_size, "Page smaller than a slot");

        let slots = page_size / slot_size;

        for index in (1..slots).rev() {
            // SAFETY: `index * slot_size < page_size`.
            unsafe { self.push(page.add(index * slot_size)) };
        }

        page
    }

    /// Removes every slot for which `keep` returns `false` and returns how many
    /// were removed. Walks the entire list.
    pub fn retain(&mut self, mut keep: impl FnMut(NonNull<u8>) -> bool) -> usize {
        let mut removed = 0;
        let mut link: *mut *mut u8 = &mut self.head;

        // SAFETY: `link` always points at the head field or at the first word
        // of a slot that is in the list.
        unsafe {
            while let Some(slot) = NonNull::new(*link) {
                let next = slot.as_ptr().cast::<*mut u8>();
                if keep(slot) {
                    link = next;
                } else {
                    *link = *next;
                    removed += 1;
                }
            }
        }

        self.len -= removed;
        removed
    }

    /// Linear scan, intended for diagnostics.
    pub fn contains(&self, slot: NonNull<u8>) -> bool {
        let mut current = self.head;
        while !current.is_null() {
            if current == slot.as_ptr() {
                return true;
            }
            current = unsafe { current.cast::<*mut u8>().read() };
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(64))]
    struct Page([u8; 1024]);

    fn page() -> Box<Page> {
        Box::new(Page([0; 1024]))
    }

    fn base(page: &mut Page) -> NonNull<u8> {
        NonNull::new(page.0.as_mut_ptr()).unwrap()
    }

    #[test]
    fn test_free_slot_list_basic() {
        let mut page = page();
        let base = base(&mut page);
        let mut list = FreeSlotList::new();

        assert!(list.is_empty());
        assert_eq!(list.pop(), None);

        unsafe {
            list.push(base);
            list.push(base.add(64));
        }
        assert_eq!(list.len(), 2);

        assert_eq!(list.pop(), Some(unsafe { base.add(64) }));
        assert_eq!(list.pop(), Some(base));
        assert!(list.is_empty());
    }

    #[test]
    fn test_free_slot_list_reuse_order() {
        let mut page = page();
        let base = base(&mut page);
        let mut list = FreeSlotList::new();

        let first = unsafe { list.carve(base, 1024, 32) };
        assert_eq!(first, base);
        assert_eq!(list.len(), 31);

        let a = list.pop().unwrap();
        let b = list.pop().unwrap();
        assert_eq!(a, unsafe { base.add(32) });
        assert_eq!(b, unsafe { base.add(64) });

        // Free in specific order
        unsafe {
            list.push(b);
            list.push(a);
        }

        // LIFO: blocks come back in reverse deallocation order
        assert_eq!(list.pop(), Some(a));
        assert_eq!(list.pop(), Some(b));
    }

    #[test]
    fn test_free_slot_list_carve_leaves_tail() {
        let mut page = page();
        let base = base(&mut page);
        let mut list = FreeSlotList::new();

        // 1024 / 24 = 42 slots, the 16 byte tail stays unused
        let _first = unsafe { list.carve(base, 1024, 24) };
        assert_eq!(list.len(), 41);

        let mut last = base;
        while let Some(slot) = list.pop() {
            assert!(slot.as_ptr().addr() > last.as_ptr().addr());
            assert!(slot.as_ptr().addr() + 24 <= base.as_ptr().addr() + 1024);
            last = slot;
        }
    }

    #[test]
    fn test_free_slot_list_retain() {
        let mut page = page();
        let base = base(&mut page);
        let mut list = FreeSlotList::new();

        let _first = unsafe { list.carve(base, 1024, 64) };
        assert_eq!(list.len(), 15);

        let split = base.as_ptr().addr() + 512;
        let removed = list.retain(|slot| slot.as_ptr().addr() < split);
        assert_eq!(removed, 8);
        assert_eq!(list.len(), 7);

        while let Some(slot) = list.pop() {
            assert!(slot.as_ptr().addr() < split);
        }
    }

    #[test]
    fn test_free_slot_list_contains() {
        let mut page = page();
        let base = base(&mut page);
        let mut list = FreeSlotList::new();

        unsafe { list.push(base.add(128)) };
        assert!(list.contains(unsafe { base.add(128) }));
        assert!(!list.contains(base));
    }

    #[test]
    #[should_panic(expected = "Slot size must hold a pointer")]
    fn test_free_slot_list_tiny_slots() {
        let mut page = page();
        let base = base(&mut page);
        let mut list = FreeSlotList::new();

        let _ = unsafe { list.carve(base, 1024, 2) };
    }
}
