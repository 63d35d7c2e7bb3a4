// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 or the MIT license, at your
// option. This file may not be copied, modified, or distributed except
// according to those terms.

//! A tiny arena that exists so the real allocator can boot.
//!
//! The superpage tracker needs two bitmap tables before it can hand out a
//! single byte, so those tables cannot come from the allocator itself. They
//! come from here instead: a down-growing bump arena carved out of the slice
//! of reserved address space sitting just below the allocator's managed
//! interval. Pages are committed lazily as the bump pointer crosses them.
//!
//! The arena never frees individual blocks. Everything it hands out lives
//! until the enclosing reservation is dropped, which suits metadata that is
//! needed for the allocator's whole lifetime.

use core::ptr::NonNull;

use alloc_assert::{alloc_assert, alloc_debug_assert};

/// A down-growing bump allocator over `[floor, top)`.
///
/// `top` is the first byte *not* owned by the arena (the managed interval
/// starts there); `floor` is the lowest address the arena may ever commit.
/// Both must be page-aligned and lie inside a reservation owned by the
/// caller.
pub struct BootArena {
    left: usize,
    left_committed: usize,
    floor: usize,
}

impl BootArena {
    /// # Safety
    ///
    /// `[floor, top)` must lie inside a live `PROT_NONE` reservation, and no
    /// other code may commit or uncommit pages in that range while the arena
    /// (or anything it allocated) is in use.
    pub unsafe fn new(top: usize, floor: usize) -> BootArena {
        let page = vmem::page_size();
        alloc_assert!(top % page == 0, "arena top {:#x} not page-aligned", top);
        alloc_assert!(floor % page == 0, "arena floor {:#x} not page-aligned", floor);
        alloc_assert!(floor <= top);
        BootArena { left: top, left_committed: top, floor }
    }

    /// Allocates `size` bytes aligned to `align` (a power of two). Aborts if
    /// the arena is exhausted; the arena is sized at initialization to fit
    /// everything that will ever be asked of it.
    pub fn allocate(&mut self, size: usize, align: usize) -> NonNull<u8> {
        alloc_debug_assert!(align.is_power_of_two());
        let left = (self.left - size) & !(align - 1);
        alloc_assert!(
            left >= self.floor,
            "bootstrap arena exhausted ({} bytes requested, {} available)",
            size,
            self.left - self.floor
        );
        if left < self.left_committed {
            let page = vmem::page_size();
            let commit_from = left & !(page - 1);
            unsafe {
                vmem::commit_checked(commit_from, self.left_committed - commit_from);
            }
            self.left_committed = commit_from;
        }
        self.left = left;
        unsafe { NonNull::new_unchecked(left as *mut u8) }
    }

    /// Bytes still available below the bump pointer.
    pub fn remaining(&self) -> usize {
        self.left - self.floor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::write_volatile;

    fn arena_over(pages: usize) -> (vmem::Reservation, BootArena) {
        let page = vmem::page_size();
        let res = vmem::reserve(pages * page).unwrap();
        let arena = unsafe { BootArena::new(res.end(), res.base()) };
        (res, arena)
    }

    #[test]
    fn allocations_grow_down_and_are_writable() {
        let (_res, mut arena) = arena_over(8);
        let a = arena.allocate(100, 8);
        let b = arena.allocate(4096, 64);
        assert!((b.as_ptr() as usize) < a.as_ptr() as usize);
        assert_eq!(b.as_ptr() as usize % 64, 0);
        unsafe {
            write_volatile(a.as_ptr(), 1);
            write_volatile(b.as_ptr(), 2);
            write_volatile(b.as_ptr().add(4095), 3);
        }
    }

    #[test]
    fn alignment_is_respected() {
        let (_res, mut arena) = arena_over(4);
        for shift in 0..10 {
            let align = 1 << shift;
            let p = arena.allocate(3, align);
            assert_eq!(p.as_ptr() as usize % align, 0);
        }
    }

    #[test]
    fn remaining_shrinks() {
        let (_res, mut arena) = arena_over(4);
        let before = arena.remaining();
        arena.allocate(128, 8);
        assert!(arena.remaining() <= before - 128);
    }
}
