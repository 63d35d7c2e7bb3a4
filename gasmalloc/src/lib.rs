// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 or the MIT license, at your
// option. This file may not be copied, modified, or distributed except
// according to those terms.

//! A thread-caching allocator over a partitioned global address space.
//!
//! The allocator manages one node's slice of a single contiguous virtual
//! interval (the *global address space*) shared by several nodes. Memory is
//! organized in three tiers:
//!
//! - **Superpage blocks**: runs of 2 MiB superpages, reserved from the local
//!   slice through a concurrent bitmap (the [tracker](tracker)). A run's
//!   metadata lives in band, at the start of its first superpage.
//! - **Page blocks**: runs of 4 KiB pages cut out of a block's first
//!   superpage, coalesced with free neighbours when freed. A *medium*
//!   allocation takes a whole page block; a multi-superpage *huge*
//!   allocation takes everything past the metadata.
//! - **Cells**: *small* allocations, carved from a page block dedicated to
//!   one power-of-two size class and cached per thread.
//!
//! # Threading
//!
//! Each thread allocates through its own [`ThreadLocalHeap`], which owns the
//! superpage blocks it creates outright: no locks, no sharing. Frees are the
//! interesting part, since any thread may free any pointer:
//!
//! - a free of memory owned by the calling thread is applied directly;
//! - a free of another thread's memory is pushed onto the owner's lock-free
//!   inbox, to be applied the next time the owner allocates or frees;
//! - a free of memory whose owner has exited *adopts* the whole superpage
//!   block (one atomic compare-exchange on its owner field) and proceeds
//!   locally.
//!
//! Allocation never observes failure: the space is sized by construction,
//! and exhausting it (or an OS mapping error) aborts the process, because an
//! allocator deep inside arbitrary call stacks has no useful way to report.
//!
//! # Use
//!
//! Either build a [`MainHeap`] explicitly and hand each thread a
//! [`ThreadLocalHeap`] borrowing it, or use the [`global`] module, which
//! keeps a lazily-created process heap and per-thread handles in
//! thread-local storage.

mod bitmask;
mod heap;
mod layout;
mod list;
mod size_class;
mod spb;
pub mod stats;
mod tracker;

use core::ptr::NonNull;

pub use heap::{MainHeap, ThreadLocalHeap};
pub use layout::{GasLayout, PAGES_PER_SUPERPAGE, PAGE_SIZE, SUPERPAGE_SIZE};
pub use size_class::{SMALLEST_BLOCK, SMALLEST_MEDIUM};
pub use spb::SMALLEST_HUGE;
pub use tracker::SuperpageTracker;

/// An allocation: its base pointer and its actual size, which is at least
/// what was asked for.
#[derive(Copy, Clone, Debug)]
pub struct Block {
    pub ptr: NonNull<u8>,
    pub size: usize,
}

pub mod global {
    //! A process-wide heap with per-thread handles.
    //!
    //! The heap is created on first use, single-node, over an address-space
    //! reservation whose size starts at a quarter terabyte of virtual space
    //! and halves until the OS grants it. Each thread lazily gets a
    //! [`ThreadLocalHeap`] handle in thread-local storage; the handle's drop
    //! at thread exit orphans its superpage blocks as usual.

    use core::ptr::NonNull;
    use std::cell::RefCell;

    use alloc_assert::alloc_assert;
    use lazy_static::lazy_static;

    use super::{Block, MainHeap, ThreadLocalHeap};

    const DEFAULT_LOCAL_SPACE: usize = 1 << 38;
    const MIN_LOCAL_SPACE: usize = 1 << 30;

    lazy_static! {
        static ref HEAP: MainHeap = {
            let mut space = DEFAULT_LOCAL_SPACE;
            loop {
                if let Some(heap) = MainHeap::try_new(space, 1, 0) {
                    break heap;
                }
                alloc_assert!(
                    space > MIN_LOCAL_SPACE,
                    "cannot reserve even {} bytes of address space",
                    MIN_LOCAL_SPACE
                );
                space /= 2;
            }
        };
    }

    thread_local! {
        static LOCAL_HEAP: RefCell<Option<ThreadLocalHeap<'static>>> =
            const { RefCell::new(None) };
    }

    /// The process heap backing [`allocate`] and [`deallocate`].
    pub fn heap() -> &'static MainHeap {
        &HEAP
    }

    fn with_local<R>(f: impl FnOnce(&mut ThreadLocalHeap<'static>) -> R) -> R {
        LOCAL_HEAP.with(|slot| {
            let mut slot = slot.borrow_mut();
            let tlh = slot.get_or_insert_with(|| ThreadLocalHeap::new(heap()));
            f(tlh)
        })
    }

    /// See [`ThreadLocalHeap::allocate`].
    pub fn allocate(size: usize, align: usize) -> Block {
        with_local(|h| h.allocate(size, align))
    }

    /// See [`ThreadLocalHeap::deallocate`].
    pub fn deallocate(ptr: NonNull<u8>) {
        with_local(|h| h.deallocate(ptr))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use core::ptr::write_bytes;

        #[test]
        fn global_allocate_roundtrip() {
            for size in [0usize, 1, 16, 100, 5000, 1 << 16] {
                let block = allocate(size, 8);
                assert!(block.size >= size);
                unsafe {
                    write_bytes(block.ptr.as_ptr(), 0xAB, size);
                }
                deallocate(block.ptr);
            }
        }

        #[test]
        fn global_cross_thread_free() {
            let block = allocate(64, 1);
            let addr = block.ptr.as_ptr() as usize;
            std::thread::spawn(move || {
                deallocate(NonNull::new(addr as *mut u8).unwrap());
            })
            .join()
            .unwrap();
            // The remote free lands on this thread's inbox; the next
            // operation drains it.
            let again = allocate(64, 1);
            deallocate(again.ptr);
        }
    }
}
