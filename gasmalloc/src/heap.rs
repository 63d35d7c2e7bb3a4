// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 or the MIT license, at your
// option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The shared heap and the per-thread allocation front end.
//!
//! [`MainHeap`] owns what every thread shares: the address-space reservation,
//! the bootstrap arena's output (the tracker tables), and the superpage
//! tracker itself. It knows how to create and destroy superpage blocks and
//! how to find the block containing an arbitrary pointer, and nothing about
//! size classes or caching.
//!
//! [`ThreadLocalHeap`] is the front end a thread allocates through. It keeps
//! a list of the superpage blocks it owns, one list of "active" (partly
//! filled) small page blocks per size class, and an inbox of frees pushed at
//! it by other threads. The ownership rule is strict: a thread only ever
//! mutates page-block state of blocks it owns. Frees of foreign memory are
//! pushed to the owning thread's inbox; frees of orphaned memory first adopt
//! the block via its owner CAS.
//!
//! A thread heap's inbox is what other threads hold a pointer to (through
//! the superpage-block owner field), so its address doubles as the owner
//! identity. Inboxes are allocated leakily: a remote freer may race the
//! owner's exit, and a push to a dead thread's inbox must land in memory
//! that is still an inbox. Cells parked there are unreachable (the next
//! toucher adopts the orphaned block and frees through its own path), so the
//! race costs at most a deferred reclamation, never a fault.

use core::cmp;
use core::ptr::NonNull;

use alloc_assert::{alloc_assert, alloc_debug_assert, alloc_panic, AllocUnwrap};
use bootarena::BootArena;
use log::{debug, trace};

use crate::layout::{
    align_down, align_up, divide_up, GasLayout, PAGES_PER_SUPERPAGE, PAGE_SIZE,
    SUPERPAGE_SIZE,
};
use crate::list::{AtomicFreeList, FreeCell, List, RunLength};
use crate::size_class::{class_id, CLASSES, NUM_CLASSES, SMALLEST_BLOCK, SMALLEST_MEDIUM};
use crate::spb::{
    ActiveAdapter, OwnedAdapter, PageBlockHeader, PageBlockKind, SuperpageBlock,
    HEADER_PAGES, SMALLEST_HUGE,
};
use crate::stats::trace_event;
use crate::tracker::SuperpageTracker;
use crate::Block;

/// The shared, thread-safe part of the allocator.
pub struct MainHeap {
    layout: GasLayout,
    tracker: SuperpageTracker,
    _reservation: vmem::Reservation,
}

impl MainHeap {
    /// Builds a heap whose address interval is placed by the OS. `local_node`
    /// selects this process's slice of the `node_count`-node space.
    pub fn new(space_per_node: usize, node_count: usize, local_node: usize) -> MainHeap {
        Self::try_new(space_per_node, node_count, local_node)
            .alloc_expect("cannot reserve address space for the gas interval")
    }

    /// Like [`MainHeap::new`], reporting reservation failure instead of
    /// aborting.
    pub fn try_new(
        space_per_node: usize,
        node_count: usize,
        local_node: usize,
    ) -> Option<MainHeap> {
        vmem::assert_page_size(PAGE_SIZE);
        let superpages_per_node = divide_up(space_per_node, SUPERPAGE_SIZE);
        let total = superpages_per_node * node_count;
        let boot = Self::boot_bytes(total);
        // One extra superpage pays for aligning `start` inside the
        // reservation.
        let len = boot + total * SUPERPAGE_SIZE + SUPERPAGE_SIZE;
        let reservation = vmem::reserve(len).ok()?;
        let start = align_up(reservation.base() + boot, SUPERPAGE_SIZE);
        Some(Self::build(reservation, start, space_per_node, node_count, local_node))
    }

    /// Builds a heap whose space starts exactly at `start` (aligned up to a
    /// superpage), as dictated by whatever coordinates the nodes.
    ///
    /// # Safety
    ///
    /// The interval `[start - boot, start + node_count * space_per_node)` is
    /// mapped over with `MAP_FIXED` (where `boot` is a few pages of metadata
    /// headroom below `start`); nothing this process cares about may live
    /// there.
    pub unsafe fn at_base(
        start: usize,
        space_per_node: usize,
        node_count: usize,
        local_node: usize,
    ) -> MainHeap {
        vmem::assert_page_size(PAGE_SIZE);
        let start = align_up(start, SUPERPAGE_SIZE);
        let superpages_per_node = divide_up(space_per_node, SUPERPAGE_SIZE);
        let total = superpages_per_node * node_count;
        let boot = Self::boot_bytes(total);
        let reservation = vmem::reserve_at(start - boot, boot + total * SUPERPAGE_SIZE)
            .alloc_expect("cannot reserve the gas interval at its fixed base");
        Self::build(reservation, start, space_per_node, node_count, local_node)
    }

    /// Metadata bytes needed below `start`: the tracker's two tables plus a
    /// page of alignment slack.
    fn boot_bytes(superpage_total: usize) -> usize {
        align_up(SuperpageTracker::table_bytes(superpage_total), PAGE_SIZE) + PAGE_SIZE
    }

    fn build(
        reservation: vmem::Reservation,
        start: usize,
        space_per_node: usize,
        node_count: usize,
        local_node: usize,
    ) -> MainHeap {
        let layout = GasLayout::new(start, space_per_node, node_count, local_node);
        alloc_assert!(reservation
            .contains(layout.start(), layout.superpage_total() * SUPERPAGE_SIZE));
        let mut arena = unsafe { BootArena::new(layout.start(), reservation.base()) };
        let tracker = SuperpageTracker::new(layout.superpage_total(), &mut arena);
        debug!(
            "gas heap up: start {:#x}, {} nodes x {} superpages, local node {}",
            layout.start(),
            node_count,
            layout.superpages_per_node(),
            local_node
        );
        MainHeap { layout, tracker, _reservation: reservation }
    }

    pub fn layout(&self) -> &GasLayout {
        &self.layout
    }

    pub fn tracker(&self) -> &SuperpageTracker {
        &self.tracker
    }

    /// Reserves, commits, and formats a fresh superpage block sized for
    /// `huge_alloc_size` bytes of huge allocation (zero for a plain
    /// one-superpage block). Exhaustion of the local interval is fatal.
    fn create_superpage_block(
        &self,
        owner: *mut AtomicFreeList,
        huge_alloc_size: usize,
    ) -> NonNull<SuperpageBlock> {
        let huge_pages = divide_up(huge_alloc_size, PAGE_SIZE);
        let count = divide_up(huge_pages + HEADER_PAGES, PAGES_PER_SUPERPAGE);
        let num = self
            .tracker
            .acquire(count, self.layout.local_interval())
            .alloc_expect("out of superpages in the local gas interval");
        let addr = self.layout.superpage_addr(num);
        unsafe {
            vmem::commit_checked(addr, count * SUPERPAGE_SIZE);
            SuperpageBlock::init(
                NonNull::new_unchecked(addr as *mut u8),
                count,
                huge_pages,
                owner,
            )
        }
    }

    /// Releases a block entirely. The backing is uncommitted *before* the
    /// tracker bits clear: the instant they clear, another thread may acquire
    /// and commit these superpages.
    fn destroy_superpage_block(&self, spb: NonNull<SuperpageBlock>) {
        let (addr, count) = unsafe {
            (spb.as_ref().base_addr(), spb.as_ref().superpage_count())
        };
        trace!("destroying superpage block {:#x} ({} superpages)", addr, count);
        let num = self.layout.superpage_num(addr);
        unsafe {
            vmem::uncommit_checked(addr, count * SUPERPAGE_SIZE);
        }
        self.tracker.release(num..num + count);
    }

    /// Tears down a finished huge allocation: uncommits and un-tracks the
    /// trailing superpages, then reclaims the huge pages of the first one.
    fn destroy_huge_part(&self, spb: NonNull<SuperpageBlock>) {
        let (addr, count) = unsafe {
            (spb.as_ref().base_addr(), spb.as_ref().superpage_count())
        };
        alloc_debug_assert!(count > 1);
        trace!("trimming superpage block {:#x} ({} superpages -> 1)", addr, count);
        let num = self.layout.superpage_num(addr);
        unsafe {
            vmem::uncommit_checked(addr + SUPERPAGE_SIZE, (count - 1) * SUPERPAGE_SIZE);
        }
        self.tracker.trim(num..num + count);
        unsafe {
            (*spb.as_ptr()).destroy_huge_alloc();
            alloc_debug_assert!(spb.as_ref().huge_page_index() == PAGES_PER_SUPERPAGE);
        }
    }

    /// The superpage block containing `addr`, recovered by walking the
    /// tracker's sequence bits back to the run's first superpage.
    fn containing_spb(&self, addr: usize) -> NonNull<SuperpageBlock> {
        let num = self.layout.superpage_num(addr);
        let start = self.tracker.sequence_start(num);
        unsafe {
            NonNull::new_unchecked(self.layout.superpage_addr(start) as *mut SuperpageBlock)
        }
    }
}

/// A thread's private allocation front end.
///
/// Not `Send`: a heap belongs to the thread that made it. Dropping it drains
/// the inbox one last time and orphans every owned superpage block, leaving
/// the memory mapped for whichever thread touches it next.
pub struct ThreadLocalHeap<'h> {
    main: &'h MainHeap,
    /// Leaked on purpose; see the module docs on inbox lifetime.
    inbox: &'static AtomicFreeList,
    owned: List<OwnedAdapter>,
    active: [List<ActiveAdapter>; NUM_CLASSES],
}

impl<'h> ThreadLocalHeap<'h> {
    pub fn new(main: &'h MainHeap) -> ThreadLocalHeap<'h> {
        ThreadLocalHeap {
            main,
            inbox: Box::leak(Box::new(AtomicFreeList::new())),
            owned: List::new(),
            active: core::array::from_fn(|_| List::new()),
        }
    }

    /// This heap's identity in superpage-block owner fields.
    fn inbox_ptr(&self) -> *mut AtomicFreeList {
        self.inbox as *const AtomicFreeList as *mut AtomicFreeList
    }

    /// Allocates at least `size` bytes aligned to `align` (a power of two of
    /// at most one page). A zero `size` gets the smallest class. Never
    /// fails: exhaustion aborts the process.
    pub fn allocate(&mut self, size: usize, align: usize) -> Block {
        self.flush_remote_frees();
        alloc_assert!(align.is_power_of_two(), "alignment {} not a power of two", align);
        alloc_assert!(align <= PAGE_SIZE, "alignment {} above the page size", align);
        // Small cells are aligned to their (power-of-two) size and page
        // blocks to pages, so serving max(size, align) bytes satisfies any
        // permitted alignment.
        let size = cmp::max(size, align);
        let block = if size < SMALLEST_MEDIUM {
            self.allocate_small(size)
        } else if size < SMALLEST_HUGE {
            let pages = divide_up(size, PAGE_SIZE);
            let pbh = self.create_page_block(pages, PageBlockKind::Medium);
            Block {
                ptr: unsafe { pbh.as_ref().block_base() },
                size: pages * PAGE_SIZE,
            }
        } else {
            let spb = self.create_superpage_block(size);
            unsafe { spb.as_ref().huge_region() }
        };
        alloc_debug_assert!(block.size >= size);
        alloc_debug_assert!(block.ptr.as_ptr() as usize % align == 0);
        alloc_debug_assert!(self.main.layout.in_local_interval(block.ptr.as_ptr() as usize));
        block
    }

    /// Frees the allocation containing `ptr`. The pointer may be interior.
    ///
    /// Works on any allocation from this heap's [`MainHeap`], whichever
    /// thread made it: foreign memory is routed to its owner's inbox, and
    /// orphaned memory is adopted first.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        self.flush_remote_frees();
        let addr = ptr.as_ptr() as usize;
        if !self.main.layout.in_local_interval(addr) {
            // Another node's slice; forwarding it home is the coherence
            // layer's job and that layer does not exist on this path yet.
            debug!("ignoring free outside the local interval: {:#x}", addr);
            return;
        }
        let spb = self.main.containing_spb(addr);
        let spb_ref = unsafe { spb.as_ref() };
        let mut owner = spb_ref.owner();
        while owner.is_null() {
            if spb_ref.adopt(self.inbox_ptr()) {
                trace_event!(adoption);
                trace!("adopted orphan superpage block {:#x}", spb_ref.base_addr());
                self.take_over(spb);
                owner = self.inbox_ptr();
            } else {
                // Lost the adoption race; free through the winner instead.
                owner = spb_ref.owner();
            }
        }
        if owner == self.inbox_ptr() {
            self.local_free(ptr, spb);
        } else {
            // Every allocation is at least cell-sized and cell-aligned, so
            // the aligned-down cell cannot straddle another allocation.
            trace_event!(remote_push);
            let cell_addr = align_down(addr, SMALLEST_BLOCK);
            unsafe {
                let cell = FreeCell::write_at(
                    NonNull::new_unchecked(cell_addr as *mut u8),
                    spb.as_ptr() as *mut u8,
                );
                (*owner).push(cell);
            }
        }
    }

    pub fn deallocate_block(&mut self, block: Block) {
        self.deallocate(block.ptr);
    }

    /// Applies every free other threads have pushed at this heap since the
    /// last drain. Runs implicitly at the top of `allocate`/`deallocate`;
    /// draining twice in a row is a no-op.
    pub fn flush_remote_frees(&mut self) {
        let mut pending = self.inbox.take_all();
        if pending.is_empty() {
            return;
        }
        unsafe {
            while let Some(cell) = pending.pop() {
                trace_event!(inbox_drain);
                // The pusher recorded the superpage block, saving the
                // tracker walk.
                let spb =
                    NonNull::new_unchecked(cell.as_ref().spb() as *mut SuperpageBlock);
                self.local_free(FreeCell::addr(cell), spb);
            }
        }
    }

    /// Newly adopted block: claim its list hooks for this heap.
    fn take_over(&mut self, spb: NonNull<SuperpageBlock>) {
        unsafe {
            self.owned.push_back(spb);
        }
        let spb_ref = unsafe { spb.as_ref() };
        let mut index = 0;
        while index < PAGES_PER_SUPERPAGE {
            let pbh = spb_ref.header_at(index);
            let head = unsafe { pbh.as_ref() };
            if head.kind() == PageBlockKind::Small {
                let info = &CLASSES[head.class()];
                let available = head.available_cells(info);
                if available > 0 && available < info.cells {
                    unsafe {
                        self.active[head.class()].push_back(pbh);
                    }
                }
            }
            index += head.run_length();
        }
    }

    fn local_free(&mut self, ptr: NonNull<u8>, spb: NonNull<SuperpageBlock>) {
        trace_event!(local_free);
        let addr = ptr.as_ptr() as usize;
        let spb_ref = unsafe { spb.as_ref() };
        if spb_ref.in_huge_region(addr) {
            if spb_ref.all_page_blocks_unused() {
                // Nothing else lives in the block: release the whole run,
                // huge region included.
                self.destroy_superpage_block(spb);
            } else if spb_ref.superpage_count() > 1 {
                trace_event!(huge_trim);
                self.main.destroy_huge_part(spb);
            } else {
                // The huge region was only the tail of this one superpage.
                unsafe {
                    (*spb.as_ptr()).destroy_huge_alloc();
                }
            }
            return;
        }
        let pbh = spb_ref.page_block_header(addr);
        match unsafe { pbh.as_ref().kind() } {
            PageBlockKind::Small => self.free_small(ptr, pbh, spb),
            PageBlockKind::Medium => self.destroy_page_block(pbh, spb),
            kind => alloc_panic!("free of {:#x} hit a {:?} page block", addr, kind),
        }
    }

    fn allocate_small(&mut self, size: usize) -> Block {
        trace_event!(small_alloc);
        let class = class_id(size);
        let info = &CLASSES[class];
        if self.active[class].is_empty() {
            let pbh = self.create_page_block(info.page_block_pages, PageBlockKind::Small);
            unsafe {
                (*pbh.as_ptr()).configure_small(class);
                self.active[class].push_front(pbh);
            }
        }
        let pbh = self.active[class].front().alloc_unwrap();
        let ptr = unsafe { (*pbh.as_ptr()).take_cell(info) };
        if unsafe { pbh.as_ref().available_cells(info) } == 0 {
            // Full page blocks leave the active list; the free that makes
            // them partial again re-links them.
            unsafe {
                self.active[class].pop_front();
            }
        }
        Block { ptr, size: info.block_size }
    }

    fn free_small(
        &mut self,
        ptr: NonNull<u8>,
        pbh: NonNull<PageBlockHeader>,
        spb: NonNull<SuperpageBlock>,
    ) {
        let head = unsafe { &mut *pbh.as_ptr() };
        let class = head.class();
        let info = &CLASSES[class];
        unsafe {
            head.put_cell(ptr, info);
        }
        let available = head.available_cells(info);
        if available == info.cells {
            // Empty page blocks are dissolved rather than cached.
            unsafe {
                self.active[class].unlink(pbh);
            }
            self.destroy_page_block(pbh, spb);
        } else if available == 1 {
            // Was full, so it was not in the active list.
            unsafe {
                self.active[class].push_front(pbh);
            }
        }
    }

    /// A page block of `pages` pages from any owned block, growing the owned
    /// set by a fresh superpage block if none can serve it.
    fn create_page_block(
        &mut self,
        pages: usize,
        kind: PageBlockKind,
    ) -> NonNull<PageBlockHeader> {
        for spb in self.owned.iter() {
            if let Some(pbh) = unsafe { (*spb.as_ptr()).allocate_page_block(pages, kind) } {
                return pbh;
            }
        }
        let spb = self.create_superpage_block(0);
        unsafe { (*spb.as_ptr()).allocate_page_block(pages, kind) }
            .alloc_expect("fresh superpage block cannot hold a page block")
    }

    fn destroy_page_block(
        &mut self,
        pbh: NonNull<PageBlockHeader>,
        spb: NonNull<SuperpageBlock>,
    ) {
        unsafe {
            (*spb.as_ptr()).free_page_block(pbh);
        }
        if unsafe { spb.as_ref().completely_unused() } {
            self.destroy_superpage_block(spb);
        }
    }

    fn create_superpage_block(&mut self, huge_alloc_size: usize) -> NonNull<SuperpageBlock> {
        trace_event!(spb_create);
        let spb = self.main.create_superpage_block(self.inbox_ptr(), huge_alloc_size);
        unsafe {
            self.owned.push_back(spb);
        }
        spb
    }

    fn destroy_superpage_block(&mut self, spb: NonNull<SuperpageBlock>) {
        trace_event!(spb_destroy);
        unsafe {
            self.owned.unlink(spb);
        }
        self.main.destroy_superpage_block(spb);
    }
}

impl<'h> Drop for ThreadLocalHeap<'h> {
    fn drop(&mut self) {
        self.flush_remote_frees();
        // Orphan every owned block. Small page blocks leave this heap's
        // active lists first; the adopter rebuilds its own.
        unsafe {
            while let Some(spb) = self.owned.pop_front() {
                let spb_ref = spb.as_ref();
                let mut index = 0;
                while index < PAGES_PER_SUPERPAGE {
                    let pbh = spb_ref.header_at(index);
                    let head = pbh.as_ref();
                    if head.kind() == PageBlockKind::Small {
                        let info = &CLASSES[head.class()];
                        let available = head.available_cells(info);
                        if available > 0 && available < info.cells {
                            self.active[head.class()].unlink(pbh);
                        }
                    }
                    index += head.run_length();
                }
                spb_ref.disown();
            }
        }
        for class in 0..NUM_CLASSES {
            alloc_debug_assert!(self.active[class].is_empty());
        }
        debug!("thread heap retiring: {:?}", crate::stats::snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spb::AVAILABLE_PAGES;
    use std::sync::mpsc::channel;
    use std::sync::Barrier;

    fn test_heap(superpages: usize) -> MainHeap {
        let _ = env_logger::builder().is_test(true).try_init();
        MainHeap::new(superpages * SUPERPAGE_SIZE, 1, 0)
    }

    fn mapped_count(heap: &MainHeap) -> usize {
        heap.layout()
            .local_interval()
            .filter(|&num| heap.tracker().is_mapped(num))
            .count()
    }

    /// Lengths of the reserved superpage runs in the local interval.
    fn run_lengths(heap: &MainHeap) -> Vec<usize> {
        let interval = heap.layout().local_interval();
        let mut runs = Vec::new();
        for num in interval.clone() {
            if heap.tracker().is_mapped(num) && heap.tracker().sequence_start(num) == num {
                let len = (num..interval.end)
                    .take_while(|&n| {
                        heap.tracker().is_mapped(n)
                            && heap.tracker().sequence_start(n) == num
                    })
                    .count();
                runs.push(len);
            }
        }
        runs
    }

    #[test]
    fn mixed_sizes_share_one_superpage_block() {
        let heap = test_heap(64);
        let mut tlh = ThreadLocalHeap::new(&heap);

        let medium = tlh.allocate(0xF356, 1);
        assert_eq!(medium.size, 16 * PAGE_SIZE);
        let small = tlh.allocate(53, 1);
        assert_eq!(small.size, 64);
        assert_eq!(mapped_count(&heap), 1);

        tlh.deallocate(medium.ptr);
        let one_page = tlh.allocate(4096, 1);
        assert_eq!(one_page.size, PAGE_SIZE);
        assert_eq!(mapped_count(&heap), 1);

        tlh.deallocate(one_page.ptr);
        // The 53-byte allocation still pins the block.
        assert_eq!(mapped_count(&heap), 1);
        tlh.deallocate(small.ptr);
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn size_sweep_leaves_exactly_one_multi_superpage_run() {
        let heap = test_heap(128);
        let mut tlh = ThreadLocalHeap::new(&heap);
        let mut blocks = Vec::new();
        for shift in 2..=20 {
            for size in [(1 << shift) - 1, 1 << shift, (1 << shift) + 1] {
                let block = tlh.allocate(size, 1);
                assert!(block.size >= size);
                assert!(heap.layout().in_local_interval(block.ptr.as_ptr() as usize));
                blocks.push(block);
            }
        }
        // Just above the largest size a single superpage can serve.
        let huge = tlh.allocate((AVAILABLE_PAGES + 1) * PAGE_SIZE, 1);
        blocks.push(huge);

        let runs = run_lengths(&heap);
        let multi: Vec<_> = runs.iter().filter(|&&len| len >= 2).collect();
        assert_eq!(multi, [&2], "runs: {:?}", runs);

        for block in blocks {
            tlh.deallocate(block.ptr);
        }
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn cross_thread_frees_restore_empty_state() {
        use std::sync::mpsc::{Receiver, Sender};

        fn worker(
            heap: &MainHeap,
            barrier: &Barrier,
            mine: Sender<Vec<usize>>,
            theirs: Receiver<Vec<usize>>,
        ) {
            let mut tlh = ThreadLocalHeap::new(heap);
            let addrs: Vec<usize> = (2..=21)
                .map(|shift| tlh.allocate(1 << shift, 1).ptr.as_ptr() as usize)
                .collect();
            mine.send(addrs).unwrap();
            for addr in theirs.recv().unwrap() {
                tlh.deallocate(NonNull::new(addr as *mut u8).unwrap());
            }
            // Both sides must finish pushing before either drains and
            // retires, or frees still in flight would be stranded.
            barrier.wait();
            tlh.flush_remote_frees();
        }

        let heap = test_heap(256);
        let barrier = Barrier::new(2);
        let (to_a, from_b) = channel::<Vec<usize>>();
        let (to_b, from_a) = channel::<Vec<usize>>();
        std::thread::scope(|scope| {
            scope.spawn(|| worker(&heap, &barrier, to_a, from_a));
            scope.spawn(|| worker(&heap, &barrier, to_b, from_b));
        });
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn orphaned_blocks_are_adopted_and_reclaimed() {
        let heap = test_heap(64);
        let addrs = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let mut tlh = ThreadLocalHeap::new(&heap);
                    let sizes = [16, 53, 900, 5000, 40 * PAGE_SIZE];
                    sizes
                        .iter()
                        .map(|&s| tlh.allocate(s, 1).ptr.as_ptr() as usize)
                        .collect::<Vec<_>>()
                })
                .join()
                .unwrap()
        });
        // The owner exited without freeing; its block stays mapped.
        assert_eq!(mapped_count(&heap), 1);

        let before = crate::stats::snapshot().adoption;
        let mut tlh = ThreadLocalHeap::new(&heap);
        for addr in addrs {
            tlh.deallocate(NonNull::new(addr as *mut u8).unwrap());
        }
        // One adoption on the first free; the rest were local.
        assert_eq!(crate::stats::snapshot().adoption - before, 1);
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn sequence_start_spans_a_five_superpage_block() {
        let heap = test_heap(64);
        let mut tlh = ThreadLocalHeap::new(&heap);
        let size = (4 * PAGES_PER_SUPERPAGE + 100) * PAGE_SIZE;
        let huge = tlh.allocate(size, 1);
        assert_eq!(run_lengths(&heap), [5]);
        let head = heap
            .layout()
            .superpage_num(huge.ptr.as_ptr() as usize & !(SUPERPAGE_SIZE - 1));
        let start = heap.tracker().sequence_start(head);
        for num in start..start + 5 {
            assert_eq!(heap.tracker().sequence_start(num), start);
        }
        tlh.deallocate(huge.ptr);
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn round_trip_restores_tracker_state() {
        let heap = test_heap(64);
        let mut tlh = ThreadLocalHeap::new(&heap);
        let interval = heap.layout().local_interval();
        // A resident allocation keeps the tracker non-trivial.
        let pinned = tlh.allocate(1000, 1);
        let reference = heap.tracker().dump(interval.clone());
        for shift in 0..=21 {
            for align in [1usize, 8, 64, PAGE_SIZE] {
                let block = tlh.allocate(1 << shift, align);
                assert_eq!(block.ptr.as_ptr() as usize % align, 0);
                tlh.deallocate(block.ptr);
                assert_eq!(
                    heap.tracker().dump(interval.clone()),
                    reference,
                    "size {} align {}",
                    1 << shift,
                    align
                );
            }
        }
        tlh.deallocate(pinned.ptr);
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn zero_size_gets_the_smallest_class() {
        let heap = test_heap(16);
        let mut tlh = ThreadLocalHeap::new(&heap);
        let block = tlh.allocate(0, 1);
        assert_eq!(block.size, SMALLEST_BLOCK);
        tlh.deallocate(block.ptr);
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn alignment_is_served_by_size_rounding() {
        let heap = test_heap(16);
        let mut tlh = ThreadLocalHeap::new(&heap);
        let mut blocks = Vec::new();
        for (size, align) in
            [(3, 8), (24, 1024), (100, 256), (5000, 4096), (1 << 16, 4096)]
        {
            let block = tlh.allocate(size, align);
            assert_eq!(block.ptr.as_ptr() as usize % align, 0, "align {}", align);
            assert!(block.size >= size);
            blocks.push(block);
        }
        for block in blocks {
            tlh.deallocate(block.ptr);
        }
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn interior_pointers_free_the_containing_cell() {
        let heap = test_heap(16);
        let mut tlh = ThreadLocalHeap::new(&heap);
        let block = tlh.allocate(64, 1);
        let interior = NonNull::new(unsafe { block.ptr.as_ptr().add(17) }).unwrap();
        tlh.deallocate(interior);
        // The freed cell is first in line for reuse.
        let again = tlh.allocate(64, 1);
        assert_eq!(again.ptr, block.ptr);
        tlh.deallocate(again.ptr);
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn small_class_cycles_through_page_blocks() {
        let heap = test_heap(16);
        let mut tlh = ThreadLocalHeap::new(&heap);
        let info = &CLASSES[class_id(16)];
        // Enough to fill two page blocks and start a third.
        let n = 2 * info.cells + 3;
        let mut ptrs: Vec<_> = (0..n).map(|_| tlh.allocate(16, 1).ptr).collect();
        assert_eq!(mapped_count(&heap), 1);
        // Free in an interleaved order to exercise full -> partial -> empty.
        for i in (0..n).step_by(2) {
            tlh.deallocate(ptrs[i]);
        }
        for i in (1..n).step_by(2) {
            tlh.deallocate(ptrs[i]);
        }
        assert_eq!(mapped_count(&heap), 0);
        // The heap stays usable afterwards.
        ptrs.clear();
        for _ in 0..10 {
            ptrs.push(tlh.allocate(16, 1).ptr);
        }
        for p in ptrs.drain(..) {
            tlh.deallocate(p);
        }
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn huge_of_exactly_one_superpage_usable_size() {
        let heap = test_heap(16);
        let mut tlh = ThreadLocalHeap::new(&heap);
        let block = tlh.allocate(SMALLEST_HUGE, 1);
        assert_eq!(block.size, SMALLEST_HUGE);
        // Served by a single superpage whose whole usable part is the huge
        // region.
        assert_eq!(run_lengths(&heap), [1]);
        tlh.deallocate(block.ptr);
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn huge_of_whole_superpages_pays_one_for_the_header() {
        let heap = test_heap(16);
        let mut tlh = ThreadLocalHeap::new(&heap);
        let block = tlh.allocate(2 * SUPERPAGE_SIZE, 1);
        assert!(block.size >= 2 * SUPERPAGE_SIZE);
        assert_eq!(run_lengths(&heap), [3]);
        tlh.deallocate(block.ptr);
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn huge_region_free_trims_a_live_block() {
        let heap = test_heap(16);
        let mut tlh = ThreadLocalHeap::new(&heap);
        let huge = tlh.allocate(SUPERPAGE_SIZE, 1);
        assert_eq!(run_lengths(&heap), [2]);
        // Pin the first superpage with a small allocation placed in it.
        let small = tlh.allocate(64, 1);
        tlh.deallocate(huge.ptr);
        // Trimmed back to one superpage, still pinned.
        assert_eq!(run_lengths(&heap), [1]);
        tlh.deallocate(small.ptr);
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn mediums_overflow_into_a_second_superpage_block() {
        let heap = test_heap(16);
        let mut tlh = ThreadLocalHeap::new(&heap);
        let pages = 100;
        let fits = AVAILABLE_PAGES / pages;
        let mut blocks = Vec::new();
        for _ in 0..fits {
            blocks.push(tlh.allocate(pages * PAGE_SIZE, 1));
        }
        assert_eq!(mapped_count(&heap), 1);
        blocks.push(tlh.allocate(pages * PAGE_SIZE, 1));
        assert_eq!(mapped_count(&heap), 2);
        for block in blocks {
            tlh.deallocate(block.ptr);
        }
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn idempotent_drain() {
        let heap = test_heap(16);
        let interval = heap.layout().local_interval();
        let mut tlh = ThreadLocalHeap::new(&heap);
        let block = tlh.allocate(64, 1);
        // A remote thread frees into our inbox.
        let addr = block.ptr.as_ptr() as usize;
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut other = ThreadLocalHeap::new(&heap);
                other.deallocate(NonNull::new(addr as *mut u8).unwrap());
            });
        });
        tlh.flush_remote_frees();
        let after_first = heap.tracker().dump(interval.clone());
        tlh.flush_remote_frees();
        assert_eq!(heap.tracker().dump(interval.clone()), after_first);
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn fixed_base_heap_inside_a_prior_reservation() {
        let _ = env_logger::builder().is_test(true).try_init();
        // Carve the fixed-base heap out of address space we already own, so
        // MAP_FIXED cannot clobber anything foreign.
        let scratch = vmem::reserve(8 * SUPERPAGE_SIZE).unwrap();
        let start = align_up(scratch.base() + SUPERPAGE_SIZE, SUPERPAGE_SIZE);
        let heap =
            unsafe { MainHeap::at_base(start, 4 * SUPERPAGE_SIZE, 1, 0) };
        assert_eq!(heap.layout().start(), start);
        let mut tlh = ThreadLocalHeap::new(&heap);
        let block = tlh.allocate(1234, 1);
        assert!(heap.layout().in_local_interval(block.ptr.as_ptr() as usize));
        tlh.deallocate(block.ptr);
        assert_eq!(mapped_count(&heap), 0);
    }

    #[test]
    fn stress_many_threads_many_sizes() {
        let threads = num_cpus::get().clamp(2, 8);
        let heap = test_heap(512);
        std::thread::scope(|scope| {
            for seed in 0..threads {
                let heap = &heap;
                scope.spawn(move || {
                    use rand::{Rng, SeedableRng};
                    let mut rng = rand::rngs::StdRng::seed_from_u64(seed as u64);
                    let mut tlh = ThreadLocalHeap::new(heap);
                    let mut live: Vec<Block> = Vec::new();
                    for _ in 0..2000 {
                        if live.len() > 64 || (rng.gen_bool(0.4) && !live.is_empty()) {
                            let block = live.swap_remove(rng.gen_range(0..live.len()));
                            tlh.deallocate(block.ptr);
                        } else {
                            let size = 1usize << rng.gen_range(0..18);
                            live.push(tlh.allocate(size + rng.gen_range(0..7), 1));
                        }
                    }
                    for block in live {
                        tlh.deallocate(block.ptr);
                    }
                });
            }
        });
        assert_eq!(mapped_count(&heap), 0);
    }
}
