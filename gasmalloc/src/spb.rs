// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 or the MIT license, at your
// option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Superpage blocks and the page-block manager.
//!
//! A superpage block (SPB) is a run of one or more adjacent superpages
//! reserved through the tracker. This struct *is* the run's header: it is
//! written in place at the start of the first superpage, and the pages it
//! covers are tagged `Reserved` in its own page-block table.
//!
//! The first superpage is cut into *page blocks*, runs of pages tracked by a
//! 512-entry table with one record per page. Only the first record of a run
//! is authoritative; the others carry the head's index so any page resolves
//! to its run in two loads. Free runs are coalesced with their neighbours
//! eagerly and indexed by length in a quicklist. If the block spans more than
//! one superpage, the extra superpages (plus, usually, the tail of the first)
//! hold exactly one huge allocation.
//!
//! Small page blocks carve their pages into equal cells of one size class and
//! keep a stack of freed cells threaded through the cells themselves.
//!
//! Everything here is single-owner territory: only the thread heap that owns
//! the SPB may touch the table, the quicklist, or the cell counts. The one
//! exception is the `owner` field, an atomic used for the orphan-adoption
//! handshake (acquire on read so an adopter sees fully built metadata,
//! release on disown, acq-rel on the adoption CAS).

use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use alloc_assert::{alloc_assert, alloc_debug_assert};
use log::trace;

use crate::layout::{divide_up, PAGES_PER_SUPERPAGE, PAGE_SIZE, SUPERPAGE_SIZE};
use crate::list::{
    intrusive_adapter, AtomicFreeList, FreeCell, FreeList, ListHook, QuickList, RunLength,
};
use crate::size_class::ClassInfo;
use crate::Block;

/// Pages of each first superpage consumed by the `SuperpageBlock` header.
pub const HEADER_PAGES: usize = divide_up(mem::size_of::<SuperpageBlock>(), PAGE_SIZE);

/// Pages of a one-superpage block usable for page blocks.
pub const AVAILABLE_PAGES: usize = PAGES_PER_SUPERPAGE - HEADER_PAGES;

/// Sizes from here up no longer fit a page block and get their own
/// (possibly multi-superpage) block with a huge region.
pub const SMALLEST_HUGE: usize = AVAILABLE_PAGES * PAGE_SIZE;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PageBlockKind {
    /// The SPB header pages themselves.
    Reserved,
    /// Free pages, linked into the unused quicklist.
    Unused,
    /// Carved into cells of one size class.
    Small,
    /// One allocation spanning the whole run.
    Medium,
    /// Tail pages of the first superpage belonging to the huge allocation.
    Huge,
}

/// One record per page of an SPB's first superpage.
///
/// `head` makes every record of a run point at the run's first record, so a
/// page index resolves to its run without any search. Small-run heads
/// additionally track the carving state: `carved` is a high-water mark
/// (cells past it have never been handed out), `unused_cells` counts the
/// freed stack.
#[repr(C)]
pub struct PageBlockHeader {
    kind: PageBlockKind,
    class: u8,
    run_length: u16,
    head: u16,
    carved: u16,
    unused_cells: u16,
    freed: FreeList,
    quick_hook: ListHook,
    active_hook: ListHook,
}

intrusive_adapter!(pub UnusedAdapter for PageBlockHeader { quick_hook });
intrusive_adapter!(pub ActiveAdapter for PageBlockHeader { active_hook });

impl RunLength for PageBlockHeader {
    fn run_length(&self) -> usize {
        self.run_length as usize
    }
}

impl PageBlockHeader {
    pub fn kind(&self) -> PageBlockKind {
        self.kind
    }

    pub fn class(&self) -> usize {
        self.class as usize
    }

    /// The containing SPB; records live inside the first superpage, so this
    /// is an alignment round-down.
    pub fn spb(&self) -> NonNull<SuperpageBlock> {
        unsafe {
            SuperpageBlock::from_inside_first_superpage(NonNull::from(self).cast())
        }
    }

    /// This record's page index within the first superpage.
    pub fn index(&self) -> usize {
        let spb = self.spb().as_ptr();
        let table = unsafe { ptr::addr_of!((*spb).table) } as usize;
        (self as *const _ as usize - table) / mem::size_of::<PageBlockHeader>()
    }

    /// First byte of the pages this (head) record describes.
    pub fn block_base(&self) -> NonNull<u8> {
        let addr = self.spb().as_ptr() as usize + self.index() * PAGE_SIZE;
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    pub fn configure_small(&mut self, class: usize) {
        alloc_debug_assert!(self.kind == PageBlockKind::Small);
        self.class = class as u8;
        self.carved = 0;
        self.unused_cells = 0;
        self.freed.clear();
    }

    pub fn available_cells(&self, info: &ClassInfo) -> usize {
        self.unused_cells as usize + (info.cells - self.carved as usize)
    }

    /// Pops a previously freed cell, or carves the next one.
    pub unsafe fn take_cell(&mut self, info: &ClassInfo) -> NonNull<u8> {
        alloc_debug_assert!(self.available_cells(info) > 0);
        if let Some(cell) = self.freed.pop() {
            self.unused_cells -= 1;
            FreeCell::addr(cell)
        } else {
            let p = self.block_base().as_ptr() as usize
                + info.block_size * self.carved as usize;
            self.carved += 1;
            NonNull::new_unchecked(p as *mut u8)
        }
    }

    /// Returns a cell to the freed stack. `ptr` may point anywhere inside
    /// the cell; it is aligned down to the cell boundary.
    pub unsafe fn put_cell(&mut self, ptr: NonNull<u8>, info: &ClassInfo) {
        let base = self.block_base().as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        alloc_debug_assert!(addr >= base);
        alloc_debug_assert!(addr < base + self.run_length() * PAGE_SIZE);
        let cell_addr = addr & !(info.block_size - 1);
        let cell =
            FreeCell::write_at(NonNull::new_unchecked(cell_addr as *mut u8), ptr::null_mut());
        self.freed.push(cell);
        self.unused_cells += 1;
    }
}

/// Header of a reserved superpage run, living at the run's first byte.
#[repr(C)]
pub struct SuperpageBlock {
    /// The owning thread heap's inbox, or null while orphaned.
    owner: AtomicPtr<AtomicFreeList>,
    superpage_count: usize,
    /// Page index (counted from this block's base) where the huge
    /// allocation begins; `superpage_count * PAGES_PER_SUPERPAGE` when there
    /// is none, which can exceed the table for single-superpage blocks.
    huge_alloc_page_index: usize,
    owned_hook: ListHook,
    unused: QuickList<UnusedAdapter>,
    table: [PageBlockHeader; PAGES_PER_SUPERPAGE],
}

intrusive_adapter!(pub OwnedAdapter for SuperpageBlock { owned_hook });

impl SuperpageBlock {
    /// Builds an SPB in place over `superpage_count` freshly committed
    /// superpages starting at `at`, reserving the trailing `huge_pages`
    /// pages of the run for a huge allocation.
    ///
    /// # Safety
    ///
    /// `at` must be superpage-aligned, and the run committed and otherwise
    /// unused.
    pub unsafe fn init(
        at: NonNull<u8>,
        superpage_count: usize,
        huge_pages: usize,
        owner: *mut AtomicFreeList,
    ) -> NonNull<SuperpageBlock> {
        alloc_debug_assert!(at.as_ptr() as usize % SUPERPAGE_SIZE == 0);
        alloc_assert!(
            superpage_count * PAGES_PER_SUPERPAGE >= huge_pages + HEADER_PAGES,
            "superpage run too short: {} superpages for {} huge pages",
            superpage_count,
            huge_pages
        );
        let spb = at.cast::<SuperpageBlock>();
        let s = spb.as_ptr();
        ptr::addr_of_mut!((*s).owner).write(AtomicPtr::new(owner));
        ptr::addr_of_mut!((*s).superpage_count).write(superpage_count);
        ptr::addr_of_mut!((*s).huge_alloc_page_index)
            .write(superpage_count * PAGES_PER_SUPERPAGE - huge_pages);
        ptr::addr_of_mut!((*s).owned_hook).write(ListHook::new());
        ptr::addr_of_mut!((*s).unused).write(QuickList::new());

        let me = &mut *spb.as_ptr();
        let available = me.available_index();
        me.format(0, HEADER_PAGES, PageBlockKind::Reserved);
        if available > HEADER_PAGES {
            me.format(HEADER_PAGES, available, PageBlockKind::Unused);
            me.unused.insert(me.header_at(HEADER_PAGES));
        }
        if available < PAGES_PER_SUPERPAGE {
            me.format(available, PAGES_PER_SUPERPAGE, PageBlockKind::Huge);
        }
        trace!(
            "SuperpageBlock::init at {:p}: {} superpages, {} huge pages",
            at.as_ptr(),
            superpage_count,
            huge_pages
        );
        spb
    }

    pub fn base_addr(&self) -> usize {
        self as *const _ as usize
    }

    pub fn superpage_count(&self) -> usize {
        self.superpage_count
    }

    pub fn huge_page_index(&self) -> usize {
        self.huge_alloc_page_index
    }

    /// One past the last table index usable for page blocks (the huge
    /// allocation may claim the table's tail).
    fn available_index(&self) -> usize {
        core::cmp::min(self.huge_alloc_page_index, PAGES_PER_SUPERPAGE)
    }

    /// Recovers the SPB from any address within its *first* superpage.
    pub unsafe fn from_inside_first_superpage(p: NonNull<u8>) -> NonNull<SuperpageBlock> {
        let addr = p.as_ptr() as usize & !(SUPERPAGE_SIZE - 1);
        NonNull::new_unchecked(addr as *mut SuperpageBlock)
    }

    pub fn header_at(&self, index: usize) -> NonNull<PageBlockHeader> {
        alloc_debug_assert!(index < PAGES_PER_SUPERPAGE);
        unsafe {
            NonNull::new_unchecked(self.table.as_ptr().add(index) as *mut PageBlockHeader)
        }
    }

    /// Head record of the run containing `addr` (anywhere in the first
    /// superpage's page-block area).
    pub fn page_block_header(&self, addr: usize) -> NonNull<PageBlockHeader> {
        let base = self.base_addr();
        alloc_debug_assert!(addr >= base && addr < base + SUPERPAGE_SIZE);
        let index = (addr - base) / PAGE_SIZE;
        let head = unsafe { self.header_at(index).as_ref().head } as usize;
        self.header_at(head)
    }

    pub fn in_huge_region(&self, addr: usize) -> bool {
        let base = self.base_addr();
        alloc_debug_assert!(addr >= base);
        alloc_debug_assert!(addr < base + self.superpage_count * SUPERPAGE_SIZE);
        addr >= base + self.huge_alloc_page_index * PAGE_SIZE
    }

    /// The huge allocation's memory.
    pub fn huge_region(&self) -> Block {
        let pages = self.superpage_count * PAGES_PER_SUPERPAGE - self.huge_alloc_page_index;
        alloc_debug_assert!(pages > 0);
        let addr = self.base_addr() + self.huge_alloc_page_index * PAGE_SIZE;
        Block {
            ptr: unsafe { NonNull::new_unchecked(addr as *mut u8) },
            size: pages * PAGE_SIZE,
        }
    }

    /// Tears down the huge allocation's footprint in the *first* superpage
    /// and shrinks the header to one superpage. The caller deals with the
    /// trailing superpages (tracker trim + uncommit) beforehand.
    pub unsafe fn destroy_huge_alloc(&mut self) {
        if self.huge_alloc_page_index < PAGES_PER_SUPERPAGE {
            self.free_page_block(self.header_at(self.huge_alloc_page_index));
        }
        self.superpage_count = 1;
        self.huge_alloc_page_index = PAGES_PER_SUPERPAGE;
    }

    /// Cuts a page block of exactly `pages` pages out of some free run, or
    /// reports that no free run is long enough.
    pub unsafe fn allocate_page_block(
        &mut self,
        pages: usize,
        kind: PageBlockKind,
    ) -> Option<NonNull<PageBlockHeader>> {
        alloc_debug_assert!(pages > 0);
        alloc_debug_assert!(pages <= AVAILABLE_PAGES);
        alloc_debug_assert!(
            kind == PageBlockKind::Small || kind == PageBlockKind::Medium
        );
        let head = self.unused.take(pages)?;
        let index = head.as_ref().index();
        let run = head.as_ref().run_length();
        if run > pages {
            // Give the tail back.
            self.format(index + pages, index + run, PageBlockKind::Unused);
            self.unused.insert(self.header_at(index + pages));
        }
        self.format(index, index + pages, kind);
        Some(head)
    }

    /// Returns a page block to the free state, merging with free neighbours.
    pub unsafe fn free_page_block(&mut self, pbh: NonNull<PageBlockHeader>) {
        let mut start = pbh.as_ref().index();
        let mut end = start + pbh.as_ref().run_length();
        if start > 0 {
            let left = self.header_at(start - 1);
            if left.as_ref().kind == PageBlockKind::Unused {
                let head = left.as_ref().head as usize;
                self.unused.remove(self.header_at(head));
                start = head;
            }
        }
        if end < PAGES_PER_SUPERPAGE {
            let right = self.header_at(end);
            if right.as_ref().kind == PageBlockKind::Unused {
                self.unused.remove(right);
                end += right.as_ref().run_length();
            }
        }
        self.format(start, end, PageBlockKind::Unused);
        self.unused.insert(self.header_at(start));
    }

    /// True iff every non-Reserved, non-Huge page is free.
    pub fn all_page_blocks_unused(&self) -> bool {
        self.unused.stored_pages() == self.available_index() - HEADER_PAGES
    }

    /// True iff releasing this block would free no live allocation: one
    /// superpage, no huge region, every page block unused.
    pub fn completely_unused(&self) -> bool {
        self.superpage_count == 1
            && self.huge_alloc_page_index == PAGES_PER_SUPERPAGE
            && self.all_page_blocks_unused()
    }

    pub fn owner(&self) -> *mut AtomicFreeList {
        self.owner.load(Ordering::Acquire)
    }

    pub fn disown(&self) {
        self.owner.store(ptr::null_mut(), Ordering::Release);
    }

    /// Claims an orphaned block. Exactly one of any number of racing
    /// adopters succeeds; the losers observe the winner through
    /// [`SuperpageBlock::owner`].
    pub fn adopt(&self, new_owner: *mut AtomicFreeList) -> bool {
        self.owner
            .compare_exchange(
                ptr::null_mut(),
                new_owner,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    unsafe fn format(&mut self, from: usize, to: usize, kind: PageBlockKind) {
        alloc_debug_assert!(from < to);
        alloc_debug_assert!(to <= PAGES_PER_SUPERPAGE);
        let run_length = (to - from) as u16;
        for i in from..to {
            let h = self.header_at(i).as_ptr();
            (*h).kind = kind;
            (*h).run_length = run_length;
            (*h).head = from as u16;
        }
    }

    /// Walks the page-block table checking every structural invariant:
    /// runs tile the table, back-pointers agree, free neighbours are always
    /// merged, and the quicklist accounts for exactly the free pages.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let mut i = 0;
        let mut unused_pages = 0;
        let mut prev_unused = false;
        while i < PAGES_PER_SUPERPAGE {
            let head = unsafe { self.header_at(i).as_ref() };
            assert_eq!(head.head as usize, i, "record {} is not a head", i);
            let len = head.run_length();
            assert!(len >= 1);
            assert!(i + len <= PAGES_PER_SUPERPAGE);
            for j in i..i + len {
                let rec = unsafe { self.header_at(j).as_ref() };
                assert_eq!(rec.head as usize, i);
                assert_eq!(rec.run_length(), len);
                assert_eq!(rec.kind, head.kind);
            }
            if head.kind == PageBlockKind::Unused {
                assert!(!prev_unused, "adjacent unused runs at {}", i);
                unused_pages += len;
                prev_unused = true;
            } else {
                prev_unused = false;
            }
            i += len;
        }
        assert_eq!(i, PAGES_PER_SUPERPAGE);
        assert_eq!(unused_pages, self.unused.stored_pages());
    }
}
