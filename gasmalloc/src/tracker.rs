// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 or the MIT license, at your
// option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The superpage tracker: concurrent reservation of superpage runs.
//!
//! Two bitmap tables cover the whole address space, one bit per superpage:
//!
//! - `mapping`: set iff the superpage is reserved.
//! - `sequence`: set iff the superpage belongs to a run but is *not* its
//!   first superpage.
//!
//! The first superpage of every run is therefore the unique position with a
//! set mapping bit and a clear sequence bit, which is what lets
//! [`SuperpageTracker::sequence_start`] recover a run's head from any
//! superpage inside it by scanning the sequence table backwards for a zero.
//!
//! Reservation claims the mapping bits with compare-and-swap (single-word
//! runs need one CAS; longer runs claim head, middle and tail words in order
//! and roll back everything set so far if a claim fails). Only after the
//! mapping bits are owned are the sequence bits written, with plain
//! `fetch_or`: no rival can touch them once the mapping bits are ours.
//! Release clears in the opposite order. All accesses are sequentially
//! consistent; the tracker is small and cold enough that there is nothing to
//! win by relaxing.
//!
//! Releasing a run that is not fully reserved, or racing two releases of the
//! same run, is undefined: the tracker trusts the caller to be the unique
//! owner.

use core::ops::Range;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering::SeqCst};

use alloc_assert::{alloc_assert, alloc_debug_assert};
use bootarena::BootArena;

use crate::bitmask::{self, Word, BITS};
use crate::layout::divide_up;

/// Position in a bitmap table: word index plus bit index inside the word.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct Index {
    word: usize,
    bit: usize,
}

impl Index {
    fn of(superpage_num: usize) -> Index {
        Index { word: superpage_num / BITS, bit: superpage_num % BITS }
    }

    fn num(self) -> usize {
        self.word * BITS + self.bit
    }

    fn next(self) -> Index {
        if self.bit == BITS - 1 {
            Index { word: self.word + 1, bit: 0 }
        } else {
            Index { word: self.word, bit: self.bit + 1 }
        }
    }

    fn next_word(self) -> Index {
        Index { word: self.word + 1, bit: 0 }
    }

    fn prev_word_last_bit(self) -> Index {
        alloc_debug_assert!(self.word > 0);
        Index { word: self.word - 1, bit: BITS - 1 }
    }
}

pub struct SuperpageTracker {
    table_size: usize,
    mapping: NonNull<AtomicUsize>,
    sequence: NonNull<AtomicUsize>,
}

unsafe impl Send for SuperpageTracker {}
unsafe impl Sync for SuperpageTracker {}

impl SuperpageTracker {
    /// Builds a tracker for `superpage_total` superpages, with both tables
    /// served (once, permanently) by the bootstrap arena.
    pub fn new(superpage_total: usize, arena: &mut BootArena) -> SuperpageTracker {
        alloc_assert!(superpage_total > 0);
        let table_size = divide_up(superpage_total, BITS);
        let bytes = table_size * core::mem::size_of::<AtomicUsize>();
        let align = core::mem::align_of::<AtomicUsize>();
        let mapping = arena.allocate(bytes, align).cast::<AtomicUsize>();
        let sequence = arena.allocate(bytes, align).cast::<AtomicUsize>();
        for i in 0..table_size {
            unsafe {
                mapping.as_ptr().add(i).write(AtomicUsize::new(0));
                sequence.as_ptr().add(i).write(AtomicUsize::new(0));
            }
        }
        SuperpageTracker { table_size, mapping, sequence }
    }

    /// Number of bytes of arena memory `new` will consume for a tracker of
    /// `superpage_total` superpages. Used to size the bootstrap slab.
    pub fn table_bytes(superpage_total: usize) -> usize {
        2 * divide_up(superpage_total, BITS) * core::mem::size_of::<AtomicUsize>()
    }

    #[inline]
    fn mapping(&self, word: usize) -> &AtomicUsize {
        alloc_debug_assert!(word < self.table_size);
        unsafe { &*self.mapping.as_ptr().add(word) }
    }

    #[inline]
    fn sequence(&self, word: usize) -> &AtomicUsize {
        alloc_debug_assert!(word < self.table_size);
        unsafe { &*self.sequence.as_ptr().add(word) }
    }

    /// Reserves `count` consecutive superpages anywhere inside `search`
    /// (superpage numbers, end exclusive) and returns the run's first
    /// superpage number, or `None` if no fit exists. Exhaustion is for the
    /// caller to escalate; here it is an ordinary outcome.
    ///
    /// The scan is linear, word by word, and avoids re-loading a word it has
    /// already observed when it can restart the search from one.
    pub fn acquire(&self, count: usize, search: Range<usize>) -> Option<usize> {
        alloc_assert!(count > 0);
        alloc_debug_assert!(divide_up(search.end, BITS) <= self.table_size);

        let search_end = Index::of(search.end);
        let mut search_at = Index::of(search.start);
        // Some(w): the value already loaded for search_at's word.
        let mut pending: Option<Word> = None;

        'scan: while search_at < search_end {
            let c = match pending.take() {
                Some(c) => c,
                None => self.mapping(search_at.word).load(SeqCst),
            };

            if c == Word::MAX {
                search_at = search_at.next_word();
                continue;
            }

            // A run that fits inside this one word needs a single CAS.
            let limit =
                if search_at.word == search_end.word { search_end.bit } else { BITS };
            if search_at.bit + count <= limit {
                let pos = bitmask::find_zero_subsequence(c, count, search_at.bit, limit);
                if pos < BITS {
                    let start = Index { word: search_at.word, bit: pos };
                    // Index::of normalizes a run ending exactly at the word
                    // boundary, which keeps start.next() <= end below.
                    let end = Index::of(start.num() + count);
                    if self.set_bits(start, c, end, 0) {
                        return Some(start.num());
                    }
                    // Lost the race for some bit; rescan this word afresh.
                    continue;
                }
            }

            // Otherwise the only candidate starting in this word is its
            // trailing zeros, continuing into the following words:
            // |xxxxx000|00000000|00xxxxxx|
            let msb_zeros =
                core::cmp::min(bitmask::count_msb_zeros(c), BITS - search_at.bit);
            if msb_zeros > 0 {
                let start = Index { word: search_at.word, bit: BITS - msb_zeros };
                let end = Index::of(start.num() + count);
                if !(end <= search_end) {
                    // The candidate would overrun the search interval, and so
                    // would anything later: give up.
                    break;
                }
                // Check the middle words are fully free. On a conflict,
                // resume the scan at the conflicting word without reloading.
                for idx in start.word + 1..end.word {
                    let m = self.mapping(idx).load(SeqCst);
                    if m != 0 {
                        search_at = Index { word: idx, bit: 0 };
                        pending = Some(m);
                        continue 'scan;
                    }
                }
                let tail_bits = bitmask::window_bound(0, end.bit);
                let mut expected_end = 0;
                if tail_bits != 0 {
                    let t = self.mapping(end.word).load(SeqCst);
                    if t & tail_bits != 0 {
                        search_at = end;
                        pending = Some(t);
                        continue 'scan;
                    }
                    expected_end = t;
                }
                if self.set_bits(start, c, end, expected_end) {
                    return Some(start.num());
                }
                // Someone beat us to part of the run; rescan from its start.
                search_at = start;
                continue;
            }

            search_at = search_at.next_word();
        }
        None
    }

    /// Releases a fully reserved run (superpage numbers, end exclusive).
    pub fn release(&self, run: Range<usize>) {
        alloc_debug_assert!(!run.is_empty());
        let start = Index::of(run.start);
        let end = Index::of(run.end);
        alloc_debug_assert!(start.word < self.table_size);
        // Sequence bits go first so that no moment exists where a mapped
        // superpage has a dangling sequence bit.
        self.clear_sequence_bits(start.next(), end);
        self.clear_mapping_bits(start, end);
    }

    /// Shrinks a reserved run to its first superpage, releasing the rest.
    pub fn trim(&self, run: Range<usize>) {
        alloc_debug_assert!(run.len() > 1);
        let start = Index::of(run.start);
        let end = Index::of(run.end);
        alloc_debug_assert!(start.word < self.table_size);
        self.clear_sequence_bits(start.next(), end);
        self.clear_mapping_bits(start.next(), end);
    }

    /// First superpage number of the run containing `superpage_num`.
    ///
    /// The superpage must be part of a reserved run; the walk is a backwards
    /// scan of the sequence table for the first clear bit.
    pub fn sequence_start(&self, superpage_num: usize) -> usize {
        let mut loc = Index::of(superpage_num);
        alloc_debug_assert!(loc.word < self.table_size);
        loop {
            let c = self.sequence(loc.word).load(SeqCst);
            let prev_zero = bitmask::find_previous_zero(c, loc.bit);
            if prev_zero != BITS {
                return Index { word: loc.word, bit: prev_zero }.num();
            }
            loc = loc.prev_word_last_bit();
        }
    }

    pub fn is_mapped(&self, superpage_num: usize) -> bool {
        let loc = Index::of(superpage_num);
        bitmask::is_set(self.mapping(loc.word).load(SeqCst), loc.bit)
    }

    /// Renders one character per superpage of `range`: `_` free, `#` run
    /// start, `=` run continuation, `?` a sequence bit with no mapping bit
    /// (never produced by a correct history).
    pub fn dump(&self, range: Range<usize>) -> String {
        let mut out = String::with_capacity(range.len());
        for num in range {
            let loc = Index::of(num);
            let m = bitmask::is_set(self.mapping(loc.word).load(SeqCst), loc.bit);
            let s = bitmask::is_set(self.sequence(loc.word).load(SeqCst), loc.bit);
            out.push(match (m, s) {
                (false, false) => '_',
                (true, false) => '#',
                (true, true) => '=',
                (false, true) => '?',
            });
        }
        out
    }

    /// Claims the mapping bits of `[start, end)`, expecting the current head
    /// and tail word values observed by the caller. Middle words are claimed
    /// with CAS from zero; on any conflict every bit set so far is reverted
    /// and the call reports failure.
    fn set_mapping_bits(
        &self,
        start: Index,
        expected_start: Word,
        end: Index,
        expected_end: Word,
    ) -> bool {
        alloc_debug_assert!(start < end);
        if start.word == end.word {
            let bits = bitmask::window_bound(start.bit, end.bit);
            return self
                .mapping(start.word)
                .compare_exchange(expected_start, expected_start | bits, SeqCst, SeqCst)
                .is_ok();
        }

        let head_bits = bitmask::window_bound(start.bit, BITS);
        if self
            .mapping(start.word)
            .compare_exchange(expected_start, expected_start | head_bits, SeqCst, SeqCst)
            .is_err()
        {
            return false;
        }
        let mut claimed = start.word + 1;
        while claimed < end.word {
            if self
                .mapping(claimed)
                .compare_exchange(0, Word::MAX, SeqCst, SeqCst)
                .is_err()
            {
                break;
            }
            claimed += 1;
        }
        if claimed == end.word {
            let tail_bits = bitmask::window_bound(0, end.bit);
            if tail_bits == 0 {
                return true;
            }
            if self
                .mapping(end.word)
                .compare_exchange(expected_end, expected_end | tail_bits, SeqCst, SeqCst)
                .is_ok()
            {
                return true;
            }
        }
        // Roll back this attempt's bits.
        for idx in start.word + 1..claimed {
            self.mapping(idx).store(0, SeqCst);
        }
        self.mapping(start.word).fetch_and(!head_bits, SeqCst);
        false
    }

    fn clear_mapping_bits(&self, start: Index, end: Index) {
        alloc_debug_assert!(start < end);
        if start.word == end.word {
            let bits = bitmask::window_bound(start.bit, end.bit);
            self.mapping(start.word).fetch_and(!bits, SeqCst);
            return;
        }
        self.mapping(start.word).fetch_and(!bitmask::window_bound(start.bit, BITS), SeqCst);
        for idx in start.word + 1..end.word {
            self.mapping(idx).store(0, SeqCst);
        }
        let tail_bits = bitmask::window_bound(0, end.bit);
        if tail_bits != 0 {
            self.mapping(end.word).fetch_and(!tail_bits, SeqCst);
        }
    }

    /// Sets the sequence bits of `[start, end)`. No CAS: the caller owns the
    /// range through its mapping bits.
    fn set_sequence_bits(&self, start: Index, end: Index) {
        alloc_debug_assert!(start <= end);
        if start.word == end.word {
            if start.bit < end.bit {
                let bits = bitmask::window_bound(start.bit, end.bit);
                self.sequence(start.word).fetch_or(bits, SeqCst);
            }
            return;
        }
        self.sequence(start.word).fetch_or(bitmask::window_bound(start.bit, BITS), SeqCst);
        for idx in start.word + 1..end.word {
            self.sequence(idx).store(Word::MAX, SeqCst);
        }
        let tail_bits = bitmask::window_bound(0, end.bit);
        if tail_bits != 0 {
            self.sequence(end.word).fetch_or(tail_bits, SeqCst);
        }
    }

    fn clear_sequence_bits(&self, start: Index, end: Index) {
        alloc_debug_assert!(start <= end);
        if start.word == end.word {
            if start.bit < end.bit {
                let bits = bitmask::window_bound(start.bit, end.bit);
                self.sequence(start.word).fetch_and(!bits, SeqCst);
            }
            return;
        }
        self.sequence(start.word).fetch_and(!bitmask::window_bound(start.bit, BITS), SeqCst);
        for idx in start.word + 1..end.word {
            self.sequence(idx).store(0, SeqCst);
        }
        let tail_bits = bitmask::window_bound(0, end.bit);
        if tail_bits != 0 {
            self.sequence(end.word).fetch_and(!tail_bits, SeqCst);
        }
    }

    /// Claims `[start, end)`: mapping bits first, then the sequence bits of
    /// everything but the first superpage.
    fn set_bits(
        &self,
        start: Index,
        expected_start: Word,
        end: Index,
        expected_end: Word,
    ) -> bool {
        if self.set_mapping_bits(start, expected_start, end, expected_end) {
            self.set_sequence_bits(start.next(), end);
            true
        } else {
            false
        }
    }
}
