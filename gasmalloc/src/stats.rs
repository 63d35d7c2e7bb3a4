// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 or the MIT license, at your
// option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Lightweight per-thread counters for allocator events.
//!
//! Counting stays off the fast path's shared state: each thread bumps its own
//! counters, and the totals are reported through `log` when a thread heap is
//! dropped. Purely a debugging aid.

use std::cell::RefCell;

#[derive(Default, Debug, Clone, Copy)]
pub struct HeapStats {
    pub small_alloc: u64,
    pub local_free: u64,
    pub remote_push: u64,
    pub inbox_drain: u64,
    pub adoption: u64,
    pub spb_create: u64,
    pub spb_destroy: u64,
    pub huge_trim: u64,
}

thread_local! {
    pub static LOCAL_STATS: RefCell<HeapStats> = RefCell::new(HeapStats::default());
}

/// Snapshot of the current thread's counters.
pub fn snapshot() -> HeapStats {
    LOCAL_STATS.with(|s| *s.borrow())
}

macro_rules! trace_event {
    ($fld:tt) => {
        crate::stats::LOCAL_STATS.with(|s| s.borrow_mut().$fld += 1)
    };
}
pub(crate) use trace_event;
