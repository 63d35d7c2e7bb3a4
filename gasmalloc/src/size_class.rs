// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 or the MIT license, at your
// option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The compile-time table of small size classes.
//!
//! Small allocations are rounded up to a power-of-two class and served as
//! fixed-size cells carved out of a page block. The smallest class must hold
//! a [`FreeCell`](crate::list::FreeCell) (a freed cell is overwritten with
//! its free-list links); the largest is one page, above which allocations get
//! whole page blocks of their own.

use core::mem;

use crate::layout::{PAGE_SHIFT, PAGE_SIZE};
use crate::list::FreeCell;

const fn round_up_pow2(n: usize) -> usize {
    let mut p = 1;
    while p < n {
        p <<= 1;
    }
    p
}

const fn ceil_log2(n: usize) -> usize {
    (usize::BITS - (n - 1).leading_zeros()) as usize
}

/// The smallest class's block size; every allocation is at least this big.
pub const SMALLEST_BLOCK: usize = round_up_pow2(mem::size_of::<FreeCell>());
const MIN_CLASS_SHIFT: usize = ceil_log2(SMALLEST_BLOCK);

/// Sizes below this are small (served from a size class); from here up they
/// get dedicated page blocks.
pub const SMALLEST_MEDIUM: usize = PAGE_SIZE;

pub const NUM_CLASSES: usize = PAGE_SHIFT - MIN_CLASS_SHIFT + 1;

/// One size class's configuration.
#[derive(Copy, Clone, Debug)]
pub struct ClassInfo {
    /// Cell size in bytes (a power of two).
    pub block_size: usize,
    /// Pages per page block of this class.
    pub page_block_pages: usize,
    /// Cells per page block.
    pub cells: usize,
}

/// Pages per page block, chosen so that even the largest class amortizes its
/// page block over several cells.
const fn page_block_pages(block_size: usize) -> usize {
    let pages = (8 * block_size + PAGE_SIZE - 1) / PAGE_SIZE;
    if pages == 0 {
        1
    } else {
        pages
    }
}

const fn build_table() -> [ClassInfo; NUM_CLASSES] {
    let mut table = [ClassInfo { block_size: 0, page_block_pages: 0, cells: 0 }; NUM_CLASSES];
    let mut id = 0;
    while id < NUM_CLASSES {
        let block_size = 1 << (id + MIN_CLASS_SHIFT);
        let pages = page_block_pages(block_size);
        table[id] = ClassInfo {
            block_size,
            page_block_pages: pages,
            cells: pages * PAGE_SIZE / block_size,
        };
        id += 1;
    }
    table
}

pub const CLASSES: [ClassInfo; NUM_CLASSES] = build_table();

/// Maps a small size (`< SMALLEST_MEDIUM`) to its class id.
#[inline]
pub fn class_id(size: usize) -> usize {
    let size = if size < SMALLEST_BLOCK { SMALLEST_BLOCK } else { size };
    ceil_log2(size) - MIN_CLASS_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_shape() {
        assert_eq!(SMALLEST_BLOCK, 16);
        assert_eq!(NUM_CLASSES, 9);
        assert_eq!(CLASSES[0].block_size, 16);
        assert_eq!(CLASSES[NUM_CLASSES - 1].block_size, PAGE_SIZE);
        for info in &CLASSES {
            assert!(info.block_size.is_power_of_two());
            assert_eq!(info.cells * info.block_size, info.page_block_pages * PAGE_SIZE);
            // The full/empty transition logic needs at least two cells.
            assert!(info.cells >= 2);
        }
    }

    #[test]
    fn class_lookup() {
        assert_eq!(class_id(0), 0);
        assert_eq!(class_id(1), 0);
        assert_eq!(class_id(16), 0);
        assert_eq!(class_id(17), 1);
        assert_eq!(class_id(53), 2);
        assert_eq!(class_id(2048), 7);
        assert_eq!(class_id(2049), 8);
        assert_eq!(class_id(4095), 8);
        for size in 1..SMALLEST_MEDIUM {
            let id = class_id(size);
            assert!(CLASSES[id].block_size >= size);
            if id > 0 {
                assert!(CLASSES[id - 1].block_size < size);
            }
        }
    }
}
