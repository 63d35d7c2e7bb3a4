// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 or the MIT license, at your
// option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Bit manipulation helpers for the superpage tracker's bitmap words.
//!
//! Bits are indexed LSB to MSB, so bit `b` of word `w` is superpage number
//! `w * BITS + b`. The algorithms work for any word width; `usize` gives the
//! natural 64 bits on the targets we care about.

use alloc_assert::alloc_debug_assert;

pub type Word = usize;
pub const BITS: usize = Word::BITS as usize;

/// `count` ones in `[0, count)`, zeros above.
#[inline]
pub fn lsb_ones(count: usize) -> Word {
    alloc_debug_assert!(count <= BITS);
    if count == 0 {
        0
    } else {
        Word::MAX >> (BITS - count)
    }
}

/// Ones exactly in `[start, start + size)`.
#[inline]
pub fn window_size(start: usize, size: usize) -> Word {
    alloc_debug_assert!(start + size <= BITS);
    if size == 0 {
        0
    } else {
        lsb_ones(size) << start
    }
}

/// Ones exactly in `[start, end)`.
#[inline]
pub fn window_bound(start: usize, end: usize) -> Word {
    alloc_debug_assert!(start <= end);
    alloc_debug_assert!(end <= BITS);
    window_size(start, end - start)
}

#[inline]
pub fn is_set(word: Word, bit: usize) -> bool {
    alloc_debug_assert!(bit < BITS);
    word & (1 << bit) != 0
}

#[inline]
pub fn count_msb_zeros(word: Word) -> usize {
    word.leading_zeros() as usize
}

#[inline]
pub fn count_msb_ones(word: Word) -> usize {
    word.leading_ones() as usize
}

/// Offset of the first run of `len` zero bits of `word` inside
/// `[from_bit, up_to_bit)`, or `BITS` if there is none. Scans with a sliding
/// window mask.
pub fn find_zero_subsequence(word: Word, len: usize, from_bit: usize, up_to_bit: usize) -> usize {
    alloc_debug_assert!(len > 0);
    alloc_debug_assert!(from_bit <= up_to_bit);
    alloc_debug_assert!(up_to_bit <= BITS);
    alloc_debug_assert!(from_bit + len <= up_to_bit);
    let mut window_end = from_bit + len;
    let mut window = window_bound(from_bit, window_end);
    while window_end <= up_to_bit {
        if word & window == 0 {
            return window_end - len;
        }
        window <<= 1;
        window_end += 1;
    }
    BITS
}

/// Offset of the last zero bit of `word` in `[0, pos]`, or `BITS` if every
/// one of those bits is set.
#[inline]
pub fn find_previous_zero(word: Word, pos: usize) -> usize {
    alloc_debug_assert!(pos < BITS);
    // Shift so that `pos` becomes the MSB, then count ones down from it.
    let shifted = word << (BITS - 1 - pos);
    let distance = count_msb_ones(shifted);
    if distance > pos {
        BITS
    } else {
        pos - distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, TestResult};

    #[test]
    fn windows() {
        assert_eq!(lsb_ones(0), 0);
        assert_eq!(lsb_ones(BITS), Word::MAX);
        assert_eq!(lsb_ones(3), 0b111);
        assert_eq!(window_bound(2, 5), 0b11100);
        assert_eq!(window_bound(4, 4), 0);
        assert_eq!(window_bound(0, BITS), Word::MAX);
    }

    #[test]
    fn zero_subsequence_examples() {
        assert_eq!(find_zero_subsequence(0, 4, 0, BITS), 0);
        assert_eq!(find_zero_subsequence(0b1111, 4, 0, BITS), 4);
        assert_eq!(find_zero_subsequence(0b10111, 1, 0, BITS), 3);
        // Respects the search window bounds.
        assert_eq!(find_zero_subsequence(0, 4, 7, BITS), 7);
        assert_eq!(find_zero_subsequence(Word::MAX, 1, 0, BITS), BITS);
        // A fit ending exactly at the upper bound is found.
        assert_eq!(find_zero_subsequence(Word::MAX >> 2, 2, 0, BITS), BITS - 2);
        assert_eq!(find_zero_subsequence(!(0b11 << 10), 2, 0, 12), 10);
    }

    #[test]
    fn previous_zero_examples() {
        assert_eq!(find_previous_zero(0, 17), 17);
        assert_eq!(find_previous_zero(Word::MAX, 17), BITS);
        assert_eq!(find_previous_zero(0b1000, 3), 2);
        assert_eq!(find_previous_zero(0b1110, 3), 0);
        assert_eq!(find_previous_zero(0b1111, 3), BITS);
        assert_eq!(find_previous_zero(1 << (BITS - 1), BITS - 1), BITS - 2);
    }

    quickcheck! {
        fn found_window_is_zero(word: Word, len: usize, from: usize) -> TestResult {
            let len = len % BITS + 1;
            let from = from % BITS;
            if from + len > BITS {
                return TestResult::discard();
            }
            let pos = find_zero_subsequence(word, len, from, BITS);
            if pos == BITS {
                return TestResult::passed();
            }
            TestResult::from_bool(
                pos >= from && word & window_bound(pos, pos + len) == 0
            )
        }

        fn previous_zero_matches_naive(word: Word, pos: usize) -> bool {
            let pos = pos % BITS;
            let naive = (0..=pos).rev().find(|&b| !is_set(word, b));
            find_previous_zero(word, pos) == naive.unwrap_or(BITS)
        }

        fn window_bound_popcount(start: usize, end: usize) -> TestResult {
            let start = start % (BITS + 1);
            let end = end % (BITS + 1);
            if start > end {
                return TestResult::discard();
            }
            TestResult::from_bool(
                window_bound(start, end).count_ones() as usize == end - start
            )
        }
    }
}
