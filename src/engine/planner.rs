/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! Segment planning: file size to ordered, contiguous byte ranges.

use crate::config::{MAX_SEGMENTS, MIN_SEGMENTS};

/// A planned byte range, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl PlannedRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Split `total_size` bytes into `count` contiguous ranges covering
/// `[0, total_size - 1]`.
///
/// Segments `0..count-1` each get `total_size / count` bytes; the last
/// segment absorbs the remainder and so is never smaller than the others.
/// The zero-byte case yields no ranges; the caller records a single
/// already-completed empty segment for it.
///
/// Pure and deterministic: resuming after a restart replans identical
/// ranges from the persisted (size, count) pair.
pub fn plan_segments(total_size: u64, count: usize) -> Vec<PlannedRange> {
    if total_size == 0 {
        return Vec::new();
    }

    let count = count.clamp(MIN_SEGMENTS, MAX_SEGMENTS) as u64;
    // A 3-byte file cannot carry 8 non-empty ranges
    let count = count.min(total_size);

    let base = total_size / count;
    let mut ranges = Vec::with_capacity(count as usize);
    for i in 0..count {
        let start = i * base;
        let end = if i == count - 1 {
            total_size - 1
        } else {
            start + base - 1
        };
        ranges.push(PlannedRange {
            index: i as usize,
            start,
            end,
        });
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_contiguous(ranges: &[PlannedRange], total: u64) {
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[ranges.len() - 1].end, total - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
        let sum: u64 = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(sum, total);
        for (i, r) in ranges.iter().enumerate() {
            assert_eq!(r.index, i);
        }
    }

    #[test]
    fn test_even_split() {
        let ranges = plan_segments(8 * 1024 * 1024, 8);
        assert_eq!(ranges.len(), 8);
        assert_contiguous(&ranges, 8 * 1024 * 1024);
        // 7 equal segments, last absorbs the (empty) remainder
        for r in &ranges[..7] {
            assert_eq!(r.len(), 1024 * 1024);
        }
        assert_eq!(ranges[7].len(), 1024 * 1024);
    }

    #[test]
    fn test_remainder_goes_to_last() {
        let ranges = plan_segments(1003, 4);
        assert_eq!(ranges.len(), 4);
        assert_contiguous(&ranges, 1003);
        assert_eq!(ranges[0].len(), 250);
        assert_eq!(ranges[1].len(), 250);
        assert_eq!(ranges[2].len(), 250);
        assert_eq!(ranges[3].len(), 253);
        assert!(ranges[3].len() >= ranges[0].len());
    }

    #[test]
    fn test_tiny_file_never_yields_empty_ranges() {
        let ranges = plan_segments(3, 8);
        assert_eq!(ranges.len(), 3);
        assert_contiguous(&ranges, 3);
        for r in &ranges {
            assert!(r.len() >= 1);
        }
    }

    #[test]
    fn test_zero_byte_file() {
        assert!(plan_segments(0, 4).is_empty());
    }

    #[test]
    fn test_count_clamped() {
        assert_eq!(plan_segments(1024, 0).len(), 1);
        assert_eq!(plan_segments(1024 * 1024, 64).len(), 16);
    }

    #[test]
    fn test_deterministic() {
        for size in [1u64, 17, 4096, 1_000_003, 1 << 30] {
            for count in 1..=16 {
                let a = plan_segments(size, count);
                let b = plan_segments(size, count);
                assert_eq!(a, b);
                assert_contiguous(&a, size);
            }
        }
    }
}
