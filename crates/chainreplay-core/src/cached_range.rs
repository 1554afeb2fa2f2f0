//! Cached-range bookkeeping for historical sync.
//!
//! A cached range records a contiguous block span already fetched and stored
//! for one filter key. Ranges for a key are kept non-overlapping: inserting a
//! span merges it with every range it overlaps or touches.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRange {
    pub filter_key: String,
    pub start_block: u64,
    pub end_block: u64,
    /// Timestamp of `end_block`.
    pub end_block_timestamp: u64,
}

/// Merge overlapping and adjacent ranges. Input order does not matter; the
/// output is sorted by `start_block` and pairwise disjoint with gaps of at
/// least one block. All ranges are assumed to share one filter key.
pub fn merge_ranges(mut ranges: Vec<CachedRange>) -> Vec<CachedRange> {
    ranges.sort_by_key(|r| (r.start_block, r.end_block));
    let mut merged: Vec<CachedRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start_block <= last.end_block.saturating_add(1) => {
                if range.end_block > last.end_block {
                    last.end_block = range.end_block;
                    last.end_block_timestamp = range.end_block_timestamp;
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Sub-spans of `[start, end]` not covered by `cached`.
pub fn uncached_spans(start: u64, end: u64, cached: &[CachedRange]) -> Vec<(u64, u64)> {
    if start > end {
        return vec![];
    }
    let mut spans = Vec::new();
    let mut cursor = start;
    for range in merge_ranges(cached.to_vec()) {
        if range.end_block < cursor {
            continue;
        }
        if range.start_block > end {
            break;
        }
        if range.start_block > cursor {
            spans.push((cursor, range.start_block - 1));
        }
        match range.end_block.checked_add(1) {
            Some(next) => cursor = next,
            None => return spans,
        }
        if cursor > end {
            return spans;
        }
    }
    spans.push((cursor, end));
    spans
}

/// The merged range that contains `start_block`, i.e. the contiguous
/// progress made from the filter's start.
pub fn starting_range_end(ranges: &[CachedRange], start_block: u64) -> Option<CachedRange> {
    merge_ranges(ranges.to_vec())
        .into_iter()
        .find(|r| r.start_block <= start_block && start_block <= r.end_block)
}

/// Split `[from, to]` into windows of at most `window` blocks.
pub fn split_span(from: u64, to: u64, window: u64) -> Vec<(u64, u64)> {
    let window = window.max(1);
    let mut chunks = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(window - 1).min(to);
        chunks.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn r(start: u64, end: u64) -> CachedRange {
        CachedRange {
            filter_key: "k".into(),
            start_block: start,
            end_block: end,
            end_block_timestamp: end * 10,
        }
    }

    #[test]
    fn merges_adjacent_and_overlapping() {
        let merged = merge_ranges(vec![r(10, 20), r(0, 5), r(6, 9), r(15, 30), r(40, 50)]);
        assert_eq!(merged, vec![r(0, 30), r(40, 50)]);
    }

    #[test]
    fn merge_keeps_timestamp_of_furthest_end() {
        let merged = merge_ranges(vec![r(0, 100), r(10, 20)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].end_block_timestamp, 1000);
    }

    #[test]
    fn merge_is_idempotent() {
        let once = merge_ranges(vec![r(0, 3), r(2, 8), r(20, 25)]);
        let twice = merge_ranges(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn uncached_spans_diff() {
        let cached = vec![r(10, 19), r(30, 39)];
        assert_eq!(
            uncached_spans(0, 50, &cached),
            vec![(0, 9), (20, 29), (40, 50)]
        );
        assert_eq!(uncached_spans(10, 19, &cached), vec![]);
        assert_eq!(uncached_spans(15, 35, &cached), vec![(20, 29)]);
        assert_eq!(uncached_spans(5, 4, &cached), vec![]);
        assert_eq!(uncached_spans(0, 10, &[]), vec![(0, 10)]);
    }

    #[test]
    fn starting_range_tracks_contiguous_progress() {
        let ranges = vec![r(100, 150), r(151, 200), r(300, 400)];
        assert_eq!(starting_range_end(&ranges, 100).unwrap().end_block, 200);
        assert!(starting_range_end(&ranges, 50).is_none());
    }

    #[test]
    fn split_span_windows() {
        assert_eq!(split_span(0, 9, 4), vec![(0, 3), (4, 7), (8, 9)]);
        assert_eq!(split_span(5, 5, 100), vec![(5, 5)]);
        assert!(split_span(6, 5, 100).is_empty());
    }

    /// For many pseudo-random insertion sequences the merged set is disjoint
    /// and covers exactly the union of inserted spans.
    #[test]
    fn merge_preserves_union_and_disjointness() {
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..200 {
            let mut inserted = Vec::new();
            let mut state: Vec<CachedRange> = Vec::new();
            for _ in 0..(next() % 12 + 1) {
                let start = next() % 120;
                let len = next() % 15;
                let range = r(start, start + len);
                inserted.push(range.clone());
                state.push(range);
                state = merge_ranges(state);
            }

            for pair in state.windows(2) {
                assert!(pair[0].end_block + 1 < pair[1].start_block, "{pair:?}");
            }

            let expected: BTreeSet<u64> = inserted
                .iter()
                .flat_map(|r| r.start_block..=r.end_block)
                .collect();
            let actual: BTreeSet<u64> = state
                .iter()
                .flat_map(|r| r.start_block..=r.end_block)
                .collect();
            assert_eq!(expected, actual);
        }
    }
}
