// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Compact ordered set of row indexes, stored as disjoint half-open ranges.
//!
//! All positional bookkeeping in collection change sets is expressed through
//! this type: insertion/deletion/modification positions, and the shift and
//! unshift mappings that translate indexes between the coordinate spaces
//! before and after a batch of changes.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSet {
    // Sorted, disjoint, non-adjacent half-open ranges.
    ranges: Vec<(usize, usize)>,
}

impl IndexSet {
    pub fn new() -> IndexSet {
        IndexSet::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = (usize, usize)>) -> IndexSet {
        let mut set = IndexSet::new();
        for (begin, end) in ranges {
            set.add_range(begin, end);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of indexes in the set.
    pub fn count(&self) -> usize {
        self.ranges.iter().map(|(b, e)| e - b).sum()
    }

    /// Number of indexes in `[begin, end)`.
    pub fn count_in(&self, begin: usize, end: usize) -> usize {
        self.ranges
            .iter()
            .map(|&(b, e)| e.min(end).saturating_sub(b.max(begin)))
            .sum()
    }

    pub fn contains(&self, index: usize) -> bool {
        let pos = self.ranges.partition_point(|&(_, e)| e <= index);
        self.ranges
            .get(pos)
            .is_some_and(|&(b, _)| b <= index)
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Replace the contents with `[0, n)`.
    pub fn set(&mut self, n: usize) {
        self.ranges.clear();
        if n > 0 {
            self.ranges.push((0, n));
        }
    }

    pub fn add(&mut self, index: usize) {
        self.add_range(index, index + 1);
    }

    pub fn add_range(&mut self, begin: usize, end: usize) {
        if begin >= end {
            return;
        }
        // First range that could merge with [begin, end): touching counts.
        let first = self.ranges.partition_point(|&(_, e)| e < begin);
        let mut merged = (begin, end);
        let mut last = first;
        while last < self.ranges.len() && self.ranges[last].0 <= merged.1 {
            merged.0 = merged.0.min(self.ranges[last].0);
            merged.1 = merged.1.max(self.ranges[last].1);
            last += 1;
        }
        self.ranges.splice(first..last, [merged]);
    }

    /// Union with another set.
    pub fn add_set(&mut self, other: &IndexSet) {
        for &(b, e) in &other.ranges {
            self.add_range(b, e);
        }
    }

    pub fn remove(&mut self, index: usize) {
        self.remove_range(index, index + 1);
    }

    pub fn remove_range(&mut self, begin: usize, end: usize) {
        if begin >= end {
            return;
        }
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for &(b, e) in &self.ranges {
            if e <= begin || b >= end {
                out.push((b, e));
                continue;
            }
            if b < begin {
                out.push((b, begin));
            }
            if e > end {
                out.push((end, e));
            }
        }
        self.ranges = out;
    }

    pub fn remove_set(&mut self, other: &IndexSet) {
        for &(b, e) in &other.ranges {
            self.remove_range(b, e);
        }
    }

    /// Map `index` from pre-insertion coordinates to post-insertion
    /// coordinates, treating the stored indexes as insertions.
    pub fn shift(&self, mut index: usize) -> usize {
        for stored in self.iter() {
            if stored > index {
                break;
            }
            index += 1;
        }
        index
    }

    /// Map `index` from post-deletion coordinates back through the stored
    /// indexes, treating them as deletions. `index` must not be contained.
    pub fn unshift(&self, index: usize) -> usize {
        debug_assert!(!self.contains(index));
        index - self.count_in(0, index)
    }

    /// Shift every stored index at or after `index` up by one, without adding
    /// `index` itself. Models a row being inserted at `index`.
    pub fn shift_for_insert_at(&mut self, index: usize) {
        self.shift_for_insert_range(index, index + 1);
    }

    pub fn shift_for_insert_range(&mut self, begin: usize, end: usize) {
        let count = end - begin;
        if count == 0 {
            return;
        }
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for &(b, e) in &self.ranges {
            if e <= begin {
                out.push((b, e));
            } else if b >= begin {
                out.push((b + count, e + count));
            } else {
                // Straddles the insertion point: split.
                out.push((b, begin));
                out.push((begin + count, e + count));
            }
        }
        self.ranges = out;
    }

    /// Add `index` expressed in pre-insertion coordinates: the index is first
    /// shifted past the stored contents, then added.
    pub fn add_shifted(&mut self, index: usize) {
        self.add(self.shift(index));
    }

    /// Add each index of `values` after unshifting it through `shifted_by`,
    /// then shifting it into this set's coordinate space.
    pub fn add_shifted_by(&mut self, shifted_by: &IndexSet, values: &IndexSet) {
        for value in values.iter() {
            let unshifted = if shifted_by.contains(value) {
                continue;
            } else {
                shifted_by.unshift(value)
            };
            self.add_shifted(unshifted);
        }
    }

    /// Remove `index` and shift all higher stored indexes down by one. Models
    /// a row being erased at `index`.
    pub fn erase_at(&mut self, index: usize) {
        self.remove(index);
        for range in &mut self.ranges {
            if range.0 > index {
                range.0 -= 1;
                range.1 -= 1;
            } else if range.1 > index {
                range.1 -= 1;
            }
        }
        self.normalize();
    }

    /// Combined erase/lookup used when a row is removed: if `index` is stored
    /// (the row was a fresh insertion) it is erased and `None` returned;
    /// otherwise higher indexes shift down and the pre-insertion coordinate of
    /// `index` is returned.
    pub fn erase_or_unshift(&mut self, index: usize) -> Option<usize> {
        if self.contains(index) {
            self.erase_at(index);
            None
        } else {
            let unshifted = self.unshift(index);
            self.erase_at(index);
            Some(unshifted)
        }
    }

    /// Remove all stored indexes contained in `deletions` and shift the
    /// remainder down accordingly, in one pass.
    pub fn erase_set(&mut self, deletions: &IndexSet) {
        let kept: Vec<usize> = self
            .iter()
            .filter(|i| !deletions.contains(*i))
            .map(|i| deletions.unshift(i))
            .collect();
        self.ranges.clear();
        for i in kept {
            self.add(i);
        }
    }

    fn normalize(&mut self) {
        self.ranges.retain(|&(b, e)| b < e);
        let mut out: Vec<(usize, usize)> = Vec::with_capacity(self.ranges.len());
        for &(b, e) in &self.ranges {
            match out.last_mut() {
                Some(last) if b <= last.1 => last.1 = last.1.max(e),
                _ => out.push((b, e)),
            }
        }
        self.ranges = out;
    }

    pub fn iter_ranges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.ranges.iter().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.ranges.iter().flat_map(|&(b, e)| b..e)
    }
}

impl fmt::Debug for IndexSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.ranges.iter().map(|&(b, e)| b..e))
            .finish()
    }
}

impl FromIterator<usize> for IndexSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> IndexSet {
        let mut set = IndexSet::new();
        for index in iter {
            set.add(index);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{seq::SliceRandom, Rng};

    #[test]
    fn add_merges_adjacent_and_overlapping_ranges() {
        let mut set = IndexSet::new();
        set.add(1);
        set.add(3);
        set.add(2);
        assert_eq!(set.iter_ranges().collect::<Vec<_>>(), vec![(1, 4)]);
        set.add_range(10, 12);
        set.add_range(11, 15);
        assert_eq!(
            set.iter_ranges().collect::<Vec<_>>(),
            vec![(1, 4), (10, 15)]
        );
        assert_eq!(set.count(), 8);
    }

    #[test]
    fn contains_and_count_in() {
        let set = IndexSet::from_ranges([(2, 5), (8, 10)]);
        assert!(set.contains(2));
        assert!(set.contains(4));
        assert!(!set.contains(5));
        assert!(set.contains(9));
        assert_eq!(set.count_in(3, 9), 3);
    }

    #[test]
    fn remove_splits_ranges() {
        let mut set = IndexSet::from_ranges([(0, 10)]);
        set.remove(5);
        assert_eq!(set.iter_ranges().collect::<Vec<_>>(), vec![(0, 5), (6, 10)]);
        set.remove_range(2, 8);
        assert_eq!(set.iter_ranges().collect::<Vec<_>>(), vec![(0, 2), (8, 10)]);
    }

    #[rstest::rstest]
    #[case(&[0, 2, 3], 0, 1)]
    #[case(&[0, 2, 3], 1, 4)]
    #[case(&[0, 2, 3], 2, 5)]
    #[case(&[1, 3], 0, 0)]
    #[case(&[], 9, 9)]
    fn shift_walks_stored_insertions(
        #[case] stored: &[usize],
        #[case] index: usize,
        #[case] expected: usize,
    ) {
        let set: IndexSet = stored.iter().copied().collect();
        assert_eq!(set.shift(index), expected);
    }

    #[test]
    fn unshift_subtracts_deletions_below() {
        let set = IndexSet::from_iter([0, 2, 3]);
        assert_eq!(set.unshift(1), 0);
        assert_eq!(set.unshift(4), 1);
        assert_eq!(set.unshift(6), 3);
    }

    #[test]
    fn shift_and_unshift_are_inverse() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let mut set = IndexSet::new();
            for _ in 0..rng.gen_range(0..20) {
                set.add(rng.gen_range(0..64));
            }
            for i in 0..64 {
                let shifted = set.shift(i);
                assert!(!set.contains(shifted));
                assert_eq!(set.unshift(shifted), i);
            }
        }
    }

    #[test]
    fn erase_at_shifts_following_indexes_down() {
        let mut set = IndexSet::from_iter([1, 3, 5]);
        set.erase_at(3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 4]);
        set.erase_at(0);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn shift_for_insert_at_moves_but_does_not_add() {
        let mut set = IndexSet::from_iter([1, 3]);
        set.shift_for_insert_at(2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 4]);
        assert!(!set.contains(2));
    }

    #[test]
    fn shift_for_insert_splits_straddling_range() {
        let mut set = IndexSet::from_ranges([(0, 4)]);
        set.shift_for_insert_at(2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 3, 4]);
    }

    #[test]
    fn set_replaces_contents() {
        let mut set = IndexSet::from_iter([7, 9]);
        set.set(3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
        set.set(0);
        assert!(set.is_empty());
    }

    #[test]
    fn erase_set_matches_repeated_erase_at() {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let stored: Vec<usize> = (0..40).filter(|_| rng.gen_bool(0.3)).collect();
            let mut deletions: Vec<usize> = (0..40).filter(|_| rng.gen_bool(0.2)).collect();
            let mut a = IndexSet::from_iter(stored.iter().copied());
            let b_input = IndexSet::from_iter(stored.iter().copied());
            let del_set = IndexSet::from_iter(deletions.iter().copied());

            let mut b = b_input;
            b.erase_set(&del_set);

            // erase_at must be applied highest-first to keep coordinates stable.
            deletions.sort_unstable();
            for &d in deletions.iter().rev() {
                a.erase_at(d);
            }
            assert_eq!(a, b);
        }
    }

    #[test]
    fn union_is_order_independent() {
        let mut rng = rand::thread_rng();
        let mut indexes: Vec<usize> = (0..100).collect();
        indexes.shuffle(&mut rng);
        let mut a = IndexSet::new();
        for &i in &indexes {
            if i % 3 != 0 {
                a.add(i);
            }
        }
        let b: IndexSet = (0..100).filter(|i| i % 3 != 0).collect();
        assert_eq!(a, b);
    }
}
