// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Positional change sets for ordered collections.
//!
//! A `CollectionChangeSet` describes the transformation of an ordered row
//! sequence between two snapshots: deletions are expressed in the old
//! coordinate space, insertions and `modifications_new` in the new one, and
//! `modifications` in the old one. Applying deletions (descending), then
//! insertions (ascending) to the old sequence yields the new sequence; moves
//! are a semantic refinement whose endpoints are always also present in
//! `deletions`/`insertions`.
//!
//! While the transaction-log observer is feeding list operations in, the set
//! is kept in "live" coordinates: `modifications_new` and the per-column sets
//! track the current arrangement and `parse_complete` back-computes the
//! old-coordinate `modifications`.

use std::collections::BTreeMap;

use sync_types::{ColKey, ObjKey};

use crate::index_set::IndexSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Move {
    pub from: usize,
    pub to: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionChangeSet {
    /// Positions removed, in pre-change coordinates.
    pub deletions: IndexSet,
    /// Positions added, in post-change coordinates.
    pub insertions: IndexSet,
    /// Positions modified, in pre-change coordinates.
    pub modifications: IndexSet,
    /// Positions modified, in post-change coordinates.
    pub modifications_new: IndexSet,
    pub moves: Vec<Move>,
    /// Modified positions per column, in post-change coordinates.
    pub columns: BTreeMap<ColKey, IndexSet>,
    /// The object owning this collection was deleted.
    pub root_deleted: bool,
    /// The collection was cleared wholesale at some point in the window.
    pub collection_cleared: bool,
}

impl CollectionChangeSet {
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty()
            && self.insertions.is_empty()
            && self.modifications.is_empty()
            && self.modifications_new.is_empty()
            && self.moves.is_empty()
            && !self.root_deleted
            && !self.collection_cleared
    }

    // ---------------------------------------------------------------------
    // Builder operations, driven positionally by the transaction-log
    // observer. `index` arguments are in live (current) coordinates.

    pub fn modify(&mut self, index: usize, col: Option<ColKey>) {
        self.modifications_new.add(index);
        if let Some(col) = col {
            self.columns.entry(col).or_default().add(index);
        }
    }

    pub fn insert(&mut self, index: usize) {
        self.insert_many(index, 1);
    }

    pub fn insert_many(&mut self, index: usize, count: usize) {
        self.modifications_new.shift_for_insert_range(index, index + count);
        for set in self.columns.values_mut() {
            set.shift_for_insert_range(index, index + count);
        }
        self.insertions.shift_for_insert_range(index, index + count);
        self.insertions.add_range(index, index + count);
        for m in &mut self.moves {
            if m.to >= index {
                m.to += count;
            }
        }
    }

    pub fn erase(&mut self, index: usize) {
        self.modifications_new.erase_at(index);
        for set in self.columns.values_mut() {
            set.erase_at(index);
        }
        self.moves.retain(|m| m.to != index);
        for m in &mut self.moves {
            if m.to > index {
                m.to -= 1;
            }
        }
        if let Some(unshifted) = self.insertions.erase_or_unshift(index) {
            self.deletions.add_shifted(unshifted);
        }
    }

    /// `current_size` is the number of rows at the moment of the clear.
    pub fn clear(&mut self, current_size: usize) {
        let old_size = current_size + self.deletions.count() - self.insertions.count();
        self.modifications_new.clear();
        self.insertions.clear();
        self.moves.clear();
        self.columns.clear();
        self.deletions.set(old_size);
        self.collection_cleared = true;
    }

    pub fn move_entry(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }

        let was_modified = self.modifications_new.contains(from);
        let moved_cols: Vec<ColKey> = self
            .columns
            .iter()
            .filter(|(_, set)| set.contains(from))
            .map(|(col, _)| *col)
            .collect();

        // Chain onto an existing move of the same row, shifting the rest.
        let mut updated_existing = false;
        for m in &mut self.moves {
            if !updated_existing && m.to == from {
                m.to = to;
                updated_existing = true;
                continue;
            }
            if m.to > from {
                m.to -= 1;
            }
            if m.to >= to {
                m.to += 1;
            }
        }

        if updated_existing {
            self.insertions.erase_at(from);
            self.insertions.shift_for_insert_at(to);
            self.insertions.add(to);
        } else {
            match self.insertions.erase_or_unshift(from) {
                None => {
                    // A row inserted in this window changed position: it is
                    // still just an insertion.
                    self.insertions.shift_for_insert_at(to);
                    self.insertions.add(to);
                }
                Some(unshifted) => {
                    self.insertions.shift_for_insert_at(to);
                    self.insertions.add(to);
                    let old_pos = self.deletions.shift(unshifted);
                    self.deletions.add(old_pos);
                    self.moves.push(Move { from: old_pos, to });
                }
            }
        }

        self.modifications_new.erase_at(from);
        self.modifications_new.shift_for_insert_at(to);
        if was_modified {
            self.modifications_new.add(to);
        }
        for (col, set) in self.columns.iter_mut() {
            set.erase_at(from);
            set.shift_for_insert_at(to);
            if moved_cols.contains(col) {
                set.add(to);
            }
        }
    }

    /// Drop moves whose endpoints are no longer present, leaving the plain
    /// deletion/insertion pair behind.
    pub fn clean_up_stale_moves(&mut self) {
        let (deletions, insertions) = (&self.deletions, &self.insertions);
        self.moves
            .retain(|m| deletions.contains(m.from) && insertions.contains(m.to));
    }

    /// Materialize the old-coordinate `modifications` from the live
    /// `modifications_new`. Called once when the observer finishes parsing.
    pub fn parse_complete(&mut self) {
        self.clean_up_stale_moves();
        let mut old = IndexSet::new();
        for index in self.modifications_new.iter() {
            if self.insertions.contains(index) {
                continue;
            }
            old.add(self.deletions.shift(self.insertions.unshift(index)));
        }
        self.modifications = old;
    }

    // ---------------------------------------------------------------------

    /// Compute the change set turning `prev` into `next`.
    ///
    /// Rows present in both sequences that fall outside the longest common
    /// subsequence are reported as moves, unless `move_candidates` restricts
    /// which old positions may move, in which case the remainder degrade to a
    /// plain deletion/insertion pair.
    pub fn calculate(
        prev: &[ObjKey],
        next: &[ObjKey],
        mut row_did_change: impl FnMut(ObjKey) -> bool,
        move_candidates: Option<&IndexSet>,
    ) -> CollectionChangeSet {
        let mut set = CollectionChangeSet::default();

        let old_index: std::collections::HashMap<ObjKey, usize> =
            prev.iter().enumerate().map(|(i, k)| (*k, i)).collect();

        let mut matched_old = vec![false; prev.len()];
        // (old index, new index, key), in new order.
        let mut matched: Vec<(usize, usize, ObjKey)> = Vec::new();
        for (j, key) in next.iter().enumerate() {
            match old_index.get(key) {
                Some(&i) => {
                    matched_old[i] = true;
                    matched.push((i, j, *key));
                }
                None => set.insertions.add(j),
            }
        }
        for (i, was_matched) in matched_old.iter().enumerate() {
            if !was_matched {
                set.deletions.add(i);
            }
        }

        // Rows keeping their relative order form the longest increasing
        // subsequence of new positions when visited in old order; everything
        // else moved.
        matched.sort_unstable_by_key(|&(i, _, _)| i);
        let in_lis = longest_increasing_subsequence(&matched);
        let mut moved = vec![false; matched.len()];
        for (idx, &(i, j, _)) in matched.iter().enumerate() {
            if in_lis[idx] {
                continue;
            }
            moved[idx] = true;
            set.deletions.add(i);
            set.insertions.add(j);
            if move_candidates.map_or(true, |candidates| candidates.contains(i)) {
                set.moves.push(Move { from: i, to: j });
            }
        }
        set.moves.sort_unstable_by_key(|m| m.to);

        for (idx, &(i, j, key)) in matched.iter().enumerate() {
            if !row_did_change(key) {
                continue;
            }
            if moved[idx] {
                // Moved and modified: reported at the new position alongside
                // the move entry.
                set.modifications_new.add(j);
            } else {
                set.modifications.add(i);
                set.modifications_new.add(j);
            }
        }

        set
    }

    /// Compose `new_changes`, produced at a later version, into this set so
    /// the result is equivalent to both applied in sequence.
    pub fn merge(&mut self, mut new_changes: CollectionChangeSet) {
        self.root_deleted |= new_changes.root_deleted;

        if new_changes.collection_cleared {
            // A later clear wipes everything this window inserted and turns
            // every surviving pre-existing row into a deletion.
            let old_insertions = std::mem::take(&mut self.insertions);
            for d in new_changes.deletions.iter() {
                if !old_insertions.contains(d) {
                    let old_pos = self.deletions.shift(old_insertions.unshift(d));
                    self.deletions.add(old_pos);
                }
            }
            self.modifications.clear();
            self.modifications_new.clear();
            self.columns.clear();
            self.moves.clear();
            self.collection_cleared = true;
            return;
        }
        if new_changes.is_empty() {
            return;
        }

        let old_insertions = self.insertions.clone();
        let old_deletions = self.deletions.clone();

        // --- moves -------------------------------------------------------
        let mut moves: Vec<Move> = Vec::new();
        for mut m in self.moves.drain(..) {
            if let Some(pos) = new_changes.moves.iter().position(|n| n.from == m.to) {
                // The row moved again: collapse into one move.
                m.to = new_changes.moves[pos].to;
                new_changes.moves.swap_remove(pos);
                moves.push(m);
            } else if new_changes.deletions.contains(m.to) {
                // The moved row was deleted afterwards; the deletion at the
                // original position survives below.
            } else {
                m.to = new_changes
                    .insertions
                    .shift(new_changes.deletions.unshift(m.to));
                moves.push(m);
            }
        }
        // Carry modifications of rows the new window moved.
        let mut carried_mods: Vec<usize> = Vec::new();
        let mut carried_cols: Vec<(ColKey, usize)> = Vec::new();
        for n in &new_changes.moves {
            if self.modifications_new.contains(n.from) {
                carried_mods.push(n.to);
            }
            for (col, set) in &self.columns {
                if set.contains(n.from) {
                    carried_cols.push((*col, n.to));
                }
            }
        }
        for n in new_changes.moves.drain(..) {
            if old_insertions.contains(n.from) {
                // Row created in the old window: its insertion simply lands
                // at the new position, no move is reported.
                continue;
            }
            let from = old_deletions.shift(old_insertions.unshift(n.from));
            moves.push(Move { from, to: n.to });
        }
        self.moves = moves;

        // --- modifications in new coordinates ----------------------------
        self.modifications_new.erase_set(&new_changes.deletions);
        for (b, e) in new_changes.insertions.iter_ranges() {
            self.modifications_new.shift_for_insert_range(b, e);
        }
        self.modifications_new.add_set(&new_changes.modifications_new);
        for index in carried_mods {
            self.modifications_new.add(index);
        }
        for set in self.columns.values_mut() {
            set.erase_set(&new_changes.deletions);
            for (b, e) in new_changes.insertions.iter_ranges() {
                set.shift_for_insert_range(b, e);
            }
        }
        for (col, set) in new_changes.columns {
            self.columns.entry(col).or_default().add_set(&set);
        }
        for (col, index) in carried_cols {
            self.columns.entry(col).or_default().add(index);
        }

        // --- modifications in old coordinates ----------------------------
        for i in new_changes.modifications.iter() {
            if old_insertions.contains(i) {
                continue;
            }
            self.modifications
                .add(old_deletions.shift(old_insertions.unshift(i)));
        }

        // --- insertions / deletions --------------------------------------
        self.insertions.erase_set(&new_changes.deletions);
        for (b, e) in new_changes.insertions.iter_ranges() {
            self.insertions.shift_for_insert_range(b, e);
        }
        self.insertions.add_set(&new_changes.insertions);

        self.deletions
            .add_shifted_by(&old_insertions, &new_changes.deletions);

        self.clean_up_stale_moves();
        // Rows that were modified before being deleted stay interesting only
        // as deletions.
        self.modifications.remove_set(&self.deletions);
    }

    #[cfg(debug_assertions)]
    pub fn verify(&self) {
        for m in &self.moves {
            assert!(self.deletions.contains(m.from), "{m:?} missing deletion");
            assert!(self.insertions.contains(m.to), "{m:?} missing insertion");
        }
        for i in self.modifications.iter() {
            assert!(!self.deletions.contains(i));
        }
    }
}

/// Flags the elements of `matched` (sorted by old index) belonging to one
/// longest strictly-increasing subsequence of new indexes.
fn longest_increasing_subsequence(matched: &[(usize, usize, ObjKey)]) -> Vec<bool> {
    let n = matched.len();
    let mut flags = vec![false; n];
    if n == 0 {
        return flags;
    }
    // Patience sorting: tails[k] = index into `matched` of the smallest tail
    // of an increasing subsequence of length k + 1.
    let mut tails: Vec<usize> = Vec::with_capacity(n);
    let mut prev: Vec<Option<usize>> = vec![None; n];
    for (idx, &(_, j, _)) in matched.iter().enumerate() {
        let pos = tails.partition_point(|&t| matched[t].1 < j);
        if pos > 0 {
            prev[idx] = Some(tails[pos - 1]);
        }
        if pos == tails.len() {
            tails.push(idx);
        } else {
            tails[pos] = idx;
        }
    }
    let mut cursor = tails.last().copied();
    while let Some(idx) = cursor {
        flags[idx] = true;
        cursor = prev[idx];
    }
    flags
}
