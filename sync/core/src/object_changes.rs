// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet};

use sync_types::{ColKey, ObjKey};

/// Key-addressed record of what happened to one table between two snapshots.
///
/// Invariants: a key never appears in both `insertions` and `deletions`; a
/// deleted key has no modification record; `clear_did_occur` is sticky and
/// implies `deletions` holds every pre-change key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectChangeSet {
    deletions: BTreeSet<ObjKey>,
    insertions: BTreeSet<ObjKey>,
    modifications: BTreeMap<ObjKey, BTreeSet<ColKey>>,
    clear_did_occur: bool,
}

impl ObjectChangeSet {
    pub fn insertions_add(&mut self, obj: ObjKey) {
        self.modifications.remove(&obj);
        self.deletions.remove(&obj);
        self.insertions.insert(obj);
    }

    pub fn modifications_add(&mut self, obj: ObjKey, col: ColKey) {
        // Modifications to rows created in this same window stay reported as
        // insertions only.
        if !self.insertions.contains(&obj) {
            self.modifications.entry(obj).or_default().insert(col);
        }
    }

    pub fn deletions_add(&mut self, obj: ObjKey) {
        self.modifications.remove(&obj);
        if self.insertions.remove(&obj) {
            // Created and deleted within the window: net nothing.
            return;
        }
        self.deletions.insert(obj);
    }

    /// The table was cleared while holding `previous_keys` rows.
    pub fn clear(&mut self, previous_keys: impl IntoIterator<Item = ObjKey>) {
        self.clear_did_occur = true;
        self.modifications.clear();
        self.insertions.clear();
        self.deletions.extend(previous_keys);
    }

    /// Record that a clear happened without enumerating keys. Used when the
    /// deletions were already streamed in individually before the clear
    /// marker.
    pub fn mark_cleared(&mut self) {
        self.clear_did_occur = true;
        self.modifications.clear();
        self.insertions.clear();
    }

    pub fn insertions_remove(&mut self, obj: ObjKey) -> bool {
        self.insertions.remove(&obj)
    }

    pub fn modifications_remove(&mut self, obj: ObjKey) -> bool {
        self.modifications.remove(&obj).is_some()
    }

    pub fn deletions_remove(&mut self, obj: ObjKey) -> bool {
        self.deletions.remove(&obj)
    }

    pub fn insertions_contains(&self, obj: ObjKey) -> bool {
        self.insertions.contains(&obj)
    }

    pub fn modifications_contains(&self, obj: ObjKey) -> bool {
        self.modifications.contains_key(&obj)
    }

    pub fn deletions_contains(&self, obj: ObjKey) -> bool {
        self.deletions.contains(&obj)
    }

    /// Columns modified on `obj`, or `None` if the object was not modified.
    pub fn columns_modified(&self, obj: ObjKey) -> Option<&BTreeSet<ColKey>> {
        self.modifications.get(&obj)
    }

    pub fn clear_did_occur(&self) -> bool {
        self.clear_did_occur
    }

    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty()
            && self.insertions.is_empty()
            && self.modifications.is_empty()
            && !self.clear_did_occur
    }

    pub fn deletions(&self) -> impl Iterator<Item = ObjKey> + '_ {
        self.deletions.iter().copied()
    }

    pub fn insertions(&self) -> impl Iterator<Item = ObjKey> + '_ {
        self.insertions.iter().copied()
    }

    pub fn modifications(&self) -> impl Iterator<Item = (ObjKey, &BTreeSet<ColKey>)> + '_ {
        self.modifications.iter().map(|(k, v)| (*k, v))
    }

    /// Fold `other`, produced at a later version, into this change set.
    pub fn merge(&mut self, other: ObjectChangeSet) {
        if other.clear_did_occur {
            // Everything this set inserted is gone; everything that predates
            // it is deleted.
            self.insertions.clear();
            self.modifications.clear();
            self.clear_did_occur = true;
            self.deletions.extend(other.deletions);
            return;
        }
        for obj in other.deletions {
            self.deletions_add(obj);
        }
        for obj in other.insertions {
            self.insertions_add(obj);
        }
        for (obj, cols) in other.modifications {
            for col in cols {
                self.modifications_add(obj, col);
            }
        }
    }

    #[cfg(debug_assertions)]
    pub fn verify(&self) {
        for obj in &self.insertions {
            assert!(!self.deletions.contains(obj));
        }
        for obj in self.modifications.keys() {
            assert!(!self.deletions.contains(obj));
            assert!(!self.insertions.contains(obj));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(i: u16) -> ColKey {
        use sync_types::{ColumnAttrs, ColumnType};
        ColKey::new(i, ColumnType::Int, ColumnAttrs::default(), 0)
    }

    #[test]
    fn insert_then_delete_cancels_out() {
        let mut set = ObjectChangeSet::default();
        set.insertions_add(ObjKey(1));
        set.deletions_add(ObjKey(1));
        assert!(set.is_empty());
    }

    #[test]
    fn delete_scrubs_modifications() {
        let mut set = ObjectChangeSet::default();
        set.modifications_add(ObjKey(2), col(0));
        set.deletions_add(ObjKey(2));
        assert!(!set.modifications_contains(ObjKey(2)));
        assert!(set.deletions_contains(ObjKey(2)));
        set.verify();
    }

    #[test]
    fn modifying_a_new_row_stays_an_insertion() {
        let mut set = ObjectChangeSet::default();
        set.insertions_add(ObjKey(3));
        set.modifications_add(ObjKey(3), col(1));
        assert!(set.insertions_contains(ObjKey(3)));
        assert!(!set.modifications_contains(ObjKey(3)));
        set.verify();
    }

    #[test]
    fn clear_is_sticky_and_deletes_previous_keys() {
        let mut set = ObjectChangeSet::default();
        set.insertions_add(ObjKey(9));
        set.modifications_add(ObjKey(4), col(0));
        set.clear([ObjKey(4), ObjKey(5)]);
        assert!(set.clear_did_occur());
        assert!(!set.insertions_contains(ObjKey(9)));
        assert!(set.deletions_contains(ObjKey(4)));
        assert!(set.deletions_contains(ObjKey(5)));
        set.verify();
    }

    #[test]
    fn merge_later_clear_overrides_earlier_changes() {
        let mut a = ObjectChangeSet::default();
        a.insertions_add(ObjKey(1));
        a.modifications_add(ObjKey(2), col(0));

        let mut b = ObjectChangeSet::default();
        b.clear([ObjKey(1), ObjKey(2), ObjKey(3)]);

        a.merge(b);
        assert!(a.clear_did_occur());
        assert!(!a.insertions_contains(ObjKey(1)));
        assert!(a.deletions_contains(ObjKey(3)));
        a.verify();
    }
}
