// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Versioned sets of named queries driving subscription-based sync.
//!
//! Each set is immutable once committed; changing the subscribed queries
//! clones the latest set under `max(version) + 1` and commits the copy. The
//! server bootstraps the new view, the set walks
//! `Pending → Bootstrapping → AwaitingMark → Complete`, and completion
//! supersedes every older version.

use std::time::{SystemTime, UNIX_EPOCH};

use sync_types::Timestamp;

use crate::{
    changeset::Value,
    error::{CoreError, CoreResult},
    storage::Database,
    sync_metadata::{
        create_or_load_schema, schema_groups, MetadataColumnSpec, MetadataTableSpec, ResolvedSchema,
    },
};
use sync_types::{ColumnType, ObjKey};

const SCHEMA_VERSION: i64 = 1;

const SETS_TABLE: &str = "flx_subscriptions";
const SUBS_TABLE: &str = "flx_subscriptions_subscriptions";

const COL_VERSION: &str = "version";
const COL_STATE: &str = "state";
const COL_ERROR: &str = "error_str";
const COL_SUBS: &str = "subscriptions";

const COL_CREATED_AT: &str = "created_at";
const COL_UPDATED_AT: &str = "updated_at";
const COL_NAME: &str = "name";
const COL_OBJECT_CLASS: &str = "object_class_name";
const COL_QUERY: &str = "query_string";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i64)]
pub enum SubscriptionSetState {
    Uncommitted = 0,
    Pending = 1,
    Bootstrapping = 2,
    AwaitingMark = 3,
    Complete = 4,
    Error = 5,
}

impl SubscriptionSetState {
    fn from_i64(value: i64) -> SubscriptionSetState {
        match value {
            1 => SubscriptionSetState::Pending,
            2 => SubscriptionSetState::Bootstrapping,
            3 => SubscriptionSetState::AwaitingMark,
            4 => SubscriptionSetState::Complete,
            5 => SubscriptionSetState::Error,
            _ => SubscriptionSetState::Uncommitted,
        }
    }

    fn can_transition_to(self, next: SubscriptionSetState) -> bool {
        use SubscriptionSetState::*;
        matches!(
            (self, next),
            (Uncommitted, Pending)
                | (Pending, Bootstrapping)
                | (Bootstrapping, AwaitingMark)
                | (AwaitingMark, Complete)
                | (Pending, Error)
                | (Bootstrapping, Error)
                | (AwaitingMark, Error)
        )
    }
}

/// One named query within a set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub name: Option<String>,
    pub object_class_name: String,
    pub query_string: String,
}

/// A read-only snapshot of one subscription set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSet {
    pub version: i64,
    pub state: SubscriptionSetState,
    pub error_str: Option<String>,
    pub subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    fn empty() -> SubscriptionSet {
        SubscriptionSet {
            version: 0,
            state: SubscriptionSetState::Complete,
            error_str: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn find(&self, name: &str) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .find(|s| s.name.as_deref() == Some(name))
    }
}

/// An uncommitted copy of a subscription set being edited.
#[derive(Clone, Debug)]
pub struct MutableSubscriptionSet {
    version: i64,
    subscriptions: Vec<Subscription>,
}

impl MutableSubscriptionSet {
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Insert a subscription if no equal query exists yet. Returns whether a
    /// new entry was created.
    pub fn insert_or_assign(
        &mut self,
        name: Option<&str>,
        object_class_name: &str,
        query_string: &str,
    ) -> bool {
        let now = now_ms();
        if let Some(existing) = self.subscriptions.iter_mut().find(|s| match name {
            Some(name) => s.name.as_deref() == Some(name),
            None => s.object_class_name == object_class_name && s.query_string == query_string,
        }) {
            existing.updated_at = now;
            existing.object_class_name = object_class_name.to_string();
            existing.query_string = query_string.to_string();
            return false;
        }
        self.subscriptions.push(Subscription {
            created_at: now,
            updated_at: now,
            name: name.map(str::to_string),
            object_class_name: object_class_name.to_string(),
            query_string: query_string.to_string(),
        });
        true
    }

    pub fn erase(&mut self, name: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.name.as_deref() != Some(name));
        before != self.subscriptions.len()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }
}

fn subscription_specs() -> Vec<MetadataTableSpec> {
    vec![
        MetadataTableSpec {
            name: SETS_TABLE,
            columns: vec![
                MetadataColumnSpec::new(COL_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(COL_STATE, ColumnType::Int),
                MetadataColumnSpec::nullable(COL_ERROR, ColumnType::String),
                MetadataColumnSpec::link_list(COL_SUBS, SUBS_TABLE),
            ],
        },
        MetadataTableSpec {
            name: SUBS_TABLE,
            columns: vec![
                MetadataColumnSpec::new(COL_CREATED_AT, ColumnType::Int),
                MetadataColumnSpec::new(COL_UPDATED_AT, ColumnType::Int),
                MetadataColumnSpec::nullable(COL_NAME, ColumnType::String),
                MetadataColumnSpec::new(COL_OBJECT_CLASS, ColumnType::String),
                MetadataColumnSpec::new(COL_QUERY, ColumnType::String),
            ],
        },
    ]
}

pub struct SubscriptionStore {
    db: Database,
    tables: ResolvedSchema,
}

impl SubscriptionStore {
    pub fn new(db: Database) -> CoreResult<SubscriptionStore> {
        let mut tr = db.start_read(None)?;
        let tables = create_or_load_schema(
            &mut tr,
            schema_groups::SUBSCRIPTION_STORE,
            SCHEMA_VERSION,
            &subscription_specs(),
        )?;
        drop(tr);
        Ok(SubscriptionStore { db, tables })
    }

    fn read_sets(&self) -> CoreResult<Vec<(i64, ObjKey)>> {
        let sets = &self.tables[SETS_TABLE];
        let tr = self.db.start_read(None)?;
        let mut rows: Vec<(i64, ObjKey)> = tr
            .table(sets.table)?
            .objects
            .iter()
            .filter_map(|(key, obj)| {
                Some((obj.value(sets.col(COL_VERSION)).and_then(Value::as_int)?, *key))
            })
            .collect();
        rows.sort_unstable();
        Ok(rows)
    }

    fn read_set(&self, key: ObjKey) -> CoreResult<SubscriptionSet> {
        let sets = &self.tables[SETS_TABLE];
        let subs = &self.tables[SUBS_TABLE];
        let tr = self.db.start_read(None)?;
        let row = tr.object(sets.table, key)?;
        let mut set = SubscriptionSet {
            version: row.value(sets.col(COL_VERSION)).and_then(Value::as_int).unwrap_or(0),
            state: SubscriptionSetState::from_i64(
                row.value(sets.col(COL_STATE)).and_then(Value::as_int).unwrap_or(0),
            ),
            error_str: row
                .value(sets.col(COL_ERROR))
                .and_then(Value::as_str)
                .map(str::to_string),
            subscriptions: Vec::new(),
        };
        for link in row.list(sets.col(COL_SUBS)).unwrap_or(&[]) {
            let Some(sub_key) = link.as_link() else {
                continue;
            };
            let sub = tr.object(subs.table, sub_key)?;
            let get_int = |col: &str| sub.value(subs.col(col)).and_then(Value::as_int).unwrap_or(0);
            set.subscriptions.push(Subscription {
                created_at: get_int(COL_CREATED_AT) as Timestamp,
                updated_at: get_int(COL_UPDATED_AT) as Timestamp,
                name: sub
                    .value(subs.col(COL_NAME))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                object_class_name: sub
                    .value(subs.col(COL_OBJECT_CLASS))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                query_string: sub
                    .value(subs.col(COL_QUERY))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(set)
    }

    /// The highest-versioned set, of any state.
    pub fn get_latest(&self) -> CoreResult<SubscriptionSet> {
        match self.read_sets()?.last() {
            Some((_, key)) => self.read_set(*key),
            None => Ok(SubscriptionSet::empty()),
        }
    }

    /// The highest-versioned Complete set, falling back to the latest of any
    /// state.
    pub fn get_active(&self) -> CoreResult<SubscriptionSet> {
        let rows = self.read_sets()?;
        for (_, key) in rows.iter().rev() {
            let set = self.read_set(*key)?;
            if set.state == SubscriptionSetState::Complete {
                return Ok(set);
            }
        }
        match rows.last() {
            Some((_, key)) => self.read_set(*key),
            None => Ok(SubscriptionSet::empty()),
        }
    }

    pub fn get_by_version(&self, version: i64) -> CoreResult<SubscriptionSet> {
        let row = self
            .read_sets()?
            .into_iter()
            .find(|(v, _)| *v == version)
            .ok_or(CoreError::InvalidatedObject)?;
        self.read_set(row.1)
    }

    /// Clone the latest set for editing under the next version number.
    pub fn make_mutable_copy(&self) -> CoreResult<MutableSubscriptionSet> {
        let latest = self.get_latest()?;
        let max_version = self.read_sets()?.last().map(|(v, _)| *v).unwrap_or(0);
        Ok(MutableSubscriptionSet {
            version: max_version + 1,
            subscriptions: latest.subscriptions,
        })
    }

    /// Publish an edited copy as Pending.
    pub fn commit(&self, mutable: MutableSubscriptionSet) -> CoreResult<SubscriptionSet> {
        let sets = &self.tables[SETS_TABLE];
        let subs = &self.tables[SUBS_TABLE];
        let mut tr = self.db.start_write()?;
        let row = tr.create_object(sets.table)?;
        tr.set_value(
            sets.table,
            row,
            sets.col(COL_VERSION),
            Value::Int(mutable.version),
        )?;
        tr.set_value(
            sets.table,
            row,
            sets.col(COL_STATE),
            Value::Int(SubscriptionSetState::Pending as i64),
        )?;
        for (index, sub) in mutable.subscriptions.iter().enumerate() {
            let sub_row = tr.create_object(subs.table)?;
            tr.set_value(
                subs.table,
                sub_row,
                subs.col(COL_CREATED_AT),
                Value::Int(sub.created_at as i64),
            )?;
            tr.set_value(
                subs.table,
                sub_row,
                subs.col(COL_UPDATED_AT),
                Value::Int(sub.updated_at as i64),
            )?;
            if let Some(name) = &sub.name {
                tr.set_value(subs.table, sub_row, subs.col(COL_NAME), Value::String(name.clone()))?;
            }
            tr.set_value(
                subs.table,
                sub_row,
                subs.col(COL_OBJECT_CLASS),
                Value::String(sub.object_class_name.clone()),
            )?;
            tr.set_value(
                subs.table,
                sub_row,
                subs.col(COL_QUERY),
                Value::String(sub.query_string.clone()),
            )?;
            tr.list_insert(sets.table, row, sets.col(COL_SUBS), index, Value::Link(sub_row))?;
        }
        tr.commit()?;
        tracing::debug!(version = mutable.version, "committed subscription set");
        self.get_by_version(mutable.version)
    }

    /// Advance the state machine of one set. Completing a set supersedes
    /// every older version.
    pub fn update_state(
        &self,
        version: i64,
        state: SubscriptionSetState,
        error_str: Option<&str>,
    ) -> CoreResult<()> {
        if error_str.is_some() && state != SubscriptionSetState::Error {
            return Err(CoreError::InvalidTransaction(
                "an error string requires the Error state",
            ));
        }
        let sets = &self.tables[SETS_TABLE];
        let rows = self.read_sets()?;
        let (_, key) = rows
            .iter()
            .find(|(v, _)| *v == version)
            .ok_or(CoreError::InvalidatedObject)?;

        let current = self.read_set(*key)?;
        if !current.state.can_transition_to(state) {
            return Err(CoreError::InvalidTransaction(
                "invalid subscription state transition",
            ));
        }

        let mut tr = self.db.start_write()?;
        tr.set_value(sets.table, *key, sets.col(COL_STATE), Value::Int(state as i64))?;
        if let Some(error) = error_str {
            tr.set_value(
                sets.table,
                *key,
                sets.col(COL_ERROR),
                Value::String(error.to_string()),
            )?;
        }
        if state == SubscriptionSetState::Complete {
            for (v, old_key) in &rows {
                if *v < version {
                    self.erase_set_row(&mut tr, *old_key)?;
                }
            }
            tracing::debug!(version, "subscription set complete; superseded older versions");
        }
        tr.commit()?;
        Ok(())
    }

    fn erase_set_row(
        &self,
        tr: &mut crate::transaction::Transaction,
        key: ObjKey,
    ) -> CoreResult<()> {
        let sets = &self.tables[SETS_TABLE];
        let subs = &self.tables[SUBS_TABLE];
        let links: Vec<ObjKey> = tr
            .object(sets.table, key)?
            .list(sets.col(COL_SUBS))
            .unwrap_or(&[])
            .iter()
            .filter_map(Value::as_link)
            .collect();
        for link in links {
            tr.erase_object(subs.table, link)?;
        }
        tr.erase_object(sets.table, key)
    }
}

fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(name: &str) -> (Database, SubscriptionStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.into_path().join(name));
        let store = SubscriptionStore::new(db.clone()).unwrap();
        (db, store)
    }

    fn commit_set(store: &SubscriptionStore, queries: &[(&str, &str)]) -> SubscriptionSet {
        let mut mutable = store.make_mutable_copy().unwrap();
        for (name, query) in queries {
            mutable.insert_or_assign(Some(name), "Task", query);
        }
        store.commit(mutable).unwrap()
    }

    #[test]
    fn versions_are_strictly_increasing() {
        let (_db, store) = open("versions.db");
        let a = commit_set(&store, &[("a", "truepredicate")]);
        let b = commit_set(&store, &[("b", "done == false")]);
        assert_eq!(a.version, 1);
        assert_eq!(b.version, 2);
        assert_eq!(a.state, SubscriptionSetState::Pending);
        // The copy carries the previous subscriptions forward.
        assert!(b.find("a").is_some());
        assert!(b.find("b").is_some());
    }

    #[test]
    fn state_machine_walks_to_complete() {
        let (_db, store) = open("states.db");
        let set = commit_set(&store, &[("a", "truepredicate")]);
        store
            .update_state(set.version, SubscriptionSetState::Bootstrapping, None)
            .unwrap();
        store
            .update_state(set.version, SubscriptionSetState::AwaitingMark, None)
            .unwrap();
        store
            .update_state(set.version, SubscriptionSetState::Complete, None)
            .unwrap();
        assert_eq!(
            store.get_by_version(set.version).unwrap().state,
            SubscriptionSetState::Complete
        );
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let (_db, store) = open("illegal.db");
        let set = commit_set(&store, &[("a", "truepredicate")]);
        // Pending cannot jump straight to Complete.
        assert!(store
            .update_state(set.version, SubscriptionSetState::Complete, None)
            .is_err());
        // An error string outside the Error state is rejected.
        assert!(store
            .update_state(set.version, SubscriptionSetState::Bootstrapping, Some("boom"))
            .is_err());
    }

    #[test]
    fn completion_supersedes_older_versions() {
        let (_db, store) = open("supersede.db");
        let v1 = commit_set(&store, &[("a", "truepredicate")]);
        let v2 = commit_set(&store, &[("b", "done == false")]);
        let v3 = commit_set(&store, &[("c", "urgent == true")]);
        store
            .update_state(v2.version, SubscriptionSetState::Bootstrapping, None)
            .unwrap();
        for state in [
            SubscriptionSetState::Bootstrapping,
            SubscriptionSetState::AwaitingMark,
            SubscriptionSetState::Complete,
        ] {
            store.update_state(v3.version, state, None).unwrap();
        }
        assert!(store.get_by_version(v1.version).is_err());
        assert!(store.get_by_version(v2.version).is_err());
        let active = store.get_active().unwrap();
        assert_eq!(active.version, v3.version);
        assert_eq!(active.state, SubscriptionSetState::Complete);
    }

    #[test]
    fn error_state_carries_the_message() {
        let (_db, store) = open("error.db");
        let set = commit_set(&store, &[("a", "truepredicate")]);
        store
            .update_state(set.version, SubscriptionSetState::Bootstrapping, None)
            .unwrap();
        store
            .update_state(
                set.version,
                SubscriptionSetState::Error,
                Some("invalid query"),
            )
            .unwrap();
        let set = store.get_by_version(set.version).unwrap();
        assert_eq!(set.state, SubscriptionSetState::Error);
        assert_eq!(set.error_str.as_deref(), Some("invalid query"));
    }

    #[test]
    fn active_falls_back_to_latest_without_complete() {
        let (_db, store) = open("fallback.db");
        commit_set(&store, &[("a", "truepredicate")]);
        let latest = commit_set(&store, &[("b", "done == false")]);
        let active = store.get_active().unwrap();
        assert_eq!(active.version, latest.version);
    }

    #[test]
    fn insert_or_assign_dedupes_by_name() {
        let (_db, store) = open("dedupe.db");
        let mut mutable = store.make_mutable_copy().unwrap();
        assert!(mutable.insert_or_assign(Some("a"), "Task", "v1"));
        assert!(!mutable.insert_or_assign(Some("a"), "Task", "v2"));
        assert_eq!(mutable.subscriptions().len(), 1);
        assert_eq!(mutable.subscriptions()[0].query_string, "v2");
    }
}
