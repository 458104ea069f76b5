// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use parking_lot::Mutex;
use sync_types::{ObjKey, TableKey, VersionId};

use crate::{
    collection_changes::CollectionChangeSet,
    deep_changes::{find_related_tables, DeepChangeChecker, RelatedTable},
    index_set::IndexSet,
    notifier::{ChangeCallback, NotificationToken, Notifier, NotifierCore},
    query::{DescriptorOrdering, Query},
    transact_log::TransactionChangeInfo,
    transaction::Transaction,
};

#[derive(Default)]
struct Background {
    previous_rows: Vec<ObjKey>,
    last_seen_version: Option<u64>,
    change: CollectionChangeSet,
    run_rows: Option<Vec<ObjKey>>,
    handover: Option<(VersionId, Vec<ObjKey>)>,
    related_tables: Vec<RelatedTable>,
}

#[derive(Default)]
struct Delivered {
    rows: Vec<ObjKey>,
    version: Option<VersionId>,
}

/// Watches a query's ordered result set.
pub struct ResultsNotifier {
    core: NotifierCore,
    query: Query,
    ordering: DescriptorOrdering,
    /// Moves are only meaningful when the target preserves table order and
    /// no sort is applied on top.
    target_is_in_table_order: bool,
    background: Mutex<Background>,
    delivered: Mutex<Delivered>,
}

impl ResultsNotifier {
    pub fn new(
        query: Query,
        ordering: DescriptorOrdering,
        target_is_in_table_order: bool,
    ) -> Arc<ResultsNotifier> {
        Arc::new(ResultsNotifier {
            core: NotifierCore::default(),
            query,
            ordering,
            target_is_in_table_order,
            background: Mutex::new(Background::default()),
            delivered: Mutex::new(Delivered::default()),
        })
    }

    pub fn table(&self) -> TableKey {
        self.query.table
    }

    pub fn add_callback(&self, callback: Box<dyn ChangeCallback>) -> NotificationToken {
        self.core.add_callback(callback, Vec::new())
    }

    pub fn add_callback_with_key_paths(
        &self,
        callback: Box<dyn ChangeCallback>,
        key_paths: crate::deep_changes::KeyPathArray,
    ) -> NotificationToken {
        self.core.add_callback(callback, key_paths)
    }

    pub fn remove_callback(&self, token: NotificationToken) {
        self.core.remove_callback(token)
    }

    /// The most recently delivered result set.
    pub fn delivered_rows(&self) -> (Vec<ObjKey>, Option<VersionId>) {
        let delivered = self.delivered.lock();
        (delivered.rows.clone(), delivered.version)
    }
}

impl Notifier for ResultsNotifier {
    fn core(&self) -> &NotifierCore {
        &self.core
    }

    fn add_required_change_info(&self, info: &mut TransactionChangeInfo) {
        info.register_table_with_moves(self.query.table);
        for related in &self.background.lock().related_tables {
            info.register_table(related.table_key);
        }
    }

    fn run(&self, tr: &Transaction, info: &TransactionChangeInfo) {
        let mut bg = self.background.lock();
        let Ok(state) = tr.state() else {
            return;
        };
        let version = tr.get_version_of_current_transaction().version;

        let Some(rows) = self.query.run(state) else {
            // Table is gone: everything the target saw is deleted.
            let mut change = CollectionChangeSet::default();
            change.deletions.set(bg.previous_rows.len());
            change.root_deleted = true;
            bg.change = change;
            bg.previous_rows.clear();
            bg.run_rows = Some(Vec::new());
            bg.last_seen_version = Some(version);
            self.core.set_has_run();
            return;
        };
        if self.core.has_run() && bg.last_seen_version == Some(version) {
            return;
        }
        let table_state = state.table(self.query.table);
        let rows = match table_state {
            Some(table) => self.ordering.apply(table, rows),
            None => rows,
        };

        if self.core.has_run() {
            bg.related_tables.clear();
            let key_paths = self.core.key_path_arrays();
            let filter_tables: Vec<TableKey> = key_paths
                .iter()
                .flatten()
                .flatten()
                .map(|(table, _)| *table)
                .collect();
            let mut related = Vec::new();
            find_related_tables(&mut related, state, self.query.table, &filter_tables);
            bg.related_tables = related;

            let move_candidates = if self.target_is_in_table_order
                && !self.ordering.will_apply_sort()
            {
                let table_changes = info.tables.get(&self.query.table);
                let candidates: IndexSet = bg
                    .previous_rows
                    .iter()
                    .enumerate()
                    .filter(|(_, key)| {
                        table_changes.is_some_and(|c| c.insertions_contains(**key))
                    })
                    .map(|(index, _)| index)
                    .collect();
                Some(candidates)
            } else {
                None
            };

            let mut checker = DeepChangeChecker::new(
                info,
                state,
                self.query.table,
                &bg.related_tables,
                &key_paths,
            );
            let mut change = CollectionChangeSet::calculate(
                &bg.previous_rows,
                &rows,
                |key| checker.check(key),
                move_candidates.as_ref(),
            );

            // Per-column detail comes from the table-level change info.
            if let Some(table_changes) = info.tables.get(&self.query.table) {
                for (index, key) in rows.iter().enumerate() {
                    if !change.modifications_new.contains(index) {
                        continue;
                    }
                    if let Some(cols) = table_changes.columns_modified(*key) {
                        for col in cols {
                            change.columns.entry(*col).or_default().add(index);
                        }
                    }
                }
            }
            bg.change.merge(change);
        }

        bg.previous_rows = rows.clone();
        bg.run_rows = Some(rows);
        bg.last_seen_version = Some(version);
        self.core.set_has_run();
    }

    fn prepare_handover(&self, tr: &Transaction) {
        let mut bg = self.background.lock();
        let version = tr.get_version_of_current_transaction();
        if let Some(rows) = bg.run_rows.take() {
            bg.handover = Some((version, rows));
        }
        self.core.set_version(version);
        // Needed even for empty diffs: it consumes the skip-next flags.
        let change = std::mem::take(&mut bg.change);
        self.core.add_changes(change);
    }

    fn deliver(&self, _tr: &Transaction) {
        let handover = self.background.lock().handover.take();
        if let Some((version, rows)) = handover {
            let mut delivered = self.delivered.lock();
            delivered.rows = rows;
            delivered.version = Some(version);
        }
    }

    fn release_data(&self) {
        let mut bg = self.background.lock();
        bg.run_rows = None;
        bg.handover = None;
        bg.previous_rows = Vec::new();
        bg.related_tables = Vec::new();
    }
}
