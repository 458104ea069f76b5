// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use parking_lot::Mutex;
use sync_types::{ObjKey, TableKey};

use crate::{
    collection_changes::CollectionChangeSet,
    deep_changes::{find_related_tables, DeepChangeChecker, KeyPathArray, RelatedTable},
    notifier::{ChangeCallback, NotificationToken, Notifier, NotifierCore},
    transact_log::TransactionChangeInfo,
    transaction::Transaction,
};

#[derive(Default)]
struct Background {
    last_seen_version: Option<u64>,
    change: CollectionChangeSet,
    related_tables: Vec<RelatedTable>,
    reported_deletion: bool,
}

/// Watches a single object. The delivered change set uses index 0 for the
/// object itself: a deletion entry means "gone", modifications carry the
/// changed columns.
pub struct ObjectNotifier {
    core: NotifierCore,
    table: TableKey,
    obj: ObjKey,
    background: Mutex<Background>,
}

impl ObjectNotifier {
    pub fn new(table: TableKey, obj: ObjKey) -> Arc<ObjectNotifier> {
        Arc::new(ObjectNotifier {
            core: NotifierCore::default(),
            table,
            obj,
            background: Mutex::new(Background::default()),
        })
    }

    pub fn add_callback(&self, callback: Box<dyn ChangeCallback>) -> NotificationToken {
        self.core.add_callback(callback, Vec::new())
    }

    pub fn add_callback_with_key_paths(
        &self,
        callback: Box<dyn ChangeCallback>,
        key_paths: KeyPathArray,
    ) -> NotificationToken {
        self.core.add_callback(callback, key_paths)
    }

    pub fn remove_callback(&self, token: NotificationToken) {
        self.core.remove_callback(token)
    }
}

impl Notifier for ObjectNotifier {
    fn core(&self) -> &NotifierCore {
        &self.core
    }

    fn add_required_change_info(&self, info: &mut TransactionChangeInfo) {
        info.register_table(self.table);
        for related in &self.background.lock().related_tables {
            info.register_table(related.table_key);
        }
    }

    fn run(&self, tr: &Transaction, info: &TransactionChangeInfo) {
        let mut bg = self.background.lock();
        let version = tr.get_version_of_current_transaction().version;
        if self.core.has_run() && bg.last_seen_version == Some(version) {
            return;
        }
        let Ok(state) = tr.state() else {
            return;
        };

        let deleted = info
            .tables
            .get(&self.table)
            .map(|changes| changes.deletions_contains(self.obj))
            .unwrap_or(false)
            || state
                .table(self.table)
                .map(|table| table.object(self.obj).is_none())
                .unwrap_or(true);

        if deleted {
            if !bg.reported_deletion {
                let mut change = CollectionChangeSet::default();
                change.deletions.add(0);
                change.root_deleted = true;
                bg.change.merge(change);
                bg.reported_deletion = true;
            }
        } else {
            let mut change = CollectionChangeSet::default();
            let direct_columns = info
                .tables
                .get(&self.table)
                .and_then(|changes| changes.columns_modified(self.obj))
                .cloned();
            if let Some(cols) = direct_columns {
                change.modify(0, None);
                for col in cols {
                    change.columns.entry(col).or_default().add(0);
                }
            } else {
                // No direct change: a key-path filter that spans links still
                // needs the deep checker.
                let key_paths = self.core.key_path_arrays();
                let spans_links = key_paths.iter().flatten().any(|path| path.len() > 1);
                if spans_links {
                    bg.related_tables.clear();
                    let filter_tables: Vec<TableKey> = key_paths
                        .iter()
                        .flatten()
                        .flatten()
                        .map(|(table, _)| *table)
                        .collect();
                    let mut related = Vec::new();
                    find_related_tables(&mut related, state, self.table, &filter_tables);
                    bg.related_tables = related;
                    let mut checker = DeepChangeChecker::new(
                        info,
                        state,
                        self.table,
                        &bg.related_tables,
                        &key_paths,
                    );
                    if checker.check(self.obj) {
                        change.modify(0, None);
                    }
                }
            }
            if !change.is_empty() {
                bg.change.merge(change);
            }
        }
        bg.last_seen_version = Some(version);
        self.core.set_has_run();
    }

    fn prepare_handover(&self, tr: &Transaction) {
        let mut bg = self.background.lock();
        self.core.set_version(tr.get_version_of_current_transaction());
        let change = std::mem::take(&mut bg.change);
        self.core.add_changes(change);
    }
}
