// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use parking_lot::Mutex;
use sync_types::{ColKey, ObjKey, TableKey};

use crate::{
    changeset::Value,
    collection_changes::CollectionChangeSet,
    notifier::{ChangeCallback, NotificationToken, Notifier, NotifierCore},
    transact_log::TransactionChangeInfo,
    transaction::Transaction,
};

#[derive(Default)]
struct Background {
    prev_size: usize,
    last_seen_version: Option<u64>,
    change: CollectionChangeSet,
    reported_root_deletion: bool,
}

/// Watches one list property of one object.
pub struct ListNotifier {
    core: NotifierCore,
    table: TableKey,
    obj: ObjKey,
    col: ColKey,
    background: Mutex<Background>,
}

impl ListNotifier {
    pub fn new(table: TableKey, obj: ObjKey, col: ColKey) -> Arc<ListNotifier> {
        Arc::new(ListNotifier {
            core: NotifierCore::default(),
            table,
            obj,
            col,
            background: Mutex::new(Background::default()),
        })
    }

    pub fn add_callback(&self, callback: Box<dyn ChangeCallback>) -> NotificationToken {
        self.core.add_callback(callback, Vec::new())
    }

    pub fn remove_callback(&self, token: NotificationToken) {
        self.core.remove_callback(token)
    }
}

impl Notifier for ListNotifier {
    fn core(&self) -> &NotifierCore {
        &self.core
    }

    fn add_required_change_info(&self, info: &mut TransactionChangeInfo) {
        info.register_table(self.table);
        info.register_list(self.table, self.obj, self.col);
    }

    fn run(&self, tr: &Transaction, info: &TransactionChangeInfo) {
        let mut bg = self.background.lock();
        let version = tr.get_version_of_current_transaction().version;
        if self.core.has_run() && bg.last_seen_version == Some(version) {
            return;
        }

        // An object without a stored list yet is an empty list, not a
        // deleted one.
        let current_size = tr
            .state()
            .ok()
            .and_then(|state| state.table(self.table))
            .and_then(|table| table.object(self.obj))
            .map(|obj| obj.list(self.col).map_or(0, <[Value]>::len));

        match current_size {
            None => {
                // The containing object is gone: report its full pre-change
                // extent as deleted, once.
                if self.core.has_run() && !bg.reported_root_deletion {
                    let mut change = CollectionChangeSet::default();
                    change.deletions.set(bg.prev_size);
                    change.root_deleted = true;
                    bg.change.merge(change);
                    bg.reported_root_deletion = true;
                }
                bg.prev_size = 0;
            }
            Some(size) => {
                if let Some(list_changes) = info.list_changes(self.table, self.obj, self.col) {
                    if list_changes.root_deleted {
                        let mut change = CollectionChangeSet::default();
                        change.deletions.set(bg.prev_size);
                        change.root_deleted = true;
                        bg.change.merge(change);
                    } else {
                        bg.change.merge(list_changes.clone());
                    }
                }
                bg.prev_size = size;
                bg.reported_root_deletion = false;
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
