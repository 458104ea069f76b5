// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Observation of the instruction stream between two snapshots.
//!
//! The storage engine replays the raw transaction log through a
//! `TransactLogObserver` whenever a read snapshot advances. The strict
//! validator flavor stores nothing and only enforces the schema-compatibility
//! rules; the collector flavor routes row- and list-level operations into the
//! change structures the notifiers diff against.

use std::collections::{HashMap, HashSet};

use sync_types::{ColKey, ObjKey, TableKey, VersionId};

use crate::{
    changeset::{Changeset, Instruction},
    collection_changes::CollectionChangeSet,
    error::{CoreError, CoreResult},
    object_changes::ObjectChangeSet,
};

/// Hooks driven by the changeset replayer. All hooks default to "allowed and
/// ignored" except the destructive schema changes, which no running process
/// can follow.
pub trait TransactLogObserver {
    fn will_advance(&mut self, _old: VersionId, _new: VersionId) {}
    fn did_advance(&mut self, _old: VersionId, _new: VersionId) {}
    fn will_reverse(&mut self, _log: &[u8]) {}

    fn select_table(&mut self, _table: TableKey) -> CoreResult<()> {
        Ok(())
    }
    fn select_list(&mut self, _col: ColKey, _obj: ObjKey) -> CoreResult<()> {
        Ok(())
    }
    fn create_object(&mut self, _obj: ObjKey) -> CoreResult<()> {
        Ok(())
    }
    fn remove_object(&mut self, _obj: ObjKey) -> CoreResult<()> {
        Ok(())
    }
    fn modify_object(&mut self, _col: ColKey, _obj: ObjKey) -> CoreResult<()> {
        Ok(())
    }
    fn clear_table(&mut self, _old_size: u64) -> CoreResult<()> {
        Ok(())
    }
    fn list_set(&mut self, _index: usize) -> CoreResult<()> {
        Ok(())
    }
    fn list_insert(&mut self, _index: usize) -> CoreResult<()> {
        Ok(())
    }
    fn list_erase(&mut self, _index: usize) -> CoreResult<()> {
        Ok(())
    }
    fn list_clear(&mut self, _old_size: usize) -> CoreResult<()> {
        Ok(())
    }
    fn list_move(&mut self, _from: usize, _to: usize) -> CoreResult<()> {
        Ok(())
    }
    fn list_swap(&mut self, a: usize, b: usize) -> CoreResult<()> {
        self.list_set(a)?;
        self.list_set(b)
    }

    // Additive schema changes are supported while a file is open.
    fn insert_group_level_table(&mut self, _table: TableKey) -> CoreResult<()> {
        Ok(())
    }
    fn insert_column(&mut self, _col: ColKey) -> CoreResult<()> {
        Ok(())
    }

    // Removing or renaming things while the file is open is never supported.
    fn erase_group_level_table(&mut self, _table: TableKey) -> CoreResult<()> {
        Err(CoreError::UnsupportedSchemaChange)
    }
    fn rename_group_level_table(&mut self, _table: TableKey) -> CoreResult<()> {
        Err(CoreError::UnsupportedSchemaChange)
    }
    fn erase_column(&mut self, _col: ColKey) -> CoreResult<()> {
        Err(CoreError::UnsupportedSchemaChange)
    }
    fn rename_column(&mut self, _col: ColKey) -> CoreResult<()> {
        Err(CoreError::UnsupportedSchemaChange)
    }

    fn parse_complete(&mut self) -> CoreResult<()> {
        Ok(())
    }
}

/// Validator used on read-advance when no notifiers are registered: accepts
/// everything the trait defaults accept and stores nothing.
#[derive(Default)]
pub struct TransactLogValidator;

impl TransactLogObserver for TransactLogValidator {}

/// A list a notifier asked to have tracked, and the changes accumulated for
/// it during one replay window.
#[derive(Clone, Debug)]
pub struct ListChangeInfo {
    pub table_key: TableKey,
    pub obj_key: ObjKey,
    pub col_key: ColKey,
    pub changes: CollectionChangeSet,
}

/// Everything the notifiers collectively need tracked across one advance.
#[derive(Default)]
pub struct TransactionChangeInfo {
    pub lists: Vec<ListChangeInfo>,
    pub tables: HashMap<TableKey, ObjectChangeSet>,
    pub table_modifications_needed: HashSet<TableKey>,
    pub table_moves_needed: HashSet<TableKey>,
    pub track_all: bool,
    pub schema_changed: bool,
}

impl TransactionChangeInfo {
    pub fn register_table(&mut self, table: TableKey) {
        self.table_modifications_needed.insert(table);
    }

    pub fn register_table_with_moves(&mut self, table: TableKey) {
        self.table_modifications_needed.insert(table);
        self.table_moves_needed.insert(table);
    }

    pub fn register_list(&mut self, table: TableKey, obj: ObjKey, col: ColKey) {
        self.lists.push(ListChangeInfo {
            table_key: table,
            obj_key: obj,
            col_key: col,
            changes: CollectionChangeSet::default(),
        });
    }

    pub fn list_changes(&self, table: TableKey, obj: ObjKey, col: ColKey) -> Option<&CollectionChangeSet> {
        // With multiple source versions there can be several entries for one
        // list; the last one holds the composed result.
        self.lists
            .iter()
            .rev()
            .find(|l| l.table_key == table && l.obj_key == obj && l.col_key == col)
            .map(|l| &l.changes)
    }

    pub fn is_empty_request(&self) -> bool {
        !self.track_all && self.table_modifications_needed.is_empty() && self.lists.is_empty()
    }
}

/// Routes the instruction stream into a `TransactionChangeInfo`.
pub struct ChangeInfoCollector<'a> {
    info: &'a mut TransactionChangeInfo,
    current_table: TableKey,
    table_is_tracked: bool,
    active_list: Option<usize>,
}

impl<'a> ChangeInfoCollector<'a> {
    pub fn new(info: &'a mut TransactionChangeInfo) -> ChangeInfoCollector<'a> {
        ChangeInfoCollector {
            info,
            current_table: TableKey::NULL,
            table_is_tracked: false,
            active_list: None,
        }
    }

    fn active_table(&mut self) -> Option<&mut ObjectChangeSet> {
        if self.table_is_tracked {
            self.info.tables.get_mut(&self.current_table)
        } else {
            None
        }
    }

    fn active_list(&mut self) -> Option<&mut CollectionChangeSet> {
        self.active_list.map(|i| &mut self.info.lists[i].changes)
    }
}

impl TransactLogObserver for ChangeInfoCollector<'_> {
    fn select_table(&mut self, table: TableKey) -> CoreResult<()> {
        self.current_table = table;
        self.active_list = None;
        self.table_is_tracked =
            self.info.track_all || self.info.table_modifications_needed.contains(&table);
        if self.table_is_tracked {
            self.info.tables.entry(table).or_default();
        }
        Ok(())
    }

    fn select_list(&mut self, col: ColKey, obj: ObjKey) -> CoreResult<()> {
        self.modify_object(col, obj)?;
        let table = self.current_table;
        self.active_list = self
            .info
            .lists
            .iter()
            .rposition(|l| l.table_key == table && l.obj_key == obj && l.col_key == col);
        Ok(())
    }

    fn create_object(&mut self, obj: ObjKey) -> CoreResult<()> {
        if let Some(table) = self.active_table() {
            table.insertions_add(obj);
        }
        Ok(())
    }

    fn remove_object(&mut self, obj: ObjKey) -> CoreResult<()> {
        if let Some(table) = self.active_table() {
            table.deletions_add(obj);
        }
        let table = self.current_table;
        let removed_active = self
            .active_list
            .map(|i| self.info.lists[i].obj_key == obj && self.info.lists[i].table_key == table)
            .unwrap_or(false);
        if removed_active {
            self.active_list = None;
        }
        // Any tracked list rooted at the removed object reports the root
        // deletion instead of positional changes.
        for list in &mut self.info.lists {
            if list.table_key == table && list.obj_key == obj {
                list.changes.root_deleted = true;
            }
        }
        Ok(())
    }

    fn modify_object(&mut self, col: ColKey, obj: ObjKey) -> CoreResult<()> {
        if let Some(table) = self.active_table() {
            table.modifications_add(obj, col);
        }
        Ok(())
    }

    fn clear_table(&mut self, _old_size: u64) -> CoreResult<()> {
        if let Some(table) = self.active_table() {
            table.mark_cleared();
        }
        let table = self.current_table;
        for list in &mut self.info.lists {
            if list.table_key == table {
                list.changes.root_deleted = true;
            }
        }
        self.active_list = None;
        Ok(())
    }

    fn list_set(&mut self, index: usize) -> CoreResult<()> {
        if let Some(list) = self.active_list() {
            list.modify(index, None);
        }
        Ok(())
    }

    fn list_insert(&mut self, index: usize) -> CoreResult<()> {
        if let Some(list) = self.active_list() {
            list.insert(index);
        }
        Ok(())
    }

    fn list_erase(&mut self, index: usize) -> CoreResult<()> {
        if let Some(list) = self.active_list() {
            list.erase(index);
        }
        Ok(())
    }

    fn list_clear(&mut self, old_size: usize) -> CoreResult<()> {
        if let Some(list) = self.active_list() {
            list.clear(old_size);
        }
        Ok(())
    }

    fn list_move(&mut self, from: usize, to: usize) -> CoreResult<()> {
        if let Some(list) = self.active_list() {
            list.move_entry(from, to);
        }
        Ok(())
    }

    fn insert_group_level_table(&mut self, _table: TableKey) -> CoreResult<()> {
        self.info.schema_changed = true;
        Ok(())
    }

    fn insert_column(&mut self, _col: ColKey) -> CoreResult<()> {
        self.info.schema_changed = true;
        Ok(())
    }

    fn parse_complete(&mut self) -> CoreResult<()> {
        for list in &mut self.info.lists {
            list.changes.parse_complete();
        }
        Ok(())
    }
}

/// Drive an observer with a sequence of changesets, finishing with one
/// `parse_complete`. Diffing across several commits in one pass composes the
/// per-commit effects exactly because the builders see one continuous stream.
pub fn replay_all<'a>(
    changesets: impl IntoIterator<Item = &'a Changeset>,
    observer: &mut dyn TransactLogObserver,
) -> CoreResult<()> {
    for changeset in changesets {
        replay(changeset, observer)?;
    }
    observer.parse_complete()
}

/// Drive an observer with the instructions of one changeset, without the
/// trailing `parse_complete`.
pub fn replay(changeset: &Changeset, observer: &mut dyn TransactLogObserver) -> CoreResult<()> {
    for instruction in &changeset.instructions {
        match *instruction {
            Instruction::AddTable { table, .. } => observer.insert_group_level_table(table)?,
            Instruction::EraseTable { table } => observer.erase_group_level_table(table)?,
            Instruction::RenameTable { table, .. } => observer.rename_group_level_table(table)?,
            Instruction::AddColumn { table, col, .. } => {
                observer.select_table(table)?;
                observer.insert_column(col)?;
            }
            Instruction::EraseColumn { table, col } => {
                observer.select_table(table)?;
                observer.erase_column(col)?;
            }
            Instruction::RenameColumn { table, col, .. } => {
                observer.select_table(table)?;
                observer.rename_column(col)?;
            }
            Instruction::CreateObject { table, obj } => {
                observer.select_table(table)?;
                observer.create_object(obj)?;
            }
            Instruction::EraseObject { table, obj } => {
                observer.select_table(table)?;
                observer.remove_object(obj)?;
            }
            Instruction::ClearTable { table, old_size } => {
                observer.select_table(table)?;
                observer.clear_table(old_size)?;
            }
            Instruction::Set {
                table, obj, col, ..
            } => {
                observer.select_table(table)?;
                observer.modify_object(col, obj)?;
            }
            Instruction::ListSet {
                table,
                obj,
                col,
                index,
                ..
            } => {
                observer.select_table(table)?;
                observer.select_list(col, obj)?;
                observer.list_set(index as usize)?;
            }
            Instruction::ListInsert {
                table,
                obj,
                col,
                index,
                ..
            } => {
                observer.select_table(table)?;
                observer.select_list(col, obj)?;
                observer.list_insert(index as usize)?;
            }
            Instruction::ListErase {
                table,
                obj,
                col,
                index,
            } => {
                observer.select_table(table)?;
                observer.select_list(col, obj)?;
                observer.list_erase(index as usize)?;
            }
            Instruction::ListMove {
                table,
                obj,
                col,
                from,
                to,
            } => {
                observer.select_table(table)?;
                observer.select_list(col, obj)?;
                observer.list_move(from as usize, to as usize)?;
            }
            Instruction::ListSwap {
                table, obj, col, a, b,
            } => {
                observer.select_table(table)?;
                observer.select_list(col, obj)?;
                observer.list_swap(a as usize, b as usize)?;
            }
            Instruction::ListClear {
                table,
                obj,
                col,
                old_size,
            } => {
                observer.select_table(table)?;
                observer.select_list(col, obj)?;
                observer.list_clear(old_size as usize)?;
            }
        }
    }
    Ok(())
}
