// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The versioned object store underneath the sync core.
//!
//! This is an in-process realisation of the storage contract the core
//! consumes: MVCC snapshots addressed by version, one instruction log per
//! commit, a file-level write mutex, and commit listeners for waking
//! coordinators. Page management and the on-disk format are explicitly not
//! reproduced here; snapshots are immutable in-memory states shared by `Arc`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, RwLock};
use sync_types::{ColKey, ColumnAttrs, ColumnType, ObjKey, TableKey, VersionId};

use crate::{
    changeset::{Changeset, Value},
    error::{CoreError, CoreResult},
    transaction::Transaction,
};

#[derive(Clone, Debug)]
pub struct ColumnSchema {
    pub key: ColKey,
    pub name: String,
    /// Set for link and link-list columns.
    pub target: Option<TableKey>,
}

#[derive(Clone, Debug)]
pub struct TableSchema {
    pub key: TableKey,
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn column_by_name(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn outgoing_links(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns
            .iter()
            .filter(|c| c.key.column_type().is_some_and(ColumnType::is_link))
    }
}

#[derive(Clone, Debug, Default)]
pub struct ObjectState {
    pub values: BTreeMap<ColKey, Value>,
    pub lists: BTreeMap<ColKey, Vec<Value>>,
}

impl ObjectState {
    pub fn value(&self, col: ColKey) -> Option<&Value> {
        self.values.get(&col)
    }

    pub fn list(&self, col: ColKey) -> Option<&[Value]> {
        self.lists.get(&col).map(Vec::as_slice)
    }
}

#[derive(Clone, Debug)]
pub struct TableState {
    pub schema: TableSchema,
    pub objects: BTreeMap<ObjKey, ObjectState>,
}

impl TableState {
    pub fn object(&self, obj: ObjKey) -> Option<&ObjectState> {
        self.objects.get(&obj)
    }

    pub fn object_keys(&self) -> impl Iterator<Item = ObjKey> + '_ {
        self.objects.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// The complete state of one snapshot.
#[derive(Clone, Debug, Default)]
pub struct GroupState {
    pub tables: BTreeMap<TableKey, TableState>,
}

impl GroupState {
    pub fn table(&self, key: TableKey) -> Option<&TableState> {
        self.tables.get(&key)
    }

    pub fn table_by_name(&self, name: &str) -> Option<&TableState> {
        self.tables.values().find(|t| t.schema.name == name)
    }
}

#[derive(Debug)]
pub struct Snapshot {
    pub version: u64,
    pub state: GroupState,
}

/// Key allocators. Monotonic across the whole file so keys are never reused.
#[derive(Clone, Debug)]
pub(crate) struct KeyAllocator {
    next_table: i64,
    next_obj: i64,
    next_col_index: u16,
}

impl KeyAllocator {
    fn new() -> KeyAllocator {
        KeyAllocator {
            next_table: 1,
            next_obj: 1,
            next_col_index: 0,
        }
    }

    pub(crate) fn table_key(&mut self) -> TableKey {
        let key = TableKey(self.next_table);
        self.next_table += 1;
        key
    }

    pub(crate) fn obj_key(&mut self) -> ObjKey {
        let key = ObjKey(self.next_obj);
        self.next_obj += 1;
        key
    }

    pub(crate) fn col_key(&mut self, ty: ColumnType, attrs: ColumnAttrs) -> ColKey {
        let index = self.next_col_index;
        self.next_col_index += 1;
        ColKey::new(index, ty, attrs, 0)
    }

    pub(crate) fn note_obj_key(&mut self, key: ObjKey) {
        self.next_obj = self.next_obj.max(key.0 + 1);
    }

    pub(crate) fn note_table_key(&mut self, key: TableKey) {
        self.next_table = self.next_table.max(key.0 + 1);
    }

    pub(crate) fn note_col_key(&mut self, key: ColKey) {
        self.next_col_index = self.next_col_index.max(key.index() + 1);
    }
}

pub(crate) struct DatabaseState {
    /// `snapshots[i]` is version `i + 1`; a fresh file has one empty snapshot.
    pub(crate) snapshots: Vec<Arc<Snapshot>>,
    /// Log that produced each version; version 1 has none.
    pub(crate) logs: BTreeMap<u64, Arc<Changeset>>,
    pub(crate) allocator: KeyAllocator,
}

type CommitListener = Box<dyn Fn(VersionId) + Send + Sync>;

struct WriteLockState {
    locked: Mutex<bool>,
    available: Condvar,
}

struct DatabaseInner {
    path: PathBuf,
    state: RwLock<DatabaseState>,
    write_lock: WriteLockState,
    commit_listeners: RwLock<Vec<CommitListener>>,
    next_reader_slot: AtomicU32,
}

/// Handle to one open database. Cheap to clone; all clones share the same
/// file state.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

/// Exclusive hold on the file-level write mutex. Dropping the token releases
/// the lock; the token is freely movable across threads, which is what the
/// async write acquisition path relies on.
pub struct WriteLockToken {
    db: Database,
}

impl Drop for WriteLockToken {
    fn drop(&mut self) {
        let mut locked = self.db.inner.write_lock.locked.lock();
        *locked = false;
        self.db.inner.write_lock.available.notify_one();
    }
}

static OPEN_DATABASES: Lazy<DashMap<PathBuf, Database>> = Lazy::new(DashMap::new);

impl Database {
    /// Open (or create) the database at `path`. Databases are shared
    /// process-wide per path, which is what lets every coordinator and store
    /// on one file observe the same commits.
    pub fn open(path: impl AsRef<Path>) -> Database {
        let path = path.as_ref().to_path_buf();
        OPEN_DATABASES
            .entry(path.clone())
            .or_insert_with(|| {
                tracing::debug!("creating database at {}", path.display());
                Database::new_empty(path)
            })
            .clone()
    }

    /// Drop the process-wide registration. Existing handles stay usable; the
    /// next `open` of the same path starts from an empty file.
    pub fn delete_files(path: impl AsRef<Path>) {
        OPEN_DATABASES.remove(path.as_ref());
    }

    fn new_empty(path: PathBuf) -> Database {
        Database {
            inner: Arc::new(DatabaseInner {
                path,
                state: RwLock::new(DatabaseState {
                    snapshots: vec![Arc::new(Snapshot {
                        version: 1,
                        state: GroupState::default(),
                    })],
                    logs: BTreeMap::new(),
                    allocator: KeyAllocator::new(),
                }),
                write_lock: WriteLockState {
                    locked: Mutex::new(false),
                    available: Condvar::new(),
                },
                commit_listeners: RwLock::new(Vec::new()),
                next_reader_slot: AtomicU32::new(1),
            }),
        }
    }

    pub fn is_same_file(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn latest_version(&self) -> u64 {
        self.inner.state.read().snapshots.len() as u64
    }

    pub(crate) fn state(&self) -> &RwLock<DatabaseState> {
        &self.inner.state
    }

    pub(crate) fn snapshot_at(&self, version: u64) -> CoreResult<Arc<Snapshot>> {
        let state = self.inner.state.read();
        state
            .snapshots
            .get((version.wrapping_sub(1)) as usize)
            .cloned()
            .ok_or(CoreError::NoSuchVersion(version))
    }

    pub(crate) fn logs_between(&self, after: u64, upto: u64) -> Vec<Arc<Changeset>> {
        let state = self.inner.state.read();
        state
            .logs
            .range(after + 1..=upto)
            .map(|(_, log)| log.clone())
            .collect()
    }

    pub(crate) fn alloc_reader_slot(&self) -> u32 {
        self.inner.next_reader_slot.fetch_add(1, Ordering::Relaxed)
    }

    /// Block until the file-level write mutex is free and take it.
    pub(crate) fn acquire_write(&self) -> WriteLockToken {
        let mut locked = self.inner.write_lock.locked.lock();
        while *locked {
            self.inner.write_lock.available.wait(&mut locked);
        }
        *locked = true;
        WriteLockToken { db: self.clone() }
    }

    pub(crate) fn try_acquire_write(&self) -> Option<WriteLockToken> {
        let mut locked = self.inner.write_lock.locked.lock();
        if *locked {
            return None;
        }
        *locked = true;
        Some(WriteLockToken { db: self.clone() })
    }

    /// Begin a read transaction, at `version` or at the latest snapshot.
    pub fn start_read(&self, version: Option<VersionId>) -> CoreResult<Transaction> {
        let mut tr = Transaction::new(self.clone());
        tr.begin_read(version)?;
        Ok(tr)
    }

    /// Begin a write transaction: read at latest, then promote.
    pub fn start_write(&self) -> CoreResult<Transaction> {
        let mut tr = self.start_read(None)?;
        tr.promote_to_write(None)?;
        Ok(tr)
    }

    pub fn add_commit_listener(&self, listener: CommitListener) {
        self.inner.commit_listeners.write().push(listener);
    }

    pub(crate) fn notify_commit(&self, version: VersionId) {
        for listener in self.inner.commit_listeners.read().iter() {
            listener(version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_shared_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let a = Database::open(&path);
        let b = Database::open(&path);
        assert!(a.is_same_file(&b));
        Database::delete_files(&path);
    }

    #[test]
    fn fresh_database_has_one_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("fresh.db"));
        assert_eq!(db.latest_version(), 1);
        let snapshot = db.snapshot_at(1).unwrap();
        assert!(snapshot.state.tables.is_empty());
        assert!(matches!(
            db.snapshot_at(2),
            Err(CoreError::NoSuchVersion(2))
        ));
    }
}
