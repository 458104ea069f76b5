// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The transaction façade over one database snapshot.
//!
//! A transaction wraps exactly one snapshot slot and walks the stage machine
//! `Ready → Reading → Writing → Ready`, plus `Frozen` for read-only forks
//! pinned to a version. Observers injected into `advance_read`,
//! `promote_to_write` and `rollback_and_continue_as_read` see the raw
//! instruction stream between the two versions; that is the hook the
//! coordinator uses to populate change info, and the validator uses to reject
//! incompatible schema changes.
//!
//! Transactions are single-thread owned and are not `Send`; cross-thread
//! handover goes through `ThreadSafeReference`.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use sync_types::{ColKey, ColumnAttrs, ColumnType, ObjKey, TableKey, VersionId};

use crate::{
    changeset::{Changeset, Instruction, Value},
    error::{CoreError, CoreResult},
    storage::{
        ColumnSchema, Database, GroupState, KeyAllocator, ObjectState, Snapshot, TableSchema,
        TableState, WriteLockToken,
    },
    transact_log::{replay, TransactLogObserver, TransactLogValidator},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStage {
    Ready,
    Reading,
    Writing,
    Frozen,
}

/// Stages of the asynchronous write-lock acquisition machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncStage {
    Idle,
    Requesting,
    HasLock,
    HasCommits,
    Syncing,
}

struct AsyncInner {
    stage: AsyncStage,
    pending_lock: Option<WriteLockToken>,
    canceled: bool,
}

struct AsyncShared {
    inner: Mutex<AsyncInner>,
    cond: Condvar,
}

struct WriteWork {
    state: GroupState,
    allocator: KeyAllocator,
    instructions: Vec<Instruction>,
    lock: Option<WriteLockToken>,
}

pub struct Transaction {
    db: Database,
    stage: TransactionStage,
    version: u64,
    reader_slot: u32,
    snapshot: Option<Arc<Snapshot>>,
    work: Option<WriteWork>,
    async_shared: Arc<AsyncShared>,
}

impl Transaction {
    pub(crate) fn new(db: Database) -> Transaction {
        Transaction {
            db,
            stage: TransactionStage::Ready,
            version: 0,
            reader_slot: 0,
            snapshot: None,
            work: None,
            async_shared: Arc::new(AsyncShared {
                inner: Mutex::new(AsyncInner {
                    stage: AsyncStage::Idle,
                    pending_lock: None,
                    canceled: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn stage(&self) -> TransactionStage {
        self.stage
    }

    pub fn is_frozen(&self) -> bool {
        self.stage == TransactionStage::Frozen
    }

    pub fn get_version_of_current_transaction(&self) -> VersionId {
        VersionId::new(self.version, self.reader_slot)
    }

    // -----------------------------------------------------------------
    // Stage transitions

    pub fn begin_read(&mut self, version: Option<VersionId>) -> CoreResult<()> {
        if self.stage != TransactionStage::Ready {
            return Err(CoreError::InvalidTransaction(
                "begin_read requires the Ready stage",
            ));
        }
        let target = version.map(|v| v.version).unwrap_or_else(|| self.db.latest_version());
        self.snapshot = Some(self.db.snapshot_at(target)?);
        self.version = target;
        self.reader_slot = self.db.alloc_reader_slot();
        self.stage = TransactionStage::Reading;
        Ok(())
    }

    pub fn end_read(&mut self) {
        if matches!(self.stage, TransactionStage::Reading | TransactionStage::Frozen) {
            self.snapshot = None;
            self.stage = TransactionStage::Ready;
        }
    }

    /// Advance a read transaction to `target` (default: latest), replaying
    /// intervening logs through `observer`. On schema incompatibility the
    /// snapshot is left where it was.
    pub fn advance_read(
        &mut self,
        observer: Option<&mut dyn TransactLogObserver>,
        target: Option<VersionId>,
    ) -> CoreResult<()> {
        if self.stage != TransactionStage::Reading {
            return Err(CoreError::InvalidTransaction(
                "advance_read requires the Reading stage",
            ));
        }
        let target = target.map(|v| v.version).unwrap_or_else(|| self.db.latest_version());
        if target < self.version {
            return Err(CoreError::InvalidTransaction(
                "cannot advance a read transaction backwards",
            ));
        }
        if target == self.version {
            return Ok(());
        }
        let new_snapshot = self.db.snapshot_at(target)?;
        let logs = self.db.logs_between(self.version, target);

        let mut validator = TransactLogValidator;
        let observer = observer.unwrap_or(&mut validator);

        let old = VersionId::new(self.version, self.reader_slot);
        let new = VersionId::new(target, self.reader_slot);
        observer.will_advance(old, new);
        for log in &logs {
            replay(log, observer)?;
        }
        observer.parse_complete()?;
        self.snapshot = Some(new_snapshot);
        self.version = target;
        observer.did_advance(old, new);
        Ok(())
    }

    /// Promote to a write transaction, first replaying any commits that
    /// landed since this transaction's snapshot.
    pub fn promote_to_write(
        &mut self,
        observer: Option<&mut dyn TransactLogObserver>,
    ) -> CoreResult<()> {
        if self.stage != TransactionStage::Reading {
            return Err(CoreError::InvalidTransaction(
                "promote_to_write requires the Reading stage",
            ));
        }
        let lock = self.db.acquire_write();
        if let Err(e) = self.advance_read(observer, None) {
            drop(lock);
            return Err(e);
        }
        self.begin_write_work(lock);
        Ok(())
    }

    fn begin_write_work(&mut self, lock: WriteLockToken) {
        let snapshot = self.snapshot.as_ref().expect("Reading stage has a snapshot");
        let allocator = self.db.state().read().allocator.clone();
        self.work = Some(WriteWork {
            state: snapshot.state.clone(),
            allocator,
            instructions: Vec::new(),
            lock: Some(lock),
        });
        self.stage = TransactionStage::Writing;
    }

    pub fn commit(&mut self) -> CoreResult<VersionId> {
        let version = self.do_commit()?;
        self.snapshot = None;
        self.stage = TransactionStage::Ready;
        Ok(version)
    }

    pub fn commit_and_continue_as_read(&mut self) -> CoreResult<VersionId> {
        let version = self.do_commit()?;
        self.snapshot = Some(self.db.snapshot_at(version.version)?);
        self.version = version.version;
        self.stage = TransactionStage::Reading;
        Ok(version)
    }

    pub fn commit_and_continue_writing(&mut self) -> CoreResult<VersionId> {
        let lock = self
            .work
            .as_mut()
            .and_then(|w| w.lock.take())
            .ok_or(CoreError::InvalidTransaction("no write in progress"))?;
        let version = self.do_commit()?;
        self.snapshot = Some(self.db.snapshot_at(version.version)?);
        self.version = version.version;
        self.stage = TransactionStage::Reading;
        self.begin_write_work(lock);
        Ok(version)
    }

    fn do_commit(&mut self) -> CoreResult<VersionId> {
        if self.stage != TransactionStage::Writing {
            return Err(CoreError::InvalidTransaction(
                "commit requires a write transaction",
            ));
        }
        let work = self.work.take().expect("Writing stage has work");
        let changeset = Changeset::new(work.instructions);
        let new_version = {
            let mut state = self.db.state().write();
            let new_version = state.snapshots.len() as u64 + 1;
            state.snapshots.push(Arc::new(Snapshot {
                version: new_version,
                state: work.state,
            }));
            state.logs.insert(new_version, Arc::new(changeset));
            state.allocator = work.allocator;
            new_version
        };
        // The write lock is released here unless the caller kept it.
        if work.lock.is_some() {
            drop(work.lock);
            self.note_write_lock_released();
        }
        let version = VersionId::new(new_version, self.reader_slot);
        tracing::trace!("committed version {new_version}");
        self.db.notify_commit(version);
        Ok(version)
    }

    pub fn rollback(&mut self) -> CoreResult<()> {
        if self.stage != TransactionStage::Writing {
            return Err(CoreError::InvalidTransaction(
                "rollback requires a write transaction",
            ));
        }
        self.work = None;
        self.snapshot = None;
        self.stage = TransactionStage::Ready;
        self.note_write_lock_released();
        Ok(())
    }

    fn note_write_lock_released(&self) {
        let mut inner = self.async_shared.inner.lock();
        if inner.stage == AsyncStage::HasLock {
            inner.stage = AsyncStage::Idle;
        }
    }

    pub fn has_unsynced_commits(&self) -> bool {
        self.async_shared.inner.lock().stage == AsyncStage::HasCommits
    }

    pub fn is_synchronizing(&self) -> bool {
        self.async_shared.inner.lock().stage == AsyncStage::Syncing
    }

    pub fn rollback_and_continue_as_read(
        &mut self,
        observer: Option<&mut dyn TransactLogObserver>,
    ) -> CoreResult<()> {
        if self.stage != TransactionStage::Writing {
            return Err(CoreError::InvalidTransaction(
                "rollback requires a write transaction",
            ));
        }
        let work = self.work.take().expect("Writing stage has work");
        if let Some(observer) = observer {
            let log = Changeset::new(work.instructions).encode();
            observer.will_reverse(&log);
        }
        drop(work.lock);
        self.stage = TransactionStage::Reading;
        self.note_write_lock_released();
        Ok(())
    }

    /// Produce an independent read-only transaction pinned to this version.
    pub fn freeze(&self) -> CoreResult<Transaction> {
        if self.stage != TransactionStage::Reading {
            return Err(CoreError::InvalidTransaction(
                "freeze requires the Reading stage",
            ));
        }
        let mut frozen = Transaction::new(self.db.clone());
        frozen.snapshot = self.snapshot.clone();
        frozen.version = self.version;
        frozen.reader_slot = self.db.alloc_reader_slot();
        frozen.stage = TransactionStage::Frozen;
        Ok(frozen)
    }

    // -----------------------------------------------------------------
    // Async write acquisition

    pub fn async_stage(&self) -> AsyncStage {
        self.async_shared.inner.lock().stage
    }

    pub fn holds_write_mutex(&self) -> bool {
        matches!(
            self.async_stage(),
            AsyncStage::HasLock | AsyncStage::HasCommits
        )
    }

    /// Request the write lock without blocking. Returns `true` if the lock
    /// was acquired immediately (the transaction is now Writing); otherwise a
    /// background waiter resolves the request and `wait_for_async_write`
    /// completes the promotion.
    pub fn async_request_write(&mut self) -> CoreResult<bool> {
        if self.stage != TransactionStage::Reading {
            return Err(CoreError::InvalidTransaction(
                "async write requests require the Reading stage",
            ));
        }
        {
            let inner = self.async_shared.inner.lock();
            if inner.stage != AsyncStage::Idle {
                return Err(CoreError::InvalidTransaction(
                    "an async write is already in flight",
                ));
            }
        }
        if let Some(lock) = self.db.try_acquire_write() {
            self.advance_read(None, None)?;
            self.begin_write_work(lock);
            self.async_shared.inner.lock().stage = AsyncStage::HasLock;
            return Ok(true);
        }

        self.async_shared.inner.lock().stage = AsyncStage::Requesting;
        let shared = self.async_shared.clone();
        let db = self.db.clone();
        std::thread::Builder::new()
            .name("sync-async-write".to_string())
            .spawn(move || {
                let lock = db.acquire_write();
                let mut inner = shared.inner.lock();
                if inner.canceled {
                    inner.stage = AsyncStage::Idle;
                    inner.canceled = false;
                    drop(lock);
                } else {
                    inner.pending_lock = Some(lock);
                    inner.stage = AsyncStage::HasLock;
                }
                shared.cond.notify_all();
            })
            .expect("spawning the async write waiter cannot fail");
        Ok(false)
    }

    /// Block until a pending async write request holds the lock, then finish
    /// the promotion. Returns `Err(Shutdown)` if the request was canceled.
    pub fn wait_for_async_write(
        &mut self,
        observer: Option<&mut dyn TransactLogObserver>,
    ) -> CoreResult<()> {
        let lock = {
            let mut inner = self.async_shared.inner.lock();
            loop {
                match inner.stage {
                    AsyncStage::HasLock => {
                        if let Some(lock) = inner.pending_lock.take() {
                            break lock;
                        }
                        // Lock acquired synchronously; nothing to finish.
                        return Ok(());
                    }
                    AsyncStage::Requesting => self.async_shared.cond.wait(&mut inner),
                    AsyncStage::Idle => return Err(CoreError::Shutdown),
                    _ => {
                        return Err(CoreError::InvalidTransaction(
                            "no async write request in flight",
                        ))
                    }
                }
            }
        };
        if let Err(e) = self.advance_read(observer, None) {
            drop(lock);
            self.async_shared.inner.lock().stage = AsyncStage::Idle;
            return Err(e);
        }
        self.begin_write_work(lock);
        Ok(())
    }

    /// Commit the async write, releasing the write lock but deferring
    /// durability until `async_complete_writes`.
    pub fn async_commit(&mut self) -> CoreResult<VersionId> {
        {
            let inner = self.async_shared.inner.lock();
            if inner.stage != AsyncStage::HasLock {
                return Err(CoreError::InvalidTransaction(
                    "async_commit requires the lock to be held",
                ));
            }
        }
        let version = self.commit_and_continue_as_read()?;
        self.async_shared.inner.lock().stage = AsyncStage::HasCommits;
        Ok(version)
    }

    /// Synchronize all async commits performed so far. `on_sync` fires once
    /// the commits are durable.
    pub fn async_complete_writes(&mut self, on_sync: Option<Box<dyn FnOnce() + Send>>) {
        let had_commits = {
            let mut inner = self.async_shared.inner.lock();
            match inner.stage {
                AsyncStage::HasCommits => {
                    inner.stage = AsyncStage::Syncing;
                    true
                }
                _ => false,
            }
        };
        if had_commits {
            // Snapshots in this engine are durable at commit; the stage pair
            // still round-trips so callers observe the same lifecycle.
            let mut inner = self.async_shared.inner.lock();
            inner.stage = AsyncStage::Idle;
            self.async_shared.cond.notify_all();
        }
        if let Some(on_sync) = on_sync {
            on_sync();
        }
    }

    /// Drain pending async work before closing: cancel an in-flight request,
    /// roll back an open async write, synchronize completed commits.
    pub fn prepare_for_close(&mut self) {
        let mut inner = self.async_shared.inner.lock();
        match inner.stage {
            AsyncStage::Requesting => {
                inner.canceled = true;
                while inner.stage == AsyncStage::Requesting {
                    self.async_shared.cond.wait(&mut inner);
                }
                if let Some(lock) = inner.pending_lock.take() {
                    drop(lock);
                }
                inner.stage = AsyncStage::Idle;
                drop(inner);
            }
            AsyncStage::HasLock => {
                drop(inner);
                if self.stage == TransactionStage::Writing {
                    let _ = self.rollback_and_continue_as_read(None);
                }
                self.async_shared.inner.lock().stage = AsyncStage::Idle;
            }
            AsyncStage::HasCommits => {
                drop(inner);
                self.async_complete_writes(None);
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------
    // Reads

    pub fn state(&self) -> CoreResult<&GroupState> {
        match self.stage {
            TransactionStage::Writing => Ok(&self.work.as_ref().expect("writing has work").state),
            TransactionStage::Reading | TransactionStage::Frozen => Ok(&self
                .snapshot
                .as_ref()
                .expect("reading has a snapshot")
                .state),
            TransactionStage::Ready => Err(CoreError::InvalidTransaction(
                "transaction is not attached to a snapshot",
            )),
        }
    }

    pub fn table(&self, key: TableKey) -> CoreResult<&TableState> {
        self.state()?.table(key).ok_or(CoreError::InvalidatedObject)
    }

    pub fn table_by_name(&self, name: &str) -> CoreResult<Option<&TableState>> {
        Ok(self.state()?.table_by_name(name))
    }

    pub fn object(&self, table: TableKey, obj: ObjKey) -> CoreResult<&ObjectState> {
        self.table(table)?
            .object(obj)
            .ok_or(CoreError::InvalidatedObject)
    }

    // -----------------------------------------------------------------
    // Writes

    fn work_mut(&mut self) -> CoreResult<&mut WriteWork> {
        if self.stage != TransactionStage::Writing {
            return Err(CoreError::InvalidTransaction(
                "mutations require a write transaction",
            ));
        }
        Ok(self.work.as_mut().expect("writing has work"))
    }

    pub fn add_table(&mut self, name: &str) -> CoreResult<TableKey> {
        let key = self.work_mut()?.allocator.table_key();
        self.apply_instruction(Instruction::AddTable {
            table: key,
            name: name.to_string(),
        })?;
        Ok(key)
    }

    pub fn add_column(
        &mut self,
        table: TableKey,
        name: &str,
        ty: ColumnType,
        nullable: bool,
        target: Option<TableKey>,
    ) -> CoreResult<ColKey> {
        let mut attrs = 0u8;
        if nullable {
            attrs |= ColumnAttrs::NULLABLE;
        }
        if ty.is_list() {
            attrs |= ColumnAttrs::LIST;
        }
        let col = self.work_mut()?.allocator.col_key(ty, ColumnAttrs(attrs));
        self.apply_instruction(Instruction::AddColumn {
            table,
            col,
            name: name.to_string(),
            target,
        })?;
        Ok(col)
    }

    pub fn create_object(&mut self, table: TableKey) -> CoreResult<ObjKey> {
        let obj = self.work_mut()?.allocator.obj_key();
        self.apply_instruction(Instruction::CreateObject { table, obj })?;
        Ok(obj)
    }

    pub fn create_object_with_key(&mut self, table: TableKey, obj: ObjKey) -> CoreResult<()> {
        self.apply_instruction(Instruction::CreateObject { table, obj })
    }

    pub fn erase_object(&mut self, table: TableKey, obj: ObjKey) -> CoreResult<()> {
        self.apply_instruction(Instruction::EraseObject { table, obj })
    }

    pub fn set_value(
        &mut self,
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        value: Value,
    ) -> CoreResult<()> {
        self.apply_instruction(Instruction::Set {
            table,
            obj,
            col,
            value,
        })
    }

    /// Clearing streams the individual removals first so observers see every
    /// affected key, then the clear marker.
    pub fn clear_table(&mut self, table: TableKey) -> CoreResult<()> {
        let keys: Vec<ObjKey> = {
            let work = self.work_mut()?;
            work.state
                .table(table)
                .ok_or(CoreError::InvalidatedObject)?
                .object_keys()
                .collect()
        };
        let old_size = keys.len() as u64;
        for obj in keys {
            self.apply_instruction(Instruction::EraseObject { table, obj })?;
        }
        self.apply_instruction(Instruction::ClearTable { table, old_size })
    }

    pub fn list_insert(
        &mut self,
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        index: usize,
        value: Value,
    ) -> CoreResult<()> {
        self.apply_instruction(Instruction::ListInsert {
            table,
            obj,
            col,
            index: index as u64,
            value,
        })
    }

    pub fn list_set(
        &mut self,
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        index: usize,
        value: Value,
    ) -> CoreResult<()> {
        self.apply_instruction(Instruction::ListSet {
            table,
            obj,
            col,
            index: index as u64,
            value,
        })
    }

    pub fn list_erase(
        &mut self,
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        index: usize,
    ) -> CoreResult<()> {
        self.apply_instruction(Instruction::ListErase {
            table,
            obj,
            col,
            index: index as u64,
        })
    }

    pub fn list_move(
        &mut self,
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        from: usize,
        to: usize,
    ) -> CoreResult<()> {
        self.apply_instruction(Instruction::ListMove {
            table,
            obj,
            col,
            from: from as u64,
            to: to as u64,
        })
    }

    pub fn list_swap(
        &mut self,
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        a: usize,
        b: usize,
    ) -> CoreResult<()> {
        self.apply_instruction(Instruction::ListSwap {
            table,
            obj,
            col,
            a: a as u64,
            b: b as u64,
        })
    }

    pub fn list_clear(&mut self, table: TableKey, obj: ObjKey, col: ColKey) -> CoreResult<()> {
        let old_size = self
            .object(table, obj)?
            .list(col)
            .map(<[Value]>::len)
            .unwrap_or(0) as u64;
        self.apply_instruction(Instruction::ListClear {
            table,
            obj,
            col,
            old_size,
        })
    }

    /// The instructions accumulated by this write transaction so far.
    pub fn pending_changeset(&self) -> CoreResult<Changeset> {
        match (&self.stage, &self.work) {
            (TransactionStage::Writing, Some(work)) => {
                Ok(Changeset::new(work.instructions.clone()))
            }
            _ => Err(CoreError::InvalidTransaction(
                "no write transaction in progress",
            )),
        }
    }

    /// Apply every instruction of a decoded changeset. Used when integrating
    /// remote changesets; the instructions become part of this transaction's
    /// log so local observers see them like any other write.
    pub fn apply_changeset(&mut self, changeset: &Changeset) -> CoreResult<()> {
        for instruction in &changeset.instructions {
            self.apply_instruction(instruction.clone())?;
        }
        Ok(())
    }

    fn apply_instruction(&mut self, instruction: Instruction) -> CoreResult<()> {
        let work = self.work_mut()?;
        apply_to_state(&mut work.state, &mut work.allocator, &instruction)?;
        work.instructions.push(instruction);
        Ok(())
    }
}

fn bad(message: impl Into<String>) -> CoreError {
    CoreError::BadChangeset(message.into())
}

fn apply_to_state(
    state: &mut GroupState,
    allocator: &mut KeyAllocator,
    instruction: &Instruction,
) -> CoreResult<()> {
    match instruction {
        Instruction::AddTable { table, name } => {
            if state.tables.contains_key(table) {
                return Err(bad(format!("table {table:?} already exists")));
            }
            allocator.note_table_key(*table);
            state.tables.insert(
                *table,
                TableState {
                    schema: TableSchema {
                        key: *table,
                        name: name.clone(),
                        columns: Vec::new(),
                    },
                    objects: std::collections::BTreeMap::new(),
                },
            );
        }
        Instruction::EraseTable { table } => {
            state
                .tables
                .remove(table)
                .ok_or_else(|| bad(format!("no table {table:?}")))?;
        }
        Instruction::RenameTable { table, name } => {
            let t = table_mut(state, *table)?;
            t.schema.name = name.clone();
        }
        Instruction::AddColumn {
            table,
            col,
            name,
            target,
        } => {
            allocator.note_col_key(*col);
            let t = table_mut(state, *table)?;
            if t.schema.columns.iter().any(|c| c.key == *col) {
                return Err(bad(format!("column {col:?} already exists")));
            }
            t.schema.columns.push(ColumnSchema {
                key: *col,
                name: name.clone(),
                target: *target,
            });
        }
        Instruction::EraseColumn { table, col } => {
            let t = table_mut(state, *table)?;
            let before = t.schema.columns.len();
            t.schema.columns.retain(|c| c.key != *col);
            if t.schema.columns.len() == before {
                return Err(bad(format!("no column {col:?}")));
            }
            for obj in t.objects.values_mut() {
                obj.values.remove(col);
                obj.lists.remove(col);
            }
        }
        Instruction::RenameColumn { table, col, name } => {
            let t = table_mut(state, *table)?;
            let c = t
                .schema
                .columns
                .iter_mut()
                .find(|c| c.key == *col)
                .ok_or_else(|| bad(format!("no column {col:?}")))?;
            c.name = name.clone();
        }
        Instruction::CreateObject { table, obj } => {
            allocator.note_obj_key(*obj);
            let t = table_mut(state, *table)?;
            if t.objects.contains_key(obj) {
                return Err(bad(format!("object {obj:?} already exists")));
            }
            t.objects.insert(*obj, ObjectState::default());
        }
        Instruction::EraseObject { table, obj } => {
            let t = table_mut(state, *table)?;
            t.objects
                .remove(obj)
                .ok_or_else(|| bad(format!("no object {obj:?}")))?;
        }
        Instruction::ClearTable { table, .. } => {
            let t = table_mut(state, *table)?;
            t.objects.clear();
        }
        Instruction::Set {
            table,
            obj,
            col,
            value,
        } => {
            let o = object_mut(state, *table, *obj)?;
            if value.is_null() {
                o.values.remove(col);
            } else {
                o.values.insert(*col, value.clone());
            }
        }
        Instruction::ListSet {
            table,
            obj,
            col,
            index,
            value,
        } => {
            let list = list_mut(state, *table, *obj, *col)?;
            let slot = list
                .get_mut(*index as usize)
                .ok_or_else(|| bad(format!("list index {index} out of bounds")))?;
            *slot = value.clone();
        }
        Instruction::ListInsert {
            table,
            obj,
            col,
            index,
            value,
        } => {
            let list = list_mut(state, *table, *obj, *col)?;
            if (*index as usize) > list.len() {
                return Err(bad(format!("list index {index} out of bounds")));
            }
            list.insert(*index as usize, value.clone());
        }
        Instruction::ListErase {
            table,
            obj,
            col,
            index,
        } => {
            let list = list_mut(state, *table, *obj, *col)?;
            if (*index as usize) >= list.len() {
                return Err(bad(format!("list index {index} out of bounds")));
            }
            list.remove(*index as usize);
        }
        Instruction::ListMove {
            table,
            obj,
            col,
            from,
            to,
        } => {
            let list = list_mut(state, *table, *obj, *col)?;
            if (*from as usize) >= list.len() || (*to as usize) >= list.len() {
                return Err(bad("list move out of bounds".to_string()));
            }
            let value = list.remove(*from as usize);
            list.insert(*to as usize, value);
        }
        Instruction::ListSwap {
            table,
            obj,
            col,
            a,
            b,
        } => {
            let list = list_mut(state, *table, *obj, *col)?;
            if (*a as usize) >= list.len() || (*b as usize) >= list.len() {
                return Err(bad("list swap out of bounds".to_string()));
            }
            list.swap(*a as usize, *b as usize);
        }
        Instruction::ListClear {
            table, obj, col, ..
        } => {
            let list = list_mut(state, *table, *obj, *col)?;
            list.clear();
        }
    }
    Ok(())
}

fn table_mut(state: &mut GroupState, table: TableKey) -> CoreResult<&mut TableState> {
    state
        .tables
        .get_mut(&table)
        .ok_or_else(|| bad(format!("no table {table:?}")))
}

fn object_mut(state: &mut GroupState, table: TableKey, obj: ObjKey) -> CoreResult<&mut ObjectState> {
    table_mut(state, table)?
        .objects
        .get_mut(&obj)
        .ok_or_else(|| bad(format!("no object {obj:?}")))
}

fn list_mut<'a>(
    state: &'a mut GroupState,
    table: TableKey,
    obj: ObjKey,
    col: ColKey,
) -> CoreResult<&'a mut Vec<Value>> {
    Ok(object_mut(state, table, obj)?.lists.entry(col).or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transact_log::{ChangeInfoCollector, TransactionChangeInfo};

    fn test_db(name: &str) -> Database {
        let dir = tempfile::tempdir().unwrap();
        // Leak the tempdir so the path stays unique for the process lifetime.
        let path = dir.into_path().join(name);
        Database::open(path)
    }

    #[test]
    fn stage_machine_walks_ready_reading_writing() {
        let db = test_db("stages.db");
        let mut tr = db.start_read(None).unwrap();
        assert_eq!(tr.stage(), TransactionStage::Reading);
        tr.promote_to_write(None).unwrap();
        assert_eq!(tr.stage(), TransactionStage::Writing);
        let table = tr.add_table("items").unwrap();
        let obj = tr.create_object(table).unwrap();
        assert!(tr.object(table, obj).is_ok());
        let version = tr.commit().unwrap();
        assert_eq!(tr.stage(), TransactionStage::Ready);
        assert_eq!(version.version, 2);
    }

    #[test]
    fn mutations_outside_write_transactions_fail() {
        let db = test_db("no-write.db");
        let mut tr = db.start_read(None).unwrap();
        assert!(matches!(
            tr.add_table("nope"),
            Err(CoreError::InvalidTransaction(_))
        ));
        assert!(matches!(tr.commit(), Err(CoreError::InvalidTransaction(_))));
    }

    #[test]
    fn advance_read_replays_logs_through_observer() {
        let db = test_db("advance.db");
        let mut reader = db.start_read(None).unwrap();

        let mut writer = db.start_write().unwrap();
        let table = writer.add_table("items").unwrap();
        let obj = writer.create_object(table).unwrap();
        writer.commit().unwrap();

        let mut info = TransactionChangeInfo {
            track_all: true,
            ..Default::default()
        };
        let mut collector = ChangeInfoCollector::new(&mut info);
        reader.advance_read(Some(&mut collector), None).unwrap();
        assert_eq!(reader.get_version_of_current_transaction().version, 2);
        assert!(info.tables[&table].insertions_contains(obj));
        assert!(info.schema_changed);
    }

    #[test]
    fn rollback_discards_work() {
        let db = test_db("rollback.db");
        let mut tr = db.start_write().unwrap();
        tr.add_table("gone").unwrap();
        tr.rollback_and_continue_as_read(None).unwrap();
        assert_eq!(tr.stage(), TransactionStage::Reading);
        assert!(tr.table_by_name("gone").unwrap().is_none());
        assert_eq!(db.latest_version(), 1);
    }

    #[test]
    fn freeze_pins_a_version() {
        let db = test_db("freeze.db");
        let mut tr = db.start_read(None).unwrap();
        let frozen = tr.freeze().unwrap();

        let mut writer = db.start_write().unwrap();
        writer.add_table("later").unwrap();
        writer.commit().unwrap();

        tr.advance_read(None, None).unwrap();
        assert_eq!(tr.get_version_of_current_transaction().version, 2);
        assert_eq!(frozen.get_version_of_current_transaction().version, 1);
        assert!(frozen.is_frozen());
        assert!(frozen.table_by_name("later").unwrap().is_none());
    }

    #[test]
    fn commit_and_continue_writing_keeps_the_lock() {
        let db = test_db("continue.db");
        let mut tr = db.start_write().unwrap();
        tr.add_table("a").unwrap();
        tr.commit_and_continue_writing().unwrap();
        assert_eq!(tr.stage(), TransactionStage::Writing);
        tr.add_table("b").unwrap();
        tr.commit().unwrap();
        assert_eq!(db.latest_version(), 3);
    }

    #[test]
    fn clear_table_streams_removals_then_marker() {
        let db = test_db("clear.db");
        let mut tr = db.start_write().unwrap();
        let table = tr.add_table("items").unwrap();
        let a = tr.create_object(table).unwrap();
        let b = tr.create_object(table).unwrap();
        tr.commit_and_continue_as_read().unwrap();

        let mut reader = db.start_read(None).unwrap();

        tr.promote_to_write(None).unwrap();
        tr.clear_table(table).unwrap();
        tr.commit().unwrap();

        let mut info = TransactionChangeInfo {
            track_all: true,
            ..Default::default()
        };
        let mut collector = ChangeInfoCollector::new(&mut info);
        reader.advance_read(Some(&mut collector), None).unwrap();
        let changes = &info.tables[&table];
        assert!(changes.clear_did_occur());
        assert!(changes.deletions_contains(a));
        assert!(changes.deletions_contains(b));
    }

    #[test]
    fn async_write_acquires_when_lock_is_free() {
        let db = test_db("async-free.db");
        let mut tr = db.start_read(None).unwrap();
        assert!(tr.async_request_write().unwrap());
        assert_eq!(tr.async_stage(), AsyncStage::HasLock);
        tr.add_table("t").unwrap();
        tr.async_commit().unwrap();
        assert_eq!(tr.async_stage(), AsyncStage::HasCommits);
        assert!(tr.has_unsynced_commits());
        tr.async_complete_writes(None);
        assert_eq!(tr.async_stage(), AsyncStage::Idle);
    }

    #[test]
    fn async_write_waits_for_contended_lock() {
        let db = test_db("async-contended.db");
        let mut holder = db.start_write().unwrap();
        let mut tr = db.start_read(None).unwrap();
        assert!(!tr.async_request_write().unwrap());
        assert_eq!(tr.async_stage(), AsyncStage::Requesting);

        holder.add_table("t").unwrap();
        holder.commit().unwrap();

        tr.wait_for_async_write(None).unwrap();
        assert_eq!(tr.stage(), TransactionStage::Writing);
        assert!(tr.table_by_name("t").unwrap().is_some());
        tr.rollback_and_continue_as_read(None).unwrap();
        assert_eq!(tr.async_stage(), AsyncStage::Idle);
    }

    #[test]
    fn prepare_for_close_cancels_pending_request() {
        let db = test_db("async-cancel.db");
        let holder = db.start_write().unwrap();
        let mut tr = db.start_read(None).unwrap();
        assert!(!tr.async_request_write().unwrap());
        drop(holder);
        tr.prepare_for_close();
        assert_eq!(tr.async_stage(), AsyncStage::Idle);
    }
}
