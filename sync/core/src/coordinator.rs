// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide coordination of notifiers per database file.
//!
//! One coordinator exists per open path, owning the background worker thread
//! that all sessions on that file share. After every commit the worker
//! advances its private snapshot with a change-info collector, runs each
//! registered notifier, parks the handover payloads and signals the target
//! threads. Target threads pull the packaged changes on their next refresh or
//! write, so callbacks always fire with a diff anchored at the version that
//! thread last saw.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc, Weak,
    },
    thread,
    time::Instant,
};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use sync_config::Parameters;
use sync_types::VersionId;

use crate::{
    error::{CoreError, CoreResult},
    history::ClientHistory,
    metrics::Metrics,
    notifier::Notifier,
    storage::{Database, TableSchema},
    transact_log::{ChangeInfoCollector, TransactionChangeInfo},
    transaction::Transaction,
};

static COORDINATORS: Lazy<DashMap<PathBuf, Weak<DbCoordinator>>> = Lazy::new(DashMap::new);

struct WorkerInner {
    commit_available: bool,
    shutdown: bool,
}

struct WorkerState {
    inner: Mutex<WorkerInner>,
    cond: Condvar,
}

type ChangeSignal = Box<dyn Fn() + Send + Sync>;

pub struct DbCoordinator {
    db: Database,
    parameters: Parameters,
    metrics: Arc<Metrics>,
    notifiers: Mutex<Vec<Weak<dyn Notifier>>>,
    worker_state: Arc<WorkerState>,
    worker_handle: Mutex<Option<thread::JoinHandle<()>>>,
    /// Event-loop signals fired after the worker finishes a tick.
    change_signals: Mutex<Vec<ChangeSignal>>,
    schema_cache: Mutex<Option<(u64, Vec<TableSchema>)>>,
}

impl DbCoordinator {
    /// Get or create the shared coordinator for `path`.
    pub fn get_coordinator(path: impl AsRef<Path>, parameters: Parameters) -> Arc<DbCoordinator> {
        let path = path.as_ref().to_path_buf();
        if let Some(existing) = COORDINATORS.get(&path).and_then(|weak| weak.upgrade()) {
            return existing;
        }
        let coordinator = Arc::new(DbCoordinator::new(&path, parameters));
        coordinator.start_worker();
        COORDINATORS.insert(path, Arc::downgrade(&coordinator));
        coordinator
    }

    fn new(path: &Path, parameters: Parameters) -> DbCoordinator {
        let db = Database::open(path);
        let metrics = Metrics::new(&prometheus::Registry::new());
        let worker_state = Arc::new(WorkerState {
            inner: Mutex::new(WorkerInner {
                commit_available: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        DbCoordinator {
            db,
            parameters,
            metrics,
            notifiers: Mutex::new(Vec::new()),
            worker_state,
            worker_handle: Mutex::new(None),
            change_signals: Mutex::new(Vec::new()),
            schema_cache: Mutex::new(None),
        }
    }

    fn start_worker(self: &Arc<DbCoordinator>) {
        let weak = Arc::downgrade(self);
        let state = self.worker_state.clone();
        let db = self.db.clone();
        let idle_wait = self.parameters.worker_idle_wait;

        {
            let state = self.worker_state.clone();
            self.db.add_commit_listener(Box::new(move |_| {
                let mut inner = state.inner.lock();
                inner.commit_available = true;
                state.cond.notify_one();
            }));
        }

        let handle = thread::Builder::new()
            .name("sync-notifier-worker".to_string())
            .spawn(move || {
                let Ok(mut tr) = db.start_read(None) else {
                    return;
                };
                loop {
                    {
                        let mut inner = state.inner.lock();
                        while !inner.commit_available && !inner.shutdown {
                            // The timeout only guards against a missed
                            // notification; idle wakeups do not tick.
                            state.cond.wait_for(&mut inner, idle_wait);
                        }
                        if inner.shutdown {
                            return;
                        }
                        inner.commit_available = false;
                    }
                    let Some(coordinator) = weak.upgrade() else {
                        return;
                    };
                    // Runs even when the snapshot is current: freshly
                    // registered notifiers need their initial pass.
                    coordinator.run_notifiers(&mut tr);
                    drop(coordinator);
                }
            })
            .expect("spawning the notifier worker cannot fail");
        *self.worker_handle.lock() = Some(handle);
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Register a notifier. The coordinator holds it weakly: dropping every
    /// user handle unregisters it.
    pub fn register_notifier(&self, notifier: &Arc<dyn Notifier>) {
        let mut notifiers = self.notifiers.lock();
        notifiers.push(Arc::downgrade(notifier));
        self.metrics
            .registered_notifiers
            .set(notifiers.len() as i64);
        // Make sure the first run happens even without a commit.
        self.wake_worker();
    }

    /// Register a target-thread signal fired when new notifications are
    /// ready to pull.
    pub fn on_change(&self, signal: ChangeSignal) {
        self.change_signals.lock().push(signal);
    }

    fn wake_worker(&self) {
        let mut inner = self.worker_state.inner.lock();
        inner.commit_available = true;
        self.worker_state.cond.notify_one();
    }

    fn live_notifiers(&self) -> Vec<Arc<dyn Notifier>> {
        let mut lock = self.notifiers.lock();
        lock.retain(|weak| weak.strong_count() > 0);
        let live: Vec<Arc<dyn Notifier>> =
            lock.iter().filter_map(|weak| weak.upgrade()).collect();
        self.metrics.registered_notifiers.set(live.len() as i64);
        live
    }

    /// One background tick: advance the worker snapshot while collecting
    /// change info, run every notifier, park the handovers, signal targets.
    fn run_notifiers(&self, tr: &mut Transaction) {
        let started = Instant::now();
        self.metrics.commits_observed.inc();
        let notifiers = self.live_notifiers();
        if notifiers.is_empty() {
            // Still advance so schema validation happens eagerly.
            if let Err(e) = tr.advance_read(None, None) {
                tracing::warn!("worker failed to advance without notifiers: {e}");
            }
            return;
        }

        let mut info = TransactionChangeInfo::default();
        for notifier in &notifiers {
            notifier.add_required_change_info(&mut info);
        }

        let advance_result = {
            let mut collector = ChangeInfoCollector::new(&mut info);
            tr.advance_read(Some(&mut collector), None)
        };
        match advance_result {
            Ok(()) => {}
            Err(error @ CoreError::UnsupportedSchemaChange) => {
                tracing::error!("incompatible schema change observed; failing notifiers");
                self.invalidate_schema_cache();
                for notifier in &notifiers {
                    notifier.core().deliver_error(error.clone());
                    self.metrics.notifier_errors.inc();
                }
                self.notifiers.lock().clear();
                return;
            }
            Err(error) => {
                tracing::warn!("worker advance failed: {error}");
                return;
            }
        }
        if info.schema_changed {
            self.invalidate_schema_cache();
        }

        // A wakeup with nothing new must not touch notifiers that were
        // already packaged at this version, or it would consume their
        // skip-next flags with an empty window.
        let current = tr.get_version_of_current_transaction().version;
        let pending: Vec<&Arc<dyn Notifier>> = notifiers
            .iter()
            .filter(|n| {
                n.core()
                    .version()
                    .map_or(true, |packaged| packaged.version < current)
            })
            .collect();
        for notifier in &pending {
            notifier.run(tr, &info);
            self.metrics.notifier_runs.inc();
        }
        {
            let _lock = self.notifiers.lock();
            for notifier in &pending {
                notifier.prepare_handover(tr);
            }
        }
        self.metrics
            .worker_tick_latency
            .observe(started.elapsed().as_secs_f64());

        for signal in self.change_signals.lock().iter() {
            signal();
        }
    }

    /// Target-thread delivery pump: package each notifier, advance the
    /// user's transaction to the packaged version, fire hooks.
    pub fn advance_to_ready(&self, tr: &mut Transaction) -> CoreResult<()> {
        self.advance_to_ready_for(tr, None)
    }

    /// Delivery pump restricted to the notifiers owned by one target
    /// session; unowned notifiers deliver everywhere.
    pub(crate) fn advance_to_ready_for(
        &self,
        tr: &mut Transaction,
        target: Option<u64>,
    ) -> CoreResult<()> {
        let notifiers: Vec<Arc<dyn Notifier>> = self
            .live_notifiers()
            .into_iter()
            .filter(|n| {
                target.map_or(true, |t| {
                    let owner = n.core().target();
                    owner == t || owner == 0
                })
            })
            .collect();
        let mut deliverable = Vec::new();
        let mut target_version: Option<VersionId> = None;
        {
            let _lock = self.notifiers.lock();
            for notifier in &notifiers {
                if notifier.core().package_for_delivery() {
                    deliverable.push(notifier.clone());
                }
                if let Some(version) = notifier.core().version() {
                    target_version =
                        Some(target_version.map_or(version, |current: VersionId| {
                            if version.version > current.version {
                                version
                            } else {
                                current
                            }
                        }));
                }
            }
        }

        for notifier in &deliverable {
            if let Some(error) = notifier.core().error() {
                notifier.core().deliver_error(error);
                continue;
            }
            notifier.core().before_advance();
        }
        // Advance to the packaged version; a target that already moved past
        // it stays where it is, and without notifiers we go straight to
        // latest.
        let current = tr.get_version_of_current_transaction();
        let target = match target_version {
            Some(version) if version.version > current.version => Some(version),
            Some(_) => Some(current),
            None => None,
        };
        tr.advance_read(None, target)?;
        for notifier in &deliverable {
            notifier.deliver(tr);
            notifier.core().after_advance();
            self.metrics.notifier_deliveries.inc();
        }
        Ok(())
    }

    /// Promote with delivery: pending notifications fire first, then the
    /// write lock is taken.
    pub fn promote_to_write(&self, tr: &mut Transaction) -> CoreResult<()> {
        self.advance_to_ready(tr)?;
        tr.promote_to_write(None)
    }

    pub fn cached_schema(&self) -> Vec<TableSchema> {
        let version = self.db.latest_version();
        {
            let cache = self.schema_cache.lock();
            if let Some((cached_version, schema)) = cache.as_ref() {
                if *cached_version == version {
                    return schema.clone();
                }
            }
        }
        let schema: Vec<TableSchema> = self
            .db
            .snapshot_at(version)
            .map(|snapshot| {
                snapshot
                    .state
                    .tables
                    .values()
                    .map(|t| t.schema.clone())
                    .collect()
            })
            .unwrap_or_default();
        *self.schema_cache.lock() = Some((version, schema.clone()));
        schema
    }

    fn invalidate_schema_cache(&self) {
        *self.schema_cache.lock() = None;
    }

    /// Block until the worker has processed everything up to the current
    /// latest version. Test and teardown helper.
    pub fn wait_for_worker_idle(&self) {
        let target = self.db.latest_version();
        loop {
            let behind = {
                let inner = self.worker_state.inner.lock();
                inner.commit_available
            };
            let notifier_version = self
                .live_notifiers()
                .iter()
                .filter_map(|n| n.core().version().map(|v| v.version))
                .min();
            let caught_up = match notifier_version {
                Some(version) => version >= target,
                None => !behind,
            };
            if caught_up {
                return;
            }
            thread::yield_now();
        }
    }
}

impl Drop for DbCoordinator {
    fn drop(&mut self) {
        {
            let mut inner = self.worker_state.inner.lock();
            inner.shutdown = true;
            self.worker_state.cond.notify_all();
        }
        if let Some(handle) = self.worker_handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        // Only drop the registry entry if it still refers to this instance.
        COORDINATORS.remove_if(self.db.path(), |_, weak| weak.strong_count() == 0);
    }
}

/// Hooks a language binding installs on its thread's session.
pub trait BindingContext: Send {
    /// New notifications are ready to pull with `refresh`.
    fn changes_available(&mut self) {}
    fn did_change(&mut self) {}
    fn will_send_notifications(&mut self) {}
    fn did_send_notifications(&mut self) {}
}

/// One thread's handle onto a coordinated database: a read transaction kept
/// current through the coordinator, binding hooks, and the local history for
/// commits that should enter the sync log.
pub struct LocalDb {
    coordinator: Arc<DbCoordinator>,
    tr: Transaction,
    binding: Option<Box<dyn BindingContext>>,
    history: Option<Arc<ClientHistory>>,
    target_id: u64,
}

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

impl LocalDb {
    pub fn open(path: impl AsRef<Path>, parameters: Parameters) -> CoreResult<LocalDb> {
        let coordinator = DbCoordinator::get_coordinator(path, parameters);
        let tr = coordinator.db().start_read(None)?;
        Ok(LocalDb {
            coordinator,
            tr,
            binding: None,
            history: None,
            target_id: NEXT_TARGET_ID.fetch_add(1, AtomicOrdering::Relaxed),
        })
    }

    pub fn set_binding_context(&mut self, binding: Box<dyn BindingContext>) {
        self.binding = Some(binding);
    }

    pub fn attach_history(&mut self, history: Arc<ClientHistory>) {
        self.history = Some(history);
    }

    pub fn coordinator(&self) -> &Arc<DbCoordinator> {
        &self.coordinator
    }

    pub fn db(&self) -> &Database {
        self.coordinator.db()
    }

    pub fn tr(&self) -> &Transaction {
        &self.tr
    }

    pub fn tr_mut(&mut self) -> &mut Transaction {
        &mut self.tr
    }

    pub fn version(&self) -> VersionId {
        self.tr.get_version_of_current_transaction()
    }

    /// Pull pending notifications and advance to the ready version.
    pub fn refresh(&mut self) -> CoreResult<()> {
        if let Some(binding) = &mut self.binding {
            binding.will_send_notifications();
        }
        let before = self.tr.get_version_of_current_transaction();
        self.coordinator
            .advance_to_ready_for(&mut self.tr, Some(self.target_id))?;
        let after = self.tr.get_version_of_current_transaction();
        if let Some(binding) = &mut self.binding {
            if before != after {
                binding.did_change();
            }
            binding.did_send_notifications();
        }
        Ok(())
    }

    /// Begin a write transaction, delivering pending notifications first.
    pub fn begin_write(&mut self) -> CoreResult<()> {
        if let Some(binding) = &mut self.binding {
            binding.will_send_notifications();
        }
        self.coordinator
            .advance_to_ready_for(&mut self.tr, Some(self.target_id))?;
        self.tr.promote_to_write(None)?;
        if let Some(binding) = &mut self.binding {
            binding.did_send_notifications();
        }
        Ok(())
    }

    /// Commit the open write, appending it to the sync history when one is
    /// attached, and wake the worker.
    pub fn commit_write(&mut self) -> CoreResult<VersionId> {
        if let Some(history) = &self.history {
            let changeset = self.tr.pending_changeset()?;
            if !changeset.is_empty() {
                history.prepare_changeset(&mut self.tr, &changeset.encode())?;
            }
        }
        self.tr.commit_and_continue_as_read()
    }

    pub fn cancel_write(&mut self) -> CoreResult<()> {
        self.tr.rollback_and_continue_as_read(None)
    }

    pub fn register_notifier(&self, notifier: Arc<dyn Notifier>) {
        notifier.core().set_target(self.target_id);
        self.coordinator.register_notifier(&notifier);
    }
}
