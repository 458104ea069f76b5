// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Background change notification for queried results, lists and objects.
//!
//! A notifier is shared between one target thread and the coordinator's
//! worker. The worker advances a private snapshot, computes the diff and
//! parks it in the handover slot; the target thread packages accumulated
//! changes per callback, advances the user's read transaction and fires the
//! before/after hooks. The callback registry tolerates removal while a
//! delivery is in progress: the iteration re-finds its position by token
//! after every user callback, so removing a neighbor never skips or repeats
//! anyone.

mod list_notifier;
mod object_notifier;
mod results_notifier;

pub use list_notifier::ListNotifier;
pub use object_notifier::ObjectNotifier;
pub use results_notifier::ResultsNotifier;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use sync_types::VersionId;

use crate::{
    collection_changes::CollectionChangeSet,
    deep_changes::KeyPathArray,
    error::CoreError,
    transact_log::TransactionChangeInfo,
    transaction::Transaction,
};

/// User hooks for one subscription.
pub trait ChangeCallback: Send {
    fn before(&mut self, _changes: &CollectionChangeSet) {}
    fn after(&mut self, _changes: &CollectionChangeSet) {}
    fn on_error(&mut self, _error: &CoreError) {}
}

/// Adapter turning a closure into an after-change callback.
pub struct CallbackFn<F>(pub F);

impl<F> ChangeCallback for CallbackFn<F>
where
    F: FnMut(&CollectionChangeSet) + Send,
{
    fn after(&mut self, changes: &CollectionChangeSet) {
        (self.0)(changes)
    }
}

struct NoopCallback;
impl ChangeCallback for NoopCallback {}

/// Token identifying one registered callback; pass to `remove_callback`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotificationToken(pub u64);

struct CallbackEntry {
    callback: Box<dyn ChangeCallback>,
    /// Pending changes accumulated on the worker thread; guarded by the
    /// collection mutex, written by the worker, read by the target.
    accumulated_changes: CollectionChangeSet,
    /// The changes actually passed to the hooks; target-thread only.
    changes_to_deliver: CollectionChangeSet,
    key_path_array: KeyPathArray,
    token: u64,
    initial_delivered: bool,
    /// Set within a write transaction on the target thread when this
    /// callback should not fire for that write.
    skip_next: bool,
}

#[derive(Default)]
struct CallbackCollection {
    entries: Vec<CallbackEntry>,
    next_token: u64,
    /// Iteration cursor; `remove_callback` adjusts it so removal during
    /// iteration does not skip an unrelated callback.
    callback_index: usize,
    /// Number of callbacks present when delivery was packaged; callbacks
    /// registered mid-delivery wait for the next round.
    callback_count: usize,
}

const NO_ITERATION: usize = usize::MAX;

/// The machinery shared by all notifier flavors.
pub struct NotifierCore {
    callbacks: Mutex<CallbackCollection>,
    have_callbacks: AtomicBool,
    has_run: AtomicBool,
    error: Mutex<Option<CoreError>>,
    /// Version the latest handover was packaged at.
    version: Mutex<Option<VersionId>>,
    /// Identity of the target session owning the callbacks; zero until
    /// registered. Deliveries are filtered by this so one session's refresh
    /// never runs another session's callbacks on the wrong thread.
    target: AtomicU64,
}

impl Default for NotifierCore {
    fn default() -> Self {
        NotifierCore {
            callbacks: Mutex::new(CallbackCollection {
                callback_index: NO_ITERATION,
                ..Default::default()
            }),
            have_callbacks: AtomicBool::new(false),
            has_run: AtomicBool::new(false),
            error: Mutex::new(None),
            version: Mutex::new(None),
            target: AtomicU64::new(0),
        }
    }
}

impl NotifierCore {
    pub fn add_callback(
        &self,
        callback: Box<dyn ChangeCallback>,
        key_path_array: KeyPathArray,
    ) -> NotificationToken {
        let mut lock = self.callbacks.lock();
        let token = lock.next_token;
        lock.next_token += 1;
        lock.entries.push(CallbackEntry {
            callback,
            accumulated_changes: CollectionChangeSet::default(),
            changes_to_deliver: CollectionChangeSet::default(),
            key_path_array,
            token,
            initial_delivered: false,
            skip_next: false,
        });
        self.have_callbacks.store(true, Ordering::Release);
        NotificationToken(token)
    }

    /// Remove a callback from any thread. The token is dead afterwards.
    pub fn remove_callback(&self, token: NotificationToken) {
        let mut lock = self.callbacks.lock();
        let Some(pos) = lock.entries.iter().position(|e| e.token == token.0) else {
            return;
        };
        lock.entries.remove(pos);
        if lock.callback_index != NO_ITERATION && pos <= lock.callback_index {
            lock.callback_index = lock.callback_index.saturating_sub(1);
        }
        if pos < lock.callback_count {
            lock.callback_count -= 1;
        }
        if lock.entries.is_empty() {
            self.have_callbacks.store(false, Ordering::Release);
        }
    }

    pub fn suppress_next_notification(&self, token: NotificationToken) {
        let mut lock = self.callbacks.lock();
        if let Some(entry) = lock.entries.iter_mut().find(|e| e.token == token.0) {
            entry.skip_next = true;
        }
    }

    pub fn have_callbacks(&self) -> bool {
        self.have_callbacks.load(Ordering::Acquire)
    }

    pub fn target(&self) -> u64 {
        self.target.load(Ordering::Acquire)
    }

    pub fn set_target(&self, target: u64) {
        self.target.store(target, Ordering::Release);
    }

    pub fn has_run(&self) -> bool {
        self.has_run.load(Ordering::Acquire)
    }

    pub(crate) fn set_has_run(&self) {
        self.has_run.store(true, Ordering::Release);
    }

    pub(crate) fn key_path_arrays(&self) -> Vec<KeyPathArray> {
        self.callbacks
            .lock()
            .entries
            .iter()
            .map(|e| e.key_path_array.clone())
            .collect()
    }

    pub(crate) fn version(&self) -> Option<VersionId> {
        *self.version.lock()
    }

    pub(crate) fn set_version(&self, version: VersionId) {
        *self.version.lock() = Some(version);
    }

    /// Fold the freshly computed diff into every callback's accumulated
    /// changes. Called even for empty diffs: that is what consumes the
    /// skip-next flags.
    pub(crate) fn add_changes(&self, changes: CollectionChangeSet) {
        let mut lock = self.callbacks.lock();
        for entry in &mut lock.entries {
            if entry.skip_next {
                entry.skip_next = false;
            } else {
                entry.accumulated_changes.merge(changes.clone());
            }
        }
    }

    /// Move accumulated changes into the delivery slots. Returns whether any
    /// callback has something to receive.
    pub fn package_for_delivery(&self) -> bool {
        if self.error.lock().is_some() {
            return true;
        }
        let mut lock = self.callbacks.lock();
        lock.callback_count = lock.entries.len();
        let mut any = false;
        for entry in &mut lock.entries {
            let accumulated = std::mem::take(&mut entry.accumulated_changes);
            entry.changes_to_deliver.merge(accumulated);
            any |= !entry.changes_to_deliver.is_empty() || !entry.initial_delivered;
        }
        any
    }

    pub fn before_advance(&self) {
        self.for_each_packaged_callback(false);
    }

    pub fn after_advance(&self) {
        self.for_each_packaged_callback(true);
    }

    fn for_each_packaged_callback(&self, after: bool) {
        let mut lock = self.callbacks.lock();
        let mut index = 0;
        while index < lock.callback_count.min(lock.entries.len()) {
            let entry = &mut lock.entries[index];
            let changes = entry.changes_to_deliver.clone();
            let wants_delivery = if after {
                !entry.initial_delivered || !changes.is_empty()
            } else {
                entry.initial_delivered && !changes.is_empty()
            };
            if !wants_delivery {
                index += 1;
                continue;
            }
            let token = entry.token;
            // Park a placeholder so the entry can be removed while the user
            // code runs without the lock.
            let mut callback = std::mem::replace(&mut entry.callback, Box::new(NoopCallback));
            lock.callback_index = index;
            drop(lock);

            if after {
                callback.after(&changes);
            } else {
                callback.before(&changes);
            }

            lock = self.callbacks.lock();
            match lock.entries.iter().position(|e| e.token == token) {
                Some(pos) => {
                    let entry = &mut lock.entries[pos];
                    entry.callback = callback;
                    if after {
                        entry.initial_delivered = true;
                        entry.changes_to_deliver = CollectionChangeSet::default();
                    }
                    index = pos + 1;
                }
                None => {
                    // The running callback removed itself; the next entry
                    // has shifted into this slot.
                    index = lock.callback_index.min(index);
                }
            }
        }
        lock.callback_index = NO_ITERATION;
    }

    /// Propagate an error to every callback's error hook, then clear the
    /// registry; the notifier is a zombie afterwards.
    pub fn deliver_error(&self, error: CoreError) {
        let entries = {
            let mut lock = self.callbacks.lock();
            *self.error.lock() = Some(error.clone());
            std::mem::take(&mut lock.entries)
        };
        self.have_callbacks.store(false, Ordering::Release);
        for mut entry in entries {
            entry.callback.on_error(&error);
        }
    }

    pub fn error(&self) -> Option<CoreError> {
        self.error.lock().clone()
    }
}

/// One registered notifier, driven by the coordinator.
pub trait Notifier: Send + Sync {
    fn core(&self) -> &NotifierCore;

    /// Worker-side: declare the tables and lists the next run needs tracked.
    fn add_required_change_info(&self, info: &mut TransactionChangeInfo);

    /// Worker-side: compute the diff at the worker transaction's version.
    fn run(&self, tr: &Transaction, info: &TransactionChangeInfo);

    /// Worker-side: park the computed view for the target thread and fold
    /// the diff into the callbacks.
    fn prepare_handover(&self, tr: &Transaction);

    /// Target-side: install the handed-over view for the user-facing
    /// collection.
    fn deliver(&self, _tr: &Transaction) {}

    /// Worker-side: drop snapshot-bound state when the file closes.
    fn release_data(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    };

    struct CountingCallback {
        calls: Arc<AtomicUsize>,
    }

    impl ChangeCallback for CountingCallback {
        fn after(&mut self, _changes: &CollectionChangeSet) {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    fn change_with_insertion() -> CollectionChangeSet {
        let mut change = CollectionChangeSet::default();
        change.insert(0);
        change
    }

    #[test]
    fn initial_delivery_fires_even_with_empty_changes() {
        let core = NotifierCore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        core.add_callback(
            Box::new(CountingCallback { calls: calls.clone() }),
            Vec::new(),
        );
        assert!(core.package_for_delivery());
        core.before_advance();
        core.after_advance();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        // Nothing new: no further delivery.
        assert!(!core.package_for_delivery());
        core.after_advance();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn skip_next_suppresses_one_window() {
        let core = NotifierCore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let token = core.add_callback(
            Box::new(CountingCallback { calls: calls.clone() }),
            Vec::new(),
        );
        // Consume the initial notification.
        core.package_for_delivery();
        core.after_advance();

        core.suppress_next_notification(token);
        core.add_changes(change_with_insertion());
        assert!(!core.package_for_delivery());

        // The next window is delivered again.
        core.add_changes(change_with_insertion());
        assert!(core.package_for_delivery());
        core.after_advance();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn removal_during_delivery_spares_the_others() {
        // c1's callback removes c2 while executing; c3 must still fire
        // exactly once and c2 never again.
        struct RemovingCallback {
            core: Arc<NotifierCore>,
            target: Mutex<Option<NotificationToken>>,
            calls: Arc<AtomicUsize>,
        }
        impl ChangeCallback for RemovingCallback {
            fn after(&mut self, _changes: &CollectionChangeSet) {
                self.calls.fetch_add(1, AtomicOrdering::SeqCst);
                if let Some(token) = self.target.lock().take() {
                    self.core.remove_callback(token);
                }
            }
        }

        let core = Arc::new(NotifierCore::default());
        let c1_calls = Arc::new(AtomicUsize::new(0));
        let c2_calls = Arc::new(AtomicUsize::new(0));
        let c3_calls = Arc::new(AtomicUsize::new(0));

        // Tokens are handed out sequentially, so c2's token is known ahead
        // of registration.
        let remover = RemovingCallback {
            core: core.clone(),
            target: Mutex::new(Some(NotificationToken(1))),
            calls: c1_calls.clone(),
        };
        let _t1 = core.add_callback(Box::new(remover), Vec::new());
        let t2 = core.add_callback(
            Box::new(CountingCallback { calls: c2_calls.clone() }),
            Vec::new(),
        );
        assert_eq!(t2, NotificationToken(1));
        let _t3 = core.add_callback(
            Box::new(CountingCallback { calls: c3_calls.clone() }),
            Vec::new(),
        );

        core.add_changes(change_with_insertion());
        core.package_for_delivery();
        core.after_advance();

        assert_eq!(c1_calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(c2_calls.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(c3_calls.load(AtomicOrdering::SeqCst), 1);

        // A later delivery still never reaches c2.
        core.add_changes(change_with_insertion());
        core.package_for_delivery();
        core.after_advance();
        assert_eq!(c2_calls.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(c3_calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn deliver_error_clears_the_registry() {
        struct ErrorCallback {
            errors: Arc<AtomicUsize>,
        }
        impl ChangeCallback for ErrorCallback {
            fn on_error(&mut self, _error: &CoreError) {
                self.errors.fetch_add(1, AtomicOrdering::SeqCst);
            }
        }
        let core = NotifierCore::default();
        let errors = Arc::new(AtomicUsize::new(0));
        core.add_callback(Box::new(ErrorCallback { errors: errors.clone() }), Vec::new());
        core.deliver_error(CoreError::UnsupportedSchemaChange);
        assert_eq!(errors.load(AtomicOrdering::SeqCst), 1);
        assert!(!core.have_callbacks());
        assert!(core.error().is_some());
    }
}
