// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core of an embedded object-store sync engine.
//!
//! The crate sits on top of a versioned, copy-on-write object store and
//! provides the machinery a sync client is built from: change-notification
//! pipeline (index sets, transaction-log observation, background notifiers,
//! the per-file coordinator), the transaction façade, the client replication
//! history with operational-transform integration, durable staging for
//! bootstraps, pending errors and subscription sets, and the wire codec for
//! the changeset replication protocol.

mod bootstrap_store;
mod changeset;
mod collection_changes;
mod coordinator;
mod deep_changes;
mod error;
mod history;
mod index_set;
mod metrics;
mod notifier;
mod object_changes;
mod pending_errors;
mod protocol;
mod query;
mod storage;
mod subscriptions;
mod sync_metadata;
mod thread_safe_reference;
mod transact_log;
mod transaction;

#[cfg(test)]
mod tests;

pub use bootstrap_store::{PendingBatch, PendingBatchStats, PendingBootstrapStore};
pub use changeset::{Changeset, Instruction, RemoteChangeset, Value};
pub use collection_changes::{CollectionChangeSet, Move};
pub use coordinator::{BindingContext, DbCoordinator, LocalDb};
pub use deep_changes::{
    find_related_tables, DeepChangeChecker, KeyPath, KeyPathArray, KeyPathElement, OutgoingLink,
    RelatedTable,
};
pub use error::{CoreError, CoreResult, IntegrationError, WireError};
pub use history::{
    ClientHistory, LocalChange, PassthroughTransformer, TransformHistory, Transformer,
    UploadChangesetRecord, CLIENT_HISTORY_SCHEMA_VERSION,
};
pub use index_set::IndexSet;
pub use metrics::Metrics;
pub use notifier::{
    CallbackFn, ChangeCallback, ListNotifier, NotificationToken, Notifier, NotifierCore,
    ObjectNotifier, ResultsNotifier,
};
pub use object_changes::ObjectChangeSet;
pub use pending_errors::PendingErrorStore;
pub use protocol::{
    flx_websocket_subprotocol, pbs_websocket_subprotocol, ClientMessage, ClientProtocol,
    CompensatingWriteErrorInfo, ProtocolError, ProtocolErrorInfo, ResumptionDelayInfo,
    ServerMessage, ServerProtocol, UploadChangeset, UploadMessageBuilder, PROTOCOL_VERSION,
};
pub use query::{DescriptorOrdering, Query};
pub use storage::{
    ColumnSchema, Database, GroupState, ObjectState, Snapshot, TableSchema, TableState,
};
pub use subscriptions::{
    MutableSubscriptionSet, Subscription, SubscriptionSet, SubscriptionSetState, SubscriptionStore,
};
pub use sync_metadata::{
    create_or_load_schema, schema_groups, schema_version_for, MetadataColumnSpec,
    MetadataTableSpec, ResolvedSchema, ResolvedTable,
};
pub use thread_safe_reference::{Imported, ThreadSafeReference};
pub use transact_log::{
    replay, replay_all, ChangeInfoCollector, ListChangeInfo, TransactLogObserver,
    TransactLogValidator, TransactionChangeInfo,
};
pub use transaction::{AsyncStage, Transaction, TransactionStage};
