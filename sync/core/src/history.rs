// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The client-side replication history.
//!
//! An append-only log of local and integrated-remote changesets kept inside
//! the user's database file, together with the upload/download cursors, the
//! server-assigned file identity and the byte-level progress counters. Local
//! entries are appended as part of the write transaction that produced them;
//! remote changesets are integrated through the operational transformer and
//! recorded with their original bytes, so a re-upload is never needed and the
//! server sees exactly what it sent.

use std::io::Read;

use itertools::Itertools as _;

use sync_types::{
    is_consistent_download, DownloadBatchState, DownloadableProgress, FileIdent, SaltedFileIdent,
    SyncProgress, Timestamp, UploadCursor, Version, VersionId,
};

use crate::{
    changeset::{Changeset, RemoteChangeset, Value},
    error::{CoreError, CoreResult, IntegrationError},
    protocol::ProtocolError,
    storage::Database,
    sync_metadata::{
        create_or_load_schema, schema_version_for, MetadataColumnSpec, MetadataTableSpec,
        ResolvedSchema,
    },
    transaction::{Transaction, TransactionStage},
};
use sync_types::ColumnType;

/// Schema version of the history compartment. Bump only with a migration.
pub const CLIENT_HISTORY_SCHEMA_VERSION: i64 = 12;

const HISTORY_GROUP: &str = "sync_client_history";
const HISTORY_TABLE: &str = "sync_history";
const PROGRESS_TABLE: &str = "sync_progress";

const COL_VERSION: &str = "version";
const COL_CHANGESET: &str = "changeset";
const COL_COMPRESSED: &str = "compressed";
const COL_RECIPROCAL: &str = "reciprocal_transform";
const COL_REMOTE_VERSION: &str = "remote_version";
const COL_ORIGIN_FILE_IDENT: &str = "origin_file_ident";
const COL_ORIGIN_TIMESTAMP: &str = "origin_timestamp";

const P_CLIENT_FILE_IDENT: &str = "client_file_ident";
const P_CLIENT_FILE_IDENT_SALT: &str = "client_file_ident_salt";
const P_LATEST_SERVER_VERSION: &str = "latest_server_version";
const P_LATEST_SERVER_VERSION_SALT: &str = "latest_server_version_salt";
const P_DOWNLOAD_SERVER_VERSION: &str = "download_server_version";
const P_DOWNLOAD_CLIENT_VERSION: &str = "download_client_version";
const P_UPLOAD_CLIENT_VERSION: &str = "upload_client_version";
const P_UPLOAD_SERVER_VERSION: &str = "upload_server_version";
const P_DOWNLOADED_BYTES: &str = "downloaded_bytes";
const P_DOWNLOADABLE_BYTES: &str = "downloadable_bytes";
const P_UPLOADED_BYTES: &str = "uploaded_bytes";
const P_UPLOADABLE_BYTES: &str = "uploadable_bytes";
const P_CURRENT_CLIENT_VERSION: &str = "current_client_version";

const INITIAL_VERSION: Version = 1;

/// One history entry of local origin that has not been uploaded yet.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalChange {
    pub version: Version,
    pub changeset: Vec<u8>,
}

/// One changeset selected for upload by `find_uploadable_changesets`.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadChangesetRecord {
    pub origin_timestamp: Timestamp,
    /// Zero for changesets of local origin.
    pub origin_file_ident: FileIdent,
    pub progress: UploadCursor,
    pub changeset: Vec<u8>,
}

/// History access handed to the operational transformer.
pub trait TransformHistory {
    /// Local history entries with `version > begin_version`, oldest first.
    fn local_changes_since(&self, begin_version: Version) -> CoreResult<Vec<LocalChange>>;
    fn get_reciprocal_transform(&self, version: Version) -> CoreResult<Option<Vec<u8>>>;
    fn set_reciprocal_transform(&mut self, version: Version, data: &[u8]) -> CoreResult<()>;
}

/// The merge algorithm. Only its inputs, outputs and failure modes matter to
/// the history; the algorithm itself is an external collaborator.
pub trait Transformer: Send + Sync {
    fn transform_remote_changeset(
        &self,
        history: &mut dyn TransformHistory,
        remote: &RemoteChangeset,
        parsed: Changeset,
    ) -> CoreResult<Changeset>;
}

/// Applies remote changesets as-is and leaves reciprocal transforms
/// untouched. Conflict-free by assumption; a real merge algorithm drops in
/// behind the same trait.
#[derive(Default)]
pub struct PassthroughTransformer;

impl Transformer for PassthroughTransformer {
    fn transform_remote_changeset(
        &self,
        _history: &mut dyn TransformHistory,
        _remote: &RemoteChangeset,
        parsed: Changeset,
    ) -> CoreResult<Changeset> {
        Ok(parsed)
    }
}

fn history_specs() -> Vec<MetadataTableSpec> {
    vec![
        MetadataTableSpec {
            name: HISTORY_TABLE,
            columns: vec![
                MetadataColumnSpec::new(COL_VERSION, ColumnType::Int),
                MetadataColumnSpec::nullable(COL_CHANGESET, ColumnType::Binary),
                MetadataColumnSpec::new(COL_COMPRESSED, ColumnType::Bool),
                MetadataColumnSpec::nullable(COL_RECIPROCAL, ColumnType::Binary),
                MetadataColumnSpec::new(COL_REMOTE_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(COL_ORIGIN_FILE_IDENT, ColumnType::Int),
                MetadataColumnSpec::new(COL_ORIGIN_TIMESTAMP, ColumnType::Int),
            ],
        },
        MetadataTableSpec {
            name: PROGRESS_TABLE,
            columns: vec![
                MetadataColumnSpec::new(P_CLIENT_FILE_IDENT, ColumnType::Int),
                MetadataColumnSpec::new(P_CLIENT_FILE_IDENT_SALT, ColumnType::Int),
                MetadataColumnSpec::new(P_LATEST_SERVER_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(P_LATEST_SERVER_VERSION_SALT, ColumnType::Int),
                MetadataColumnSpec::new(P_DOWNLOAD_SERVER_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(P_DOWNLOAD_CLIENT_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(P_UPLOAD_CLIENT_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(P_UPLOAD_SERVER_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(P_DOWNLOADED_BYTES, ColumnType::Int),
                MetadataColumnSpec::new(P_DOWNLOADABLE_BYTES, ColumnType::Int),
                MetadataColumnSpec::new(P_UPLOADED_BYTES, ColumnType::Int),
                MetadataColumnSpec::new(P_UPLOADABLE_BYTES, ColumnType::Int),
                MetadataColumnSpec::new(P_CURRENT_CLIENT_VERSION, ColumnType::Int),
            ],
        },
    ]
}

pub struct ClientHistory {
    db: Database,
    tables: ResolvedSchema,
    compression_threshold: usize,
    timestamp_source: Box<dyn Fn() -> Timestamp + Send + Sync>,
}

impl std::fmt::Debug for ClientHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHistory")
            .field("compression_threshold", &self.compression_threshold)
            .finish_non_exhaustive()
    }
}

impl ClientHistory {
    pub fn new(db: Database, parameters: &sync_config::Parameters) -> CoreResult<ClientHistory> {
        let mut tr = db.start_read(None)?;
        if let Some(found) = schema_version_for(&tr, HISTORY_GROUP)? {
            if found > CLIENT_HISTORY_SCHEMA_VERSION {
                return Err(CoreError::IncompatibleHistorySchema {
                    found,
                    supported: CLIENT_HISTORY_SCHEMA_VERSION,
                });
            }
            if found < CLIENT_HISTORY_SCHEMA_VERSION {
                // Older compartments would need a migration, and none is
                // implemented.
                return Err(CoreError::SchemaMismatch(format!(
                    "history schema version {found} predates the supported version \
                     {CLIENT_HISTORY_SCHEMA_VERSION} and no upgrade path is implemented"
                )));
            }
        }
        let tables = create_or_load_schema(
            &mut tr,
            HISTORY_GROUP,
            CLIENT_HISTORY_SCHEMA_VERSION,
            &history_specs(),
        )?;
        drop(tr);

        let history = ClientHistory {
            db,
            tables,
            compression_threshold: parameters.history_compression_threshold,
            timestamp_source: Box::new(default_timestamp_source),
        };
        history.ensure_progress_row()?;
        Ok(history)
    }

    /// Override the origin timestamp of new local changesets. Testing and
    /// log-replay tooling only.
    pub fn set_local_origin_timestamp_source(
        &mut self,
        source: impl Fn() -> Timestamp + Send + Sync + 'static,
    ) {
        self.timestamp_source = Box::new(source);
    }

    fn ensure_progress_row(&self) -> CoreResult<()> {
        let progress = &self.tables[PROGRESS_TABLE];
        {
            let tr = self.db.start_read(None)?;
            if !tr.table(progress.table)?.is_empty() {
                return Ok(());
            }
        }
        let mut tr = self.db.start_write()?;
        // Lost the race to another opener?
        if tr.table(progress.table)?.is_empty() {
            let obj = tr.create_object(progress.table)?;
            for field in [
                P_CLIENT_FILE_IDENT,
                P_CLIENT_FILE_IDENT_SALT,
                P_LATEST_SERVER_VERSION,
                P_LATEST_SERVER_VERSION_SALT,
                P_DOWNLOAD_SERVER_VERSION,
                P_DOWNLOAD_CLIENT_VERSION,
                P_UPLOAD_CLIENT_VERSION,
                P_UPLOAD_SERVER_VERSION,
                P_DOWNLOADED_BYTES,
                P_DOWNLOADABLE_BYTES,
                P_UPLOADED_BYTES,
                P_UPLOADABLE_BYTES,
            ] {
                tr.set_value(progress.table, obj, progress.col(field), Value::Int(0))?;
            }
            tr.set_value(
                progress.table,
                obj,
                progress.col(P_CURRENT_CLIENT_VERSION),
                Value::Int(INITIAL_VERSION as i64),
            )?;
            tr.commit()?;
        } else {
            tr.rollback()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Progress access

    fn read_progress_field(&self, tr: &Transaction, field: &str) -> CoreResult<i64> {
        let progress = &self.tables[PROGRESS_TABLE];
        let table = tr.table(progress.table)?;
        let obj = table
            .objects
            .values()
            .next()
            .ok_or(CoreError::InvalidatedObject)?;
        Ok(obj
            .value(progress.col(field))
            .and_then(Value::as_int)
            .unwrap_or(0))
    }

    fn write_progress_field(
        &self,
        tr: &mut Transaction,
        field: &str,
        value: i64,
    ) -> CoreResult<()> {
        let progress = &self.tables[PROGRESS_TABLE];
        let obj = tr
            .table(progress.table)?
            .object_keys()
            .next()
            .ok_or(CoreError::InvalidatedObject)?;
        tr.set_value(progress.table, obj, progress.col(field), Value::Int(value))
    }

    fn read_sync_progress(&self, tr: &Transaction) -> CoreResult<SyncProgress> {
        Ok(SyncProgress {
            latest_server_version: sync_types::SaltedVersion::new(
                self.read_progress_field(tr, P_LATEST_SERVER_VERSION)? as u64,
                self.read_progress_field(tr, P_LATEST_SERVER_VERSION_SALT)?,
            ),
            download: sync_types::DownloadCursor {
                server_version: self.read_progress_field(tr, P_DOWNLOAD_SERVER_VERSION)? as u64,
                last_integrated_client_version: self
                    .read_progress_field(tr, P_DOWNLOAD_CLIENT_VERSION)?
                    as u64,
            },
            upload: UploadCursor {
                client_version: self.read_progress_field(tr, P_UPLOAD_CLIENT_VERSION)? as u64,
                last_integrated_server_version: self
                    .read_progress_field(tr, P_UPLOAD_SERVER_VERSION)?
                    as u64,
            },
        })
    }

    /// Current client version, stored client file identity and sync progress.
    pub fn get_status(&self) -> CoreResult<(Version, SaltedFileIdent, SyncProgress)> {
        let tr = self.db.start_read(None)?;
        let version = self.read_progress_field(&tr, P_CURRENT_CLIENT_VERSION)? as Version;
        let ident = SaltedFileIdent::new(
            self.read_progress_field(&tr, P_CLIENT_FILE_IDENT)? as FileIdent,
            self.read_progress_field(&tr, P_CLIENT_FILE_IDENT_SALT)?,
        );
        let progress = self.read_sync_progress(&tr)?;
        Ok((version, ident, progress))
    }

    pub fn get_upload_download_state(&self) -> CoreResult<(u64, u64, u64, u64)> {
        let tr = self.db.start_read(None)?;
        Ok((
            self.read_progress_field(&tr, P_DOWNLOADED_BYTES)? as u64,
            self.read_progress_field(&tr, P_DOWNLOADABLE_BYTES)? as u64,
            self.read_progress_field(&tr, P_UPLOADED_BYTES)? as u64,
            self.read_progress_field(&tr, P_UPLOADABLE_BYTES)? as u64,
        ))
    }

    /// Store the server-assigned client file identity. One-shot per file.
    ///
    /// Object keys here are plain integers that never embed a file identity,
    /// so unlike histories with identity-derived object ids there are no
    /// placeholder ids to rewrite in the stored changesets.
    pub fn set_client_file_ident(&self, ident: SaltedFileIdent) -> CoreResult<()> {
        let mut tr = self.db.start_write()?;
        let current = self.read_progress_field(&tr, P_CLIENT_FILE_IDENT)? as FileIdent;
        if current != 0 {
            tr.rollback()?;
            return Err(CoreError::InvalidTransaction(
                "client file ident may only be assigned once",
            ));
        }
        self.write_progress_field(&mut tr, P_CLIENT_FILE_IDENT, ident.ident as i64)?;
        self.write_progress_field(&mut tr, P_CLIENT_FILE_IDENT_SALT, ident.salt)?;
        tr.commit()?;
        tracing::debug!(ident = ident.ident, "assigned client file ident");
        Ok(())
    }

    /// Persist progress reported by the server outside of integration.
    pub fn set_sync_progress(
        &self,
        progress: &SyncProgress,
        downloadable_bytes: Option<DownloadableProgress>,
    ) -> CoreResult<VersionId> {
        let mut tr = self.db.start_write()?;
        self.do_update_sync_progress(&mut tr, progress, downloadable_bytes)?;
        tr.commit()
    }

    fn do_update_sync_progress(
        &self,
        tr: &mut Transaction,
        progress: &SyncProgress,
        downloadable_bytes: Option<DownloadableProgress>,
    ) -> CoreResult<()> {
        if !is_consistent_download(progress.download) {
            return Err(IntegrationError::with_error_for_server(
                "inconsistent download cursor",
                ProtocolError::BadServerVersion,
            )
            .into());
        }
        let stored_latest = self.read_progress_field(tr, P_LATEST_SERVER_VERSION)? as u64;
        if progress.latest_server_version.version < stored_latest {
            return Err(IntegrationError::with_error_for_server(
                "server version regressed",
                ProtocolError::BadServerVersion,
            )
            .into());
        }
        self.write_progress_field(
            tr,
            P_LATEST_SERVER_VERSION,
            progress.latest_server_version.version as i64,
        )?;
        self.write_progress_field(
            tr,
            P_LATEST_SERVER_VERSION_SALT,
            progress.latest_server_version.salt,
        )?;
        self.write_progress_field(
            tr,
            P_DOWNLOAD_SERVER_VERSION,
            progress.download.server_version as i64,
        )?;
        self.write_progress_field(
            tr,
            P_DOWNLOAD_CLIENT_VERSION,
            progress.download.last_integrated_client_version as i64,
        )?;
        self.write_progress_field(
            tr,
            P_UPLOAD_CLIENT_VERSION,
            progress.upload.client_version as i64,
        )?;
        self.write_progress_field(
            tr,
            P_UPLOAD_SERVER_VERSION,
            progress.upload.last_integrated_server_version as i64,
        )?;
        if let Some(downloadable) = downloadable_bytes {
            self.write_progress_field(
                tr,
                P_DOWNLOADABLE_BYTES,
                downloadable.downloadable_bytes as i64,
            )?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Appending

    /// Append a local changeset produced by the caller's write transaction.
    /// Returns the client version the changeset produced.
    pub fn prepare_changeset(&self, tr: &mut Transaction, changeset: &[u8]) -> CoreResult<Version> {
        if tr.stage() != TransactionStage::Writing {
            return Err(CoreError::InvalidTransaction(
                "prepare_changeset requires a write transaction",
            ));
        }
        let version_before = self.read_progress_field(tr, P_CURRENT_CLIENT_VERSION)? as Version;
        let version_after = version_before + 1;
        let download_server_version =
            self.read_progress_field(tr, P_DOWNLOAD_SERVER_VERSION)? as Version;
        let origin_timestamp = (self.timestamp_source)();
        self.append_entry(
            tr,
            version_after,
            changeset,
            download_server_version,
            0,
            origin_timestamp,
        )?;
        self.write_progress_field(tr, P_CURRENT_CLIENT_VERSION, version_after as i64)?;
        let uploadable = self.read_progress_field(tr, P_UPLOADABLE_BYTES)?;
        self.write_progress_field(tr, P_UPLOADABLE_BYTES, uploadable + changeset.len() as i64)?;
        Ok(version_after)
    }

    fn append_entry(
        &self,
        tr: &mut Transaction,
        version: Version,
        changeset: &[u8],
        remote_version: Version,
        origin_file_ident: FileIdent,
        origin_timestamp: Timestamp,
    ) -> CoreResult<()> {
        let history = &self.tables[HISTORY_TABLE];
        let (stored, compressed) = compress_entry(changeset, self.compression_threshold);
        let obj = tr.create_object(history.table)?;
        tr.set_value(
            history.table,
            obj,
            history.col(COL_VERSION),
            Value::Int(version as i64),
        )?;
        tr.set_value(
            history.table,
            obj,
            history.col(COL_CHANGESET),
            Value::Binary(stored),
        )?;
        tr.set_value(
            history.table,
            obj,
            history.col(COL_COMPRESSED),
            Value::Bool(compressed),
        )?;
        tr.set_value(
            history.table,
            obj,
            history.col(COL_REMOTE_VERSION),
            Value::Int(remote_version as i64),
        )?;
        tr.set_value(
            history.table,
            obj,
            history.col(COL_ORIGIN_FILE_IDENT),
            Value::Int(origin_file_ident as i64),
        )?;
        tr.set_value(
            history.table,
            obj,
            history.col(COL_ORIGIN_TIMESTAMP),
            Value::Int(origin_timestamp as i64),
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Reading entries

    fn entry_rows(&self, tr: &Transaction) -> CoreResult<Vec<(Version, sync_types::ObjKey)>> {
        let history = &self.tables[HISTORY_TABLE];
        let table = tr.table(history.table)?;
        Ok(table
            .objects
            .iter()
            .map(|(key, obj)| {
                let version = obj
                    .value(history.col(COL_VERSION))
                    .and_then(Value::as_int)
                    .unwrap_or(0) as Version;
                (version, *key)
            })
            .sorted_unstable()
            .collect())
    }

    fn entry_changeset(&self, tr: &Transaction, obj: sync_types::ObjKey) -> CoreResult<Vec<u8>> {
        let history = &self.tables[HISTORY_TABLE];
        let row = tr.object(history.table, obj)?;
        let data = row
            .value(history.col(COL_CHANGESET))
            .and_then(Value::as_binary)
            .unwrap_or(&[]);
        let compressed = row
            .value(history.col(COL_COMPRESSED))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if compressed {
            decompress_entry(data)
        } else {
            Ok(data.to_vec())
        }
    }

    /// Non-uploaded local changes, for diagnostics.
    pub fn get_local_changes(&self, current_version: Version) -> CoreResult<Vec<LocalChange>> {
        let tr = self.db.start_read(None)?;
        let history = &self.tables[HISTORY_TABLE];
        let uploaded_upto = self.read_progress_field(&tr, P_UPLOAD_CLIENT_VERSION)? as Version;
        let mut out = Vec::new();
        for (version, obj) in self.entry_rows(&tr)? {
            if version <= uploaded_upto || version > current_version {
                continue;
            }
            let row = tr.object(history.table, obj)?;
            let origin = row
                .value(history.col(COL_ORIGIN_FILE_IDENT))
                .and_then(Value::as_int)
                .unwrap_or(0);
            if origin != 0 {
                continue;
            }
            let changeset = self.entry_changeset(&tr, obj)?;
            if changeset.is_empty() {
                continue;
            }
            out.push(LocalChange { version, changeset });
        }
        Ok(out)
    }

    /// Scan forward from `upload_progress` for local-origin changesets to
    /// upload, limited by `byte_budget` but never empty when anything is
    /// eligible. `upload_progress` is advanced to where the next scan should
    /// resume; `locked_server_version` receives the version the server must
    /// retain.
    pub fn find_uploadable_changesets(
        &self,
        upload_progress: &mut UploadCursor,
        end_version: Version,
        byte_budget: u64,
        out: &mut Vec<UploadChangesetRecord>,
        locked_server_version: &mut Version,
    ) -> CoreResult<()> {
        let tr = self.db.start_read(None)?;
        let history = &self.tables[HISTORY_TABLE];
        *locked_server_version = self.read_progress_field(&tr, P_DOWNLOAD_SERVER_VERSION)? as Version;

        let mut accumulated = 0u64;
        let mut scanned_upto = upload_progress.client_version;
        for (version, obj) in self.entry_rows(&tr)? {
            if version <= upload_progress.client_version || version > end_version {
                continue;
            }
            if accumulated > 0 && accumulated >= byte_budget {
                break;
            }
            scanned_upto = version;
            let row = tr.object(history.table, obj)?;
            let origin_file_ident = row
                .value(history.col(COL_ORIGIN_FILE_IDENT))
                .and_then(Value::as_int)
                .unwrap_or(0) as FileIdent;
            let remote_version = row
                .value(history.col(COL_REMOTE_VERSION))
                .and_then(Value::as_int)
                .unwrap_or(0) as Version;
            let origin_timestamp = row
                .value(history.col(COL_ORIGIN_TIMESTAMP))
                .and_then(Value::as_int)
                .unwrap_or(0) as Timestamp;
            if origin_file_ident != 0 {
                // Integrated from the server; never uploaded back.
                continue;
            }
            let changeset = self.entry_changeset(&tr, obj)?;
            if changeset.is_empty() {
                continue;
            }
            accumulated += changeset.len() as u64;
            out.push(UploadChangesetRecord {
                origin_timestamp,
                origin_file_ident,
                progress: UploadCursor {
                    client_version: version,
                    last_integrated_server_version: remote_version,
                },
                changeset,
            });
        }
        upload_progress.client_version = scanned_upto.max(upload_progress.client_version);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Integration

    /// Integrate a batch of remote changesets inside `tr`, which must be a
    /// write transaction. On `LastInBatch` the transaction is committed and
    /// continued as read; otherwise it is left open for the next batch.
    #[allow(clippy::too_many_arguments)]
    pub fn integrate_server_changesets(
        &self,
        progress: &SyncProgress,
        downloadable_bytes: Option<DownloadableProgress>,
        changesets: &[RemoteChangeset],
        batch_state: DownloadBatchState,
        transformer: &dyn Transformer,
        tr: &mut Transaction,
        mut run_in_write_tr: Option<&mut dyn FnMut(&Transaction, &[Changeset])>,
    ) -> CoreResult<VersionId> {
        if tr.stage() != TransactionStage::Writing {
            return Err(CoreError::InvalidTransaction(
                "integration requires a write transaction",
            ));
        }
        let client_file_ident = self.read_progress_field(tr, P_CLIENT_FILE_IDENT)? as FileIdent;

        // Validate before mutating anything, so a rejected batch leaves the
        // caller's transaction exactly as it was.
        for changeset in changesets {
            if changeset.origin_file_ident == client_file_ident && client_file_ident != 0 {
                return Err(IntegrationError::with_error_for_server(
                    format!(
                        "changeset origin file ident {} equals this client's file ident",
                        changeset.origin_file_ident
                    ),
                    ProtocolError::BadOriginFileIdent,
                )
                .into());
            }
        }
        let mut parsed_changesets = Vec::with_capacity(changesets.len());
        for changeset in changesets {
            parsed_changesets.push(changeset.parse().map_err(|e| {
                IntegrationError::with_error_for_server(
                    format!("remote changeset failed to parse: {e}"),
                    ProtocolError::BadChangeset,
                )
            })?);
        }

        let mut transformed = Vec::with_capacity(changesets.len());
        {
            let mut view = HistoryView {
                history: self,
                tr: &mut *tr,
            };
            for (changeset, parsed) in changesets.iter().zip(parsed_changesets) {
                let result = transformer.transform_remote_changeset(&mut view, changeset, parsed)?;
                transformed.push(result);
            }
        }

        let mut downloaded_bytes = 0u64;
        for (changeset, applied) in changesets.iter().zip(&transformed) {
            tr.apply_changeset(applied).map_err(|e| {
                IntegrationError::with_error_for_server(
                    format!("remote changeset failed to apply: {e}"),
                    ProtocolError::BadChangeset,
                )
            })?;
            // The history records the original remote bytes, not the
            // transformed form.
            let version_before = self.read_progress_field(tr, P_CURRENT_CLIENT_VERSION)? as Version;
            let version_after = version_before + 1;
            self.append_entry(
                tr,
                version_after,
                &changeset.data,
                changeset.remote_version,
                changeset.origin_file_ident,
                changeset.origin_timestamp,
            )?;
            self.write_progress_field(tr, P_CURRENT_CLIENT_VERSION, version_after as i64)?;
            downloaded_bytes += changeset.original_changeset_size;
        }

        if let Some(run) = run_in_write_tr.as_deref_mut() {
            run(tr, &transformed);
        }

        self.do_update_sync_progress(tr, progress, downloadable_bytes)?;
        let total_downloaded = self.read_progress_field(tr, P_DOWNLOADED_BYTES)?;
        self.write_progress_field(
            tr,
            P_DOWNLOADED_BYTES,
            total_downloaded + downloaded_bytes as i64,
        )?;

        tracing::debug!(
            count = changesets.len(),
            last_in_batch = batch_state == DownloadBatchState::LastInBatch,
            "integrated remote changesets"
        );

        match batch_state {
            DownloadBatchState::LastInBatch => {
                let version = tr.commit_and_continue_as_read()?;
                self.trim_sync_history()?;
                Ok(version)
            }
            DownloadBatchState::MoreToCome => Ok(tr.get_version_of_current_transaction()),
        }
    }

    /// Drop upload-skippable entries the server no longer needs.
    pub fn trim_sync_history(&self) -> CoreResult<()> {
        let mut tr = self.db.start_write()?;
        let history = &self.tables[HISTORY_TABLE];
        let download_client_version =
            self.read_progress_field(&tr, P_DOWNLOAD_CLIENT_VERSION)? as Version;
        let upload_client_version =
            self.read_progress_field(&tr, P_UPLOAD_CLIENT_VERSION)? as Version;

        let mut removed = 0usize;
        for (version, obj) in self.entry_rows(&tr)? {
            if version > download_client_version {
                break;
            }
            let row = tr.object(history.table, obj)?;
            let origin = row
                .value(history.col(COL_ORIGIN_FILE_IDENT))
                .and_then(Value::as_int)
                .unwrap_or(0);
            let empty = row
                .value(history.col(COL_CHANGESET))
                .and_then(Value::as_binary)
                .map(<[u8]>::is_empty)
                .unwrap_or(true);
            let upload_skippable = origin != 0 || empty || version <= upload_client_version;
            if upload_skippable {
                tr.erase_object(history.table, obj)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::trace!(removed, "trimmed sync history");
            tr.commit()?;
        } else {
            tr.rollback()?;
        }
        Ok(())
    }

    /// Compress any large stored entries that predate compression.
    pub fn compress_stored_changesets(&self) -> CoreResult<()> {
        let mut tr = self.db.start_write()?;
        let history = &self.tables[HISTORY_TABLE];
        let mut changed = false;
        for (_, obj) in self.entry_rows(&tr)? {
            let row = tr.object(history.table, obj)?;
            let compressed = row
                .value(history.col(COL_COMPRESSED))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let Some(data) = row.value(history.col(COL_CHANGESET)).and_then(Value::as_binary)
            else {
                continue;
            };
            if compressed || data.len() < self.compression_threshold {
                continue;
            }
            let data = data.to_vec();
            let (stored, is_compressed) = compress_entry(&data, self.compression_threshold);
            if is_compressed {
                tr.set_value(
                    history.table,
                    obj,
                    history.col(COL_CHANGESET),
                    Value::Binary(stored),
                )?;
                tr.set_value(
                    history.table,
                    obj,
                    history.col(COL_COMPRESSED),
                    Value::Bool(true),
                )?;
                changed = true;
            }
        }
        if changed {
            tr.commit()?;
        } else {
            tr.rollback()?;
        }
        Ok(())
    }

    pub fn sync_history_size(&self) -> CoreResult<usize> {
        let tr = self.db.start_read(None)?;
        Ok(tr.table(self.tables[HISTORY_TABLE].table)?.len())
    }

    /// Mark entries up to `version` as uploaded and account the bytes.
    pub fn record_upload_progress(
        &self,
        upload: UploadCursor,
        uploaded_bytes: u64,
    ) -> CoreResult<()> {
        let mut tr = self.db.start_write()?;
        self.write_progress_field(&mut tr, P_UPLOAD_CLIENT_VERSION, upload.client_version as i64)?;
        self.write_progress_field(
            &mut tr,
            P_UPLOAD_SERVER_VERSION,
            upload.last_integrated_server_version as i64,
        )?;
        let uploaded = self.read_progress_field(&tr, P_UPLOADED_BYTES)?;
        self.write_progress_field(&mut tr, P_UPLOADED_BYTES, uploaded + uploaded_bytes as i64)?;
        tr.commit()?;
        Ok(())
    }
}

/// Transformer-facing view over the history inside one write transaction.
struct HistoryView<'a, 'b> {
    history: &'a ClientHistory,
    tr: &'b mut Transaction,
}

impl TransformHistory for HistoryView<'_, '_> {
    fn local_changes_since(&self, begin_version: Version) -> CoreResult<Vec<LocalChange>> {
        let history = &self.history.tables[HISTORY_TABLE];
        let mut out = Vec::new();
        for (version, obj) in self.history.entry_rows(self.tr)? {
            if version <= begin_version {
                continue;
            }
            let row = self.tr.object(history.table, obj)?;
            let origin = row
                .value(history.col(COL_ORIGIN_FILE_IDENT))
                .and_then(Value::as_int)
                .unwrap_or(0);
            if origin != 0 {
                continue;
            }
            out.push(LocalChange {
                version,
                changeset: self.history.entry_changeset(self.tr, obj)?,
            });
        }
        Ok(out)
    }

    fn get_reciprocal_transform(&self, version: Version) -> CoreResult<Option<Vec<u8>>> {
        let history = &self.history.tables[HISTORY_TABLE];
        for (v, obj) in self.history.entry_rows(self.tr)? {
            if v == version {
                let row = self.tr.object(history.table, obj)?;
                return Ok(row
                    .value(history.col(COL_RECIPROCAL))
                    .and_then(Value::as_binary)
                    .map(<[u8]>::to_vec));
            }
        }
        Ok(None)
    }

    fn set_reciprocal_transform(&mut self, version: Version, data: &[u8]) -> CoreResult<()> {
        let history = &self.history.tables[HISTORY_TABLE];
        let target = self
            .history
            .entry_rows(self.tr)?
            .into_iter()
            .find(|(v, _)| *v == version);
        if let Some((_, obj)) = target {
            self.tr.set_value(
                history.table,
                obj,
                history.col(COL_RECIPROCAL),
                Value::Binary(data.to_vec()),
            )?;
        }
        Ok(())
    }
}

fn default_timestamp_source() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

fn compress_entry(data: &[u8], threshold: usize) -> (Vec<u8>, bool) {
    if data.len() < threshold {
        return (data.to_vec(), false);
    }
    let compressed = crate::protocol::compress_body(data);
    if compressed.len() < data.len() {
        (compressed, true)
    } else {
        (data.to_vec(), false)
    }
}

fn decompress_entry(data: &[u8]) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| CoreError::Decompression(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sync_types::{DownloadCursor, SaltedVersion};

    use crate::changeset::Instruction;
    use sync_types::{ObjKey, TableKey};

    fn open(name: &str) -> (Database, ClientHistory) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.into_path().join(name));
        let history = ClientHistory::new(db.clone(), &sync_config::Parameters::default()).unwrap();
        (db, history)
    }

    fn data_changeset(table: i64, obj: i64) -> Changeset {
        Changeset::new(vec![Instruction::CreateObject {
            table: TableKey(table),
            obj: ObjKey(obj),
        }])
    }

    fn remote(version: Version, data: &Changeset, origin: FileIdent) -> RemoteChangeset {
        let encoded = data.encode();
        RemoteChangeset {
            remote_version: version,
            last_integrated_local_version: 0,
            original_changeset_size: encoded.len() as u64,
            data: Bytes::from(encoded),
            origin_timestamp: 100 + version,
            origin_file_ident: origin,
        }
    }

    fn progress_for(server_version: Version) -> SyncProgress {
        SyncProgress {
            latest_server_version: SaltedVersion::new(server_version, 1),
            download: DownloadCursor {
                server_version,
                last_integrated_client_version: 0,
            },
            upload: UploadCursor::default(),
        }
    }

    #[test]
    fn prepare_then_find_uploadable_round_trips_bytes() {
        let (db, history) = open("uploadable.db");
        let payload = data_changeset(9, 1).encode();

        let mut tr = db.start_write().unwrap();
        let version = history.prepare_changeset(&mut tr, &payload).unwrap();
        tr.commit().unwrap();
        assert_eq!(version, INITIAL_VERSION + 1);

        let mut cursor = UploadCursor {
            client_version: INITIAL_VERSION,
            last_integrated_server_version: 0,
        };
        let mut out = Vec::new();
        let mut locked = 0;
        history
            .find_uploadable_changesets(&mut cursor, version, 1 << 20, &mut out, &mut locked)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].changeset, payload);
        assert_eq!(out[0].origin_file_ident, 0);
        assert_eq!(out[0].progress.client_version, version);
        assert_eq!(cursor.client_version, version);
    }

    #[test]
    fn upload_scan_respects_budget_but_returns_at_least_one() {
        let (db, history) = open("budget.db");
        for i in 0..4 {
            let mut tr = db.start_write().unwrap();
            let payload = vec![i as u8; 512];
            history.prepare_changeset(&mut tr, &payload).unwrap();
            tr.commit().unwrap();
        }
        let mut cursor = UploadCursor {
            client_version: INITIAL_VERSION,
            last_integrated_server_version: 0,
        };
        let mut out = Vec::new();
        let mut locked = 0;
        history
            .find_uploadable_changesets(&mut cursor, Version::MAX, 1, &mut out, &mut locked)
            .unwrap();
        assert_eq!(out.len(), 1);

        out.clear();
        history
            .find_uploadable_changesets(&mut cursor, Version::MAX, 1024, &mut out, &mut locked)
            .unwrap();
        // 512 + 512 reaches the budget after the second entry.
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn integrate_records_original_bytes_and_updates_cursors() {
        let (db, history) = open("integrate.db");
        let mut setup = db.start_write().unwrap();
        setup.add_table("data").unwrap();
        setup.commit().unwrap();

        let cs = remote(1, &data_changeset(1, 7), 0);
        let mut tr = db.start_write().unwrap();
        let transformer = PassthroughTransformer;
        history
            .integrate_server_changesets(
                &progress_for(1),
                Some(10u64.into()),
                std::slice::from_ref(&cs),
                DownloadBatchState::LastInBatch,
                &transformer,
                &mut tr,
                None,
            )
            .unwrap();

        let (_, _, progress) = history.get_status().unwrap();
        assert_eq!(progress.download.server_version, 1);
        assert_eq!(progress.latest_server_version.version, 1);

        // The applied object is visible.
        let read = db.start_read(None).unwrap();
        assert!(read.object(TableKey(1), ObjKey(7)).is_ok());

        // Uploads must skip the remote-origin entry.
        let mut cursor = UploadCursor {
            client_version: INITIAL_VERSION,
            last_integrated_server_version: 0,
        };
        let mut out = Vec::new();
        let mut locked = 0;
        history
            .find_uploadable_changesets(&mut cursor, Version::MAX, 1 << 20, &mut out, &mut locked)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn integration_rejects_own_file_ident() {
        let (db, history) = open("self-loop.db");
        history
            .set_client_file_ident(SaltedFileIdent::new(42, 7))
            .unwrap();
        let mut setup = db.start_write().unwrap();
        setup.add_table("data").unwrap();
        setup.commit().unwrap();

        let size_before = history.sync_history_size().unwrap();
        let cs = remote(1, &data_changeset(1, 7), 42);
        let mut tr = db.start_write().unwrap();
        let err = history
            .integrate_server_changesets(
                &progress_for(1),
                None,
                std::slice::from_ref(&cs),
                DownloadBatchState::LastInBatch,
                &PassthroughTransformer,
                &mut tr,
                None,
            )
            .unwrap_err();
        let CoreError::Integration(err) = err else {
            panic!("expected an integration error, got {err:?}");
        };
        assert_eq!(err.error_for_server, ProtocolError::BadOriginFileIdent);
        // No history entry was appended and the transaction is still open
        // for the caller to roll back.
        assert_eq!(history.sync_history_size().unwrap(), size_before);
        assert_eq!(tr.stage(), TransactionStage::Writing);
        tr.rollback().unwrap();
    }

    #[test]
    fn client_file_ident_is_one_shot() {
        let (_db, history) = open("one-shot.db");
        history
            .set_client_file_ident(SaltedFileIdent::new(5, 1))
            .unwrap();
        assert!(history
            .set_client_file_ident(SaltedFileIdent::new(6, 1))
            .is_err());
        let (_, ident, _) = history.get_status().unwrap();
        assert_eq!(ident.ident, 5);
    }

    #[test]
    fn newer_history_schema_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.into_path().join("newer-history.db"));
        let mut tr = db.start_read(None).unwrap();
        crate::sync_metadata::create_or_load_schema(
            &mut tr,
            HISTORY_GROUP,
            CLIENT_HISTORY_SCHEMA_VERSION + 1,
            &history_specs(),
        )
        .unwrap();
        drop(tr);

        let err = ClientHistory::new(db, &sync_config::Parameters::default()).unwrap_err();
        assert!(matches!(
            err,
            CoreError::IncompatibleHistorySchema { found, supported }
                if found == CLIENT_HISTORY_SCHEMA_VERSION + 1
                    && supported == CLIENT_HISTORY_SCHEMA_VERSION
        ));
    }

    #[test]
    fn older_history_schema_refuses_without_an_upgrade_path() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.into_path().join("older-history.db"));
        let mut tr = db.start_read(None).unwrap();
        crate::sync_metadata::create_or_load_schema(
            &mut tr,
            HISTORY_GROUP,
            CLIENT_HISTORY_SCHEMA_VERSION - 1,
            &history_specs(),
        )
        .unwrap();
        drop(tr);

        let err = ClientHistory::new(db, &sync_config::Parameters::default()).unwrap_err();
        assert!(matches!(err, CoreError::SchemaMismatch(_)));
    }

    #[test]
    fn large_entries_are_stored_compressed() {
        let (db, history) = open("compressed.db");
        let payload = vec![0x5A; 8 * 1024];
        let mut tr = db.start_write().unwrap();
        let version = history.prepare_changeset(&mut tr, &payload).unwrap();
        tr.commit().unwrap();

        let mut cursor = UploadCursor {
            client_version: INITIAL_VERSION,
            last_integrated_server_version: 0,
        };
        let mut out = Vec::new();
        let mut locked = 0;
        history
            .find_uploadable_changesets(&mut cursor, version, 1 << 20, &mut out, &mut locked)
            .unwrap();
        assert_eq!(out[0].changeset, payload);

        // The stored form is smaller than the original.
        let tr = db.start_read(None).unwrap();
        let table = tr.table(history.tables[HISTORY_TABLE].table).unwrap();
        let stored = table
            .objects
            .values()
            .find_map(|o| {
                o.value(history.tables[HISTORY_TABLE].col(COL_CHANGESET))
                    .and_then(Value::as_binary)
            })
            .unwrap();
        assert!(stored.len() < payload.len());
    }

    #[test]
    fn trimming_drops_uploaded_and_remote_entries() {
        let (db, history) = open("trim.db");
        let mut setup = db.start_write().unwrap();
        setup.add_table("data").unwrap();
        setup.commit().unwrap();

        // A local entry and a remote entry.
        let mut tr = db.start_write().unwrap();
        let local_version = history
            .prepare_changeset(&mut tr, &data_changeset(1, 1).encode())
            .unwrap();
        tr.commit().unwrap();

        let cs = remote(1, &data_changeset(1, 2), 0);
        let mut tr = db.start_write().unwrap();
        history
            .integrate_server_changesets(
                &SyncProgress {
                    latest_server_version: SaltedVersion::new(1, 1),
                    download: DownloadCursor {
                        server_version: 1,
                        last_integrated_client_version: local_version,
                    },
                    upload: UploadCursor {
                        client_version: local_version,
                        last_integrated_server_version: 1,
                    },
                },
                None,
                std::slice::from_ref(&cs),
                DownloadBatchState::LastInBatch,
                &PassthroughTransformer,
                &mut tr,
                None,
            )
            .unwrap();
        history
            .record_upload_progress(
                UploadCursor {
                    client_version: local_version,
                    last_integrated_server_version: 1,
                },
                0,
            )
            .unwrap();
        history.trim_sync_history().unwrap();
        // Both entries are now at or below the download cursor's
        // last-integrated client version or upload-skippable.
        assert_eq!(history.sync_history_size().unwrap(), 1);
    }
}
