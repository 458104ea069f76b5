// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable staging for in-progress query-version bootstraps.
//!
//! A bootstrap arrives as several DOWNLOAD messages that must all be applied
//! before the new query version becomes visible. Each batch is compressed and
//! stored inside the user's database file, so a process restart resumes the
//! bootstrap instead of re-downloading it. Because the batch rows live in the
//! same MVCC file as user data, popping the final batch and integrating it in
//! one transaction leaves no third state for a crash to expose.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use sync_types::{
    DownloadCursor, DownloadableProgress, FileIdent, SaltedVersion, SyncProgress, Timestamp,
    UploadCursor, Version,
};

use crate::{
    changeset::{RemoteChangeset, Value},
    error::{CoreError, CoreResult},
    storage::Database,
    sync_metadata::{
        create_or_load_schema, schema_groups, MetadataColumnSpec, MetadataTableSpec, ResolvedSchema,
    },
    transaction::{Transaction, TransactionStage},
};
use sync_types::{ColumnType, ObjKey};

const SCHEMA_VERSION: i64 = 1;

const BOOTSTRAP_TABLE: &str = "flx_pending_bootstrap";
const CHANGESETS_TABLE: &str = "flx_pending_bootstrap_changesets";
const PROGRESS_TABLE: &str = "flx_pending_bootstrap_progress";

const COL_QUERY_VERSION: &str = "query_version";
const COL_CHANGESETS: &str = "changesets";
const COL_PROGRESS: &str = "progress";
const COL_DOWNLOADABLE_BYTES: &str = "downloadable_bytes";

const COL_REMOTE_VERSION: &str = "remote_version";
const COL_LAST_INTEGRATED_CLIENT_VERSION: &str = "last_integrated_client_version";
const COL_ORIGIN_FILE_IDENT: &str = "origin_file_ident";
const COL_ORIGIN_TIMESTAMP: &str = "origin_timestamp";
const COL_ORIGINAL_SIZE: &str = "original_size";
const COL_DATA: &str = "data";

const P_DOWNLOAD_SERVER_VERSION: &str = "download_server_version";
const P_DOWNLOAD_CLIENT_VERSION: &str = "download_client_version";
const P_UPLOAD_SERVER_VERSION: &str = "upload_server_version";
const P_UPLOAD_CLIENT_VERSION: &str = "upload_client_version";
const P_LATEST_SERVER_VERSION: &str = "latest_server_version";
const P_LATEST_SERVER_VERSION_SALT: &str = "latest_server_version_salt";

/// Marker byte identifying the nonportable stored-blob compression format.
const COMPRESSION_MARKER_ZLIB: u8 = 1;

fn bootstrap_specs() -> Vec<MetadataTableSpec> {
    vec![
        MetadataTableSpec {
            name: BOOTSTRAP_TABLE,
            columns: vec![
                MetadataColumnSpec::new(COL_QUERY_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(COL_DOWNLOADABLE_BYTES, ColumnType::Int),
                MetadataColumnSpec::link_list(COL_CHANGESETS, CHANGESETS_TABLE),
                MetadataColumnSpec::link(COL_PROGRESS, PROGRESS_TABLE),
            ],
        },
        MetadataTableSpec {
            name: CHANGESETS_TABLE,
            columns: vec![
                MetadataColumnSpec::new(COL_REMOTE_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(COL_LAST_INTEGRATED_CLIENT_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(COL_ORIGIN_FILE_IDENT, ColumnType::Int),
                MetadataColumnSpec::new(COL_ORIGIN_TIMESTAMP, ColumnType::Int),
                MetadataColumnSpec::new(COL_ORIGINAL_SIZE, ColumnType::Int),
                MetadataColumnSpec::nullable(COL_DATA, ColumnType::Binary),
            ],
        },
        MetadataTableSpec {
            name: PROGRESS_TABLE,
            columns: vec![
                MetadataColumnSpec::new(P_DOWNLOAD_SERVER_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(P_DOWNLOAD_CLIENT_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(P_UPLOAD_SERVER_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(P_UPLOAD_CLIENT_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(P_LATEST_SERVER_VERSION, ColumnType::Int),
                MetadataColumnSpec::new(P_LATEST_SERVER_VERSION_SALT, ColumnType::Int),
            ],
        },
    ]
}

/// The front of the staged bootstrap, sized by a byte budget.
#[derive(Debug, Default)]
pub struct PendingBatch {
    pub query_version: i64,
    pub changesets: Vec<RemoteChangeset>,
    /// Present once the server finished the bootstrap (the batch carrying the
    /// progress marks it complete for reading).
    pub progress: Option<SyncProgress>,
    pub remaining_changesets: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingBatchStats {
    pub query_version: i64,
    pub pending_changesets: usize,
    pub pending_changeset_bytes: u64,
}

pub struct PendingBootstrapStore {
    db: Database,
    tables: ResolvedSchema,
    has_pending: AtomicBool,
}

impl PendingBootstrapStore {
    pub fn new(db: Database) -> CoreResult<PendingBootstrapStore> {
        let mut tr = db.start_read(None)?;
        let tables = create_or_load_schema(
            &mut tr,
            schema_groups::PENDING_BOOTSTRAPS,
            SCHEMA_VERSION,
            &bootstrap_specs(),
        )?;
        let has_pending = !tr.table(tables[BOOTSTRAP_TABLE].table)?.is_empty();
        drop(tr);
        Ok(PendingBootstrapStore {
            db,
            tables,
            has_pending: AtomicBool::new(has_pending),
        })
    }

    pub fn has_pending(&self) -> bool {
        self.has_pending.load(Ordering::Acquire)
    }

    /// Stage one batch. A pending bootstrap for a different query version is
    /// discarded first; supplying `progress` finalizes the bootstrap for
    /// reading.
    pub fn add_batch(
        &self,
        query_version: i64,
        progress: Option<&SyncProgress>,
        download_estimate: DownloadableProgress,
        changesets: &[RemoteChangeset],
    ) -> CoreResult<()> {
        let compressed: Vec<Vec<u8>> = changesets
            .iter()
            .map(|cs| compress_nonportable(&cs.data))
            .collect();

        let bootstrap = &self.tables[BOOTSTRAP_TABLE];
        let changesets_table = &self.tables[CHANGESETS_TABLE];
        let progress_table = &self.tables[PROGRESS_TABLE];

        let mut tr = self.db.start_write()?;

        // Discard bootstraps staged for a superseded query version.
        let stale: Vec<(ObjKey, i64)> = tr
            .table(bootstrap.table)?
            .objects
            .iter()
            .filter_map(|(key, obj)| {
                let qv = obj.value(bootstrap.col(COL_QUERY_VERSION)).and_then(Value::as_int)?;
                (qv != query_version).then_some((*key, qv))
            })
            .collect();
        for (key, qv) in stale {
            tracing::debug!("clearing incomplete bootstrap for query version {qv}");
            self.erase_bootstrap_row(&mut tr, key)?;
        }

        let existing = tr
            .table(bootstrap.table)?
            .objects
            .iter()
            .find_map(|(key, obj)| {
                (obj.value(bootstrap.col(COL_QUERY_VERSION)).and_then(Value::as_int)
                    == Some(query_version))
                .then_some(*key)
            });
        let (bootstrap_obj, did_create) = match existing {
            Some(key) => (key, false),
            None => {
                let key = tr.create_object(bootstrap.table)?;
                tr.set_value(
                    bootstrap.table,
                    key,
                    bootstrap.col(COL_QUERY_VERSION),
                    Value::Int(query_version),
                )?;
                (key, true)
            }
        };
        tr.set_value(
            bootstrap.table,
            bootstrap_obj,
            bootstrap.col(COL_DOWNLOADABLE_BYTES),
            Value::Int(download_estimate.downloadable_bytes as i64),
        )?;

        if let Some(progress) = progress {
            // Overwrite any previous progress object.
            if let Some(old) = tr
                .object(bootstrap.table, bootstrap_obj)?
                .value(bootstrap.col(COL_PROGRESS))
                .and_then(Value::as_link)
            {
                tr.erase_object(progress_table.table, old)?;
            }
            let progress_obj = tr.create_object(progress_table.table)?;
            let fields = [
                (P_DOWNLOAD_SERVER_VERSION, progress.download.server_version as i64),
                (
                    P_DOWNLOAD_CLIENT_VERSION,
                    progress.download.last_integrated_client_version as i64,
                ),
                (
                    P_UPLOAD_SERVER_VERSION,
                    progress.upload.last_integrated_server_version as i64,
                ),
                (P_UPLOAD_CLIENT_VERSION, progress.upload.client_version as i64),
                (
                    P_LATEST_SERVER_VERSION,
                    progress.latest_server_version.version as i64,
                ),
                (P_LATEST_SERVER_VERSION_SALT, progress.latest_server_version.salt),
            ];
            for (field, value) in fields {
                tr.set_value(
                    progress_table.table,
                    progress_obj,
                    progress_table.col(field),
                    Value::Int(value),
                )?;
            }
            tr.set_value(
                bootstrap.table,
                bootstrap_obj,
                bootstrap.col(COL_PROGRESS),
                Value::Link(progress_obj),
            )?;
        }

        for (cs, blob) in changesets.iter().zip(compressed) {
            let row = tr.create_object(changesets_table.table)?;
            let fields = [
                (COL_REMOTE_VERSION, cs.remote_version as i64),
                (
                    COL_LAST_INTEGRATED_CLIENT_VERSION,
                    cs.last_integrated_local_version as i64,
                ),
                (COL_ORIGIN_FILE_IDENT, cs.origin_file_ident as i64),
                (COL_ORIGIN_TIMESTAMP, cs.origin_timestamp as i64),
                (COL_ORIGINAL_SIZE, cs.original_changeset_size as i64),
            ];
            for (field, value) in fields {
                tr.set_value(
                    changesets_table.table,
                    row,
                    changesets_table.col(field),
                    Value::Int(value),
                )?;
            }
            tr.set_value(
                changesets_table.table,
                row,
                changesets_table.col(COL_DATA),
                Value::Binary(blob),
            )?;
            let len = tr
                .object(bootstrap.table, bootstrap_obj)?
                .list(bootstrap.col(COL_CHANGESETS))
                .map(<[Value]>::len)
                .unwrap_or(0);
            tr.list_insert(
                bootstrap.table,
                bootstrap_obj,
                bootstrap.col(COL_CHANGESETS),
                len,
                Value::Link(row),
            )?;
        }

        tr.commit()?;

        if did_create {
            tracing::trace!("created new pending bootstrap object for query version {query_version}");
        } else {
            tracing::trace!("added batch to pending bootstrap object for query version {query_version}");
        }
        if progress.is_some() {
            tracing::trace!("finalized pending bootstrap object for query version {query_version}");
        }
        self.has_pending.store(true, Ordering::Release);
        Ok(())
    }

    /// Decompress and parse staged batches from the front until the byte
    /// budget is reached. At least one batch is returned when any is staged.
    pub fn peek_pending(&self, limit_in_bytes: u64) -> CoreResult<PendingBatch> {
        let tr = self.db.start_read(None)?;
        let bootstrap = &self.tables[BOOTSTRAP_TABLE];
        let changesets_table = &self.tables[CHANGESETS_TABLE];
        let progress_table = &self.tables[PROGRESS_TABLE];

        let table = tr.table(bootstrap.table)?;
        let Some((bootstrap_obj, row)) = table.objects.iter().next() else {
            return Ok(PendingBatch::default());
        };
        // At most one pending bootstrap may exist at a time.
        debug_assert_eq!(table.len(), 1);
        let _ = bootstrap_obj;

        let mut batch = PendingBatch {
            query_version: row
                .value(bootstrap.col(COL_QUERY_VERSION))
                .and_then(Value::as_int)
                .unwrap_or(0),
            ..Default::default()
        };

        if let Some(progress_obj) = row.value(bootstrap.col(COL_PROGRESS)).and_then(Value::as_link) {
            let p = tr.object(progress_table.table, progress_obj)?;
            let get = |field: &str| {
                p.value(progress_table.col(field))
                    .and_then(Value::as_int)
                    .unwrap_or(0)
            };
            batch.progress = Some(SyncProgress {
                latest_server_version: SaltedVersion::new(
                    get(P_LATEST_SERVER_VERSION) as Version,
                    get(P_LATEST_SERVER_VERSION_SALT),
                ),
                download: DownloadCursor {
                    server_version: get(P_DOWNLOAD_SERVER_VERSION) as Version,
                    last_integrated_client_version: get(P_DOWNLOAD_CLIENT_VERSION) as Version,
                },
                upload: UploadCursor {
                    client_version: get(P_UPLOAD_CLIENT_VERSION) as Version,
                    last_integrated_server_version: get(P_UPLOAD_SERVER_VERSION) as Version,
                },
            });
        }

        let links = row.list(bootstrap.col(COL_CHANGESETS)).unwrap_or(&[]);
        let mut bytes_so_far = 0u64;
        for link in links {
            if bytes_so_far >= limit_in_bytes && !batch.changesets.is_empty() {
                break;
            }
            let Some(cs_obj) = link.as_link() else {
                continue;
            };
            let cs_row = tr.object(changesets_table.table, cs_obj)?;
            let blob = cs_row
                .value(changesets_table.col(COL_DATA))
                .and_then(Value::as_binary)
                .unwrap_or(&[]);
            let data = decompress_nonportable(blob)?;
            bytes_so_far += data.len() as u64;
            let get = |field: &str| {
                cs_row
                    .value(changesets_table.col(field))
                    .and_then(Value::as_int)
                    .unwrap_or(0)
            };
            batch.changesets.push(RemoteChangeset {
                remote_version: get(COL_REMOTE_VERSION) as Version,
                last_integrated_local_version: get(COL_LAST_INTEGRATED_CLIENT_VERSION) as Version,
                origin_file_ident: get(COL_ORIGIN_FILE_IDENT) as FileIdent,
                origin_timestamp: get(COL_ORIGIN_TIMESTAMP) as Timestamp,
                original_changeset_size: get(COL_ORIGINAL_SIZE) as u64,
                data: Bytes::from(data),
            });
        }
        batch.remaining_changesets = links.len() - batch.changesets.len();
        Ok(batch)
    }

    /// Remove the first `count` staged batches. Must be called inside the
    /// write transaction that integrates them, so a crash can never separate
    /// the pop from the apply.
    pub fn pop_front_pending(&self, tr: &mut Transaction, count: usize) -> CoreResult<()> {
        if tr.stage() != TransactionStage::Writing {
            return Err(CoreError::InvalidTransaction(
                "pop_front_pending requires a write transaction",
            ));
        }
        let bootstrap = &self.tables[BOOTSTRAP_TABLE];
        let changesets_table = &self.tables[CHANGESETS_TABLE];

        let Some(bootstrap_obj) = tr.table(bootstrap.table)?.object_keys().next() else {
            return Ok(());
        };
        let links: Vec<ObjKey> = tr
            .object(bootstrap.table, bootstrap_obj)?
            .list(bootstrap.col(COL_CHANGESETS))
            .unwrap_or(&[])
            .iter()
            .filter_map(Value::as_link)
            .collect();
        debug_assert!(links.len() >= count);
        let count = count.min(links.len());

        for cs_obj in links.iter().take(count) {
            tr.erase_object(changesets_table.table, *cs_obj)?;
            tr.list_erase(
                bootstrap.table,
                bootstrap_obj,
                bootstrap.col(COL_CHANGESETS),
                0,
            )?;
        }

        let remaining = links.len() - count;
        if remaining == 0 {
            let query_version = tr
                .object(bootstrap.table, bootstrap_obj)?
                .value(bootstrap.col(COL_QUERY_VERSION))
                .and_then(Value::as_int)
                .unwrap_or(0);
            tracing::trace!("removing pending bootstrap obj for query version {query_version}");
            self.erase_bootstrap_row(tr, bootstrap_obj)?;
            self.has_pending.store(false, Ordering::Release);
        } else {
            tracing::trace!("removed pending bootstrap batch, {remaining} changesets remaining");
        }
        Ok(())
    }

    pub fn pending_stats(&self) -> CoreResult<Option<PendingBatchStats>> {
        let tr = self.db.start_read(None)?;
        let bootstrap = &self.tables[BOOTSTRAP_TABLE];
        let changesets_table = &self.tables[CHANGESETS_TABLE];
        let table = tr.table(bootstrap.table)?;
        let Some(row) = table.objects.values().next() else {
            return Ok(None);
        };
        let query_version = row
            .value(bootstrap.col(COL_QUERY_VERSION))
            .and_then(Value::as_int)
            .unwrap_or(0);
        let links = row.list(bootstrap.col(COL_CHANGESETS)).unwrap_or(&[]);
        let mut bytes = 0u64;
        for link in links {
            if let Some(cs_obj) = link.as_link() {
                bytes += tr
                    .object(changesets_table.table, cs_obj)?
                    .value(changesets_table.col(COL_ORIGINAL_SIZE))
                    .and_then(Value::as_int)
                    .unwrap_or(0) as u64;
            }
        }
        Ok(Some(PendingBatchStats {
            query_version,
            pending_changesets: links.len(),
            pending_changeset_bytes: bytes,
        }))
    }

    /// Wipe the staged bootstrap for `query_version`, inside the caller's
    /// write transaction. Used when the subscription set is superseded.
    pub fn clear(&self, tr: &mut Transaction, query_version: i64) -> CoreResult<()> {
        if tr.stage() != TransactionStage::Writing {
            return Err(CoreError::InvalidTransaction(
                "clear requires a write transaction",
            ));
        }
        let bootstrap = &self.tables[BOOTSTRAP_TABLE];
        let targets: Vec<ObjKey> = tr
            .table(bootstrap.table)?
            .objects
            .iter()
            .filter_map(|(key, obj)| {
                (obj.value(bootstrap.col(COL_QUERY_VERSION)).and_then(Value::as_int)
                    == Some(query_version))
                .then_some(*key)
            })
            .collect();
        for key in targets {
            self.erase_bootstrap_row(tr, key)?;
        }
        let empty = tr.table(bootstrap.table)?.is_empty();
        self.has_pending.store(!empty, Ordering::Release);
        Ok(())
    }

    fn erase_bootstrap_row(&self, tr: &mut Transaction, key: ObjKey) -> CoreResult<()> {
        let bootstrap = &self.tables[BOOTSTRAP_TABLE];
        let changesets_table = &self.tables[CHANGESETS_TABLE];
        let progress_table = &self.tables[PROGRESS_TABLE];
        let row = tr.object(bootstrap.table, key)?;
        let links: Vec<ObjKey> = row
            .list(bootstrap.col(COL_CHANGESETS))
            .unwrap_or(&[])
            .iter()
            .filter_map(Value::as_link)
            .collect();
        let progress = row.value(bootstrap.col(COL_PROGRESS)).and_then(Value::as_link);
        for cs in links {
            tr.erase_object(changesets_table.table, cs)?;
        }
        if let Some(progress) = progress {
            tr.erase_object(progress_table.table, progress)?;
        }
        tr.erase_object(bootstrap.table, key)
    }
}

fn compress_nonportable(data: &[u8]) -> Vec<u8> {
    let mut out = vec![COMPRESSION_MARKER_ZLIB];
    out.extend_from_slice(&crate::protocol::compress_body(data));
    out
}

fn decompress_nonportable(blob: &[u8]) -> CoreResult<Vec<u8>> {
    use std::io::Read;
    match blob.first() {
        Some(&COMPRESSION_MARKER_ZLIB) => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(&blob[1..])
                .read_to_end(&mut out)
                .map_err(|e| CoreError::Decompression(e.to_string()))?;
            Ok(out)
        }
        _ => {
            tracing::error!(
                "synchronized files with unprocessed pending bootstraps cannot be copied between platforms"
            );
            Err(CoreError::DecompressionUnsupported)
        }
    }
}
