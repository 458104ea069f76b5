// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod keys;
mod progress;

pub use keys::{ColKey, ColumnAttrs, ColumnType, ObjKey, TableKey, VersionId};
pub use progress::{
    are_cursors_mutually_consistent, are_upload_cursors_mutually_consistent, is_consistent_download,
    is_consistent_upload, DownloadBatchState, DownloadCursor, DownloadableProgress, SaltedFileIdent,
    SaltedVersion, SyncProgress, UploadCursor,
};

/// Server-assigned identifier of one client file. Zero means "not yet assigned"
/// and doubles as the local-origin marker in history entries.
pub type FileIdent = u64;

/// A position in either history; version 1 is the first snapshot of a fresh file.
pub type Version = u64;

/// Random tag paired with file idents and server versions to detect history
/// spoofing or divergence.
pub type Salt = i64;

/// Origin timestamp of a changeset, in milliseconds since the sync epoch.
pub type Timestamp = u64;

/// Identifies one session multiplexed over a connection.
pub type SessionIdent = u64;

/// Identifies one MARK round-trip within a session.
pub type RequestIdent = u64;

pub const MAX_FILE_IDENT: FileIdent = 0x07FF_FFFF_FFFF_FFFF;
