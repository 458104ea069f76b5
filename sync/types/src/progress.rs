// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::{FileIdent, Salt, Version};

/// Server-assigned client-file identity plus its anti-spoofing salt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaltedFileIdent {
    pub ident: FileIdent,
    /// History divergence and identity spoofing protection.
    pub salt: Salt,
}

impl SaltedFileIdent {
    pub fn new(ident: FileIdent, salt: Salt) -> SaltedFileIdent {
        SaltedFileIdent { ident, salt }
    }
}

/// A server version paired with its anti-divergence salt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaltedVersion {
    pub version: Version,
    /// History divergence protection.
    pub salt: Salt,
}

impl SaltedVersion {
    pub fn new(version: Version, salt: Salt) -> SaltedVersion {
        SaltedVersion { version, salt }
    }
}

/// The client's reference to a position in the server-side history.
///
/// If `server_version` is zero the position is at the beginning of the history,
/// otherwise it is after the entry whose changeset produced that version.
/// `last_integrated_client_version` is the client version produced by the last
/// client changeset the server had integrated at that point, or zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadCursor {
    pub server_version: Version,
    pub last_integrated_client_version: Version,
}

/// The server's reference to a position in the client-side history, mirrored
/// by the client to drive upload scans.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCursor {
    pub client_version: Version,
    pub last_integrated_server_version: Version,
}

/// Whether a DOWNLOAD message is the last of the batch it belongs to. In FLX
/// mode a bootstrap spans several messages and only the last one commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadBatchState {
    MoreToCome,
    LastInBatch,
}

/// Server-reported estimate of bytes remaining to download.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadableProgress {
    pub downloadable_bytes: u64,
}

impl From<u64> for DownloadableProgress {
    fn from(downloadable_bytes: u64) -> Self {
        DownloadableProgress {
            downloadable_bytes,
        }
    }
}

/// The client's persistent record of how far synchronization has progressed in
/// each direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// The last server version the client has heard about.
    pub latest_server_version: SaltedVersion,
    /// The last server version integrated, or about to be integrated.
    pub download: DownloadCursor,
    /// The last client version integrated by the server.
    pub upload: UploadCursor,
}

pub fn is_consistent_download(dc: DownloadCursor) -> bool {
    dc.server_version != 0 || dc.last_integrated_client_version == 0
}

pub fn is_consistent_upload(uc: UploadCursor) -> bool {
    uc.client_version != 0 || uc.last_integrated_server_version == 0
}

/// Two download cursors taken from the same server history must order their
/// components the same way.
pub fn are_cursors_mutually_consistent(a: DownloadCursor, b: DownloadCursor) -> bool {
    if a.server_version < b.server_version {
        a.last_integrated_client_version <= b.last_integrated_client_version
    } else if a.server_version > b.server_version {
        a.last_integrated_client_version >= b.last_integrated_client_version
    } else {
        a.last_integrated_client_version == b.last_integrated_client_version
    }
}

pub fn are_upload_cursors_mutually_consistent(a: UploadCursor, b: UploadCursor) -> bool {
    if a.client_version < b.client_version {
        a.last_integrated_server_version <= b.last_integrated_server_version
    } else if a.client_version > b.client_version {
        a.last_integrated_server_version >= b.last_integrated_server_version
    } else {
        a.last_integrated_server_version == b.last_integrated_server_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cursors_are_consistent() {
        assert!(is_consistent_download(DownloadCursor::default()));
        assert!(is_consistent_upload(UploadCursor::default()));
        assert!(!is_consistent_download(DownloadCursor {
            server_version: 0,
            last_integrated_client_version: 3,
        }));
    }

    #[test]
    fn cursor_ordering_consistency() {
        let a = DownloadCursor {
            server_version: 4,
            last_integrated_client_version: 2,
        };
        let b = DownloadCursor {
            server_version: 7,
            last_integrated_client_version: 2,
        };
        let c = DownloadCursor {
            server_version: 7,
            last_integrated_client_version: 1,
        };
        assert!(are_cursors_mutually_consistent(a, b));
        assert!(!are_cursors_mutually_consistent(a, c));
        assert!(are_cursors_mutually_consistent(b, b));
    }
}
