// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::protocol::ProtocolError;

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the sync core.
///
/// Transaction and accessor faults propagate synchronously to the caller.
/// Integration faults carry the protocol error to echo to the server and are
/// routed to the session error handler. Notifier faults are delivered through
/// each callback's error hook.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(&'static str),

    #[error("accessor backed by a deleted object or a closed database")]
    InvalidatedObject,

    #[error("handle accessed from a thread other than the one that created it")]
    IncorrectThread,

    #[error(
        "schema mismatch detected: another process has modified the schema in an incompatible way"
    )]
    UnsupportedSchemaChange,

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("history schema version {found} is newer than the supported version {supported}")]
    IncompatibleHistorySchema { found: i64, supported: i64 },

    #[error(
        "metadata schema version {found} for group '{group}' is newer than the supported version {supported}"
    )]
    UnsupportedMetadataSchema {
        group: &'static str,
        found: i64,
        supported: i64,
    },

    #[error(transparent)]
    Integration(#[from] IntegrationError),

    #[error("bad wire message: {0}")]
    Wire(#[from] WireError),

    #[error(
        "stored bootstrap data uses an unsupported compression format; \
         files with unprocessed pending bootstraps cannot be copied between platforms"
    )]
    DecompressionUnsupported,

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("changeset encoding error: {0}")]
    ChangesetEncoding(String),

    #[error("bad changeset: {0}")]
    BadChangeset(String),

    #[error("no snapshot exists for version {0}")]
    NoSuchVersion(u64),

    #[error("database is shutting down")]
    Shutdown,
}

/// A remote changeset failed to integrate. Carries the protocol error the
/// session should echo to the server.
#[derive(Error, Debug, Clone)]
#[error("integration failed: {message}")]
pub struct IntegrationError {
    pub message: String,
    pub error_for_server: ProtocolError,
}

impl IntegrationError {
    pub fn new(message: impl Into<String>) -> IntegrationError {
        IntegrationError {
            message: message.into(),
            error_for_server: ProtocolError::OtherSessionError,
        }
    }

    pub fn with_error_for_server(
        message: impl Into<String>,
        error_for_server: ProtocolError,
    ) -> IntegrationError {
        IntegrationError {
            message: message.into(),
            error_for_server,
        }
    }
}

/// Wire-format violations detected by the codec. Always fatal for the
/// connection, never for the session.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown type of input message")]
    UnknownMessage,
    #[error("bad syntax in input message head")]
    BadSyntax,
    #[error("limits exceeded in input message")]
    LimitsExceeded,
    #[error("bad syntax in changeset header")]
    BadChangesetHeaderSyntax,
    #[error("bad changeset size in changeset header")]
    BadChangesetSize,
    #[error("bad server version in changeset header")]
    BadServerVersion,
    #[error("bad error code")]
    BadErrorCode,
    #[error("error in body decompression")]
    BadDecompression,
}

impl WireError {
    /// Numeric codes reported by the client-side codec.
    pub fn code(self) -> u16 {
        match self {
            WireError::UnknownMessage => 101,
            WireError::BadSyntax => 102,
            WireError::LimitsExceeded => 103,
            WireError::BadChangesetHeaderSyntax => 108,
            WireError::BadChangesetSize => 109,
            WireError::BadServerVersion => 111,
            WireError::BadErrorCode => 114,
            WireError::BadDecompression => 115,
        }
    }
}
