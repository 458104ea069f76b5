// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wire codec for the changeset replication protocol.
//!
//! Messages are a space-separated header line terminated by `\n`, optionally
//! followed by a body. Integers are decimal, booleans are `0`/`1`, strings
//! are length-prefixed in the header and carried in the body. DOWNLOAD and
//! UPLOAD bodies are concatenations of per-changeset records and may be
//! zlib-compressed as a whole; every declared length is validated against the
//! actual buffer before anything is handed out.
//!
//! Changeset payloads are returned as slices of one shared `Bytes` buffer, so
//! they stay valid while staged in the bootstrap store or handed to history
//! integration, independent of the message that carried them.

use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;

use bytes::Bytes;
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::Deserialize;
use sync_types::{
    DownloadCursor, FileIdent, RequestIdent, Salt, SaltedFileIdent, SaltedVersion, SessionIdent,
    SyncProgress, Timestamp, UploadCursor, Version,
};

use crate::{
    changeset::RemoteChangeset,
    error::WireError,
};

/// Protocol revisions this implementation speaks.
pub const PROTOCOL_VERSION: u32 = 6;

pub fn pbs_websocket_subprotocol() -> String {
    format!("com.mongodb.realm-sync/{PROTOCOL_VERSION}")
}

pub fn flx_websocket_subprotocol() -> String {
    format!("com.mongodb.realm-query-sync/{PROTOCOL_VERSION}")
}

// ---------------------------------------------------------------------------
// Protocol error taxonomy

/// Errors reported by the server in ERROR messages. Codes in the 100s are
/// connection-level, 200s are session-level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolError {
    ConnectionClosed,
    OtherError,
    UnknownMessage,
    BadSyntax,
    LimitsExceeded,
    WrongProtocolVersion,
    BadSessionIdent,
    ReuseOfSessionIdent,
    BoundInOtherSession,
    BadMessageOrder,
    BadDecompression,
    BadChangesetHeaderSyntax,
    BadChangesetSize,
    SwitchToFlxSync,
    SwitchToPbs,

    SessionClosed,
    OtherSessionError,
    TokenExpired,
    BadAuthentication,
    IllegalRealmPath,
    NoSuchRealm,
    PermissionDenied,
    BadServerFileIdent,
    BadClientFileIdent,
    BadServerVersion,
    BadClientVersion,
    DivergingHistories,
    BadChangeset,
    PartialSyncDisabled,
    UnsupportedSessionFeature,
    BadOriginFileIdent,
    BadClientFile,
    ServerFileDeleted,
    ClientFileBlacklisted,
    UserBlacklisted,
    TransactBeforeUpload,
    ClientFileExpired,
    UserMismatch,
    TooManySessions,
    InvalidSchemaChange,
    BadQuery,
    ObjectAlreadyExists,
    ServerPermissionsChanged,
    InitialSyncNotCompleted,
    WriteNotAllowed,
    CompensatingWrite,
}

impl ProtocolError {
    pub fn code(self) -> i32 {
        use ProtocolError::*;
        match self {
            ConnectionClosed => 100,
            OtherError => 101,
            UnknownMessage => 102,
            BadSyntax => 103,
            LimitsExceeded => 104,
            WrongProtocolVersion => 105,
            BadSessionIdent => 106,
            ReuseOfSessionIdent => 107,
            BoundInOtherSession => 108,
            BadMessageOrder => 109,
            BadDecompression => 110,
            BadChangesetHeaderSyntax => 111,
            BadChangesetSize => 112,
            SwitchToFlxSync => 113,
            SwitchToPbs => 114,
            SessionClosed => 200,
            OtherSessionError => 201,
            TokenExpired => 202,
            BadAuthentication => 203,
            IllegalRealmPath => 204,
            NoSuchRealm => 205,
            PermissionDenied => 206,
            BadServerFileIdent => 207,
            BadClientFileIdent => 208,
            BadServerVersion => 209,
            BadClientVersion => 210,
            DivergingHistories => 211,
            BadChangeset => 212,
            PartialSyncDisabled => 214,
            UnsupportedSessionFeature => 215,
            BadOriginFileIdent => 216,
            BadClientFile => 217,
            ServerFileDeleted => 218,
            ClientFileBlacklisted => 219,
            UserBlacklisted => 220,
            TransactBeforeUpload => 221,
            ClientFileExpired => 222,
            UserMismatch => 223,
            TooManySessions => 224,
            InvalidSchemaChange => 225,
            BadQuery => 226,
            ObjectAlreadyExists => 227,
            ServerPermissionsChanged => 228,
            InitialSyncNotCompleted => 229,
            WriteNotAllowed => 230,
            CompensatingWrite => 231,
        }
    }

    pub fn from_code(code: i32) -> Option<ProtocolError> {
        use ProtocolError::*;
        Some(match code {
            100 => ConnectionClosed,
            101 => OtherError,
            102 => UnknownMessage,
            103 => BadSyntax,
            104 => LimitsExceeded,
            105 => WrongProtocolVersion,
            106 => BadSessionIdent,
            107 => ReuseOfSessionIdent,
            108 => BoundInOtherSession,
            109 => BadMessageOrder,
            110 => BadDecompression,
            111 => BadChangesetHeaderSyntax,
            112 => BadChangesetSize,
            113 => SwitchToFlxSync,
            114 => SwitchToPbs,
            200 => SessionClosed,
            201 => OtherSessionError,
            202 => TokenExpired,
            203 => BadAuthentication,
            204 => IllegalRealmPath,
            205 => NoSuchRealm,
            206 => PermissionDenied,
            207 => BadServerFileIdent,
            208 => BadClientFileIdent,
            209 => BadServerVersion,
            210 => BadClientVersion,
            211 => DivergingHistories,
            212 => BadChangeset,
            214 => PartialSyncDisabled,
            215 => UnsupportedSessionFeature,
            216 => BadOriginFileIdent,
            217 => BadClientFile,
            218 => ServerFileDeleted,
            219 => ClientFileBlacklisted,
            220 => UserBlacklisted,
            221 => TransactBeforeUpload,
            222 => ClientFileExpired,
            223 => UserMismatch,
            224 => TooManySessions,
            225 => InvalidSchemaChange,
            226 => BadQuery,
            227 => ObjectAlreadyExists,
            228 => ServerPermissionsChanged,
            229 => InitialSyncNotCompleted,
            230 => WriteNotAllowed,
            231 => CompensatingWrite,
            _ => return None,
        })
    }

    pub fn is_session_level(self) -> bool {
        (200..300).contains(&self.code())
    }

    /// Session-level errors suspend the session, with the compensating-write
    /// exception.
    pub fn requires_suspend(self) -> bool {
        self != ProtocolError::CompensatingWrite
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// One write rejected by the server and reverted by a compensating write.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CompensatingWriteErrorInfo {
    #[serde(rename = "object")]
    pub object_name: String,
    pub primary_key: serde_json::Value,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumptionDelayInfo {
    pub max_resumption_delay_interval: Duration,
    pub resumption_delay_interval: Duration,
    pub resumption_delay_backoff_multiplier: i32,
}

impl Default for ResumptionDelayInfo {
    fn default() -> Self {
        ResumptionDelayInfo {
            max_resumption_delay_interval: Duration::from_secs(300),
            resumption_delay_interval: Duration::from_secs(1),
            resumption_delay_backoff_multiplier: 2,
        }
    }
}

/// Decoded payload of an ERROR message, plus the deferral version used by the
/// pending-error store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProtocolErrorInfo {
    pub raw_error_code: i32,
    pub message: String,
    pub try_again: bool,
    pub client_reset_recovery_is_disabled: bool,
    pub should_client_reset: Option<bool>,
    pub log_url: Option<String>,
    pub compensating_writes: Vec<CompensatingWriteErrorInfo>,
    pub resumption_delay_interval: Option<ResumptionDelayInfo>,
    pub pending_until_server_version: Option<Version>,
}

impl ProtocolErrorInfo {
    pub fn new(code: i32, message: impl Into<String>, try_again: bool) -> ProtocolErrorInfo {
        ProtocolErrorInfo {
            raw_error_code: code,
            message: message.into(),
            try_again,
            ..Default::default()
        }
    }

    pub fn error(&self) -> Option<ProtocolError> {
        ProtocolError::from_code(self.raw_error_code)
    }

    pub fn is_fatal(&self) -> bool {
        !self.try_again
    }
}

#[derive(Deserialize)]
struct JsonErrorBody {
    message: Option<String>,
    #[serde(rename = "tryAgain")]
    try_again: Option<bool>,
    #[serde(rename = "shouldClientReset")]
    should_client_reset: Option<bool>,
    #[serde(rename = "isRecoveryModeDisabled")]
    recovery_mode_disabled: Option<bool>,
    #[serde(rename = "logURL")]
    log_url: Option<String>,
    #[serde(rename = "compensatingWrites")]
    compensating_writes: Option<Vec<CompensatingWriteErrorInfo>>,
}

// ---------------------------------------------------------------------------
// Messages

/// Messages the client receives.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    Download {
        session: SessionIdent,
        progress: SyncProgress,
        downloadable_bytes: i64,
        changesets: Vec<RemoteChangeset>,
    },
    Ident {
        session: SessionIdent,
        client_file_ident: SaltedFileIdent,
    },
    Error {
        session: SessionIdent,
        info: ProtocolErrorInfo,
    },
    Mark {
        session: SessionIdent,
        request_ident: RequestIdent,
    },
    Alloc {
        session: SessionIdent,
        file_ident: FileIdent,
    },
    Unbound {
        session: SessionIdent,
    },
    Pong {
        timestamp: i64,
    },
}

/// One changeset carried by an UPLOAD message.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadChangeset {
    pub upload_cursor: UploadCursor,
    pub origin_timestamp: Timestamp,
    /// Zero when originating from the uploading client itself.
    pub origin_file_ident: FileIdent,
    pub changeset: Bytes,
}

/// Messages the server receives.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Bind {
        session: SessionIdent,
        path: String,
        signed_user_token: String,
        need_client_file_ident: bool,
        is_subserver: bool,
    },
    Ident {
        session: SessionIdent,
        client_file_ident: SaltedFileIdent,
        scan_server_version: Version,
        scan_client_version: Version,
        latest_server_version: SaltedVersion,
    },
    Upload {
        session: SessionIdent,
        progress_client_version: Version,
        progress_server_version: Version,
        locked_server_version: Version,
        changesets: Vec<UploadChangeset>,
    },
    Mark {
        session: SessionIdent,
        request_ident: RequestIdent,
    },
    Alloc {
        session: SessionIdent,
    },
    Unbind {
        session: SessionIdent,
    },
    Refresh {
        session: SessionIdent,
        signed_user_token: String,
    },
    Ping {
        timestamp: i64,
        rtt: i64,
    },
}

// ---------------------------------------------------------------------------
// Header scanning

struct Scanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(data: &'a [u8]) -> Scanner<'a> {
        Scanner { data, pos: 0 }
    }

    fn read_token(&mut self) -> Result<&'a str, WireError> {
        let start = self.pos;
        while self.pos < self.data.len()
            && self.data[self.pos] != b' '
            && self.data[self.pos] != b'\n'
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(WireError::BadSyntax);
        }
        std::str::from_utf8(&self.data[start..self.pos]).map_err(|_| WireError::BadSyntax)
    }

    fn expect_space(&mut self) -> Result<(), WireError> {
        if self.data.get(self.pos) == Some(&b' ') {
            self.pos += 1;
            Ok(())
        } else {
            Err(WireError::BadSyntax)
        }
    }

    fn expect_newline(&mut self) -> Result<(), WireError> {
        if self.data.get(self.pos) == Some(&b'\n') {
            self.pos += 1;
            Ok(())
        } else {
            Err(WireError::BadSyntax)
        }
    }

    fn read_u64(&mut self) -> Result<u64, WireError> {
        self.expect_space()?;
        self.read_u64_bare()
    }

    fn read_u64_bare(&mut self) -> Result<u64, WireError> {
        self.read_token()?
            .parse::<u64>()
            .map_err(|_| WireError::BadSyntax)
    }

    fn read_i64(&mut self) -> Result<i64, WireError> {
        self.expect_space()?;
        self.read_token()?
            .parse::<i64>()
            .map_err(|_| WireError::BadSyntax)
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u64()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::BadSyntax),
        }
    }

    fn offset(&self) -> usize {
        self.pos
    }
}

// ---------------------------------------------------------------------------
// Body compression

pub fn compress_body(body: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(body)
        .and_then(|_| encoder.finish())
        .expect("in-memory compression cannot fail")
}

pub fn decompress_body(
    data: &[u8],
    uncompressed_size: usize,
    max_size: usize,
) -> Result<Vec<u8>, WireError> {
    if uncompressed_size > max_size {
        return Err(WireError::LimitsExceeded);
    }
    let mut out = Vec::with_capacity(uncompressed_size);
    let mut decoder = ZlibDecoder::new(data).take(uncompressed_size as u64 + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| WireError::BadDecompression)?;
    if out.len() != uncompressed_size {
        return Err(WireError::BadDecompression);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Client-side codec

/// Parses messages received by the client and builds messages it sends.
#[derive(Clone, Debug)]
pub struct ClientProtocol {
    pub max_body_size: usize,
}

impl Default for ClientProtocol {
    fn default() -> Self {
        ClientProtocol {
            max_body_size: sync_config::Parameters::default_max_message_body_size(),
        }
    }
}

impl ClientProtocol {
    pub fn new(max_body_size: usize) -> ClientProtocol {
        ClientProtocol { max_body_size }
    }

    pub fn parse_message_received(&self, data: &[u8]) -> Result<ServerMessage, WireError> {
        let mut scanner = Scanner::new(data);
        let message_type = scanner.read_token()?;
        match message_type {
            "download" => self.parse_download(scanner, data),
            "ident" => {
                let session = scanner.read_u64()?;
                let ident = scanner.read_u64()?;
                let salt = scanner.read_i64()?;
                scanner.expect_newline()?;
                expect_exact(&scanner, data.len())?;
                Ok(ServerMessage::Ident {
                    session,
                    client_file_ident: SaltedFileIdent::new(ident, salt),
                })
            }
            "error" => {
                let code = scanner.read_i64()? as i32;
                let message_size = scanner.read_u64()? as usize;
                let try_again = scanner.read_bool()?;
                let session = scanner.read_u64()?;
                scanner.expect_newline()?;
                let header_size = scanner.offset();
                if header_size + message_size != data.len() {
                    return Err(WireError::BadSyntax);
                }
                if ProtocolError::from_code(code).is_none() {
                    tracing::error!("bad error code {code} in ERROR message");
                    return Err(WireError::BadErrorCode);
                }
                let body = &data[header_size..];
                let info = parse_error_body(code, try_again, body);
                Ok(ServerMessage::Error { session, info })
            }
            "mark" => {
                let session = scanner.read_u64()?;
                let request_ident = scanner.read_u64()?;
                scanner.expect_newline()?;
                expect_exact(&scanner, data.len())?;
                Ok(ServerMessage::Mark {
                    session,
                    request_ident,
                })
            }
            "alloc" => {
                let session = scanner.read_u64()?;
                let file_ident = scanner.read_u64()?;
                scanner.expect_newline()?;
                expect_exact(&scanner, data.len())?;
                Ok(ServerMessage::Alloc {
                    session,
                    file_ident,
                })
            }
            "unbound" => {
                let session = scanner.read_u64()?;
                scanner.expect_newline()?;
                expect_exact(&scanner, data.len())?;
                Ok(ServerMessage::Unbound { session })
            }
            "pong" => {
                let timestamp = scanner.read_i64()?;
                scanner.expect_newline()?;
                expect_exact(&scanner, data.len())?;
                Ok(ServerMessage::Pong { timestamp })
            }
            other => {
                tracing::error!("unknown input message type '{other}'");
                Err(WireError::UnknownMessage)
            }
        }
    }

    fn parse_download(
        &self,
        mut scanner: Scanner<'_>,
        data: &[u8],
    ) -> Result<ServerMessage, WireError> {
        let session = scanner.read_u64()?;
        let download_server_version = scanner.read_u64()?;
        let download_client_version = scanner.read_u64()?;
        let latest_server_version = scanner.read_u64()?;
        let latest_server_version_salt = scanner.read_i64()?;
        let upload_client_version = scanner.read_u64()?;
        let upload_server_version = scanner.read_u64()?;
        let downloadable_bytes = scanner.read_i64()?;
        let is_body_compressed = scanner.read_bool()?;
        let compressed_body_size = scanner.read_u64()? as usize;
        let uncompressed_body_size = scanner.read_u64()? as usize;
        scanner.expect_newline()?;
        let header_size = scanner.offset();

        let body_size = if is_body_compressed {
            compressed_body_size
        } else {
            uncompressed_body_size
        };
        if header_size + body_size != data.len() {
            return Err(WireError::BadSyntax);
        }
        if uncompressed_body_size > self.max_body_size {
            return Err(WireError::LimitsExceeded);
        }

        let body = &data[header_size..];
        let body: Bytes = if is_body_compressed {
            decompress_body(body, uncompressed_body_size, self.max_body_size)?.into()
        } else {
            Bytes::copy_from_slice(body)
        };
        tracing::trace!(
            is_body_compressed,
            compressed_body_size,
            uncompressed_body_size,
            "downloaded message body"
        );

        let changesets = parse_download_body(&body)?;

        let progress = SyncProgress {
            latest_server_version: SaltedVersion::new(
                latest_server_version,
                latest_server_version_salt,
            ),
            download: DownloadCursor {
                server_version: download_server_version,
                last_integrated_client_version: download_client_version,
            },
            upload: UploadCursor {
                client_version: upload_client_version,
                last_integrated_server_version: upload_server_version,
            },
        };
        Ok(ServerMessage::Download {
            session,
            progress,
            downloadable_bytes,
            changesets,
        })
    }

    pub fn make_bind_message(
        &self,
        session: SessionIdent,
        server_path: &str,
        signed_user_token: &str,
        need_client_file_ident: bool,
        is_subserver: bool,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(
            format!(
                "bind {session} {} {} {} {}\n",
                server_path.len(),
                signed_user_token.len(),
                need_client_file_ident as u8,
                is_subserver as u8
            )
            .as_bytes(),
        );
        out.extend_from_slice(server_path.as_bytes());
        out.extend_from_slice(signed_user_token.as_bytes());
        out
    }

    pub fn make_ident_message(
        &self,
        session: SessionIdent,
        client_file_ident: SaltedFileIdent,
        progress: &SyncProgress,
    ) -> Vec<u8> {
        format!(
            "ident {session} {} {} {} {} {} {}\n",
            client_file_ident.ident,
            client_file_ident.salt,
            progress.download.server_version,
            progress.download.last_integrated_client_version,
            progress.latest_server_version.version,
            progress.latest_server_version.salt
        )
        .into_bytes()
    }

    pub fn make_upload_message_builder(&self) -> UploadMessageBuilder {
        UploadMessageBuilder::default()
    }

    pub fn make_mark_message(&self, session: SessionIdent, request_ident: RequestIdent) -> Vec<u8> {
        format!("mark {session} {request_ident}\n").into_bytes()
    }

    pub fn make_alloc_message(&self, session: SessionIdent) -> Vec<u8> {
        format!("alloc {session}\n").into_bytes()
    }

    pub fn make_unbind_message(&self, session: SessionIdent) -> Vec<u8> {
        format!("unbind {session}\n").into_bytes()
    }

    pub fn make_refresh_message(&self, session: SessionIdent, signed_user_token: &str) -> Vec<u8> {
        let mut out = format!("refresh {session} {}\n", signed_user_token.len()).into_bytes();
        out.extend_from_slice(signed_user_token.as_bytes());
        out
    }

    pub fn make_ping(&self, timestamp: i64, rtt: i64) -> Vec<u8> {
        format!("ping {timestamp} {rtt}\n").into_bytes()
    }
}

fn expect_exact(scanner: &Scanner<'_>, size: usize) -> Result<(), WireError> {
    if scanner.offset() == size {
        Ok(())
    } else {
        Err(WireError::BadSyntax)
    }
}

fn parse_error_body(code: i32, try_again: bool, body: &[u8]) -> ProtocolErrorInfo {
    let mut info = ProtocolErrorInfo::new(code, String::from_utf8_lossy(body).to_string(), try_again);
    if let Ok(json) = serde_json::from_slice::<JsonErrorBody>(body) {
        if let Some(message) = json.message {
            info.message = message;
        }
        if let Some(try_again) = json.try_again {
            info.try_again = try_again;
        }
        info.should_client_reset = json.should_client_reset;
        info.client_reset_recovery_is_disabled = json.recovery_mode_disabled.unwrap_or(false);
        info.log_url = json.log_url;
        info.compensating_writes = json.compensating_writes.unwrap_or_default();
    }
    info
}

fn parse_download_body(body: &Bytes) -> Result<Vec<RemoteChangeset>, WireError> {
    let mut changesets = Vec::new();
    let mut scanner = Scanner::new(body);
    while scanner.offset() < body.len() {
        let server_version = scanner.read_u64_bare()?;
        let client_version = scanner.read_u64()?;
        let origin_timestamp = scanner.read_u64()?;
        let origin_file_ident = scanner.read_u64()?;
        let original_changeset_size = scanner.read_u64()?;
        let changeset_size = scanner.read_u64()? as usize;
        scanner.expect_space().map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        let start = scanner.offset();
        let end = start.checked_add(changeset_size).ok_or(WireError::BadChangesetSize)?;
        if end > body.len() {
            tracing::error!("bad changeset size {end} > {}", body.len());
            return Err(WireError::BadChangesetSize);
        }
        if server_version == 0 {
            // A received changeset can never have version 0.
            tracing::error!("bad server version=0 in changeset header");
            return Err(WireError::BadServerVersion);
        }
        changesets.push(RemoteChangeset {
            remote_version: server_version,
            last_integrated_local_version: client_version,
            data: body.slice(start..end),
            origin_timestamp,
            origin_file_ident,
            original_changeset_size,
        });
        scanner.pos = end;
    }
    Ok(changesets)
}

/// Accumulates changesets and emits one UPLOAD message, compressing the body
/// when it pays off.
#[derive(Default)]
pub struct UploadMessageBuilder {
    body: Vec<u8>,
    num_changesets: usize,
}

impl UploadMessageBuilder {
    pub fn add_changeset(
        &mut self,
        client_version: Version,
        server_version: Version,
        origin_timestamp: Timestamp,
        origin_file_ident: FileIdent,
        changeset: &[u8],
    ) {
        self.body.extend_from_slice(
            format!(
                "{client_version} {server_version} {origin_timestamp} {origin_file_ident} {} ",
                changeset.len()
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(changeset);
        self.num_changesets += 1;
    }

    pub fn num_changesets(&self) -> usize {
        self.num_changesets
    }

    pub fn make_upload_message(
        self,
        session: SessionIdent,
        progress_client_version: Version,
        progress_server_version: Version,
        locked_server_version: Version,
    ) -> Vec<u8> {
        let uncompressed_size = self.body.len();
        let compressed = compress_body(&self.body);
        let use_compression = compressed.len() < uncompressed_size;
        let (is_compressed, compressed_size, body) = if use_compression {
            (1, compressed.len(), compressed)
        } else {
            (0, 0, self.body)
        };
        let mut out = format!(
            "upload {session} {is_compressed} {uncompressed_size} {compressed_size} \
             {progress_client_version} {progress_server_version} {locked_server_version}\n"
        )
        .into_bytes();
        out.extend_from_slice(&body);
        out
    }
}

// ---------------------------------------------------------------------------
// Server-side codec

/// Parses messages received by the server and builds messages it sends. Used
/// by the log-replay tooling and by loopback tests.
#[derive(Clone, Debug)]
pub struct ServerProtocol {
    pub max_body_size: usize,
}

impl Default for ServerProtocol {
    fn default() -> Self {
        ServerProtocol {
            max_body_size: sync_config::Parameters::default_max_message_body_size(),
        }
    }
}

impl ServerProtocol {
    const MAX_PATH_SIZE: usize = 1024;
    const MAX_USER_TOKEN_SIZE: usize = 2048;

    pub fn parse_message_received(&self, data: &[u8]) -> Result<ClientMessage, WireError> {
        let mut scanner = Scanner::new(data);
        let message_type = scanner.read_token()?;
        match message_type {
            "upload" => self.parse_upload(scanner, data),
            "bind" => {
                let session = scanner.read_u64()?;
                let path_size = scanner.read_u64()? as usize;
                let token_size = scanner.read_u64()? as usize;
                let need_client_file_ident = scanner.read_bool()?;
                let is_subserver = scanner.read_bool()?;
                scanner.expect_newline()?;
                let header_size = scanner.offset();
                if header_size + path_size + token_size != data.len() || path_size == 0 {
                    return Err(WireError::BadSyntax);
                }
                if path_size > Self::MAX_PATH_SIZE || token_size > Self::MAX_USER_TOKEN_SIZE {
                    return Err(WireError::LimitsExceeded);
                }
                let path = String::from_utf8(data[header_size..header_size + path_size].to_vec())
                    .map_err(|_| WireError::BadSyntax)?;
                let signed_user_token =
                    String::from_utf8(data[header_size + path_size..].to_vec())
                        .map_err(|_| WireError::BadSyntax)?;
                Ok(ClientMessage::Bind {
                    session,
                    path,
                    signed_user_token,
                    need_client_file_ident,
                    is_subserver,
                })
            }
            "ident" => {
                let session = scanner.read_u64()?;
                let ident = scanner.read_u64()?;
                let salt = scanner.read_i64()?;
                let scan_server_version = scanner.read_u64()?;
                let scan_client_version = scanner.read_u64()?;
                let latest_server_version = scanner.read_u64()?;
                let latest_salt = scanner.read_i64()?;
                scanner.expect_newline()?;
                expect_exact(&scanner, data.len())?;
                Ok(ClientMessage::Ident {
                    session,
                    client_file_ident: SaltedFileIdent::new(ident, salt),
                    scan_server_version,
                    scan_client_version,
                    latest_server_version: SaltedVersion::new(latest_server_version, latest_salt),
                })
            }
            "mark" => {
                let session = scanner.read_u64()?;
                let request_ident = scanner.read_u64()?;
                scanner.expect_newline()?;
                expect_exact(&scanner, data.len())?;
                Ok(ClientMessage::Mark {
                    session,
                    request_ident,
                })
            }
            "alloc" => {
                let session = scanner.read_u64()?;
                scanner.expect_newline()?;
                expect_exact(&scanner, data.len())?;
                Ok(ClientMessage::Alloc { session })
            }
            "unbind" => {
                let session = scanner.read_u64()?;
                scanner.expect_newline()?;
                expect_exact(&scanner, data.len())?;
                Ok(ClientMessage::Unbind { session })
            }
            "refresh" => {
                let session = scanner.read_u64()?;
                let token_size = scanner.read_u64()? as usize;
                scanner.expect_newline()?;
                let header_size = scanner.offset();
                if header_size + token_size != data.len() {
                    return Err(WireError::BadSyntax);
                }
                if token_size > Self::MAX_USER_TOKEN_SIZE {
                    return Err(WireError::LimitsExceeded);
                }
                let signed_user_token = String::from_utf8(data[header_size..].to_vec())
                    .map_err(|_| WireError::BadSyntax)?;
                Ok(ClientMessage::Refresh {
                    session,
                    signed_user_token,
                })
            }
            "ping" => {
                let timestamp = scanner.read_i64()?;
                let rtt = scanner.read_i64()?;
                scanner.expect_newline()?;
                expect_exact(&scanner, data.len())?;
                Ok(ClientMessage::Ping { timestamp, rtt })
            }
            other => {
                tracing::error!("unknown input message type '{other}'");
                Err(WireError::UnknownMessage)
            }
        }
    }

    fn parse_upload(
        &self,
        mut scanner: Scanner<'_>,
        data: &[u8],
    ) -> Result<ClientMessage, WireError> {
        let session = scanner.read_u64()?;
        let is_body_compressed = scanner.read_bool()?;
        let uncompressed_body_size = scanner.read_u64()? as usize;
        let compressed_body_size = scanner.read_u64()? as usize;
        let progress_client_version = scanner.read_u64()?;
        let progress_server_version = scanner.read_u64()?;
        let locked_server_version = scanner.read_u64()?;
        scanner.expect_newline()?;
        let header_size = scanner.offset();

        let body_size = if is_body_compressed {
            compressed_body_size
        } else {
            uncompressed_body_size
        };
        if header_size + body_size != data.len() {
            return Err(WireError::BadSyntax);
        }
        if uncompressed_body_size > self.max_body_size {
            return Err(WireError::LimitsExceeded);
        }

        let body = &data[header_size..];
        let body: Bytes = if is_body_compressed {
            decompress_body(body, uncompressed_body_size, self.max_body_size)?.into()
        } else {
            Bytes::copy_from_slice(body)
        };

        let mut changesets = Vec::new();
        let mut scanner = Scanner::new(&body);
        while scanner.offset() < body.len() {
            let client_version = scanner.read_u64_bare()?;
            let server_version = scanner.read_u64()?;
            let origin_timestamp = scanner.read_u64()?;
            let origin_file_ident = scanner.read_u64()?;
            let changeset_size = scanner.read_u64()? as usize;
            scanner
                .expect_space()
                .map_err(|_| WireError::BadChangesetHeaderSyntax)?;
            let start = scanner.offset();
            let end = start
                .checked_add(changeset_size)
                .ok_or(WireError::BadChangesetSize)?;
            if end > body.len() {
                return Err(WireError::BadChangesetSize);
            }
            changesets.push(UploadChangeset {
                upload_cursor: UploadCursor {
                    client_version,
                    last_integrated_server_version: server_version,
                },
                origin_timestamp,
                origin_file_ident,
                changeset: body.slice(start..end),
            });
            scanner.pos = end;
        }
        Ok(ClientMessage::Upload {
            session,
            progress_client_version,
            progress_server_version,
            locked_server_version,
            changesets,
        })
    }

    /// Build a DOWNLOAD message from pre-rendered changeset records.
    #[allow(clippy::too_many_arguments)]
    pub fn make_download_message(
        &self,
        session: SessionIdent,
        progress: &SyncProgress,
        downloadable_bytes: i64,
        body: &[u8],
        compress: bool,
    ) -> Vec<u8> {
        let uncompressed_size = body.len();
        let compressed;
        let (is_compressed, compressed_size, payload): (u8, usize, &[u8]) = if compress {
            compressed = compress_body(body);
            (1, compressed.len(), &compressed)
        } else {
            (0, 0, body)
        };
        let mut out = format!(
            "download {session} {} {} {} {} {} {} {downloadable_bytes} {is_compressed} \
             {compressed_size} {uncompressed_size}\n",
            progress.download.server_version,
            progress.download.last_integrated_client_version,
            progress.latest_server_version.version,
            progress.latest_server_version.salt,
            progress.upload.client_version,
            progress.upload.last_integrated_server_version,
        )
        .into_bytes();
        out.extend_from_slice(payload);
        out
    }

    /// Render one changeset record for a DOWNLOAD body.
    pub fn insert_single_changeset_download(
        body: &mut Vec<u8>,
        server_version: Version,
        client_version: Version,
        origin_timestamp: Timestamp,
        origin_file_ident: FileIdent,
        original_size: u64,
        changeset: &[u8],
    ) {
        body.extend_from_slice(
            format!(
                "{server_version} {client_version} {origin_timestamp} {origin_file_ident} \
                 {original_size} {} ",
                changeset.len()
            )
            .as_bytes(),
        );
        body.extend_from_slice(changeset);
    }

    pub fn make_ident_message(
        &self,
        session: SessionIdent,
        client_file_ident: FileIdent,
        salt: Salt,
    ) -> Vec<u8> {
        format!("ident {session} {client_file_ident} {salt}\n").into_bytes()
    }

    pub fn make_mark_message(&self, session: SessionIdent, request_ident: RequestIdent) -> Vec<u8> {
        format!("mark {session} {request_ident}\n").into_bytes()
    }

    pub fn make_error_message(
        &self,
        session: SessionIdent,
        error: ProtocolError,
        message: &str,
        try_again: bool,
    ) -> Vec<u8> {
        let mut out = format!(
            "error {} {} {} {session}\n",
            error.code(),
            message.len(),
            try_again as u8
        )
        .into_bytes();
        out.extend_from_slice(message.as_bytes());
        out
    }

    pub fn make_pong(&self, timestamp: i64) -> Vec<u8> {
        format!("pong {timestamp}\n").into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn download_decode_single_uncompressed_changeset() {
        let mut body = Vec::new();
        let changeset = vec![0xAB; 48];
        ServerProtocol::insert_single_changeset_download(&mut body, 1, 1, 10, 7, 48, &changeset);
        let header = format!("download 1 5 4 5 123456789 5 4 0 0 0 {}\n", body.len());
        let mut message = header.into_bytes();
        message.extend_from_slice(&body);

        let parsed = ClientProtocol::default()
            .parse_message_received(&message)
            .unwrap();
        let ServerMessage::Download {
            session,
            progress,
            downloadable_bytes,
            changesets,
        } = parsed
        else {
            panic!("expected a download message");
        };
        assert_eq!(session, 1);
        assert_eq!(progress.download.server_version, 5);
        assert_eq!(progress.download.last_integrated_client_version, 4);
        assert_eq!(progress.latest_server_version.version, 5);
        assert_eq!(progress.latest_server_version.salt, 123456789);
        assert_eq!(progress.upload.client_version, 5);
        assert_eq!(progress.upload.last_integrated_server_version, 4);
        assert_eq!(downloadable_bytes, 0);
        assert_eq!(changesets.len(), 1);
        let cs = &changesets[0];
        assert_eq!(cs.remote_version, 1);
        assert_eq!(cs.last_integrated_local_version, 1);
        assert_eq!(cs.origin_timestamp, 10);
        assert_eq!(cs.origin_file_ident, 7);
        assert_eq!(cs.original_changeset_size, 48);
        assert_eq!(cs.data.as_ref(), &changeset[..]);
    }

    #[test]
    fn download_round_trips_with_compression() {
        let mut body = Vec::new();
        for i in 1..=3u64 {
            let changeset = vec![i as u8; 100];
            ServerProtocol::insert_single_changeset_download(
                &mut body, i, 0, 42, 0, 100, &changeset,
            );
        }
        let progress = SyncProgress {
            latest_server_version: SaltedVersion::new(3, 9),
            download: DownloadCursor {
                server_version: 3,
                last_integrated_client_version: 0,
            },
            upload: UploadCursor::default(),
        };
        let message = ServerProtocol::default().make_download_message(7, &progress, 300, &body, true);
        let parsed = ClientProtocol::default()
            .parse_message_received(&message)
            .unwrap();
        let ServerMessage::Download { changesets, .. } = parsed else {
            panic!("expected a download message");
        };
        assert_eq!(changesets.len(), 3);
        assert_eq!(changesets[2].remote_version, 3);
        assert_eq!(changesets[2].data.as_ref(), &[3u8; 100][..]);
    }

    #[test]
    fn download_rejects_length_mismatches() {
        let message = b"download 1 5 4 5 1 5 4 0 0 0 10\nshort".to_vec();
        assert_eq!(
            ClientProtocol::default().parse_message_received(&message),
            Err(WireError::BadSyntax)
        );
    }

    #[test]
    fn download_rejects_changeset_overrun() {
        let mut body = Vec::new();
        body.extend_from_slice(b"1 1 0 0 10 99 ");
        body.extend_from_slice(&[0u8; 4]);
        let header = format!("download 1 1 0 1 0 0 0 0 0 0 {}\n", body.len());
        let mut message = header.into_bytes();
        message.extend_from_slice(&body);
        assert_eq!(
            ClientProtocol::default().parse_message_received(&message),
            Err(WireError::BadChangesetSize)
        );
    }

    #[test]
    fn download_rejects_server_version_zero() {
        let mut body = Vec::new();
        ServerProtocol::insert_single_changeset_download(&mut body, 0, 0, 0, 0, 4, &[1, 2, 3, 4]);
        let header = format!("download 1 1 0 1 0 0 0 0 0 0 {}\n", body.len());
        let mut message = header.into_bytes();
        message.extend_from_slice(&body);
        assert_eq!(
            ClientProtocol::default().parse_message_received(&message),
            Err(WireError::BadServerVersion)
        );
    }

    #[test]
    fn unknown_message_is_reported_not_thrown() {
        assert_eq!(
            ClientProtocol::default().parse_message_received(b"transmogrify 1\n"),
            Err(WireError::UnknownMessage)
        );
    }

    #[test]
    fn error_message_with_compensating_write_body() {
        let body = r#"{"message":"compensating write","compensatingWrites":[{"object":"Task","primary_key":42,"reason":"out of view"}]}"#;
        let message = ServerProtocol::default().make_error_message(
            3,
            ProtocolError::CompensatingWrite,
            body,
            true,
        );
        let parsed = ClientProtocol::default()
            .parse_message_received(&message)
            .unwrap();
        let ServerMessage::Error { session, info } = parsed else {
            panic!("expected an error message");
        };
        assert_eq!(session, 3);
        assert_eq!(info.error(), Some(ProtocolError::CompensatingWrite));
        assert!(info.try_again);
        assert_eq!(info.compensating_writes.len(), 1);
        let cw = &info.compensating_writes[0];
        assert_eq!(cw.object_name, "Task");
        assert_eq!(cw.primary_key, serde_json::json!(42));
        assert_eq!(cw.reason, "out of view");
        assert!(!info.error().unwrap().requires_suspend());
    }

    #[test]
    fn error_message_with_unknown_code_is_rejected() {
        let message = b"error 999 2 0 1\nhi".to_vec();
        assert_eq!(
            ClientProtocol::default().parse_message_received(&message),
            Err(WireError::BadErrorCode)
        );
    }

    #[test]
    fn upload_round_trip() {
        let mut builder = UploadMessageBuilder::default();
        builder.add_changeset(4, 2, 111, 0, b"payload-one");
        builder.add_changeset(5, 2, 112, 0, b"payload-two-longer");
        let message = builder.make_upload_message(9, 5, 2, 2);

        let parsed = ServerProtocol::default().parse_message_received(&message).unwrap();
        let ClientMessage::Upload {
            session,
            progress_client_version,
            locked_server_version,
            changesets,
            ..
        } = parsed
        else {
            panic!("expected an upload message");
        };
        assert_eq!(session, 9);
        assert_eq!(progress_client_version, 5);
        assert_eq!(locked_server_version, 2);
        assert_eq!(changesets.len(), 2);
        assert_eq!(changesets[0].upload_cursor.client_version, 4);
        assert_eq!(changesets[0].changeset.as_ref(), b"payload-one");
        assert_eq!(changesets[1].origin_timestamp, 112);
    }

    #[test]
    fn bind_and_refresh_round_trip() {
        let codec = ClientProtocol::default();
        let server = ServerProtocol::default();
        let bind = codec.make_bind_message(1, "/data/app", "token-abc", true, false);
        let parsed = server.parse_message_received(&bind).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Bind {
                session: 1,
                path: "/data/app".into(),
                signed_user_token: "token-abc".into(),
                need_client_file_ident: true,
                is_subserver: false,
            }
        );

        let refresh = codec.make_refresh_message(1, "token-def");
        let parsed = server.parse_message_received(&refresh).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Refresh {
                session: 1,
                signed_user_token: "token-def".into(),
            }
        );
    }

    #[test]
    fn control_messages_round_trip() {
        let client = ClientProtocol::default();
        let server = ServerProtocol::default();

        let ping = client.make_ping(12345, 20);
        assert_eq!(
            server.parse_message_received(&ping).unwrap(),
            ClientMessage::Ping {
                timestamp: 12345,
                rtt: 20
            }
        );

        let pong = server.make_pong(12345);
        assert_eq!(
            client.parse_message_received(&pong).unwrap(),
            ServerMessage::Pong { timestamp: 12345 }
        );

        let mark = server.make_mark_message(2, 8);
        assert_eq!(
            client.parse_message_received(&mark).unwrap(),
            ServerMessage::Mark {
                session: 2,
                request_ident: 8
            }
        );

        let ident = server.make_ident_message(2, 77, -5);
        assert_eq!(
            client.parse_message_received(&ident).unwrap(),
            ServerMessage::Ident {
                session: 2,
                client_file_ident: SaltedFileIdent::new(77, -5),
            }
        );
    }

    #[test]
    fn websocket_subprotocol_names_embed_the_version() {
        assert_eq!(pbs_websocket_subprotocol(), "com.mongodb.realm-sync/6");
        assert_eq!(
            flx_websocket_subprotocol(),
            "com.mongodb.realm-query-sync/6"
        );
    }
}
