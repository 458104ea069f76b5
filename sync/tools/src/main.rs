// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Replays a captured client message log against a fresh database file.
//!
//! The input is the textual trace a sync client writes at trace level: a
//! sequence of `Received: IDENT(...)`, `Received: DOWNLOAD(...)` and
//! `Received: DOWNLOAD CHANGESET(...)` records with `key=value` argument
//! lists, each changeset followed by its payload as a hex dump or as
//! `Compressed: <size> <base64>`. Replaying the log reproduces the state the
//! client reached, which is the quickest way to investigate an integration
//! failure reported from the field.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use bytes::Bytes;
use clap::Parser;
use sync_core::{
    ClientHistory, Database, PassthroughTransformer, PendingBootstrapStore, RemoteChangeset,
};
use sync_types::{
    DownloadBatchState, DownloadCursor, DownloadableProgress, SaltedFileIdent, SaltedVersion,
    SyncProgress, UploadCursor,
};

#[derive(Parser, Debug)]
#[command(
    name = "apply-from-log",
    about = "Apply a captured sync message log to a database file"
)]
struct Args {
    /// Database file to apply the log to.
    #[arg(short = 'r', long = "realm")]
    realm_path: PathBuf,

    /// Input message log.
    #[arg(short = 'i', long = "input")]
    input_path: PathBuf,

    /// Encryption key file.
    #[arg(short = 'e', long = "encryption-key")]
    encryption_key_path: Option<PathBuf>,

    /// Use subscription-based (FLX) protocol framing: stage each download as
    /// a bootstrap batch before integrating.
    #[arg(short = 'f', long = "flx")]
    flx: bool,

    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let filter = if args.verbose { "trace" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("apply-from-log: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), String> {
    if let Some(key_path) = &args.encryption_key_path {
        // The key only gates file access; validate it is readable.
        std::fs::read(key_path)
            .map_err(|e| format!("cannot read encryption key {}: {e}", key_path.display()))?;
    }
    let input = std::fs::read_to_string(&args.input_path)
        .map_err(|e| format!("cannot read input log {}: {e}", args.input_path.display()))?;

    let db = Database::open(&args.realm_path);
    let history = ClientHistory::new(db.clone(), &sync_config::Parameters::default())
        .map_err(|e| e.to_string())?;
    let bootstraps = if args.flx {
        Some(PendingBootstrapStore::new(db.clone()).map_err(|e| e.to_string())?)
    } else {
        None
    };

    let records = parse_log(&input)?;
    let mut pending: Vec<RemoteChangeset> = Vec::new();
    let mut downloads = 0usize;
    let mut applied = 0usize;

    for record in records {
        match record {
            LogRecord::Ident { file_ident, salt } => {
                tracing::info!(file_ident, "assigning client file ident from log");
                history
                    .set_client_file_ident(SaltedFileIdent::new(file_ident, salt))
                    .map_err(|e| e.to_string())?;
            }
            LogRecord::DownloadChangeset(changeset) => pending.push(changeset),
            LogRecord::Download { progress, query_version } => {
                downloads += 1;
                applied += pending.len();
                let changesets = std::mem::take(&mut pending);
                tracing::debug!(
                    count = changesets.len(),
                    server_version = progress.download.server_version,
                    "integrating download message"
                );
                if let Some(store) = &bootstraps {
                    store
                        .add_batch(
                            query_version,
                            Some(&progress),
                            DownloadableProgress::default(),
                            &changesets,
                        )
                        .map_err(|e| e.to_string())?;
                    let batch = store.peek_pending(u64::MAX).map_err(|e| e.to_string())?;
                    let mut tr = db.start_write().map_err(|e| e.to_string())?;
                    store
                        .pop_front_pending(&mut tr, batch.changesets.len())
                        .map_err(|e| e.to_string())?;
                    history
                        .integrate_server_changesets(
                            &progress,
                            None,
                            &batch.changesets,
                            DownloadBatchState::LastInBatch,
                            &PassthroughTransformer,
                            &mut tr,
                            None,
                        )
                        .map_err(|e| e.to_string())?;
                } else {
                    let mut tr = db.start_write().map_err(|e| e.to_string())?;
                    history
                        .integrate_server_changesets(
                            &progress,
                            None,
                            &changesets,
                            DownloadBatchState::LastInBatch,
                            &PassthroughTransformer,
                            &mut tr,
                            None,
                        )
                        .map_err(|e| e.to_string())?;
                }
            }
        }
    }
    if !pending.is_empty() {
        return Err(format!(
            "{} changeset records were not followed by a DOWNLOAD header",
            pending.len()
        ));
    }

    let (version, ident, progress) = history.get_status().map_err(|e| e.to_string())?;
    tracing::info!(
        downloads,
        applied,
        client_version = version,
        client_file_ident = ident.ident,
        download_server_version = progress.download.server_version,
        "log applied"
    );
    Ok(())
}

enum LogRecord {
    Ident {
        file_ident: u64,
        salt: i64,
    },
    Download {
        progress: SyncProgress,
        query_version: i64,
    },
    DownloadChangeset(RemoteChangeset),
}

/// Parse a `key=value, key=value` argument list inside parentheses.
fn parse_args(text: &str) -> Result<HashMap<String, i64>, String> {
    let open = text.find('(').ok_or("'(' not found")?;
    let close = text[open..]
        .find(')')
        .map(|i| open + i)
        .ok_or("')' not found")?;
    let mut values = HashMap::new();
    for part in text[open + 1..close].split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| format!("malformed argument '{part}'"))?;
        let value = match value.trim() {
            "true" => 1,
            "false" => 0,
            v => v
                .parse::<i64>()
                .map_err(|_| format!("malformed value in '{part}'"))?,
        };
        values.insert(key.trim().to_string(), value);
    }
    Ok(values)
}

fn changeset_hex_to_binary(hex_text: &str, expected_size: usize) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(expected_size);
    for token in hex_text.split_whitespace() {
        out.push(u8::from_str_radix(token, 16).map_err(|_| format!("bad hex byte '{token}'"))?);
    }
    if out.len() != expected_size {
        return Err(format!(
            "changeset length is {expected_size} but buffer size is {}",
            out.len()
        ));
    }
    Ok(out)
}

fn changeset_compressed_to_binary(text: &str) -> Result<Vec<u8>, String> {
    use base64::Engine as _;
    let (size, encoded) = text
        .trim()
        .split_once(' ')
        .ok_or("compressed changeset needs '<size> <base64>'")?;
    let decompressed_size: usize = size.parse().map_err(|_| "bad decompressed size")?;
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("invalid base64 value: {e}"))?;
    let mut out = Vec::with_capacity(decompressed_size);
    flate2::read::ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut out)
        .map_err(|e| format!("inflate: {e}"))?;
    if out.len() != decompressed_size {
        return Err("decompressed size mismatch".into());
    }
    Ok(out)
}

fn parse_log(input: &str) -> Result<Vec<LogRecord>, String> {
    let mut records = Vec::new();
    let mut lines = input.lines().peekable();
    while let Some(line) = lines.next() {
        if let Some(pos) = line.find("Received: DOWNLOAD CHANGESET") {
            let values = parse_args(&line[pos..])?;
            let changeset_size = *values.get("changeset_size").unwrap_or(&0) as usize;
            // The payload follows on the next matching line.
            let mut data: Option<Vec<u8>> = None;
            for payload in lines.by_ref() {
                if let Some(hex_pos) = payload.find("Changeset:") {
                    data = Some(changeset_hex_to_binary(
                        &payload[hex_pos + "Changeset:".len()..],
                        changeset_size,
                    )?);
                    break;
                }
                if let Some(comp_pos) = payload.find("Changeset(comp):") {
                    data = Some(changeset_compressed_to_binary(
                        &payload[comp_pos + "Changeset(comp):".len()..],
                    )?);
                    break;
                }
            }
            let data = data.ok_or("changeset record without payload")?;
            records.push(LogRecord::DownloadChangeset(RemoteChangeset {
                remote_version: *values.get("server_version").unwrap_or(&0) as u64,
                last_integrated_local_version: *values.get("client_version").unwrap_or(&0) as u64,
                origin_timestamp: *values.get("origin_timestamp").unwrap_or(&0) as u64,
                origin_file_ident: *values.get("origin_file_ident").unwrap_or(&0) as u64,
                original_changeset_size: *values.get("original_changeset_size").unwrap_or(&0)
                    as u64,
                data: Bytes::from(data),
            }));
        } else if let Some(pos) = line.find("Received: DOWNLOAD(") {
            let values = parse_args(&line[pos..])?;
            let get = |key: &str| *values.get(key).unwrap_or(&0);
            records.push(LogRecord::Download {
                progress: SyncProgress {
                    latest_server_version: SaltedVersion::new(
                        get("latest_server_version") as u64,
                        get("latest_server_version_salt"),
                    ),
                    download: DownloadCursor {
                        server_version: get("download_server_version") as u64,
                        last_integrated_client_version: get("download_client_version") as u64,
                    },
                    upload: UploadCursor {
                        client_version: get("upload_client_version") as u64,
                        last_integrated_server_version: get("upload_server_version") as u64,
                    },
                },
                query_version: get("query_version"),
            });
        } else if let Some(pos) = line.find("Received: IDENT(") {
            let values = parse_args(&line[pos..])?;
            records.push(LogRecord::Ident {
                file_ident: *values.get("client_file_ident").unwrap_or(&0) as u64,
                salt: *values.get("client_file_ident_salt").unwrap_or(&0),
            });
        }
    }
    Ok(records)
}
