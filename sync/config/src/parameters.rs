// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Operational configuration of one synchronized database.
///
/// None of these fields affect the wire protocol or the persisted history
/// format; peers with different settings interoperate. Fields that do change
/// persisted or wire behavior belong in the protocol version instead.
///
/// NOTE: default values should make sense, so most operators should not need
/// to specify any field.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    /// Byte budget for one upload scan. The scan stops once the combined
    /// changeset size crosses this limit, but always emits at least one
    /// eligible changeset.
    #[serde(default = "Parameters::default_upload_scan_byte_budget")]
    pub upload_scan_byte_budget: u64,

    /// Byte budget used when peeking staged bootstrap batches for
    /// integration. At least one batch is always returned when any exists.
    #[serde(default = "Parameters::default_bootstrap_peek_byte_budget")]
    pub bootstrap_peek_byte_budget: u64,

    /// Stored history entries larger than this are compressed in place.
    #[serde(default = "Parameters::default_history_compression_threshold")]
    pub history_compression_threshold: usize,

    /// Upper bound for the uncompressed body of one inbound wire message.
    #[serde(default = "Parameters::default_max_message_body_size")]
    pub max_message_body_size: usize,

    /// How long the notification worker sleeps when idle before re-checking
    /// for missed commit signals.
    #[serde(default = "Parameters::default_worker_idle_wait")]
    pub worker_idle_wait: Duration,

    /// The database path. The path should be provided in order for the node
    /// to be able to boot.
    pub db_path: Option<PathBuf>,
}

impl Parameters {
    pub fn default_upload_scan_byte_budget() -> u64 {
        128 * 1024
    }

    pub fn default_bootstrap_peek_byte_budget() -> u64 {
        1024 * 1024
    }

    pub fn default_history_compression_threshold() -> usize {
        1024
    }

    pub fn default_max_message_body_size() -> usize {
        16 * 1024 * 1024
    }

    pub fn default_worker_idle_wait() -> Duration {
        Duration::from_millis(500)
    }

    pub fn db_path_str_unsafe(&self) -> String {
        self.db_path
            .clone()
            .expect("DB path is not set")
            .as_path()
            .to_str()
            .unwrap()
            .to_string()
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            upload_scan_byte_budget: Parameters::default_upload_scan_byte_budget(),
            bootstrap_peek_byte_budget: Parameters::default_bootstrap_peek_byte_budget(),
            history_compression_threshold: Parameters::default_history_compression_threshold(),
            max_message_body_size: Parameters::default_max_message_body_size(),
            worker_idle_wait: Parameters::default_worker_idle_wait(),
            db_path: None,
        }
    }
}
