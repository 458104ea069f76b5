// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use sync_config::Parameters;

#[test]
fn defaults_fill_missing_fields() {
    let parameters: Parameters = serde_json::from_str("{}").unwrap();
    let defaults = Parameters::default();
    assert_eq!(
        parameters.upload_scan_byte_budget,
        defaults.upload_scan_byte_budget
    );
    assert_eq!(
        parameters.bootstrap_peek_byte_budget,
        defaults.bootstrap_peek_byte_budget
    );
    assert_eq!(
        parameters.history_compression_threshold,
        defaults.history_compression_threshold
    );
    assert_eq!(parameters.worker_idle_wait, defaults.worker_idle_wait);
    assert!(parameters.db_path.is_none());
}

#[test]
fn explicit_fields_survive_round_trip() {
    let parameters = Parameters {
        upload_scan_byte_budget: 42,
        db_path: Some("/tmp/sync.db".into()),
        ..Parameters::default()
    };
    let encoded = serde_json::to_string(&parameters).unwrap();
    let decoded: Parameters = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded.upload_scan_byte_budget, 42);
    assert_eq!(decoded.db_path, parameters.db_path);
}
