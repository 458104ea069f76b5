// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable queue of protocol errors whose delivery waits for the client to
//! reach a given server version. Compensating-write errors are the main
//! tenant: the server reports them against a version the client has not yet
//! integrated, and surfacing them early would describe state the application
//! cannot observe yet.

use std::time::Duration;

use sync_types::Version;

use crate::{
    changeset::Value,
    error::{CoreError, CoreResult},
    protocol::{CompensatingWriteErrorInfo, ProtocolErrorInfo, ResumptionDelayInfo},
    storage::Database,
    sync_metadata::{
        create_or_load_schema, schema_groups, MetadataColumnSpec, MetadataTableSpec, ResolvedSchema,
    },
    transaction::Transaction,
};
use sync_types::{ColumnType, ObjKey};

const SCHEMA_VERSION: i64 = 1;

const ERRORS_TABLE: &str = "flx_pending_errors";
const REJECTED_UPDATES_TABLE: &str = "flx_pending_errors_rejected_updates";

const COL_PENDING_UNTIL: &str = "pending_until_server_version";
const COL_CODE: &str = "code";
const COL_MESSAGE: &str = "message";
const COL_LOG_URL: &str = "log_url";
const COL_RECOVERY_DISABLED: &str = "recovery_mode_disabled";
const COL_TRY_AGAIN: &str = "try_again";
const COL_SHOULD_CLIENT_RESET: &str = "should_client_reset";
const COL_REJECTED_UPDATES: &str = "rejected_updates";
const COL_MAX_RESUMPTION_DELAY: &str = "max_resumption_delay_secs";
const COL_RESUMPTION_DELAY: &str = "resumption_delay_interval_secs";
const COL_RESUMPTION_MULTIPLIER: &str = "resumption_delay_multiplier";

const COL_RU_REASON: &str = "reason";
const COL_RU_PRIMARY_KEY: &str = "primary_key";
const COL_RU_TABLE: &str = "table";

fn error_specs() -> Vec<MetadataTableSpec> {
    vec![
        MetadataTableSpec {
            name: ERRORS_TABLE,
            columns: vec![
                MetadataColumnSpec::new(COL_PENDING_UNTIL, ColumnType::Int),
                MetadataColumnSpec::new(COL_CODE, ColumnType::Int),
                MetadataColumnSpec::new(COL_MESSAGE, ColumnType::String),
                MetadataColumnSpec::nullable(COL_LOG_URL, ColumnType::String),
                MetadataColumnSpec::new(COL_RECOVERY_DISABLED, ColumnType::Bool),
                MetadataColumnSpec::new(COL_TRY_AGAIN, ColumnType::Bool),
                MetadataColumnSpec::nullable(COL_SHOULD_CLIENT_RESET, ColumnType::Bool),
                MetadataColumnSpec::link_list(COL_REJECTED_UPDATES, REJECTED_UPDATES_TABLE),
                MetadataColumnSpec::new(COL_MAX_RESUMPTION_DELAY, ColumnType::Int),
                MetadataColumnSpec::nullable(COL_RESUMPTION_DELAY, ColumnType::Int),
                MetadataColumnSpec::new(COL_RESUMPTION_MULTIPLIER, ColumnType::Int),
            ],
        },
        MetadataTableSpec {
            name: REJECTED_UPDATES_TABLE,
            columns: vec![
                MetadataColumnSpec::new(COL_RU_REASON, ColumnType::String),
                MetadataColumnSpec::new(COL_RU_PRIMARY_KEY, ColumnType::String),
                MetadataColumnSpec::new(COL_RU_TABLE, ColumnType::String),
            ],
        },
    ]
}

pub struct PendingErrorStore {
    db: Database,
    tables: ResolvedSchema,
}

impl PendingErrorStore {
    pub fn new(db: Database) -> CoreResult<PendingErrorStore> {
        let mut tr = db.start_read(None)?;
        let tables = create_or_load_schema(
            &mut tr,
            schema_groups::PENDING_ERRORS,
            SCHEMA_VERSION,
            &error_specs(),
        )?;
        drop(tr);
        Ok(PendingErrorStore { db, tables })
    }

    /// Persist an error for delivery once the client reaches
    /// `pending_until_server_version`.
    pub fn track_pending_error(&self, info: &ProtocolErrorInfo) -> CoreResult<()> {
        let pending_until = info.pending_until_server_version.ok_or(
            CoreError::InvalidTransaction("a pending error needs a deferral version"),
        )?;
        let errors = &self.tables[ERRORS_TABLE];
        let rejected = &self.tables[REJECTED_UPDATES_TABLE];

        let mut tr = self.db.start_write()?;
        let row = tr.create_object(errors.table)?;
        tr.set_value(
            errors.table,
            row,
            errors.col(COL_PENDING_UNTIL),
            Value::Int(pending_until as i64),
        )?;
        tr.set_value(
            errors.table,
            row,
            errors.col(COL_CODE),
            Value::Int(info.raw_error_code as i64),
        )?;
        tr.set_value(
            errors.table,
            row,
            errors.col(COL_MESSAGE),
            Value::String(info.message.clone()),
        )?;
        if let Some(url) = &info.log_url {
            tr.set_value(
                errors.table,
                row,
                errors.col(COL_LOG_URL),
                Value::String(url.clone()),
            )?;
        }
        tr.set_value(
            errors.table,
            row,
            errors.col(COL_RECOVERY_DISABLED),
            Value::Bool(info.client_reset_recovery_is_disabled),
        )?;
        tr.set_value(
            errors.table,
            row,
            errors.col(COL_TRY_AGAIN),
            Value::Bool(info.try_again),
        )?;
        if let Some(reset) = info.should_client_reset {
            tr.set_value(
                errors.table,
                row,
                errors.col(COL_SHOULD_CLIENT_RESET),
                Value::Bool(reset),
            )?;
        }
        let delay = info.resumption_delay_interval.unwrap_or_default();
        tr.set_value(
            errors.table,
            row,
            errors.col(COL_MAX_RESUMPTION_DELAY),
            Value::Int(delay.max_resumption_delay_interval.as_secs() as i64),
        )?;
        if info.resumption_delay_interval.is_some() {
            tr.set_value(
                errors.table,
                row,
                errors.col(COL_RESUMPTION_DELAY),
                Value::Int(delay.resumption_delay_interval.as_secs() as i64),
            )?;
        }
        tr.set_value(
            errors.table,
            row,
            errors.col(COL_RESUMPTION_MULTIPLIER),
            Value::Int(delay.resumption_delay_backoff_multiplier as i64),
        )?;

        for (index, write) in info.compensating_writes.iter().enumerate() {
            let ru = tr.create_object(rejected.table)?;
            tr.set_value(
                rejected.table,
                ru,
                rejected.col(COL_RU_REASON),
                Value::String(write.reason.clone()),
            )?;
            tr.set_value(
                rejected.table,
                ru,
                rejected.col(COL_RU_PRIMARY_KEY),
                Value::String(write.primary_key.to_string()),
            )?;
            tr.set_value(
                rejected.table,
                ru,
                rejected.col(COL_RU_TABLE),
                Value::String(write.object_name.clone()),
            )?;
            tr.list_insert(
                errors.table,
                row,
                errors.col(COL_REJECTED_UPDATES),
                index,
                Value::Link(ru),
            )?;
        }
        tr.commit()?;
        tracing::debug!(
            code = info.raw_error_code,
            pending_until,
            "tracked pending protocol error"
        );
        Ok(())
    }

    /// Errors whose deferral version is at or below `before_server_version`,
    /// sorted by that version descending.
    pub fn peek_pending_errors(
        &self,
        tr: &Transaction,
        before_server_version: Version,
    ) -> CoreResult<Vec<ProtocolErrorInfo>> {
        let errors = &self.tables[ERRORS_TABLE];
        let rejected = &self.tables[REJECTED_UPDATES_TABLE];
        let table = tr.table(errors.table)?;
        let mut rows: Vec<(Version, ObjKey)> = table
            .objects
            .iter()
            .filter_map(|(key, obj)| {
                let version = obj
                    .value(errors.col(COL_PENDING_UNTIL))
                    .and_then(Value::as_int)? as Version;
                (version <= before_server_version).then_some((version, *key))
            })
            .collect();
        rows.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut out = Vec::with_capacity(rows.len());
        for (version, key) in rows {
            let obj = tr.object(errors.table, key)?;
            let get_str = |col: &str| {
                obj.value(errors.col(col))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            let mut info = ProtocolErrorInfo::new(
                obj.value(errors.col(COL_CODE))
                    .and_then(Value::as_int)
                    .unwrap_or(0) as i32,
                get_str(COL_MESSAGE).unwrap_or_default(),
                obj.value(errors.col(COL_TRY_AGAIN))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            );
            info.pending_until_server_version = Some(version);
            info.log_url = get_str(COL_LOG_URL);
            info.client_reset_recovery_is_disabled = obj
                .value(errors.col(COL_RECOVERY_DISABLED))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            info.should_client_reset = obj
                .value(errors.col(COL_SHOULD_CLIENT_RESET))
                .and_then(Value::as_bool);
            if let Some(delay_secs) = obj
                .value(errors.col(COL_RESUMPTION_DELAY))
                .and_then(Value::as_int)
            {
                info.resumption_delay_interval = Some(ResumptionDelayInfo {
                    resumption_delay_interval: Duration::from_secs(delay_secs as u64),
                    max_resumption_delay_interval: Duration::from_secs(
                        obj.value(errors.col(COL_MAX_RESUMPTION_DELAY))
                            .and_then(Value::as_int)
                            .unwrap_or(0) as u64,
                    ),
                    resumption_delay_backoff_multiplier: obj
                        .value(errors.col(COL_RESUMPTION_MULTIPLIER))
                        .and_then(Value::as_int)
                        .unwrap_or(1) as i32,
                });
            }
            for link in obj.list(errors.col(COL_REJECTED_UPDATES)).unwrap_or(&[]) {
                let Some(ru_key) = link.as_link() else {
                    continue;
                };
                let ru = tr.object(rejected.table, ru_key)?;
                let field = |col: &str| {
                    ru.value(rejected.col(col))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                info.compensating_writes.push(CompensatingWriteErrorInfo {
                    object_name: field(COL_RU_TABLE),
                    primary_key: serde_json::from_str(&field(COL_RU_PRIMARY_KEY))
                        .unwrap_or(serde_json::Value::Null),
                    reason: field(COL_RU_REASON),
                });
            }
            out.push(info);
        }
        Ok(out)
    }

    /// Drop delivered errors at or below `before_server_version`.
    pub fn remove_pending_errors(&self, before_server_version: Version) -> CoreResult<()> {
        let errors = &self.tables[ERRORS_TABLE];
        let rejected = &self.tables[REJECTED_UPDATES_TABLE];
        let mut tr = self.db.start_write()?;
        let targets: Vec<ObjKey> = tr
            .table(errors.table)?
            .objects
            .iter()
            .filter_map(|(key, obj)| {
                let version = obj
                    .value(errors.col(COL_PENDING_UNTIL))
                    .and_then(Value::as_int)? as Version;
                (version <= before_server_version).then_some(*key)
            })
            .collect();
        if targets.is_empty() {
            tr.rollback()?;
            return Ok(());
        }
        for key in targets {
            let links: Vec<ObjKey> = tr
                .object(errors.table, key)?
                .list(errors.col(COL_REJECTED_UPDATES))
                .unwrap_or(&[])
                .iter()
                .filter_map(Value::as_link)
                .collect();
            for link in links {
                tr.erase_object(rejected.table, link)?;
            }
            tr.erase_object(errors.table, key)?;
        }
        tr.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolError;

    fn open(name: &str) -> (Database, PendingErrorStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.into_path().join(name));
        let store = PendingErrorStore::new(db.clone()).unwrap();
        (db, store)
    }

    fn pending_error(version: Version) -> ProtocolErrorInfo {
        let mut info = ProtocolErrorInfo::new(
            ProtocolError::CompensatingWrite.code(),
            format!("deferred to {version}"),
            true,
        );
        info.pending_until_server_version = Some(version);
        info.compensating_writes.push(CompensatingWriteErrorInfo {
            object_name: "Task".into(),
            primary_key: serde_json::json!(42),
            reason: "out of view".into(),
        });
        info
    }

    #[test]
    fn errors_wait_for_their_server_version() {
        let (db, store) = open("deferred.db");
        store.track_pending_error(&pending_error(5)).unwrap();
        store.track_pending_error(&pending_error(9)).unwrap();

        let tr = db.start_read(None).unwrap();
        assert!(store.peek_pending_errors(&tr, 4).unwrap().is_empty());
        let ready = store.peek_pending_errors(&tr, 5).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].pending_until_server_version, Some(5));

        let all = store.peek_pending_errors(&tr, 10).unwrap();
        // Sorted by deferral version, descending.
        assert_eq!(
            all.iter()
                .map(|e| e.pending_until_server_version.unwrap())
                .collect::<Vec<_>>(),
            vec![9, 5]
        );
        let cw = &all[0].compensating_writes;
        assert_eq!(cw.len(), 1);
        assert_eq!(cw[0].object_name, "Task");
        assert_eq!(cw[0].primary_key, serde_json::json!(42));
        assert_eq!(cw[0].reason, "out of view");
    }

    #[test]
    fn delivered_errors_are_removed() {
        let (db, store) = open("removed.db");
        store.track_pending_error(&pending_error(3)).unwrap();
        store.track_pending_error(&pending_error(8)).unwrap();
        store.remove_pending_errors(3).unwrap();

        let tr = db.start_read(None).unwrap();
        let rest = store.peek_pending_errors(&tr, 100).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].pending_until_server_version, Some(8));
    }

    #[test]
    fn errors_survive_reopen() {
        let (db, store) = open("persist.db");
        store.track_pending_error(&pending_error(2)).unwrap();
        drop(store);

        let store = PendingErrorStore::new(db.clone()).unwrap();
        let tr = db.start_read(None).unwrap();
        assert_eq!(store.peek_pending_errors(&tr, 2).unwrap().len(), 1);
    }

    #[test]
    fn tracking_requires_a_deferral_version() {
        let (_db, store) = open("no-version.db");
        let info = ProtocolErrorInfo::new(201, "nope", false);
        assert!(matches!(
            store.track_pending_error(&info),
            Err(CoreError::InvalidTransaction(_))
        ));
    }
}
