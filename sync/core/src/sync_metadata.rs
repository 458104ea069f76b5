// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Declarative schema for the tables the sync client keeps inside the user's
//! database file.
//!
//! Stores describe their tables once; on open the description is either
//! created (inside a write transaction) or validated against what is already
//! in the file. Each group of tables records its own schema version in the
//! `flx_metadata` table, and a file carrying a different version than the
//! running code refuses to open rather than migrating silently.

use std::collections::HashMap;

use sync_types::{ColKey, ColumnType, TableKey};

use crate::{
    changeset::Value,
    error::{CoreError, CoreResult},
    transaction::Transaction,
};

pub const METADATA_TABLE: &str = "flx_metadata";
const METADATA_GROUP_COL: &str = "schema_group";
const METADATA_VERSION_COL: &str = "schema_version";

pub mod schema_groups {
    pub const SUBSCRIPTION_STORE: &str = "flx_subscription_store";
    pub const PENDING_BOOTSTRAPS: &str = "pending_bootstraps";
    pub const PENDING_ERRORS: &str = "pending_errors";
}

#[derive(Clone, Debug)]
pub struct MetadataColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    /// Name of the target table for link and link-list columns.
    pub target: Option<&'static str>,
}

impl MetadataColumnSpec {
    pub fn new(name: &'static str, ty: ColumnType) -> MetadataColumnSpec {
        MetadataColumnSpec {
            name,
            ty,
            nullable: false,
            target: None,
        }
    }

    pub fn nullable(name: &'static str, ty: ColumnType) -> MetadataColumnSpec {
        MetadataColumnSpec {
            name,
            ty,
            nullable: true,
            target: None,
        }
    }

    pub fn link(name: &'static str, target: &'static str) -> MetadataColumnSpec {
        MetadataColumnSpec {
            name,
            ty: ColumnType::Link,
            nullable: true,
            target: Some(target),
        }
    }

    pub fn link_list(name: &'static str, target: &'static str) -> MetadataColumnSpec {
        MetadataColumnSpec {
            name,
            ty: ColumnType::LinkList,
            nullable: false,
            target: Some(target),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MetadataTableSpec {
    pub name: &'static str,
    pub columns: Vec<MetadataColumnSpec>,
}

/// Key handles for one created/loaded metadata table.
#[derive(Clone, Debug)]
pub struct ResolvedTable {
    pub table: TableKey,
    columns: HashMap<&'static str, ColKey>,
}

impl ResolvedTable {
    pub fn col(&self, name: &str) -> ColKey {
        self.columns[name]
    }
}

pub type ResolvedSchema = HashMap<&'static str, ResolvedTable>;

/// Read the stored schema version for `group`, if any.
pub fn schema_version_for(tr: &Transaction, group: &str) -> CoreResult<Option<i64>> {
    let Some(meta) = tr.table_by_name(METADATA_TABLE)? else {
        return Ok(None);
    };
    let group_col = meta
        .schema
        .column_by_name(METADATA_GROUP_COL)
        .ok_or_else(|| CoreError::SchemaMismatch("flx_metadata is malformed".into()))?
        .key;
    let version_col = meta
        .schema
        .column_by_name(METADATA_VERSION_COL)
        .ok_or_else(|| CoreError::SchemaMismatch("flx_metadata is malformed".into()))?
        .key;
    for obj in meta.objects.values() {
        if let Some(Value::String(name)) = obj.value(group_col) {
            if name == group {
                if let Some(Value::Int(version)) = obj.value(version_col) {
                    return Ok(Some(*version));
                }
            }
        }
    }
    Ok(None)
}

/// Create or validate the tables of one schema group.
///
/// The transaction must be in the Reading stage; if creation is needed it is
/// promoted, committed and continued as read.
pub fn create_or_load_schema(
    tr: &mut Transaction,
    group: &'static str,
    version: i64,
    specs: &[MetadataTableSpec],
) -> CoreResult<ResolvedSchema> {
    match schema_version_for(tr, group)? {
        Some(found) if found > version => Err(CoreError::UnsupportedMetadataSchema {
            group,
            found,
            supported: version,
        }),
        Some(found) if found < version => {
            // Older groups would need a migration, and none is defined.
            Err(CoreError::SchemaMismatch(format!(
                "metadata schema version {found} for group '{group}' predates the supported \
                 version {version} and no migration is defined"
            )))
        }
        Some(_) => load_schema(tr, specs),
        None => {
            tr.promote_to_write(None)?;
            let resolved = create_schema(tr, specs)?;
            record_schema_version(tr, group, version)?;
            tr.commit_and_continue_as_read()?;
            Ok(resolved)
        }
    }
}

fn record_schema_version(tr: &mut Transaction, group: &str, version: i64) -> CoreResult<()> {
    let existing = tr.table_by_name(METADATA_TABLE)?.map(|meta| {
        let group_col = meta
            .schema
            .column_by_name(METADATA_GROUP_COL)
            .expect("flx_metadata created by this module")
            .key;
        let version_col = meta
            .schema
            .column_by_name(METADATA_VERSION_COL)
            .expect("flx_metadata created by this module")
            .key;
        (meta.schema.key, group_col, version_col)
    });
    let (meta, group_col, version_col) = match existing {
        Some(keys) => keys,
        None => {
            let meta = tr.add_table(METADATA_TABLE)?;
            let group_col =
                tr.add_column(meta, METADATA_GROUP_COL, ColumnType::String, false, None)?;
            let version_col =
                tr.add_column(meta, METADATA_VERSION_COL, ColumnType::Int, false, None)?;
            (meta, group_col, version_col)
        }
    };
    let obj = tr.create_object(meta)?;
    tr.set_value(meta, obj, group_col, Value::String(group.to_string()))?;
    tr.set_value(meta, obj, version_col, Value::Int(version))?;
    Ok(())
}

fn create_schema(tr: &mut Transaction, specs: &[MetadataTableSpec]) -> CoreResult<ResolvedSchema> {
    // Tables first so links can resolve their targets in one pass.
    let mut tables: HashMap<&'static str, TableKey> = HashMap::new();
    for spec in specs {
        tables.insert(spec.name, tr.add_table(spec.name)?);
    }
    let mut resolved = ResolvedSchema::new();
    for spec in specs {
        let table = tables[spec.name];
        let mut columns = HashMap::new();
        for col in &spec.columns {
            let target = match col.target {
                Some(name) => Some(*tables.get(name).ok_or_else(|| {
                    CoreError::SchemaMismatch(format!("unknown link target table '{name}'"))
                })?),
                None => None,
            };
            let key = tr.add_column(table, col.name, col.ty, col.nullable, target)?;
            columns.insert(col.name, key);
        }
        resolved.insert(spec.name, ResolvedTable { table, columns });
    }
    Ok(resolved)
}

fn load_schema(tr: &Transaction, specs: &[MetadataTableSpec]) -> CoreResult<ResolvedSchema> {
    let mut resolved = ResolvedSchema::new();
    for spec in specs {
        let table = tr.table_by_name(spec.name)?.ok_or_else(|| {
            CoreError::SchemaMismatch(format!("missing metadata table '{}'", spec.name))
        })?;
        let mut columns = HashMap::new();
        for col in &spec.columns {
            let found = table.schema.column_by_name(col.name).ok_or_else(|| {
                CoreError::SchemaMismatch(format!(
                    "missing column '{}' on metadata table '{}'",
                    col.name, spec.name
                ))
            })?;
            if found.key.column_type() != Some(col.ty) {
                return Err(CoreError::SchemaMismatch(format!(
                    "column '{}' on '{}' has the wrong type",
                    col.name, spec.name
                )));
            }
            columns.insert(col.name, found.key);
        }
        resolved.insert(
            spec.name,
            ResolvedTable {
                table: table.schema.key,
                columns,
            },
        );
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    fn specs() -> Vec<MetadataTableSpec> {
        vec![
            MetadataTableSpec {
                name: "flx_test_parent",
                columns: vec![
                    MetadataColumnSpec::new("version", ColumnType::Int),
                    MetadataColumnSpec::link_list("children", "flx_test_child"),
                ],
            },
            MetadataTableSpec {
                name: "flx_test_child",
                columns: vec![MetadataColumnSpec::nullable("payload", ColumnType::Binary)],
            },
        ]
    }

    #[test]
    fn create_then_reload_resolves_same_keys() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.into_path().join("meta.db"));

        let mut tr = db.start_read(None).unwrap();
        let created = create_or_load_schema(&mut tr, "test_group", 1, &specs()).unwrap();

        let mut tr2 = db.start_read(None).unwrap();
        let loaded = create_or_load_schema(&mut tr2, "test_group", 1, &specs()).unwrap();

        assert_eq!(
            created["flx_test_parent"].table,
            loaded["flx_test_parent"].table
        );
        assert_eq!(
            created["flx_test_parent"].col("version"),
            loaded["flx_test_parent"].col("version")
        );
    }

    #[test]
    fn newer_stored_version_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.into_path().join("meta-newer.db"));

        let mut tr = db.start_read(None).unwrap();
        create_or_load_schema(&mut tr, "test_group", 2, &specs()).unwrap();

        let mut tr2 = db.start_read(None).unwrap();
        let err = create_or_load_schema(&mut tr2, "test_group", 1, &specs()).unwrap_err();
        assert!(matches!(
            err,
            CoreError::UnsupportedMetadataSchema {
                found: 2,
                supported: 1,
                ..
            }
        ));
    }

    #[test]
    fn older_stored_version_refuses_without_a_migration() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.into_path().join("meta-older.db"));

        let mut tr = db.start_read(None).unwrap();
        create_or_load_schema(&mut tr, "test_group", 1, &specs()).unwrap();

        let mut tr2 = db.start_read(None).unwrap();
        let err = create_or_load_schema(&mut tr2, "test_group", 2, &specs()).unwrap_err();
        assert!(matches!(err, CoreError::SchemaMismatch(_)));
    }
}
