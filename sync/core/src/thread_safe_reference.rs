// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Owned, movable handles for carrying accessors across threads.
//!
//! Transactions never cross threads; a reference captures only the minimal
//! key material plus the version it was taken at, and re-imports into a
//! transaction pinned to that same version on the destination thread.

use sync_types::{ObjKey, TableKey, VersionId};

use crate::{
    error::{CoreError, CoreResult},
    query::{DescriptorOrdering, Query},
    transaction::Transaction,
};

#[derive(Debug)]
enum Payload {
    Object {
        table: TableKey,
        obj: ObjKey,
    },
    Objects {
        table: TableKey,
        keys: Vec<ObjKey>,
    },
    Results {
        query: Query,
        ordering: DescriptorOrdering,
    },
}

/// What an import hands back on the destination thread.
pub enum Imported {
    Object {
        table: TableKey,
        obj: ObjKey,
    },
    Objects {
        table: TableKey,
        keys: Vec<ObjKey>,
    },
    Results {
        query: Query,
        ordering: DescriptorOrdering,
        rows: Vec<ObjKey>,
    },
}

pub struct ThreadSafeReference {
    version: VersionId,
    payload: Payload,
}

impl ThreadSafeReference {
    pub fn for_object(tr: &Transaction, table: TableKey, obj: ObjKey) -> CoreResult<ThreadSafeReference> {
        tr.object(table, obj)?;
        Ok(ThreadSafeReference {
            version: tr.get_version_of_current_transaction(),
            payload: Payload::Object { table, obj },
        })
    }

    pub fn for_objects(
        tr: &Transaction,
        table: TableKey,
        keys: Vec<ObjKey>,
    ) -> CoreResult<ThreadSafeReference> {
        for key in &keys {
            tr.object(table, *key)?;
        }
        Ok(ThreadSafeReference {
            version: tr.get_version_of_current_transaction(),
            payload: Payload::Objects { table, keys },
        })
    }

    pub fn for_results(
        tr: &Transaction,
        query: Query,
        ordering: DescriptorOrdering,
    ) -> ThreadSafeReference {
        ThreadSafeReference {
            version: tr.get_version_of_current_transaction(),
            payload: Payload::Results { query, ordering },
        }
    }

    pub fn version(&self) -> VersionId {
        self.version
    }

    /// Resolve the reference in a transaction pinned at the capture version.
    pub fn import(self, tr: &Transaction) -> CoreResult<Imported> {
        if tr.get_version_of_current_transaction().version != self.version.version {
            return Err(CoreError::NoSuchVersion(self.version.version));
        }
        match self.payload {
            Payload::Object { table, obj } => {
                tr.object(table, obj)?;
                Ok(Imported::Object { table, obj })
            }
            Payload::Objects { table, keys } => Ok(Imported::Objects { table, keys }),
            Payload::Results { query, ordering } => {
                let state = tr.state()?;
                let rows = query.run(state).ok_or(CoreError::InvalidatedObject)?;
                let rows = match state.table(query.table) {
                    Some(table) => ordering.apply(table, rows),
                    None => rows,
                };
                Ok(Imported::Results {
                    query,
                    ordering,
                    rows,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[test]
    fn object_reference_round_trips_at_matching_version() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.into_path().join("tsr.db"));
        let mut tr = db.start_write().unwrap();
        let table = tr.add_table("items").unwrap();
        let obj = tr.create_object(table).unwrap();
        tr.commit_and_continue_as_read().unwrap();

        let reference = ThreadSafeReference::for_object(&tr, table, obj).unwrap();
        let version = reference.version();

        // "Another thread": a fresh transaction pinned to the same version.
        let other = db.start_read(Some(version)).unwrap();
        match reference.import(&other).unwrap() {
            Imported::Object {
                table: t,
                obj: o,
            } => {
                assert_eq!(t, table);
                assert_eq!(o, obj);
            }
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn import_rejects_mismatched_versions() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.into_path().join("tsr-version.db"));
        let mut tr = db.start_write().unwrap();
        let table = tr.add_table("items").unwrap();
        let obj = tr.create_object(table).unwrap();
        tr.commit_and_continue_as_read().unwrap();

        let reference = ThreadSafeReference::for_object(&tr, table, obj).unwrap();

        let mut writer = db.start_write().unwrap();
        writer.create_object(table).unwrap();
        writer.commit().unwrap();

        let newer = db.start_read(None).unwrap();
        assert!(reference.import(&newer).is_err());
    }
}
