// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Minimal query surface for results notifiers.
//!
//! There is no query language here: a query is a table plus an optional
//! predicate over object state, and ordering is a composed descriptor
//! (sort, distinct, limit) applied to the matching keys. The notifier only
//! needs the ordered key list; everything else is the binding's concern.

use std::cmp::Ordering;
use std::sync::Arc;

use sync_types::{ColKey, ObjKey, TableKey};

use crate::{
    changeset::Value,
    storage::{GroupState, TableState},
};

type Predicate = Arc<dyn Fn(&crate::storage::ObjectState) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct Query {
    pub table: TableKey,
    predicate: Option<Predicate>,
}

impl Query {
    pub fn table_scan(table: TableKey) -> Query {
        Query {
            table,
            predicate: None,
        }
    }

    pub fn filtered(
        table: TableKey,
        predicate: impl Fn(&crate::storage::ObjectState) -> bool + Send + Sync + 'static,
    ) -> Query {
        Query {
            table,
            predicate: Some(Arc::new(predicate)),
        }
    }

    /// Matching keys in table order, or `None` if the table is gone.
    pub fn run(&self, state: &GroupState) -> Option<Vec<ObjKey>> {
        let table = state.table(self.table)?;
        let keys = table
            .objects
            .iter()
            .filter(|(_, obj)| self.predicate.as_ref().map_or(true, |p| p(obj)))
            .map(|(key, _)| *key)
            .collect();
        Some(keys)
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.table)
            .field("filtered", &self.predicate.is_some())
            .finish()
    }
}

/// Composed ordering applied to query results before diffing.
#[derive(Clone, Debug, Default)]
pub struct DescriptorOrdering {
    /// `(column, ascending)` pairs, outermost first.
    pub sort: Vec<(ColKey, bool)>,
    /// Keep only the first row per distinct combination of these columns.
    pub distinct: Vec<ColKey>,
    pub limit: Option<usize>,
}

impl DescriptorOrdering {
    pub fn is_empty(&self) -> bool {
        self.sort.is_empty() && self.distinct.is_empty() && self.limit.is_none()
    }

    pub fn will_apply_sort(&self) -> bool {
        !self.sort.is_empty()
    }

    pub fn apply(&self, table: &TableState, mut keys: Vec<ObjKey>) -> Vec<ObjKey> {
        if self.will_apply_sort() {
            keys.sort_by(|a, b| {
                for (col, ascending) in &self.sort {
                    let va = table.object(*a).and_then(|o| o.value(*col));
                    let vb = table.object(*b).and_then(|o| o.value(*col));
                    let ord = compare_values(va, vb);
                    if ord != Ordering::Equal {
                        return if *ascending { ord } else { ord.reverse() };
                    }
                }
                a.cmp(b)
            });
        }
        if !self.distinct.is_empty() {
            let mut seen: Vec<Vec<Option<Value>>> = Vec::new();
            keys.retain(|key| {
                let fingerprint: Vec<Option<Value>> = self
                    .distinct
                    .iter()
                    .map(|col| table.object(*key).and_then(|o| o.value(*col)).cloned())
                    .collect();
                if seen.contains(&fingerprint) {
                    false
                } else {
                    seen.push(fingerprint);
                    true
                }
            });
        }
        if let Some(limit) = self.limit {
            keys.truncate(limit);
        }
        keys
    }
}

/// Total order over optional cell values: null first, then by type, then by
/// payload.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Int(_) => 1,
            Value::Bool(_) => 2,
            Value::Double(_) => 3,
            Value::String(_) => 4,
            Value::Binary(_) => 5,
            Value::Timestamp(_) => 6,
            Value::Link(_) => 7,
        }
    }
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Int(x), Value::Int(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::Double(x), Value::Double(y)) => x.total_cmp(y),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Binary(x), Value::Binary(y)) => x.cmp(y),
            (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
            (Value::Link(x), Value::Link(y)) => x.cmp(y),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use sync_types::ColumnType;

    fn setup(name: &str) -> (Database, TableKey, ColKey) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.into_path().join(name));
        let mut tr = db.start_write().unwrap();
        let table = tr.add_table("items").unwrap();
        let col = tr.add_column(table, "rank", ColumnType::Int, false, None).unwrap();
        for rank in [3i64, 1, 2, 1] {
            let obj = tr.create_object(table).unwrap();
            tr.set_value(table, obj, col, Value::Int(rank)).unwrap();
        }
        tr.commit().unwrap();
        (db, table, col)
    }

    #[test]
    fn table_scan_returns_keys_in_table_order() {
        let (db, table, _) = setup("scan.db");
        let tr = db.start_read(None).unwrap();
        let keys = Query::table_scan(table).run(tr.state().unwrap()).unwrap();
        assert_eq!(keys.len(), 4);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn predicate_filters_rows() {
        let (db, table, col) = setup("filter.db");
        let tr = db.start_read(None).unwrap();
        let query = Query::filtered(table, move |obj| {
            obj.value(col).and_then(Value::as_int).unwrap_or(0) >= 2
        });
        let keys = query.run(tr.state().unwrap()).unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn descriptor_sorts_distincts_and_limits() {
        let (db, table, col) = setup("descriptor.db");
        let tr = db.start_read(None).unwrap();
        let state = tr.state().unwrap();
        let keys = Query::table_scan(table).run(state).unwrap();
        let table_state = state.table(table).unwrap();

        let ordering = DescriptorOrdering {
            sort: vec![(col, true)],
            distinct: vec![col],
            limit: Some(2),
        };
        let sorted = ordering.apply(table_state, keys);
        assert_eq!(sorted.len(), 2);
        let ranks: Vec<i64> = sorted
            .iter()
            .map(|k| {
                table_state
                    .object(*k)
                    .and_then(|o| o.value(col))
                    .and_then(Value::as_int)
                    .unwrap()
            })
            .collect();
        assert_eq!(ranks, vec![1, 2]);
    }

    #[test]
    fn missing_table_yields_none() {
        let (db, _, _) = setup("missing.db");
        let tr = db.start_read(None).unwrap();
        assert!(Query::table_scan(TableKey(999)).run(tr.state().unwrap()).is_none());
    }
}
