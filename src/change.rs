//! Row changes and their enriched, sink-ready form.
//!
//! A [`RowChange`] is the raw shape out of the decoder: tuples plus a
//! relation OID. Enrichment joins it to the cached [`Relation`], casts
//! every column, extracts primary-key values, computes the old-value diff,
//! and stamps commit metadata, a global sequence number and a trace id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::cast::cast_value;
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::postgres::types::{KeyKind, Tuple, TupleValue};
use crate::relation::Relation;

/// Sentinel forwarded for TOASTed values the server did not re-send.
/// Downstream must treat it as "unchanged", not as a real value.
pub const UNCHANGED_TOAST: &str = "__unchanged_toast__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A raw row change buffered between Begin and Commit.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Insert {
        relation_oid: u32,
        new: Tuple,
    },
    Update {
        relation_oid: u32,
        /// Old image, present only under REPLICA IDENTITY FULL or when a
        /// key column changed.
        old: Option<(KeyKind, Tuple)>,
        new: Tuple,
    },
    Delete {
        relation_oid: u32,
        kind: KeyKind,
        old: Tuple,
    },
}

impl RowChange {
    pub fn relation_oid(&self) -> u32 {
        match self {
            RowChange::Insert { relation_oid, .. }
            | RowChange::Update { relation_oid, .. }
            | RowChange::Delete { relation_oid, .. } => *relation_oid,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            RowChange::Insert { .. } => Action::Insert,
            RowChange::Update { .. } => Action::Update,
            RowChange::Delete { .. } => Action::Delete,
        }
    }
}

/// One committed transaction's worth of changes, in source order.
#[derive(Debug, Clone)]
pub struct TransactionFrame {
    pub xid: u32,
    pub commit_lsn: Lsn,
    pub commit_ts: DateTime<Utc>,
    pub changes: Vec<RowChange>,
}

/// A row change joined to its relation and ready for routing.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedChange {
    pub action: Action,
    pub schema: String,
    pub table: String,
    pub relation_oid: u32,
    pub commit_lsn: Lsn,
    pub commit_ts: DateTime<Utc>,
    /// Global sequence assigned at commit time; strictly increasing across
    /// all changes the engine emits.
    pub seq: u64,
    pub trace_id: Uuid,
    /// Primary-key values (from the new image, or the old image on delete).
    pub ids: Vec<Value>,
    /// Current row state. Empty for deletes.
    pub record: Map<String, Value>,
    /// Deletes only: the key or full old image.
    pub old_record: Option<Map<String, Value>>,
    /// Updates under REPLICA IDENTITY FULL: old values of columns whose
    /// value changed. Empty when no old image was sent.
    pub changes: Map<String, Value>,
}

impl EnrichedChange {
    /// Join a raw change to its relation. `seq` is assigned by the caller.
    pub fn build(
        change: &RowChange,
        relation: &Relation,
        commit_lsn: Lsn,
        commit_ts: DateTime<Utc>,
        seq: u64,
    ) -> Result<Self> {
        let action = change.action();
        let (record, old_record, changes, ids) = match change {
            RowChange::Insert { new, .. } => {
                let record = decode_tuple(relation, new)?;
                let ids = pk_values(relation, &record);
                (record, None, Map::new(), ids)
            }
            RowChange::Update { old, new, .. } => {
                let record = decode_tuple(relation, new)?;
                let ids = pk_values(relation, &record);
                let changes = match old {
                    Some((kind, old_tuple)) => diff_old(relation, *kind, old_tuple, new)?,
                    None => Map::new(),
                };
                (record, None, changes, ids)
            }
            RowChange::Delete { kind, old, .. } => {
                let full = decode_tuple(relation, old)?;
                let old_record = match kind {
                    // Key form: non-key positions arrive null and are not
                    // part of the old image.
                    KeyKind::Key => {
                        let mut map = Map::new();
                        for (column, value) in relation.columns.iter().zip(old.0.iter()) {
                            if !value.is_null() {
                                map.insert(
                                    column.name.clone(),
                                    decode_value(&column.type_name, value),
                                );
                            }
                        }
                        map
                    }
                    KeyKind::Full => full.clone(),
                };
                let ids = pk_values(relation, &full);
                (Map::new(), Some(old_record), Map::new(), ids)
            }
        };

        Ok(EnrichedChange {
            action,
            schema: relation.schema.clone(),
            table: relation.name.clone(),
            relation_oid: relation.oid,
            commit_lsn,
            commit_ts,
            seq,
            trace_id: Uuid::new_v4(),
            ids,
            record,
            old_record,
            changes,
        })
    }

    /// The values grouped rows are keyed by: the named columns, falling
    /// back to the primary key.
    pub fn group_values(&self, group_columns: &[String]) -> Vec<Value> {
        if group_columns.is_empty() {
            return self.ids.clone();
        }
        let source = if self.record.is_empty() {
            self.old_record.as_ref().unwrap_or(&self.record)
        } else {
            &self.record
        };
        group_columns
            .iter()
            .map(|name| source.get(name).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

fn decode_tuple(relation: &Relation, tuple: &Tuple) -> Result<Map<String, Value>> {
    if tuple.len() != relation.columns.len() {
        return Err(Error::Protocol(format!(
            "tuple has {} columns but relation {} has {}",
            tuple.len(),
            relation.qualified_name(),
            relation.columns.len()
        )));
    }

    let mut map = Map::with_capacity(tuple.len());
    for (column, value) in relation.columns.iter().zip(tuple.0.iter()) {
        map.insert(column.name.clone(), decode_value(&column.type_name, value));
    }
    Ok(map)
}

fn decode_value(type_name: &str, value: &TupleValue) -> Value {
    match value {
        TupleValue::Null => Value::Null,
        TupleValue::UnchangedToast => Value::String(UNCHANGED_TOAST.to_string()),
        TupleValue::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => cast_value(type_name, text),
            Err(_) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        },
    }
}

fn pk_values(relation: &Relation, record: &Map<String, Value>) -> Vec<Value> {
    relation
        .pk_columns()
        .map(|column| record.get(&column.name).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Old values of columns whose value changed. Unchanged-TOAST slots on
/// either side count as unchanged.
fn diff_old(
    relation: &Relation,
    kind: KeyKind,
    old: &Tuple,
    new: &Tuple,
) -> Result<Map<String, Value>> {
    if old.len() != relation.columns.len() || new.len() != relation.columns.len() {
        return Err(Error::Protocol(format!(
            "old/new tuple width mismatch for {}",
            relation.qualified_name()
        )));
    }

    let mut changes = Map::new();
    for ((column, old_value), new_value) in
        relation.columns.iter().zip(old.0.iter()).zip(new.0.iter())
    {
        // Key-form old images only populate key columns; the nulls are
        // absence, not values.
        if kind == KeyKind::Key && old_value.is_null() {
            continue;
        }
        if matches!(old_value, TupleValue::UnchangedToast)
            || matches!(new_value, TupleValue::UnchangedToast)
        {
            continue;
        }
        let old_decoded = decode_value(&column.type_name, old_value);
        let new_decoded = decode_value(&column.type_name, new_value);
        if old_decoded != new_decoded {
            changes.insert(column.name.clone(), old_decoded);
        }
    }
    Ok(changes)
}
