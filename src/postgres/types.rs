//! Logical replication protocol (v1) message tree.
//!
//! These are the decoded forms of the pgoutput payloads carried inside
//! XLogData frames. Identifiers arrive as NUL-terminated strings, LSNs as
//! big-endian u64, timestamps as microseconds since 2000-01-01 UTC.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::lsn::Lsn;

/// Microseconds between the Unix epoch and the PostgreSQL epoch
/// (2000-01-01 00:00:00 UTC).
pub const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;

/// Convert a protocol timestamp (µs since 2000-01-01) to UTC.
pub fn pg_micros_to_utc(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros + PG_EPOCH_UNIX_MICROS)
        .single()
        .unwrap_or_else(|| Utc.timestamp_micros(0).unwrap())
}

/// Current wall-clock time as a protocol timestamp.
pub fn utc_now_pg_micros() -> i64 {
    Utc::now().timestamp_micros() - PG_EPOCH_UNIX_MICROS
}

/// A decoded logical replication message.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalMessage {
    Begin(BeginBody),
    Commit(CommitBody),
    Relation(RelationBody),
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate(TruncateBody),
    Type(TypeBody),
    Origin(OriginBody),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginBody {
    pub final_lsn: Lsn,
    /// Commit timestamp, µs since 2000-01-01.
    pub timestamp: i64,
    pub xid: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationBody {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<WireColumn>,
}

/// Column descriptor as it appears in a Relation message. The key flag is
/// kept for completeness but primary keys are resolved from `pg_index`
/// because REPLICA IDENTITY FULL marks every column as a key here.
#[derive(Debug, Clone, PartialEq)]
pub struct WireColumn {
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertBody {
    pub relation_oid: u32,
    pub new_tuple: Tuple,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBody {
    pub relation_oid: u32,
    /// Present only under REPLICA IDENTITY FULL (`'O'`) or when key columns
    /// changed (`'K'`).
    pub old_tuple: Option<(KeyKind, Tuple)>,
    pub new_tuple: Tuple,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteBody {
    pub relation_oid: u32,
    pub kind: KeyKind,
    pub old_tuple: Tuple,
}

/// Which form the old/key tuple took on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// `'K'`: only replica-identity (primary key) columns are populated.
    Key,
    /// `'O'`: the full old row (REPLICA IDENTITY FULL).
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TruncateBody {
    pub flags: u8,
    pub relation_oids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeBody {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OriginBody {
    pub commit_lsn: Lsn,
    pub name: String,
}

/// A row image: one slot per relation column, in relation column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tuple(pub Vec<TupleValue>);

impl Tuple {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One column slot within a tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleValue {
    Null,
    /// Out-of-line value that did not change and was not re-sent.
    UnchangedToast,
    /// Textual representation, UTF-8.
    Text(Bytes),
}

impl TupleValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TupleValue::Text(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TupleValue::Null)
    }
}
