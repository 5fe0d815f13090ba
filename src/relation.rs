//! Relation metadata and the per-session cache.
//!
//! The server describes each table the first time it appears in the stream
//! (and again whenever its shape changes). Entries live for the session and
//! are rebuilt from scratch after a reconnect.

use std::collections::HashMap;

use crate::cast::type_name_for_oid;
use crate::postgres::types::RelationBody;

/// Replica identity of a relation, from the wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaIdentity {
    #[default]
    Default,
    Nothing,
    Full,
    Index,
}

impl ReplicaIdentity {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            b'n' => ReplicaIdentity::Nothing,
            b'f' => ReplicaIdentity::Full,
            b'i' => ReplicaIdentity::Index,
            _ => ReplicaIdentity::Default,
        }
    }
}

/// A cached table description.
#[derive(Debug, Clone)]
pub struct Relation {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub type_oid: u32,
    pub type_name: String,
    /// From `pg_index`, not the wire key flag: under REPLICA IDENTITY FULL
    /// the server flags every column as a key, which would make primary
    /// keys indistinguishable.
    pub is_pk: bool,
}

impl Relation {
    /// Build a cache entry from a Relation message plus the primary-key
    /// column names resolved from the catalog.
    pub fn from_wire(body: &RelationBody, pk_columns: &[String]) -> Self {
        let columns = body
            .columns
            .iter()
            .map(|col| Column {
                name: col.name.clone(),
                type_oid: col.type_oid,
                type_name: type_name_for_oid(col.type_oid),
                is_pk: pk_columns.iter().any(|pk| pk == &col.name),
            })
            .collect();

        Relation {
            oid: body.oid,
            schema: body.namespace.clone(),
            name: body.name.clone(),
            replica_identity: ReplicaIdentity::from_byte(body.replica_identity),
            columns,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn pk_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_pk)
    }
}

/// OID-keyed relation cache. A repeated Relation message overwrites.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<u32, Relation>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, relation: Relation) {
        self.relations.insert(relation.oid, relation);
    }

    pub fn get(&self, oid: u32) -> Option<&Relation> {
        self.relations.get(&oid)
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// Discard everything. Called on reconnect: the server re-describes
    /// relations on the new stream.
    pub fn clear(&mut self) {
        self.relations.clear();
    }
}
