//! Wire-level message builders for decoder tests.

use bytes::{BufMut, Bytes, BytesMut};

/// Builds raw protocol-v1 payloads the way the server encodes them.
pub struct WireMessageBuilder;

impl WireMessageBuilder {
    pub fn begin(final_lsn: u64, timestamp: i64, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(final_lsn);
        buf.put_i64(timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit(flags: u8, commit_lsn: u64, end_lsn: u64, timestamp: i64) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(flags);
        buf.put_u64(commit_lsn);
        buf.put_u64(end_lsn);
        buf.put_i64(timestamp);
        buf.freeze()
    }

    pub fn relation(
        oid: u32,
        namespace: &str,
        name: &str,
        replica_identity: u8,
        columns: &[(u8, &str, u32, i32)],
    ) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(oid);
        put_cstring(&mut buf, namespace);
        put_cstring(&mut buf, name);
        buf.put_u8(replica_identity);
        buf.put_u16(columns.len() as u16);
        for (flags, col_name, type_oid, type_modifier) in columns {
            buf.put_u8(*flags);
            put_cstring(&mut buf, col_name);
            buf.put_u32(*type_oid);
            buf.put_i32(*type_modifier);
        }
        buf.freeze()
    }

    pub fn insert(relation_oid: u32, tuple: &[ColumnSlot]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(relation_oid);
        buf.put_u8(b'N');
        put_tuple(&mut buf, tuple);
        buf.freeze()
    }

    pub fn update(
        relation_oid: u32,
        old: Option<(u8, &[ColumnSlot])>,
        new: &[ColumnSlot],
    ) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(relation_oid);
        if let Some((tag, old_tuple)) = old {
            buf.put_u8(tag);
            put_tuple(&mut buf, old_tuple);
        }
        buf.put_u8(b'N');
        put_tuple(&mut buf, new);
        buf.freeze()
    }

    pub fn delete(relation_oid: u32, tag: u8, old: &[ColumnSlot]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(relation_oid);
        buf.put_u8(tag);
        put_tuple(&mut buf, old);
        buf.freeze()
    }

    pub fn truncate(flags: u8, relation_oids: &[u32]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(relation_oids.len() as u32);
        buf.put_u8(flags);
        for oid in relation_oids {
            buf.put_u32(*oid);
        }
        buf.freeze()
    }

    pub fn type_message(oid: u32, namespace: &str, name: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Y');
        buf.put_u32(oid);
        put_cstring(&mut buf, namespace);
        put_cstring(&mut buf, name);
        buf.freeze()
    }

    pub fn origin(commit_lsn: u64, name: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'O');
        buf.put_u64(commit_lsn);
        put_cstring(&mut buf, name);
        buf.freeze()
    }
}

/// Column slot input for tuple encoding.
#[derive(Debug, Clone)]
pub enum ColumnSlot {
    Null,
    Toast,
    Text(String),
}

impl ColumnSlot {
    pub fn text(value: &str) -> Self {
        ColumnSlot::Text(value.to_string())
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, slots: &[ColumnSlot]) {
    buf.put_u16(slots.len() as u16);
    for slot in slots {
        match slot {
            ColumnSlot::Null => buf.put_u8(b'n'),
            ColumnSlot::Toast => buf.put_u8(b'u'),
            ColumnSlot::Text(value) => {
                buf.put_u8(b't');
                buf.put_u32(value.len() as u32);
                buf.put_slice(value.as_bytes());
            }
        }
    }
}
