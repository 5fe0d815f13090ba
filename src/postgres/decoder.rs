//! Logical replication protocol v1 decoder.
//!
//! Turns an XLogData payload into a [`LogicalMessage`]. Identifiers are
//! NUL-terminated strings; tuples are `ncols` followed by per-column tagged
//! slots (`'n'` null, `'u'` unchanged TOAST, `'t'` length-prefixed text).
//!
//! Any malformed length or unknown tag is a [`DecodeError`] carrying the
//! byte offset where decoding stopped. Decode errors are fatal to the
//! session: the stream position can no longer be trusted.

use bytes::Bytes;
use thiserror::Error;

use crate::lsn::Lsn;
use crate::postgres::types::{
    BeginBody, CommitBody, DeleteBody, InsertBody, KeyKind, LogicalMessage, OriginBody,
    RelationBody, TruncateBody, Tuple, TupleValue, TypeBody, UpdateBody, WireColumn,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("decode failed at offset {offset}: {reason}")]
pub struct DecodeError {
    pub offset: usize,
    pub reason: String,
}

/// Payload cursor that remembers how far it has read.
struct Cursor {
    data: Bytes,
    offset: usize,
}

impl Cursor {
    fn new(data: Bytes) -> Self {
        Self { data, offset: 0 }
    }

    fn error(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError {
            offset: self.offset,
            reason: reason.into(),
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, n: usize) -> Result<&[u8], DecodeError> {
        if self.remaining() < n {
            return Err(self.error(format!(
                "need {n} bytes, {} remaining",
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn lsn(&mut self) -> Result<Lsn, DecodeError> {
        Ok(Lsn::new(self.u64()?))
    }

    /// NUL-terminated UTF-8 string.
    fn cstring(&mut self) -> Result<String, DecodeError> {
        let rest = &self.data[self.offset..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.error("unterminated string"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| self.error(format!("invalid UTF-8 in identifier: {e}")))?
            .to_string();
        self.offset += nul + 1;
        Ok(s)
    }

    /// Length-prefixed slice sharing the payload's backing buffer.
    fn bytes(&mut self, n: usize) -> Result<Bytes, DecodeError> {
        if self.remaining() < n {
            return Err(self.error(format!(
                "text value of {n} bytes overruns payload ({} remaining)",
                self.remaining()
            )));
        }
        let out = self.data.slice(self.offset..self.offset + n);
        self.offset += n;
        Ok(out)
    }
}

/// Decode one logical message from an XLogData payload.
pub fn decode_logical_message(payload: Bytes) -> Result<LogicalMessage, DecodeError> {
    let mut cur = Cursor::new(payload);
    let tag = cur.u8()?;
    match tag {
        b'B' => decode_begin(&mut cur).map(LogicalMessage::Begin),
        b'C' => decode_commit(&mut cur).map(LogicalMessage::Commit),
        b'R' => decode_relation(&mut cur).map(LogicalMessage::Relation),
        b'I' => decode_insert(&mut cur).map(LogicalMessage::Insert),
        b'U' => decode_update(&mut cur).map(LogicalMessage::Update),
        b'D' => decode_delete(&mut cur).map(LogicalMessage::Delete),
        b'T' => decode_truncate(&mut cur).map(LogicalMessage::Truncate),
        b'Y' => decode_type(&mut cur).map(LogicalMessage::Type),
        b'O' => decode_origin(&mut cur).map(LogicalMessage::Origin),
        other => Err(cur.error(format!("unknown logical message tag: 0x{other:02X}"))),
    }
}

fn decode_begin(cur: &mut Cursor) -> Result<BeginBody, DecodeError> {
    Ok(BeginBody {
        final_lsn: cur.lsn()?,
        timestamp: cur.i64()?,
        xid: cur.u32()?,
    })
}

fn decode_commit(cur: &mut Cursor) -> Result<CommitBody, DecodeError> {
    Ok(CommitBody {
        flags: cur.u8()?,
        commit_lsn: cur.lsn()?,
        end_lsn: cur.lsn()?,
        timestamp: cur.i64()?,
    })
}

fn decode_relation(cur: &mut Cursor) -> Result<RelationBody, DecodeError> {
    let oid = cur.u32()?;
    let namespace = cur.cstring()?;
    let name = cur.cstring()?;
    let replica_identity = cur.u8()?;
    let ncols = cur.u16()?;

    let mut columns = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        columns.push(WireColumn {
            flags: cur.u8()?,
            name: cur.cstring()?,
            type_oid: cur.u32()?,
            type_modifier: cur.i32()?,
        });
    }

    Ok(RelationBody {
        oid,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn decode_insert(cur: &mut Cursor) -> Result<InsertBody, DecodeError> {
    let relation_oid = cur.u32()?;
    let tag = cur.u8()?;
    if tag != b'N' {
        return Err(cur.error(format!("expected 'N' tuple in insert, got 0x{tag:02X}")));
    }
    Ok(InsertBody {
        relation_oid,
        new_tuple: decode_tuple(cur)?,
    })
}

fn decode_update(cur: &mut Cursor) -> Result<UpdateBody, DecodeError> {
    let relation_oid = cur.u32()?;
    let tag = cur.u8()?;

    let (old_tuple, new_tuple) = match tag {
        b'K' | b'O' => {
            let kind = if tag == b'K' { KeyKind::Key } else { KeyKind::Full };
            let old = decode_tuple(cur)?;
            let next = cur.u8()?;
            if next != b'N' {
                return Err(cur.error(format!(
                    "expected 'N' tuple after old image, got 0x{next:02X}"
                )));
            }
            (Some((kind, old)), decode_tuple(cur)?)
        }
        b'N' => (None, decode_tuple(cur)?),
        other => {
            return Err(cur.error(format!("unexpected tuple tag in update: 0x{other:02X}")));
        }
    };

    Ok(UpdateBody {
        relation_oid,
        old_tuple,
        new_tuple,
    })
}

fn decode_delete(cur: &mut Cursor) -> Result<DeleteBody, DecodeError> {
    let relation_oid = cur.u32()?;
    let tag = cur.u8()?;
    let kind = match tag {
        b'K' => KeyKind::Key,
        b'O' => KeyKind::Full,
        other => {
            return Err(cur.error(format!("unexpected tuple tag in delete: 0x{other:02X}")));
        }
    };
    Ok(DeleteBody {
        relation_oid,
        kind,
        old_tuple: decode_tuple(cur)?,
    })
}

fn decode_truncate(cur: &mut Cursor) -> Result<TruncateBody, DecodeError> {
    let nrelations = cur.u32()?;
    let flags = cur.u8()?;
    let mut relation_oids = Vec::with_capacity(nrelations as usize);
    for _ in 0..nrelations {
        relation_oids.push(cur.u32()?);
    }
    Ok(TruncateBody {
        flags,
        relation_oids,
    })
}

fn decode_type(cur: &mut Cursor) -> Result<TypeBody, DecodeError> {
    Ok(TypeBody {
        oid: cur.u32()?,
        namespace: cur.cstring()?,
        name: cur.cstring()?,
    })
}

fn decode_origin(cur: &mut Cursor) -> Result<OriginBody, DecodeError> {
    Ok(OriginBody {
        commit_lsn: cur.lsn()?,
        name: cur.cstring()?,
    })
}

fn decode_tuple(cur: &mut Cursor) -> Result<Tuple, DecodeError> {
    let ncols = cur.u16()?;
    let mut values = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        let tag = cur.u8()?;
        let value = match tag {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::UnchangedToast,
            b't' => {
                let len = cur.u32()? as usize;
                TupleValue::Text(cur.bytes(len)?)
            }
            other => {
                return Err(cur.error(format!("unknown tuple column tag: 0x{other:02X}")));
            }
        };
        values.push(value);
    }
    Ok(Tuple(values))
}
