//! Shared fixtures: wire-level payload builders and a driver that runs
//! decoded messages through the assemble → enrich → handle → ack path the
//! way a live session does, minus the socket and catalog connection.

use bytes::{BufMut, Bytes, BytesMut};
use pg_relay::postgres::decoder::decode_logical_message;
use pg_relay::postgres::types::LogicalMessage;
use pg_relay::{
    AckState, Lsn, MessageHandler, Relation, RelationCache, RowChange, StoreMessageHandler,
    TransactionAssembler,
};

/// Microseconds since 2000-01-01 for 2024-03-01T16:11:32.272722Z.
pub const COMMIT_TS_MICROS: i64 = 762_538_292_272_722;

#[derive(Debug, Clone)]
pub enum Slot {
    Null,
    Toast,
    Text(String),
}

pub fn text(value: &str) -> Slot {
    Slot::Text(value.to_string())
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, slots: &[Slot]) {
    buf.put_u16(slots.len() as u16);
    for slot in slots {
        match slot {
            Slot::Null => buf.put_u8(b'n'),
            Slot::Toast => buf.put_u8(b'u'),
            Slot::Text(value) => {
                buf.put_u8(b't');
                buf.put_u32(value.len() as u32);
                buf.put_slice(value.as_bytes());
            }
        }
    }
}

pub fn relation_payload(
    oid: u32,
    schema: &str,
    table: &str,
    replica_identity: u8,
    columns: &[(&str, u32)],
) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_u32(oid);
    put_cstring(&mut buf, schema);
    put_cstring(&mut buf, table);
    buf.put_u8(replica_identity);
    buf.put_u16(columns.len() as u16);
    for (name, type_oid) in columns {
        buf.put_u8(0);
        put_cstring(&mut buf, name);
        buf.put_u32(*type_oid);
        buf.put_i32(-1);
    }
    buf.freeze()
}

pub fn begin_payload(lsn: u64, timestamp: i64, xid: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'B');
    buf.put_u64(lsn);
    buf.put_i64(timestamp);
    buf.put_u32(xid);
    buf.freeze()
}

pub fn commit_payload(lsn: u64, timestamp: i64) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'C');
    buf.put_u8(0);
    buf.put_u64(lsn);
    buf.put_u64(lsn + 0x10);
    buf.put_i64(timestamp);
    buf.freeze()
}

pub fn insert_payload(oid: u32, values: &[Slot]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'I');
    buf.put_u32(oid);
    buf.put_u8(b'N');
    put_tuple(&mut buf, values);
    buf.freeze()
}

pub fn update_payload(oid: u32, old: Option<(u8, &[Slot])>, new: &[Slot]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'U');
    buf.put_u32(oid);
    if let Some((tag, old_values)) = old {
        buf.put_u8(tag);
        put_tuple(&mut buf, old_values);
    }
    buf.put_u8(b'N');
    put_tuple(&mut buf, new);
    buf.freeze()
}

pub fn delete_payload(oid: u32, tag: u8, old: &[Slot]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'D');
    buf.put_u32(oid);
    buf.put_u8(tag);
    put_tuple(&mut buf, old);
    buf.freeze()
}

/// Runs logical payloads through the same sequence the session uses.
/// Primary keys are injected instead of queried from `pg_index`.
pub struct Driver {
    pub slot_id: String,
    pub pk_columns: Vec<String>,
    pub cache: RelationCache,
    pub assembler: TransactionAssembler,
    pub ack: AckState,
    pub next_seq: u64,
    pub persisted_lsn: Lsn,
}

impl Driver {
    pub fn new(slot_id: &str, pk_columns: &[&str]) -> Self {
        Self {
            slot_id: slot_id.to_string(),
            pk_columns: pk_columns.iter().map(|s| s.to_string()).collect(),
            cache: RelationCache::new(),
            assembler: TransactionAssembler::new(),
            ack: AckState::new(),
            next_seq: 0,
            persisted_lsn: Lsn::ZERO,
        }
    }

    /// Seed the sequence cursor from the store, like a session start does.
    pub async fn seed(&mut self, handler: &StoreMessageHandler) {
        let (seq, lsn) = handler.last_processed(&self.slot_id).await.unwrap();
        self.next_seq = seq;
        self.persisted_lsn = lsn;
    }

    pub async fn feed(
        &mut self,
        payload: Bytes,
        handler: &StoreMessageHandler,
    ) -> pg_relay::Result<()> {
        match decode_logical_message(payload)? {
            LogicalMessage::Relation(body) => {
                self.cache.insert(Relation::from_wire(&body, &self.pk_columns));
            }
            LogicalMessage::Begin(body) => self.assembler.on_begin(&body)?,
            LogicalMessage::Insert(body) => self.assembler.on_change(RowChange::Insert {
                relation_oid: body.relation_oid,
                new: body.new_tuple,
            })?,
            LogicalMessage::Update(body) => self.assembler.on_change(RowChange::Update {
                relation_oid: body.relation_oid,
                old: body.old_tuple,
                new: body.new_tuple,
            })?,
            LogicalMessage::Delete(body) => self.assembler.on_change(RowChange::Delete {
                relation_oid: body.relation_oid,
                kind: body.kind,
                old: body.old_tuple,
            })?,
            LogicalMessage::Commit(body) => {
                let frame = self.assembler.on_commit(&body)?;
                let commit_lsn = frame.commit_lsn;
                // Replay of an already-persisted commit: ack without
                // re-sequencing, as the session does.
                if commit_lsn > self.persisted_lsn || self.persisted_lsn.is_zero() {
                    let changes = frame.enrich(&self.cache, &mut self.next_seq)?;
                    let ctx = handler.context(&self.slot_id).await?;
                    handler.handle_messages(&ctx, &changes).await?;
                    self.persisted_lsn = commit_lsn;
                }
                self.ack.advance(commit_lsn);
            }
            LogicalMessage::Truncate(_) | LogicalMessage::Type(_) | LogicalMessage::Origin(_) => {}
        }
        Ok(())
    }

    pub async fn feed_all(
        &mut self,
        payloads: Vec<Bytes>,
        handler: &StoreMessageHandler,
    ) -> pg_relay::Result<()> {
        for payload in payloads {
            self.feed(payload, handler).await?;
        }
        Ok(())
    }
}
