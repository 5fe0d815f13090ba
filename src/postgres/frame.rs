//! Replication frames carried in CopyBoth CopyData payloads.
//!
//! The server sends XLogData (`'w'`) and primary keepalive (`'k'`) frames;
//! the client answers with standby status updates (`'r'`).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::postgres::types::utc_now_pg_micros;

/// XLogData header: start LSN + end LSN + server clock.
pub const XLOG_DATA_HEADER_LEN: usize = 24;
/// Keepalive body: wal_end + clock + reply flag.
pub const KEEPALIVE_BODY_LEN: usize = 17;

/// A server→client frame read off the replication stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationFrame {
    XLogData {
        start_lsn: Lsn,
        end_lsn: Lsn,
        /// Server clock, µs since 2000-01-01.
        clock: i64,
        /// The logical message payload.
        payload: Bytes,
    },
    PrimaryKeepalive {
        wal_end: Lsn,
        clock: i64,
        reply_requested: bool,
    },
    /// Unrecognized tag; logged and skipped by the session.
    Unknown(u8),
}

impl ReplicationFrame {
    /// Parse one CopyData payload. The leading byte selects the frame kind.
    pub fn parse(mut data: Bytes) -> Result<ReplicationFrame> {
        if data.is_empty() {
            return Err(Error::Protocol("empty replication frame".into()));
        }

        let tag = data.get_u8();
        match tag {
            b'w' => {
                if data.remaining() < XLOG_DATA_HEADER_LEN {
                    return Err(Error::Protocol(format!(
                        "XLogData header truncated: {} bytes",
                        data.remaining()
                    )));
                }
                let start_lsn = Lsn::new(data.get_u64());
                let end_lsn = Lsn::new(data.get_u64());
                let clock = data.get_i64();
                Ok(ReplicationFrame::XLogData {
                    start_lsn,
                    end_lsn,
                    clock,
                    payload: data,
                })
            }
            b'k' => {
                if data.remaining() < KEEPALIVE_BODY_LEN {
                    return Err(Error::Protocol(format!(
                        "keepalive truncated: {} bytes",
                        data.remaining()
                    )));
                }
                let wal_end = Lsn::new(data.get_u64());
                let clock = data.get_i64();
                let reply_requested = data.get_u8() != 0;
                Ok(ReplicationFrame::PrimaryKeepalive {
                    wal_end,
                    clock,
                    reply_requested,
                })
            }
            other => Ok(ReplicationFrame::Unknown(other)),
        }
    }
}

/// Client→server standby status update.
///
/// The engine only ever advances a single durable cursor, so all three
/// positions carry the same value: one past the last persisted commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    pub flushed: Lsn,
    pub applied: Lsn,
    pub written: Lsn,
    /// Client clock, µs since 2000-01-01.
    pub clock: i64,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// Status update advertising `cursor` on all three positions, stamped
    /// with the current clock.
    pub fn at(cursor: Lsn) -> Self {
        Self {
            flushed: cursor,
            applied: cursor,
            written: cursor,
            clock: utc_now_pg_micros(),
            reply_requested: false,
        }
    }

    /// Encode the `'r'` payload (sent wrapped in CopyData by the client).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(b'r');
        buf.put_u64(self.flushed.value());
        buf.put_u64(self.applied.value());
        buf.put_u64(self.written.value());
        buf.put_i64(self.clock);
        buf.put_u8(self.reply_requested as u8);
        buf.freeze()
    }
}
