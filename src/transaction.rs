//! Transaction assembly.
//!
//! Row changes are buffered between Begin and Commit and released as one
//! [`TransactionFrame`] when the commit arrives. A Commit whose LSN or
//! timestamp disagrees with the enclosing Begin means the stream is not
//! what we think it is: fatal, reconnect, no ack.

use tracing::{debug, trace};

use crate::change::{EnrichedChange, RowChange, TransactionFrame};
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::postgres::types::{pg_micros_to_utc, BeginBody, CommitBody};
use crate::relation::RelationCache;

enum State {
    Idle,
    Open {
        xid: u32,
        final_lsn: Lsn,
        timestamp: i64,
        changes: Vec<RowChange>,
    },
}

/// Begin/Open/Commit state machine, one per session.
pub struct TransactionAssembler {
    state: State,
}

impl Default for TransactionAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionAssembler {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open { .. })
    }

    pub fn on_begin(&mut self, begin: &BeginBody) -> Result<()> {
        match self.state {
            State::Idle => {
                trace!(xid = begin.xid, lsn = %begin.final_lsn, "transaction begin");
                self.state = State::Open {
                    xid: begin.xid,
                    final_lsn: begin.final_lsn,
                    timestamp: begin.timestamp,
                    changes: Vec::new(),
                };
                Ok(())
            }
            State::Open { xid, .. } => Err(Error::Protocol(format!(
                "Begin for xid {} while xid {} is open",
                begin.xid, xid
            ))),
        }
    }

    pub fn on_change(&mut self, change: RowChange) -> Result<()> {
        match &mut self.state {
            State::Open { changes, .. } => {
                changes.push(change);
                Ok(())
            }
            State::Idle => Err(Error::Protocol(format!(
                "{} change outside a transaction",
                change.action()
            ))),
        }
    }

    /// Close the transaction and hand back its changes in source order.
    pub fn on_commit(&mut self, commit: &CommitBody) -> Result<TransactionFrame> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Open {
                xid,
                final_lsn,
                timestamp,
                changes,
            } => {
                if commit.commit_lsn != final_lsn {
                    return Err(Error::Protocol(format!(
                        "commit lsn {} disagrees with begin lsn {} (xid {})",
                        commit.commit_lsn, final_lsn, xid
                    )));
                }
                if commit.timestamp != timestamp {
                    return Err(Error::Protocol(format!(
                        "commit timestamp {} disagrees with begin timestamp {} (xid {})",
                        commit.timestamp, timestamp, xid
                    )));
                }

                debug!(xid, lsn = %final_lsn, changes = changes.len(), "transaction committed");
                Ok(TransactionFrame {
                    xid,
                    commit_lsn: commit.commit_lsn,
                    commit_ts: pg_micros_to_utc(commit.timestamp),
                    changes,
                })
            }
            State::Idle => Err(Error::Protocol("Commit without Begin".into())),
        }
    }

    /// Drop a partially assembled transaction (reconnect or stop). The
    /// server re-delivers it from the slot position.
    pub fn discard(&mut self) {
        if let State::Open { xid, changes, .. } = &self.state {
            debug!(xid, buffered = changes.len(), "discarding in-flight transaction");
        }
        self.state = State::Idle;
    }
}

impl TransactionFrame {
    /// Join every change to its relation and assign sequence numbers.
    /// `next_seq` is the engine's global counter; it advances by one per
    /// change, so seqs are contiguous within the transaction and strictly
    /// increasing across transactions.
    pub fn enrich(
        &self,
        cache: &RelationCache,
        next_seq: &mut u64,
    ) -> Result<Vec<EnrichedChange>> {
        let mut enriched = Vec::with_capacity(self.changes.len());
        for change in &self.changes {
            let relation = cache.get(change.relation_oid()).ok_or_else(|| {
                Error::Protocol(format!(
                    "change references relation {} with no cached entry",
                    change.relation_oid()
                ))
            })?;
            *next_seq += 1;
            enriched.push(EnrichedChange::build(
                change,
                relation,
                self.commit_lsn,
                self.commit_ts,
                *next_seq,
            )?);
        }
        Ok(enriched)
    }
}
