//! Slot sessions: the read → decode → assemble → handle → ack loop.
//!
//! One task owns the replication socket per slot. Frames are processed
//! strictly in order; a committed transaction is enriched, routed and
//! persisted before the next frame is read, and the standby cursor only
//! advances after persistence succeeds. The supervisor around the loop
//! reconnects with capped, jittered backoff and discards in-flight state,
//! which the server then re-delivers from the slot position.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::change::RowChange;
use crate::config::SlotConfig;
use crate::error::{Error, Result};
use crate::handler::MessageHandler;
use crate::lsn::Lsn;
use crate::postgres::catalog::CatalogPool;
use crate::postgres::client::{ReplicationClient, ReplicationStream};
use crate::postgres::decoder::decode_logical_message;
use crate::postgres::frame::{ReplicationFrame, StandbyStatusUpdate};
use crate::postgres::types::LogicalMessage;
use crate::relation::{Relation, RelationCache};
use crate::transaction::TransactionAssembler;

/// Standby cursor state for one session.
///
/// `advance` moves the cursor to one past a persisted commit and never
/// regresses; what goes on the wire therefore never exceeds the last
/// persisted transaction.
#[derive(Debug, Default)]
pub struct AckState {
    flushed: Option<Lsn>,
    observed_wal_end: Lsn,
}

impl AckState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, commit_lsn: Lsn) {
        let candidate = commit_lsn.successor();
        match self.flushed {
            Some(current) if candidate <= current => {}
            _ => self.flushed = Some(candidate),
        }
    }

    pub fn observe_wal_end(&mut self, wal_end: Lsn) {
        self.observed_wal_end = self.observed_wal_end.max(wal_end);
    }

    pub fn flushed(&self) -> Option<Lsn> {
        self.flushed
    }

    /// Cursor to answer a keepalive with: the flushed position, or the
    /// server's own wal_end before anything has committed.
    pub fn keepalive_cursor(&self) -> Lsn {
        self.flushed.unwrap_or(self.observed_wal_end)
    }
}

/// Process-wide `last_committed_at` per slot, for status readers.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    slots: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_committed(&self, slot_id: &str) {
        self.slots
            .lock()
            .unwrap()
            .insert(slot_id.to_string(), Utc::now());
    }

    pub fn last_committed_at(&self, slot_id: &str) -> Option<DateTime<Utc>> {
        self.slots.lock().unwrap().get(slot_id).copied()
    }

    pub fn remove(&self, slot_id: &str) {
        self.slots.lock().unwrap().remove(slot_id);
    }
}

/// Sequence assignment state, seeded from the store's durable cursor.
/// Commits at or below `persisted_lsn` are replays of already-persisted
/// transactions and must not be re-sequenced.
#[derive(Debug, Clone, Copy)]
struct SeqCursor {
    next_seq: u64,
    persisted_lsn: Lsn,
}

/// A supervised replication session for one slot.
pub struct SlotSession {
    config: SlotConfig,
    handler: Arc<dyn MessageHandler>,
    catalog: CatalogPool,
    status: StatusRegistry,
    cancel: CancellationToken,
}

impl SlotSession {
    pub fn new(
        config: SlotConfig,
        handler: Arc<dyn MessageHandler>,
        catalog: CatalogPool,
        status: StatusRegistry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            handler,
            catalog,
            status,
            cancel,
        }
    }

    /// Run until cancelled. Reconnects on any session error.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = self.config.replication.retry_config().backoff();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.run_once().await {
                Ok(()) | Err(Error::Shutdown) => break,
                Err(e) => {
                    error!(slot_id = %self.config.id, error = %e, "session failed, reconnecting");
                    self.catalog.release(&self.config.id).await;

                    let delay = backoff.next_delay();
                    debug!(slot_id = %self.config.id, ?delay, "backing off before reattach");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
            }
        }

        self.catalog.release(&self.config.id).await;
        self.status.remove(&self.config.id);
        info!(slot_id = %self.config.id, "session stopped");
        Ok(())
    }

    /// One connect-to-disconnect session.
    async fn run_once(&self) -> Result<()> {
        let mut client = ReplicationClient::connect(&self.config.connection).await?;
        client.create_replication_slot(&self.config.slot_name).await?;

        let identity = client.identify_system().await?;
        info!(
            slot_id = %self.config.id,
            system_id = %identity.system_id,
            xlogpos = %identity.xlogpos,
            "system identified"
        );

        // Zero lets the server resume from the slot's confirmed position.
        let mut stream = client
            .start_replication(&self.config.slot_name, &self.config.publication, Lsn::ZERO)
            .await?;

        // Session-scoped state: rebuilt fresh after every reconnect.
        let mut cache = RelationCache::new();
        let mut assembler = TransactionAssembler::new();
        let mut ack = AckState::new();
        let (seq, persisted_lsn) = self.handler.last_processed(&self.config.id).await?;
        let mut cursor = SeqCursor {
            next_seq: seq,
            persisted_lsn,
        };
        debug!(
            slot_id = %self.config.id,
            next_seq = cursor.next_seq,
            persisted_lsn = %cursor.persisted_lsn,
            "seeded sequence cursor"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    // A partially assembled transaction is dropped without
                    // ack; the server re-delivers it next time.
                    assembler.discard();
                    return Ok(());
                }
                frame = stream.next_frame() => {
                    match frame? {
                        None => {
                            return Err(Error::Connection("server closed the replication stream".into()));
                        }
                        Some(ReplicationFrame::XLogData { payload, .. }) => {
                            self.handle_logical(
                                payload,
                                &mut stream,
                                &mut cache,
                                &mut assembler,
                                &mut ack,
                                &mut cursor,
                            )
                            .await?;
                        }
                        Some(ReplicationFrame::PrimaryKeepalive { wal_end, reply_requested, .. }) => {
                            ack.observe_wal_end(wal_end);
                            if reply_requested {
                                let cursor = ack.keepalive_cursor();
                                stream
                                    .send_status_update(StandbyStatusUpdate::at(cursor))
                                    .await?;
                            }
                        }
                        Some(ReplicationFrame::Unknown(tag)) => {
                            warn!(tag = %(tag as char), "skipping unknown replication frame");
                        }
                    }
                }
            }
        }
    }

    async fn handle_logical(
        &self,
        payload: bytes::Bytes,
        stream: &mut ReplicationStream,
        cache: &mut RelationCache,
        assembler: &mut TransactionAssembler,
        ack: &mut AckState,
        cursor: &mut SeqCursor,
    ) -> Result<()> {
        match decode_logical_message(payload)? {
            LogicalMessage::Relation(body) => {
                let pk_columns = self.resolve_primary_keys(&body.namespace, &body.name).await?;
                debug!(
                    relation = %format!("{}.{}", body.namespace, body.name),
                    oid = body.oid,
                    pks = ?pk_columns,
                    "caching relation"
                );
                cache.insert(Relation::from_wire(&body, &pk_columns));
            }
            LogicalMessage::Begin(body) => assembler.on_begin(&body)?,
            LogicalMessage::Insert(body) => assembler.on_change(RowChange::Insert {
                relation_oid: body.relation_oid,
                new: body.new_tuple,
            })?,
            LogicalMessage::Update(body) => assembler.on_change(RowChange::Update {
                relation_oid: body.relation_oid,
                old: body.old_tuple,
                new: body.new_tuple,
            })?,
            LogicalMessage::Delete(body) => assembler.on_change(RowChange::Delete {
                relation_oid: body.relation_oid,
                kind: body.kind,
                old: body.old_tuple,
            })?,
            LogicalMessage::Commit(body) => {
                let frame = assembler.on_commit(&body)?;
                let commit_lsn = frame.commit_lsn;

                // A commit at or below the durable cursor was already
                // persisted atomically (crash before ack); re-persisting
                // would mint fresh seqs for the same messages. Ack it and
                // move on.
                if commit_lsn <= cursor.persisted_lsn && !cursor.persisted_lsn.is_zero() {
                    debug!(
                        slot_id = %self.config.id,
                        commit_lsn = %commit_lsn,
                        "commit already persisted, acking replay"
                    );
                } else {
                    let changes = frame.enrich(cache, &mut cursor.next_seq)?;
                    let ctx = self.handler.context(&self.config.id).await?;
                    self.persist_with_retry(&ctx, &changes).await?;
                    cursor.persisted_lsn = commit_lsn;
                }

                ack.advance(commit_lsn);
                if let Some(flushed) = ack.flushed() {
                    stream.send_status_update(StandbyStatusUpdate::at(flushed)).await?;
                }
                self.status.mark_committed(&self.config.id);
            }
            LogicalMessage::Truncate(body) => {
                debug!(relations = ?body.relation_oids, "discarding truncate message");
            }
            LogicalMessage::Type(body) => {
                debug!(oid = body.oid, name = %body.name, "discarding type message");
            }
            LogicalMessage::Origin(body) => {
                debug!(origin = %body.name, "discarding origin message");
            }
        }
        Ok(())
    }

    /// Primary keys for a relation, retried with backoff. The relation's
    /// changes stay buffered while this runs; giving up kills the session.
    async fn resolve_primary_keys(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let attempts = self.config.replication.catalog_attempts.max(1);
        let mut backoff = self.config.replication.retry_config().backoff();
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = match self
                .catalog
                .client_for(&self.config.id, &self.config.connection)
                .await
            {
                Ok(client) => client.primary_key_columns(schema, table).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(columns) => return Ok(columns),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        schema, table, attempt,
                        error = %e,
                        "catalog lookup failed, retrying"
                    );
                    // A broken catalog connection must not be reused.
                    self.catalog.release(&self.config.id).await;
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(Error::Shutdown),
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Catalog("catalog retries exhausted".into())))
    }

    /// Persist one transaction's routed output, retrying the whole batch.
    /// Exhausting the budget marks the slot unhealthy and kills the
    /// session without advancing the ack cursor.
    async fn persist_with_retry(
        &self,
        ctx: &crate::handler::HandlerContext,
        changes: &[crate::change::EnrichedChange],
    ) -> Result<u64> {
        let attempts = self.config.replication.persist_attempts.max(1);
        let mut backoff = self.config.replication.retry_config().backoff();

        for attempt in 1..=attempts {
            match self.handler.handle_messages(ctx, changes).await {
                Ok(count) => return Ok(count),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        slot_id = %self.config.id,
                        attempt,
                        error = %e,
                        "persistence failed, retrying transaction"
                    );
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(Error::Shutdown),
                    }
                }
                Err(e) => {
                    self.handler
                        .mark_unhealthy(&self.config.id, &e.to_string())
                        .await;
                    return Err(e);
                }
            }
        }

        Err(Error::Persistence("persistence retries exhausted".into()))
    }
}

/// Owns the shared registries and runs one session per slot.
pub struct Engine {
    catalog: CatalogPool,
    status: StatusRegistry,
    cancel: CancellationToken,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            catalog: CatalogPool::new(),
            status: StatusRegistry::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> &StatusRegistry {
        &self.status
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal every session to stop after its current transaction.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn session(&self, config: SlotConfig, handler: Arc<dyn MessageHandler>) -> SlotSession {
        SlotSession::new(
            config,
            handler,
            self.catalog.clone(),
            self.status.clone(),
            self.cancel.clone(),
        )
    }
}
