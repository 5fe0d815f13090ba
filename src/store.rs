//! Durable sink contract and batching.
//!
//! The engine never talks to the message store directly: everything a
//! committed transaction produces is folded into a [`SinkBatch`] and handed
//! to an [`EventStore`]. One source transaction maps to one store
//! transaction; the ack cursor only advances after that transaction
//! commits. Consumer messages carry `(consumer_id, commit_lsn, seq)` as
//! their idempotency key so WAL replay upserts instead of duplicating.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lsn::Lsn;

/// Upper bound on rows per bulk statement. Store implementations slice
/// each kind with [`SinkBatch`]'s chunk accessors.
pub const MAX_BATCH_CHUNK: usize = 1_000;

/// One message on an event consumer's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerEvent {
    pub consumer_id: String,
    pub commit_lsn: Lsn,
    pub seq: u64,
    pub trace_id: Uuid,
    pub payload: Value,
}

/// Latest-state row for a record consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerRecord {
    pub consumer_id: String,
    pub table_oid: u32,
    /// Primary-key values rendered to text, in key order.
    pub record_pks: Vec<String>,
    /// Delivery-grouping key: configured grouping columns joined by `,`,
    /// falling back to the concatenated primary key.
    pub group_id: String,
    pub commit_lsn: Lsn,
    pub seq: u64,
    pub data: Value,
}

/// Identity of a record row, used for deletions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub consumer_id: String,
    pub table_oid: u32,
    pub record_pks: Vec<String>,
}

/// One event on a pipeline's raw WAL stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEvent {
    pub pipeline_id: String,
    pub commit_lsn: Lsn,
    pub seq: u64,
    pub trace_id: Uuid,
    pub payload: Value,
}

/// Everything one committed source transaction writes, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct SinkBatch {
    pub slot_id: String,
    pub consumer_events: Vec<ConsumerEvent>,
    pub consumer_records: Vec<ConsumerRecord>,
    pub record_deletes: Vec<RecordKey>,
    pub wal_events: Vec<WalEvent>,
    /// Highest seq in the batch; becomes the slot's last processed seq.
    pub last_seq: u64,
    /// The source transaction's commit position. Persisted with the seq so
    /// a replayed commit is recognizable as already processed.
    pub commit_lsn: Lsn,
}

impl SinkBatch {
    pub fn new(slot_id: impl Into<String>) -> Self {
        Self {
            slot_id: slot_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.consumer_events.is_empty()
            && self.consumer_records.is_empty()
            && self.record_deletes.is_empty()
            && self.wal_events.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.consumer_events.len()
            + self.consumer_records.len()
            + self.record_deletes.len()
            + self.wal_events.len()
    }

    pub fn event_chunks(&self) -> impl Iterator<Item = &[ConsumerEvent]> {
        self.consumer_events.chunks(MAX_BATCH_CHUNK)
    }

    pub fn record_chunks(&self) -> impl Iterator<Item = &[ConsumerRecord]> {
        self.consumer_records.chunks(MAX_BATCH_CHUNK)
    }

    pub fn delete_chunks(&self) -> impl Iterator<Item = &[RecordKey]> {
        self.record_deletes.chunks(MAX_BATCH_CHUNK)
    }

    pub fn wal_event_chunks(&self) -> impl Iterator<Item = &[WalEvent]> {
        self.wal_events.chunks(MAX_BATCH_CHUNK)
    }
}

/// The durable store behind consumers and pipelines.
///
/// `transact` must apply the whole batch as one atomic unit, performing in
/// order: event inserts, record upserts, record deletes, WAL-event
/// inserts, last-processed-seq update. The provided implementation
/// composes the fine-grained operations without atomicity; real stores
/// override it with a database transaction.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_consumer_events(&self, events: Vec<ConsumerEvent>) -> Result<u64>;

    async fn insert_consumer_records(&self, records: Vec<ConsumerRecord>) -> Result<u64>;

    async fn delete_consumer_records(&self, keys: Vec<RecordKey>) -> Result<u64>;

    async fn insert_wal_events(&self, events: Vec<WalEvent>) -> Result<u64>;

    async fn put_last_processed_seq(&self, slot_id: &str, seq: u64) -> Result<()>;

    /// The slot's durable cursor: last assigned seq and the commit position
    /// it was assigned at. Seeds the engine's sequence counter on session
    /// start and lets replayed commits be skipped instead of re-sequenced.
    async fn last_processed(&self, slot_id: &str) -> Result<(u64, Lsn)>;

    async fn transact(&self, batch: SinkBatch) -> Result<u64> {
        let mut count = 0;
        for chunk in batch.event_chunks() {
            count += self.insert_consumer_events(chunk.to_vec()).await?;
        }
        for chunk in batch.record_chunks() {
            count += self.insert_consumer_records(chunk.to_vec()).await?;
        }
        for chunk in batch.delete_chunks() {
            count += self.delete_consumer_records(chunk.to_vec()).await?;
        }
        for chunk in batch.wal_event_chunks() {
            count += self.insert_wal_events(chunk.to_vec()).await?;
        }
        if batch.last_seq > 0 {
            self.put_last_processed_seq(&batch.slot_id, batch.last_seq)
                .await?;
        }
        Ok(count)
    }
}

/// In-process store for tests and local runs. A single mutex makes
/// `transact` naturally atomic; inserts upsert by idempotency key so WAL
/// replay is observable as idempotent.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<MemoryInner>,
    fail_next: AtomicU32,
}

#[derive(Default)]
struct MemoryInner {
    events: HashMap<(String, u64, u64), ConsumerEvent>,
    records: HashMap<RecordKey, ConsumerRecord>,
    wal_events: HashMap<(String, u64, u64), WalEvent>,
    /// slot id → (last seq, commit lsn it was assigned at)
    last: HashMap<String, (u64, u64)>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` transact calls fail. Exercises the retry path.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn consumer_events(&self) -> Vec<ConsumerEvent> {
        let inner = self.inner.lock().unwrap();
        let mut events: Vec<_> = inner.events.values().cloned().collect();
        events.sort_by_key(|e| e.seq);
        events
    }

    pub fn consumer_records(&self) -> Vec<ConsumerRecord> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<_> = inner.records.values().cloned().collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    pub fn wal_events(&self) -> Vec<WalEvent> {
        let inner = self.inner.lock().unwrap();
        let mut events: Vec<_> = inner.wal_events.values().cloned().collect();
        events.sort_by_key(|e| e.seq);
        events
    }

    pub fn record_for(&self, key: &RecordKey) -> Option<ConsumerRecord> {
        self.inner.lock().unwrap().records.get(key).cloned()
    }

    fn take_failure(&self) -> Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Persistence("injected store failure".into()));
        }
        Ok(())
    }

    fn apply(inner: &mut MemoryInner, batch: &SinkBatch) -> u64 {
        let mut count = 0;
        for event in &batch.consumer_events {
            inner.events.insert(
                (event.consumer_id.clone(), event.commit_lsn.value(), event.seq),
                event.clone(),
            );
            count += 1;
        }
        for record in &batch.consumer_records {
            let key = RecordKey {
                consumer_id: record.consumer_id.clone(),
                table_oid: record.table_oid,
                record_pks: record.record_pks.clone(),
            };
            inner.records.insert(key, record.clone());
            count += 1;
        }
        for key in &batch.record_deletes {
            if inner.records.remove(key).is_some() {
                count += 1;
            }
        }
        for event in &batch.wal_events {
            inner.wal_events.insert(
                (event.pipeline_id.clone(), event.commit_lsn.value(), event.seq),
                event.clone(),
            );
            count += 1;
        }
        if batch.last_seq > 0 {
            inner.last.insert(
                batch.slot_id.clone(),
                (batch.last_seq, batch.commit_lsn.value()),
            );
        }
        count
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_consumer_events(&self, events: Vec<ConsumerEvent>) -> Result<u64> {
        let batch = SinkBatch {
            consumer_events: events,
            ..Default::default()
        };
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::apply(&mut inner, &batch))
    }

    async fn insert_consumer_records(&self, records: Vec<ConsumerRecord>) -> Result<u64> {
        let batch = SinkBatch {
            consumer_records: records,
            ..Default::default()
        };
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::apply(&mut inner, &batch))
    }

    async fn delete_consumer_records(&self, keys: Vec<RecordKey>) -> Result<u64> {
        let batch = SinkBatch {
            record_deletes: keys,
            ..Default::default()
        };
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::apply(&mut inner, &batch))
    }

    async fn insert_wal_events(&self, events: Vec<WalEvent>) -> Result<u64> {
        let batch = SinkBatch {
            wal_events: events,
            ..Default::default()
        };
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::apply(&mut inner, &batch))
    }

    async fn put_last_processed_seq(&self, slot_id: &str, seq: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.last.entry(slot_id.to_string()).or_default().0 = seq;
        Ok(())
    }

    async fn last_processed(&self, slot_id: &str) -> Result<(u64, Lsn)> {
        let inner = self.inner.lock().unwrap();
        let (seq, lsn) = inner.last.get(slot_id).copied().unwrap_or_default();
        Ok((seq, Lsn(lsn)))
    }

    async fn transact(&self, batch: SinkBatch) -> Result<u64> {
        self.take_failure()?;
        let mut inner = self.inner.lock().unwrap();
        let count = Self::apply(&mut inner, &batch);
        debug!(rows = count, slot_id = %batch.slot_id, "memory store transaction applied");
        Ok(count)
    }
}
