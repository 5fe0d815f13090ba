//! # pg-relay
//!
//! A change-data-capture engine for PostgreSQL logical replication. It
//! attaches to a replication slot, decodes the WAL stream into typed row
//! changes, routes them to subscribed sinks (per-consumer message queues
//! and raw WAL pipelines), and advances the upstream acknowledgement
//! cursor only after the sink rows are durably persisted.
//!
//! ## Pipeline
//!
//! ```text
//! socket → frames → logical decoder → transaction assembler
//!        → enrichment (relation cache + type casts)
//!        → subscription router → EventStore (atomic per transaction)
//!        → standby status update (ack)
//! ```
//!
//! Delivery is at-least-once: a transaction whose persistence fails is
//! never acked, so the server re-delivers it after reconnect. Consumer
//! messages carry `(consumer_id, commit_lsn, seq)` so replay upserts
//! instead of duplicating.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pg_relay::{
//!     Engine, HandlerContext, MemoryEventStore, SlotConfig, StoreMessageHandler,
//! };
//!
//! #[tokio::main]
//! async fn main() -> pg_relay::Result<()> {
//!     let config = SlotConfig::from_env()?;
//!     let store = Arc::new(MemoryEventStore::new());
//!     let handler = Arc::new(StoreMessageHandler::new(
//!         store,
//!         HandlerContext::new(config.id.clone()),
//!     ));
//!
//!     let engine = Engine::new();
//!     engine.session(config, handler).run().await
//! }
//! ```
//!
//! ## PostgreSQL setup
//!
//! 1. `wal_level = logical` (plus slot/sender capacity) in `postgresql.conf`.
//! 2. `CREATE PUBLICATION my_pub FOR TABLE ...;`
//! 3. A role with `REPLICATION LOGIN` and `SELECT` on the published tables
//!    (the catalog connection resolves primary keys from `pg_index`).
//!
//! The engine creates the replication slot on first attach and resumes
//! from the slot's confirmed position on every reconnect.

/// Best-effort casting of textual column values to semantic JSON values.
pub mod cast;

/// Row changes, transaction frames and their enriched, sink-ready form.
pub mod change;

/// Configuration structures and environment loading.
pub mod config;

/// Error taxonomy and result alias.
pub mod error;

/// Message-handler contract and the store-backed implementation.
pub mod handler;

/// WAL positions.
pub mod lsn;

/// Wire protocol: replication client, frames, logical decoder, catalog.
pub mod postgres;

/// Relation metadata and the per-session cache.
pub mod relation;

/// Exponential backoff.
pub mod retry;

/// Subscription routing.
pub mod router;

/// Slot sessions, ack state, supervisor and engine.
pub mod session;

/// Durable sink contract and batching.
pub mod store;

/// Transaction assembly.
pub mod transaction;

pub use change::{Action, EnrichedChange, RowChange, TransactionFrame, UNCHANGED_TOAST};
pub use config::{ConnectionConfig, SlotConfig, SslMode};
pub use error::{Error, Result};
pub use handler::{
    HandlerContext, MessageHandler, SinkNotification, SinkNotifier, StoreMessageHandler,
};
pub use lsn::Lsn;
pub use relation::{Column, Relation, RelationCache, ReplicaIdentity};
pub use retry::{ExponentialBackoff, RetryConfig};
pub use router::{Consumer, MessageKind, Pipeline, SubscriptionFilter};
pub use session::{AckState, Engine, SlotSession, StatusRegistry};
pub use store::{
    ConsumerEvent, ConsumerRecord, EventStore, MemoryEventStore, RecordKey, SinkBatch, WalEvent,
};
pub use transaction::TransactionAssembler;

pub use tokio_util::sync::CancellationToken;
