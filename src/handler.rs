//! Message handling: the seam between the replication session and sinks.
//!
//! The session resolves a [`HandlerContext`] per committed transaction,
//! which is the hot-reload point for consumer and pipeline definitions,
//! then hands the enriched changes over. The store-backed handler routes
//! them, persists the result atomically, publishes in-process
//! notifications for pipelines that received events, and keeps per-sink
//! health marks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::change::EnrichedChange;
use crate::error::Result;
use crate::lsn::Lsn;
use crate::router::{route, Consumer, Pipeline};
use crate::store::EventStore;

/// The current set of subscriptions for a slot.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    pub slot_id: String,
    pub consumers: Vec<Consumer>,
    pub pipelines: Vec<Pipeline>,
}

impl HandlerContext {
    pub fn new(slot_id: impl Into<String>) -> Self {
        Self {
            slot_id: slot_id.into(),
            ..Default::default()
        }
    }
}

/// Consumes enriched changes for a slot.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Resolve the current context. Called per transaction so definition
    /// changes take effect without restarting the session.
    async fn context(&self, slot_id: &str) -> Result<HandlerContext>;

    /// Route and persist one committed transaction's changes. Returns the
    /// number of sink rows written. Must be idempotent under WAL replay.
    async fn handle_messages(
        &self,
        ctx: &HandlerContext,
        changes: &[EnrichedChange],
    ) -> Result<u64>;

    /// The slot's durable cursor `(last seq, commit lsn)`; seeds the
    /// engine's sequence counter and replay detection on session start.
    async fn last_processed(&self, slot_id: &str) -> Result<(u64, Lsn)>;

    /// Persistence gave up after its retry budget; surface it.
    async fn mark_unhealthy(&self, _slot_id: &str, _reason: &str) {}
}

/// In-process notification published after a store transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkNotification {
    WalEventInserted { pipeline_id: String },
}

/// Broadcast bus for sink notifications. Subscribers that lag simply miss
/// old notifications; the durable data is in the store.
#[derive(Clone)]
pub struct SinkNotifier {
    tx: broadcast::Sender<SinkNotification>,
}

impl Default for SinkNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SinkNotification> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: SinkNotification) {
        // No receivers is fine.
        let _ = self.tx.send(notification);
    }
}

/// Health mark for one consumer or pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkHealth {
    pub healthy: bool,
    pub changed_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// [`MessageHandler`] backed by an [`EventStore`].
pub struct StoreMessageHandler {
    store: Arc<dyn EventStore>,
    context: RwLock<HandlerContext>,
    notifier: SinkNotifier,
    health: Mutex<HashMap<String, SinkHealth>>,
}

impl StoreMessageHandler {
    pub fn new(store: Arc<dyn EventStore>, context: HandlerContext) -> Self {
        Self {
            store,
            context: RwLock::new(context),
            notifier: SinkNotifier::new(),
            health: Mutex::new(HashMap::new()),
        }
    }

    /// Swap in a new set of consumers and pipelines. The next transaction
    /// sees the new context.
    pub fn replace_context(&self, context: HandlerContext) {
        debug!(
            slot_id = %context.slot_id,
            consumers = context.consumers.len(),
            pipelines = context.pipelines.len(),
            "handler context replaced"
        );
        *self.context.write().unwrap() = context;
    }

    pub fn notifier(&self) -> &SinkNotifier {
        &self.notifier
    }

    pub fn health_of(&self, sink_id: &str) -> Option<SinkHealth> {
        self.health.lock().unwrap().get(sink_id).cloned()
    }

    fn mark(&self, sink_ids: &[String], healthy: bool, reason: Option<&str>) {
        let mut health = self.health.lock().unwrap();
        for id in sink_ids {
            health.insert(
                id.clone(),
                SinkHealth {
                    healthy,
                    changed_at: Utc::now(),
                    reason: reason.map(str::to_string),
                },
            );
        }
    }
}

#[async_trait]
impl MessageHandler for StoreMessageHandler {
    async fn context(&self, slot_id: &str) -> Result<HandlerContext> {
        let mut ctx = self.context.read().unwrap().clone();
        ctx.slot_id = slot_id.to_string();
        Ok(ctx)
    }

    async fn handle_messages(
        &self,
        ctx: &HandlerContext,
        changes: &[EnrichedChange],
    ) -> Result<u64> {
        if changes.is_empty() {
            return Ok(0);
        }

        let routed = route(&ctx.slot_id, &ctx.consumers, &ctx.pipelines, changes);
        debug!(
            slot_id = %ctx.slot_id,
            rows = routed.batch.row_count(),
            filtered = routed.filtered.len(),
            "routed transaction"
        );

        // Even a fully filtered transaction advances the seq cursor.
        let count = self.store.transact(routed.batch).await?;

        for pipeline_id in &routed.pipelines_touched {
            self.notifier.publish(SinkNotification::WalEventInserted {
                pipeline_id: pipeline_id.clone(),
            });
        }
        self.mark(&routed.consumers_touched, true, None);
        self.mark(&routed.pipelines_touched, true, None);

        Ok(count)
    }

    async fn last_processed(&self, slot_id: &str) -> Result<(u64, Lsn)> {
        self.store.last_processed(slot_id).await
    }

    async fn mark_unhealthy(&self, slot_id: &str, reason: &str) {
        warn!(slot_id, reason, "marking slot sinks unhealthy");
        let ctx = self.context.read().unwrap().clone();
        let consumer_ids: Vec<String> = ctx.consumers.iter().map(|c| c.id.clone()).collect();
        let pipeline_ids: Vec<String> = ctx.pipelines.iter().map(|p| p.id.clone()).collect();
        self.mark(&consumer_ids, false, Some(reason));
        self.mark(&pipeline_ids, false, Some(reason));
    }
}
