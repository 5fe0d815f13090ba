//! Subscription routing.
//!
//! Each enriched change is matched against every consumer and pipeline in
//! the handler context. Matches become sink rows collected into a
//! [`SinkBatch`]; non-matches are recorded as filtered traces for
//! observability. Evaluation order is unspecified, so emissions are kept
//! commutative: nothing here depends on which subscription ran first.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::change::{Action, EnrichedChange};
use crate::store::{ConsumerEvent, ConsumerRecord, RecordKey, SinkBatch, WalEvent};

/// What a consumer's queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// One message per change.
    Event,
    /// Latest state per key.
    Record,
}

/// Predicate over `{schema, table, action}` plus optional per-row
/// column-equality filters. `None` matches anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub schema: Option<String>,
    pub table: Option<String>,
    pub actions: Option<Vec<Action>>,
    #[serde(default)]
    pub column_filters: Vec<ColumnFilter>,
}

/// Row-level filter: the named column must equal the given value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub column: String,
    pub equals: Value,
}

impl SubscriptionFilter {
    /// Match everything in a schema/table.
    pub fn for_table(schema: &str, table: &str) -> Self {
        Self {
            schema: Some(schema.to_string()),
            table: Some(table.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, change: &EnrichedChange) -> bool {
        if let Some(schema) = &self.schema {
            if schema != &change.schema {
                return false;
            }
        }
        if let Some(table) = &self.table {
            if table != &change.table {
                return false;
            }
        }
        if let Some(actions) = &self.actions {
            if !actions.contains(&change.action) {
                return false;
            }
        }
        self.column_filters.iter().all(|filter| {
            // Deletes carry their values in the old image.
            let row = if change.record.is_empty() {
                change.old_record.as_ref()
            } else {
                Some(&change.record)
            };
            row.and_then(|r| r.get(&filter.column))
                .map(|v| v == &filter.equals)
                .unwrap_or(false)
        })
    }
}

/// A durable subscription with a message queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consumer {
    pub id: String,
    pub name: String,
    pub kind: MessageKind,
    pub filter: SubscriptionFilter,
    /// Columns whose values form the record group id; empty means the
    /// primary key.
    #[serde(default)]
    pub group_columns: Vec<String>,
}

/// A durable subscription producing a raw WAL-event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub filter: SubscriptionFilter,
}

/// A consumer the routing pass skipped, kept for tracing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredTrace {
    pub consumer_id: String,
    pub seq: u64,
}

/// Everything one routing pass produced beyond the sink batch itself.
#[derive(Debug, Default)]
pub struct RoutedOutput {
    pub batch: SinkBatch,
    /// Pipeline ids with at least one WAL event in the batch.
    pub pipelines_touched: Vec<String>,
    /// Consumer ids with at least one emission in the batch.
    pub consumers_touched: Vec<String>,
    pub filtered: Vec<FilteredTrace>,
}

/// Route a committed transaction's changes to all subscriptions.
pub fn route(
    slot_id: &str,
    consumers: &[Consumer],
    pipelines: &[Pipeline],
    changes: &[EnrichedChange],
) -> RoutedOutput {
    let mut out = RoutedOutput {
        batch: SinkBatch::new(slot_id),
        ..Default::default()
    };

    for change in changes {
        let payload = serde_json::to_value(change).unwrap_or(Value::Null);

        for consumer in consumers {
            if !consumer.filter.matches(change) {
                trace!(consumer_id = %consumer.id, seq = change.seq, "filtered");
                out.filtered.push(FilteredTrace {
                    consumer_id: consumer.id.clone(),
                    seq: change.seq,
                });
                continue;
            }

            match consumer.kind {
                MessageKind::Event => {
                    out.batch.consumer_events.push(ConsumerEvent {
                        consumer_id: consumer.id.clone(),
                        commit_lsn: change.commit_lsn,
                        seq: change.seq,
                        trace_id: change.trace_id,
                        payload: payload.clone(),
                    });
                }
                MessageKind::Record => match change.action {
                    Action::Delete => {
                        out.batch.record_deletes.push(RecordKey {
                            consumer_id: consumer.id.clone(),
                            table_oid: change.relation_oid,
                            record_pks: render_values(&change.ids),
                        });
                    }
                    _ => {
                        let group_values = change.group_values(&consumer.group_columns);
                        out.batch.consumer_records.push(ConsumerRecord {
                            consumer_id: consumer.id.clone(),
                            table_oid: change.relation_oid,
                            record_pks: render_values(&change.ids),
                            group_id: render_values(&group_values).join(","),
                            commit_lsn: change.commit_lsn,
                            seq: change.seq,
                            data: Value::Object(change.record.clone()),
                        });
                    }
                },
            }
            push_unique(&mut out.consumers_touched, &consumer.id);
        }

        for pipeline in pipelines {
            if !pipeline.filter.matches(change) {
                continue;
            }
            out.batch.wal_events.push(WalEvent {
                pipeline_id: pipeline.id.clone(),
                commit_lsn: change.commit_lsn,
                seq: change.seq,
                trace_id: change.trace_id,
                payload: payload.clone(),
            });
            push_unique(&mut out.pipelines_touched, &pipeline.id);
        }

        out.batch.last_seq = out.batch.last_seq.max(change.seq);
        out.batch.commit_lsn = out.batch.commit_lsn.max(change.commit_lsn);
    }

    out
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}

/// Render key/group values as stable text. Strings stay bare so group ids
/// read naturally; everything else uses its JSON form.
fn render_values(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}
