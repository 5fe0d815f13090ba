//! End-to-end coverage of the decode → assemble → enrich → route →
//! persist → ack path against the in-memory store.

mod common;

use std::sync::Arc;

use common::{
    begin_payload, commit_payload, delete_payload, insert_payload, relation_payload, text,
    update_payload, Driver, Slot, COMMIT_TS_MICROS,
};
use pg_relay::{
    Consumer, EventStore, HandlerContext, Lsn, MemoryEventStore, MessageKind, Pipeline, RecordKey,
    StoreMessageHandler, SubscriptionFilter,
};
use serde_json::json;

const USERS_OID: u32 = 16384;

fn users_relation() -> bytes::Bytes {
    relation_payload(USERS_OID, "public", "users", b'd', &[("id", 23), ("name", 25)])
}

fn handler_with(
    store: Arc<MemoryEventStore>,
    consumers: Vec<Consumer>,
    pipelines: Vec<Pipeline>,
) -> StoreMessageHandler {
    let mut ctx = HandlerContext::new("slot-a");
    ctx.consumers = consumers;
    ctx.pipelines = pipelines;
    StoreMessageHandler::new(store, ctx)
}

fn event_consumer(id: &str) -> Consumer {
    Consumer {
        id: id.to_string(),
        name: id.to_string(),
        kind: MessageKind::Event,
        filter: SubscriptionFilter::for_table("public", "users"),
        group_columns: vec![],
    }
}

fn record_consumer(id: &str) -> Consumer {
    Consumer {
        id: id.to_string(),
        name: id.to_string(),
        kind: MessageKind::Record,
        filter: SubscriptionFilter::for_table("public", "users"),
        group_columns: vec![],
    }
}

fn catch_all_pipeline(id: &str) -> Pipeline {
    Pipeline {
        id: id.to_string(),
        name: id.to_string(),
        filter: SubscriptionFilter::default(),
    }
}

// A committed insert produces one enriched change and advances the ack
// cursor one past the commit.
#[tokio::test]
async fn insert_flows_to_consumer_and_acks() {
    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(store.clone(), vec![event_consumer("c1")], vec![]);
    let mut driver = Driver::new("slot-a", &["id"]);

    driver
        .feed_all(
            vec![
                users_relation(),
                begin_payload(0x1A0, COMMIT_TS_MICROS, 42),
                insert_payload(USERS_OID, &[text("1"), text("Paul")]),
                commit_payload(0x1A0, COMMIT_TS_MICROS),
            ],
            &handler,
        )
        .await
        .unwrap();

    let events = store.consumer_events();
    assert_eq!(events.len(), 1);
    let payload = &events[0].payload;
    assert_eq!(payload["action"], "insert");
    assert_eq!(payload["ids"], json!([1]));
    assert_eq!(payload["record"]["id"], json!(1));
    assert_eq!(payload["record"]["name"], json!("Paul"));
    assert_eq!(payload["commit_ts"], json!("2024-03-01T16:11:32.272722Z"));
    assert_eq!(events[0].commit_lsn, Lsn(0x1A0));

    assert_eq!(driver.ack.flushed(), Some(Lsn(0x1A1)));
    assert_eq!(store.last_processed("slot-a").await.unwrap().0, 1);
}

// An update under default replica identity has no old image, so the
// changes map is empty and the record holds the new row.
#[tokio::test]
async fn update_default_identity_has_empty_changes() {
    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(store.clone(), vec![event_consumer("c1")], vec![]);
    let mut driver = Driver::new("slot-a", &["id"]);

    driver
        .feed_all(
            vec![
                users_relation(),
                begin_payload(0x1A0, COMMIT_TS_MICROS, 42),
                update_payload(USERS_OID, None, &[text("1"), text("Chani")]),
                commit_payload(0x1A0, COMMIT_TS_MICROS),
            ],
            &handler,
        )
        .await
        .unwrap();

    let payload = &store.consumer_events()[0].payload;
    assert_eq!(payload["action"], "update");
    assert_eq!(payload["changes"], json!({}));
    assert_eq!(payload["record"]["name"], json!("Chani"));
}

// REPLICA IDENTITY FULL updates carry the old row; changed columns
// surface with their old values.
#[tokio::test]
async fn update_full_identity_diffs_old_values() {
    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(store.clone(), vec![event_consumer("c1")], vec![]);
    let mut driver = Driver::new("slot-a", &["id"]);

    driver
        .feed_all(
            vec![
                relation_payload(USERS_OID, "public", "users", b'f', &[("id", 23), ("name", 25)]),
                begin_payload(0x1A0, COMMIT_TS_MICROS, 42),
                update_payload(
                    USERS_OID,
                    Some((b'O', &[text("1"), text("Paul")])),
                    &[text("1"), text("Chani")],
                ),
                commit_payload(0x1A0, COMMIT_TS_MICROS),
            ],
            &handler,
        )
        .await
        .unwrap();

    let payload = &store.consumer_events()[0].payload;
    assert_eq!(payload["changes"], json!({"name": "Paul"}));
}

// A key-form delete exposes exactly the primary-key columns.
#[tokio::test]
async fn delete_key_form_exposes_pk_only() {
    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(store.clone(), vec![event_consumer("c1")], vec![]);
    let mut driver = Driver::new("slot-a", &["id"]);

    driver
        .feed_all(
            vec![
                users_relation(),
                begin_payload(0x1A0, COMMIT_TS_MICROS, 42),
                delete_payload(USERS_OID, b'K', &[text("1"), Slot::Null]),
                commit_payload(0x1A0, COMMIT_TS_MICROS),
            ],
            &handler,
        )
        .await
        .unwrap();

    let payload = &store.consumer_events()[0].payload;
    assert_eq!(payload["action"], "delete");
    assert_eq!(payload["ids"], json!([1]));
    assert_eq!(payload["old_record"], json!({"id": 1}));
}

// An array-typed column with quoted, comma-carrying elements.
#[tokio::test]
async fn array_column_casts_through_pipeline() {
    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(store.clone(), vec![event_consumer("c1")], vec![]);
    let mut driver = Driver::new("slot-a", &["id"]);

    driver
        .feed_all(
            vec![
                relation_payload(
                    USERS_OID,
                    "public",
                    "users",
                    b'd',
                    &[("id", 23), ("tags", 1009)],
                ),
                begin_payload(0x1A0, COMMIT_TS_MICROS, 42),
                insert_payload(
                    USERS_OID,
                    &[text("1"), text(r#"{"royal,interest",plain}"#)],
                ),
                commit_payload(0x1A0, COMMIT_TS_MICROS),
            ],
            &handler,
        )
        .await
        .unwrap();

    let payload = &store.consumer_events()[0].payload;
    assert_eq!(payload["record"]["tags"], json!(["royal,interest", "plain"]));
}

// A commit that disagrees with its begin terminates with a protocol
// error; nothing is persisted and nothing is acked.
#[tokio::test]
async fn commit_lsn_mismatch_is_fatal_without_ack() {
    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(store.clone(), vec![event_consumer("c1")], vec![]);
    let mut driver = Driver::new("slot-a", &["id"]);

    let err = driver
        .feed_all(
            vec![
                users_relation(),
                begin_payload(0x1A0, COMMIT_TS_MICROS, 42),
                insert_payload(USERS_OID, &[text("1"), text("Paul")]),
                commit_payload(0x1B0, COMMIT_TS_MICROS),
            ],
            &handler,
        )
        .await
        .unwrap_err();

    assert!(err.is_protocol_fatal());
    assert!(store.consumer_events().is_empty());
    assert_eq!(driver.ack.flushed(), None);
}

// Seqs are strictly increasing and contiguous within a
// transaction, and keep increasing across transactions.
#[tokio::test]
async fn seqs_are_contiguous_and_monotonic() {
    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(store.clone(), vec![event_consumer("c1")], vec![]);
    let mut driver = Driver::new("slot-a", &["id"]);

    driver.feed(users_relation(), &handler).await.unwrap();

    for (txn, base_lsn) in [(0u64, 0x200u64), (1, 0x300), (2, 0x400)] {
        driver
            .feed_all(
                vec![
                    begin_payload(base_lsn, COMMIT_TS_MICROS + txn as i64, 50 + txn as u32),
                    insert_payload(USERS_OID, &[text(&format!("{}", txn * 2)), text("a")]),
                    insert_payload(USERS_OID, &[text(&format!("{}", txn * 2 + 1)), text("b")]),
                    commit_payload(base_lsn, COMMIT_TS_MICROS + txn as i64),
                ],
                &handler,
            )
            .await
            .unwrap();
    }

    let seqs: Vec<u64> = store.consumer_events().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(store.last_processed("slot-a").await.unwrap().0, 6);
}

// After N committed transactions the cursor sits one past the
// Nth commit and not beyond.
#[tokio::test]
async fn ack_cursor_tracks_last_commit_exactly() {
    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(store.clone(), vec![], vec![catch_all_pipeline("p1")]);
    let mut driver = Driver::new("slot-a", &["id"]);

    driver.feed(users_relation(), &handler).await.unwrap();

    let commits = [0x200u64, 0x300, 0x400];
    for (i, lsn) in commits.iter().enumerate() {
        driver
            .feed_all(
                vec![
                    begin_payload(*lsn, COMMIT_TS_MICROS + i as i64, 60 + i as u32),
                    insert_payload(USERS_OID, &[text(&i.to_string()), text("x")]),
                    commit_payload(*lsn, COMMIT_TS_MICROS + i as i64),
                ],
                &handler,
            )
            .await
            .unwrap();

        // Monotone after every commit.
        assert_eq!(driver.ack.flushed(), Some(Lsn(lsn + 1)));
    }

    assert_eq!(driver.ack.flushed(), Some(Lsn(0x401)));
}

// Replaying the same WAL range upserts by
// (consumer_id, commit_lsn, seq) instead of duplicating.
#[tokio::test]
async fn wal_replay_is_idempotent() {
    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(
        store.clone(),
        vec![event_consumer("c1")],
        vec![catch_all_pipeline("p1")],
    );

    let payloads = || {
        vec![
            users_relation(),
            begin_payload(0x1A0, COMMIT_TS_MICROS, 42),
            insert_payload(USERS_OID, &[text("1"), text("Paul")]),
            insert_payload(USERS_OID, &[text("2"), text("Chani")]),
            commit_payload(0x1A0, COMMIT_TS_MICROS),
        ]
    };

    // First delivery.
    let mut driver = Driver::new("slot-a", &["id"]);
    driver.feed_all(payloads(), &handler).await.unwrap();
    assert_eq!(store.consumer_events().len(), 2);
    assert_eq!(store.wal_events().len(), 2);

    // Reconnect replays the same range: the fresh session seeds its cursor
    // from the store, recognizes the commit as already persisted, and acks
    // without writing new rows or minting new seqs.
    let mut replay = Driver::new("slot-a", &["id"]);
    replay.seed(&handler).await;
    replay.feed_all(payloads(), &handler).await.unwrap();

    let events = store.consumer_events();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(store.wal_events().len(), 2);
    assert_eq!(replay.ack.flushed(), Some(Lsn(0x1A1)));
}

// Record consumers: inserts upsert the latest state, deletes remove by
// (consumer, table, pks).
#[tokio::test]
async fn record_consumer_lifecycle() {
    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(store.clone(), vec![record_consumer("c2")], vec![]);
    let mut driver = Driver::new("slot-a", &["id"]);

    driver
        .feed_all(
            vec![
                users_relation(),
                begin_payload(0x200, COMMIT_TS_MICROS, 42),
                insert_payload(USERS_OID, &[text("1"), text("Paul")]),
                commit_payload(0x200, COMMIT_TS_MICROS),
                begin_payload(0x300, COMMIT_TS_MICROS + 1, 43),
                update_payload(USERS_OID, None, &[text("1"), text("Chani")]),
                commit_payload(0x300, COMMIT_TS_MICROS + 1),
            ],
            &handler,
        )
        .await
        .unwrap();

    let key = RecordKey {
        consumer_id: "c2".into(),
        table_oid: USERS_OID,
        record_pks: vec!["1".into()],
    };
    let record = store.record_for(&key).unwrap();
    assert_eq!(record.data["name"], json!("Chani"));
    assert_eq!(record.group_id, "1");

    driver
        .feed_all(
            vec![
                begin_payload(0x400, COMMIT_TS_MICROS + 2, 44),
                delete_payload(USERS_OID, b'K', &[text("1"), Slot::Null]),
                commit_payload(0x400, COMMIT_TS_MICROS + 2),
            ],
            &handler,
        )
        .await
        .unwrap();

    assert!(store.record_for(&key).is_none());
}

// Unchanged-TOAST markers survive to the record as the sentinel and never
// appear in the changes diff.
#[tokio::test]
async fn unchanged_toast_sentinel_flows_through() {
    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(store.clone(), vec![event_consumer("c1")], vec![]);
    let mut driver = Driver::new("slot-a", &["id"]);

    driver
        .feed_all(
            vec![
                relation_payload(USERS_OID, "public", "users", b'f', &[("id", 23), ("bio", 25)]),
                begin_payload(0x1A0, COMMIT_TS_MICROS, 42),
                update_payload(
                    USERS_OID,
                    Some((b'O', &[text("1"), text("long bio")])),
                    &[text("1"), Slot::Toast],
                ),
                commit_payload(0x1A0, COMMIT_TS_MICROS),
            ],
            &handler,
        )
        .await
        .unwrap();

    let payload = &store.consumer_events()[0].payload;
    assert_eq!(payload["record"]["bio"], json!(pg_relay::UNCHANGED_TOAST));
    assert_eq!(payload["changes"], json!({}));
}

// A transient store failure holds the ack; the retried transaction lands
// and only then does the cursor move.
#[tokio::test]
async fn persistence_failure_blocks_ack_until_retry_succeeds() {
    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(store.clone(), vec![event_consumer("c1")], vec![]);
    let mut driver = Driver::new("slot-a", &["id"]);

    driver.feed(users_relation(), &handler).await.unwrap();
    driver
        .feed_all(
            vec![
                begin_payload(0x1A0, COMMIT_TS_MICROS, 42),
                insert_payload(USERS_OID, &[text("1"), text("Paul")]),
            ],
            &handler,
        )
        .await
        .unwrap();

    store.fail_next(1);
    let err = driver
        .feed(commit_payload(0x1A0, COMMIT_TS_MICROS), &handler)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(driver.ack.flushed(), None);
    assert!(store.consumer_events().is_empty());

    // Redelivery of the same transaction after reconnect.
    let mut redelivery = Driver::new("slot-a", &["id"]);
    redelivery
        .feed_all(
            vec![
                users_relation(),
                begin_payload(0x1A0, COMMIT_TS_MICROS, 42),
                insert_payload(USERS_OID, &[text("1"), text("Paul")]),
                commit_payload(0x1A0, COMMIT_TS_MICROS),
            ],
            &handler,
        )
        .await
        .unwrap();

    assert_eq!(store.consumer_events().len(), 1);
    assert_eq!(redelivery.ack.flushed(), Some(Lsn(0x1A1)));
}

// Truncate, Type and Origin are accepted inside a transaction and
// discarded without disturbing it.
#[tokio::test]
async fn auxiliary_messages_are_discarded() {
    use bytes::{BufMut, BytesMut};

    let store = Arc::new(MemoryEventStore::new());
    let handler = handler_with(store.clone(), vec![event_consumer("c1")], vec![]);
    let mut driver = Driver::new("slot-a", &["id"]);

    let mut origin = BytesMut::new();
    origin.put_u8(b'O');
    origin.put_u64(0x100);
    origin.put_slice(b"upstream\0");

    let mut truncate = BytesMut::new();
    truncate.put_u8(b'T');
    truncate.put_u32(1);
    truncate.put_u8(0);
    truncate.put_u32(USERS_OID);

    driver
        .feed_all(
            vec![
                users_relation(),
                begin_payload(0x1A0, COMMIT_TS_MICROS, 42),
                origin.freeze(),
                insert_payload(USERS_OID, &[text("1"), text("Paul")]),
                truncate.freeze(),
                commit_payload(0x1A0, COMMIT_TS_MICROS),
            ],
            &handler,
        )
        .await
        .unwrap();

    assert_eq!(store.consumer_events().len(), 1);
    assert_eq!(driver.ack.flushed(), Some(Lsn(0x1A1)));
}

// Consumers whose predicate does not match receive nothing, while matching
// pipelines still get their WAL events in the same transaction.
#[tokio::test]
async fn routing_is_per_subscription() {
    let store = Arc::new(MemoryEventStore::new());
    let mut orders_only = event_consumer("c-orders");
    orders_only.filter = SubscriptionFilter::for_table("public", "orders");
    let handler = handler_with(
        store.clone(),
        vec![orders_only, event_consumer("c-users")],
        vec![catch_all_pipeline("p1")],
    );
    let mut driver = Driver::new("slot-a", &["id"]);

    driver
        .feed_all(
            vec![
                users_relation(),
                begin_payload(0x1A0, COMMIT_TS_MICROS, 42),
                insert_payload(USERS_OID, &[text("1"), text("Paul")]),
                commit_payload(0x1A0, COMMIT_TS_MICROS),
            ],
            &handler,
        )
        .await
        .unwrap();

    let events = store.consumer_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].consumer_id, "c-users");
    assert_eq!(store.wal_events().len(), 1);
    assert_eq!(store.wal_events()[0].pipeline_id, "p1");
}
