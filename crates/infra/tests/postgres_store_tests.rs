//! Outbox store and ledger against a live Postgres.
//!
//! Covers the SQL the in-memory stores cannot: the `FOR UPDATE SKIP LOCKED`
//! claim, lease expiry, compare-and-set status updates and keyset paging.
//!
//! Run with: `cargo test -p courier-infra --test postgres_store_tests -- --ignored`

mod common;

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use common::test_db;
use courier_core::EventId;
use courier_events::{IncomingEvent, NewOutboxEvent, OutboxStatus};
use courier_infra::{
    IncomingEventLedger, LedgerCursor, OutboxStore, OutboxStoreError, PostgresLedger, PostgresOutboxStore,
    RecordOutcome,
};

fn approved(n: usize) -> NewOutboxEvent {
    NewOutboxEvent::try_new("document.approved", json!({ "document_id": format!("doc-{n}") })).unwrap()
}

async fn seed(store: &PostgresOutboxStore, n: usize) -> Vec<EventId> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        ids.push(store.insert_event(approved(i)).await.unwrap().id);
    }
    ids
}

// =========================================================================
// Outbox
// =========================================================================

#[tokio::test]
#[ignore = "Requires database - run locally with DATABASE_URL"]
async fn test_insert_and_publish_lifecycle() {
    let db = test_db().await;
    let store = PostgresOutboxStore::new(db.pool.clone());

    let event = store.insert_event(approved(1)).await.unwrap();
    assert_eq!(event.status, OutboxStatus::Pending);
    assert!(event.published_at.is_none());

    store.mark_published(event.id).await.unwrap();
    let row = store.get(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Published);
    assert!(row.published_at.unwrap() >= row.created_at);

    db.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires database - run locally with DATABASE_URL"]
async fn test_duplicate_id_is_rejected() {
    let db = test_db().await;
    let store = PostgresOutboxStore::new(db.pool.clone());

    let id = EventId::new();
    store.insert_event(approved(1).with_id(id)).await.unwrap();
    let err = store.insert_event(approved(2).with_id(id)).await.unwrap_err();
    assert_eq!(err, OutboxStoreError::AlreadyExists(id));

    db.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires database - run locally with DATABASE_URL"]
async fn test_insert_in_rolled_back_transaction_leaves_no_row() {
    let db = test_db().await;
    let store = PostgresOutboxStore::new(db.pool.clone());

    let mut tx = db.pool.begin().await.unwrap();
    let event = PostgresOutboxStore::insert_event_in_tx(&mut tx, approved(1)).await.unwrap();
    tx.rollback().await.unwrap();
    assert!(store.get(event.id).await.unwrap().is_none());

    let mut tx = db.pool.begin().await.unwrap();
    let event = PostgresOutboxStore::insert_event_in_tx(&mut tx, approved(2)).await.unwrap();
    tx.commit().await.unwrap();
    assert!(store.get(event.id).await.unwrap().is_some());

    db.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires database - run locally with DATABASE_URL"]
async fn test_status_updates_are_compare_and_set() {
    let db = test_db().await;
    let store = PostgresOutboxStore::new(db.pool.clone());
    let ids = seed(&store, 1).await;

    store.mark_published(ids[0]).await.unwrap();
    assert!(matches!(
        store.mark_failed(ids[0], "late failure").await,
        Err(OutboxStoreError::InvalidTransition(_))
    ));
    assert!(matches!(
        store.mark_published(ids[0]).await,
        Err(OutboxStoreError::InvalidTransition(_))
    ));

    let unknown = EventId::new();
    assert_eq!(store.mark_published(unknown).await, Err(OutboxStoreError::NotFound(unknown)));
    assert_eq!(
        store.requeue(unknown, "timeout", Utc::now()).await,
        Err(OutboxStoreError::NotFound(unknown))
    );

    db.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "Requires database - run locally with DATABASE_URL"]
async fn test_concurrent_claims_never_overlap() {
    let db = test_db().await;
    let store = PostgresOutboxStore::new(db.pool.clone());
    seed(&store, 40).await;

    let lease = Duration::from_secs(30);
    let claimers: Vec<_> = (0..4)
        .map(|n| {
            let store = store.clone();
            tokio::spawn(async move {
                let worker = format!("worker-{n}");
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_pending(&worker, 3, lease).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    assert!(batch.iter().all(|e| e.claimed_by.as_deref() == Some(worker.as_str())));
                    mine.extend(batch.into_iter().map(|e| e.id));
                }
                mine
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for claimer in claimers {
        for id in claimer.await.unwrap() {
            assert!(seen.insert(id), "row {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 40);

    db.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires database - run locally with DATABASE_URL"]
async fn test_claim_order_and_lease_expiry() {
    let db = test_db().await;
    let store = PostgresOutboxStore::new(db.pool.clone());
    let ids = seed(&store, 3).await;

    let lease = Duration::from_millis(300);
    let first = store.claim_pending("worker-a", 2, lease).await.unwrap();
    assert_eq!(first.iter().map(|e| e.id).collect::<Vec<_>>(), ids[..2]);

    // Live lease: only the third row is free.
    let second = store.claim_pending("worker-b", 10, lease).await.unwrap();
    assert_eq!(second.iter().map(|e| e.id).collect::<Vec<_>>(), ids[2..]);
    assert!(store.claim_pending("worker-b", 10, lease).await.unwrap().is_empty());

    // A crashed worker's lease runs out and the rows come back in order.
    tokio::time::sleep(lease + Duration::from_millis(200)).await;
    let reclaimed = store.claim_pending("worker-c", 10, lease).await.unwrap();
    assert_eq!(reclaimed.iter().map(|e| e.id).collect::<Vec<_>>(), ids);

    db.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires database - run locally with DATABASE_URL"]
async fn test_requeue_delays_and_retry_failed_resets() {
    let db = test_db().await;
    let store = PostgresOutboxStore::new(db.pool.clone());
    let ids = seed(&store, 2).await;
    let lease = Duration::from_secs(30);

    store.claim_pending("worker-a", 2, lease).await.unwrap();
    store
        .requeue(ids[0], "broker timeout", Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    store.mark_failed(ids[1], "payload rejected").await.unwrap();

    // Requeued row is not due; failed row is not pending.
    assert!(store.claim_pending("worker-a", 10, lease).await.unwrap().is_empty());
    let requeued = store.get(ids[0]).await.unwrap().unwrap();
    assert_eq!((requeued.status, requeued.attempts), (OutboxStatus::Pending, 1));
    assert!(requeued.claimed_by.is_none());

    let stats = store.stats().await.unwrap();
    assert_eq!((stats.pending, stats.published, stats.failed), (1, 0, 1));
    assert_eq!(store.list_failed(10).await.unwrap().len(), 1);

    let retried = store.retry_failed(ids[1]).await.unwrap();
    assert_eq!((retried.status, retried.attempts), (OutboxStatus::Pending, 0));
    assert!(matches!(
        store.retry_failed(ids[1]).await,
        Err(OutboxStoreError::InvalidTransition(_))
    ));
    assert_eq!(store.claim_pending("worker-a", 10, lease).await.unwrap().len(), 1);

    db.cleanup().await;
}

// =========================================================================
// Ledger
// =========================================================================

fn incoming(n: i64) -> IncomingEvent {
    let at = Utc::now() + chrono::Duration::milliseconds(n);
    IncomingEvent::new(EventId::new(), "documents", "document.approved", json!({ "n": n }), at)
}

#[tokio::test]
#[ignore = "Requires database - run locally with DATABASE_URL"]
async fn test_ledger_records_and_consumes_once() {
    let db = test_db().await;
    let ledger = PostgresLedger::new(db.pool.clone());
    let event = incoming(0);

    assert_eq!(ledger.record_if_absent(event.clone()).await.unwrap(), RecordOutcome::Recorded);
    assert!(matches!(
        ledger.record_if_absent(event.clone()).await.unwrap(),
        RecordOutcome::Existing(row) if row.id == event.id
    ));

    assert!(ledger.mark_consumed(event.id).await.unwrap());
    assert!(!ledger.mark_consumed(event.id).await.unwrap());

    db.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires database - run locally with DATABASE_URL"]
async fn test_ledger_pages_past_unconsumed_rows() {
    let db = test_db().await;
    let ledger = PostgresLedger::new(db.pool.clone());
    let mut ids = Vec::new();
    for n in 0..5 {
        let event = incoming(n);
        ids.push(event.id);
        ledger.record_if_absent(event).await.unwrap();
    }

    let mut cursor = None;
    let mut paged = Vec::new();
    loop {
        let page = ledger.find_unconsumed_after(cursor, 2).await.unwrap();
        let Some(last) = page.last() else { break };
        cursor = Some(LedgerCursor::after(last));
        paged.extend(page.iter().map(|e| e.id));
    }
    assert_eq!(paged, ids);

    ledger.record_failure(ids[0], "handler timeout").await.unwrap();
    assert_eq!(ledger.get(ids[0]).await.unwrap().unwrap().attempts, 1);

    db.cleanup().await;
}
