//! In-memory outbox store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::EventId;
use courier_events::{NewOutboxEvent, OutboxEvent, OutboxStatus};

use super::store::{OutboxStats, OutboxStore, OutboxStoreError};

#[derive(Debug, Clone)]
struct Row {
    /// Insertion order; breaks `created_at` ties.
    seq: u64,
    event: OutboxEvent,
}

#[derive(Debug, Default)]
struct Table {
    rows: HashMap<EventId, Row>,
    next_seq: u64,
}

/// In-memory outbox table.
///
/// A single write lock around the table makes every operation atomic, which
/// is what the claim step needs to be safe across concurrent publish loops.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    table: RwLock<Table>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Total number of rows, any status.
    pub fn len(&self) -> usize {
        self.read().map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Table>, OutboxStoreError> {
        self.table
            .read()
            .map_err(|_| OutboxStoreError::Storage("outbox table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Table>, OutboxStoreError> {
        self.table
            .write()
            .map_err(|_| OutboxStoreError::Storage("outbox table lock poisoned".to_string()))
    }

    fn update<T>(
        &self,
        id: EventId,
        f: impl FnOnce(&mut OutboxEvent) -> Result<T, OutboxStoreError>,
    ) -> Result<T, OutboxStoreError> {
        let mut table = self.write()?;
        let row = table.rows.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;

        // Apply to a copy so a rejected transition leaves the row untouched.
        let mut event = row.event.clone();
        let out = f(&mut event)?;
        row.event = event;
        Ok(out)
    }

    fn sorted(table: &Table, filter: impl Fn(&OutboxEvent) -> bool) -> Vec<&Row> {
        let mut rows: Vec<_> = table.rows.values().filter(|r| filter(&r.event)).collect();
        rows.sort_by_key(|r| (r.event.created_at, r.seq));
        rows
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, OutboxStoreError> {
        let mut table = self.write()?;
        if table.rows.contains_key(&event.id) {
            return Err(OutboxStoreError::AlreadyExists(event.id));
        }

        let stored = event.into_event(Utc::now());
        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.insert(
            stored.id,
            Row {
                seq,
                event: stored.clone(),
            },
        );
        Ok(stored)
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        Ok(self.read()?.rows.get(&id).map(|r| r.event.clone()))
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let table = self.read()?;
        Ok(Self::sorted(&table, OutboxEvent::is_pending)
            .into_iter()
            .take(limit)
            .map(|r| r.event.clone())
            .collect())
    }

    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let now = Utc::now();
        let mut table = self.write()?;

        let ids: Vec<EventId> = Self::sorted(&table, |e| e.is_claimable(now))
            .into_iter()
            .take(limit)
            .map(|r| r.event.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = table.rows.get_mut(&id) {
                row.event.claim(worker_id, lease, now)?;
                claimed.push(row.event.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_published(&self, id: EventId) -> Result<(), OutboxStoreError> {
        self.update(id, |e| Ok(e.mark_published(Utc::now())?))
    }

    async fn mark_failed(&self, id: EventId, error: &str) -> Result<(), OutboxStoreError> {
        self.update(id, |e| Ok(e.mark_failed(error)?))
    }

    async fn requeue(
        &self,
        id: EventId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        self.update(id, |e| Ok(e.requeue(error, next_attempt_at)?))
    }

    async fn retry_failed(&self, id: EventId) -> Result<OutboxEvent, OutboxStoreError> {
        self.update(id, |e| {
            e.retry()?;
            Ok(e.clone())
        })
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let table = self.read()?;
        Ok(Self::sorted(&table, |e| e.status == OutboxStatus::Failed)
            .into_iter()
            .take(limit)
            .map(|r| r.event.clone())
            .collect())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let table = self.read()?;
        let mut stats = OutboxStats::default();
        for row in table.rows.values() {
            match row.event.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Published => stats.published += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(doc: &str) -> NewOutboxEvent {
        NewOutboxEvent::try_new("document.approved", json!({ "document_id": doc }))
            .unwrap()
            .with_aggregate("document", doc)
    }

    #[tokio::test]
    async fn insert_then_find_pending_in_fifo_order() {
        let store = InMemoryOutboxStore::new();
        let a = store.insert_event(event("a")).await.unwrap();
        let b = store.insert_event(event("b")).await.unwrap();
        let c = store.insert_event(event("c")).await.unwrap();

        let pending = store.find_pending(10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);

        let first_two = store.find_pending(2).await.unwrap();
        assert_eq!(first_two.len(), 2);
        assert_eq!(first_two[0].id, a.id);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = InMemoryOutboxStore::new();
        let id = EventId::new();
        store.insert_event(event("a").with_id(id)).await.unwrap();

        let err = store.insert_event(event("b").with_id(id)).await.unwrap_err();
        assert_eq!(err, OutboxStoreError::AlreadyExists(id));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn marks_are_compare_and_set_on_pending() {
        let store = InMemoryOutboxStore::new();
        let e = store.insert_event(event("a")).await.unwrap();

        store.mark_published(e.id).await.unwrap();
        let err = store.mark_failed(e.id, "late failure").await.unwrap_err();
        assert!(matches!(err, OutboxStoreError::InvalidTransition(_)));

        let row = store.get(e.id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Published);
        assert!(row.last_error.is_none());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = InMemoryOutboxStore::new();
        let id = EventId::new();
        assert_eq!(store.mark_published(id).await, Err(OutboxStoreError::NotFound(id)));
    }

    #[tokio::test]
    async fn claims_do_not_overlap_while_leased() {
        let store = InMemoryOutboxStore::new();
        for doc in ["a", "b", "c"] {
            store.insert_event(event(doc)).await.unwrap();
        }

        let lease = Duration::from_secs(30);
        let first = store.claim_pending("worker-1", 2, lease).await.unwrap();
        let second = store.claim_pending("worker-2", 10, lease).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(second.iter().all(|e| !first.iter().any(|f| f.id == e.id)));
        assert!(store.claim_pending("worker-3", 10, lease).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let store = InMemoryOutboxStore::new();
        let e = store.insert_event(event("a")).await.unwrap();

        let claimed = store.claim_pending("crashed", 10, Duration::ZERO).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let reclaimed = store.claim_pending("survivor", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, e.id);
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("survivor"));
    }

    #[tokio::test]
    async fn requeued_rows_wait_for_their_delay() {
        let store = InMemoryOutboxStore::new();
        let e = store.insert_event(event("a")).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(60);

        store.requeue(e.id, "connection reset", later).await.unwrap();

        assert_eq!(store.find_pending(10).await.unwrap().len(), 1);
        assert!(store.claim_pending("w", 10, Duration::from_secs(30)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_rows_can_be_retried_by_operator() {
        let store = InMemoryOutboxStore::new();
        let e = store.insert_event(event("a")).await.unwrap();
        store.mark_failed(e.id, "rejected").await.unwrap();

        assert_eq!(store.list_failed(10).await.unwrap().len(), 1);
        let retried = store.retry_failed(e.id).await.unwrap();
        assert_eq!(retried.status, OutboxStatus::Pending);
        assert!(store.list_failed(10).await.unwrap().is_empty());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats, OutboxStats { pending: 1, published: 0, failed: 0 });
    }
}
