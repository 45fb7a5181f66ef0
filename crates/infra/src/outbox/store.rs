//! Outbox store abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::{DomainError, EventId};
use courier_events::{NewOutboxEvent, OutboxEvent};

/// Outbox store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox event not found: {0}")]
    NotFound(EventId),
    #[error("outbox event already exists: {0}")]
    AlreadyExists(EventId),
    #[error("invalid status transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for OutboxStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { .. } | DomainError::Conflict(_) => {
                OutboxStoreError::InvalidTransition(err.to_string())
            }
            other => OutboxStoreError::Storage(other.to_string()),
        }
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub published: usize,
    pub failed: usize,
}

/// Durable table of outbox events.
///
/// All operations are point operations on a single row except the reads.
/// Status updates are compare-and-set on `status = pending`: marking a row that
/// already reached a terminal state fails with `InvalidTransition`.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Write a new pending row. All-or-nothing.
    async fn insert_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, OutboxStoreError>;

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError>;

    /// Up to `limit` pending rows, oldest `created_at` first.
    ///
    /// Includes rows waiting out a retry delay and rows leased to a worker;
    /// use [`OutboxStore::claim_pending`] to pick work.
    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// Atomically lease up to `limit` due, unleased pending rows to `worker_id`.
    ///
    /// Rows come back oldest first. A row whose lease has run out is
    /// claimable again, which is how work held by a crashed worker resumes.
    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// `status = published`, `published_at = now`.
    async fn mark_published(&self, id: EventId) -> Result<(), OutboxStoreError>;

    /// `status = failed` (terminal).
    async fn mark_failed(&self, id: EventId, error: &str) -> Result<(), OutboxStoreError>;

    /// Keep the row pending but delay it until `next_attempt_at`.
    async fn requeue(
        &self,
        id: EventId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    /// Operator action: move a failed row back to pending.
    async fn retry_failed(&self, id: EventId) -> Result<OutboxEvent, OutboxStoreError>;

    /// Up to `limit` failed rows, oldest first.
    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn insert_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, OutboxStoreError> {
        (**self).insert_event(event).await
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        (**self).get(id).await
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).find_pending(limit).await
    }

    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).claim_pending(worker_id, limit, lease).await
    }

    async fn mark_published(&self, id: EventId) -> Result<(), OutboxStoreError> {
        (**self).mark_published(id).await
    }

    async fn mark_failed(&self, id: EventId, error: &str) -> Result<(), OutboxStoreError> {
        (**self).mark_failed(id, error).await
    }

    async fn requeue(
        &self,
        id: EventId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        (**self).requeue(id, error, next_attempt_at).await
    }

    async fn retry_failed(&self, id: EventId) -> Result<OutboxEvent, OutboxStoreError> {
        (**self).retry_failed(id).await
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).list_failed(limit).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats().await
    }
}
