//! Incoming-event ledger abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::EventId;
use courier_events::IncomingEvent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("incoming event not found: {0}")]
    NotFound(EventId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of [`IncomingEventLedger::record_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First time this id was seen; a new unconsumed row exists.
    Recorded,
    /// The id was already recorded; here is the stored row.
    Existing(IncomingEvent),
}

/// Position in the unconsumed backlog: the `(created_at, id)` of the last row read.
///
/// Rows are read in `(created_at, id)` order, so resuming after a cursor never
/// returns a row twice in one pass, even when earlier rows are still unconsumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LedgerCursor {
    pub created_at: DateTime<Utc>,
    pub id: EventId,
}

impl LedgerCursor {
    pub fn after(event: &IncomingEvent) -> Self {
        Self {
            created_at: event.created_at,
            id: event.id,
        }
    }

    pub fn is_before(&self, event: &IncomingEvent) -> bool {
        *self < Self::after(event)
    }
}

/// Per-service record of every event id it has received.
///
/// Recording is insert-if-absent on the primary key, so two concurrent
/// deliveries of one id cannot both create a row.
#[async_trait]
pub trait IncomingEventLedger: Send + Sync {
    async fn record_if_absent(&self, event: IncomingEvent) -> Result<RecordOutcome, LedgerError>;

    /// Set `consumed_at = now` if still unset. Returns whether a row changed.
    async fn mark_consumed(&self, id: EventId) -> Result<bool, LedgerError>;

    /// Count a failed handler run; `consumed_at` is left alone.
    async fn record_failure(&self, id: EventId, error: &str) -> Result<(), LedgerError>;

    /// Up to `limit` rows with `consumed_at` unset, oldest first.
    async fn find_unconsumed(&self, limit: usize) -> Result<Vec<IncomingEvent>, LedgerError> {
        self.find_unconsumed_after(None, limit).await
    }

    /// Like [`find_unconsumed`](Self::find_unconsumed), starting strictly after `cursor`.
    async fn find_unconsumed_after(
        &self,
        cursor: Option<LedgerCursor>,
        limit: usize,
    ) -> Result<Vec<IncomingEvent>, LedgerError>;

    async fn get(&self, id: EventId) -> Result<Option<IncomingEvent>, LedgerError>;
}

#[async_trait]
impl<L> IncomingEventLedger for Arc<L>
where
    L: IncomingEventLedger + ?Sized,
{
    async fn record_if_absent(&self, event: IncomingEvent) -> Result<RecordOutcome, LedgerError> {
        (**self).record_if_absent(event).await
    }

    async fn mark_consumed(&self, id: EventId) -> Result<bool, LedgerError> {
        (**self).mark_consumed(id).await
    }

    async fn record_failure(&self, id: EventId, error: &str) -> Result<(), LedgerError> {
        (**self).record_failure(id, error).await
    }

    async fn find_unconsumed(&self, limit: usize) -> Result<Vec<IncomingEvent>, LedgerError> {
        (**self).find_unconsumed(limit).await
    }

    async fn find_unconsumed_after(
        &self,
        cursor: Option<LedgerCursor>,
        limit: usize,
    ) -> Result<Vec<IncomingEvent>, LedgerError> {
        (**self).find_unconsumed_after(cursor, limit).await
    }

    async fn get(&self, id: EventId) -> Result<Option<IncomingEvent>, LedgerError> {
        (**self).get(id).await
    }
}
