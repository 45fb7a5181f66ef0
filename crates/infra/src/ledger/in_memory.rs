use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use courier_core::EventId;
use courier_events::IncomingEvent;

use super::store::{IncomingEventLedger, LedgerCursor, LedgerError, RecordOutcome};

/// In-memory ledger for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    rows: RwLock<Vec<IncomingEvent>>,
    index: RwLock<HashMap<EventId, usize>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> LedgerError {
        LedgerError::Storage("ledger lock poisoned".to_string())
    }

    fn update<T>(
        &self,
        id: EventId,
        f: impl FnOnce(&mut IncomingEvent) -> T,
    ) -> Result<T, LedgerError> {
        let index = self.index.read().map_err(|_| Self::poisoned())?;
        let pos = *index.get(&id).ok_or(LedgerError::NotFound(id))?;
        let mut rows = self.rows.write().map_err(|_| Self::poisoned())?;
        rows.get_mut(pos).map(f).ok_or(LedgerError::NotFound(id))
    }
}

#[async_trait]
impl IncomingEventLedger for InMemoryLedger {
    async fn record_if_absent(&self, event: IncomingEvent) -> Result<RecordOutcome, LedgerError> {
        // Lock order: index, then rows.
        let mut index = self.index.write().map_err(|_| Self::poisoned())?;
        let mut rows = self.rows.write().map_err(|_| Self::poisoned())?;

        if let Some(&pos) = index.get(&event.id) {
            let existing = rows.get(pos).cloned().ok_or(LedgerError::NotFound(event.id))?;
            return Ok(RecordOutcome::Existing(existing));
        }

        index.insert(event.id, rows.len());
        rows.push(event);
        Ok(RecordOutcome::Recorded)
    }

    async fn mark_consumed(&self, id: EventId) -> Result<bool, LedgerError> {
        self.update(id, |e| e.mark_consumed(Utc::now()))
    }

    async fn record_failure(&self, id: EventId, error: &str) -> Result<(), LedgerError> {
        self.update(id, |e| e.record_failure(error))
    }

    async fn find_unconsumed_after(
        &self,
        cursor: Option<LedgerCursor>,
        limit: usize,
    ) -> Result<Vec<IncomingEvent>, LedgerError> {
        let rows = self.rows.read().map_err(|_| Self::poisoned())?;
        let mut unconsumed: Vec<_> = rows
            .iter()
            .filter(|e| !e.is_consumed() && cursor.is_none_or(|c| c.is_before(e)))
            .cloned()
            .collect();
        unconsumed.sort_by_key(LedgerCursor::after);
        unconsumed.truncate(limit);
        Ok(unconsumed)
    }

    async fn get(&self, id: EventId) -> Result<Option<IncomingEvent>, LedgerError> {
        let index = self.index.read().map_err(|_| Self::poisoned())?;
        let rows = self.rows.read().map_err(|_| Self::poisoned())?;
        Ok(index.get(&id).and_then(|&pos| rows.get(pos).cloned()))
    }
}
