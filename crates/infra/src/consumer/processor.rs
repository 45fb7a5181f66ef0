//! Idempotent event processing on top of the incoming-event ledger.

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use courier_events::{Delivery, EventHandler, HandlerError, IncomingEvent};

use crate::ledger::{IncomingEventLedger, LedgerCursor, LedgerError, RecordOutcome};

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handler succeeded; the event is now consumed.
    Processed,
    /// Already consumed; nothing ran.
    Duplicate,
    /// Handler failed; the event stays unconsumed.
    Failed(HandlerError),
}

impl ProcessOutcome {
    /// Whether the delivery can be acknowledged to the broker.
    pub fn is_settled(&self) -> bool {
        matches!(self, ProcessOutcome::Processed | ProcessOutcome::Duplicate)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Result of a recovery pass over unconsumed ledger rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Runs a handler at most once per consumed event id.
///
/// Per delivery: record the id, skip it if already consumed, otherwise run
/// the handler and set `consumed_at` only on success. A recorded event whose
/// handler failed is retried on redelivery or by [`EventProcessor::recover`].
pub struct EventProcessor<L, H> {
    ledger: L,
    handler: H,
}

impl<L, H> EventProcessor<L, H>
where
    L: IncomingEventLedger,
    H: EventHandler,
{
    pub fn new(ledger: L, handler: H) -> Self {
        Self { ledger, handler }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub async fn process(&self, delivery: &Delivery) -> Result<ProcessOutcome, ProcessError> {
        self.process_event(IncomingEvent::from_delivery(delivery, Utc::now()))
            .await
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn process_event(&self, event: IncomingEvent) -> Result<ProcessOutcome, ProcessError> {
        let event = match self.ledger.record_if_absent(event.clone()).await? {
            RecordOutcome::Recorded => event,
            RecordOutcome::Existing(existing) if existing.is_consumed() => {
                debug!(event_id = %existing.id, "duplicate delivery ignored");
                return Ok(ProcessOutcome::Duplicate);
            }
            RecordOutcome::Existing(existing) => {
                debug!(event_id = %existing.id, attempts = existing.attempts, "retrying unconsumed event");
                existing
            }
        };

        self.run_handler(&event).await
    }

    /// Re-run the handler for every unconsumed ledger row, oldest first,
    /// reading the backlog `page_size` rows at a time.
    ///
    /// Each row is tried once per pass; rows that fail again stay unconsumed
    /// and do not block the rows behind them.
    pub async fn recover(&self, page_size: usize) -> Result<RecoveryReport, ProcessError> {
        let mut report = RecoveryReport::default();
        if page_size == 0 {
            return Ok(report);
        }

        let mut cursor = None;
        loop {
            let page = self.ledger.find_unconsumed_after(cursor, page_size).await?;
            let Some(last) = page.last() else { break };
            cursor = Some(LedgerCursor::after(last));
            report.scanned += page.len();

            for event in &page {
                match self.run_handler(event).await? {
                    ProcessOutcome::Failed(_) => report.failed += 1,
                    _ => report.processed += 1,
                }
            }

            if page.len() < page_size {
                break;
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                processed = report.processed,
                failed = report.failed,
                "recovered unconsumed events"
            );
        }
        Ok(report)
    }

    async fn run_handler(&self, event: &IncomingEvent) -> Result<ProcessOutcome, ProcessError> {
        match self.handler.handle(event).await {
            Ok(()) => {
                if self.ledger.mark_consumed(event.id).await? {
                    Ok(ProcessOutcome::Processed)
                } else {
                    // Another processor consumed it first.
                    Ok(ProcessOutcome::Duplicate)
                }
            }
            Err(err) => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %err,
                    "event handler failed"
                );
                self.ledger.record_failure(event.id, err.message()).await?;
                Ok(ProcessOutcome::Failed(err))
            }
        }
    }
}
