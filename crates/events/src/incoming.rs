//! Consumer-side ledger records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::{Entity, EventId};

use crate::envelope::Delivery;

/// One row per event the consuming process has seen.
///
/// Per event: unseen → recorded (unconsumed) → consumed. There is no way back;
/// `consumed_at` is written once, after the handler succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingEvent {
    /// Producer-assigned id (the dedup key).
    pub id: EventId,
    pub event_source: String,
    pub event_type: String,
    pub payload: JsonValue,
    /// Handler invocations that failed so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl Entity for IncomingEvent {
    type Id = EventId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl IncomingEvent {
    pub fn new(
        id: EventId,
        event_source: impl Into<String>,
        event_type: impl Into<String>,
        payload: JsonValue,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event_source: event_source.into(),
            event_type: event_type.into(),
            payload,
            attempts: 0,
            last_error: None,
            created_at,
            consumed_at: None,
        }
    }

    pub fn from_delivery(delivery: &Delivery, received_at: DateTime<Utc>) -> Self {
        Self::new(
            delivery.message_id,
            delivery.source.clone(),
            delivery.event_type.clone(),
            delivery.payload.clone(),
            received_at,
        )
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    /// Set `consumed_at` once. Returns `false` if it was already set.
    pub fn mark_consumed(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_consumed() {
            return false;
        }
        self.consumed_at = Some(now);
        true
    }

    /// Record a failed handler run; `consumed_at` stays unset.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
    }
}
