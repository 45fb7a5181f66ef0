//! Outbox records: one row per emitted fact.
//!
//! An [`OutboxEvent`] is written in the same logical operation as the business
//! change it describes and is then drained by the publish loop. Its status only
//! moves forward:
//!
//! ```text
//! pending ──publish ok──────────────▶ published
//!    │ ▲
//!    │ └──transient error (requeue)──┐
//!    ├───────────────────────────────┘
//!    └──permanent error / exhausted──▶ failed ──(operator retry)──▶ pending
//! ```
//!
//! The loop never moves a row out of a terminal state; only an explicit
//! operator retry does.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::{DomainError, DomainResult, Entity, EventId, EventType, RoutingKey};

use crate::envelope::OutboundMessage;

/// `now + delay`, saturating at the latest representable instant.
pub fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Delivery status of an outbox row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be published (or requeued after a transient failure).
    Pending,
    /// Accepted by the broker.
    Published,
    /// Gave up; needs operator attention.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::Failed)
    }
}

impl core::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(DomainError::validation(format!("unknown outbox status: {other}"))),
        }
    }
}

/// An event to be written to the outbox (not yet persisted).
///
/// The routing key defaults to the event type; aggregate coordinates are
/// optional and only used for downstream routing/debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub id: EventId,
    pub event_type: EventType,
    pub routing_key: Option<RoutingKey>,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub payload: JsonValue,
}

impl NewOutboxEvent {
    pub fn new(event_type: EventType, payload: JsonValue) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            routing_key: None,
            aggregate_type: None,
            aggregate_id: None,
            payload,
        }
    }

    /// Validate a raw event type name and build the event.
    pub fn try_new(event_type: impl Into<String>, payload: JsonValue) -> DomainResult<Self> {
        Ok(Self::new(EventType::parse(event_type)?, payload))
    }

    /// Build an event from any serializable payload.
    pub fn from_serializable<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
    ) -> DomainResult<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| DomainError::validation(format!("payload serialization failed: {e}")))?;
        Self::try_new(event_type, payload)
    }

    /// Use a producer-chosen id instead of a fresh UUIDv7.
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn with_aggregate(
        mut self,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn with_routing_key(mut self, routing_key: RoutingKey) -> Self {
        self.routing_key = Some(routing_key);
        self
    }

    /// Routing key the row will be published under.
    pub fn effective_routing_key(&self) -> RoutingKey {
        self.routing_key
            .clone()
            .unwrap_or_else(|| RoutingKey::from(&self.event_type))
    }

    /// Materialize the pending row as it is stored at `created_at`.
    pub fn into_event(self, created_at: DateTime<Utc>) -> OutboxEvent {
        let routing_key = self.effective_routing_key();
        OutboxEvent {
            id: self.id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            routing_key,
            payload: self.payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            claimed_by: None,
            claimed_until: None,
            created_at,
            published_at: None,
        }
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub event_type: EventType,
    pub routing_key: RoutingKey,
    pub payload: JsonValue,
    pub status: OutboxStatus,
    /// Publish attempts made so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time a requeued row is eligible again (`None` = immediately).
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Worker currently holding the row's lease.
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Set iff `status == Published`.
    pub published_at: Option<DateTime<Utc>>,
}

impl Entity for OutboxEvent {
    type Id = EventId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl OutboxEvent {
    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }

    /// Pending and past its backoff delay.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Due and not leased to a worker (or the lease has run out).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && self.claimed_until.is_none_or(|until| until <= now)
    }

    /// Lease the row to `worker_id` for `lease`.
    pub fn claim(
        &mut self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.is_pending() {
            return Err(DomainError::invalid_transition(self.status, "claimed"));
        }
        if !self.is_claimable(now) {
            return Err(DomainError::conflict(format!(
                "event {} is leased by {}",
                self.id,
                self.claimed_by.as_deref().unwrap_or("<unknown>")
            )));
        }
        self.claimed_by = Some(worker_id.to_string());
        self.claimed_until = Some(deadline_after(now, lease));
        Ok(())
    }

    /// Record a successful publish.
    pub fn mark_published(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_pending(OutboxStatus::Published)?;
        self.status = OutboxStatus::Published;
        self.attempts += 1;
        // Clock skew between writer and publisher must not break published_at >= created_at.
        self.published_at = Some(now.max(self.created_at));
        self.release();
        Ok(())
    }

    /// Record a terminal publish failure.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> DomainResult<()> {
        self.ensure_pending(OutboxStatus::Failed)?;
        self.status = OutboxStatus::Failed;
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.release();
        Ok(())
    }

    /// Record a transient failure and push the row back for a later attempt.
    pub fn requeue(
        &mut self,
        error: impl Into<String>,
        next_attempt_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_pending(OutboxStatus::Pending)?;
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.next_attempt_at = Some(next_attempt_at);
        self.release();
        Ok(())
    }

    /// Operator action: give a failed row a fresh start.
    pub fn retry(&mut self) -> DomainResult<()> {
        if self.status != OutboxStatus::Failed {
            return Err(DomainError::invalid_transition(self.status, OutboxStatus::Pending));
        }
        self.status = OutboxStatus::Pending;
        self.attempts = 0;
        self.last_error = None;
        self.next_attempt_at = None;
        self.release();
        Ok(())
    }

    /// Wire representation handed to the broker.
    pub fn to_message(&self) -> OutboundMessage {
        OutboundMessage {
            message_id: self.id,
            event_type: self.event_type.clone(),
            routing_key: self.routing_key.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            created_at: self.created_at,
            payload: self.payload.clone(),
        }
    }

    fn ensure_pending(&self, to: OutboxStatus) -> DomainResult<()> {
        if self.is_pending() {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(self.status, to))
        }
    }

    fn release(&mut self) {
        self.claimed_by = None;
        self.claimed_until = None;
    }
}
