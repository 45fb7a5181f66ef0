//! Broker contracts (mechanics only).
//!
//! The outbox is the source of truth; the broker is only the distribution
//! channel. Publishing is **at-least-once**: a message can reach the broker
//! more than once (a crash between a successful publish and marking the row
//! published republishes it), so consumers must be idempotent.
//!
//! Two seams are defined here:
//!
//! - [`MessageBroker`]: producer side, used by the publish loop.
//! - [`DeliverySource`]: consumer side, used by the consumer worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::{Delivery, OutboundMessage};

/// Broker operation error.
///
/// The publish loop treats transient errors as retryable (the row is requeued
/// with backoff) and everything else as terminal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker operation timed out: {0}")]
    Timeout(String),

    #[error("publish not confirmed: {acknowledged}/{required} replicas acknowledged")]
    NotConfirmed { required: u32, acknowledged: u32 },

    #[error("broker client is closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("malformed delivery: {0}")]
    Malformed(String),
}

impl BrokerError {
    /// Whether retrying the same message later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_)
                | BrokerError::Timeout(_)
                | BrokerError::NotConfirmed { .. }
                | BrokerError::Closed
        )
    }
}

/// Producer side of a topic/exchange based broker.
///
/// Implementations send each message to a single well-known exchange using the
/// message's routing key, with persistent delivery.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> MessageBroker for Arc<B>
where
    B: MessageBroker + ?Sized,
{
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        (**self).publish(message).await
    }
}

/// Consumer side: a bound queue that hands out deliveries.
///
/// A delivery that is not acknowledged stays with the broker and is handed
/// out again later (redelivery).
#[async_trait]
pub trait DeliverySource: Send {
    /// Wait up to `timeout` for the next delivery. `Ok(None)` means nothing arrived.
    async fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Tell the broker the delivery has been handled.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;
}
