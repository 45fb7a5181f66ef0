//! In-memory broker for tests/dev.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use courier_core::EventId;

use crate::broker::{BrokerError, DeliverySource, MessageBroker};
use crate::envelope::{Delivery, OutboundMessage};

/// In-memory direct exchange.
///
/// - Every published message is recorded (see [`InMemoryBroker::published`])
/// - Fan-out to bindings whose routing keys match (an empty binding gets everything)
/// - Fault injection: fail the next N publishes, or every publish of one message id
/// - No persistence; at-least-once is acceptable (subscribers must be idempotent)
#[derive(Debug)]
pub struct InMemoryBroker {
    exchange: String,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    closed: bool,
    published: Vec<OutboundMessage>,
    bindings: Vec<Binding>,
    next_faults: VecDeque<BrokerError>,
    message_faults: HashMap<EventId, BrokerError>,
    next_receipt: u64,
}

#[derive(Debug)]
struct Binding {
    routing_keys: HashSet<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Binding {
    fn matches(&self, routing_key: &str) -> bool {
        self.routing_keys.is_empty() || self.routing_keys.contains(routing_key)
    }
}

impl InMemoryBroker {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Bind a queue to the given routing keys (empty = all keys).
    pub fn bind<I, S>(&self, routing_keys: I) -> InMemorySubscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let binding = Binding {
            routing_keys: routing_keys.into_iter().map(Into::into).collect(),
            tx,
        };

        // If the lock is poisoned we still return a subscription;
        // it just never receives anything.
        if let Ok(mut inner) = self.inner.lock() {
            inner.bindings.push(binding);
        }

        InMemorySubscription {
            rx,
            acked: Vec::new(),
        }
    }

    /// Make the next `count` publishes fail with `error`.
    pub fn fail_next(&self, count: usize, error: BrokerError) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.next_faults.extend(std::iter::repeat_n(error, count));
        }
    }

    /// Make every publish of `message_id` fail with `error` (a poisoned message).
    pub fn fail_message(&self, message_id: EventId, error: BrokerError) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.message_faults.insert(message_id, error);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.next_faults.clear();
            inner.message_faults.clear();
        }
    }

    /// All messages accepted so far, in publish order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.inner
            .lock()
            .map(|inner| inner.published.clone())
            .unwrap_or_default()
    }

    pub fn published_ids(&self) -> Vec<EventId> {
        self.published().into_iter().map(|m| m.message_id).collect()
    }

    /// Stop accepting publishes and disconnect every binding.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
            inner.bindings.clear();
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new("courier.events")
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| BrokerError::Connection("in-memory broker lock poisoned".to_string()))?;

        if inner.closed {
            return Err(BrokerError::Closed);
        }
        if let Some(err) = inner.next_faults.pop_front() {
            tracing::debug!(message_id = %message.message_id, error = %err, "injected publish fault");
            return Err(err);
        }
        if let Some(err) = inner.message_faults.get(&message.message_id) {
            return Err(err.clone());
        }

        // Serialize even though nothing leaves the process, so payload errors
        // surface the same way they would with a real broker.
        message.body()?;

        inner.published.push(message.clone());
        inner.next_receipt += 1;
        let receipt = inner.next_receipt.to_string();
        let exchange = self.exchange.clone();
        let routing_key = message.routing_key.as_str();

        // Drop any dead subscribers while publishing.
        inner.bindings.retain(|b| {
            if !b.matches(routing_key) {
                return !b.tx.is_closed();
            }
            b.tx
                .send(Delivery {
                    message_id: message.message_id,
                    event_type: message.event_type.to_string(),
                    routing_key: routing_key.to_string(),
                    source: exchange.clone(),
                    payload: message.payload.clone(),
                    receipt: receipt.clone(),
                    redelivered: false,
                })
                .is_ok()
        });

        Ok(())
    }
}

/// A queue bound to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemorySubscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
    acked: Vec<EventId>,
}

impl InMemorySubscription {
    /// Message ids acknowledged through this subscription, in order.
    pub fn acked(&self) -> &[EventId] {
        &self.acked
    }
}

#[async_trait]
impl DeliverySource for InMemorySubscription {
    async fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(delivery)) => Ok(Some(delivery)),
            Ok(None) => Err(BrokerError::Closed),
            Err(_) => Ok(None),
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.acked.push(delivery.message_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_core::{EventType, RoutingKey};
    use serde_json::json;

    fn message(routing_key: &str) -> OutboundMessage {
        OutboundMessage {
            message_id: EventId::new(),
            event_type: EventType::parse(routing_key).unwrap(),
            routing_key: RoutingKey::parse(routing_key).unwrap(),
            aggregate_type: None,
            aggregate_id: None,
            created_at: Utc::now(),
            payload: json!({ "k": routing_key }),
        }
    }

    #[tokio::test]
    async fn routes_by_binding_key() {
        let broker = InMemoryBroker::default();
        let mut groups = broker.bind(["group.member_added"]);
        let mut everything = broker.bind(Vec::<String>::new());

        broker.publish(&message("group.member_added")).await.unwrap();
        broker.publish(&message("document.approved")).await.unwrap();

        let first = groups.next(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(first.routing_key, "group.member_added");
        assert!(groups.next(Duration::from_millis(20)).await.unwrap().is_none());

        let a = everything.next(Duration::from_millis(50)).await.unwrap().unwrap();
        let b = everything.next(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(a.routing_key, "group.member_added");
        assert_eq!(b.routing_key, "document.approved");
        assert_eq!(b.source, "courier.events");
    }

    #[tokio::test]
    async fn injected_faults_fail_then_clear() {
        let broker = InMemoryBroker::default();
        broker.fail_next(2, BrokerError::Connection("down".into()));

        assert!(broker.publish(&message("a.b")).await.is_err());
        assert!(broker.publish(&message("a.b")).await.is_err());
        assert!(broker.publish(&message("a.b")).await.is_ok());
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn poisoned_message_always_fails() {
        let broker = InMemoryBroker::default();
        let poisoned = message("a.b");
        broker.fail_message(poisoned.message_id, BrokerError::Rejected("too large".into()));

        assert!(broker.publish(&poisoned).await.is_err());
        assert!(broker.publish(&poisoned).await.is_err());
        assert!(broker.publish(&message("a.b")).await.is_ok());
    }

    #[tokio::test]
    async fn closed_broker_rejects_and_disconnects() {
        let broker = InMemoryBroker::default();
        let mut sub = broker.bind(["a.b"]);
        broker.close();

        assert_eq!(broker.publish(&message("a.b")).await, Err(BrokerError::Closed));
        assert_eq!(sub.next(Duration::from_millis(20)).await, Err(BrokerError::Closed));
    }
}
