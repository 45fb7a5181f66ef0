//! Outbox and ledger records, broker contracts, and the in-memory broker.
//!
//! Everything here is transport- and storage-agnostic. Concrete stores and the
//! Redis broker live in `courier-infra`.

pub mod broker;
pub mod envelope;
pub mod handler;
pub mod in_memory_broker;
pub mod incoming;
pub mod outbox;

pub use broker::{BrokerError, DeliverySource, MessageBroker};
pub use envelope::{Delivery, OutboundMessage};
pub use handler::{EventHandler, FnHandler, HandlerError};
pub use in_memory_broker::{InMemoryBroker, InMemorySubscription};
pub use incoming::IncomingEvent;
pub use outbox::{NewOutboxEvent, OutboxEvent, OutboxStatus, deadline_after};
