//! Infrastructure layer: outbox and ledger stores, publish loop, consumer
//! runtime, broker adapters, config.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod db;
pub mod ledger;
pub mod outbox;
pub mod publisher;


pub use config::{BrokerConfig, ConfigError, RelayConfig};
pub use consumer::{ConsumerWorker, ConsumerWorkerConfig, EventProcessor, ProcessOutcome};
pub use ledger::{
    IncomingEventLedger, InMemoryLedger, LedgerCursor, LedgerError, PostgresLedger, RecordOutcome,
};
pub use outbox::{InMemoryOutboxStore, OutboxStore, OutboxStoreError, PostgresOutboxStore};
pub use publisher::{PublishLoop, PublishLoopConfig, PublishLoopHandle, RetryPolicy, TickReport};
