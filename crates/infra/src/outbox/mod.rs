//! Outbox store: durable table of events awaiting publication.
//!
//! - `store`: the `OutboxStore` trait and its errors
//! - `in_memory`: lock-protected table for tests/dev
//! - `postgres`: `outbox_events` table, claim with `FOR UPDATE SKIP LOCKED`

pub mod in_memory;
pub mod postgres;
pub mod store;

pub use in_memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use store::{OutboxStats, OutboxStore, OutboxStoreError};
