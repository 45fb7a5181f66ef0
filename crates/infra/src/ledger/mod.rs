//! Incoming-event ledger: consumer-side deduplication.

pub mod in_memory;
pub mod postgres;
pub mod store;

pub use in_memory::InMemoryLedger;
pub use postgres::PostgresLedger;
pub use store::{IncomingEventLedger, LedgerCursor, LedgerError, RecordOutcome};
