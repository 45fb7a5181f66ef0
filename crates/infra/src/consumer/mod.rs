//! Consumer side: idempotent processing and the worker runtime.

pub mod processor;
pub mod worker;

pub use processor::{EventProcessor, ProcessError, ProcessOutcome, RecoveryReport};
pub use worker::{ConsumerStats, ConsumerWorker, ConsumerWorkerConfig, WorkerHandle};
