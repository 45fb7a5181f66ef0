//! Background publisher: outbox → broker.

pub mod publish_loop;
pub mod retry;

pub use publish_loop::{PublishLoop, PublishLoopConfig, PublishLoopHandle, PublisherStats, TickReport};
pub use retry::{BackoffStrategy, RetryPolicy};
