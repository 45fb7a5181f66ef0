//! Consumer-side business handlers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::incoming::IncomingEvent;

/// Failure reported by a business handler.
///
/// The event stays unconsumed and is retried on redelivery or recovery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Business handler invoked once per logical event.
///
/// Handlers must be idempotent: the ledger absorbs duplicates of consumed
/// events, but an event whose handler failed half-way is run again.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &IncomingEvent) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> EventHandler for Arc<H>
where
    H: EventHandler + ?Sized,
{
    async fn handle(&self, event: &IncomingEvent) -> Result<(), HandlerError> {
        (**self).handle(event).await
    }
}

/// Adapter for synchronous closures.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&IncomingEvent) -> Result<(), HandlerError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&IncomingEvent) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, event: &IncomingEvent) -> Result<(), HandlerError> {
        (self.0)(event)
    }
}
