//! Outbox publish loop.
//!
//! One tick: claim a batch of due pending rows, publish each through the
//! broker in `created_at` order, and record the outcome on the row. A failing
//! event never stops the batch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_events::{MessageBroker, OutboxEvent, deadline_after};

use super::retry::RetryPolicy;
use crate::outbox::{OutboxStore, OutboxStoreError};

/// Publish loop configuration.
#[derive(Debug, Clone)]
pub struct PublishLoopConfig {
    /// Lease owner written to claimed rows; also used in logs.
    pub worker_id: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Must outlast one batch's publish time.
    pub lease: Duration,
    pub retry: RetryPolicy,
}

impl Default for PublishLoopConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("publisher-{}", std::process::id()),
            batch_size: 50,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl PublishLoopConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub published: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Outcomes that could not be written back; those rows stay pending.
    pub store_errors: usize,
}

/// Totals since the loop was spawned.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PublisherStats {
    pub ticks: u64,
    pub published: u64,
    pub requeued: u64,
    pub failed: u64,
    pub store_errors: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl PublisherStats {
    fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.published += report.published as u64;
        self.requeued += report.requeued as u64;
        self.failed += report.failed as u64;
        self.store_errors += report.store_errors as u64;
        self.last_tick_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Published,
    Requeued,
    Failed,
}

/// Drains an outbox store into a message broker.
pub struct PublishLoop<S, B> {
    store: S,
    broker: B,
    config: PublishLoopConfig,
}

impl<S, B> PublishLoop<S, B>
where
    S: OutboxStore + 'static,
    B: MessageBroker + 'static,
{
    pub fn new(store: S, broker: B, config: PublishLoopConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    pub fn config(&self) -> &PublishLoopConfig {
        &self.config
    }

    /// Run one cycle. Only a failed claim is returned as an error.
    pub async fn tick(&self) -> Result<TickReport, OutboxStoreError> {
        let events = self
            .store
            .claim_pending(&self.config.worker_id, self.config.batch_size, self.config.lease)
            .await?;

        let mut report = TickReport {
            claimed: events.len(),
            ..Default::default()
        };
        if events.is_empty() {
            return Ok(report);
        }

        debug!(worker = %self.config.worker_id, claimed = events.len(), "claimed outbox batch");

        for event in &events {
            match self.publish_one(event).await {
                Ok(Disposition::Published) => report.published += 1,
                Ok(Disposition::Requeued) => report.requeued += 1,
                Ok(Disposition::Failed) => report.failed += 1,
                Err(err) => {
                    // The lease runs out and the row is picked up again.
                    report.store_errors += 1;
                    error!(
                        worker = %self.config.worker_id,
                        event_id = %event.id,
                        error = %err,
                        "failed to record publish outcome"
                    );
                }
            }
        }

        Ok(report)
    }

    async fn publish_one(&self, event: &OutboxEvent) -> Result<Disposition, OutboxStoreError> {
        let message = event.to_message();

        let err = match self.broker.publish(&message).await {
            Ok(()) => {
                self.store.mark_published(event.id).await?;
                debug!(event_id = %event.id, routing_key = %event.routing_key, "event published");
                return Ok(Disposition::Published);
            }
            Err(err) => err,
        };

        let attempts = event.attempts + 1;
        let reason = err.to_string();

        if err.is_transient() && self.config.retry.should_retry(attempts) {
            let delay = self.config.retry.delay_for_attempt(attempts);
            let next_attempt_at = deadline_after(Utc::now(), delay);
            warn!(
                event_id = %event.id,
                routing_key = %event.routing_key,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "publish failed, requeued"
            );
            self.store.requeue(event.id, &reason, next_attempt_at).await?;
            Ok(Disposition::Requeued)
        } else {
            error!(
                event_id = %event.id,
                routing_key = %event.routing_key,
                attempts,
                transient = err.is_transient(),
                error = %reason,
                "publish failed, event marked failed"
            );
            self.store.mark_failed(event.id, &reason).await?;
            Ok(Disposition::Failed)
        }
    }

    /// Run the loop on a tokio task until [`PublishLoopHandle::shutdown`].
    pub fn spawn(self) -> PublishLoopHandle {
        let shutdown = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(PublisherStats::default()));

        let join = tokio::spawn(run(self, shutdown.clone(), stats.clone()));

        PublishLoopHandle {
            shutdown,
            join: Some(join),
            stats,
        }
    }
}

async fn run<S, B>(publisher: PublishLoop<S, B>, shutdown: Arc<Notify>, stats: Arc<Mutex<PublisherStats>>)
where
    S: OutboxStore + 'static,
    B: MessageBroker + 'static,
{
    let config = publisher.config.clone();
    info!(
        worker = %config.worker_id,
        batch_size = config.batch_size,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "publish loop started"
    );

    loop {
        match publisher.tick().await {
            Ok(report) => {
                if report.claimed > 0 {
                    info!(
                        worker = %config.worker_id,
                        published = report.published,
                        requeued = report.requeued,
                        failed = report.failed,
                        "publish tick"
                    );
                }
                if let Ok(mut s) = stats.lock() {
                    s.record(&report);
                }
            }
            Err(err) => {
                error!(worker = %config.worker_id, error = %err, "failed to claim outbox batch");
                if let Ok(mut s) = stats.lock() {
                    s.record(&TickReport {
                        store_errors: 1,
                        ..Default::default()
                    });
                }
            }
        }

        // notify_one stores a permit, so a shutdown requested mid-tick is seen here.
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }

    info!(worker = %config.worker_id, "publish loop stopped");
}

/// Handle to control a running publish loop.
#[derive(Debug)]
pub struct PublishLoopHandle {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<PublisherStats>>,
}

impl PublishLoopHandle {
    /// Signal the loop, let the in-flight tick finish, and join the task.
    ///
    /// Returns the totals as of the loop's exit, the last tick included.
    pub async fn shutdown(mut self) -> PublisherStats {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "publish loop task ended abnormally");
            }
        }
        self.stats()
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::InMemoryOutboxStore;
    use courier_events::{BrokerError, InMemoryBroker, NewOutboxEvent, OutboxStatus};
    use serde_json::json;

    fn config() -> PublishLoopConfig {
        PublishLoopConfig::default()
            .with_worker_id("test-publisher")
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn seed(store: &InMemoryOutboxStore, n: usize) -> Vec<OutboxEvent> {
        let mut out = Vec::new();
        for i in 0..n {
            let event = NewOutboxEvent::try_new("document.approved", json!({ "n": i })).unwrap();
            out.push(store.insert_event(event).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn empty_outbox_is_a_no_op() {
        let publisher = PublishLoop::new(InMemoryOutboxStore::arc(), Arc::new(InMemoryBroker::default()), config());
        assert_eq!(publisher.tick().await.unwrap(), TickReport::default());
    }

    #[tokio::test]
    async fn tick_publishes_in_created_order() {
        let store = InMemoryOutboxStore::arc();
        let broker = Arc::new(InMemoryBroker::default());
        let seeded = seed(&store, 4).await;

        let publisher = PublishLoop::new(store.clone(), broker.clone(), config());
        let report = publisher.tick().await.unwrap();

        assert_eq!(report.claimed, 4);
        assert_eq!(report.published, 4);
        let expected: Vec<_> = seeded.iter().map(|e| e.id).collect();
        assert_eq!(broker.published_ids(), expected);
        assert_eq!(store.stats().await.unwrap().published, 4);
    }

    #[tokio::test]
    async fn transient_failure_requeues_with_backoff() {
        let store = InMemoryOutboxStore::arc();
        let broker = Arc::new(InMemoryBroker::default());
        let seeded = seed(&store, 1).await;
        broker.fail_next(1, BrokerError::Timeout("publish".into()));

        let publisher = PublishLoop::new(store.clone(), broker.clone(), config());
        let report = publisher.tick().await.unwrap();
        assert_eq!(report.requeued, 1);

        let row = store.get(seeded[0].id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 1);
        assert!(row.next_attempt_at.unwrap() > row.created_at);
        assert!(row.claimed_by.is_none());

        // Not due yet.
        assert_eq!(publisher.tick().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn huge_backoff_requeues_far_in_the_future() {
        let store = InMemoryOutboxStore::arc();
        let broker = Arc::new(InMemoryBroker::default());
        let seeded = seed(&store, 1).await;
        broker.fail_next(1, BrokerError::Timeout("publish".into()));

        let retry = RetryPolicy::fixed(5, Duration::from_millis(10_000_000_000_000_000));
        let publisher = PublishLoop::new(store.clone(), broker, config().with_retry(retry));
        assert_eq!(publisher.tick().await.unwrap().requeued, 1);

        let row = store.get(seeded[0].id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert!(row.next_attempt_at.unwrap() > Utc::now() + chrono::Duration::days(365 * 1000));
    }

    #[tokio::test]
    async fn permanent_failure_is_terminal_and_batch_continues() {
        let store = InMemoryOutboxStore::arc();
        let broker = Arc::new(InMemoryBroker::default());
        let seeded = seed(&store, 3).await;
        broker.fail_message(seeded[1].id, BrokerError::Rejected("payload too large".into()));

        let publisher = PublishLoop::new(store.clone(), broker.clone(), config());
        let report = publisher.tick().await.unwrap();

        assert_eq!((report.published, report.failed), (2, 1));
        let failed = store.get(seeded[1].id).await.unwrap().unwrap();
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert!(failed.last_error.unwrap().contains("payload too large"));
        assert_eq!(broker.published_ids(), vec![seeded[0].id, seeded[2].id]);
    }

    #[tokio::test]
    async fn no_retry_policy_fails_transient_errors_immediately() {
        let store = InMemoryOutboxStore::arc();
        let broker = Arc::new(InMemoryBroker::default());
        let seeded = seed(&store, 1).await;
        broker.fail_next(1, BrokerError::Connection("refused".into()));

        let publisher = PublishLoop::new(store.clone(), broker, config().with_retry(RetryPolicy::no_retry()));
        assert_eq!(publisher.tick().await.unwrap().failed, 1);
        assert_eq!(store.get(seeded[0].id).await.unwrap().unwrap().status, OutboxStatus::Failed);
    }

    #[tokio::test]
    async fn spawned_loop_drains_and_shuts_down() {
        let store = InMemoryOutboxStore::arc();
        let broker = Arc::new(InMemoryBroker::default());
        seed(&store, 5).await;

        let handle = PublishLoop::new(store.clone(), broker.clone(), config()).spawn();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handle.stats().published < 5 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats = handle.stats();
        assert!(stats.ticks >= 1);
        assert_eq!(stats.published, 5);
        assert!(stats.last_tick_at.is_some());

        let last = handle.shutdown().await;
        assert!(last.ticks >= stats.ticks);
        assert_eq!(last.published, 5);
        assert_eq!(store.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn shutdown_totals_include_the_in_flight_tick() {
        let store = InMemoryOutboxStore::arc();
        let broker = Arc::new(InMemoryBroker::default());
        seed(&store, 3).await;

        // Shutdown is requested before the first tick runs; that tick still completes.
        let handle = PublishLoop::new(store.clone(), broker, config()).spawn();
        let last = handle.shutdown().await;

        assert_eq!(last.ticks, 1);
        assert_eq!(last.published, 3);
        assert_eq!(store.stats().await.unwrap().published, 3);
    }
}
