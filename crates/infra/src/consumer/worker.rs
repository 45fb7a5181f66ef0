use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_events::{BrokerError, Delivery, DeliverySource, EventHandler};

use super::processor::{EventProcessor, ProcessOutcome};
use crate::ledger::IncomingEventLedger;

#[derive(Debug, Clone)]
pub struct ConsumerWorkerConfig {
    /// How long one receive waits before checking for shutdown again.
    pub receive_timeout: Duration,
    /// Page size for the startup pass over unconsumed ledger rows (0 = skip the pass).
    pub recovery_batch_size: usize,
}

impl Default for ConsumerWorkerConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(250),
            recovery_batch_size: 100,
        }
    }
}

impl ConsumerWorkerConfig {
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_recovery_batch_size(mut self, batch_size: usize) -> Self {
        self.recovery_batch_size = batch_size;
        self
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    /// Deliveries the broker flagged as seen before.
    pub redelivered: u64,
    pub processed: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub recovered: u64,
    pub errors: u64,
}

/// Handle to control and join a consumer worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "consumer worker task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}

/// Consumer runtime: delivery source → processor → ack.
///
/// - Retries unconsumed ledger rows first
/// - Acks `Processed` and `Duplicate`; a `Failed` delivery is left unacked
///   for the broker to redeliver
/// - Stops on shutdown or when the source closes
#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    pub fn spawn<D, L, H>(
        name: impl Into<String>,
        source: D,
        processor: EventProcessor<L, H>,
        config: ConsumerWorkerConfig,
    ) -> WorkerHandle
    where
        D: DeliverySource + 'static,
        L: IncomingEventLedger + 'static,
        H: EventHandler + 'static,
    {
        let shutdown = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));

        let join = tokio::spawn(worker_loop(
            name.into(),
            source,
            processor,
            config,
            shutdown.clone(),
            stats.clone(),
        ));

        WorkerHandle {
            shutdown,
            join: Some(join),
            stats,
        }
    }
}

async fn worker_loop<D, L, H>(
    name: String,
    mut source: D,
    processor: EventProcessor<L, H>,
    config: ConsumerWorkerConfig,
    shutdown: Arc<Notify>,
    stats: Arc<Mutex<ConsumerStats>>,
) where
    D: DeliverySource,
    L: IncomingEventLedger,
    H: EventHandler,
{
    info!(worker = %name, "consumer worker started");

    if config.recovery_batch_size > 0 {
        match processor.recover(config.recovery_batch_size).await {
            Ok(report) => update(&stats, |s| s.recovered += report.processed as u64),
            Err(err) => {
                error!(worker = %name, error = %err, "ledger recovery failed");
                update(&stats, |s| s.errors += 1);
            }
        }
    }

    loop {
        let next = tokio::select! {
            _ = shutdown.notified() => break,
            next = source.next(config.receive_timeout) => next,
        };

        match next {
            Ok(Some(delivery)) => {
                update(&stats, |s| {
                    s.received += 1;
                    if delivery.redelivered {
                        s.redelivered += 1;
                    }
                });
                if delivery.redelivered {
                    debug!(worker = %name, event_id = %delivery.message_id, "redelivered message");
                }
                handle_delivery(&name, &mut source, &processor, &delivery, &stats).await;
            }
            Ok(None) => continue,
            Err(BrokerError::Closed) => {
                info!(worker = %name, "delivery source closed");
                break;
            }
            Err(err) => {
                warn!(worker = %name, error = %err, "failed to receive delivery");
                update(&stats, |s| s.errors += 1);
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(config.receive_timeout) => {}
                }
            }
        }
    }

    info!(worker = %name, "consumer worker stopped");
}

async fn handle_delivery<D, L, H>(
    name: &str,
    source: &mut D,
    processor: &EventProcessor<L, H>,
    delivery: &Delivery,
    stats: &Mutex<ConsumerStats>,
) where
    D: DeliverySource,
    L: IncomingEventLedger,
    H: EventHandler,
{
    let outcome = match processor.process(delivery).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(worker = %name, event_id = %delivery.message_id, error = %err, "failed to process delivery");
            update(stats, |s| s.errors += 1);
            return;
        }
    };

    update(stats, |s| match outcome {
        ProcessOutcome::Processed => s.processed += 1,
        ProcessOutcome::Duplicate => s.duplicates += 1,
        ProcessOutcome::Failed(_) => s.failed += 1,
    });

    if !outcome.is_settled() {
        return;
    }

    if let Err(err) = source.ack(delivery).await {
        // Unacked deliveries come back; the ledger absorbs the duplicate.
        warn!(worker = %name, event_id = %delivery.message_id, error = %err, "failed to ack delivery");
        update(stats, |s| s.errors += 1);
    } else {
        debug!(worker = %name, event_id = %delivery.message_id, "delivery acked");
    }
}

fn update(stats: &Mutex<ConsumerStats>, f: impl FnOnce(&mut ConsumerStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}
