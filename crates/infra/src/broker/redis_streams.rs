//! Redis Streams broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Exchange**: a key prefix, e.g. `courier.events`
//! - **Stream per routing key**: `<exchange>:<routing_key>` (direct-exchange routing)
//! - **Entry fields**: `message_id`, `event_type`, `created_at`, optional
//!   `aggregate_type`/`aggregate_id`, and the JSON body under `payload`
//! - **Consumer groups**: one per consuming service; a consumer re-reads its
//!   own unacknowledged entries before taking new ones
//!
//! Streams are persisted by the Redis server (AOF/RDB). With
//! `confirm_replicas > 0`, every `XADD` is followed by `WAIT` and the publish
//! fails with [`BrokerError::NotConfirmed`] if too few replicas acknowledged.
//!
//! The connection is a [`ConnectionManager`], which reconnects after a drop;
//! while Redis is unreachable publishes fail with transient errors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadReply};
use redis::{ErrorKind, RedisError};
use tracing::{debug, info, instrument, warn};

use courier_events::envelope::headers;
use courier_events::{BrokerError, Delivery, DeliverySource, MessageBroker, OutboundMessage};

use crate::config::BrokerConfig;

/// Stream key for a routing key on an exchange.
pub fn stream_key(exchange: &str, routing_key: &str) -> String {
    format!("{exchange}:{routing_key}")
}

fn map_redis_error(operation: &str, err: RedisError) -> BrokerError {
    let msg = format!("{operation} failed: {err}");
    if err.is_timeout() {
        return BrokerError::Timeout(msg);
    }
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        return BrokerError::Connection(msg);
    }
    match err.kind() {
        ErrorKind::BusyLoadingError
        | ErrorKind::TryAgain
        | ErrorKind::ClusterDown
        | ErrorKind::MasterDown
        | ErrorKind::ReadOnly => BrokerError::Connection(msg),
        _ => BrokerError::Rejected(msg),
    }
}

async fn connect_manager(config: &BrokerConfig) -> Result<ConnectionManager, BrokerError> {
    let client = redis::Client::open(config.url.as_str())
        .map_err(|e| BrokerError::Connection(format!("invalid redis url: {e}")))?;

    match tokio::time::timeout(config.connect_timeout, client.get_connection_manager()).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(map_redis_error("connect", e)),
        Err(_) => Err(BrokerError::Timeout(format!(
            "connect did not finish within {:?}",
            config.connect_timeout
        ))),
    }
}

/// Producer side: appends outbox messages to per-routing-key streams.
pub struct RedisStreamsBroker {
    conn: ConnectionManager,
    exchange: String,
    confirm_replicas: u32,
    confirm_timeout: Duration,
    stream_maxlen: Option<usize>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("exchange", &self.exchange)
            .field("confirm_replicas", &self.confirm_replicas)
            .field("stream_maxlen", &self.stream_maxlen)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisStreamsBroker {
    #[instrument(skip(config), fields(exchange = %config.exchange), err)]
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let conn = connect_manager(config).await?;
        info!(exchange = %config.exchange, "connected to redis");

        Ok(Self {
            conn,
            exchange: config.exchange.clone(),
            confirm_replicas: config.confirm_replicas,
            confirm_timeout: config.confirm_timeout,
            stream_maxlen: config.stream_maxlen,
            closed: AtomicBool::new(false),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Stop accepting publishes. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(exchange = %self.exchange, "redis broker closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn xadd(&self, key: &str, message: &OutboundMessage, body: &[u8]) -> redis::Cmd {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key);
        if let Some(maxlen) = self.stream_maxlen {
            cmd.arg("MAXLEN").arg("~").arg(maxlen);
        }
        cmd.arg("*");
        for (name, value) in message.headers() {
            cmd.arg(name).arg(value);
        }
        cmd.arg(headers::PAYLOAD).arg(body);
        cmd
    }
}

#[async_trait]
impl MessageBroker for RedisStreamsBroker {
    #[instrument(
        skip(self, message),
        fields(event_id = %message.message_id, routing_key = %message.routing_key),
        err
    )]
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let body = message.body()?;
        let key = stream_key(&self.exchange, message.routing_key.as_str());
        let mut conn = self.conn.clone();

        let entry_id: String = self
            .xadd(&key, message, &body)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XADD", e))?;

        if self.confirm_replicas > 0 {
            let acknowledged: u32 = redis::cmd("WAIT")
                .arg(self.confirm_replicas)
                .arg(self.confirm_timeout.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("WAIT", e))?;

            if acknowledged < self.confirm_replicas {
                return Err(BrokerError::NotConfirmed {
                    required: self.confirm_replicas,
                    acknowledged,
                });
            }
        }

        debug!(stream = %key, entry_id = %entry_id, "appended to stream");
        Ok(())
    }
}

/// Consumer side: a consumer group reading the streams of a set of routing keys.
pub struct RedisStreamsConsumer {
    conn: ConnectionManager,
    exchange: String,
    group: String,
    consumer: String,
    /// (stream key, routing key)
    streams: Vec<(String, String)>,
    /// Per stream: `Some(last id)` while re-reading this consumer's pending entries.
    pending_cursors: Vec<Option<String>>,
    batch_size: usize,
    pending_rescan: Duration,
    last_rescan: Instant,
    buffer: VecDeque<Delivery>,
}

impl std::fmt::Debug for RedisStreamsConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsConsumer")
            .field("exchange", &self.exchange)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("streams", &self.streams)
            .finish()
    }
}

impl RedisStreamsConsumer {
    /// Join `group` as `consumer` on the streams for `routing_keys`.
    ///
    /// Groups are created if missing, starting from the beginning of each
    /// stream so events published before the first subscription are not lost.
    #[instrument(skip(config, routing_keys), fields(exchange = %config.exchange), err)]
    pub async fn connect<I, S>(
        config: &BrokerConfig,
        group: &str,
        consumer: &str,
        routing_keys: I,
    ) -> Result<Self, BrokerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut conn = connect_manager(config).await?;

        let streams: Vec<(String, String)> = routing_keys
            .into_iter()
            .map(Into::into)
            .map(|rk: String| (stream_key(&config.exchange, &rk), rk))
            .collect();
        if streams.is_empty() {
            return Err(BrokerError::Rejected("consumer needs at least one routing key".to_string()));
        }

        for (key, _) in &streams {
            let created: Result<String, RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(key)
                .arg(group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            match created {
                Ok(_) => info!(stream = %key, group, "created consumer group"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(map_redis_error("XGROUP CREATE", e)),
            }
        }

        let pending_cursors = vec![Some("0".to_string()); streams.len()];
        Ok(Self {
            conn,
            exchange: config.exchange.clone(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            streams,
            pending_cursors,
            batch_size: config.read_batch_size.max(1),
            pending_rescan: config.pending_rescan,
            last_rescan: Instant::now(),
            buffer: VecDeque::new(),
        })
    }

    fn routing_key_for(&self, stream: &str) -> Option<&str> {
        self.streams
            .iter()
            .find(|(key, _)| key == stream)
            .map(|(_, rk)| rk.as_str())
    }

    /// Re-read entries delivered to this consumer but never acknowledged.
    async fn read_pending(&mut self) -> Result<(), BrokerError> {
        let selected: Vec<(usize, String)> = self
            .pending_cursors
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.clone().map(|c| (i, c)))
            .collect();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.batch_size)
            .arg("STREAMS");
        for (i, _) in &selected {
            cmd.arg(&self.streams[*i].0);
        }
        for (_, cursor) in &selected {
            cmd.arg(cursor);
        }

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut self.conn)
            .await
            .map_err(|e| map_redis_error("XREADGROUP (pending)", e))?;
        let keys = reply.map(|r| r.keys).unwrap_or_default();

        for (i, _) in selected {
            let key = self.streams[i].0.clone();
            let ids = keys
                .iter()
                .find(|k| k.key == key)
                .map(|k| k.ids.as_slice())
                .unwrap_or_default();

            match ids.last() {
                None => self.pending_cursors[i] = None,
                Some(last) => {
                    self.pending_cursors[i] = Some(last.id.clone());
                    for entry in ids {
                        self.buffer_entry(&key, entry, true).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Block up to `timeout` for new entries. Returns whether anything arrived.
    async fn read_new(&mut self, timeout: Duration) -> Result<bool, BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.batch_size)
            .arg("BLOCK")
            // BLOCK 0 would wait forever.
            .arg((timeout.as_millis() as u64).max(1))
            .arg("STREAMS");
        for (key, _) in &self.streams {
            cmd.arg(key);
        }
        for _ in &self.streams {
            cmd.arg(">");
        }

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut self.conn)
            .await
            .map_err(|e| map_redis_error("XREADGROUP", e))?;

        let Some(reply) = reply else {
            return Ok(false);
        };

        for stream in reply.keys {
            for entry in &stream.ids {
                self.buffer_entry(&stream.key, entry, false).await;
            }
        }
        Ok(!self.buffer.is_empty())
    }

    async fn buffer_entry(&mut self, stream: &str, entry: &StreamId, redelivered: bool) {
        let Some(routing_key) = self.routing_key_for(stream).map(str::to_string) else {
            return;
        };

        let fields: Vec<(String, String)> = entry
            .map
            .iter()
            .filter_map(|(k, v)| {
                redis::from_redis_value::<String>(v)
                    .ok()
                    .map(|v| (k.clone(), v))
            })
            .collect();

        let parsed = Delivery::from_parts(
            self.exchange.clone(),
            routing_key,
            entry.id.clone(),
            fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );

        match parsed {
            Ok(mut delivery) => {
                delivery.redelivered = redelivered;
                self.buffer.push_back(delivery);
            }
            Err(err) => {
                // Can never be processed; drop it from the pending list.
                warn!(stream, entry_id = %entry.id, error = %err, "discarding malformed stream entry");
                if let Err(e) = self.xack(stream, &entry.id).await {
                    warn!(stream, entry_id = %entry.id, error = %e, "failed to ack malformed entry");
                }
            }
        }
    }

    async fn xack(&mut self, stream: &str, entry_id: &str) -> Result<(), BrokerError> {
        let _: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| map_redis_error("XACK", e))?;
        Ok(())
    }
}

#[async_trait]
impl DeliverySource for RedisStreamsConsumer {
    async fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        loop {
            if let Some(delivery) = self.buffer.pop_front() {
                return Ok(Some(delivery));
            }

            // Unacked entries (failed handlers, crashes) come back on each rescan.
            if self.last_rescan.elapsed() >= self.pending_rescan {
                self.last_rescan = Instant::now();
                for cursor in &mut self.pending_cursors {
                    *cursor = Some("0".to_string());
                }
            }

            if self.pending_cursors.iter().any(Option::is_some) {
                self.read_pending().await?;
                continue;
            }

            if !self.read_new(timeout).await? {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let key = stream_key(&self.exchange, &delivery.routing_key);
        self.xack(&key, &delivery.receipt).await
    }
}
