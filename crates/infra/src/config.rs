//! Environment-driven configuration for the relay and its components.

use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use crate::publisher::{PublishLoopConfig, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Longest lease a publish loop may hold on a claimed batch.
pub const MAX_LEASE_SECS: u64 = 24 * 60 * 60;
/// Longest backoff between two publish attempts of one event.
pub const MAX_RETRY_DELAY_MS: u64 = 24 * 60 * 60 * 1000;
/// Longest wait between two publish ticks.
pub const MAX_POLL_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub url: String,
    /// Key prefix shared by every stream of this deployment.
    pub exchange: String,
    /// Replicas that must acknowledge each publish (0 = do not wait).
    pub confirm_replicas: u32,
    pub confirm_timeout: Duration,
    /// Approximate per-stream length cap (`MAXLEN ~`).
    pub stream_maxlen: Option<usize>,
    pub connect_timeout: Duration,
    /// Consumer side: entries fetched per read.
    pub read_batch_size: usize,
    /// Consumer side: how often unacknowledged entries are re-read.
    pub pending_rescan: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            exchange: "courier.events".to_string(),
            confirm_replicas: 0,
            confirm_timeout: Duration::from_secs(5),
            stream_maxlen: None,
            connect_timeout: Duration::from_secs(5),
            read_batch_size: 16,
            pending_rescan: Duration::from_secs(30),
        }
    }
}

/// Relay process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub service_name: String,
    pub broker: BrokerConfig,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub retry: RetryPolicy,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset and empty values take the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let broker_defaults = BrokerConfig::default();
        let retry_defaults = RetryPolicy::default();

        let broker = BrokerConfig {
            url: get("REDIS_URL").unwrap_or(broker_defaults.url),
            exchange: get("COURIER_EXCHANGE").unwrap_or(broker_defaults.exchange),
            confirm_replicas: parse(&get, "COURIER_CONFIRM_REPLICAS", broker_defaults.confirm_replicas)?,
            stream_maxlen: match get("COURIER_STREAM_MAXLEN") {
                None => None,
                Some(v) => Some(parse_value("COURIER_STREAM_MAXLEN", &v)?),
            },
            ..broker_defaults
        };

        let batch_size: usize = parse_bounded(&get, "COURIER_BATCH_SIZE", 50, 1..=usize::MAX)?;
        let poll_interval_ms =
            parse_bounded(&get, "COURIER_POLL_INTERVAL_MS", 1000, 1..=MAX_POLL_INTERVAL_MS)?;
        let lease_secs = parse_bounded(&get, "COURIER_LEASE_SECS", 30, 1..=MAX_LEASE_SECS)?;
        let max_ms = parse_bounded(&get, "COURIER_RETRY_MAX_MS", 60_000, 0..=MAX_RETRY_DELAY_MS)?;
        let base_ms = parse_bounded(&get, "COURIER_RETRY_BASE_MS", 500_u64.min(max_ms), 0..=max_ms)?;

        Ok(Self {
            database_url,
            db_max_connections: parse(&get, "COURIER_DB_MAX_CONNECTIONS", 5)?,
            service_name: get("COURIER_SERVICE_NAME").unwrap_or_else(|| "courier".to_string()),
            broker,
            batch_size,
            poll_interval: Duration::from_millis(poll_interval_ms),
            lease: Duration::from_secs(lease_secs),
            retry: RetryPolicy {
                max_attempts: parse(&get, "COURIER_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                ..retry_defaults
            },
        })
    }

    /// Publish loop settings; the worker id is `<service>-<pid>`.
    pub fn publish_loop_config(&self) -> PublishLoopConfig {
        PublishLoopConfig::default()
            .with_worker_id(format!("{}-{}", self.service_name, std::process::id()))
            .with_batch_size(self.batch_size)
            .with_poll_interval(self.poll_interval)
            .with_lease(self.lease)
            .with_retry(self.retry.clone())
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(v) => parse_value(key, &v),
    }
}

/// Like [`parse`], rejecting values outside `bounds`.
fn parse_bounded<T, G>(
    get: &G,
    key: &'static str,
    default: T,
    bounds: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd,
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    let value: T = parse_value(key, &raw)?;
    if bounds.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid { key, value: raw })
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
