//! Concrete broker adapters.
//!
//! The in-memory broker lives in `courier-events`; the Redis Streams adapter
//! needs the `redis` feature.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBroker, RedisStreamsConsumer, stream_key};
