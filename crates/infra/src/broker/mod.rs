//! Broker adapters.
//!
//! The in-memory broker lives next to the [`Broker`](bazaar_events::Broker)
//! trait in `bazaar-events`; networked adapters live here behind features.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;
