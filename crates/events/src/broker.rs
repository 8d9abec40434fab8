//! Message broker boundary (mechanics only).
//!
//! The relay treats the broker as an opaque capability:
//! `publish(partition key, message value, event type) -> ack | error`.
//!
//! ## Delivery Guarantees
//!
//! The broker client does **not** retry. Retries, backoff and timeouts belong to the
//! relay, which owns the outbox row and knows how many attempts were made. A
//! successful `publish` means the broker acknowledged the message; the relay may
//! still publish the same message again if it crashes before recording that, so
//! consumers must deduplicate (at-least-once).

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// A message handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Destination topic/stream.
    pub topic: String,
    /// Partition/ordering key (the aggregate id).
    pub key: String,
    /// Message body, forwarded verbatim.
    pub value: Vec<u8>,
    /// Carried as a header so consumers can route without decoding the body.
    pub event_type: String,
}

/// Broker publish failure. Every variant is transient from the relay's point of view.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("publish rejected: {0}")]
    Rejected(String),

    #[error("publish not acknowledged in time")]
    Timeout,
}

/// Publish capability of an external event bus.
///
/// The trait requires `Send + Sync`: one broker handle is shared by every handler
/// and every relay worker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        (**self).publish(message).await
    }
}
