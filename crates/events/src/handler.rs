//! Aggregate handlers: turn a stored outbox payload into a broker publish.

use async_trait::async_trait;
use thiserror::Error;

use bazaar_core::{DomainError, EventEnvelope};

use crate::broker::{Broker, BrokerError, BrokerMessage};

/// Failure of a handler to turn a stored payload into a published message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The stored payload is not a valid envelope. Retrying cannot help.
    #[error("payload could not be decoded: {0}")]
    Decode(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Any other handler-specific failure; treated as transient.
    #[error("handler failed: {0}")]
    Other(String),
}

impl HandlerError {
    /// Permanent errors route the row straight to `FAILED`.
    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Decode(_))
    }
}

impl From<DomainError> for HandlerError {
    fn from(err: DomainError) -> Self {
        HandlerError::Decode(err.to_string())
    }
}

/// Turns stored outbox payloads of one aggregate type into broker publishes.
///
/// Each aggregate type has exactly one handler; the relay finds it through the
/// [`HandlerRegistry`](crate::HandlerRegistry) using [`aggregate_type`](Self::aggregate_type)
/// as the discriminator.
///
/// The payload is the JSON envelope `{eventType, aggregateId, data}` written at
/// append time. Implementations must be idempotent from the consumer's point of
/// view: the same payload may be handled more than once.
#[async_trait]
pub trait AggregateHandler: Send + Sync {
    fn aggregate_type(&self) -> &str;

    async fn handle(&self, payload: &str) -> Result<(), HandlerError>;
}

/// Handler that forwards envelopes of one aggregate type to a broker topic.
///
/// - key: `aggregateId`
/// - value: `data`, serialized verbatim
/// - header: `eventType`
#[derive(Debug, Clone)]
pub struct PublishingHandler<B> {
    aggregate_type: String,
    topic: String,
    broker: B,
}

impl<B> PublishingHandler<B>
where
    B: Broker,
{
    pub fn new(aggregate_type: impl Into<String>, topic: impl Into<String>, broker: B) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            topic: topic.into(),
            broker,
        }
    }

    /// Publish to `<aggregate type, lowercased>-events`.
    pub fn for_aggregate(aggregate_type: impl Into<String>, broker: B) -> Self {
        let aggregate_type = aggregate_type.into();
        let topic = crate::aggregates::default_topic(&aggregate_type);
        Self::new(aggregate_type, topic, broker)
    }
}

#[async_trait]
impl<B> AggregateHandler for PublishingHandler<B>
where
    B: Broker,
{
    fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    async fn handle(&self, payload: &str) -> Result<(), HandlerError> {
        let envelope = EventEnvelope::decode(payload)?;
        let value = serde_json::to_vec(&envelope.data)
            .map_err(|e| HandlerError::Other(format!("value serialization failed: {e}")))?;

        self.broker
            .publish(BrokerMessage {
                topic: self.topic.clone(),
                key: envelope.aggregate_id.to_string(),
                value,
                event_type: envelope.event_type,
            })
            .await?;

        tracing::debug!(
            aggregate_type = %self.aggregate_type,
            topic = %self.topic,
            "envelope published"
        );
        Ok(())
    }
}
