//! Domain error model.

use thiserror::Error;

use crate::outbox::OutboxStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures of the outbox model (validation,
/// forbidden status transitions). Storage and broker concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. empty aggregate type).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A status transition the outbox state machine does not allow.
    #[error("invalid transition from {from} for outbox event {id}: {reason}")]
    InvalidTransition {
        id: i64,
        from: OutboxStatus,
        reason: String,
    },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The payload could not be encoded or decoded.
    #[error("payload encoding failed: {0}")]
    Payload(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(id: i64, from: OutboxStatus, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            id,
            from,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Payload(err.to_string())
    }
}
