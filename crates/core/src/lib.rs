//! `bazaar-core`: outbox domain building blocks.
//!
//! This crate contains the **pure** outbox model (no storage, no broker, no async):
//! the row, its status state machine, the retry policy and the clock abstraction.

pub mod clock;
pub mod error;
pub mod id;
pub mod outbox;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, OutboxEventId, RelayId};
pub use outbox::{EventEnvelope, Lease, NewOutboxEvent, OutboxEvent, OutboxStatus, Transition};
pub use retry::{BackoffStrategy, RetryPolicy};
