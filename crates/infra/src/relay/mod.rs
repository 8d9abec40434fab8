//! Outbox relay.
//!
//! Moves committed outbox rows to the broker with at-least-once semantics:
//!
//! - rows are leased before they are attempted, so relay instances never
//!   publish the same row at the same time
//! - rows of one aggregate are published in `created_at` order
//! - every outcome write is conditional on the lease, and a `PUBLISHED` row is
//!   never written again
//!
//! A crash between the broker acknowledgement and the outcome write republishes
//! the row after its lease expires. Consumers deduplicate.

mod dispatcher;
mod stats;

pub use dispatcher::{OutboxRelay, RelayHandle};
pub use stats::{RelayStats, TickReport};
