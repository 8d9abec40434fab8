//! Outbox table boundary.
//!
//! Business code appends rows through an [`OutboxWriter`] bound to its own
//! transaction; the relay, the retention sweeper and operators work through
//! [`OutboxStore`].

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryOutboxStore, InMemoryTransaction};
pub use postgres::{PostgresOutboxStore, run_migrations};
pub use r#trait::{ClaimRequest, OutboxStats, OutboxStore, OutboxStoreError, OutboxWriter, OutcomeWrite};
