//! Outbox dispatch: aggregate handlers, their registry, and the broker boundary.

pub mod aggregates;
pub mod broker;
pub mod handler;
pub mod in_memory_broker;
pub mod registry;

pub use broker::{Broker, BrokerError, BrokerMessage};
pub use handler::{AggregateHandler, HandlerError, PublishingHandler};
pub use in_memory_broker::InMemoryBroker;
pub use registry::{HandlerRegistry, RegistryError};
