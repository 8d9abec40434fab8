//! Logging setup shared by outbox services and tests.

/// Install the process-wide JSON subscriber (`RUST_LOG`, default `info`).
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init() {
    tracing::init(LogFormat::Json);
}

/// Subscriber configuration (filters, formats).
pub mod tracing;

pub use crate::tracing::{LogFormat, init_for_tests};
