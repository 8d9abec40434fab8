//! Infrastructure layer: outbox storage, relay, retention, brokers, config.

pub mod admin;
pub mod alert;
pub mod broker;
pub mod config;
pub mod outbox_store;
pub mod relay;
pub mod scheduler;
pub mod sweeper;


pub use admin::OutboxAdmin;
pub use alert::{Alert, AlertSink, RecordingAlertSink, TracingAlertSink};
pub use config::{ConfigError, OutboxConfig, RelayConfig, SweeperConfig};
pub use outbox_store::{
    ClaimRequest, InMemoryOutboxStore, InMemoryTransaction, OutboxStats, OutboxStore,
    OutboxStoreError, OutboxWriter, OutcomeWrite, PostgresOutboxStore, run_migrations,
};
pub use relay::{OutboxRelay, RelayHandle, RelayStats, TickReport};
pub use scheduler::{PeriodicTask, TaskHandle};
pub use sweeper::RetentionSweeper;
