//! Retention sweeper: deletes `PUBLISHED` rows past the retention window.
//!
//! `PENDING` and `FAILED` rows are never touched, whatever their age. A failed
//! sweep is logged and retried on the next run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use bazaar_core::{Clock, SystemClock};

use crate::config::SweeperConfig;
use crate::outbox_store::{OutboxStore, OutboxStoreError};
use crate::scheduler::{PeriodicTask, TaskHandle};

pub struct RetentionSweeper<S: ?Sized> {
    store: Arc<S>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl<S> RetentionSweeper<S>
where
    S: OutboxStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Rows published before this instant are due for deletion.
    pub fn cutoff(&self) -> DateTime<Utc> {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Delete expired rows once. Returns how many were deleted.
    pub async fn sweep_once(&self) -> Result<u64, OutboxStoreError> {
        let cutoff = self.cutoff();
        let deleted = self.store.delete_published_before(cutoff).await?;
        info!(deleted, cutoff = %cutoff, "outbox retention sweep finished");
        Ok(deleted)
    }

    /// Sweep every `every` until the handle is shut down.
    pub fn spawn(self, every: Duration) -> TaskHandle {
        let sweeper = Arc::new(self);
        PeriodicTask::spawn("outbox-retention-sweeper", every, move || {
            let sweeper = sweeper.clone();
            async move {
                if let Err(e) = sweeper.sweep_once().await {
                    warn!(error = %e, "outbox retention sweep failed; retrying next run");
                }
            }
        })
    }

    /// Spawn according to `config`, or not at all when the sweeper is disabled.
    pub fn spawn_with(store: Arc<S>, config: &SweeperConfig, clock: Arc<dyn Clock>) -> Option<TaskHandle> {
        if !config.enabled {
            info!("outbox retention sweeper disabled");
            return None;
        }
        Some(
            Self::new(store, config.retention)
                .with_clock(clock)
                .spawn(config.interval),
        )
    }
}
