//! Periodic background tasks on the tokio runtime.
//!
//! The relay and the retention sweeper both run as a [`PeriodicTask`]: a job
//! invoked on a fixed interval until [`TaskHandle::shutdown`] is called. A run
//! that is in progress when shutdown is requested finishes first.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub struct PeriodicTask;

impl PeriodicTask {
    /// Run `job` now and then every `every`.
    ///
    /// Runs never overlap; a run longer than `every` delays the next one.
    pub fn spawn<F, Fut>(name: impl Into<String>, every: Duration, mut job: F) -> TaskHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let every = every.max(Duration::from_millis(1));

        let task_name = name.clone();
        let join = tokio::spawn(async move {
            info!(task = %task_name, every_ms = every.as_millis() as u64, "periodic task started");

            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => job().await,
                }
            }

            info!(task = %task_name, "periodic task stopped");
        });

        TaskHandle {
            name,
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Handle to control a running [`PeriodicTask`].
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Request graceful shutdown and wait for the current run to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(task = %self.name, error = %e, "periodic task ended abnormally");
        }
    }
}
