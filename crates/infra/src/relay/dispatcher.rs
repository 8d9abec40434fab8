//! The polling relay: claim due rows, publish them, record the outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use bazaar_core::{Clock, OutboxEvent, OutboxEventId, RelayId, SystemClock, Transition};
use bazaar_events::HandlerRegistry;

use super::stats::{RelayStats, TickReport};
use crate::alert::{Alert, AlertSink, TracingAlertSink};
use crate::config::{ConfigError, RelayConfig};
use crate::outbox_store::{ClaimRequest, OutboxStore, OutboxStoreError, OutcomeWrite};
use crate::scheduler::{PeriodicTask, TaskHandle};

/// Handle to control a spawned relay.
#[derive(Debug)]
pub struct RelayHandle {
    task: TaskHandle,
    stats: Arc<Mutex<RelayStats>>,
}

impl RelayHandle {
    /// Request graceful shutdown; a tick in progress completes first.
    pub async fn shutdown(self) {
        self.task.shutdown().await
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Outbox relay.
///
/// Each [`tick`](Self::tick) leases a batch of due rows, groups them by
/// aggregate, and dispatches the groups concurrently (at most
/// `max_concurrency` at once). Rows of one aggregate are attempted one after
/// the other in `created_at` order; the first row that does not publish ends
/// its group for this tick and the rest are released untouched.
///
/// Cloning is cheap and clones share statistics.
pub struct OutboxRelay<S: ?Sized> {
    id: RelayId,
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: Arc<RelayConfig>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
    permits: Arc<Semaphore>,
    stats: Arc<Mutex<RelayStats>>,
}

impl<S: ?Sized> Clone for OutboxRelay<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            alerts: self.alerts.clone(),
            permits: self.permits.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<S> OutboxRelay<S>
where
    S: OutboxStore + ?Sized + 'static,
{
    pub fn new(
        store: Arc<S>,
        registry: HandlerRegistry,
        config: RelayConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let id = match config.instance_id.as_deref() {
            Some(name) => RelayId::new(name).map_err(|e| ConfigError::Validation(e.to_string()))?,
            None => RelayId::generate(),
        };

        if registry.is_empty() {
            warn!(relay = %id, "outbox relay created without handlers; every event will fail");
        }

        Ok(Self {
            id,
            store,
            registry: Arc::new(registry),
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
            alerts: Arc::new(TracingAlertSink),
            stats: Arc::new(Mutex::new(RelayStats::default())),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn id(&self) -> &RelayId {
        &self.id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        self.lock_stats().clone()
    }

    /// Run one relay cycle.
    ///
    /// Only a failed claim is returned as an error. Per-row problems (handler
    /// errors, timeouts, failed outcome writes) are isolated to their row and
    /// show up in the [`TickReport`].
    pub async fn tick(&self) -> Result<TickReport, OutboxStoreError> {
        let request = ClaimRequest {
            owner: self.id.clone(),
            batch_size: self.config.batch_size,
            max_retries: self.config.retry.max_retries,
            now: self.clock.now(),
            lease_for: self.config.lease_duration,
        };

        let claimed = match self.store.claim_due(&request).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.lock_stats().record_failed_tick();
                return Err(e);
            }
        };

        let mut report = TickReport {
            claimed: claimed.len(),
            ..TickReport::default()
        };

        if !claimed.is_empty() {
            debug!(relay = %self.id, claimed = claimed.len(), "claimed outbox batch");

            let mut groups = JoinSet::new();
            for group in group_by_aggregate(claimed) {
                let relay = self.clone();
                groups.spawn(async move { relay.dispatch_group(group).await });
            }

            while let Some(joined) = groups.join_next().await {
                match joined {
                    Ok(group_report) => report.merge(&group_report),
                    // Rows of a panicked group keep their lease and are retried once it expires.
                    Err(e) => error!(relay = %self.id, error = %e, "aggregate dispatch task failed"),
                }
            }
        }

        self.lock_stats().record(&report);
        if report.claimed > 0 {
            info!(
                relay = %self.id,
                claimed = report.claimed,
                published = report.published,
                retried = report.retried,
                exhausted = report.exhausted,
                permanently_failed = report.permanently_failed,
                held_back = report.held_back,
                lease_lost = report.lease_lost,
                store_errors = report.store_errors,
                "outbox tick finished"
            );
        }
        Ok(report)
    }

    /// Run [`tick`](Self::tick) every `poll_interval` on the tokio runtime.
    pub fn spawn(self) -> RelayHandle {
        let stats = self.stats.clone();
        let every = self.config.poll_interval;
        let name = format!("outbox-relay:{}", self.id);

        let task = PeriodicTask::spawn(name, every, move || {
            let relay = self.clone();
            async move {
                if let Err(e) = relay.tick().await {
                    warn!(relay = %relay.id, error = %e, "outbox claim failed; retrying next tick");
                }
            }
        });

        RelayHandle { task, stats }
    }

    async fn dispatch_group(&self, group: Vec<OutboxEvent>) -> TickReport {
        let mut report = TickReport::default();

        // The semaphore is never closed.
        let Ok(_permit) = self.permits.acquire().await else {
            return report;
        };

        let mut rows = group.into_iter();
        while let Some(event) = rows.next() {
            if self.dispatch(event, &mut report).await {
                continue;
            }

            let held: Vec<OutboxEventId> = rows.by_ref().map(|e| e.id).collect();
            if !held.is_empty() {
                report.held_back += held.len();
                debug!(relay = %self.id, held_back = held.len(), "later events of the aggregate held back");
                if let Err(e) = self.store.release(&self.id, &held).await {
                    // The leases expire on their own; only the delay grows.
                    warn!(relay = %self.id, error = %e, "failed to release held-back events");
                }
            }
            break;
        }

        report
    }

    /// Attempt one row and store the outcome. Returns whether the broker
    /// acknowledged it.
    async fn dispatch(&self, mut event: OutboxEvent, report: &mut TickReport) -> bool {
        if !self.renew_lease(&event, report).await {
            return false;
        }

        let transition = match self.registry.resolve(&event.aggregate_type) {
            Err(e) => {
                let transition = event.mark_permanently_failed(e.to_string());
                self.alerts.raise(Alert::UnknownAggregateType {
                    event_id: event.id,
                    aggregate_type: event.aggregate_type.clone(),
                });
                transition
            }
            Ok(handler) => {
                let timeout = self.config.attempt_timeout;
                let attempt = tokio::time::timeout(timeout, handler.handle(&event.payload)).await;
                let now = self.clock.now();

                match attempt {
                    Ok(Ok(())) => event.mark_published(now),
                    Ok(Err(e)) if e.is_permanent() => {
                        let transition = event.mark_permanently_failed(e.to_string());
                        self.alerts.raise(Alert::PermanentFailure {
                            event_id: event.id,
                            aggregate_type: event.aggregate_type.clone(),
                            reason: e.to_string(),
                        });
                        transition
                    }
                    Ok(Err(e)) => event.record_failure(e.to_string(), &self.config.retry, now),
                    Err(_) => event.record_failure(
                        format!("publish attempt timed out after {timeout:?}"),
                        &self.config.retry,
                        now,
                    ),
                }
            }
        };

        match transition {
            Transition::RetryScheduled { retry_count } => debug!(
                relay = %self.id,
                event_id = %event.id,
                aggregate_type = %event.aggregate_type,
                aggregate_id = %event.aggregate_id,
                retry_count,
                error = event.last_error.as_deref().unwrap_or(""),
                "publish failed; retry scheduled"
            ),
            Transition::Exhausted { retry_count } => self.alerts.raise(Alert::RetriesExhausted {
                event_id: event.id,
                aggregate_type: event.aggregate_type.clone(),
                retry_count,
                last_error: event.last_error.clone(),
            }),
            _ => {}
        }

        let published = transition == Transition::Published;

        match self.store.record_outcome(&self.id, &event).await {
            Ok(OutcomeWrite::Applied) => report.count(transition),
            Ok(OutcomeWrite::LeaseLost) => {
                report.lease_lost += 1;
                warn!(
                    relay = %self.id,
                    event_id = %event.id,
                    published,
                    "lease lost before outcome was stored; outcome discarded"
                );
            }
            Ok(OutcomeWrite::AlreadyPublished) => {
                report.already_published += 1;
                debug!(relay = %self.id, event_id = %event.id, "event already published");
            }
            Err(e) => {
                report.store_errors += 1;
                error!(
                    relay = %self.id,
                    event_id = %event.id,
                    published,
                    error = %e,
                    "failed to store publish outcome"
                );
                self.alerts.raise(Alert::OutcomeNotRecorded {
                    event_id: event.id,
                    published,
                    error: e.to_string(),
                });
            }
        }

        published
    }

    /// Extend the lease on `event` to a full `lease_duration` before it is attempted.
    ///
    /// The row is skipped when the lease lapsed or moved to another instance.
    async fn renew_lease(&self, event: &OutboxEvent, report: &mut TickReport) -> bool {
        let now = self.clock.now();
        let until = ClaimRequest::lease_expiry(now, self.config.lease_duration);

        match self.store.renew_lease(&self.id, event.id, now, until).await {
            Ok(true) => true,
            Ok(false) => {
                report.lease_lost += 1;
                warn!(
                    relay = %self.id,
                    event_id = %event.id,
                    aggregate_type = %event.aggregate_type,
                    aggregate_id = %event.aggregate_id,
                    "lease lost before publish; event skipped"
                );
                false
            }
            Err(e) => {
                report.store_errors += 1;
                warn!(relay = %self.id, event_id = %event.id, error = %e, "failed to renew lease; event skipped");
                false
            }
        }
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, RelayStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Split a claimed batch into per-aggregate queues, each in `created_at` order.
///
/// Groups come out in the order their oldest row was claimed.
fn group_by_aggregate(mut claimed: Vec<OutboxEvent>) -> Vec<Vec<OutboxEvent>> {
    claimed.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut groups: Vec<Vec<OutboxEvent>> = Vec::new();
    for event in claimed {
        let key = (event.aggregate_type.clone(), event.aggregate_id.to_string());
        match index.get(&key) {
            Some(&i) => groups[i].push(event),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![event]);
            }
        }
    }
    groups
}
