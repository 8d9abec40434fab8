//! Operator alerts raised by the relay.
//!
//! Alerts mark situations that retries will not fix on their own: a row routed to
//! `FAILED`, or an outcome the store could not record. The relay raises them and
//! keeps going; delivering them somewhere useful is up to the [`AlertSink`].

use std::sync::{Arc, Mutex};

use bazaar_core::OutboxEventId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// No handler is registered for the row's aggregate type.
    UnknownAggregateType {
        event_id: OutboxEventId,
        aggregate_type: String,
    },
    /// The handler rejected the row for good (e.g. undecodable payload).
    PermanentFailure {
        event_id: OutboxEventId,
        aggregate_type: String,
        reason: String,
    },
    RetriesExhausted {
        event_id: OutboxEventId,
        aggregate_type: String,
        retry_count: u32,
        last_error: Option<String>,
    },
    /// The publish outcome could not be written; the row will be attempted again.
    OutcomeNotRecorded {
        event_id: OutboxEventId,
        published: bool,
        error: String,
    },
}

impl Alert {
    pub fn event_id(&self) -> OutboxEventId {
        match self {
            Alert::UnknownAggregateType { event_id, .. }
            | Alert::PermanentFailure { event_id, .. }
            | Alert::RetriesExhausted { event_id, .. }
            | Alert::OutcomeNotRecorded { event_id, .. } => *event_id,
        }
    }
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

impl<S> AlertSink for Arc<S>
where
    S: AlertSink + ?Sized,
{
    fn raise(&self, alert: Alert) {
        (**self).raise(alert)
    }
}

/// Logs every alert at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: Alert) {
        match alert {
            Alert::UnknownAggregateType {
                event_id,
                aggregate_type,
            } => tracing::error!(
                alert = "unknown_aggregate_type",
                event_id = %event_id,
                aggregate_type = %aggregate_type,
                "no handler registered for aggregate type; event routed to FAILED"
            ),
            Alert::PermanentFailure {
                event_id,
                aggregate_type,
                reason,
            } => tracing::error!(
                alert = "permanent_failure",
                event_id = %event_id,
                aggregate_type = %aggregate_type,
                reason = %reason,
                "outbox event failed permanently"
            ),
            Alert::RetriesExhausted {
                event_id,
                aggregate_type,
                retry_count,
                last_error,
            } => tracing::error!(
                alert = "retries_exhausted",
                event_id = %event_id,
                aggregate_type = %aggregate_type,
                retry_count,
                last_error = last_error.as_deref().unwrap_or(""),
                "outbox event exhausted its retries"
            ),
            Alert::OutcomeNotRecorded {
                event_id,
                published,
                error,
            } => tracing::error!(
                alert = "outcome_not_recorded",
                event_id = %event_id,
                published,
                error = %error,
                "publish outcome could not be stored; event will be redelivered"
            ),
        }
    }
}

/// Collects alerts in memory (tests/dev).
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Alert>> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AlertSink for RecordingAlertSink {
    fn raise(&self, alert: Alert) {
        self.lock().push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_keeps_order() {
        let sink = Arc::new(RecordingAlertSink::new());
        let shared: Arc<dyn AlertSink> = sink.clone();

        shared.raise(Alert::UnknownAggregateType {
            event_id: OutboxEventId::new(1),
            aggregate_type: "Coupon".into(),
        });
        shared.raise(Alert::OutcomeNotRecorded {
            event_id: OutboxEventId::new(2),
            published: true,
            error: "connection reset".into(),
        });

        let ids: Vec<_> = sink.alerts().iter().map(Alert::event_id).collect();
        assert_eq!(ids, vec![OutboxEventId::new(1), OutboxEventId::new(2)]);
    }
}
