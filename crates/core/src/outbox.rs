//! The outbox row and its state machine.
//!
//! ```text
//! PENDING --success--> PUBLISHED (terminal)
//! PENDING --failure, retries left--> PENDING (retry eligible after backoff)
//! PENDING --failure, exhausted--> FAILED (terminal, alert)
//! PENDING --misconfiguration--> FAILED (permanent, alert)
//! FAILED(retries left) --success--> PUBLISHED
//! FAILED(retries left) --failure--> FAILED
//! FAILED --operator replay--> PENDING (retry_count = 0)
//! ```
//!
//! Transitions are pure: the relay computes the next state on its claimed copy
//! and the store persists it conditionally. Nothing in this module does IO.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{AggregateId, OutboxEventId, RelayId};
use crate::retry::RetryPolicy;

/// Delivery status of an outbox row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(DomainError::validation(format!("unknown outbox status '{other}'"))),
        }
    }
}

/// The JSON document stored as an outbox payload.
///
/// Handlers decode it back; `data` is forwarded to the broker untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn decode(payload: &str) -> DomainResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn encode(&self) -> DomainResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// An event about to be written to the outbox by a business transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub event_type: String,
    pub payload: String,
}

impl NewOutboxEvent {
    /// Wrap `data` in an [`EventEnvelope`] and serialize it as the payload.
    pub fn new<T>(
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        event_type: impl Into<String>,
        data: &T,
    ) -> DomainResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let aggregate_type = aggregate_type.into();
        let event_type = event_type.into();
        if aggregate_type.trim().is_empty() {
            return Err(DomainError::validation("aggregate type must not be empty"));
        }
        if event_type.trim().is_empty() {
            return Err(DomainError::validation("event type must not be empty"));
        }

        let payload = EventEnvelope {
            event_type: event_type.clone(),
            aggregate_id: aggregate_id.clone(),
            data: serde_json::to_value(data)?,
        }
        .encode()?;

        Ok(Self {
            aggregate_type,
            aggregate_id,
            event_type,
            payload,
        })
    }

    /// Use an already-serialized payload as-is.
    pub fn raw(
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }

    /// Materialize the row as the store inserts it.
    pub fn into_event(self, id: OutboxEventId, created_at: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload: self.payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            created_at,
            published_at: None,
            last_error: None,
            next_attempt_at: None,
            permanent_failure: false,
            lease: None,
        }
    }
}

/// A relay's temporary, exclusive claim on a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: RelayId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A row of the outbox table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: OutboxEventId,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub event_type: String,
    pub payload: String,
    pub status: OutboxStatus,
    /// Failed publish attempts. Only operator replay lowers it.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, when the row becomes `PUBLISHED`.
    pub published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Earliest time of the next attempt after a transient failure.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Routed to `FAILED` because retrying cannot help.
    pub permanent_failure: bool,
    pub lease: Option<Lease>,
}

/// What a transition did to a row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    Published,
    /// Failure recorded, the row stays eligible for a later tick.
    RetryScheduled { retry_count: u32 },
    /// Failure recorded and the retry budget is spent.
    Exhausted { retry_count: u32 },
    PermanentlyFailed,
    /// The row was already `PUBLISHED`; nothing changed.
    Unchanged,
}

impl OutboxEvent {
    /// Whether the relay may pick this row up at `now`.
    ///
    /// PENDING rows are due once their backoff elapsed. FAILED rows are due only
    /// while they still have retries left and did not fail permanently.
    pub fn is_due(&self, now: DateTime<Utc>, max_retries: u32) -> bool {
        let backoff_elapsed = self.next_attempt_at.map_or(true, |at| at <= now);
        let unleased = self.lease.as_ref().map_or(true, |l| !l.is_active(now));
        let eligible = match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Failed => !self.permanent_failure && self.retry_count < max_retries,
            OutboxStatus::Published => false,
        };
        eligible && backoff_elapsed && unleased
    }

    pub fn is_leased_by(&self, owner: &RelayId, now: DateTime<Utc>) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| &l.owner == owner && l.is_active(now))
    }

    /// Record a broker-acknowledged publish.
    ///
    /// Applying it to a row that is already `PUBLISHED` leaves `published_at` alone.
    pub fn mark_published(&mut self, now: DateTime<Utc>) -> Transition {
        if self.status == OutboxStatus::Published {
            return Transition::Unchanged;
        }
        self.status = OutboxStatus::Published;
        self.published_at = Some(now);
        self.next_attempt_at = None;
        self.last_error = None;
        Transition::Published
    }

    /// Record a failed attempt (broker error, timeout, handler error).
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Transition {
        if self.status == OutboxStatus::Published {
            return Transition::Unchanged;
        }

        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());

        if policy.is_exhausted(self.retry_count) {
            self.status = OutboxStatus::Failed;
            self.next_attempt_at = None;
            return Transition::Exhausted {
                retry_count: self.retry_count,
            };
        }

        let delay = chrono::Duration::from_std(policy.delay_for_attempt(self.retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        self.next_attempt_at = Some(now + delay);
        Transition::RetryScheduled {
            retry_count: self.retry_count,
        }
    }

    /// Route the row to `FAILED` for a failure no retry can fix.
    ///
    /// `retry_count` is left as it is.
    pub fn mark_permanently_failed(&mut self, reason: impl Into<String>) -> Transition {
        if self.status == OutboxStatus::Published {
            return Transition::Unchanged;
        }
        self.status = OutboxStatus::Failed;
        self.permanent_failure = true;
        self.next_attempt_at = None;
        self.last_error = Some(reason.into());
        Transition::PermanentlyFailed
    }

    /// Operator recovery: put a `FAILED` row back in the queue with a fresh budget.
    pub fn replay(&mut self) -> DomainResult<()> {
        if self.status != OutboxStatus::Failed {
            return Err(DomainError::invalid_transition(
                self.id.get(),
                self.status,
                "only FAILED rows can be replayed",
            ));
        }
        self.status = OutboxStatus::Pending;
        self.retry_count = 0;
        self.last_error = None;
        self.next_attempt_at = None;
        self.permanent_failure = false;
        self.lease = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pending_event() -> OutboxEvent {
        NewOutboxEvent::new(
            "Payment",
            AggregateId::from(7),
            "PAYMENT_SUCCEEDED",
            &serde_json::json!({"amount": 1200}),
        )
        .unwrap()
        .into_event(OutboxEventId::new(1), Utc::now())
    }

    #[test]
    fn payload_is_an_envelope() {
        let event = pending_event();
        let envelope = EventEnvelope::decode(&event.payload).unwrap();
        assert_eq!(envelope.event_type, "PAYMENT_SUCCEEDED");
        assert_eq!(envelope.aggregate_id.as_str(), "7");
        assert_eq!(envelope.data["amount"], 1200);

        let json: serde_json::Value = serde_json::from_str(&event.payload).unwrap();
        assert!(json.get("eventType").is_some());
        assert!(json.get("aggregateId").is_some());
    }

    #[test]
    fn blank_aggregate_type_is_rejected() {
        let err = NewOutboxEvent::new(" ", AggregateId::from(1), "X", &()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn publish_sets_timestamp_once() {
        let mut event = pending_event();
        let first = Utc::now();
        assert_eq!(event.mark_published(first), Transition::Published);
        assert_eq!(event.published_at, Some(first));

        let later = first + chrono::Duration::seconds(10);
        assert_eq!(event.mark_published(later), Transition::Unchanged);
        assert_eq!(event.published_at, Some(first));
    }

    #[test]
    fn failure_keeps_pending_until_exhausted() {
        let policy = RetryPolicy::fixed(2, Duration::from_secs(5));
        let mut event = pending_event();
        let now = Utc::now();

        let t = event.record_failure("broker down", &policy, now);
        assert_eq!(t, Transition::RetryScheduled { retry_count: 1 });
        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.next_attempt_at, Some(now + chrono::Duration::seconds(5)));
        assert!(!event.is_due(now, policy.max_retries));
        assert!(event.is_due(now + chrono::Duration::seconds(5), policy.max_retries));

        let t = event.record_failure("broker down", &policy, now);
        assert_eq!(t, Transition::Exhausted { retry_count: 2 });
        assert_eq!(event.status, OutboxStatus::Failed);
        assert!(!event.is_due(now + chrono::Duration::days(1), policy.max_retries));
    }

    #[test]
    fn failed_row_never_returns_to_pending_on_failure() {
        let policy = RetryPolicy::immediate(5);
        let mut event = pending_event();
        event.status = OutboxStatus::Failed;
        event.retry_count = 1;

        event.record_failure("still down", &policy, Utc::now());
        assert_eq!(event.status, OutboxStatus::Failed);
        assert_eq!(event.retry_count, 2);
        assert!(event.is_due(Utc::now(), policy.max_retries));
    }

    #[test]
    fn permanent_failure_keeps_retry_count_and_is_not_due() {
        let mut event = pending_event();
        assert_eq!(
            event.mark_permanently_failed("no handler for 'User'"),
            Transition::PermanentlyFailed
        );
        assert_eq!(event.status, OutboxStatus::Failed);
        assert_eq!(event.retry_count, 0);
        assert!(!event.is_due(Utc::now(), 5));
    }

    #[test]
    fn published_rows_do_not_move() {
        let mut event = pending_event();
        event.mark_published(Utc::now());

        let policy = RetryPolicy::immediate(1);
        assert_eq!(event.record_failure("late", &policy, Utc::now()), Transition::Unchanged);
        assert_eq!(event.mark_permanently_failed("late"), Transition::Unchanged);
        assert_eq!(event.status, OutboxStatus::Published);
        assert_eq!(event.retry_count, 0);
        assert!(event.replay().is_err());
    }

    #[test]
    fn replay_resets_failed_row() {
        let mut event = pending_event();
        event.mark_permanently_failed("bad payload");

        event.replay().unwrap();
        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.retry_count, 0);
        assert!(!event.permanent_failure);
        assert!(event.last_error.is_none());
    }

    #[test]
    fn pending_rows_cannot_be_replayed() {
        let mut event = pending_event();
        let err = event.replay().unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }

    #[test]
    fn active_lease_hides_row() {
        let now = Utc::now();
        let mut event = pending_event();
        let owner = RelayId::new("relay-a").unwrap();
        event.lease = Some(Lease {
            owner: owner.clone(),
            expires_at: now + chrono::Duration::seconds(30),
        });

        assert!(!event.is_due(now, 5));
        assert!(event.is_leased_by(&owner, now));
        assert!(event.is_due(now + chrono::Duration::seconds(31), 5));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [OutboxStatus::Pending, OutboxStatus::Published, OutboxStatus::Failed] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("SENT".parse::<OutboxStatus>().is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Step {
            Publish,
            Fail,
            Park,
        }

        fn step() -> impl Strategy<Value = Step> {
            prop_oneof![Just(Step::Publish), Just(Step::Fail), Just(Step::Park)]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 512,
                ..ProptestConfig::default()
            })]

            /// Property: without replay, retry_count never decreases and a
            /// PUBLISHED row never changes status or publish time again.
            #[test]
            fn retry_count_is_monotonic_and_published_is_terminal(
                steps in prop::collection::vec(step(), 1..40),
                max_retries in 1u32..8,
            ) {
                let policy = RetryPolicy::immediate(max_retries);
                let mut event = pending_event();
                let mut now = Utc::now();
                let mut published_at = None;

                for s in steps {
                    let before = event.retry_count;
                    now += chrono::Duration::seconds(1);
                    match s {
                        Step::Publish => { event.mark_published(now); }
                        Step::Fail => { event.record_failure("boom", &policy, now); }
                        Step::Park => { event.mark_permanently_failed("bad"); }
                    }

                    prop_assert!(event.retry_count >= before);
                    prop_assert_eq!(event.published_at.is_some(), event.status == OutboxStatus::Published);
                    if let Some(at) = published_at {
                        prop_assert_eq!(event.status, OutboxStatus::Published);
                        prop_assert_eq!(event.published_at, Some(at));
                    } else if event.status == OutboxStatus::Published {
                        published_at = event.published_at;
                    }
                }
            }
        }
    }
}
