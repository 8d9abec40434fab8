use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use bazaar_core::{DomainError, NewOutboxEvent, OutboxEvent, OutboxEventId, RelayId};

/// Outbox store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox event not found: {0}")]
    NotFound(OutboxEventId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A stored row that cannot be mapped back to an [`OutboxEvent`].
    #[error("corrupt outbox row {id}: {reason}")]
    Corrupt { id: i64, reason: String },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Parameters of one claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Relay instance taking the lease.
    pub owner: RelayId,
    pub batch_size: usize,
    /// `FAILED` rows are only re-selected below this retry count.
    pub max_retries: u32,
    pub now: DateTime<Utc>,
    /// Lease length; a crashed owner's rows become due again afterwards.
    pub lease_for: Duration,
}

impl ClaimRequest {
    pub fn lease_expires_at(&self) -> DateTime<Utc> {
        Self::lease_expiry(self.now, self.lease_for)
    }

    /// `now + lease_for`, saturating at the largest representable time.
    pub fn lease_expiry(now: DateTime<Utc>, lease_for: Duration) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(lease_for).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Result of a conditional outcome write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutcomeWrite {
    Applied,
    /// Another relay instance holds the row now; nothing was written.
    LeaseLost,
    /// The row already reached `PUBLISHED`; nothing was written.
    AlreadyPublished,
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub published: u64,
    pub failed: u64,
    /// Subset of `failed` that no retry will pick up again.
    pub permanently_failed: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

/// Persistence of outbox rows, as seen by the relay, the sweeper and operators.
///
/// Business code does not use this trait to write events; it appends through an
/// [`OutboxWriter`] bound to its own transaction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a row outside of any business transaction.
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEventId, OutboxStoreError>;

    async fn get(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxStoreError>;

    /// Lease due rows to `request.owner`, oldest first: up to `batch_size`
    /// `PENDING` rows plus up to `batch_size` retryable `FAILED` rows.
    ///
    /// Two concurrent claims never return the same row while its lease is active.
    async fn claim_due(&self, request: &ClaimRequest) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// Extend `owner`'s lease on `id` to `until`.
    ///
    /// Returns `false` and changes nothing unless `owner` holds an active lease
    /// on the row at `now`. The relay calls this right before every publish
    /// attempt.
    async fn renew_lease(
        &self,
        owner: &RelayId,
        id: OutboxEventId,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError>;

    /// Persist the relay's transition of `event` and drop the lease.
    ///
    /// Written only while `owner` still holds the row and the stored row is not
    /// `PUBLISHED`.
    async fn record_outcome(
        &self,
        owner: &RelayId,
        event: &OutboxEvent,
    ) -> Result<OutcomeWrite, OutboxStoreError>;

    /// Drop `owner`'s lease on rows it claimed but did not attempt.
    async fn release(&self, owner: &RelayId, ids: &[OutboxEventId]) -> Result<(), OutboxStoreError>;

    /// Delete `PUBLISHED` rows published strictly before `cutoff`.
    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxStoreError>;

    /// Move a `FAILED` row back to `PENDING` with a fresh retry budget.
    async fn replay(&self, id: OutboxEventId) -> Result<OutboxEvent, OutboxStoreError>;

    /// `FAILED` rows, oldest first.
    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEventId, OutboxStoreError> {
        (**self).append(event).await
    }

    async fn get(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        (**self).get(id).await
    }

    async fn claim_due(&self, request: &ClaimRequest) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).claim_due(request).await
    }

    async fn renew_lease(
        &self,
        owner: &RelayId,
        id: OutboxEventId,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        (**self).renew_lease(owner, id, now, until).await
    }

    async fn record_outcome(
        &self,
        owner: &RelayId,
        event: &OutboxEvent,
    ) -> Result<OutcomeWrite, OutboxStoreError> {
        (**self).record_outcome(owner, event).await
    }

    async fn release(&self, owner: &RelayId, ids: &[OutboxEventId]) -> Result<(), OutboxStoreError> {
        (**self).release(owner, ids).await
    }

    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxStoreError> {
        (**self).delete_published_before(cutoff).await
    }

    async fn replay(&self, id: OutboxEventId) -> Result<OutboxEvent, OutboxStoreError> {
        (**self).replay(id).await
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).list_failed(limit).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats().await
    }
}

/// Appends outbox rows inside a caller-owned business transaction.
///
/// A row written through a writer becomes visible to the relay only when the
/// surrounding transaction commits, and disappears with it on rollback.
#[async_trait]
pub trait OutboxWriter: Send {
    async fn append(&mut self, event: NewOutboxEvent) -> Result<OutboxEventId, OutboxStoreError>;
}
