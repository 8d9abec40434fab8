//! In-memory outbox store for tests/dev.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use bazaar_core::{
    Clock, Lease, NewOutboxEvent, OutboxEvent, OutboxEventId, OutboxStatus, RelayId, SystemClock,
};

use super::r#trait::{
    ClaimRequest, OutboxStats, OutboxStore, OutboxStoreError, OutboxWriter, OutcomeWrite,
};

/// In-memory outbox table.
///
/// - Rows keyed by id; ids come from a counter and are never reused
/// - Claims run under the write lock, so concurrent claims never overlap
/// - `created_at` comes from the injected [`Clock`]
pub struct InMemoryOutboxStore {
    rows: RwLock<BTreeMap<OutboxEventId, OutboxEvent>>,
    next_id: AtomicI64,
    clock: Arc<dyn Clock>,
    fail_outcome_writes: AtomicU32,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            clock,
            fail_outcome_writes: AtomicU32::new(0),
        }
    }

    /// Start a business transaction that may append outbox rows.
    pub fn begin(&self) -> InMemoryTransaction<'_> {
        InMemoryTransaction {
            store: self,
            staged: Vec::new(),
        }
    }

    /// Fail the next `count` outcome writes with a storage error.
    pub fn fail_next_outcome_writes(&self, count: u32) {
        self.fail_outcome_writes.store(count, Ordering::SeqCst);
    }

    /// Every row, ordered by id.
    pub fn all(&self) -> Vec<OutboxEvent> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn allocate_id(&self) -> OutboxEventId {
        OutboxEventId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn take_outcome_failure(&self) -> bool {
        self.fail_outcome_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<OutboxEventId, OutboxEvent>> {
        self.rows.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<OutboxEventId, OutboxEvent>> {
        self.rows.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutboxStore")
            .field("rows", &self.len())
            .finish()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEventId, OutboxStoreError> {
        let mut tx = self.begin();
        let id = tx.append(event).await?;
        tx.commit();
        Ok(id)
    }

    async fn get(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        Ok(self.read().get(&id).cloned())
    }

    async fn claim_due(&self, request: &ClaimRequest) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        if request.batch_size == 0 {
            return Ok(Vec::new());
        }

        let mut rows = self.write();

        let oldest_due = |status: OutboxStatus| {
            let mut due: Vec<(DateTime<Utc>, OutboxEventId)> = rows
                .values()
                .filter(|e| e.status == status && e.is_due(request.now, request.max_retries))
                .map(|e| (e.created_at, e.id))
                .collect();
            due.sort_unstable();
            due.truncate(request.batch_size);
            due
        };
        let mut due = oldest_due(OutboxStatus::Pending);
        due.extend(oldest_due(OutboxStatus::Failed));
        due.sort_unstable();

        let lease = Lease {
            owner: request.owner.clone(),
            expires_at: request.lease_expires_at(),
        };

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(row) = rows.get_mut(&id) {
                row.lease = Some(lease.clone());
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn renew_lease(
        &self,
        owner: &RelayId,
        id: OutboxEventId,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let mut rows = self.write();
        let row = rows.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        if row.status == OutboxStatus::Published || !row.is_leased_by(owner, now) {
            return Ok(false);
        }
        row.lease = Some(Lease {
            owner: owner.clone(),
            expires_at: until,
        });
        Ok(true)
    }

    async fn record_outcome(
        &self,
        owner: &RelayId,
        event: &OutboxEvent,
    ) -> Result<OutcomeWrite, OutboxStoreError> {
        if self.take_outcome_failure() {
            return Err(OutboxStoreError::Storage(
                "simulated outcome write failure".to_string(),
            ));
        }

        let mut rows = self.write();
        let stored = rows
            .get_mut(&event.id)
            .ok_or(OutboxStoreError::NotFound(event.id))?;

        if stored.status == OutboxStatus::Published {
            return Ok(OutcomeWrite::AlreadyPublished);
        }
        let held = stored.lease.as_ref().is_some_and(|l| &l.owner == owner);
        if !held || event.retry_count < stored.retry_count {
            return Ok(OutcomeWrite::LeaseLost);
        }

        stored.status = event.status;
        stored.retry_count = event.retry_count;
        stored.published_at = event.published_at;
        stored.last_error = event.last_error.clone();
        stored.next_attempt_at = event.next_attempt_at;
        stored.permanent_failure = event.permanent_failure;
        stored.lease = None;
        Ok(OutcomeWrite::Applied)
    }

    async fn release(&self, owner: &RelayId, ids: &[OutboxEventId]) -> Result<(), OutboxStoreError> {
        let mut rows = self.write();
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.lease.as_ref().is_some_and(|l| &l.owner == owner) {
                    row.lease = None;
                }
            }
        }
        Ok(())
    }

    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxStoreError> {
        let mut rows = self.write();
        let before = rows.len();
        rows.retain(|_, e| {
            !(e.status == OutboxStatus::Published && e.published_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - rows.len()) as u64)
    }

    async fn replay(&self, id: OutboxEventId) -> Result<OutboxEvent, OutboxStoreError> {
        let mut rows = self.write();
        let row = rows.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        row.replay()?;
        Ok(row.clone())
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = self.read();
        let mut failed: Vec<OutboxEvent> = rows
            .values()
            .filter(|e| e.status == OutboxStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|e| (e.created_at, e.id));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let rows = self.read();
        let mut stats = OutboxStats::default();
        for row in rows.values() {
            match row.status {
                OutboxStatus::Pending => {
                    stats.pending += 1;
                    stats.oldest_pending_at = Some(match stats.oldest_pending_at {
                        Some(at) => at.min(row.created_at),
                        None => row.created_at,
                    });
                }
                OutboxStatus::Published => stats.published += 1,
                OutboxStatus::Failed => {
                    stats.failed += 1;
                    if row.permanent_failure {
                        stats.permanently_failed += 1;
                    }
                }
            }
        }
        Ok(stats)
    }
}

/// A business transaction against [`InMemoryOutboxStore`].
///
/// Appended rows get their id immediately but stay invisible until
/// [`commit`](Self::commit). Dropping the transaction discards them, the same
/// way an aborted database transaction would; their ids are not reused.
pub struct InMemoryTransaction<'a> {
    store: &'a InMemoryOutboxStore,
    staged: Vec<OutboxEvent>,
}

impl InMemoryTransaction<'_> {
    /// Make every staged row visible at once.
    pub fn commit(self) -> Vec<OutboxEventId> {
        let mut rows = self.store.write();
        self.staged
            .into_iter()
            .map(|event| {
                let id = event.id;
                rows.insert(id, event);
                id
            })
            .collect()
    }

    pub fn rollback(self) {
        tracing::debug!(discarded = self.staged.len(), "outbox transaction rolled back");
    }

}

#[async_trait]
impl OutboxWriter for InMemoryTransaction<'_> {
    async fn append(&mut self, event: NewOutboxEvent) -> Result<OutboxEventId, OutboxStoreError> {
        if event.aggregate_type.trim().is_empty() {
            return Err(bazaar_core::DomainError::validation("aggregate type must not be empty").into());
        }
        let id = self.store.allocate_id();
        self.staged.push(event.into_event(id, self.store.clock.now()));
        Ok(id)
    }
}
