//! Operator recovery for `FAILED` outbox rows.

use std::sync::Arc;

use tracing::{info, warn};

use bazaar_core::{OutboxEvent, OutboxEventId};

use crate::outbox_store::{OutboxStats, OutboxStore, OutboxStoreError};

/// Inspect and replay failed outbox rows.
pub struct OutboxAdmin<S: ?Sized> {
    store: Arc<S>,
}

impl<S> OutboxAdmin<S>
where
    S: OutboxStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Put a `FAILED` row back to `PENDING` with `retry_count = 0`.
    pub async fn replay(&self, id: OutboxEventId) -> Result<OutboxEvent, OutboxStoreError> {
        let event = self.store.replay(id).await?;
        info!(
            event_id = %event.id,
            aggregate_type = %event.aggregate_type,
            aggregate_id = %event.aggregate_id,
            "outbox event replayed"
        );
        Ok(event)
    }

    /// Replay up to `limit` `FAILED` rows, oldest first.
    ///
    /// A row that cannot be replayed (e.g. published in the meantime) is skipped.
    pub async fn replay_all_failed(&self, limit: usize) -> Result<Vec<OutboxEventId>, OutboxStoreError> {
        let failed = self.store.list_failed(limit).await?;
        let mut replayed = Vec::with_capacity(failed.len());
        for event in failed {
            match self.replay(event.id).await {
                Ok(_) => replayed.push(event.id),
                Err(OutboxStoreError::NotFound(_)) | Err(OutboxStoreError::Domain(_)) => {
                    warn!(event_id = %event.id, "failed outbox event changed before replay; skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(replayed)
    }

    pub async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        self.store.list_failed(limit).await
    }

    pub async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        self.store.stats().await
    }
}
