//! Postgres-backed outbox store.
//!
//! ## Claiming
//!
//! Rows are claimed with `SELECT ... FOR UPDATE SKIP LOCKED` inside a single
//! `UPDATE ... RETURNING`, which stamps `locked_by`/`locked_until`. Concurrent
//! relay instances therefore never receive the same row while its lease is
//! active, and rows of a crashed instance become due again once the lease
//! expires.
//!
//! ## Outcome writes
//!
//! Every status update is conditional on `locked_by = $owner AND status <> 'PUBLISHED'`,
//! so a row is never moved out of `PUBLISHED` and a relay whose lease was taken
//! over cannot overwrite the new owner's result.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxStoreError |
//! |------------|----------------------|------------------|
//! | Database (check constraint violation) | `23514` | `Domain(Validation)` |
//! | Database (not null violation) | `23502` | `Domain(Validation)` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use bazaar_core::{
    AggregateId, DomainError, Lease, NewOutboxEvent, OutboxEvent, OutboxEventId, OutboxStatus,
    RelayId,
};

use super::r#trait::{
    ClaimRequest, OutboxStats, OutboxStore, OutboxStoreError, OutboxWriter, OutcomeWrite,
};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id                BIGSERIAL PRIMARY KEY,
        aggregate_type    TEXT        NOT NULL CHECK (length(trim(aggregate_type)) > 0),
        aggregate_id      TEXT        NOT NULL,
        event_type        TEXT        NOT NULL CHECK (length(trim(event_type)) > 0),
        payload           TEXT        NOT NULL,
        status            TEXT        NOT NULL DEFAULT 'PENDING'
                                      CHECK (status IN ('PENDING', 'PUBLISHED', 'FAILED')),
        retry_count       INTEGER     NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        published_at      TIMESTAMPTZ,
        last_error        TEXT,
        next_attempt_at   TIMESTAMPTZ,
        permanent_failure BOOLEAN     NOT NULL DEFAULT FALSE,
        locked_by         TEXT,
        locked_until      TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_events_due
        ON outbox_events (status, created_at, id)
        WHERE status IN ('PENDING', 'FAILED')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_events_published_at
        ON outbox_events (published_at)
        WHERE status = 'PUBLISHED'
    "#,
];

const COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, status, retry_count, \
    created_at, published_at, last_error, next_attempt_at, permanent_failure, locked_by, locked_until";

/// Create the `outbox_events` table and its indexes if they do not exist.
#[instrument(skip(pool), err)]
pub async fn run_migrations(pool: &PgPool) -> Result<(), OutboxStoreError> {
    for statement in MIGRATIONS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("run_migrations", e))?;
    }
    Ok(())
}

/// Postgres-backed outbox table.
///
/// `Send + Sync`; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Start a business transaction. Outbox rows appended through it (see
    /// [`OutboxWriter`]) commit or roll back with the business writes.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, OutboxStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))
    }
}

#[async_trait]
impl<'c> OutboxWriter for Transaction<'c, Postgres> {
    async fn append(&mut self, event: NewOutboxEvent) -> Result<OutboxEventId, OutboxStoreError> {
        insert_event(&mut **self, &event).await
    }
}

async fn insert_event(
    conn: &mut PgConnection,
    event: &NewOutboxEvent,
) -> Result<OutboxEventId, OutboxStoreError> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO outbox_events (aggregate_type, aggregate_id, event_type, payload)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(&event.aggregate_type)
    .bind(event.aggregate_id.as_str())
    .bind(&event.event_type)
    .bind(&event.payload)
    .fetch_one(conn)
    .await
    .map_err(|e| map_sqlx_error("append", e))?;

    Ok(OutboxEventId::new(id))
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(
        skip(self, event),
        fields(aggregate_type = %event.aggregate_type, event_type = %event.event_type),
        err
    )]
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEventId, OutboxStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("append", e))?;
        insert_event(&mut conn, &event).await
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM outbox_events WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_row(&r)).transpose()
    }

    #[instrument(
        skip(self, request),
        fields(
            owner = %request.owner,
            batch_size = request.batch_size,
            claimed = tracing::field::Empty
        ),
        err
    )]
    async fn claim_due(&self, request: &ClaimRequest) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        if request.batch_size == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(request.batch_size).unwrap_or(i64::MAX);
        let max_retries = i32::try_from(request.max_retries).unwrap_or(i32::MAX);

        // Two locking subqueries: FOR UPDATE is not allowed directly under UNION.
        let rows = sqlx::query(&format!(
            r#"
            WITH pending AS (
                SELECT id FROM outbox_events
                WHERE status = 'PENDING'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                  AND (locked_until IS NULL OR locked_until <= $1)
                ORDER BY created_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ),
            retryable AS (
                SELECT id FROM outbox_events
                WHERE status = 'FAILED'
                  AND NOT permanent_failure
                  AND retry_count < $3
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                  AND (locked_until IS NULL OR locked_until <= $1)
                ORDER BY created_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ),
            batch AS (
                SELECT id FROM pending
                UNION ALL
                SELECT id FROM retryable
            )
            UPDATE outbox_events
            SET locked_by = $4, locked_until = $5
            WHERE id IN (SELECT id FROM batch)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(request.now)
        .bind(limit)
        .bind(max_retries)
        .bind(request.owner.as_str())
        .bind(request.lease_expires_at())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_due", e))?;

        let mut claimed = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|e| (e.created_at, e.id));

        tracing::Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self), fields(owner = %owner, event_id = %id), err)]
    async fn renew_lease(
        &self,
        owner: &RelayId,
        id: OutboxEventId,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET locked_until = $4
            WHERE id = $1
              AND locked_by = $2
              AND locked_until > $3
              AND status <> 'PUBLISHED'
            "#,
        )
        .bind(id.get())
        .bind(owner.as_str())
        .bind(now)
        .bind(until)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_lease", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(
        skip(self, event),
        fields(owner = %owner, event_id = %event.id, status = %event.status),
        err
    )]
    async fn record_outcome(
        &self,
        owner: &RelayId,
        event: &OutboxEvent,
    ) -> Result<OutcomeWrite, OutboxStoreError> {
        let retry_count = i32::try_from(event.retry_count).unwrap_or(i32::MAX);

        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = $3,
                retry_count = $4,
                published_at = $5,
                last_error = $6,
                next_attempt_at = $7,
                permanent_failure = $8,
                locked_by = NULL,
                locked_until = NULL
            WHERE id = $1
              AND locked_by = $2
              AND status <> 'PUBLISHED'
              AND retry_count <= $4
            "#,
        )
        .bind(event.id.get())
        .bind(owner.as_str())
        .bind(event.status.as_str())
        .bind(retry_count)
        .bind(event.published_at)
        .bind(event.last_error.as_deref())
        .bind(event.next_attempt_at)
        .bind(event.permanent_failure)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_outcome", e))?;

        if result.rows_affected() > 0 {
            return Ok(OutcomeWrite::Applied);
        }

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM outbox_events WHERE id = $1")
            .bind(event.id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_outcome", e))?;

        match status.as_deref() {
            None => Err(OutboxStoreError::NotFound(event.id)),
            Some("PUBLISHED") => Ok(OutcomeWrite::AlreadyPublished),
            Some(_) => Ok(OutcomeWrite::LeaseLost),
        }
    }

    #[instrument(skip(self, ids), fields(owner = %owner, count = ids.len()), err)]
    async fn release(&self, owner: &RelayId, ids: &[OutboxEventId]) -> Result<(), OutboxStoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();

        sqlx::query(
            r#"
            UPDATE outbox_events
            SET locked_by = NULL, locked_until = NULL
            WHERE id = ANY($1) AND locked_by = $2
            "#,
        )
        .bind(ids)
        .bind(owner.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(cutoff = %cutoff), err)]
    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxStoreError> {
        let result = sqlx::query(
            "DELETE FROM outbox_events WHERE status = 'PUBLISHED' AND published_at < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_published_before", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn replay(&self, id: OutboxEventId) -> Result<OutboxEvent, OutboxStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE outbox_events
            SET status = 'PENDING',
                retry_count = 0,
                last_error = NULL,
                next_attempt_at = NULL,
                permanent_failure = FALSE,
                locked_by = NULL,
                locked_until = NULL
            WHERE id = $1 AND status = 'FAILED'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("replay", e))?;

        if let Some(row) = row {
            return decode_row(&row);
        }

        match self.get(id).await? {
            None => Err(OutboxStoreError::NotFound(id)),
            Some(event) => Err(DomainError::invalid_transition(
                id.get(),
                event.status,
                "only FAILED rows can be replayed",
            )
            .into()),
        }
    }

    #[instrument(skip(self), err)]
    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM outbox_events WHERE status = 'FAILED' ORDER BY created_at, id LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_failed", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'PENDING')                       AS pending,
                COUNT(*) FILTER (WHERE status = 'PUBLISHED')                     AS published,
                COUNT(*) FILTER (WHERE status = 'FAILED')                        AS failed,
                COUNT(*) FILTER (WHERE status = 'FAILED' AND permanent_failure)  AS permanently_failed,
                MIN(created_at) FILTER (WHERE status = 'PENDING')                AS oldest_pending_at
            FROM outbox_events
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<u64, OutboxStoreError> {
            let n: i64 = row.try_get(column).map_err(|e| map_sqlx_error("stats", e))?;
            Ok(u64::try_from(n).unwrap_or(0))
        };

        Ok(OutboxStats {
            pending: count("pending")?,
            published: count("published")?,
            failed: count("failed")?,
            permanently_failed: count("permanently_failed")?,
            oldest_pending_at: row
                .try_get("oldest_pending_at")
                .map_err(|e| map_sqlx_error("stats", e))?,
        })
    }
}

/// Raw `outbox_events` row.
struct OutboxEventRow {
    id: i64,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: String,
    status: String,
    retry_count: i32,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    permanent_failure: bool,
    locked_by: Option<String>,
    locked_until: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for OutboxEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxEventRow {
            id: row.try_get("id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            last_error: row.try_get("last_error")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            permanent_failure: row.try_get("permanent_failure")?,
            locked_by: row.try_get("locked_by")?,
            locked_until: row.try_get("locked_until")?,
        })
    }
}

impl TryFrom<OutboxEventRow> for OutboxEvent {
    type Error = OutboxStoreError;

    fn try_from(row: OutboxEventRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| OutboxStoreError::Corrupt { id: row.id, reason };

        let status: OutboxStatus = row.status.parse().map_err(|e: DomainError| corrupt(e.to_string()))?;
        let aggregate_id = AggregateId::new(row.aggregate_id.clone()).map_err(|e| corrupt(e.to_string()))?;
        let retry_count = u32::try_from(row.retry_count)
            .map_err(|_| corrupt(format!("negative retry_count {}", row.retry_count)))?;

        let lease = match (row.locked_by, row.locked_until) {
            (Some(owner), Some(expires_at)) => Some(Lease {
                owner: RelayId::new(owner).map_err(|e| corrupt(e.to_string()))?,
                expires_at,
            }),
            _ => None,
        };

        Ok(OutboxEvent {
            id: OutboxEventId::new(row.id),
            aggregate_type: row.aggregate_type,
            aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            status,
            retry_count,
            created_at: row.created_at,
            published_at: row.published_at,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            permanent_failure: row.permanent_failure,
            lease,
        })
    }
}

fn decode_row(row: &PgRow) -> Result<OutboxEvent, OutboxStoreError> {
    use sqlx::FromRow;

    let raw = OutboxEventRow::from_row(row).map_err(|e| {
        OutboxStoreError::Storage(format!("failed to deserialize outbox row: {e}"))
    })?;
    OutboxEvent::try_from(raw)
}

/// Map SQLx errors to [`OutboxStoreError`].
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // check / not-null violation: the row itself is invalid
                Some("23514") | Some("23502") => DomainError::validation(msg).into(),
                _ => OutboxStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => OutboxStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bazaar_core::RetryPolicy;

    use super::*;

    /// Connects only when `DATABASE_URL` is set; otherwise the test is a no-op.
    async fn store() -> Option<PostgresOutboxStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        run_migrations(&pool).await.ok()?;
        sqlx::query("TRUNCATE outbox_events").execute(&pool).await.ok()?;
        Some(PostgresOutboxStore::new(pool))
    }

    fn new_event(aggregate_id: i64) -> NewOutboxEvent {
        NewOutboxEvent::new(
            "Payment",
            AggregateId::from(aggregate_id),
            "PAYMENT_SUCCEEDED",
            &serde_json::json!({"amount": 990}),
        )
        .unwrap()
    }

    fn claim(owner: &RelayId, now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest {
            owner: owner.clone(),
            batch_size: 10,
            max_retries: 3,
            now,
            lease_for: Duration::from_secs(30),
        }
    }

    #[test]
    fn closed_pool_is_a_storage_error() {
        let err = map_sqlx_error("append", sqlx::Error::PoolClosed);
        assert!(matches!(err, OutboxStoreError::Storage(msg) if msg.contains("append")));
    }

    #[tokio::test]
    async fn rolled_back_transaction_writes_nothing() {
        let Some(store) = store().await else { return };

        let mut tx = store.begin().await.unwrap();
        tx.append(new_event(1)).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let id = tx.append(new_event(2)).await.unwrap();
        tx.commit().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn claim_publish_and_conditional_write() {
        let Some(store) = store().await else { return };
        let a = RelayId::new("relay-a").unwrap();
        let b = RelayId::new("relay-b").unwrap();
        store.append(new_event(1)).await.unwrap();

        let now = Utc::now();
        let mut claimed = store.claim_due(&claim(&a, now)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.claim_due(&claim(&b, now)).await.unwrap().is_empty());

        let mut event = claimed.remove(0);
        let mut stale = event.clone();
        event.mark_published(now);
        assert_eq!(store.record_outcome(&a, &event).await.unwrap(), OutcomeWrite::Applied);

        stale.record_failure("late", &RetryPolicy::immediate(3), now);
        assert_eq!(
            store.record_outcome(&a, &stale).await.unwrap(),
            OutcomeWrite::AlreadyPublished
        );

        let cutoff = now + chrono::Duration::seconds(1);
        assert_eq!(store.delete_published_before(cutoff).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pending_backlog_leaves_room_for_retryable_failed() {
        let Some(store) = store().await else { return };
        let owner = RelayId::new("relay-a").unwrap();
        let failed = store.append(new_event(9)).await.unwrap();

        let now = Utc::now();
        let mut event = store.claim_due(&claim(&owner, now)).await.unwrap().remove(0);
        event.record_failure("broker down", &RetryPolicy::immediate(1), now);
        store.record_outcome(&owner, &event).await.unwrap();
        for aggregate_id in 1..=3 {
            store.append(new_event(aggregate_id)).await.unwrap();
        }

        let mut request = claim(&owner, Utc::now());
        request.batch_size = 2;
        let claimed = store.claim_due(&request).await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert_eq!(claimed[0].id, failed);
        assert_eq!(claimed[0].status, OutboxStatus::Failed);

        let until = request.now + chrono::Duration::seconds(60);
        assert!(store.renew_lease(&owner, failed, request.now, until).await.unwrap());
        let other = RelayId::new("relay-b").unwrap();
        assert!(!store.renew_lease(&other, failed, request.now, until).await.unwrap());
    }

    #[tokio::test]
    async fn replay_only_from_failed() {
        let Some(store) = store().await else { return };
        let owner = RelayId::new("relay-a").unwrap();
        let id = store.append(new_event(1)).await.unwrap();

        assert!(matches!(
            store.replay(id).await,
            Err(OutboxStoreError::Domain(DomainError::InvalidTransition { .. }))
        ));

        let mut event = store.claim_due(&claim(&owner, Utc::now())).await.unwrap().remove(0);
        event.mark_permanently_failed("no handler");
        store.record_outcome(&owner, &event).await.unwrap();
        assert_eq!(store.list_failed(10).await.unwrap().len(), 1);

        let replayed = store.replay(id).await.unwrap();
        assert_eq!(replayed.status, OutboxStatus::Pending);
        assert_eq!(replayed.retry_count, 0);
        assert!(!replayed.permanent_failure);
    }
}
