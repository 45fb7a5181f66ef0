//! Postgres-backed outbox store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxStoreError |
//! |------------|----------------------|------------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (check violation) | `23514` | `InvalidTransition` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! ## Atomicity
//!
//! Status updates are single `UPDATE ... WHERE id = $1 AND status = 'pending'`
//! statements. When no row matches, a follow-up read tells `NotFound` apart
//! from `InvalidTransition`. Claiming uses `FOR UPDATE SKIP LOCKED` so
//! concurrent publish loops skip rows another loop is claiming.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use courier_core::{EventId, EventType, RoutingKey};
use courier_events::{NewOutboxEvent, OutboxEvent, OutboxStatus};

use super::store::{OutboxStats, OutboxStore, OutboxStoreError};

const COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, routing_key, payload, \
    status, attempts, last_error, next_attempt_at, claimed_by, claimed_until, created_at, published_at";

/// Postgres outbox table (`outbox_events`).
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

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert the outbox row on the caller's transaction.
    ///
    /// Commit the business write and the event together: if either fails the
    /// transaction rolls back and no event is emitted for a change that
    /// never happened.
    #[instrument(
        skip(tx, event),
        fields(event_id = %event.id, event_type = %event.event_type),
        err
    )]
    pub async fn insert_event_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        event: NewOutboxEvent,
    ) -> Result<OutboxEvent, OutboxStoreError> {
        let id = event.id;
        let routing_key = event.effective_routing_key();

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO outbox_events
                (id, aggregate_type, aggregate_id, event_type, routing_key, payload, status, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(event.aggregate_type.as_deref())
        .bind(event.aggregate_id.as_deref())
        .bind(event.event_type.as_str())
        .bind(routing_key.as_str())
        .bind(&event.payload)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_event", Some(id), e))?;

        decode_row(&row)
    }

    async fn fetch_status(&self, id: EventId) -> Result<Option<OutboxStatus>, OutboxStoreError> {
        let row = sqlx::query("SELECT status FROM outbox_events WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_status", Some(id), e))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let status: String = row
                    .try_get("status")
                    .map_err(|e| map_sqlx_error("fetch_status", Some(id), e))?;
                status
                    .parse::<OutboxStatus>()
                    .map(Some)
                    .map_err(|e| OutboxStoreError::Storage(e.to_string()))
            }
        }
    }

    /// Turn "0 rows affected" into the right error.
    async fn no_pending_row(&self, id: EventId, to: OutboxStatus) -> OutboxStoreError {
        match self.fetch_status(id).await {
            Ok(None) => OutboxStoreError::NotFound(id),
            Ok(Some(from)) => {
                OutboxStoreError::InvalidTransition(format!("cannot transition from {from} to {to}"))
            }
            Err(err) => err,
        }
    }

    async fn fetch_many(
        &self,
        operation: &str,
        sql: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = sqlx::query(sql)
            .bind(limit_param(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, None, e))?;

        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, event), fields(event_id = %event.id), err)]
    async fn insert_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, OutboxStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", None, e))?;

        let stored = Self::insert_event_in_tx(&mut tx, event).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", Some(stored.id), e))?;
        Ok(stored)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM outbox_events WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", Some(id), e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM outbox_events
            WHERE status = 'pending'
            ORDER BY created_at ASC, seq ASC
            LIMIT $1
            "#
        );
        self.fetch_many("find_pending", &sql, limit).await
    }

    #[instrument(skip(self), fields(worker = %worker_id), err)]
    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        // UPDATE ... RETURNING does not preserve the CTE order, so sort afterwards.
        let rows = sqlx::query(&format!(
            r#"
            WITH due AS (
                SELECT id FROM outbox_events
                WHERE status = 'pending'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= now())
                  AND (claimed_until IS NULL OR claimed_until <= now())
                ORDER BY created_at ASC, seq ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events o
            SET claimed_by = $2,
                claimed_until = now() + make_interval(secs => $3)
            FROM due
            WHERE o.id = due.id
            RETURNING o.seq, {}
            "#,
            prefixed_columns("o")
        ))
        .bind(limit_param(limit))
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_pending", None, e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row
                .try_get("seq")
                .map_err(|e| map_sqlx_error("claim_pending", None, e))?;
            claimed.push((seq, decode_row(row)?));
        }
        claimed.sort_by_key(|(seq, e)| (e.created_at, *seq));
        Ok(claimed.into_iter().map(|(_, e)| e).collect())
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn mark_published(&self, id: EventId) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'published',
                published_at = GREATEST(now(), created_at),
                attempts = attempts + 1,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_published", Some(id), e))?;

        if result.rows_affected() == 0 {
            return Err(self.no_pending_row(id, OutboxStatus::Published).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(event_id = %id), err)]
    async fn mark_failed(&self, id: EventId, error: &str) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'failed',
                last_error = $2,
                attempts = attempts + 1,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", Some(id), e))?;

        if result.rows_affected() == 0 {
            return Err(self.no_pending_row(id, OutboxStatus::Failed).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(event_id = %id, next_attempt_at = %next_attempt_at), err)]
    async fn requeue(
        &self,
        id: EventId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET last_error = $2,
                next_attempt_at = $3,
                attempts = attempts + 1,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(next_attempt_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue", Some(id), e))?;

        if result.rows_affected() == 0 {
            return Err(self.no_pending_row(id, OutboxStatus::Pending).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn retry_failed(&self, id: EventId) -> Result<OutboxEvent, OutboxStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE outbox_events
            SET status = 'pending',
                attempts = 0,
                last_error = NULL,
                next_attempt_at = NULL,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1 AND status = 'failed'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_failed", Some(id), e))?;

        match row {
            Some(row) => decode_row(&row),
            None => match self.fetch_status(id).await? {
                None => Err(OutboxStoreError::NotFound(id)),
                Some(from) => Err(OutboxStoreError::InvalidTransition(format!(
                    "cannot transition from {from} to {}",
                    OutboxStatus::Pending
                ))),
            },
        }
    }

    #[instrument(skip(self), err)]
    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM outbox_events
            WHERE status = 'failed'
            ORDER BY created_at ASC, seq ASC
            LIMIT $1
            "#
        );
        self.fetch_many("list_failed", &sql, limit).await
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM outbox_events GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", None, e))?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", None, e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", None, e))?;
            let n = usize::try_from(n).unwrap_or(0);
            match status.parse::<OutboxStatus>() {
                Ok(OutboxStatus::Pending) => stats.pending = n,
                Ok(OutboxStatus::Published) => stats.published = n,
                Ok(OutboxStatus::Failed) => stats.failed = n,
                Err(e) => return Err(OutboxStoreError::Storage(e.to_string())),
            }
        }
        Ok(stats)
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn prefixed_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEvent, OutboxStoreError> {
    OutboxEventRow::from_row(row)
        .map_err(|e| OutboxStoreError::Storage(format!("failed to decode outbox row: {e}")))?
        .try_into()
}

/// Map SQLx errors to `OutboxStoreError` with an operation label.
fn map_sqlx_error(operation: &str, id: Option<EventId>, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => match id {
                    Some(id) => OutboxStoreError::AlreadyExists(id),
                    None => OutboxStoreError::Storage(msg),
                },
                Some("23514") => OutboxStoreError::InvalidTransition(msg),
                _ => OutboxStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => OutboxStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct OutboxEventRow {
    id: uuid::Uuid,
    aggregate_type: Option<String>,
    aggregate_id: Option<String>,
    event_type: String,
    routing_key: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    claimed_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for OutboxEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxEventRow {
            id: row.try_get("id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            routing_key: row.try_get("routing_key")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_until: row.try_get("claimed_until")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
        })
    }
}

impl TryFrom<OutboxEventRow> for OutboxEvent {
    type Error = OutboxStoreError;

    fn try_from(row: OutboxEventRow) -> Result<Self, Self::Error> {
        let invalid = |e: courier_core::DomainError| {
            OutboxStoreError::Storage(format!("invalid outbox row {}: {e}", row.id))
        };

        Ok(OutboxEvent {
            id: EventId::from_uuid(row.id),
            aggregate_type: row.aggregate_type.clone(),
            aggregate_id: row.aggregate_id.clone(),
            event_type: EventType::parse(row.event_type.clone()).map_err(invalid)?,
            routing_key: RoutingKey::parse(row.routing_key.clone()).map_err(invalid)?,
            payload: row.payload.clone(),
            status: row.status.parse().map_err(invalid)?,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error.clone(),
            next_attempt_at: row.next_attempt_at,
            claimed_by: row.claimed_by.clone(),
            claimed_until: row.claimed_until,
            created_at: row.created_at,
            published_at: row.published_at,
        })
    }
}
