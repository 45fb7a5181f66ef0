//! Postgres-backed incoming-event ledger (`incoming_events`).
//!
//! Recording relies on the primary key: `INSERT ... ON CONFLICT (id) DO NOTHING`
//! creates the row for exactly one of any number of concurrent deliveries.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};

use courier_core::EventId;
use courier_events::IncomingEvent;

use super::store::{IncomingEventLedger, LedgerCursor, LedgerError, RecordOutcome};

const COLUMNS: &str =
    "id, event_source, event_type, payload, attempts, last_error, created_at, consumed_at";

#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: Arc<PgPool>,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl IncomingEventLedger for PostgresLedger {
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type), err)]
    async fn record_if_absent(&self, event: IncomingEvent) -> Result<RecordOutcome, LedgerError> {
        let id = event.id;
        let result = sqlx::query(
            r#"
            INSERT INTO incoming_events (id, event_source, event_type, payload, attempts, created_at)
            VALUES ($1, $2, $3, $4, 0, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id.as_uuid())
        .bind(&event.event_source)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_if_absent", e))?;

        let recorded = result.rows_affected() > 0;
        debug!(event_id = %id, recorded, "ledger record");

        if recorded {
            return Ok(RecordOutcome::Recorded);
        }
        match self.get(id).await? {
            Some(existing) => Ok(RecordOutcome::Existing(existing)),
            None => Err(LedgerError::Storage(format!(
                "incoming event {id} conflicted on insert but could not be read back"
            ))),
        }
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn mark_consumed(&self, id: EventId) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "UPDATE incoming_events SET consumed_at = now() WHERE id = $1 AND consumed_at IS NULL",
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_consumed", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(LedgerError::NotFound(id)),
        }
    }

    #[instrument(skip(self, error), fields(event_id = %id), err)]
    async fn record_failure(&self, id: EventId, error: &str) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE incoming_events SET attempts = attempts + 1, last_error = $2 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn find_unconsumed_after(
        &self,
        cursor: Option<LedgerCursor>,
        limit: usize,
    ) -> Result<Vec<IncomingEvent>, LedgerError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM incoming_events
            WHERE consumed_at IS NULL
              AND ($1::timestamptz IS NULL OR (created_at, id) > ($1, $2::uuid))
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(cursor.map(|c| c.created_at))
        .bind(cursor.map(|c| *c.id.as_uuid()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_unconsumed_after", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: EventId) -> Result<Option<IncomingEvent>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM incoming_events WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_row).transpose()
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<IncomingEvent, LedgerError> {
    IncomingEventRow::from_row(row)
        .map(Into::into)
        .map_err(|e| LedgerError::Storage(format!("failed to decode incoming event row: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            LedgerError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => LedgerError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[derive(Debug)]
struct IncomingEventRow {
    id: uuid::Uuid,
    event_source: String,
    event_type: String,
    payload: serde_json::Value,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    consumed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for IncomingEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(IncomingEventRow {
            id: row.try_get("id")?,
            event_source: row.try_get("event_source")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            consumed_at: row.try_get("consumed_at")?,
        })
    }
}

impl From<IncomingEventRow> for IncomingEvent {
    fn from(row: IncomingEventRow) -> Self {
        IncomingEvent {
            id: EventId::from_uuid(row.id),
            event_source: row.event_source,
            event_type: row.event_type,
            payload: row.payload,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error,
            created_at: row.created_at,
            consumed_at: row.consumed_at,
        }
    }
}
