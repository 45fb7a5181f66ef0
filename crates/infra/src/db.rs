//! Postgres pool and schema setup.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

/// Schema for `outbox_events` and `incoming_events`.
pub const SCHEMA_SQL: &str = include_str!("../migrations/0001_outbox.sql");

#[instrument(skip(database_url), err)]
pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
}

/// Apply the schema. Every statement is `IF NOT EXISTS`, so this is safe on each start.
#[instrument(skip(pool), err)]
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    info!("outbox schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_both_tables_idempotently() {
        assert!(SCHEMA_SQL.contains("CREATE TABLE IF NOT EXISTS outbox_events"));
        assert!(SCHEMA_SQL.contains("CREATE TABLE IF NOT EXISTS incoming_events"));
        assert!(SCHEMA_SQL.contains("(status = 'published') = (published_at IS NOT NULL)"));
        assert!(!SCHEMA_SQL.contains("CREATE TABLE outbox_events"));
    }
}
