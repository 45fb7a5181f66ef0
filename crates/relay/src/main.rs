//! Outbox relay: drains one service's outbox into Redis Streams.

use std::sync::Arc;

use anyhow::Context;

use courier_infra::broker::RedisStreamsBroker;
use courier_infra::db::{connect_pool, ensure_schema};
use courier_infra::{PostgresOutboxStore, PublishLoop, RelayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let config = RelayConfig::from_env().context("loading relay configuration")?;
    tracing::info!(
        service = %config.service_name,
        exchange = %config.broker.exchange,
        batch_size = config.batch_size,
        "starting outbox relay"
    );

    let pool = connect_pool(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to postgres")?;
    ensure_schema(&pool).await.context("applying outbox schema")?;

    let broker = Arc::new(
        RedisStreamsBroker::connect(&config.broker)
            .await
            .context("connecting to redis")?,
    );

    let store = PostgresOutboxStore::new(pool.clone());
    let handle = PublishLoop::new(store, broker.clone(), config.publish_loop_config()).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = handle.shutdown().await;
    tracing::info!(
        ticks = stats.ticks,
        published = stats.published,
        requeued = stats.requeued,
        failed = stats.failed,
        store_errors = stats.store_errors,
        "publish loop totals"
    );
    broker.close();
    pool.close().await;

    tracing::info!("outbox relay stopped");
    Ok(())
}
