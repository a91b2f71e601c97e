//! Worker daemon: runs the ingestion dispatcher against Postgres.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use leadflow_core::SystemClock;
use leadflow_infra::dispatcher::{Dispatcher, DispatcherConfig};
use leadflow_infra::ledger::PostgresDomainStore;
use leadflow_infra::processor::Processor;
use leadflow_infra::queue::PostgresQueueStore;
use leadflow_ingest::RetryPolicy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    leadflow_observability::init();

    let database_url = std::env::var("LEADFLOW_DATABASE_URL")
        .context("LEADFLOW_DATABASE_URL must be set")?;
    let workers = env_or("LEADFLOW_WORKERS", 4);
    let batch_size = env_or("LEADFLOW_BATCH_SIZE", 10);
    let lease_secs = env_or("LEADFLOW_LEASE_SECS", 30);
    let max_attempts = env_or("LEADFLOW_MAX_ATTEMPTS", 5);

    let pool = PgPoolOptions::new()
        .max_connections((workers as u32).saturating_add(4))
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;
    leadflow_infra::postgres::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let queue = Arc::new(PostgresQueueStore::new(pool.clone()));
    let domain = Arc::new(PostgresDomainStore::new(pool));
    let processor = Arc::new(Processor::new(domain));

    let config = DispatcherConfig::default()
        .with_workers(workers as usize)
        .with_batch_size(batch_size as usize)
        .with_lease(Duration::from_secs(lease_secs))
        .with_retry_policy(RetryPolicy {
            max_attempts: max_attempts as u32,
            ..RetryPolicy::default()
        });

    tracing::info!(workers, batch_size, lease_secs, max_attempts, "leadflow runner starting");
    let handle = Dispatcher::spawn(queue, processor, Arc::new(SystemClock), config);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received; draining workers");
    handle.shutdown().await;

    Ok(())
}

/// Read a numeric env var, logging and falling back on anything unusable.
fn env_or(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, default, "unparseable value; using default");
            default
        }),
        Err(_) => default,
    }
}
