//! Time-series store adapter — the only path to PostgreSQL/TimescaleDB
//!
//! Reads raw hypertables and the fixed continuous aggregates
//! (`_1min`, `_15min`, `_1hour`, `_1day`, each materialized directly from its
//! hypertable). Writes only the four tables the core owns: baselines,
//! anomalies, training history and the KPI cache.

pub mod anomalies;
pub mod baselines;
pub mod catalog;
pub mod kpi_cache;
pub mod timeseries;
pub mod training_jobs;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::DbConfig;

/// Create the PostgreSQL connection pool.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.url)
        .await?;

    info!(pool_size = config.pool_size, "Connected to PostgreSQL");
    Ok(pool)
}

/// Run migrations for the core-owned tables.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Migrations complete");
    Ok(())
}

/// Cheap liveness probe used by startup and `/health`.
pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .is_ok()
}
