//! Catalog reads: machines, energy sources, feature declarations, SEUs
//!
//! These tables are owned by the ETL/provisioning side; the core never
//! writes them. Column aliases pin the external schema to our field names.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::types::{EnergySource, EnergySourceFeature, Machine, Seu};

const MACHINE_COLUMNS: &str = "id, factory_id, name, type AS machine_type, rated_power_kw, \
     data_interval_seconds, mqtt_topic, active";

/// List machines, optionally restricted to active ones.
pub async fn list_machines(pool: &PgPool, active_only: bool) -> sqlx::Result<Vec<Machine>> {
    let sql = if active_only {
        format!("SELECT {MACHINE_COLUMNS} FROM machines WHERE active ORDER BY name")
    } else {
        format!("SELECT {MACHINE_COLUMNS} FROM machines ORDER BY name")
    };
    sqlx::query_as(&sql).fetch_all(pool).await
}

pub async fn machine_by_id(pool: &PgPool, id: &str) -> sqlx::Result<Option<Machine>> {
    sqlx::query_as(&format!(
        "SELECT {MACHINE_COLUMNS} FROM machines WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Machine names are unique within a factory; the voice surface addresses
/// machines by name, so a cross-factory duplicate resolves to the first hit.
pub async fn machine_by_name(pool: &PgPool, name: &str) -> sqlx::Result<Option<Machine>> {
    sqlx::query_as(&format!(
        "SELECT {MACHINE_COLUMNS} FROM machines WHERE name = $1 ORDER BY factory_id LIMIT 1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await
}

pub async fn list_energy_sources(pool: &PgPool) -> sqlx::Result<Vec<EnergySource>> {
    sqlx::query_as(
        "SELECT id, key, unit, cost_per_unit, carbon_factor_per_unit, active \
         FROM energy_sources ORDER BY key",
    )
    .fetch_all(pool)
    .await
}

pub async fn energy_source_by_key(pool: &PgPool, key: &str) -> sqlx::Result<Option<EnergySource>> {
    sqlx::query_as(
        "SELECT id, key, unit, cost_per_unit, carbon_factor_per_unit, active \
         FROM energy_sources WHERE key = $1",
    )
    .bind(key)
    .fetch_optional(pool)
    .await
}

/// Admissible features for one energy source, as declared by provisioning.
pub async fn features_for_source(
    pool: &PgPool,
    energy_source: &str,
) -> sqlx::Result<Vec<EnergySourceFeature>> {
    sqlx::query_as(
        "SELECT energy_source, feature_key, source_table, source_column, aggregation, \
                data_type, description \
         FROM energy_source_features WHERE energy_source = $1 ORDER BY feature_key",
    )
    .bind(energy_source)
    .fetch_all(pool)
    .await
}

/// List SEUs, optionally filtered by energy source.
pub async fn list_seus(pool: &PgPool, energy_source: Option<&str>) -> sqlx::Result<Vec<Seu>> {
    match energy_source {
        Some(source) => {
            sqlx::query_as(
                "SELECT id, name, energy_source, machine_ids FROM seus \
                 WHERE energy_source = $1 ORDER BY name",
            )
            .bind(source)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as("SELECT id, name, energy_source, machine_ids FROM seus ORDER BY name")
                .fetch_all(pool)
                .await
        }
    }
}

pub async fn seu_by_id(pool: &PgPool, id: &str) -> sqlx::Result<Option<Seu>> {
    sqlx::query_as("SELECT id, name, energy_source, machine_ids FROM seus WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Timestamp of the first energy reading for a machine, if any.
///
/// The retrain job uses this to require at least 14 days of history.
pub async fn earliest_energy_reading(
    pool: &PgPool,
    machine_id: &str,
) -> sqlx::Result<Option<DateTime<Utc>>> {
    sqlx::query_scalar("SELECT MIN(time) FROM energy_readings WHERE machine_id = $1")
        .bind(machine_id)
        .fetch_one(pool)
        .await
}
