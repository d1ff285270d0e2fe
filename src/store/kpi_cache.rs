//! KPI cache rows — advisory pre-computed values
//!
//! The nightly job upserts one row per (machine, period, KPI). Readers treat
//! a miss as "recompute from the aggregates"; nothing depends on the cache.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::types::{KpiCacheRow, KpiSet, TimeRange};

/// Upsert one cached KPI value.
pub async fn upsert(pool: &PgPool, row: &KpiCacheRow) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO kpi_cache \
             (machine_id, period_start, period_end, kpi_name, value, unit, computed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (machine_id, period_start, period_end, kpi_name) \
         DO UPDATE SET value = EXCLUDED.value, unit = EXCLUDED.unit, \
                       computed_at = EXCLUDED.computed_at",
    )
    .bind(&row.machine_id)
    .bind(row.period_start)
    .bind(row.period_end)
    .bind(&row.kpi_name)
    .bind(row.value)
    .bind(&row.unit)
    .bind(row.computed_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Store every KPI of a computed set for its window.
pub async fn upsert_set(pool: &PgPool, set: &KpiSet) -> sqlx::Result<()> {
    let entries: [(&str, &crate::types::KpiValue); 5] = [
        ("sec", &set.sec),
        ("peak_demand", &set.peak_demand),
        ("load_factor", &set.load_factor),
        ("energy_cost", &set.energy_cost),
        ("carbon", &set.carbon),
    ];
    for (name, kpi) in entries {
        upsert(
            pool,
            &KpiCacheRow {
                machine_id: set.machine_id.clone(),
                period_start: set.period_start,
                period_end: set.period_end,
                kpi_name: name.to_string(),
                value: kpi.value,
                unit: kpi.unit.clone(),
                computed_at: set.computed_at,
            },
        )
        .await?;
    }
    Ok(())
}

/// Cached rows exactly covering a window, if the nightly job produced them.
pub async fn cached_for(
    pool: &PgPool,
    machine_id: &str,
    range: &TimeRange,
) -> sqlx::Result<Vec<KpiCacheRow>> {
    sqlx::query_as(
        "SELECT machine_id, period_start, period_end, kpi_name, value, unit, computed_at \
         FROM kpi_cache \
         WHERE machine_id = $1 AND period_start = $2 AND period_end = $3",
    )
    .bind(machine_id)
    .bind(range.start)
    .bind(range.end)
    .fetch_all(pool)
    .await
}

/// Most recent computation timestamp for health introspection.
pub async fn last_computed_at(pool: &PgPool) -> sqlx::Result<Option<DateTime<Utc>>> {
    sqlx::query_scalar("SELECT MAX(computed_at) FROM kpi_cache")
        .fetch_one(pool)
        .await
}
