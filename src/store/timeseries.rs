//! Aggregate and hypertable reads
//!
//! All series come from the fixed continuous aggregates; the only raw
//! hypertable read is the latest-reading probe. Multi-machine scopes (SEUs)
//! are summed per bucket: power and energy add across machines, environment
//! is averaged.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::types::{Granularity, TimeRange};

// ============================================================================
// Row Shapes
// ============================================================================

/// One bucket of the energy aggregate (summed over the machine set).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnergyBucket {
    pub bucket: DateTime<Utc>,
    pub avg_power_kw: Option<f64>,
    pub min_power_kw: Option<f64>,
    pub max_power_kw: Option<f64>,
    pub total_energy_kwh: Option<f64>,
    pub avg_load_factor: Option<f64>,
    pub sample_count: i64,
}

/// One bucket of the production aggregate.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProductionBucket {
    pub bucket: DateTime<Utc>,
    pub total_count: Option<f64>,
    pub good_count: Option<f64>,
    pub defective_count: Option<f64>,
    pub avg_throughput: Option<f64>,
}

/// One bucket of the environmental aggregate.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnvironmentalBucket {
    pub bucket: DateTime<Utc>,
    pub avg_outdoor_temp_c: Option<f64>,
    pub avg_indoor_temp_c: Option<f64>,
    pub avg_machine_temp_c: Option<f64>,
    pub avg_humidity_percent: Option<f64>,
    pub avg_pressure_bar: Option<f64>,
}

/// The joined per-bucket row the feature aggregator consumes.
///
/// Every physical feature the candidate sets can reference appears here as
/// a nullable column; the aggregator measures coverage and drops what is
/// too sparse for the machine type at hand.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeatureRow {
    pub bucket: DateTime<Utc>,
    pub total_energy_kwh: Option<f64>,
    pub avg_power_kw: Option<f64>,
    pub avg_load_factor: Option<f64>,
    pub total_production_count: Option<f64>,
    pub avg_throughput: Option<f64>,
    pub avg_outdoor_temp_c: Option<f64>,
    pub avg_machine_temp_c: Option<f64>,
    pub avg_pressure_bar: Option<f64>,
    pub avg_humidity_percent: Option<f64>,
    /// Dominant reported machine status in the bucket (maintenance/fault
    /// gating); NULL means no status signal, treated as running.
    pub machine_status: Option<String>,
}

/// Most recent raw energy reading of a machine.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize, utoipa::ToSchema)]
pub struct LatestReading {
    pub time: DateTime<Utc>,
    pub machine_id: String,
    pub energy_type: Option<String>,
    pub power_kw: Option<f64>,
    pub energy_kwh: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power_factor: Option<f64>,
    pub frequency: Option<f64>,
}

// ============================================================================
// Series Reads
// ============================================================================

/// Bucket count the energy aggregate would yield for this scope and window.
///
/// Cheap probe used by the granularity-selection walk before fetching rows.
pub async fn energy_bucket_count(
    pool: &PgPool,
    machine_ids: &[String],
    energy_type: &str,
    range: &TimeRange,
    granularity: Granularity,
) -> sqlx::Result<i64> {
    let sql = format!(
        "SELECT COUNT(DISTINCT bucket) FROM energy_readings{} \
         WHERE machine_id = ANY($1) AND energy_type = $2 AND bucket >= $3 AND bucket < $4",
        granularity.table_suffix()
    );
    sqlx::query_scalar(&sql)
        .bind(machine_ids)
        .bind(energy_type)
        .bind(range.start)
        .bind(range.end)
        .fetch_one(pool)
        .await
}

/// Energy series for a machine set, ascending buckets.
pub async fn energy_series(
    pool: &PgPool,
    machine_ids: &[String],
    energy_type: &str,
    range: &TimeRange,
    granularity: Granularity,
) -> sqlx::Result<Vec<EnergyBucket>> {
    let sql = format!(
        "SELECT bucket, \
                SUM(avg_power_kw) AS avg_power_kw, \
                SUM(min_power_kw) AS min_power_kw, \
                SUM(max_power_kw) AS max_power_kw, \
                SUM(total_energy_kwh) AS total_energy_kwh, \
                AVG(load_factor) AS avg_load_factor, \
                SUM(sample_count)::BIGINT AS sample_count \
         FROM energy_readings{} \
         WHERE machine_id = ANY($1) AND energy_type = $2 AND bucket >= $3 AND bucket < $4 \
         GROUP BY bucket ORDER BY bucket",
        granularity.table_suffix()
    );
    sqlx::query_as(&sql)
        .bind(machine_ids)
        .bind(energy_type)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(pool)
        .await
}

/// Production series for a machine set, ascending buckets.
pub async fn production_series(
    pool: &PgPool,
    machine_ids: &[String],
    range: &TimeRange,
    granularity: Granularity,
) -> sqlx::Result<Vec<ProductionBucket>> {
    let sql = format!(
        "SELECT bucket, \
                SUM(total_count) AS total_count, \
                SUM(good_count) AS good_count, \
                SUM(defective_count) AS defective_count, \
                AVG(avg_throughput) AS avg_throughput \
         FROM production_data{} \
         WHERE machine_id = ANY($1) AND bucket >= $2 AND bucket < $3 \
         GROUP BY bucket ORDER BY bucket",
        granularity.table_suffix()
    );
    sqlx::query_as(&sql)
        .bind(machine_ids)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(pool)
        .await
}

/// Environmental series for a machine set, ascending buckets.
pub async fn environmental_series(
    pool: &PgPool,
    machine_ids: &[String],
    range: &TimeRange,
    granularity: Granularity,
) -> sqlx::Result<Vec<EnvironmentalBucket>> {
    let sql = format!(
        "SELECT bucket, \
                AVG(avg_outdoor_temp_c) AS avg_outdoor_temp_c, \
                AVG(avg_indoor_temp_c) AS avg_indoor_temp_c, \
                AVG(avg_machine_temp_c) AS avg_machine_temp_c, \
                AVG(avg_humidity_percent) AS avg_humidity_percent, \
                AVG(avg_pressure_bar) AS avg_pressure_bar \
         FROM environmental_data{} \
         WHERE machine_id = ANY($1) AND bucket >= $2 AND bucket < $3 \
         GROUP BY bucket ORDER BY bucket",
        granularity.table_suffix()
    );
    sqlx::query_as(&sql)
        .bind(machine_ids)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(pool)
        .await
}

/// One query joining the three aggregates by bucket for the feature table.
///
/// Energy is the driving side: buckets with no energy reading are of no use
/// to training or detection, so production/environment join onto it.
pub async fn feature_rows(
    pool: &PgPool,
    machine_ids: &[String],
    energy_type: &str,
    range: &TimeRange,
    granularity: Granularity,
) -> sqlx::Result<Vec<FeatureRow>> {
    let suffix = granularity.table_suffix();
    let sql = format!(
        "WITH energy AS ( \
            SELECT bucket, \
                   SUM(total_energy_kwh) AS total_energy_kwh, \
                   SUM(avg_power_kw) AS avg_power_kw, \
                   AVG(load_factor) AS avg_load_factor \
            FROM energy_readings{suffix} \
            WHERE machine_id = ANY($1) AND energy_type = $2 AND bucket >= $3 AND bucket < $4 \
            GROUP BY bucket \
        ), production AS ( \
            SELECT bucket, \
                   SUM(total_count) AS total_production_count, \
                   AVG(avg_throughput) AS avg_throughput \
            FROM production_data{suffix} \
            WHERE machine_id = ANY($1) AND bucket >= $3 AND bucket < $4 \
            GROUP BY bucket \
        ), environment AS ( \
            SELECT bucket, \
                   AVG(avg_outdoor_temp_c) AS avg_outdoor_temp_c, \
                   AVG(avg_machine_temp_c) AS avg_machine_temp_c, \
                   AVG(avg_pressure_bar) AS avg_pressure_bar, \
                   AVG(avg_humidity_percent) AS avg_humidity_percent, \
                   MODE() WITHIN GROUP (ORDER BY machine_status) AS machine_status \
            FROM environmental_data{suffix} \
            WHERE machine_id = ANY($1) AND bucket >= $3 AND bucket < $4 \
            GROUP BY bucket \
        ) \
        SELECT e.bucket, e.total_energy_kwh, e.avg_power_kw, e.avg_load_factor, \
               p.total_production_count, p.avg_throughput, \
               v.avg_outdoor_temp_c, v.avg_machine_temp_c, v.avg_pressure_bar, \
               v.avg_humidity_percent, v.machine_status \
        FROM energy e \
        LEFT JOIN production p USING (bucket) \
        LEFT JOIN environment v USING (bucket) \
        ORDER BY e.bucket"
    );
    sqlx::query_as(&sql)
        .bind(machine_ids)
        .bind(energy_type)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(pool)
        .await
}

/// Most recent raw reading for one machine, any energy type.
pub async fn latest_reading(
    pool: &PgPool,
    machine_id: &str,
) -> sqlx::Result<Option<LatestReading>> {
    sqlx::query_as(
        "SELECT time, machine_id, metadata->>'energy_type' AS energy_type, power_kw, \
                energy_kwh, voltage, current, power_factor, frequency \
         FROM energy_readings WHERE machine_id = $1 ORDER BY time DESC LIMIT 1",
    )
    .bind(machine_id)
    .fetch_optional(pool)
    .await
}
