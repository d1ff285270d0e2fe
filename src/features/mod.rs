//! Feature Aggregator — dense, time-ordered feature tables
//!
//! Given a scope (machine or SEU), a window and a feature key set, produces
//! per-bucket rows joining energy (the target), production, environmental
//! and derived signals:
//!
//! 1. Requested keys are validated against the source's declared feature set.
//! 2. The coarsest granularity whose bucket count meets the caller's sample
//!    floor is selected (training callers start the walk at 1hour).
//! 3. One joined query per selected granularity fetches all columns.
//! 4. Features with non-null coverage ≤ 10 % are dropped and recorded; this
//!    is what lets sensorless machine types train successfully.

pub mod derived;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use crate::error::CoreError;
use crate::store::timeseries::{self, FeatureRow};
use crate::store::catalog;
use crate::types::{Granularity, Scope, TimeRange};

// ============================================================================
// Sample Floors
// ============================================================================

/// Minimum clean samples for baseline training.
pub const TRAINING_SAMPLE_FLOOR: usize = 50;

/// Minimum samples for an anomaly sweep.
pub const DETECTION_SAMPLE_FLOOR: usize = 20;

/// Minimum samples for ad-hoc reads.
pub const ADHOC_SAMPLE_FLOOR: usize = 1;

/// Features at or below this non-null coverage are dropped.
pub const MIN_COVERAGE: f64 = 0.10;

/// Derived feature keys computed in the post-pass (not table columns).
pub const DERIVED_KEYS: [&str; 3] = ["is_weekend", "heating_degree_days", "cooling_degree_days"];

/// Machine statuses excluded from anomaly consideration.
pub const GATED_STATUSES: [&str; 2] = ["maintenance", "fault"];

// ============================================================================
// Scope Resolution
// ============================================================================

/// A scope reduced to its machine set and energy source.
#[derive(Debug, Clone)]
pub struct ResolvedScope {
    /// Stable key used on model rows and events (machine id or SEU id).
    pub key: String,
    pub machine_ids: Vec<String>,
    pub energy_source: String,
}

/// Resolve a machine or SEU reference. Machines need an explicit energy
/// source; SEUs carry their own.
pub async fn resolve_scope(
    pool: &PgPool,
    scope: &Scope,
    energy_source: Option<&str>,
) -> Result<ResolvedScope, CoreError> {
    match scope {
        Scope::Machine { machine_id } => {
            let machine = catalog::machine_by_id(pool, machine_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("machine '{machine_id}' not found")))?;
            let source = energy_source.ok_or_else(|| {
                CoreError::BadRequest("energy_source is required for a machine scope".to_string())
            })?;
            Ok(ResolvedScope {
                key: machine.id,
                machine_ids: vec![machine_id.clone()],
                energy_source: source.to_string(),
            })
        }
        Scope::Seu { seu_id } => {
            let seu = catalog::seu_by_id(pool, seu_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("SEU '{seu_id}' not found")))?;
            if seu.machine_ids.is_empty() {
                return Err(CoreError::BadRequest(format!(
                    "SEU '{seu_id}' has no member machines"
                )));
            }
            Ok(ResolvedScope {
                key: seu.id,
                machine_ids: seu.machine_ids,
                energy_source: seu.energy_source,
            })
        }
    }
}

// ============================================================================
// Feature Table
// ============================================================================

/// One named feature column aligned to the table's buckets.
#[derive(Debug, Clone)]
pub struct FeatureColumn {
    pub key: String,
    pub values: Vec<Option<f64>>,
}

/// A feature removed before modelling, and why.
#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct DroppedFeature {
    pub key: String,
    /// Non-null fraction observed across the window.
    pub coverage: f64,
    pub reason: String,
}

/// Dense per-bucket result of the aggregation, ascending buckets.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    pub granularity: Granularity,
    pub buckets: Vec<DateTime<Utc>>,
    /// Target signal: total energy per bucket (kWh).
    pub target: Vec<Option<f64>>,
    pub columns: Vec<FeatureColumn>,
    pub dropped: Vec<DroppedFeature>,
    /// Reported machine status per bucket; `None` means running.
    pub statuses: Vec<Option<String>>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn column(&self, key: &str) -> Option<&FeatureColumn> {
        self.columns.iter().find(|c| c.key == key)
    }

    pub fn feature_keys(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.key.clone()).collect()
    }

    /// True when the bucket's reported status gates it out of detection.
    pub fn is_gated(&self, index: usize) -> bool {
        self.statuses
            .get(index)
            .and_then(|s| s.as_deref())
            .is_some_and(|s| GATED_STATUSES.contains(&s))
    }

    /// Rows with a value in every listed column and the target.
    ///
    /// Returns (buckets, X matrix row-major, y) — the cleaned input for
    /// regression and detection.
    pub fn complete_rows(&self, keys: &[String]) -> (Vec<DateTime<Utc>>, Vec<Vec<f64>>, Vec<f64>) {
        let cols: Vec<&FeatureColumn> = keys
            .iter()
            .filter_map(|k| self.column(k))
            .collect();

        let mut buckets = Vec::new();
        let mut matrix = Vec::new();
        let mut target = Vec::new();

        'rows: for i in 0..self.len() {
            let Some(y) = self.target[i] else {
                continue;
            };
            if !y.is_finite() {
                continue;
            }
            let mut row = Vec::with_capacity(cols.len());
            for col in &cols {
                match col.values[i] {
                    Some(v) if v.is_finite() => row.push(v),
                    _ => continue 'rows,
                }
            }
            buckets.push(self.buckets[i]);
            matrix.push(row);
            target.push(y);
        }

        (buckets, matrix, target)
    }
}

/// Non-null fraction of a column.
fn coverage(values: &[Option<f64>]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().filter(|v| v.is_some()).count() as f64 / values.len() as f64
}

/// Value of a physical feature key on one joined row.
fn physical_value(row: &FeatureRow, key: &str) -> Option<f64> {
    match key {
        "total_production_count" => row.total_production_count,
        "avg_throughput" => row.avg_throughput,
        "avg_outdoor_temp_c" => row.avg_outdoor_temp_c,
        "avg_machine_temp_c" => row.avg_machine_temp_c,
        "avg_pressure_bar" => row.avg_pressure_bar,
        "avg_humidity_percent" => row.avg_humidity_percent,
        "avg_load_factor" => row.avg_load_factor,
        "avg_power_kw" => row.avg_power_kw,
        _ => None,
    }
}

/// Value of a derived feature key on one joined row.
fn derived_value(row: &FeatureRow, key: &str) -> Option<f64> {
    match key {
        "is_weekend" => Some(derived::is_weekend(row.bucket)),
        "heating_degree_days" => row.avg_outdoor_temp_c.map(derived::heating_degree),
        "cooling_degree_days" => row.avg_outdoor_temp_c.map(derived::cooling_degree),
        _ => None,
    }
}

/// Assemble a table from fetched rows. Pure; the async entry point wraps it.
pub fn assemble(
    rows: &[FeatureRow],
    requested: &[String],
    granularity: Granularity,
) -> FeatureTable {
    let buckets: Vec<DateTime<Utc>> = rows.iter().map(|r| r.bucket).collect();
    let target: Vec<Option<f64>> = rows.iter().map(|r| r.total_energy_kwh).collect();
    let statuses: Vec<Option<String>> = rows.iter().map(|r| r.machine_status.clone()).collect();

    let mut columns = Vec::new();
    let mut dropped = Vec::new();

    for key in requested {
        let values: Vec<Option<f64>> = if DERIVED_KEYS.contains(&key.as_str()) {
            rows.iter().map(|r| derived_value(r, key)).collect()
        } else {
            rows.iter().map(|r| physical_value(r, key)).collect()
        };

        let cov = coverage(&values);
        if cov <= MIN_COVERAGE {
            dropped.push(DroppedFeature {
                key: key.clone(),
                coverage: cov,
                reason: format!(
                    "coverage {:.1}% is at or below the {:.0}% floor",
                    cov * 100.0,
                    MIN_COVERAGE * 100.0
                ),
            });
        } else {
            columns.push(FeatureColumn {
                key: key.clone(),
                values,
            });
        }
    }

    FeatureTable {
        granularity,
        buckets,
        target,
        columns,
        dropped,
        statuses,
    }
}

// ============================================================================
// Entry Point
// ============================================================================

/// Build the feature table for a resolved scope.
///
/// `coarsest` bounds the granularity walk from above: ad-hoc reads may start
/// at 1day, training starts at 1hour (daily buckets train poorly).
pub async fn feature_table(
    pool: &PgPool,
    scope: &ResolvedScope,
    range: &TimeRange,
    requested: &[String],
    floor: usize,
    coarsest: Granularity,
) -> Result<FeatureTable, CoreError> {
    // Validate keys against the declared feature set for this source.
    let declared = catalog::features_for_source(pool, &scope.energy_source).await?;
    let unknown: Vec<&String> = requested
        .iter()
        .filter(|k| {
            !DERIVED_KEYS.contains(&k.as_str())
                && !declared.iter().any(|d| &d.feature_key == *k)
        })
        .collect();
    if !unknown.is_empty() {
        return Err(CoreError::BadRequest(format!(
            "unknown feature keys for energy source '{}': {}",
            scope.energy_source,
            unknown
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    // Coarsest granularity that still clears the sample floor.
    let mut selected = None;
    let mut best_count = 0i64;
    for g in Granularity::descending_from(coarsest) {
        let count = timeseries::energy_bucket_count(
            pool,
            &scope.machine_ids,
            &scope.energy_source,
            range,
            *g,
        )
        .await?;
        best_count = best_count.max(count);
        if count >= floor as i64 {
            selected = Some(*g);
            break;
        }
    }
    let Some(granularity) = selected else {
        return Err(CoreError::InsufficientData(format!(
            "window {} → {} yields at most {} buckets for scope '{}'; {} required",
            range.start, range.end, best_count, scope.key, floor
        )));
    };

    debug!(
        scope = %scope.key,
        granularity = %granularity,
        "feature table granularity selected"
    );

    let rows = timeseries::feature_rows(
        pool,
        &scope.machine_ids,
        &scope.energy_source,
        range,
        granularity,
    )
    .await?;

    Ok(assemble(&rows, requested, granularity))
}

/// Candidate feature keys for auto selection: every declared physical
/// feature plus the derived set.
pub fn auto_candidates(declared: &[crate::types::EnergySourceFeature]) -> Vec<String> {
    let mut keys: Vec<String> = declared.iter().map(|d| d.feature_key.clone()).collect();
    for key in DERIVED_KEYS {
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bucket(i: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, i, 0, 0).single().unwrap()
    }

    fn row(i: u32, energy: Option<f64>, production: Option<f64>, pressure: Option<f64>) -> FeatureRow {
        FeatureRow {
            bucket: bucket(i),
            total_energy_kwh: energy,
            avg_power_kw: energy.map(|e| e * 1.0),
            avg_load_factor: Some(0.7),
            total_production_count: production,
            avg_throughput: production.map(|p| p / 10.0),
            avg_outdoor_temp_c: Some(12.0),
            avg_machine_temp_c: Some(45.0),
            avg_pressure_bar: pressure,
            avg_humidity_percent: None,
            machine_status: None,
        }
    }

    #[test]
    fn sparse_feature_is_dropped_with_coverage_record() {
        // pressure present in 1 of 20 rows (5% ≤ 10% floor)
        let rows: Vec<FeatureRow> = (0..20)
            .map(|i| {
                let pressure = if i == 0 { Some(6.5) } else { None };
                row(i, Some(50.0), Some(100.0), pressure)
            })
            .collect();

        let table = assemble(
            &rows,
            &[
                "total_production_count".to_string(),
                "avg_pressure_bar".to_string(),
            ],
            Granularity::OneHour,
        );

        assert!(table.column("total_production_count").is_some());
        assert!(table.column("avg_pressure_bar").is_none());
        assert_eq!(table.dropped.len(), 1);
        assert_eq!(table.dropped[0].key, "avg_pressure_bar");
        assert!((table.dropped[0].coverage - 0.05).abs() < 1e-9);
    }

    #[test]
    fn feature_above_floor_is_kept() {
        // pressure present in 3 of 20 rows (15% > 10%)
        let rows: Vec<FeatureRow> = (0..20)
            .map(|i| {
                let pressure = if i < 3 { Some(6.5) } else { None };
                row(i, Some(50.0), Some(100.0), pressure)
            })
            .collect();
        let table = assemble(
            &rows,
            &["avg_pressure_bar".to_string()],
            Granularity::OneHour,
        );
        assert!(table.column("avg_pressure_bar").is_some());
        assert!(table.dropped.is_empty());
    }

    #[test]
    fn complete_rows_drop_any_nan_or_null() {
        let rows = vec![
            row(0, Some(50.0), Some(100.0), Some(6.0)),
            row(1, None, Some(100.0), Some(6.0)),      // missing target
            row(2, Some(52.0), None, Some(6.0)),       // missing production
            row(3, Some(54.0), Some(110.0), Some(6.1)),
        ];
        let table = assemble(
            &rows,
            &[
                "total_production_count".to_string(),
                "avg_pressure_bar".to_string(),
            ],
            Granularity::OneHour,
        );
        let (buckets, matrix, target) = table.complete_rows(&table.feature_keys());
        assert_eq!(buckets.len(), 2);
        assert_eq!(matrix.len(), 2);
        assert_eq!(target, vec![50.0, 54.0]);
        assert_eq!(matrix[0], vec![100.0, 6.0]);
    }

    #[test]
    fn derived_columns_come_from_bucket_and_temperature() {
        // 2025-01-04 is a Saturday
        let mut saturday = row(0, Some(10.0), Some(1.0), None);
        saturday.bucket = Utc.with_ymd_and_hms(2025, 1, 4, 9, 0, 0).single().unwrap();
        saturday.avg_outdoor_temp_c = Some(10.0);
        let rows = vec![saturday];

        let table = assemble(
            &rows,
            &[
                "is_weekend".to_string(),
                "heating_degree_days".to_string(),
                "cooling_degree_days".to_string(),
            ],
            Granularity::OneHour,
        );
        assert_eq!(table.column("is_weekend").unwrap().values[0], Some(1.0));
        assert_eq!(
            table.column("heating_degree_days").unwrap().values[0],
            Some(8.0)
        );
        assert_eq!(
            table.column("cooling_degree_days").unwrap().values[0],
            Some(0.0)
        );
    }

    #[test]
    fn status_gating_matches_maintenance_and_fault() {
        let mut r0 = row(0, Some(10.0), None, None);
        r0.machine_status = Some("maintenance".to_string());
        let mut r1 = row(1, Some(10.0), None, None);
        r1.machine_status = Some("fault".to_string());
        let mut r2 = row(2, Some(10.0), None, None);
        r2.machine_status = Some("running".to_string());
        let r3 = row(3, Some(10.0), None, None); // absent status

        let table = assemble(&[r0, r1, r2, r3], &[], Granularity::OneHour);
        assert!(table.is_gated(0));
        assert!(table.is_gated(1));
        assert!(!table.is_gated(2));
        assert!(!table.is_gated(3));
    }

    #[test]
    fn buckets_are_preserved_in_order() {
        let rows: Vec<FeatureRow> = (0..5).map(|i| row(i, Some(1.0), None, None)).collect();
        let table = assemble(&rows, &[], Granularity::OneHour);
        for pair in table.buckets.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
