//! Shared data structures for the EnMS analytics core
//!
//! This module defines the typed vocabulary used across the engines:
//! - Catalog entities read from the store (Machine, EnergySource, SEU)
//! - Aggregate granularities and time ranges
//! - Baseline models and training jobs (owned by the core)
//! - Anomalies with type/severity/status vocabularies
//! - KPI result shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::CoreError;

// ============================================================================
// Aggregate Granularity
// ============================================================================

/// Continuous-aggregate resolutions available in the store.
///
/// Each aggregate is materialized directly from its raw hypertable; this is
/// a closed enum so no caller can request a stacked or ad-hoc resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[serde(rename = "1min")]
    OneMin,
    #[serde(rename = "15min")]
    FifteenMin,
    #[serde(rename = "1hour")]
    OneHour,
    #[serde(rename = "1day")]
    OneDay,
}

impl Granularity {
    /// Table suffix of the continuous aggregate (`energy_readings_1hour`, ...).
    pub fn table_suffix(self) -> &'static str {
        match self {
            Self::OneMin => "_1min",
            Self::FifteenMin => "_15min",
            Self::OneHour => "_1hour",
            Self::OneDay => "_1day",
        }
    }

    /// Bucket width in seconds.
    pub fn bucket_seconds(self) -> i64 {
        match self {
            Self::OneMin => 60,
            Self::FifteenMin => 900,
            Self::OneHour => 3_600,
            Self::OneDay => 86_400,
        }
    }

    /// All granularities from coarsest to finest, starting at `coarsest`.
    ///
    /// The feature aggregator walks this list and stops at the first
    /// resolution that satisfies its sample floor.
    pub fn descending_from(coarsest: Self) -> &'static [Self] {
        const ALL: [Granularity; 4] = [
            Granularity::OneDay,
            Granularity::OneHour,
            Granularity::FifteenMin,
            Granularity::OneMin,
        ];
        match coarsest {
            Self::OneDay => &ALL,
            Self::OneHour => &ALL[1..],
            Self::FifteenMin => &ALL[2..],
            Self::OneMin => &ALL[3..],
        }
    }

    /// Parse the public interval spelling ("1min", "15min", "1hour", "1day").
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "1min" => Ok(Self::OneMin),
            "15min" => Ok(Self::FifteenMin),
            "1hour" => Ok(Self::OneHour),
            "1day" => Ok(Self::OneDay),
            other => Err(CoreError::BadRequest(format!(
                "unknown interval '{other}' (expected 1min, 15min, 1hour or 1day)"
            ))),
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneMin => write!(f, "1min"),
            Self::FifteenMin => write!(f, "15min"),
            Self::OneHour => write!(f, "1hour"),
            Self::OneDay => write!(f, "1day"),
        }
    }
}

// ============================================================================
// Time Range
// ============================================================================

/// A half-open UTC window `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Build a validated range; `start` must precede `end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, CoreError> {
        if start >= end {
            return Err(CoreError::BadRequest(format!(
                "start_time {start} must be before end_time {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn duration_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }

    /// Number of whole buckets of `granularity` covered by the window.
    pub fn bucket_capacity(&self, granularity: Granularity) -> i64 {
        self.duration_seconds() / granularity.bucket_seconds()
    }
}

// ============================================================================
// Catalog Entities (read-only to the core)
// ============================================================================

/// A monitored machine. Mutated externally; the core only reads.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct Machine {
    pub id: String,
    pub factory_id: String,
    pub name: String,
    pub machine_type: String,
    pub rated_power_kw: f64,
    pub data_interval_seconds: i32,
    pub mqtt_topic: String,
    pub active: bool,
}

/// An energy source (electricity, natural gas, steam, compressed air, ...).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct EnergySource {
    pub id: String,
    pub key: String,
    pub unit: String,
    pub cost_per_unit: Option<f64>,
    pub carbon_factor_per_unit: Option<f64>,
    pub active: bool,
}

/// How a feature is aggregated from its base table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum FeatureAggregation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Derived,
}

/// Declares an admissible feature for an energy source and where it comes from.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct EnergySourceFeature {
    pub energy_source: String,
    pub feature_key: String,
    pub source_table: String,
    pub source_column: String,
    pub aggregation: FeatureAggregation,
    pub data_type: String,
    pub description: Option<String>,
}

/// A Significant Energy Use: one energy source across one or more machines.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct Seu {
    pub id: String,
    pub name: String,
    pub energy_source: String,
    pub machine_ids: Vec<String>,
}

/// Subject of a baseline/anomaly/KPI computation: a machine or a SEU,
/// always paired with an energy source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Machine { machine_id: String },
    Seu { seu_id: String },
}

impl Scope {
    /// Stable identifier used for model rows and event payloads.
    pub fn key(&self) -> &str {
        match self {
            Self::Machine { machine_id } => machine_id,
            Self::Seu { seu_id } => seu_id,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Machine { machine_id } => write!(f, "machine:{machine_id}"),
            Self::Seu { seu_id } => write!(f, "seu:{seu_id}"),
        }
    }
}

// ============================================================================
// Baseline Models
// ============================================================================

/// R² floor a model must reach before the scheduler auto-activates it.
pub const QUALITY_R_SQUARED_THRESHOLD: f64 = 0.80;

/// A persisted regression baseline. At most one row per
/// (machine, energy source) has `is_active = true`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct BaselineModel {
    pub id: Uuid,
    pub machine_id: String,
    pub energy_source: String,
    pub model_version: i32,
    /// Ordered feature keys; `coefficients[i]` belongs to `features[i]`.
    #[schema(value_type = Vec<String>)]
    pub features: sqlx::types::Json<Vec<String>>,
    pub intercept: f64,
    #[schema(value_type = Vec<f64>)]
    pub coefficients: sqlx::types::Json<Vec<f64>>,
    pub r_squared: f64,
    pub rmse: f64,
    pub mae: f64,
    /// Standard deviation of training residuals; drives 2σ/3σ severity.
    pub residual_std: f64,
    pub training_samples: i32,
    pub training_start: DateTime<Utc>,
    pub training_end: DateTime<Utc>,
    pub blob_path: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl BaselineModel {
    pub fn meets_quality_threshold(&self) -> bool {
        self.r_squared >= QUALITY_R_SQUARED_THRESHOLD
    }

    /// Evaluate the model against an ordered feature vector.
    pub fn predict(&self, x: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(x.iter())
                .map(|(c, v)| c * v)
                .sum::<f64>()
    }
}

// ============================================================================
// Training Jobs
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Baseline,
    Anomaly,
    Forecast,
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Anomaly => write!(f, "anomaly"),
            Self::Forecast => write!(f, "forecast"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One training attempt. At most one `running` row per (machine, model_type).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct TrainingJob {
    pub id: Uuid,
    pub machine_id: String,
    pub model_type: ModelType,
    pub status: JobStatus,
    pub progress_pct: f64,
    pub error: Option<String>,
    pub model_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Anomalies
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Spike,
    Drop,
    Drift,
    BaselineDeviation,
    Power,
    Temperature,
    Pressure,
    Production,
    Unknown,
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Spike => "spike",
            Self::Drop => "drop",
            Self::Drift => "drift",
            Self::BaselineDeviation => "baseline_deviation",
            Self::Power => "power",
            Self::Temperature => "temperature",
            Self::Pressure => "pressure",
            Self::Production => "production",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Severity ladder: info below 2σ, warning at ≥ 2σ, critical at ≥ 3σ.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, sqlx::Type, ToSchema,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Info,
    Warning,
    Critical,
}

impl AnomalySeverity {
    /// Classify an absolute deviation against a residual σ.
    ///
    /// A non-positive σ (degenerate residuals) classifies everything as info.
    pub fn from_deviation(abs_deviation: f64, sigma: f64) -> Self {
        if sigma <= 0.0 {
            return Self::Info;
        }
        let z = abs_deviation / sigma;
        if z >= 3.0 {
            Self::Critical
        } else if z >= 2.0 {
            Self::Warning
        } else {
            Self::Info
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(CoreError::BadRequest(format!(
                "unknown severity '{other}' (expected info, warning or critical)"
            ))),
        }
    }
}

impl std::fmt::Display for AnomalySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    Open,
    Resolved,
}

/// A detected (or manually created) anomaly.
///
/// Invariant: `status = resolved ⇔ resolved_at is set`.
/// Deduplicated on (machine_id, detected_at, anomaly_type).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct Anomaly {
    pub id: Uuid,
    pub machine_id: String,
    pub detected_at: DateTime<Utc>,
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    pub metric: String,
    pub actual: f64,
    pub expected: f64,
    pub deviation: f64,
    pub deviation_percent: f64,
    pub confidence: f64,
    pub status: AnomalyStatus,
    pub resolution_note: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// KPI Results
// ============================================================================

/// A single KPI value; `value` is null when the KPI is undefined over the
/// window (e.g. zero production for SEC), with `reason` explaining why.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct KpiValue {
    pub value: Option<f64>,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl KpiValue {
    pub fn new(value: f64, unit: &str) -> Self {
        Self {
            value: Some(value),
            unit: unit.to_string(),
            reason: None,
        }
    }

    pub fn undefined(unit: &str, reason: &str) -> Self {
        Self {
            value: None,
            unit: unit.to_string(),
            reason: Some(reason.to_string()),
        }
    }
}

/// The fixed KPI suite computed over one window.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct KpiSet {
    pub machine_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Specific Energy Consumption (kWh per produced unit).
    pub sec: KpiValue,
    /// Maximum bucket-average power (kW).
    pub peak_demand: KpiValue,
    /// Average power over peak power (dimensionless, 0..1).
    pub load_factor: KpiValue,
    /// TOU-priced energy cost.
    pub energy_cost: KpiValue,
    /// kg CO₂ emitted.
    pub carbon: KpiValue,
    pub computed_at: DateTime<Utc>,
}

/// Cached KPI row written by the nightly pre-compute job. Advisory only;
/// a cache miss recomputes from the aggregates.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct KpiCacheRow {
    pub machine_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub kpi_name: String,
    pub value: Option<f64>,
    pub unit: String,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn granularity_descending_from_hour_skips_day() {
        let order = Granularity::descending_from(Granularity::OneHour);
        assert_eq!(
            order,
            &[
                Granularity::OneHour,
                Granularity::FifteenMin,
                Granularity::OneMin
            ]
        );
    }

    #[test]
    fn granularity_parse_round_trips_display() {
        for g in [
            Granularity::OneMin,
            Granularity::FifteenMin,
            Granularity::OneHour,
            Granularity::OneDay,
        ] {
            assert_eq!(Granularity::parse(&g.to_string()).ok(), Some(g));
        }
        assert!(Granularity::parse("5min").is_err());
    }

    #[test]
    fn time_range_rejects_inverted_window() {
        let start = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).single().unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap();
        assert!(TimeRange::new(start, end).is_err());
        assert!(TimeRange::new(start, start).is_err());
    }

    #[test]
    fn bucket_capacity_counts_whole_buckets() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).single().unwrap();
        let range = TimeRange::new(start, end).unwrap();
        assert_eq!(range.bucket_capacity(Granularity::OneHour), 24);
        assert_eq!(range.bucket_capacity(Granularity::OneDay), 1);
        assert_eq!(range.bucket_capacity(Granularity::FifteenMin), 96);
    }

    #[test]
    fn severity_thresholds() {
        // 2σ boundary
        assert_eq!(
            AnomalySeverity::from_deviation(19.9, 10.0),
            AnomalySeverity::Info
        );
        assert_eq!(
            AnomalySeverity::from_deviation(20.0, 10.0),
            AnomalySeverity::Warning
        );
        // 3σ boundary
        assert_eq!(
            AnomalySeverity::from_deviation(30.0, 10.0),
            AnomalySeverity::Critical
        );
        // degenerate σ
        assert_eq!(
            AnomalySeverity::from_deviation(100.0, 0.0),
            AnomalySeverity::Info
        );
    }

    #[test]
    fn severity_ordering_for_filters() {
        assert!(AnomalySeverity::Critical > AnomalySeverity::Warning);
        assert!(AnomalySeverity::Warning > AnomalySeverity::Info);
    }

    #[test]
    fn model_predict_is_affine() {
        let model = BaselineModel {
            id: Uuid::nil(),
            machine_id: "m1".into(),
            energy_source: "electricity".into(),
            model_version: 1,
            features: sqlx::types::Json(vec!["a".into(), "b".into()]),
            intercept: 10.0,
            coefficients: sqlx::types::Json(vec![2.0, -1.0]),
            r_squared: 0.9,
            rmse: 1.0,
            mae: 0.8,
            residual_std: 1.0,
            training_samples: 100,
            training_start: Utc::now(),
            training_end: Utc::now(),
            blob_path: None,
            is_active: true,
            created_at: Utc::now(),
        };
        assert!((model.predict(&[3.0, 4.0]) - 12.0).abs() < 1e-12);
        assert!(model.meets_quality_threshold());
    }

    #[test]
    fn kpi_value_undefined_carries_reason() {
        let v = KpiValue::undefined("kWh/unit", "no production in window");
        assert!(v.value.is_none());
        assert_eq!(v.reason.as_deref(), Some("no production in window"));
    }
}
