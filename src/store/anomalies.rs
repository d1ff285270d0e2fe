//! Anomaly rows: idempotent insertion, listing, resolution

use sqlx::PgPool;
use uuid::Uuid;

use chrono::{DateTime, Utc};

use crate::types::{Anomaly, AnomalySeverity, AnomalyType};

const ANOMALY_COLUMNS: &str = "id, machine_id, detected_at, anomaly_type, severity, metric, \
     actual, expected, deviation, deviation_percent, confidence, status, resolution_note, \
     resolved_at, created_at";

/// A detection result (or manual submission) before persistence.
#[derive(Debug, Clone)]
pub struct NewAnomaly {
    pub machine_id: String,
    pub detected_at: DateTime<Utc>,
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    pub metric: String,
    pub actual: f64,
    pub expected: f64,
    pub confidence: f64,
}

impl NewAnomaly {
    pub fn deviation(&self) -> f64 {
        self.actual - self.expected
    }

    pub fn deviation_percent(&self) -> f64 {
        if self.expected.abs() < f64::EPSILON {
            0.0
        } else {
            (self.actual - self.expected) / self.expected.abs() * 100.0
        }
    }
}

/// Insert an anomaly; a duplicate (machine, detected_at, type) is a no-op
/// and returns `None`, so callers only publish events for genuinely new rows.
pub async fn insert_anomaly(pool: &PgPool, anomaly: &NewAnomaly) -> sqlx::Result<Option<Anomaly>> {
    sqlx::query_as(&format!(
        "INSERT INTO anomalies \
             (id, machine_id, detected_at, anomaly_type, severity, metric, actual, expected, \
              deviation, deviation_percent, confidence, status, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'open', NOW()) \
         ON CONFLICT (machine_id, detected_at, anomaly_type) DO NOTHING \
         RETURNING {ANOMALY_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(&anomaly.machine_id)
    .bind(anomaly.detected_at)
    .bind(anomaly.anomaly_type)
    .bind(anomaly.severity)
    .bind(&anomaly.metric)
    .bind(anomaly.actual)
    .bind(anomaly.expected)
    .bind(anomaly.deviation())
    .bind(anomaly.deviation_percent())
    .bind(anomaly.confidence.clamp(0.0, 1.0))
    .fetch_optional(pool)
    .await
}

/// Filters for the recent-anomaly listing.
#[derive(Debug, Clone, Default)]
pub struct RecentFilter {
    pub limit: i64,
    pub severity: Option<AnomalySeverity>,
    pub hours: Option<i64>,
    pub machine_id: Option<String>,
}

/// Recent anomalies newest-first with optional severity/window/machine filters.
pub async fn recent_anomalies(pool: &PgPool, filter: &RecentFilter) -> sqlx::Result<Vec<Anomaly>> {
    let limit = if filter.limit <= 0 { 50 } else { filter.limit.min(500) };
    sqlx::query_as(&format!(
        "SELECT {ANOMALY_COLUMNS} FROM anomalies \
         WHERE ($1::TEXT IS NULL OR severity = $1) \
           AND ($2::BIGINT IS NULL OR detected_at >= NOW() - make_interval(hours => $2::INT)) \
           AND ($3::TEXT IS NULL OR machine_id = $3) \
         ORDER BY detected_at DESC LIMIT $4"
    ))
    .bind(filter.severity.map(|s| s.to_string()))
    .bind(filter.hours)
    .bind(&filter.machine_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// All unresolved anomalies, newest-first.
pub async fn active_anomalies(pool: &PgPool) -> sqlx::Result<Vec<Anomaly>> {
    sqlx::query_as(&format!(
        "SELECT {ANOMALY_COLUMNS} FROM anomalies WHERE status = 'open' ORDER BY detected_at DESC"
    ))
    .fetch_all(pool)
    .await
}

pub async fn anomaly_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<Anomaly>> {
    sqlx::query_as(&format!(
        "SELECT {ANOMALY_COLUMNS} FROM anomalies WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Resolve an anomaly. Resolving an already-resolved row keeps its original
/// `resolved_at` and note, making the operation idempotent.
pub async fn resolve_anomaly(
    pool: &PgPool,
    id: Uuid,
    note: Option<&str>,
) -> sqlx::Result<Option<Anomaly>> {
    sqlx::query_as(&format!(
        "UPDATE anomalies SET \
             status = 'resolved', \
             resolved_at = COALESCE(resolved_at, NOW()), \
             resolution_note = COALESCE(resolution_note, $2) \
         WHERE id = $1 \
         RETURNING {ANOMALY_COLUMNS}"
    ))
    .bind(id)
    .bind(note)
    .fetch_optional(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NewAnomaly {
        NewAnomaly {
            machine_id: "M-1".into(),
            detected_at: Utc::now(),
            anomaly_type: AnomalyType::Spike,
            severity: AnomalySeverity::Warning,
            metric: "power_kw".into(),
            actual: 120.0,
            expected: 100.0,
            confidence: 0.8,
        }
    }

    #[test]
    fn deviation_fields_derive_from_actual_and_expected() {
        let a = sample();
        assert!((a.deviation() - 20.0).abs() < 1e-12);
        assert!((a.deviation_percent() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn deviation_percent_guards_zero_expected() {
        let mut a = sample();
        a.expected = 0.0;
        assert_eq!(a.deviation_percent(), 0.0);
    }
}
