//! Endpoint handlers, grouped by resource
//!
//! Shared request-parsing helpers live here; each resource module owns its
//! DTOs and utoipa annotations.

pub mod anomaly;
pub mod baseline;
pub mod health;
pub mod kpi;
pub mod machines;
pub mod ovos;
pub mod scheduler;
pub mod stats;
pub mod timeseries;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;

use crate::error::CoreError;
use crate::store::catalog;
use crate::types::{Machine, TimeRange};

/// Parse an ISO-8601 timestamp query/body field.
pub(crate) fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::BadRequest(format!("invalid {field} '{value}': {e}")))
}

/// Build a window from optional query strings.
///
/// Defaults: `end` = now, `start` = end − `default_hours`.
pub(crate) fn range_from_query(
    start: Option<&str>,
    end: Option<&str>,
    default_hours: i64,
) -> Result<TimeRange, CoreError> {
    let end = match end {
        Some(raw) => parse_timestamp(raw, "end_time")?,
        None => Utc::now(),
    };
    let start = match start {
        Some(raw) => parse_timestamp(raw, "start_time")?,
        None => end - ChronoDuration::hours(default_hours),
    };
    TimeRange::new(start, end)
}

/// Resolve a machine reference by id, falling back to its unique name.
/// The voice surface and the training API both address machines by name.
pub(crate) async fn resolve_machine(pool: &PgPool, ident: &str) -> Result<Machine, CoreError> {
    if let Some(machine) = catalog::machine_by_id(pool, ident).await? {
        return Ok(machine);
    }
    catalog::machine_by_name(pool, ident)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("machine '{ident}' not found")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timestamp_accepts_rfc3339() {
        let ts = parse_timestamp("2025-01-01T00:00:00Z", "start_time").unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-01-01T00:00:00+00:00");
        // offset forms normalize to UTC
        let ts = parse_timestamp("2025-01-01T02:00:00+02:00", "start_time").unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn parse_timestamp_rejects_garbage() {
        let err = parse_timestamp("yesterday", "start_time").unwrap_err();
        assert!(err.to_string().contains("start_time"));
    }

    #[test]
    fn range_defaults_to_trailing_window() {
        let range = range_from_query(None, None, 24).unwrap();
        assert_eq!((range.end - range.start).num_hours(), 24);
    }

    #[test]
    fn explicit_inverted_range_is_rejected() {
        let result = range_from_query(
            Some("2025-01-02T00:00:00Z"),
            Some("2025-01-01T00:00:00Z"),
            24,
        );
        assert!(result.is_err());
    }
}
