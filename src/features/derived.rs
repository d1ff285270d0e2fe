//! Derived features computed in a post-pass over the joined rows
//!
//! These never come from a table column: they are functions of the bucket
//! timestamp or of another column. All bucketing is UTC.

use chrono::{DateTime, Datelike, Utc, Weekday};

/// Base temperature for degree-day features (°C).
pub const DEGREE_DAY_BASE_C: f64 = 18.0;

/// 1.0 on Saturday/Sunday (UTC), else 0.0.
pub fn is_weekend(bucket: DateTime<Utc>) -> f64 {
    match bucket.weekday() {
        Weekday::Sat | Weekday::Sun => 1.0,
        _ => 0.0,
    }
}

/// Heating demand proxy: degrees below the base temperature.
pub fn heating_degree(outdoor_temp_c: f64) -> f64 {
    (DEGREE_DAY_BASE_C - outdoor_temp_c).max(0.0)
}

/// Cooling demand proxy: degrees above the base temperature.
pub fn cooling_degree(outdoor_temp_c: f64) -> f64 {
    (outdoor_temp_c - DEGREE_DAY_BASE_C).max(0.0)
}
