//! KPI Engine — the fixed five-KPI suite over a time window
//!
//! | KPI | Definition | Unit |
//! |-----|------------|------|
//! | SEC | Σ energy / Σ production | kWh/unit |
//! | Peak Demand | max bucket-average power | kW |
//! | Load Factor | avg power / max power | ratio |
//! | Energy Cost | Σ energy × TOU tariff | currency |
//! | Carbon | Σ energy × emission factor | kg CO₂ |
//!
//! Undefined values (zero production, zero peak) come back as null with a
//! reason instead of NaN/∞. Hourly buckets keep the TOU pricing exact.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use sqlx::PgPool;

use crate::config::TariffConfig;
use crate::error::CoreError;
use crate::store::timeseries::{self, EnergyBucket};
use crate::types::{Granularity, KpiSet, KpiValue, TimeRange};

// ============================================================================
// TOU Tariff
// ============================================================================

/// Piecewise time-of-use tariff: a weekday peak window, off-peak otherwise.
///
/// A production deployment swaps the fixed window for a real TOU calendar by
/// constructing this from another source; consumers only see `rate_at`.
#[derive(Debug, Clone, Copy)]
pub struct TariffSchedule {
    pub peak_rate: f64,
    pub off_peak_rate: f64,
    /// Peak window [start, end) in UTC hours, weekdays only.
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,
}

impl TariffSchedule {
    pub fn from_config(config: &TariffConfig) -> Self {
        Self {
            peak_rate: config.peak,
            off_peak_rate: config.off_peak,
            peak_start_hour: 8,
            peak_end_hour: 20,
        }
    }

    /// Rate applying to a bucket starting at `ts`.
    pub fn rate_at(&self, ts: DateTime<Utc>) -> f64 {
        let weekday = !matches!(ts.weekday(), Weekday::Sat | Weekday::Sun);
        let hour = ts.hour();
        if weekday && hour >= self.peak_start_hour && hour < self.peak_end_hour {
            self.peak_rate
        } else {
            self.off_peak_rate
        }
    }
}

// ============================================================================
// Pure KPI Computation
// ============================================================================

/// Compute the suite from fetched buckets. Pure; the async entry point wraps
/// the single pair of aggregate queries.
pub fn compute_from_buckets(
    machine_key: &str,
    range: &TimeRange,
    energy: &[EnergyBucket],
    production_total: Option<f64>,
    tariff: &TariffSchedule,
    carbon_factor: f64,
) -> KpiSet {
    let total_energy: f64 = energy
        .iter()
        .filter_map(|b| b.total_energy_kwh)
        .sum();
    let has_energy = energy.iter().any(|b| b.total_energy_kwh.is_some());

    // SEC
    let sec = match (has_energy, production_total) {
        (false, _) => KpiValue::undefined("kWh/unit", "no energy data in window"),
        (true, None) => KpiValue::undefined("kWh/unit", "no production data in window"),
        (true, Some(p)) if p <= 0.0 => {
            KpiValue::undefined("kWh/unit", "zero production in window")
        }
        (true, Some(p)) => KpiValue::new(total_energy / p, "kWh/unit"),
    };

    // Peak demand
    let peak = energy
        .iter()
        .filter_map(|b| b.avg_power_kw)
        .fold(f64::NEG_INFINITY, f64::max);
    let peak_demand = if peak.is_finite() {
        KpiValue::new(peak, "kW")
    } else {
        KpiValue::undefined("kW", "no power data in window")
    };

    // Load factor
    let powers: Vec<f64> = energy.iter().filter_map(|b| b.avg_power_kw).collect();
    let max_power = energy
        .iter()
        .filter_map(|b| b.max_power_kw)
        .fold(f64::NEG_INFINITY, f64::max);
    let load_factor = if powers.is_empty() || !max_power.is_finite() {
        KpiValue::undefined("ratio", "no power data in window")
    } else if max_power <= 0.0 {
        KpiValue::undefined("ratio", "zero peak power in window")
    } else {
        let avg_power = powers.iter().sum::<f64>() / powers.len() as f64;
        KpiValue::new(avg_power / max_power, "ratio")
    };

    // Energy cost (TOU)
    let energy_cost = if has_energy {
        let cost: f64 = energy
            .iter()
            .filter_map(|b| b.total_energy_kwh.map(|e| e * tariff.rate_at(b.bucket)))
            .sum();
        KpiValue::new(cost, "currency")
    } else {
        KpiValue::undefined("currency", "no energy data in window")
    };

    // Carbon
    let carbon = if has_energy {
        KpiValue::new(total_energy * carbon_factor, "kg_co2")
    } else {
        KpiValue::undefined("kg_co2", "no energy data in window")
    };

    KpiSet {
        machine_id: machine_key.to_string(),
        period_start: range.start,
        period_end: range.end,
        sec,
        peak_demand,
        load_factor,
        energy_cost,
        carbon,
        computed_at: Utc::now(),
    }
}

// ============================================================================
// Entry Point
// ============================================================================

/// Compute all five KPIs for a machine set over a window.
///
/// One energy query plus one production query at hourly resolution; the
/// individual KPI endpoints call this too and pick their field.
pub async fn compute_all(
    pool: &PgPool,
    machine_key: &str,
    machine_ids: &[String],
    energy_source: &str,
    range: &TimeRange,
    tariff: &TariffSchedule,
    carbon_factor: f64,
) -> Result<KpiSet, CoreError> {
    let energy =
        timeseries::energy_series(pool, machine_ids, energy_source, range, Granularity::OneHour)
            .await?;

    let production =
        timeseries::production_series(pool, machine_ids, range, Granularity::OneHour).await?;
    let production_total = if production.iter().any(|b| b.total_count.is_some()) {
        Some(production.iter().filter_map(|b| b.total_count).sum())
    } else {
        None
    };

    Ok(compute_from_buckets(
        machine_key,
        range,
        &energy,
        production_total,
        tariff,
        carbon_factor,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tariff() -> TariffSchedule {
        TariffSchedule {
            peak_rate: 0.20,
            off_peak_rate: 0.10,
            peak_start_hour: 8,
            peak_end_hour: 20,
        }
    }

    fn bucket(ts: DateTime<Utc>, energy: f64, avg_kw: f64, max_kw: f64) -> EnergyBucket {
        EnergyBucket {
            bucket: ts,
            avg_power_kw: Some(avg_kw),
            min_power_kw: Some(avg_kw * 0.5),
            max_power_kw: Some(max_kw),
            total_energy_kwh: Some(energy),
            avg_load_factor: None,
            sample_count: 60,
        }
    }

    fn hour(day: u32, h: u32) -> DateTime<Utc> {
        // January 2025: the 6th is a Monday, the 4th a Saturday
        Utc.with_ymd_and_hms(2025, 1, day, h, 0, 0).single().unwrap()
    }

    fn window() -> TimeRange {
        TimeRange::new(hour(6, 0), hour(7, 0)).unwrap()
    }

    #[test]
    fn tariff_peak_window_is_weekday_daytime() {
        let t = tariff();
        assert_eq!(t.rate_at(hour(6, 12)), 0.20); // Monday noon
        assert_eq!(t.rate_at(hour(6, 7)), 0.10); // Monday 07:00, before peak
        assert_eq!(t.rate_at(hour(6, 20)), 0.10); // Monday 20:00, end exclusive
        assert_eq!(t.rate_at(hour(4, 12)), 0.10); // Saturday noon
    }

    #[test]
    fn suite_on_simple_buckets() {
        let energy = vec![
            bucket(hour(6, 9), 50.0, 50.0, 80.0),  // peak hour
            bucket(hour(6, 22), 30.0, 30.0, 60.0), // off-peak hour
        ];
        let set = compute_from_buckets("M-1", &window(), &energy, Some(400.0), &tariff(), 0.4);

        assert!((set.sec.value.unwrap() - 0.2).abs() < 1e-9); // 80 / 400
        assert!((set.peak_demand.value.unwrap() - 50.0).abs() < 1e-9);
        assert!((set.load_factor.value.unwrap() - 0.5).abs() < 1e-9); // 40 / 80
        // 50 × 0.20 + 30 × 0.10 = 13.0
        assert!((set.energy_cost.value.unwrap() - 13.0).abs() < 1e-9);
        assert!((set.carbon.value.unwrap() - 32.0).abs() < 1e-9); // 80 × 0.4
    }

    #[test]
    fn zero_production_yields_null_sec_with_reason() {
        let energy = vec![bucket(hour(6, 9), 50.0, 50.0, 80.0)];
        let set = compute_from_buckets("M-1", &window(), &energy, Some(0.0), &tariff(), 0.4);
        assert!(set.sec.value.is_none());
        assert_eq!(set.sec.reason.as_deref(), Some("zero production in window"));
        // the other KPIs are unaffected
        assert!(set.peak_demand.value.is_some());
    }

    #[test]
    fn missing_production_differs_from_zero_production() {
        let energy = vec![bucket(hour(6, 9), 50.0, 50.0, 80.0)];
        let set = compute_from_buckets("M-1", &window(), &energy, None, &tariff(), 0.4);
        assert_eq!(
            set.sec.reason.as_deref(),
            Some("no production data in window")
        );
    }

    #[test]
    fn empty_window_nulls_everything() {
        let set = compute_from_buckets("M-1", &window(), &[], Some(10.0), &tariff(), 0.4);
        assert!(set.sec.value.is_none());
        assert!(set.peak_demand.value.is_none());
        assert!(set.load_factor.value.is_none());
        assert!(set.energy_cost.value.is_none());
        assert!(set.carbon.value.is_none());
    }

    #[test]
    fn zero_peak_power_nulls_load_factor_only() {
        let energy = vec![bucket(hour(6, 9), 0.0, 0.0, 0.0)];
        let set = compute_from_buckets("M-1", &window(), &energy, Some(5.0), &tariff(), 0.4);
        assert!(set.load_factor.value.is_none());
        assert_eq!(
            set.load_factor.reason.as_deref(),
            Some("zero peak power in window")
        );
        assert_eq!(set.energy_cost.value, Some(0.0));
    }
}
