//! Coin-days destroyed, its value-weighted form, and the Binary CDD
//! significance flag.
//!
//! CDD of a spend is `age_days x btc_value`; VDD multiplies by the spend
//! price. Binary CDD z-scores today's CDD against the rolling window and
//! flags 1 when the z-score clears the threshold. Fewer than the minimum
//! number of daily samples forces the flag to 0 with `insufficient` set;
//! zero standard deviation leaves the z-score null and the flag 0.

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;

use super::consts::{BINARY_CDD_MIN_POINTS, DEFAULT_WINDOW_DAYS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CddSignalZone {
    LowActivity,
    Normal,
    Elevated,
    Spike,
}

#[derive(Debug, Clone, Serialize)]
pub struct CddVddResult {
    pub cdd_total: f64,
    pub cdd_daily_avg: f64,
    pub vdd_total: f64,
    pub vdd_daily_avg: f64,
    /// VDD daily average over the trailing-365d daily average; null when
    /// there is no trailing history.
    pub vdd_multiple: Option<f64>,
    pub window_days: u64,
    pub spent_utxos_count: u64,
    pub avg_utxo_age_days: f64,
    pub max_single_day_cdd: f64,
    pub max_single_day_date: Option<NaiveDate>,
    pub signal_zone: CddSignalZone,
    pub confidence: f64,
}

/// Daily CDD sums for spends inside `[start_ts, end_ts)`, ascending by date.
pub fn daily_cdd_series(
    conn: &Connection,
    start_ts: i64,
    end_ts: i64,
) -> Result<Vec<(NaiveDate, f64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT date(spent_timestamp, 'unixepoch') AS d,
                SUM(COALESCE(age_days, 0) * btc_value)
         FROM utxo_lifecycle_full
         WHERE is_spent = 1
           AND spent_timestamp >= ?1 AND spent_timestamp < ?2
         GROUP BY d
         ORDER BY d",
    )?;
    let rows: Vec<(String, f64)> = stmt
        .query_map(params![start_ts, end_ts], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    rows.into_iter()
        .map(|(d, v)| Ok((d.parse()?, v)))
        .collect()
}

fn classify_zone(cdd_total: f64, vdd_multiple: Option<f64>) -> (CddSignalZone, f64) {
    if let Some(multiple) = vdd_multiple {
        return if multiple >= 2.0 {
            (CddSignalZone::Spike, 0.85)
        } else if multiple >= 1.5 {
            (CddSignalZone::Elevated, 0.7)
        } else if multiple >= 0.5 {
            (CddSignalZone::Normal, 0.6)
        } else {
            (CddSignalZone::LowActivity, 0.65)
        };
    }
    // CDD-level fallback thresholds; calibration, used only without a
    // trailing VDD baseline.
    if cdd_total >= 10_000.0 {
        (CddSignalZone::Spike, 0.7)
    } else if cdd_total >= 5_000.0 {
        (CddSignalZone::Elevated, 0.6)
    } else if cdd_total >= 500.0 {
        (CddSignalZone::Normal, 0.55)
    } else {
        (CddSignalZone::LowActivity, 0.6)
    }
}

/// CDD/VDD over `[start_ts, end_ts)`.
pub fn calculate_cdd_vdd(
    conn: &Connection,
    start_ts: i64,
    end_ts: i64,
    window_days: u64,
) -> Result<CddVddResult> {
    anyhow::ensure!(window_days > 0, "window must be positive");

    let (cdd_total, vdd_total, spent_count, avg_age): (f64, f64, u64, f64) = conn.query_row(
        "SELECT
             COALESCE(SUM(COALESCE(age_days, 0) * btc_value), 0),
             COALESCE(SUM(COALESCE(age_days, 0) * btc_value * COALESCE(spent_price_usd, 0)), 0),
             COUNT(*),
             COALESCE(AVG(COALESCE(age_days, 0)), 0)
         FROM utxo_lifecycle_full
         WHERE is_spent = 1
           AND spent_timestamp >= ?1 AND spent_timestamp < ?2",
        params![start_ts, end_ts],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )?;

    let cdd_daily_avg = cdd_total / window_days as f64;
    let vdd_daily_avg = vdd_total / window_days as f64;

    // Trailing-365d VDD baseline for the multiple.
    let baseline_start = end_ts - 365 * 86_400;
    let vdd_365: f64 = conn.query_row(
        "SELECT COALESCE(SUM(COALESCE(age_days, 0) * btc_value * COALESCE(spent_price_usd, 0)), 0)
         FROM utxo_lifecycle_full
         WHERE is_spent = 1
           AND spent_timestamp >= ?1 AND spent_timestamp < ?2",
        params![baseline_start, end_ts],
        |r| r.get(0),
    )?;
    let baseline_daily = vdd_365 / 365.0;
    let vdd_multiple = (baseline_daily > 0.0).then(|| vdd_daily_avg / baseline_daily);

    let series = daily_cdd_series(conn, start_ts, end_ts)?;
    let (max_single_day_date, max_single_day_cdd) = series
        .iter()
        .fold((None, 0.0f64), |(date, max), &(d, v)| {
            if v > max { (Some(d), v) } else { (date, max) }
        });

    let (signal_zone, confidence) = classify_zone(cdd_total, vdd_multiple);

    Ok(CddVddResult {
        cdd_total,
        cdd_daily_avg,
        vdd_total,
        vdd_daily_avg,
        vdd_multiple,
        window_days,
        spent_utxos_count: spent_count,
        avg_utxo_age_days: avg_age,
        max_single_day_cdd,
        max_single_day_date,
        signal_zone,
        confidence,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct BinaryCddResult {
    pub cdd_today: f64,
    pub cdd_mean: f64,
    pub cdd_std: f64,
    pub cdd_zscore: Option<f64>,
    pub cdd_percentile: Option<f64>,
    pub binary_cdd: u8,
    pub threshold_used: f64,
    pub window_days: u64,
    pub data_points: usize,
    pub insufficient_data: bool,
}

fn insufficient(threshold: f64, window_days: u64, data_points: usize, cdd_today: f64) -> BinaryCddResult {
    BinaryCddResult {
        cdd_today,
        cdd_mean: 0.0,
        cdd_std: 0.0,
        cdd_zscore: None,
        cdd_percentile: None,
        binary_cdd: 0,
        threshold_used: threshold,
        window_days,
        data_points,
        insufficient_data: true,
    }
}

/// Binary CDD as of `as_of_ts`, z-scoring the latest daily CDD against the
/// lookback window ending there.
pub fn calculate_binary_cdd(
    conn: &Connection,
    threshold: f64,
    window_days: u64,
    as_of_ts: i64,
) -> Result<BinaryCddResult> {
    let threshold = threshold.clamp(1.0, 4.0);
    let window_days = window_days.clamp(DEFAULT_WINDOW_DAYS, 730);

    let start_ts = as_of_ts - window_days as i64 * 86_400;
    let series = daily_cdd_series(conn, start_ts, as_of_ts)?;
    let values: Vec<f64> = series.iter().map(|&(_, v)| v).collect();
    let n = values.len();

    if n < BINARY_CDD_MIN_POINTS {
        tracing::warn!(points = n, minimum = BINARY_CDD_MIN_POINTS, "binary cdd gated on sample size");
        return Ok(insufficient(threshold, window_days, n, values.last().copied().unwrap_or(0.0)));
    }

    let today = values[n - 1];
    let mean = values.iter().sum::<f64>() / n as f64;
    // Sample standard deviation (N-1).
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let std = variance.sqrt();

    let (zscore, percentile, flag) = if std > 0.0 {
        let z = (today - mean) / std;
        let pct = values.iter().filter(|&&v| v < today).count() as f64 / n as f64 * 100.0;
        (Some(z), Some(pct), u8::from(z >= threshold))
    } else {
        // All values identical: z-score undefined, median by definition.
        (None, Some(50.0), 0)
    };

    Ok(BinaryCddResult {
        cdd_today: today,
        cdd_mean: mean,
        cdd_std: std,
        cdd_zscore: zscore,
        cdd_percentile: percentile,
        binary_cdd: flag,
        threshold_used: threshold,
        window_days,
        data_points: n,
        insufficient_data: false,
    })
}
