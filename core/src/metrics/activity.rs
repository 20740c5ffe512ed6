//! Network activity: active addresses and transaction volume over a window.
//!
//! Active-address counts carry a 3-sigma anomaly flag against the trailing
//! daily counts. Transaction volume is change-adjusted, not a raw output
//! sum: a transaction's likely change output is excluded so the figure
//! reflects real economic transfer.

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;

/// Metric-row name under which daily active-address counts persist; the
/// anomaly lookback reads history back out of the same rows.
pub const ACTIVE_ADDRESSES_METRIC: &str = "active_addresses";

/// Days of history consulted by the anomaly check.
pub const ANOMALY_LOOKBACK_DAYS: u64 = 30;

/// Change heuristic: in a two-output transaction, a smaller output under
/// this fraction of the larger one is treated as change.
const CHANGE_OUTPUT_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Serialize)]
pub struct ActiveAddressesResult {
    /// Distinct addresses that created or spent a UTXO in the window.
    pub active_addresses: u64,
    pub unique_receivers: u64,
    pub unique_senders: u64,
    /// True when the count sits more than 3 sigma above the trailing daily
    /// average.
    pub is_anomaly: bool,
    /// Daily counts the anomaly check ran against.
    pub historical_days: usize,
}

/// Whether `current_count` exceeds mean + 3 sigma of the historical daily
/// counts. Fewer than two samples cannot support the test and never flag.
pub fn detect_active_address_anomaly(current_count: u64, historical_counts: &[u64]) -> bool {
    if historical_counts.len() < 2 {
        return false;
    }
    let n = historical_counts.len() as f64;
    let mean = historical_counts.iter().sum::<u64>() as f64 / n;
    // Sample standard deviation (N-1).
    let variance = historical_counts
        .iter()
        .map(|&c| (c as f64 - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    let threshold = mean + 3.0 * variance.sqrt();
    current_count as f64 > threshold
}

/// Trailing daily active-address counts persisted before `before`, newest
/// first, at most `days` of them.
pub fn historical_active_counts(
    conn: &Connection,
    before: NaiveDate,
    days: u64,
) -> Result<Vec<u64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT value FROM metrics_daily
         WHERE metric = ?1 AND date < ?2 AND value IS NOT NULL
         ORDER BY date DESC LIMIT ?3",
    )?;
    let counts: Vec<f64> = stmt
        .query_map(params![ACTIVE_ADDRESSES_METRIC, before.to_string(), days], |r| r.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(counts.into_iter().map(|c| c.round() as u64).collect())
}

pub fn calculate_active_addresses(
    conn: &Connection,
    start_ts: i64,
    end_ts: i64,
    historical_counts: &[u64],
) -> Result<ActiveAddressesResult> {
    let unique_receivers: u64 = conn.query_row(
        "SELECT COUNT(DISTINCT address) FROM utxo_lifecycle_full
         WHERE address IS NOT NULL
           AND creation_timestamp >= ?1 AND creation_timestamp < ?2",
        params![start_ts, end_ts],
        |r| r.get(0),
    )?;
    let unique_senders: u64 = conn.query_row(
        "SELECT COUNT(DISTINCT address) FROM utxo_lifecycle_full
         WHERE address IS NOT NULL
           AND is_spent = 1
           AND spent_timestamp >= ?1 AND spent_timestamp < ?2",
        params![start_ts, end_ts],
        |r| r.get(0),
    )?;
    let active_addresses: u64 = conn.query_row(
        "SELECT COUNT(*) FROM (
             SELECT address FROM utxo_lifecycle_full
             WHERE address IS NOT NULL
               AND creation_timestamp >= ?1 AND creation_timestamp < ?2
             UNION
             SELECT address FROM utxo_lifecycle_full
             WHERE address IS NOT NULL
               AND is_spent = 1
               AND spent_timestamp >= ?1 AND spent_timestamp < ?2
         )",
        params![start_ts, end_ts],
        |r| r.get(0),
    )?;
    Ok(ActiveAddressesResult {
        active_addresses,
        unique_receivers,
        unique_senders,
        is_anomaly: detect_active_address_anomaly(active_addresses, historical_counts),
        historical_days: historical_counts.len(),
    })
}

/// Estimate a transaction's real transfer volume from its output values,
/// excluding the likely change output. Single output: no change. Two
/// outputs: drop the smaller when it is under 10% of the larger. Three or
/// more: drop the smallest.
pub fn estimate_real_volume(output_values_btc: &[f64]) -> f64 {
    let mut values: Vec<f64> = output_values_btc.iter().copied().filter(|v| *v > 0.0).collect();
    if values.is_empty() {
        return 0.0;
    }
    if values.len() == 1 {
        return values[0];
    }
    values.sort_by(|a, b| b.total_cmp(a));
    if values.len() == 2 {
        if values[1] / values[0] < CHANGE_OUTPUT_RATIO {
            return values[0];
        }
        return values[0] + values[1];
    }
    // Drop the smallest (last after the descending sort).
    values[..values.len() - 1].iter().sum()
}

#[derive(Debug, Clone, Serialize)]
pub struct TxVolumeResult {
    /// Change-adjusted transfer volume in the window, coinbase excluded.
    pub volume_btc: f64,
    pub volume_usd: Option<f64>,
    /// Raw output sum before the change adjustment.
    pub raw_output_btc: f64,
    pub tx_count: u64,
}

pub fn calculate_tx_volume(
    conn: &Connection,
    start_ts: i64,
    end_ts: i64,
    price_usd: Option<f64>,
) -> Result<TxVolumeResult> {
    // Per-tx output enumeration; the change heuristic needs the full output
    // set of each transaction, not an aggregate.
    let mut stmt = conn.prepare_cached(
        "SELECT txid, btc_value FROM utxo_lifecycle_full
         WHERE coinbase = 0
           AND creation_timestamp >= ?1 AND creation_timestamp < ?2
         ORDER BY txid",
    )?;
    let rows: Vec<(String, f64)> = stmt
        .query_map(params![start_ts, end_ts], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut volume_btc = 0.0;
    let mut raw_output_btc = 0.0;
    let mut tx_count = 0u64;
    let mut current: Option<(&str, Vec<f64>)> = None;

    for (txid, value) in &rows {
        raw_output_btc += value;
        match &mut current {
            Some((open, outputs)) if *open == txid.as_str() => outputs.push(*value),
            _ => {
                if let Some((_, outputs)) = current.take() {
                    volume_btc += estimate_real_volume(&outputs);
                    tx_count += 1;
                }
                current = Some((txid.as_str(), vec![*value]));
            }
        }
    }
    if let Some((_, outputs)) = current.take() {
        volume_btc += estimate_real_volume(&outputs);
        tx_count += 1;
    }

    Ok(TxVolumeResult {
        volume_btc,
        volume_usd: price_usd.map(|p| volume_btc * p),
        raw_output_btc,
        tx_count,
    })
}
