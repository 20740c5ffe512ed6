//! Exchange net-flow against the known exchange-address set.
//!
//! Inflow is supply created at exchange addresses inside the window (a
//! deposit creates a UTXO there); outflow is supply spent from them. The
//! zone thresholds are calibration values, not contract.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::store::LifecycleStore;

use super::consts::NETFLOW_STRONG_FLOW_BTC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetflowZone {
    StrongOutflow,
    WeakOutflow,
    WeakInflow,
    StrongInflow,
}

/// Positive netflow = BTC moving onto exchanges (sell pressure); negative =
/// moving off (accumulation). Rejects non-finite rates.
pub fn classify_netflow_zone(netflow_btc_per_day: f64) -> Result<NetflowZone> {
    if !netflow_btc_per_day.is_finite() {
        bail!("netflow rate must be finite, got {netflow_btc_per_day}");
    }
    Ok(if netflow_btc_per_day < -NETFLOW_STRONG_FLOW_BTC {
        NetflowZone::StrongOutflow
    } else if netflow_btc_per_day < 0.0 {
        NetflowZone::WeakOutflow
    } else if netflow_btc_per_day < NETFLOW_STRONG_FLOW_BTC {
        NetflowZone::WeakInflow
    } else {
        NetflowZone::StrongInflow
    })
}

/// Replace the exchange-address table from a CSV with columns
/// `exchange_name,address,type`. DELETE + bulk insert in one transaction so
/// a bad file never leaves a half-loaded set.
pub fn load_exchange_addresses(store: &mut LifecycleStore, csv_path: &Path) -> Result<u64> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(csv_path)
        .with_context(|| format!("opening exchange addresses {}", csv_path.display()))?;
    let headers = reader.headers()?.clone();
    let col = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .with_context(|| format!("exchange CSV is missing the {name} column"))
    };
    let (name_i, addr_i, type_i) = (col("exchange_name")?, col("address")?, col("type")?);

    let tx = store.conn_mut().transaction()?;
    tx.execute("DELETE FROM exchange_addresses", [])?;
    let mut loaded = 0u64;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR REPLACE INTO exchange_addresses (exchange_name, address, type)
             VALUES (?1, ?2, ?3)",
        )?;
        for record in reader.records() {
            let record = record.context("reading exchange CSV row")?;
            let get = |i: usize| record.get(i).unwrap_or("").trim().to_string();
            let address = get(addr_i);
            if address.is_empty() {
                continue;
            }
            stmt.execute(params![get(name_i), address, get(type_i)])?;
            loaded += 1;
        }
    }
    tx.commit()?;
    if loaded < 1_000 {
        tracing::warn!(loaded, "low exchange address coverage, netflow confidence degrades");
    } else {
        tracing::info!(loaded, "exchange addresses loaded");
    }
    Ok(loaded)
}

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeNetflowResult {
    pub exchange_inflow: f64,
    pub exchange_outflow: f64,
    pub netflow: f64,
    pub netflow_7d_ma: f64,
    pub netflow_30d_ma: f64,
    pub zone: NetflowZone,
    pub window_hours: u64,
    pub exchange_count: u64,
    pub address_count: u64,
    pub current_price_usd: f64,
    pub inflow_usd: f64,
    pub outflow_usd: f64,
    pub confidence: f64,
}

fn flow_in_window(conn: &Connection, start_ts: i64, end_ts: i64, outflow: bool) -> Result<f64> {
    let sql = if outflow {
        "SELECT COALESCE(SUM(u.btc_value), 0)
         FROM utxo_lifecycle_full u
         JOIN exchange_addresses e ON e.address = u.address
         WHERE u.is_spent = 1
           AND u.spent_timestamp >= ?1 AND u.spent_timestamp < ?2"
    } else {
        "SELECT COALESCE(SUM(u.btc_value), 0)
         FROM utxo_lifecycle_full u
         JOIN exchange_addresses e ON e.address = u.address
         WHERE u.creation_timestamp >= ?1 AND u.creation_timestamp < ?2"
    };
    let flow: f64 = conn.query_row(sql, params![start_ts, end_ts], |r| r.get(0))?;
    Ok(flow)
}

/// Daily netflow history over the `days` ending at `end_ts`, newest first.
fn daily_netflow_history(conn: &Connection, end_ts: i64, days: u64) -> Result<Vec<f64>> {
    let start_ts = end_ts - days as i64 * 86_400;
    let mut per_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();

    let mut inflow_stmt = conn.prepare_cached(
        "SELECT date(u.creation_timestamp, 'unixepoch'), COALESCE(SUM(u.btc_value), 0)
         FROM utxo_lifecycle_full u
         JOIN exchange_addresses e ON e.address = u.address
         WHERE u.creation_timestamp >= ?1 AND u.creation_timestamp < ?2
         GROUP BY 1",
    )?;
    let inflows: Vec<(String, f64)> = inflow_stmt
        .query_map(params![start_ts, end_ts], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    for (date, btc) in inflows {
        *per_day.entry(date.parse()?).or_default() += btc;
    }

    let mut outflow_stmt = conn.prepare_cached(
        "SELECT date(u.spent_timestamp, 'unixepoch'), COALESCE(SUM(u.btc_value), 0)
         FROM utxo_lifecycle_full u
         JOIN exchange_addresses e ON e.address = u.address
         WHERE u.is_spent = 1
           AND u.spent_timestamp >= ?1 AND u.spent_timestamp < ?2
         GROUP BY 1",
    )?;
    let outflows: Vec<(String, f64)> = outflow_stmt
        .query_map(params![start_ts, end_ts], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    for (date, btc) in outflows {
        *per_day.entry(date.parse()?).or_default() -= btc;
    }

    // Newest first, matching how the moving averages consume it.
    Ok(per_day.into_values().rev().collect())
}

/// Simple MA over the first (newest) `window` values.
fn moving_average(newest_first: &[f64], window: usize) -> f64 {
    if newest_first.is_empty() {
        return 0.0;
    }
    let take = window.min(newest_first.len());
    newest_first[..take].iter().sum::<f64>() / take as f64
}

pub fn calculate_exchange_netflow(
    conn: &Connection,
    start_ts: i64,
    end_ts: i64,
    window_hours: u64,
    current_price_usd: f64,
) -> Result<ExchangeNetflowResult> {
    anyhow::ensure!(window_hours > 0, "window must be positive");

    let (exchange_count, address_count): (u64, u64) = conn.query_row(
        "SELECT COUNT(DISTINCT exchange_name), COUNT(*) FROM exchange_addresses",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    if address_count == 0 {
        return Ok(ExchangeNetflowResult {
            exchange_inflow: 0.0,
            exchange_outflow: 0.0,
            netflow: 0.0,
            netflow_7d_ma: 0.0,
            netflow_30d_ma: 0.0,
            zone: NetflowZone::WeakInflow,
            window_hours,
            exchange_count: 0,
            address_count: 0,
            current_price_usd,
            inflow_usd: 0.0,
            outflow_usd: 0.0,
            confidence: 0.0,
        });
    }

    let inflow = flow_in_window(conn, start_ts, end_ts, false)?;
    let outflow = flow_in_window(conn, start_ts, end_ts, true)?;
    let netflow = inflow - outflow;

    let history = daily_netflow_history(conn, end_ts, 30)?;
    let netflow_7d_ma = moving_average(&history, 7);
    let netflow_30d_ma = moving_average(&history, 30);

    let daily_netflow = netflow * 24.0 / window_hours as f64;
    let zone = classify_netflow_zone(daily_netflow)?;

    let confidence = if inflow == 0.0 && outflow == 0.0 {
        0.0
    } else if address_count < 5 {
        0.5
    } else {
        0.75
    };

    Ok(ExchangeNetflowResult {
        exchange_inflow: inflow,
        exchange_outflow: outflow,
        netflow,
        netflow_7d_ma,
        netflow_30d_ma,
        zone,
        window_hours,
        exchange_count,
        address_count,
        current_price_usd,
        inflow_usd: inflow * current_price_usd,
        outflow_usd: outflow * current_price_usd,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_boundaries() {
        assert_eq!(classify_netflow_zone(-1_500.0).unwrap(), NetflowZone::StrongOutflow);
        assert_eq!(classify_netflow_zone(-10.0).unwrap(), NetflowZone::WeakOutflow);
        assert_eq!(classify_netflow_zone(0.0).unwrap(), NetflowZone::WeakInflow);
        assert_eq!(classify_netflow_zone(999.0).unwrap(), NetflowZone::WeakInflow);
        assert_eq!(classify_netflow_zone(1_000.0).unwrap(), NetflowZone::StrongInflow);
        assert!(classify_netflow_zone(f64::NAN).is_err());
    }

    #[test]
    fn moving_average_uses_newest_values() {
        let newest_first = vec![10.0, 20.0, 30.0, 40.0];
        assert!((moving_average(&newest_first, 2) - 15.0).abs() < 1e-9);
        // Shorter history than the window: average what exists.
        assert!((moving_average(&newest_first, 30) - 25.0).abs() < 1e-9);
        assert_eq!(moving_average(&[], 7), 0.0);
    }
}
