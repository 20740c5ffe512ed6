//! Reserve Risk: long-term holder conviction relative to price.
//!
//! `reserve_risk = price / (hodl_bank x circulating_supply)` where the HODL
//! bank is cumulative coin-days destroyed, scaled by `HODL_BANK_SCALE`.
//! Liveliness (cumulative destroyed over cumulative created coin-days) is
//! computed from the lifecycle table and only falls back to the documented
//! default when no coin-days exist yet.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use super::consts::{DEFAULT_LIVELINESS, HODL_BANK_SCALE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReserveRiskZone {
    StrongBuy,
    Accumulation,
    FairValue,
    Distribution,
}

impl ReserveRiskZone {
    fn classify(reserve_risk: f64) -> (Self, f64) {
        if reserve_risk < 0.002 {
            (ReserveRiskZone::StrongBuy, 0.85)
        } else if reserve_risk < 0.008 {
            (ReserveRiskZone::Accumulation, 0.7)
        } else if reserve_risk < 0.02 {
            (ReserveRiskZone::FairValue, 0.5)
        } else {
            (ReserveRiskZone::Distribution, 0.8)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReserveRiskResult {
    pub reserve_risk: f64,
    pub current_price_usd: f64,
    pub hodl_bank: f64,
    pub circulating_supply_btc: f64,
    pub mvrv: Option<f64>,
    pub liveliness: f64,
    pub signal_zone: ReserveRiskZone,
    pub confidence: f64,
}

/// Liveliness in [0,1]: coin-days destroyed over coin-days created, both
/// cumulative up to `as_of_ts`. Falls back to the default when nothing has
/// been created yet.
pub fn liveliness_as_of(conn: &Connection, as_of_ts: i64) -> Result<f64> {
    let destroyed: f64 = conn.query_row(
        "SELECT COALESCE(SUM(COALESCE(age_days, 0) * btc_value), 0)
         FROM utxo_lifecycle_full
         WHERE is_spent = 1 AND spent_timestamp <= ?1",
        params![as_of_ts],
        |r| r.get(0),
    )?;
    // Coin-days created: every UTXO accrues from creation until it is spent
    // or until the as-of instant.
    let created: f64 = conn.query_row(
        "SELECT COALESCE(SUM(
             (MIN(COALESCE(spent_timestamp, ?1), ?1) - creation_timestamp) / 86400.0 * btc_value
         ), 0)
         FROM utxo_lifecycle_full
         WHERE creation_timestamp IS NOT NULL
           AND creation_timestamp <= ?1",
        params![as_of_ts],
        |r| r.get(0),
    )?;
    if created <= 0.0 {
        return Ok(DEFAULT_LIVELINESS);
    }
    Ok((destroyed / created).clamp(0.0, 1.0))
}

pub fn calculate_reserve_risk(
    conn: &Connection,
    block: u64,
    as_of_ts: i64,
    current_price_usd: f64,
    mvrv: Option<f64>,
) -> Result<ReserveRiskResult> {
    let circulating_supply: f64 = conn.query_row(
        "SELECT COALESCE(SUM(btc_value), 0)
         FROM utxo_lifecycle_full
         WHERE creation_block <= ?1
           AND (is_spent = 0 OR spent_block > ?1)",
        params![block],
        |r| r.get(0),
    )?;

    let hodl_bank: f64 = conn.query_row(
        "SELECT COALESCE(SUM(COALESCE(age_days, 0) * btc_value), 0) / ?2
         FROM utxo_lifecycle_full
         WHERE is_spent = 1 AND spent_block <= ?1",
        params![block, HODL_BANK_SCALE],
        |r| r.get(0),
    )?;

    let liveliness = liveliness_as_of(conn, as_of_ts)?;

    // No spend history yet: a low-risk sentinel rather than a division by
    // zero.
    let reserve_risk = if hodl_bank > 0.0 && circulating_supply > 0.0 {
        current_price_usd / (hodl_bank * circulating_supply)
    } else {
        0.001
    };

    let (signal_zone, confidence) = ReserveRiskZone::classify(reserve_risk);

    Ok(ReserveRiskResult {
        reserve_risk,
        current_price_usd,
        hodl_bank,
        circulating_supply_btc: circulating_supply,
        mvrv,
        liveliness,
        signal_zone,
        confidence,
    })
}
