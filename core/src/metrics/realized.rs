//! Realized cap, market cap, MVRV, MVRV-Z and NUPL.
//!
//! The unspent test at a historical point is
//! `creation_block <= B AND (is_spent = 0 OR spent_block > B)`.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use super::consts::MVRV_Z_K;

/// Sum of `btc_value x creation_price_usd` over UTXOs unspent as of `block`.
pub fn realized_cap_as_of(conn: &Connection, block: u64) -> Result<f64> {
    let cap: f64 = conn.query_row(
        "SELECT COALESCE(SUM(realized_value_usd), 0)
         FROM utxo_lifecycle_full
         WHERE creation_block <= ?1
           AND (is_spent = 0 OR spent_block > ?1)
           AND realized_value_usd IS NOT NULL",
        params![block],
        |r| r.get(0),
    )?;
    Ok(cap)
}

/// Total unspent BTC supply as of `block`.
pub fn unspent_supply_as_of(conn: &Connection, block: u64) -> Result<f64> {
    let supply: f64 = conn.query_row(
        "SELECT COALESCE(SUM(btc_value), 0)
         FROM utxo_lifecycle_full
         WHERE creation_block <= ?1
           AND (is_spent = 0 OR spent_block > ?1)",
        params![block],
        |r| r.get(0),
    )?;
    Ok(supply)
}

pub fn market_cap(supply_btc: f64, price_usd: f64) -> f64 {
    supply_btc * price_usd
}

/// Market cap over realized cap; null when realized cap is zero.
pub fn mvrv(market_cap: f64, realized_cap: f64) -> Option<f64> {
    (realized_cap > 0.0).then(|| market_cap / realized_cap)
}

/// Simplified z-score: `(market - realized) / (realized * k)`.
pub fn mvrv_z(market_cap: f64, realized_cap: f64) -> Option<f64> {
    (realized_cap > 0.0).then(|| (market_cap - realized_cap) / (realized_cap * MVRV_Z_K))
}

/// Net unrealized profit/loss, in (-inf, 1]; null when market cap is zero.
pub fn nupl(market_cap: f64, realized_cap: f64) -> Option<f64> {
    (market_cap > 0.0).then(|| (market_cap - realized_cap) / market_cap)
}

/// Market-cycle zones over NUPL, Glassnode boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NuplZone {
    Capitulation,
    HopeFear,
    Optimism,
    Belief,
    Euphoria,
}

impl NuplZone {
    pub fn classify(nupl: f64) -> Self {
        if nupl < 0.0 {
            NuplZone::Capitulation
        } else if nupl < 0.25 {
            NuplZone::HopeFear
        } else if nupl < 0.5 {
            NuplZone::Optimism
        } else if nupl < 0.75 {
            NuplZone::Belief
        } else {
            NuplZone::Euphoria
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RealizedSnapshot {
    pub realized_cap_usd: f64,
    pub supply_btc: f64,
    pub market_cap_usd: Option<f64>,
    pub mvrv: Option<f64>,
    pub mvrv_z: Option<f64>,
    pub nupl: Option<f64>,
    pub zone: Option<NuplZone>,
    pub unrealized_profit_usd: Option<f64>,
    pub confidence: f64,
}

/// The realized family as of `block`. A missing price leaves the market-side
/// fields null and cuts confidence; it is never substituted.
pub fn calculate_realized_snapshot(
    conn: &Connection,
    block: u64,
    price_usd: Option<f64>,
) -> Result<RealizedSnapshot> {
    let realized_cap_usd = realized_cap_as_of(conn, block)?;
    let supply_btc = unspent_supply_as_of(conn, block)?;

    if supply_btc <= 0.0 {
        // Empty UTXO set: neutral sentinels, zero confidence.
        return Ok(RealizedSnapshot {
            realized_cap_usd: 0.0,
            supply_btc: 0.0,
            market_cap_usd: None,
            mvrv: None,
            mvrv_z: None,
            nupl: None,
            zone: Some(NuplZone::HopeFear),
            unrealized_profit_usd: None,
            confidence: 0.0,
        });
    }

    let market_cap_usd = price_usd.map(|p| market_cap(supply_btc, p));
    let mvrv_v = market_cap_usd.and_then(|m| mvrv(m, realized_cap_usd));
    let mvrv_z_v = market_cap_usd.and_then(|m| mvrv_z(m, realized_cap_usd));
    let nupl_v = market_cap_usd.and_then(|m| nupl(m, realized_cap_usd));

    let confidence = match (price_usd, realized_cap_usd > 0.0) {
        (Some(_), true) if supply_btc > 1_000.0 => 0.85,
        (Some(_), true) if supply_btc > 100.0 => 0.70,
        (Some(_), _) => 0.50,
        (None, _) => 0.25,
    };

    Ok(RealizedSnapshot {
        realized_cap_usd,
        supply_btc,
        market_cap_usd,
        mvrv: mvrv_v,
        mvrv_z: mvrv_z_v,
        nupl: nupl_v,
        zone: nupl_v.map(NuplZone::classify),
        unrealized_profit_usd: market_cap_usd.map(|m| m - realized_cap_usd),
        confidence,
    })
}
