//! Revived supply: dormant coins moving again.
//!
//! Sums `btc_value` of UTXOs spent inside the window whose age at spend
//! crossed the 1y/2y/5y thresholds, with a daily-rate zone classification.

use anyhow::{bail, Result};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::consts::{
    REVIVED_1Y_DAYS, REVIVED_2Y_DAYS, REVIVED_5Y_DAYS, REVIVED_ZONE_ELEVATED_BTC,
    REVIVED_ZONE_NORMAL_BTC, REVIVED_ZONE_SPIKE_BTC,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevivedZone {
    Dormant,
    Normal,
    Elevated,
    Spike,
}

/// Zone by daily revived rate. Rejects NaN/infinite/negative input instead
/// of letting it pick a bucket.
pub fn classify_revived_zone(revived_btc_per_day: f64) -> Result<RevivedZone> {
    if !revived_btc_per_day.is_finite() {
        bail!("revived rate must be finite, got {revived_btc_per_day}");
    }
    if revived_btc_per_day < 0.0 {
        bail!("revived rate must be non-negative, got {revived_btc_per_day}");
    }
    Ok(if revived_btc_per_day < REVIVED_ZONE_NORMAL_BTC {
        RevivedZone::Dormant
    } else if revived_btc_per_day < REVIVED_ZONE_ELEVATED_BTC {
        RevivedZone::Normal
    } else if revived_btc_per_day < REVIVED_ZONE_SPIKE_BTC {
        RevivedZone::Elevated
    } else {
        RevivedZone::Spike
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RevivedSupplyResult {
    pub revived_1y: f64,
    pub revived_2y: f64,
    pub revived_5y: f64,
    pub revived_total_usd: f64,
    /// BTC-weighted average age of the 1y+ revived coins, in days.
    pub revived_avg_age: f64,
    pub zone: RevivedZone,
    pub utxo_count: u64,
    pub window_days: u64,
    pub current_price_usd: f64,
    pub confidence: f64,
}

pub fn calculate_revived_supply(
    conn: &Connection,
    start_ts: i64,
    end_ts: i64,
    window_days: u64,
    current_price_usd: f64,
) -> Result<RevivedSupplyResult> {
    anyhow::ensure!(window_days > 0, "window must be positive");

    let (r1, r2, r5, weighted_age_sum, count): (f64, f64, f64, f64, u64) = conn.query_row(
        "SELECT
             COALESCE(SUM(CASE WHEN age_days >= ?3 THEN btc_value ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN age_days >= ?4 THEN btc_value ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN age_days >= ?5 THEN btc_value ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN age_days >= ?3 THEN btc_value * age_days ELSE 0 END), 0),
             COUNT(*)
         FROM utxo_lifecycle_full
         WHERE is_spent = 1
           AND age_days >= ?3
           AND btc_value IS NOT NULL
           AND spent_timestamp >= ?1 AND spent_timestamp < ?2",
        params![start_ts, end_ts, REVIVED_1Y_DAYS, REVIVED_2Y_DAYS, REVIVED_5Y_DAYS],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
    )?;

    let revived_avg_age = if r1 > 0.0 { weighted_age_sum / r1 } else { 0.0 };
    let revived_per_day = r1 / window_days as f64;
    let zone = classify_revived_zone(revived_per_day)?;

    let confidence = if count == 0 {
        0.0
    } else if count < 100 {
        0.5
    } else {
        0.85
    };

    Ok(RevivedSupplyResult {
        revived_1y: r1,
        revived_2y: r2,
        revived_5y: r5,
        revived_total_usd: r1 * current_price_usd,
        revived_avg_age,
        zone,
        utxo_count: count,
        window_days,
        current_price_usd,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_boundaries() {
        assert_eq!(classify_revived_zone(0.0).unwrap(), RevivedZone::Dormant);
        assert_eq!(classify_revived_zone(999.9).unwrap(), RevivedZone::Dormant);
        assert_eq!(classify_revived_zone(1_000.0).unwrap(), RevivedZone::Normal);
        assert_eq!(classify_revived_zone(5_000.0).unwrap(), RevivedZone::Elevated);
        assert_eq!(classify_revived_zone(10_000.0).unwrap(), RevivedZone::Spike);
    }

    #[test]
    fn non_finite_rates_are_rejected() {
        assert!(classify_revived_zone(f64::NAN).is_err());
        assert!(classify_revived_zone(f64::INFINITY).is_err());
        assert!(classify_revived_zone(-1.0).is_err());
    }
}
