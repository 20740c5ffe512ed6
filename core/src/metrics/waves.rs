//! Wallet waves (supply by address-balance band), HODL waves (supply by
//! coin age band) and absorption rates (band supply deltas against miner
//! issuance).

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use super::consts::{BLOCKS_PER_DAY, BLOCK_REWARD_BTC};

/// The six balance bands, Glassnode-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletBand {
    Shrimp,
    Crab,
    Fish,
    Shark,
    Whale,
    Humpback,
}

impl WalletBand {
    pub const ALL: [WalletBand; 6] = [
        WalletBand::Shrimp,
        WalletBand::Crab,
        WalletBand::Fish,
        WalletBand::Shark,
        WalletBand::Whale,
        WalletBand::Humpback,
    ];

    pub fn classify(balance_btc: f64) -> Result<Self> {
        anyhow::ensure!(balance_btc >= 0.0, "balance must be non-negative, got {balance_btc}");
        Ok(if balance_btc < 1.0 {
            WalletBand::Shrimp
        } else if balance_btc < 10.0 {
            WalletBand::Crab
        } else if balance_btc < 100.0 {
            WalletBand::Fish
        } else if balance_btc < 1_000.0 {
            WalletBand::Shark
        } else if balance_btc < 10_000.0 {
            WalletBand::Whale
        } else {
            WalletBand::Humpback
        })
    }

    pub fn is_retail(self) -> bool {
        matches!(self, WalletBand::Shrimp | WalletBand::Crab | WalletBand::Fish)
    }

    fn key(self) -> &'static str {
        match self {
            WalletBand::Shrimp => "shrimp",
            WalletBand::Crab => "crab",
            WalletBand::Fish => "fish",
            WalletBand::Shark => "shark",
            WalletBand::Whale => "whale",
            WalletBand::Humpback => "humpback",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletBandMetrics {
    pub band: WalletBand,
    pub supply_btc: f64,
    pub supply_pct: f64,
    pub address_count: u64,
    pub avg_balance: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletWavesResult {
    pub block_height: u64,
    pub total_supply_btc: f64,
    pub bands: Vec<WalletBandMetrics>,
    pub retail_supply_pct: f64,
    pub institutional_supply_pct: f64,
    pub address_count_total: u64,
    pub null_address_btc: f64,
    pub confidence: f64,
}

/// Address balances (as of `block`) bucketed into the six bands. Supply at
/// unaddressable scripts cannot be banded; it reduces confidence instead of
/// being attributed anywhere.
pub fn calculate_wallet_waves(conn: &Connection, block: u64) -> Result<WalletWavesResult> {
    let mut stmt = conn.prepare_cached(
        "WITH address_balances AS (
             SELECT address, SUM(btc_value) AS balance
             FROM utxo_lifecycle_full
             WHERE creation_block <= ?1
               AND (is_spent = 0 OR spent_block > ?1)
               AND address IS NOT NULL
             GROUP BY address
             HAVING balance > 0
         )
         SELECT
             CASE
                 WHEN balance < 1 THEN 'shrimp'
                 WHEN balance < 10 THEN 'crab'
                 WHEN balance < 100 THEN 'fish'
                 WHEN balance < 1000 THEN 'shark'
                 WHEN balance < 10000 THEN 'whale'
                 ELSE 'humpback'
             END AS band,
             COUNT(*),
             SUM(balance),
             AVG(balance)
         FROM address_balances
         GROUP BY band",
    )?;
    let rows: Vec<(String, u64, f64, f64)> = stmt
        .query_map(params![block], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let (total_supply, null_address_btc): (f64, f64) = conn.query_row(
        "SELECT
             COALESCE(SUM(btc_value), 0),
             COALESCE(SUM(CASE WHEN address IS NULL THEN btc_value ELSE 0 END), 0)
         FROM utxo_lifecycle_full
         WHERE creation_block <= ?1
           AND (is_spent = 0 OR spent_block > ?1)",
        params![block],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    let mut bands = Vec::with_capacity(6);
    let mut address_count_total = 0u64;
    let mut retail_pct = 0.0;
    let mut institutional_pct = 0.0;
    for band in WalletBand::ALL {
        let (count, supply, avg) = rows
            .iter()
            .find(|(key, ..)| key == band.key())
            .map(|&(_, c, s, a)| (c, s, a))
            .unwrap_or((0, 0.0, 0.0));
        let supply_pct = if total_supply > 0.0 { supply / total_supply * 100.0 } else { 0.0 };
        if band.is_retail() {
            retail_pct += supply_pct;
        } else {
            institutional_pct += supply_pct;
        }
        address_count_total += count;
        bands.push(WalletBandMetrics {
            band,
            supply_btc: supply,
            supply_pct,
            address_count: count,
            avg_balance: avg,
        });
    }

    let confidence = if total_supply > 0.0 {
        (1.0 - null_address_btc / total_supply).max(0.5)
    } else {
        0.0
    };

    Ok(WalletWavesResult {
        block_height: block,
        total_supply_btc: total_supply,
        bands,
        retail_supply_pct: retail_pct,
        institutional_supply_pct: institutional_pct,
        address_count_total,
        null_address_btc,
        confidence,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct AbsorptionBandMetrics {
    pub band: WalletBand,
    /// Null when no historical snapshot exists to difference against.
    pub absorption_rate: Option<f64>,
    pub supply_delta_btc: f64,
    pub supply_start_btc: f64,
    pub supply_end_btc: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AbsorptionRatesResult {
    pub block_height: u64,
    pub window_days: u64,
    pub mined_supply_btc: f64,
    pub bands: Vec<AbsorptionBandMetrics>,
    pub dominant_absorber: WalletBand,
    pub retail_absorption: f64,
    pub institutional_absorption: f64,
    pub confidence: f64,
    pub has_historical_data: bool,
}

/// New issuance over the window, `block_reward x 144 x days`.
pub fn mined_supply(window_days: u64) -> Result<f64> {
    anyhow::ensure!(window_days > 0, "window must be positive");
    Ok(BLOCK_REWARD_BTC * BLOCKS_PER_DAY as f64 * window_days as f64)
}

/// Each band's share of the window's issuance it absorbed; the dominant
/// absorber is the argmax.
pub fn calculate_absorption_rates(
    current: &WalletWavesResult,
    historical: Option<&WalletWavesResult>,
    window_days: u64,
) -> Result<AbsorptionRatesResult> {
    let mined = mined_supply(window_days)?;
    let has_historical = historical.is_some();

    let mut bands = Vec::with_capacity(6);
    let mut dominant = WalletBand::Shrimp;
    let mut best_rate = f64::NEG_INFINITY;
    let mut retail_delta = 0.0;
    let mut institutional_delta = 0.0;

    for band in WalletBand::ALL {
        let end = current
            .bands
            .iter()
            .find(|b| b.band == band)
            .map_or(0.0, |b| b.supply_btc);
        let (start, delta, rate) = match historical {
            Some(past) => {
                let start = past
                    .bands
                    .iter()
                    .find(|b| b.band == band)
                    .map_or(0.0, |b| b.supply_btc);
                let delta = end - start;
                (start, delta, Some(delta / mined))
            }
            None => (0.0, 0.0, None),
        };
        if let Some(rate) = rate {
            if rate > best_rate {
                best_rate = rate;
                dominant = band;
            }
            if band.is_retail() {
                retail_delta += delta;
            } else {
                institutional_delta += delta;
            }
        }
        bands.push(AbsorptionBandMetrics {
            band,
            absorption_rate: rate,
            supply_delta_btc: delta,
            supply_start_btc: start,
            supply_end_btc: end,
        });
    }

    Ok(AbsorptionRatesResult {
        block_height: current.block_height,
        window_days,
        mined_supply_btc: mined,
        bands,
        dominant_absorber: dominant,
        retail_absorption: if has_historical { retail_delta / mined } else { 0.0 },
        institutional_absorption: if has_historical { institutional_delta / mined } else { 0.0 },
        confidence: if has_historical { 0.85 } else { 0.3 },
        has_historical_data: has_historical,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct HodlBandMetrics {
    pub label: &'static str,
    pub supply_btc: f64,
    pub supply_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HodlWavesResult {
    pub block_height: u64,
    pub total_supply_btc: f64,
    pub bands: Vec<HodlBandMetrics>,
}

const HODL_BANDS: [(&str, f64, f64); 10] = [
    ("<1d", 0.0, 1.0),
    ("1d-1w", 1.0, 7.0),
    ("1w-1m", 7.0, 30.0),
    ("1m-3m", 30.0, 90.0),
    ("3m-6m", 90.0, 180.0),
    ("6m-1y", 180.0, 365.0),
    ("1y-2y", 365.0, 730.0),
    ("2y-3y", 730.0, 1095.0),
    ("3y-5y", 1095.0, 1825.0),
    (">=5y", 1825.0, f64::INFINITY),
];

/// Unspent supply (as of `block`) bucketed by coin age at `as_of_ts`.
pub fn calculate_hodl_waves(conn: &Connection, block: u64, as_of_ts: i64) -> Result<HodlWavesResult> {
    let mut stmt = conn.prepare_cached(
        "SELECT (?2 - creation_timestamp) / 86400.0 AS age, SUM(btc_value)
         FROM utxo_lifecycle_full
         WHERE creation_block <= ?1
           AND (is_spent = 0 OR spent_block > ?1)
           AND creation_timestamp IS NOT NULL
         GROUP BY CAST((?2 - creation_timestamp) / 86400.0 AS INTEGER)",
    )?;
    let rows: Vec<(f64, f64)> = stmt
        .query_map(params![block, as_of_ts], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut sums = [0.0f64; HODL_BANDS.len()];
    let mut total = 0.0;
    for (age, btc) in rows {
        total += btc;
        for (i, &(_, lo, hi)) in HODL_BANDS.iter().enumerate() {
            if age >= lo && age < hi {
                sums[i] += btc;
                break;
            }
        }
    }

    let bands = HODL_BANDS
        .iter()
        .zip(sums)
        .map(|(&(label, ..), supply)| HodlBandMetrics {
            label,
            supply_btc: supply,
            supply_pct: if total > 0.0 { supply / total * 100.0 } else { 0.0 },
        })
        .collect();

    Ok(HodlWavesResult { block_height: block, total_supply_btc: total, bands })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_classification_boundaries() {
        assert_eq!(WalletBand::classify(0.5).unwrap(), WalletBand::Shrimp);
        assert_eq!(WalletBand::classify(1.0).unwrap(), WalletBand::Crab);
        assert_eq!(WalletBand::classify(99.9).unwrap(), WalletBand::Fish);
        assert_eq!(WalletBand::classify(100.0).unwrap(), WalletBand::Shark);
        assert_eq!(WalletBand::classify(5_000.0).unwrap(), WalletBand::Whale);
        assert_eq!(WalletBand::classify(10_000.0).unwrap(), WalletBand::Humpback);
        assert!(WalletBand::classify(-1.0).is_err());
    }

    #[test]
    fn issuance_matches_reward_schedule() {
        // 3.125 x 144 x 30
        assert!((mined_supply(30).unwrap() - 13_500.0).abs() < 1e-9);
        assert!(mined_supply(0).is_err());
    }

    fn snapshot(block: u64, shrimp: f64, humpback: f64) -> WalletWavesResult {
        let mut bands = Vec::new();
        for band in WalletBand::ALL {
            let supply = match band {
                WalletBand::Shrimp => shrimp,
                WalletBand::Humpback => humpback,
                _ => 0.0,
            };
            bands.push(WalletBandMetrics {
                band,
                supply_btc: supply,
                supply_pct: 0.0,
                address_count: 0,
                avg_balance: 0.0,
            });
        }
        WalletWavesResult {
            block_height: block,
            total_supply_btc: shrimp + humpback,
            bands,
            retail_supply_pct: 0.0,
            institutional_supply_pct: 0.0,
            address_count_total: 0,
            null_address_btc: 0.0,
            confidence: 1.0,
        }
    }

    #[test]
    fn dominant_absorber_is_the_argmax() {
        let past = snapshot(800_000, 1_000.0, 5_000.0);
        let now = snapshot(804_320, 1_500.0, 18_000.0);
        let result = calculate_absorption_rates(&now, Some(&past), 30).unwrap();
        assert_eq!(result.dominant_absorber, WalletBand::Humpback);
        assert!(result.has_historical_data);
        // Humpback absorbed 13,000 of the 13,500 BTC mined.
        let humpback = result.bands.iter().find(|b| b.band == WalletBand::Humpback).unwrap();
        assert!((humpback.absorption_rate.unwrap() - 13_000.0 / 13_500.0).abs() < 1e-9);
    }

    #[test]
    fn missing_history_yields_null_rates() {
        let now = snapshot(804_320, 1_500.0, 18_000.0);
        let result = calculate_absorption_rates(&now, None, 30).unwrap();
        assert!(!result.has_historical_data);
        assert!(result.bands.iter().all(|b| b.absorption_rate.is_none()));
        assert!((result.confidence - 0.3).abs() < 1e-9);
    }
}
