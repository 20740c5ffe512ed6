//! URPD: distribution of unspent supply over cost-basis price buckets.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct UrpdBucket {
    pub price_low: f64,
    pub price_high: f64,
    pub btc_amount: f64,
    pub utxo_count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UrpdResult {
    pub buckets: Vec<UrpdBucket>,
    pub bucket_size_usd: f64,
    pub total_supply_btc: f64,
    pub current_price_usd: f64,
    pub supply_above_price_btc: f64,
    pub supply_below_price_btc: f64,
    pub supply_above_price_pct: f64,
    pub supply_below_price_pct: f64,
    pub dominant_bucket: Option<UrpdBucket>,
}

/// Histogram of unspent `btc_value` (as of `block`) over buckets of
/// `bucket_size_usd` on the creation price, split into supply above vs
/// below the current price. A bucket straddling the current price goes to
/// whichever side its midpoint falls on. Rows without a creation price are
/// excluded rather than guessed.
pub fn calculate_urpd(
    conn: &Connection,
    block: u64,
    current_price_usd: f64,
    bucket_size_usd: f64,
) -> Result<UrpdResult> {
    anyhow::ensure!(bucket_size_usd > 0.0, "bucket size must be positive");

    let mut stmt = conn.prepare_cached(
        // Prices are non-negative, so integer truncation is floor here.
        "SELECT
             CAST(creation_price_usd / ?2 AS INTEGER) * ?2 AS price_bucket,
             SUM(btc_value) AS btc_in_bucket,
             COUNT(*) AS utxo_count
         FROM utxo_lifecycle_full
         WHERE creation_block <= ?1
           AND (is_spent = 0 OR spent_block > ?1)
           AND creation_price_usd IS NOT NULL
         GROUP BY price_bucket
         ORDER BY price_bucket DESC",
    )?;
    let raw: Vec<(f64, f64, u64)> = stmt
        .query_map(params![block, bucket_size_usd], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let total_supply: f64 = raw.iter().map(|&(_, btc, _)| btc).sum();
    if total_supply <= 0.0 {
        return Ok(UrpdResult {
            buckets: Vec::new(),
            bucket_size_usd,
            total_supply_btc: 0.0,
            current_price_usd,
            supply_above_price_btc: 0.0,
            supply_below_price_btc: 0.0,
            supply_above_price_pct: 0.0,
            supply_below_price_pct: 0.0,
            dominant_bucket: None,
        });
    }

    let mut buckets = Vec::with_capacity(raw.len());
    let mut supply_above = 0.0;
    let mut supply_below = 0.0;
    let mut dominant: Option<UrpdBucket> = None;

    for (price_low, btc_amount, utxo_count) in raw {
        let price_high = price_low + bucket_size_usd;
        let bucket = UrpdBucket {
            price_low,
            price_high,
            btc_amount,
            utxo_count,
            percentage: btc_amount / total_supply * 100.0,
        };

        if price_high <= current_price_usd {
            supply_below += btc_amount;
        } else if price_low >= current_price_usd {
            supply_above += btc_amount;
        } else {
            let midpoint = (price_low + price_high) / 2.0;
            if midpoint < current_price_usd {
                supply_below += btc_amount;
            } else {
                supply_above += btc_amount;
            }
        }

        if dominant.as_ref().map_or(true, |d| btc_amount > d.btc_amount) {
            dominant = Some(bucket.clone());
        }
        buckets.push(bucket);
    }

    Ok(UrpdResult {
        buckets,
        bucket_size_usd,
        total_supply_btc: total_supply,
        current_price_usd,
        supply_above_price_btc: supply_above,
        supply_below_price_btc: supply_below,
        supply_above_price_pct: supply_above / total_supply * 100.0,
        supply_below_price_pct: supply_below / total_supply * 100.0,
        dominant_bucket: dominant,
    })
}
