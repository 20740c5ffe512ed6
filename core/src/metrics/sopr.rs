//! SOPR: spent-output profit ratio over a block range.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SoprResult {
    pub sopr: Option<f64>,
    pub start_block: u64,
    pub end_block: u64,
    pub total_spent_usd: f64,
    pub total_created_usd: f64,
    pub spent_count: u64,
    /// True when the stored spend price was missing and the date-price join
    /// filled it.
    pub used_price_fallback: bool,
}

/// `SUM(btc x spend_price) / SUM(btc x creation_price)` over UTXOs spent in
/// `[start_block, end_block]`. A missing `spent_price_usd` falls back to
/// joining the spend block to its date's price bar. Null when nothing
/// qualifying was spent.
pub fn sopr_for_range(conn: &Connection, start_block: u64, end_block: u64) -> Result<SoprResult> {
    let (spent, created, count): (f64, f64, u64) = conn.query_row(
        "SELECT
             COALESCE(SUM(btc_value * spent_price_usd), 0),
             COALESCE(SUM(realized_value_usd), 0),
             COUNT(*)
         FROM utxo_lifecycle_full
         WHERE is_spent = 1
           AND spent_block BETWEEN ?1 AND ?2
           AND realized_value_usd > 0
           AND spent_price_usd IS NOT NULL",
        params![start_block, end_block],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;

    if spent > 0.0 && created > 0.0 {
        return Ok(SoprResult {
            sopr: Some(spent / created),
            start_block,
            end_block,
            total_spent_usd: spent,
            total_created_usd: created,
            spent_count: count,
            used_price_fallback: false,
        });
    }

    // Fallback: resolve the spend price through block_heights/daily_prices.
    let (spent, created, count): (f64, f64, u64) = conn.query_row(
        "SELECT
             COALESCE(SUM(u.btc_value * dp.price_usd), 0),
             COALESCE(SUM(u.realized_value_usd), 0),
             COUNT(*)
         FROM utxo_lifecycle_full u
         JOIN block_heights bh ON bh.height = u.spent_block
         JOIN daily_prices dp ON dp.date = date(bh.timestamp, 'unixepoch')
         WHERE u.is_spent = 1
           AND u.spent_block BETWEEN ?1 AND ?2
           AND u.realized_value_usd > 0",
        params![start_block, end_block],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;

    Ok(SoprResult {
        sopr: (created > 0.0).then(|| spent / created),
        start_block,
        end_block,
        total_spent_usd: spent,
        total_created_usd: created,
        spent_count: count,
        used_price_fallback: true,
    })
}
