//! STH/LTH cost basis: volume-weighted average acquisition price per holder
//! cohort, plus per-cohort MVRV. The cost basis levels act as support and
//! resistance; price under the STH basis reads as capitulation risk, price
//! over the LTH basis as distribution risk.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use super::consts::STH_THRESHOLD_BLOCKS;

#[derive(Debug, Clone, Serialize)]
pub struct CostBasisResult {
    pub sth_cost_basis: f64,
    pub lth_cost_basis: f64,
    pub total_cost_basis: f64,
    pub sth_mvrv: f64,
    pub lth_mvrv: f64,
    pub sth_supply_btc: f64,
    pub lth_supply_btc: f64,
    pub current_price_usd: f64,
    pub confidence: f64,
}

/// Weighted basis and supply over unspent UTXOs (as of `block`) filtered by
/// a creation-block predicate. Zero when the cohort is empty.
fn cohort_basis(
    conn: &Connection,
    block: u64,
    cutoff_block: u64,
    short_term: bool,
) -> Result<(f64, f64)> {
    let predicate = if short_term { "creation_block > ?2" } else { "creation_block <= ?2" };
    let sql = format!(
        "SELECT
             COALESCE(SUM(realized_value_usd) / NULLIF(SUM(btc_value), 0), 0),
             COALESCE(SUM(btc_value), 0)
         FROM utxo_lifecycle_full
         WHERE creation_block <= ?1
           AND (is_spent = 0 OR spent_block > ?1)
           AND {predicate}
           AND creation_price_usd IS NOT NULL
           AND btc_value > 0"
    );
    let row = conn.query_row(&sql, params![block, cutoff_block], |r| {
        Ok((r.get(0)?, r.get(1)?))
    })?;
    Ok(row)
}

fn basis_mvrv(current_price: f64, cost_basis: f64) -> f64 {
    if cost_basis <= 0.0 || current_price <= 0.0 {
        return 0.0;
    }
    current_price / cost_basis
}

pub fn calculate_cost_basis_signal(
    conn: &Connection,
    block: u64,
    current_price_usd: f64,
) -> Result<CostBasisResult> {
    let cutoff_block = block.saturating_sub(STH_THRESHOLD_BLOCKS);

    let (sth_cost_basis, sth_supply_btc) = cohort_basis(conn, block, cutoff_block, true)?;
    let (lth_cost_basis, lth_supply_btc) = cohort_basis(conn, block, cutoff_block, false)?;
    let total_cost_basis: f64 = conn.query_row(
        "SELECT COALESCE(SUM(realized_value_usd) / NULLIF(SUM(btc_value), 0), 0)
         FROM utxo_lifecycle_full
         WHERE creation_block <= ?1
           AND (is_spent = 0 OR spent_block > ?1)
           AND creation_price_usd IS NOT NULL
           AND btc_value > 0",
        params![block],
        |r| r.get(0),
    )?;

    let total_supply = sth_supply_btc + lth_supply_btc;
    let confidence = if total_supply > 0.0 && sth_cost_basis > 0.0 && lth_cost_basis > 0.0 {
        0.85
    } else if total_supply > 0.0 {
        0.5
    } else {
        0.0
    };

    Ok(CostBasisResult {
        sth_cost_basis,
        lth_cost_basis,
        total_cost_basis,
        sth_mvrv: basis_mvrv(current_price_usd, sth_cost_basis),
        lth_mvrv: basis_mvrv(current_price_usd, lth_cost_basis),
        sth_supply_btc,
        lth_supply_btc,
        current_price_usd,
        confidence,
    })
}
