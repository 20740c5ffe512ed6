//! Address balance cohorts: cost basis, MVRV and supply segmented by
//! address size (retail < 1 BTC, mid-tier 1-100, whale >= 100). Whales
//! holding a lower cost basis than retail reads as smart-money conviction.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressCohort {
    Retail,
    MidTier,
    Whale,
}

impl AddressCohort {
    fn key(self) -> &'static str {
        match self {
            AddressCohort::Retail => "retail",
            AddressCohort::MidTier => "mid_tier",
            AddressCohort::Whale => "whale",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CohortMetrics {
    pub cohort: AddressCohort,
    pub cost_basis: f64,
    pub supply_btc: f64,
    pub supply_pct: f64,
    pub mvrv: f64,
    pub address_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddressCohortsResult {
    pub block_height: u64,
    pub current_price_usd: f64,
    pub retail: CohortMetrics,
    pub mid_tier: CohortMetrics,
    pub whale: CohortMetrics,
    /// whale cost basis minus retail cost basis; negative means whales
    /// bought cheaper.
    pub whale_retail_spread: f64,
    /// whale MVRV over retail MVRV; 0 when retail MVRV is 0.
    pub whale_retail_mvrv_ratio: f64,
    pub total_supply_btc: f64,
    pub total_addresses: u64,
}

fn cohort_mvrv(current_price: f64, cost_basis: f64) -> f64 {
    if cost_basis <= 0.0 || current_price <= 0.0 {
        return 0.0;
    }
    current_price / cost_basis
}

/// Two-stage aggregation: balances per address, then cohort rollups with a
/// volume-weighted cost basis per cohort.
pub fn calculate_address_cohorts(
    conn: &Connection,
    block: u64,
    current_price_usd: f64,
) -> Result<AddressCohortsResult> {
    let mut stmt = conn.prepare_cached(
        "WITH address_balances AS (
             SELECT
                 address,
                 SUM(btc_value) AS balance,
                 SUM(creation_price_usd * btc_value) AS cost_numerator
             FROM utxo_lifecycle_full
             WHERE creation_block <= ?1
               AND (is_spent = 0 OR spent_block > ?1)
               AND address IS NOT NULL
               AND creation_price_usd IS NOT NULL
               AND btc_value > 0
             GROUP BY address
         )
         SELECT
             CASE
                 WHEN balance < 1 THEN 'retail'
                 WHEN balance < 100 THEN 'mid_tier'
                 ELSE 'whale'
             END AS cohort,
             COALESCE(SUM(cost_numerator) / NULLIF(SUM(balance), 0), 0),
             COALESCE(SUM(balance), 0),
             COUNT(*)
         FROM address_balances
         GROUP BY cohort",
    )?;
    let rows: Vec<(String, f64, f64, u64)> = stmt
        .query_map(params![block], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let total_supply: f64 = rows.iter().map(|&(_, _, s, _)| s).sum();
    let total_addresses: u64 = rows.iter().map(|&(.., c)| c).sum();

    let build = |cohort: AddressCohort| -> CohortMetrics {
        let (cost_basis, supply, count) = rows
            .iter()
            .find(|(key, ..)| key == cohort.key())
            .map(|&(_, cb, s, c)| (cb, s, c))
            .unwrap_or((0.0, 0.0, 0));
        CohortMetrics {
            cohort,
            cost_basis,
            supply_btc: supply,
            supply_pct: if total_supply > 0.0 { supply / total_supply * 100.0 } else { 0.0 },
            mvrv: cohort_mvrv(current_price_usd, cost_basis),
            address_count: count,
        }
    };

    let retail = build(AddressCohort::Retail);
    let mid_tier = build(AddressCohort::MidTier);
    let whale = build(AddressCohort::Whale);

    let whale_retail_spread = whale.cost_basis - retail.cost_basis;
    let whale_retail_mvrv_ratio = if retail.mvrv > 0.0 { whale.mvrv / retail.mvrv } else { 0.0 };

    Ok(AddressCohortsResult {
        block_height: block,
        current_price_usd,
        retail,
        mid_tier,
        whale,
        whale_retail_spread,
        whale_retail_mvrv_ratio,
        total_supply_btc: total_supply,
        total_addresses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mvrv_guards() {
        assert_eq!(cohort_mvrv(95_000.0, 0.0), 0.0);
        assert_eq!(cohort_mvrv(-100.0, 50_000.0), 0.0);
        assert!((cohort_mvrv(95_000.0, 50_000.0) - 1.9).abs() < 1e-12);
    }
}
