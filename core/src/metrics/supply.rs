//! Supply profit/loss split with STH/LTH segmentation and market phase.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use super::consts::STH_THRESHOLD_BLOCKS;

/// Market phase by percent of supply in profit. Thresholds from historical
/// cycle analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketPhase {
    Euphoria,
    Bull,
    Transition,
    Capitulation,
}

impl MarketPhase {
    pub fn classify(pct_in_profit: f64) -> Self {
        if pct_in_profit >= 95.0 {
            MarketPhase::Euphoria
        } else if pct_in_profit >= 80.0 {
            MarketPhase::Bull
        } else if pct_in_profit >= 50.0 {
            MarketPhase::Transition
        } else {
            MarketPhase::Capitulation
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SupplyProfitLossResult {
    pub current_price_usd: f64,
    pub total_supply_btc: f64,
    pub supply_in_profit_btc: f64,
    pub supply_in_loss_btc: f64,
    pub supply_breakeven_btc: f64,
    pub pct_in_profit: f64,
    pub pct_in_loss: f64,
    pub pct_breakeven: f64,
    pub sth_in_profit_btc: f64,
    pub sth_in_loss_btc: f64,
    pub sth_pct_in_profit: f64,
    pub lth_in_profit_btc: f64,
    pub lth_in_loss_btc: f64,
    pub lth_pct_in_profit: f64,
    pub market_phase: MarketPhase,
    pub signal_strength: f64,
}

/// Signal strength grows with distance from the 50% neutral line and gets a
/// bump at the extremes where reversals cluster.
fn signal_strength(pct_in_profit: f64) -> f64 {
    let mut strength = ((pct_in_profit - 50.0).abs() / 50.0).min(1.0);
    if pct_in_profit >= 95.0 || pct_in_profit <= 5.0 {
        strength = (strength + 0.2).min(1.0);
    } else if pct_in_profit >= 90.0 || pct_in_profit <= 10.0 {
        strength = (strength + 0.1).min(1.0);
    }
    strength
}

/// Partition unspent supply (as of `block`) into profit / loss / breakeven
/// against the current price, split by holder cohort. The cohort boundary
/// is the 22,320-block STH/LTH cutoff; breakeven counts toward the profit
/// side of each cohort.
pub fn calculate_supply_profit_loss(
    conn: &Connection,
    block: u64,
    current_price_usd: f64,
) -> Result<SupplyProfitLossResult> {
    let cutoff_block = block.saturating_sub(STH_THRESHOLD_BLOCKS);

    let mut stmt = conn.prepare_cached(
        "SELECT
             CASE
                 WHEN creation_price_usd < ?2 THEN 'PROFIT'
                 WHEN creation_price_usd > ?2 THEN 'LOSS'
                 ELSE 'BREAKEVEN'
             END AS status,
             CASE WHEN creation_block > ?3 THEN 'STH' ELSE 'LTH' END AS cohort,
             SUM(btc_value)
         FROM utxo_lifecycle_full
         WHERE creation_block <= ?1
           AND (is_spent = 0 OR spent_block > ?1)
           AND creation_price_usd IS NOT NULL
         GROUP BY status, cohort",
    )?;
    let groups: Vec<(String, String, f64)> = stmt
        .query_map(params![block, current_price_usd, cutoff_block], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut in_profit = 0.0;
    let mut in_loss = 0.0;
    let mut breakeven = 0.0;
    let mut sth_profit = 0.0;
    let mut sth_loss = 0.0;
    let mut lth_profit = 0.0;
    let mut lth_loss = 0.0;

    for (status, cohort, btc) in groups {
        let sth = cohort == "STH";
        match status.as_str() {
            "PROFIT" => {
                in_profit += btc;
                if sth { sth_profit += btc } else { lth_profit += btc }
            }
            "LOSS" => {
                in_loss += btc;
                if sth { sth_loss += btc } else { lth_loss += btc }
            }
            _ => {
                breakeven += btc;
                if sth { sth_profit += btc } else { lth_profit += btc }
            }
        }
    }

    let total = in_profit + in_loss + breakeven;
    if total <= 0.0 {
        // Empty cohort: neutral sentinels rather than an error.
        return Ok(SupplyProfitLossResult {
            current_price_usd,
            total_supply_btc: 0.0,
            supply_in_profit_btc: 0.0,
            supply_in_loss_btc: 0.0,
            supply_breakeven_btc: 0.0,
            pct_in_profit: 0.0,
            pct_in_loss: 0.0,
            pct_breakeven: 0.0,
            sth_in_profit_btc: 0.0,
            sth_in_loss_btc: 0.0,
            sth_pct_in_profit: 0.0,
            lth_in_profit_btc: 0.0,
            lth_in_loss_btc: 0.0,
            lth_pct_in_profit: 0.0,
            market_phase: MarketPhase::Capitulation,
            signal_strength: 0.0,
        });
    }

    let sth_total = sth_profit + sth_loss;
    let lth_total = lth_profit + lth_loss;
    let pct_in_profit = in_profit / total * 100.0;

    Ok(SupplyProfitLossResult {
        current_price_usd,
        total_supply_btc: total,
        supply_in_profit_btc: in_profit,
        supply_in_loss_btc: in_loss,
        supply_breakeven_btc: breakeven,
        pct_in_profit,
        pct_in_loss: in_loss / total * 100.0,
        pct_breakeven: breakeven / total * 100.0,
        sth_in_profit_btc: sth_profit,
        sth_in_loss_btc: sth_loss,
        sth_pct_in_profit: if sth_total > 0.0 { sth_profit / sth_total * 100.0 } else { 0.0 },
        lth_in_profit_btc: lth_profit,
        lth_in_loss_btc: lth_loss,
        lth_pct_in_profit: if lth_total > 0.0 { lth_profit / lth_total * 100.0 } else { 0.0 },
        market_phase: MarketPhase::classify(pct_in_profit),
        signal_strength: signal_strength(pct_in_profit),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_boundaries() {
        assert_eq!(MarketPhase::classify(96.0), MarketPhase::Euphoria);
        assert_eq!(MarketPhase::classify(95.0), MarketPhase::Euphoria);
        assert_eq!(MarketPhase::classify(94.9), MarketPhase::Bull);
        assert_eq!(MarketPhase::classify(80.0), MarketPhase::Bull);
        assert_eq!(MarketPhase::classify(60.0), MarketPhase::Transition);
        assert_eq!(MarketPhase::classify(49.9), MarketPhase::Capitulation);
    }

    #[test]
    fn strength_peaks_at_extremes() {
        assert!(signal_strength(50.0) < 0.01);
        assert!(signal_strength(96.0) > signal_strength(85.0));
        assert!((signal_strength(100.0) - 1.0).abs() < 1e-9);
        assert!(signal_strength(3.0) > 0.9);
    }
}
