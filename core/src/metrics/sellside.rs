//! Sell-side risk: realized profit against market cap, plus the realized
//! P/L aggregates (net realized P/L and the profit/loss ratio).

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SellSideZone {
    Low,
    Normal,
    Elevated,
    Aggressive,
}

impl SellSideZone {
    fn classify(risk_pct: f64) -> (Self, f64) {
        if risk_pct < 0.1 {
            (SellSideZone::Low, 0.7)
        } else if risk_pct < 0.3 {
            (SellSideZone::Normal, 0.6)
        } else if risk_pct < 1.0 {
            (SellSideZone::Elevated, 0.75)
        } else {
            (SellSideZone::Aggressive, 0.85)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SellSideRiskResult {
    pub sell_side_risk: f64,
    pub sell_side_risk_pct: f64,
    pub realized_profit_usd: f64,
    pub realized_loss_usd: f64,
    pub net_realized_pnl_usd: f64,
    /// Realized profit over realized loss; null when no losses were taken.
    pub profit_loss_ratio: Option<f64>,
    pub market_cap_usd: f64,
    pub window_days: u64,
    pub spent_utxos_in_window: u64,
    pub signal_zone: SellSideZone,
    pub confidence: f64,
}

/// Realized profit is `SUM(max(0, spend_price - creation_price) x btc)`
/// over UTXOs spent in `[start_ts, end_ts)`; realized loss is the mirror.
pub fn calculate_sell_side_risk(
    conn: &Connection,
    market_cap_usd: f64,
    start_ts: i64,
    end_ts: i64,
    window_days: u64,
) -> Result<SellSideRiskResult> {
    let (profit, loss, count): (f64, f64, u64) = conn.query_row(
        "SELECT
             COALESCE(SUM(CASE
                 WHEN spent_price_usd > creation_price_usd
                 THEN (spent_price_usd - creation_price_usd) * btc_value
                 ELSE 0 END), 0),
             COALESCE(SUM(CASE
                 WHEN spent_price_usd < creation_price_usd
                 THEN (creation_price_usd - spent_price_usd) * btc_value
                 ELSE 0 END), 0),
             COUNT(*)
         FROM utxo_lifecycle_full
         WHERE is_spent = 1
           AND spent_timestamp >= ?1 AND spent_timestamp < ?2
           AND spent_price_usd IS NOT NULL
           AND creation_price_usd IS NOT NULL",
        params![start_ts, end_ts],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;

    let sell_side_risk = if market_cap_usd > 0.0 { profit / market_cap_usd } else { 0.0 };
    let risk_pct = sell_side_risk * 100.0;
    let (signal_zone, confidence) = SellSideZone::classify(risk_pct);

    Ok(SellSideRiskResult {
        sell_side_risk,
        sell_side_risk_pct: risk_pct,
        realized_profit_usd: profit,
        realized_loss_usd: loss,
        net_realized_pnl_usd: profit - loss,
        profit_loss_ratio: (loss > 0.0).then(|| profit / loss),
        market_cap_usd,
        window_days,
        spent_utxos_in_window: count,
        signal_zone,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_boundaries() {
        assert_eq!(SellSideZone::classify(0.05).0, SellSideZone::Low);
        assert_eq!(SellSideZone::classify(0.2).0, SellSideZone::Normal);
        assert_eq!(SellSideZone::classify(0.5).0, SellSideZone::Elevated);
        assert_eq!(SellSideZone::classify(1.5).0, SellSideZone::Aggressive);
    }
}
