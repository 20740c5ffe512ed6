//! Metric engine: every metric is a deterministic query over the store,
//! evaluated as of a block height or date passed in explicitly. Nothing in
//! here reads the wall clock; identical store contents and prices always
//! produce identical outputs.
//!
//! Shared contracts: required inputs that are missing propagate as nulls
//! (never fabricated), each output carries a confidence scalar in [0,1],
//! and invariant breaches inside a metric (zero std, division by zero,
//! empty cohort) yield documented sentinels instead of errors.

pub mod consts;

mod activity;
mod cdd;
mod cohort_basis;
mod cohorts;
mod netflow;
mod realized;
mod reserve;
mod revived;
mod sellside;
mod sopr;
mod supply;
mod urpd;
mod waves;

pub use activity::{
    calculate_active_addresses, calculate_tx_volume, detect_active_address_anomaly,
    estimate_real_volume, historical_active_counts, ActiveAddressesResult, TxVolumeResult,
    ACTIVE_ADDRESSES_METRIC,
};
pub use cdd::{
    calculate_binary_cdd, calculate_cdd_vdd, daily_cdd_series, BinaryCddResult, CddSignalZone,
    CddVddResult,
};
pub use cohort_basis::{calculate_cost_basis_signal, CostBasisResult};
pub use cohorts::{calculate_address_cohorts, AddressCohort, AddressCohortsResult, CohortMetrics};
pub use netflow::{
    calculate_exchange_netflow, classify_netflow_zone, load_exchange_addresses,
    ExchangeNetflowResult, NetflowZone,
};
pub use realized::{
    calculate_realized_snapshot, market_cap, mvrv, mvrv_z, nupl, realized_cap_as_of,
    unspent_supply_as_of, NuplZone, RealizedSnapshot,
};
pub use reserve::{calculate_reserve_risk, liveliness_as_of, ReserveRiskResult, ReserveRiskZone};
pub use revived::{calculate_revived_supply, classify_revived_zone, RevivedSupplyResult, RevivedZone};
pub use sellside::{calculate_sell_side_risk, SellSideRiskResult, SellSideZone};
pub use sopr::{sopr_for_range, SoprResult};
pub use supply::{calculate_supply_profit_loss, MarketPhase, SupplyProfitLossResult};
pub use urpd::{calculate_urpd, UrpdBucket, UrpdResult};
pub use waves::{
    calculate_absorption_rates, calculate_hodl_waves, calculate_wallet_waves,
    AbsorptionRatesResult, HodlWavesResult, WalletBand, WalletWavesResult,
};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;

use crate::pricing::PriceIndex;
use crate::store::{LifecycleStore, CONCERN_METRICS};

/// One persisted row: headline scalar plus the full record as JSON detail.
#[derive(Debug)]
pub struct MetricRow {
    pub name: &'static str,
    pub value: Option<f64>,
    pub detail: serde_json::Value,
    pub confidence: f64,
}

impl MetricRow {
    fn new<T: Serialize>(name: &'static str, value: Option<f64>, detail: &T, confidence: f64) -> Result<Self> {
        Ok(Self {
            name,
            value,
            detail: serde_json::to_value(detail).with_context(|| format!("serializing {name}"))?,
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}

#[derive(Debug)]
pub struct DailyReport {
    pub date: NaiveDate,
    pub block_range: (u64, u64),
    pub rows_written: u64,
    pub price_usd: Option<f64>,
}

pub struct MetricEngine<'a> {
    store: &'a mut LifecycleStore,
    dry_run: bool,
}

impl<'a> MetricEngine<'a> {
    pub fn new(store: &'a mut LifecycleStore) -> Self {
        Self { store, dry_run: false }
    }

    pub fn dry_run(mut self, dry: bool) -> Self {
        self.dry_run = dry;
        self
    }

    /// Compute and persist the whole family for one date. Returns None when
    /// the height index has no blocks for the date (nothing to evaluate).
    pub fn compute_for_date(&mut self, date: NaiveDate) -> Result<Option<DailyReport>> {
        let rows;
        let block_range;
        let price;
        {
            let conn = self.store.conn();
            let idx = PriceIndex::new(conn);
            let Some(range) = idx.blocks_for_date(date)? else {
                tracing::warn!(%date, "no blocks indexed for date, skipping metrics");
                return Ok(None);
            };
            block_range = range;
            price = idx.price_for_date(date)?;
            if price.is_none() {
                tracing::warn!(%date, "no price bar for date, price-dependent metrics degrade");
            }
            let end_of_day = date
                .succ_opt()
                .context("date overflow")?
                .and_hms_opt(0, 0, 0)
                .context("invalid date")?
                .and_utc()
                .timestamp();
            rows = compute_family(conn, date, range, price, end_of_day)?;
        }

        let mut written = 0u64;
        if self.dry_run {
            for row in &rows {
                tracing::info!(metric = row.name, value = ?row.value, confidence = row.confidence, "dry run");
            }
        } else {
            for row in &rows {
                self.store.upsert_metric(
                    row.name,
                    date,
                    row.value,
                    &row.detail.to_string(),
                    row.confidence,
                    Some(block_range.1),
                )?;
                written += 1;
            }
            self.store.set_sync_state(CONCERN_METRICS, Some(block_range.1), Some(date))?;
        }

        Ok(Some(DailyReport {
            date,
            block_range,
            rows_written: written,
            price_usd: price,
        }))
    }
}

/// The full metric family for one date, computed against a read snapshot.
fn compute_family(
    conn: &rusqlite::Connection,
    date: NaiveDate,
    (start_block, end_block): (u64, u64),
    price: Option<f64>,
    as_of_ts: i64,
) -> Result<Vec<MetricRow>> {
    let mut rows = Vec::new();
    let day = 86_400i64;

    // Realized cap family.
    let snapshot = calculate_realized_snapshot(conn, end_block, price)?;
    rows.push(MetricRow::new("realized_cap", Some(snapshot.realized_cap_usd), &snapshot, snapshot.confidence)?);
    rows.push(MetricRow::new("market_cap", snapshot.market_cap_usd, &snapshot, snapshot.confidence)?);
    rows.push(MetricRow::new("mvrv", snapshot.mvrv, &snapshot, snapshot.confidence)?);
    rows.push(MetricRow::new("mvrv_z", snapshot.mvrv_z, &snapshot, snapshot.confidence)?);
    rows.push(MetricRow::new("nupl", snapshot.nupl, &snapshot, snapshot.confidence)?);

    // SOPR over the date's block range.
    let sopr = sopr_for_range(conn, start_block, end_block)?;
    let sopr_conf = if sopr.sopr.is_some() { 0.85 } else { 0.0 };
    rows.push(MetricRow::new("sopr", sopr.sopr, &sopr, sopr_conf)?);

    // Price-distribution and supply-split metrics need a price.
    if let Some(price) = price {
        let urpd = calculate_urpd(conn, end_block, price, consts::URPD_BUCKET_USD)?;
        let urpd_conf = if urpd.total_supply_btc > 0.0 { 0.85 } else { 0.0 };
        rows.push(MetricRow::new("urpd", urpd.dominant_bucket.as_ref().map(|b| b.price_low), &urpd, urpd_conf)?);

        let supply = calculate_supply_profit_loss(conn, end_block, price)?;
        rows.push(MetricRow::new(
            "supply_profit_loss",
            Some(supply.pct_in_profit),
            &supply,
            supply.signal_strength.max(0.5),
        )?);

        let basis = calculate_cost_basis_signal(conn, end_block, price)?;
        rows.push(MetricRow::new("cost_basis", Some(basis.total_cost_basis), &basis, basis.confidence)?);

        let reserve = calculate_reserve_risk(conn, end_block, as_of_ts, price, snapshot.mvrv)?;
        rows.push(MetricRow::new("reserve_risk", Some(reserve.reserve_risk), &reserve, reserve.confidence)?);

        if let Some(market_cap) = snapshot.market_cap_usd {
            let sell = calculate_sell_side_risk(
                conn,
                market_cap,
                as_of_ts - consts::DEFAULT_WINDOW_DAYS as i64 * day,
                as_of_ts,
                consts::DEFAULT_WINDOW_DAYS,
            )?;
            rows.push(MetricRow::new("sell_side_risk", Some(sell.sell_side_risk_pct), &sell, sell.confidence)?);
        }

        let revived = calculate_revived_supply(
            conn,
            as_of_ts - consts::DEFAULT_WINDOW_DAYS as i64 * day,
            as_of_ts,
            consts::DEFAULT_WINDOW_DAYS,
            price,
        )?;
        rows.push(MetricRow::new("revived_supply", Some(revived.revived_1y), &revived, revived.confidence)?);

        let cohorts = calculate_address_cohorts(conn, end_block, price)?;
        let cohorts_conf = if cohorts.total_supply_btc > 0.0 { 0.8 } else { 0.0 };
        rows.push(MetricRow::new("address_cohorts", Some(cohorts.whale.supply_btc), &cohorts, cohorts_conf)?);

        let volume = calculate_tx_volume(conn, as_of_ts - day, as_of_ts, Some(price))?;
        let volume_conf = if volume.tx_count > 0 { 0.8 } else { 0.5 };
        rows.push(MetricRow::new("tx_volume", Some(volume.volume_btc), &volume, volume_conf)?);
    }

    // Spend-window metrics work without a current price.
    let cdd = calculate_cdd_vdd(conn, as_of_ts - consts::DEFAULT_WINDOW_DAYS as i64 * day, as_of_ts, consts::DEFAULT_WINDOW_DAYS)?;
    rows.push(MetricRow::new("cdd_vdd", Some(cdd.cdd_total), &cdd, cdd.confidence)?);

    let binary = calculate_binary_cdd(
        conn,
        consts::BINARY_CDD_THRESHOLD,
        consts::BINARY_CDD_WINDOW_DAYS,
        as_of_ts,
    )?;
    let binary_conf = if binary.insufficient_data { 0.2 } else { 0.8 };
    rows.push(MetricRow::new("binary_cdd", Some(binary.binary_cdd as f64), &binary, binary_conf)?);

    let waves = calculate_wallet_waves(conn, end_block)?;
    rows.push(MetricRow::new("wallet_waves", Some(waves.total_supply_btc), &waves, waves.confidence)?);

    // Absorption needs a second snapshot one window earlier.
    if end_block > consts::BLOCKS_PER_DAY * consts::DEFAULT_WINDOW_DAYS {
        let past_block = end_block - consts::BLOCKS_PER_DAY * consts::DEFAULT_WINDOW_DAYS;
        let historical = calculate_wallet_waves(conn, past_block)?;
        let historical = (historical.total_supply_btc > 0.0).then_some(historical);
        let absorption = calculate_absorption_rates(&waves, historical.as_ref(), consts::DEFAULT_WINDOW_DAYS)?;
        rows.push(MetricRow::new(
            "absorption_rates",
            absorption.bands.iter().filter_map(|b| b.absorption_rate).reduce(f64::max),
            &absorption,
            absorption.confidence,
        )?);
    }

    let hodl = calculate_hodl_waves(conn, end_block, as_of_ts)?;
    let hodl_conf = if hodl.total_supply_btc > 0.0 { 0.85 } else { 0.0 };
    rows.push(MetricRow::new("hodl_waves", Some(hodl.total_supply_btc), &hodl, hodl_conf)?);

    // The anomaly check reads the trailing daily counts persisted for the
    // days before this one.
    let history = historical_active_counts(conn, date, activity::ANOMALY_LOOKBACK_DAYS)?;
    let active = calculate_active_addresses(conn, as_of_ts - day, as_of_ts, &history)?;
    let active_conf = if active.active_addresses > 0 { 0.8 } else { 0.5 };
    rows.push(MetricRow::new(
        ACTIVE_ADDRESSES_METRIC,
        Some(active.active_addresses as f64),
        &active,
        active_conf,
    )?);

    // Exchange netflow only when the address set is loaded.
    let netflow = calculate_exchange_netflow(conn, as_of_ts - day, as_of_ts, 24, price.unwrap_or(0.0))?;
    if netflow.address_count > 0 {
        rows.push(MetricRow::new("exchange_netflow", Some(netflow.netflow), &netflow, netflow.confidence)?);
    }

    tracing::debug!(%date, rows = rows.len(), "metric family computed");
    Ok(rows)
}
