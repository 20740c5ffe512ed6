//! Metric engine end-to-end against seeded stores: the seed scenarios for
//! URPD, SOPR, Binary CDD, the CDD additivity and profit/loss percentage
//! invariants, and deterministic recompute.

mod common;

use common::*;
use utxolens_core::metrics::{
    calculate_binary_cdd, calculate_cdd_vdd, calculate_realized_snapshot,
    calculate_supply_profit_loss, calculate_urpd, calculate_wallet_waves, sopr_for_range,
    MetricEngine,
};

/// S3: bucket width 5000, current price 60k. The [10k,15k) bucket holds
/// 3 BTC and dominates; 5 BTC sit below the price, 1.5 above.
#[test]
fn urpd_seed_distribution() {
    let mut fx = open_store();
    let t0 = ts("2024-01-01");
    apply(
        &mut fx.store,
        vec![
            utxo("u1", "a1", 100, 1.5, Some(12_000.0)),
            utxo("u2", "a2", 100, 1.5, Some(14_000.0)),
            utxo("u3", "a3", 100, 1.0, Some(52_000.0)),
            utxo("u4", "a4", 100, 1.0, Some(53_000.0)),
            utxo("u5", "a5", 100, 0.75, Some(97_000.0)),
            utxo("u6", "a6", 100, 0.75, Some(99_000.0)),
        ],
        vec![],
        vec![height(100, t0)],
        100,
    );

    let urpd = calculate_urpd(fx.store.conn(), 100, 60_000.0, 5_000.0).unwrap();
    assert!((urpd.total_supply_btc - 6.5).abs() < 1e-9);

    let dominant = urpd.dominant_bucket.unwrap();
    assert!((dominant.price_low - 10_000.0).abs() < 1e-9);
    assert!((dominant.btc_amount - 3.0).abs() < 1e-9);

    assert!((urpd.supply_below_price_btc - 5.0).abs() < 1e-9);
    assert!((urpd.supply_above_price_btc - 1.5).abs() < 1e-9);
    // The split covers everything.
    assert!(
        (urpd.supply_below_price_pct + urpd.supply_above_price_pct - 100.0).abs() < 1e-6
    );
}

/// S5: 2 BTC acquired at 40k and spent at 100k gives SOPR 2.5.
#[test]
fn sopr_seed_ratio() {
    let mut fx = open_store();
    let t0 = ts("2024-01-01");
    apply(
        &mut fx.store,
        vec![utxo("u1", "a1", 100, 2.0, Some(40_000.0))],
        vec![],
        vec![height(100, t0)],
        100,
    );
    apply(
        &mut fx.store,
        vec![],
        vec![spend("u1", 150, t0 + 30 * DAY, Some(100_000.0))],
        vec![height(150, t0 + 30 * DAY)],
        150,
    );

    let sopr = sopr_for_range(fx.store.conn(), 150, 150).unwrap();
    assert!((sopr.sopr.unwrap() - 2.5).abs() < 1e-9);
    assert_eq!(sopr.spent_count, 1);
    assert!(!sopr.used_price_fallback);

    // Nothing spent in a disjoint range.
    let empty = sopr_for_range(fx.store.conn(), 200, 300).unwrap();
    assert!(empty.sopr.is_none());
}

/// SOPR resolves the spend price through the date join when the stored
/// spend price is missing.
#[test]
fn sopr_price_fallback_join() {
    let mut fx = open_store();
    let t0 = ts("2024-01-01");
    apply(
        &mut fx.store,
        vec![utxo("u1", "a1", 100, 2.0, Some(40_000.0))],
        vec![],
        vec![height(100, t0)],
        100,
    );
    // Spend recorded without a price (the bar was missing at ingest time).
    apply(
        &mut fx.store,
        vec![],
        vec![spend("u1", 150, t0 + 30 * DAY, None)],
        vec![height(150, t0 + 30 * DAY)],
        150,
    );
    // The bar exists by metric time.
    fx.store.insert_price(date("2024-01-31"), 100_000.0).unwrap();

    let sopr = sopr_for_range(fx.store.conn(), 150, 150).unwrap();
    assert!(sopr.used_price_fallback);
    assert!((sopr.sopr.unwrap() - 2.5).abs() < 1e-9);
}

/// S4: 20 daily CDD samples is below the 30-point gate; the flag is forced
/// to 0 with `insufficient` set, whatever today's value is.
#[test]
fn binary_cdd_insufficient_gate() {
    let mut fx = open_store();
    let t0 = ts("2024-01-01");
    let mut creations = Vec::new();
    for i in 0..20 {
        creations.push(utxo(&format!("u{i}"), &format!("a{i}"), 100, 1.0, Some(40_000.0)));
    }
    apply(&mut fx.store, creations, vec![], vec![height(100, t0)], 100);

    // One spend per day for 20 days, including a huge final day.
    for i in 0..20u64 {
        let block = 200 + i;
        let when = t0 + 100 * DAY + i as i64 * DAY;
        apply(
            &mut fx.store,
            vec![],
            vec![spend(&format!("u{i}"), block, when, Some(50_000.0))],
            vec![height(block, when)],
            block,
        );
    }

    let as_of = t0 + 121 * DAY;
    let result = calculate_binary_cdd(fx.store.conn(), 2.0, 365, as_of).unwrap();
    assert!(result.insufficient_data);
    assert_eq!(result.binary_cdd, 0);
    assert_eq!(result.data_points, 20);
    assert!(result.cdd_zscore.is_none());
}

/// Id8: CDD over a window plus CDD over the complementary window equals
/// CDD over their union.
#[test]
fn cdd_is_additive_over_window_partitions() {
    let mut fx = open_store();
    let t0 = ts("2024-01-01");
    apply(
        &mut fx.store,
        vec![
            utxo("u1", "a1", 100, 2.0, Some(40_000.0)),
            utxo("u2", "a2", 100, 3.0, Some(40_000.0)),
            utxo("u3", "a3", 100, 0.5, Some(40_000.0)),
        ],
        vec![],
        vec![height(100, t0)],
        100,
    );
    // Two spends in the first fortnight, one in the second.
    apply(
        &mut fx.store,
        vec![],
        vec![
            spend("u1", 200, t0 + 40 * DAY, Some(50_000.0)),
            spend("u2", 201, t0 + 44 * DAY, Some(55_000.0)),
        ],
        vec![height(200, t0 + 40 * DAY), height(201, t0 + 44 * DAY)],
        201,
    );
    apply(
        &mut fx.store,
        vec![],
        vec![spend("u3", 210, t0 + 52 * DAY, Some(60_000.0))],
        vec![height(210, t0 + 52 * DAY)],
        210,
    );

    let mid = t0 + 45 * DAY;
    let end = t0 + 60 * DAY;
    let first = calculate_cdd_vdd(fx.store.conn(), t0, mid, 45).unwrap();
    let second = calculate_cdd_vdd(fx.store.conn(), mid, end, 15).unwrap();
    let both = calculate_cdd_vdd(fx.store.conn(), t0, end, 60).unwrap();

    assert!(first.cdd_total > 0.0);
    assert!(second.cdd_total > 0.0);
    assert!((first.cdd_total + second.cdd_total - both.cdd_total).abs() < 1e-9);
    assert!((first.vdd_total + second.vdd_total - both.vdd_total).abs() < 1e-6);
}

/// Id9: profit, loss and breakeven percentages sum to 100.
#[test]
fn supply_split_percentages_sum_to_100() {
    let mut fx = open_store();
    let t0 = ts("2024-01-01");
    apply(
        &mut fx.store,
        vec![
            utxo("u1", "a1", 100, 1.0, Some(40_000.0)),
            utxo("u2", "a2", 100, 2.0, Some(80_000.0)),
            utxo("u3", "a3", 100, 0.5, Some(60_000.0)),
            utxo("u4", "a4", 100, 1.25, Some(10_000.0)),
        ],
        vec![],
        vec![height(100, t0)],
        100,
    );

    let split = calculate_supply_profit_loss(fx.store.conn(), 100, 60_000.0).unwrap();
    let sum = split.pct_in_profit + split.pct_in_loss + split.pct_breakeven;
    assert!((sum - 100.0).abs() < 1e-6, "got {sum}");
    assert!((split.supply_in_profit_btc - 2.25).abs() < 1e-9);
    assert!((split.supply_in_loss_btc - 2.0).abs() < 1e-9);
    assert!((split.supply_breakeven_btc - 0.5).abs() < 1e-9);
}

/// The realized family on a seeded store, including the historical as-of
/// unspent test.
#[test]
fn realized_cap_respects_the_as_of_point() {
    let mut fx = open_store();
    let t0 = ts("2024-01-01");
    apply(
        &mut fx.store,
        vec![
            utxo("u1", "a1", 100, 1.0, Some(40_000.0)),
            utxo("u2", "a2", 100, 2.0, Some(50_000.0)),
        ],
        vec![],
        vec![height(100, t0)],
        100,
    );
    apply(
        &mut fx.store,
        vec![],
        vec![spend("u1", 300, t0 + 20 * DAY, Some(90_000.0))],
        vec![height(300, t0 + 20 * DAY)],
        300,
    );

    // As of block 200 u1 was still unspent.
    let before = calculate_realized_snapshot(fx.store.conn(), 200, Some(60_000.0)).unwrap();
    assert!((before.realized_cap_usd - 140_000.0).abs() < 1e-6);
    assert!((before.supply_btc - 3.0).abs() < 1e-9);

    // As of block 300 the spend has landed.
    let after = calculate_realized_snapshot(fx.store.conn(), 300, Some(60_000.0)).unwrap();
    assert!((after.realized_cap_usd - 100_000.0).abs() < 1e-6);
    assert!((after.supply_btc - 2.0).abs() < 1e-9);

    let market = after.market_cap_usd.unwrap();
    assert!((market - 120_000.0).abs() < 1e-6);
    assert!((after.mvrv.unwrap() - 1.2).abs() < 1e-9);
    let nupl = after.nupl.unwrap();
    assert!((nupl - (120_000.0 - 100_000.0) / 120_000.0).abs() < 1e-9);
}

/// Wallet waves bands supply by address balance, not by UTXO.
#[test]
fn wallet_waves_band_by_address_balance() {
    let mut fx = open_store();
    let t0 = ts("2024-01-01");
    apply(
        &mut fx.store,
        vec![
            // One address with two UTXOs totalling 5 BTC: crab, not shrimp.
            utxo("u1", "crab_addr", 100, 2.0, Some(40_000.0)),
            {
                let mut second = utxo("u2", "crab_addr", 100, 3.0, Some(40_000.0));
                second.vout = 1;
                second.txid = "u1".into();
                second
            },
            utxo("u3", "whale_addr", 100, 2_000.0, Some(40_000.0)),
        ],
        vec![],
        vec![height(100, t0)],
        100,
    );

    let waves = calculate_wallet_waves(fx.store.conn(), 100).unwrap();
    let by_band = |band: &str| {
        waves
            .bands
            .iter()
            .find(|b| serde_json::to_value(b.band).unwrap() == band)
            .unwrap()
            .supply_btc
    };
    assert!((by_band("crab") - 5.0).abs() < 1e-9);
    assert!((by_band("whale") - 2_000.0).abs() < 1e-9);
    assert_eq!(by_band("shrimp"), 0.0);
    assert!((waves.total_supply_btc - 2_005.0).abs() < 1e-9);
}

/// Id6: identical inputs produce identical metric rows on recompute.
#[test]
fn metric_recompute_is_deterministic() {
    let mut fx = open_store();
    let day = date("2024-03-01");
    let t0 = ts("2024-03-01");
    apply(
        &mut fx.store,
        vec![
            utxo("u1", "a1", 100, 1.0, Some(40_000.0)),
            utxo("u2", "a2", 101, 2.0, Some(50_000.0)),
            utxo("u3", "a3", 102, 0.5, Some(70_000.0)),
        ],
        vec![],
        vec![height(100, t0 + 600), height(101, t0 + 1_200), height(102, t0 + 1_800)],
        102,
    );
    fx.store.insert_price(day, 60_000.0).unwrap();

    let fetch_rows = |store: &utxolens_core::store::LifecycleStore| -> Vec<(String, Option<f64>, String, f64)> {
        store
            .conn()
            .prepare("SELECT metric, value, detail, confidence FROM metrics_daily ORDER BY metric")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    };

    let first = {
        let mut engine = MetricEngine::new(&mut fx.store);
        engine.compute_for_date(day).unwrap().expect("blocks exist for the date");
        fetch_rows(&fx.store)
    };
    assert!(!first.is_empty());

    let second = {
        let mut engine = MetricEngine::new(&mut fx.store);
        engine.compute_for_date(day).unwrap().unwrap();
        fetch_rows(&fx.store)
    };
    assert_eq!(first, second);
}

/// A date with no indexed blocks is skipped, not fabricated.
#[test]
fn missing_day_yields_no_rows() {
    let mut fx = open_store();
    let mut engine = MetricEngine::new(&mut fx.store);
    assert!(engine.compute_for_date(date("2024-03-01")).unwrap().is_none());
    let rows: u64 = fx
        .store
        .conn()
        .query_row("SELECT COUNT(*) FROM metrics_daily", [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows, 0);
}
