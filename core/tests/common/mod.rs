//! Shared fixture helpers for the integration suites: a scratch store and
//! terse builders for creation rows, spends and height rows.
#![allow(dead_code)]

use chrono::NaiveDate;
use utxolens_core::store::{CreationRow, HeightRow, IngestBatch, LifecycleStore, SpendRecord};

pub const DAY: i64 = 86_400;

pub struct Fixture {
    // Held for its Drop; the directory outlives the store.
    _dir: tempfile::TempDir,
    pub store: LifecycleStore,
}

pub fn open_store() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = LifecycleStore::open(&dir.path().join("suite.db")).unwrap();
    Fixture { _dir: dir, store }
}

pub fn ts(date: &str) -> i64 {
    date.parse::<NaiveDate>()
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp()
}

pub fn date(date: &str) -> NaiveDate {
    date.parse().unwrap()
}

pub fn utxo(txid: &str, addr: &str, height: u64, btc: f64, price: Option<f64>) -> CreationRow {
    CreationRow {
        txid: txid.into(),
        vout: 0,
        height,
        coinbase: false,
        amount_sats: (btc * 1e8).round() as i64,
        script_type: Some("witness_v0_keyhash".into()),
        address: Some(addr.into()),
        creation_price_usd: price,
    }
}

pub fn spend(txid: &str, block: u64, ts: i64, price: Option<f64>) -> SpendRecord {
    SpendRecord {
        txid: txid.into(),
        vout: 0,
        spent_block: block,
        spent_timestamp: ts,
        spent_price_usd: price,
    }
}

pub fn height(height: u64, timestamp: i64) -> HeightRow {
    HeightRow { height, timestamp, block_hash: format!("hash{height}") }
}

pub fn apply(
    store: &mut LifecycleStore,
    creations: Vec<CreationRow>,
    spends: Vec<SpendRecord>,
    heights: Vec<HeightRow>,
    last_block: u64,
) {
    store
        .apply_batch(&IngestBatch { creations, spends, heights, last_block })
        .unwrap();
}
