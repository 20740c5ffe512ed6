//! Chainstate bootstrap: import a CSV dump of the live UTXO set.
//!
//! The dump comes from an external tool that reads the node's chainstate
//! directly; header `txid,vout,height,coinbase,amount,script,address` with
//! `amount` in satoshis and a textual coinbase flag. Import order matters:
//! bulk append first, then fill `btc_value`, then join heights and price
//! bars to fill `creation_price_usd`, and only then build indexes. Spend
//! attributes stay null; incremental sync fills them later.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::params;

use crate::store::LifecycleStore;

/// Rows per insert transaction during the CSV import.
const IMPORT_TX_ROWS: usize = 50_000;

#[derive(Debug, Default)]
pub struct ImportStats {
    pub total_utxos: u64,
    pub total_btc: f64,
    pub min_height: Option<u64>,
    pub max_height: Option<u64>,
    pub unique_addresses: u64,
}

struct Columns {
    txid: usize,
    vout: usize,
    height: usize,
    coinbase: usize,
    amount: usize,
    script: usize,
    address: usize,
}

impl Columns {
    fn resolve(headers: &csv::StringRecord) -> Result<Self> {
        let find = |names: &[&str]| -> Result<usize> {
            headers
                .iter()
                .position(|h| names.contains(&h.trim()))
                .with_context(|| format!("dump is missing a {} column", names[0]))
        };
        Ok(Self {
            txid: find(&["txid"])?,
            vout: find(&["vout"])?,
            height: find(&["height"])?,
            coinbase: find(&["coinbase"])?,
            amount: find(&["amount"])?,
            // Some dump tools emit `script`, others `script_type`.
            script: find(&["script", "script_type"])?,
            address: find(&["address"])?,
        })
    }
}

fn parse_coinbase(raw: &str) -> Result<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "false" | "FALSE" | "False" | "" => Ok(false),
        other => bail!("unparseable coinbase flag {other:?}"),
    }
}

/// Bulk-append the dump into `utxo_lifecycle`. Uses INSERT OR IGNORE so a
/// partially imported dump can be re-run. Returns rows inserted.
pub fn import_chainstate_csv(store: &mut LifecycleStore, csv_path: &Path) -> Result<u64> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(csv_path)
        .with_context(|| format!("opening dump {}", csv_path.display()))?;
    let cols = Columns::resolve(reader.headers()?)?;

    let mut inserted = 0u64;
    let mut seen = 0u64;
    let mut skipped = 0u64;
    let mut records = reader.records();

    loop {
        let tx = store.conn_mut().transaction()?;
        let mut in_tx = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO utxo_lifecycle
                   (txid, vout, height, coinbase, amount, script_type, address)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for record in records.by_ref() {
                let record = match record {
                    Ok(r) => r,
                    Err(e) => {
                        // Malformed lines are a data-quality issue, not an
                        // abort: count and keep going.
                        tracing::warn!(error = %e, "skipping malformed dump row");
                        skipped += 1;
                        continue;
                    }
                };
                seen += 1;
                let get = |i: usize| record.get(i).unwrap_or("").trim();
                let parsed: Result<(u32, u64, bool, i64)> = (|| {
                    Ok((
                        get(cols.vout).parse::<u32>().context("vout")?,
                        get(cols.height).parse::<u64>().context("height")?,
                        parse_coinbase(get(cols.coinbase))?,
                        get(cols.amount).parse::<i64>().context("amount")?,
                    ))
                })();
                let (vout, height, coinbase, amount) = match parsed {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, row = seen, "skipping unparseable dump row");
                        skipped += 1;
                        continue;
                    }
                };
                let address = get(cols.address);
                let script = get(cols.script);
                inserted += stmt.execute(params![
                    get(cols.txid),
                    vout,
                    height,
                    coinbase,
                    amount,
                    (!script.is_empty()).then_some(script),
                    (!address.is_empty()).then_some(address),
                ])? as u64;
                in_tx += 1;
                if in_tx >= IMPORT_TX_ROWS {
                    break;
                }
            }
        }
        tx.commit()?;
        if in_tx < IMPORT_TX_ROWS {
            break;
        }
        tracing::info!(seen, inserted, "chainstate import progress");
    }

    tracing::info!(seen, inserted, skipped, "chainstate import finished");
    Ok(inserted)
}

/// Fill `btc_value` from the satoshi amount where missing.
pub fn fill_btc_values(store: &mut LifecycleStore) -> Result<u64> {
    let n = store.conn().execute(
        "UPDATE utxo_lifecycle SET btc_value = amount / 100000000.0 WHERE btc_value IS NULL",
        [],
    )?;
    Ok(n as u64)
}

/// Fill `creation_price_usd` by joining height -> timestamp -> date -> price
/// bar. Rows whose day has no bar keep a null price (reduced confidence
/// downstream, never fabricated).
pub fn fill_creation_prices(store: &mut LifecycleStore) -> Result<u64> {
    let n = store.conn().execute(
        "UPDATE utxo_lifecycle
         SET creation_price_usd = (
             SELECT p.price_usd
             FROM block_heights h
             JOIN daily_prices p ON p.date = date(h.timestamp, 'unixepoch')
             WHERE h.height = utxo_lifecycle.height
         )
         WHERE creation_price_usd IS NULL",
        [],
    )?;
    Ok(n as u64)
}

pub fn import_stats(store: &LifecycleStore) -> Result<ImportStats> {
    let conn = store.conn();
    let (total_utxos, total_btc, min_height, max_height): (u64, Option<f64>, Option<u64>, Option<u64>) =
        conn.query_row(
            "SELECT COUNT(*), SUM(amount / 100000000.0), MIN(height), MAX(height) FROM utxo_lifecycle",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )?;
    let unique_addresses: u64 = conn.query_row(
        "SELECT COUNT(DISTINCT address) FROM utxo_lifecycle WHERE address IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    Ok(ImportStats {
        total_utxos,
        total_btc: total_btc.unwrap_or(0.0),
        min_height,
        max_height,
        unique_addresses,
    })
}

/// The whole bootstrap: import, fill derived columns, build indexes.
pub fn run_bootstrap(store: &mut LifecycleStore, csv_path: &Path) -> Result<ImportStats> {
    let inserted = import_chainstate_csv(store, csv_path)?;
    let filled = fill_btc_values(store)?;
    let priced = fill_creation_prices(store)?;
    store.create_indexes()?;
    tracing::info!(inserted, filled, priced, "bootstrap complete");
    import_stats(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HeightRow;
    use std::io::Write;

    fn write_dump(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("utxos.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "txid,vout,height,coinbase,amount,script,address").unwrap();
        write!(f, "{body}").unwrap();
        path
    }

    #[test]
    fn import_parses_flags_and_nullable_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LifecycleStore::open(&dir.path().join("b.db")).unwrap();
        let csv = write_dump(
            dir.path(),
            "aa,0,100,1,625000000,p2pkh,1Miner\n\
             bb,1,200,false,50000,p2wpkh,bc1qx\n\
             cc,0,200,0,0,nulldata,\n",
        );
        let inserted = import_chainstate_csv(&mut store, &csv).unwrap();
        assert_eq!(inserted, 3);

        let (coinbase, address): (bool, Option<String>) = store
            .conn()
            .query_row(
                "SELECT coinbase, address FROM utxo_lifecycle WHERE txid = 'aa'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert!(coinbase);
        assert_eq!(address.as_deref(), Some("1Miner"));

        // OP_RETURN-style rows keep a null address.
        let address: Option<String> = store
            .conn()
            .query_row("SELECT address FROM utxo_lifecycle WHERE txid = 'cc'", [], |r| r.get(0))
            .unwrap();
        assert!(address.is_none());
    }

    #[test]
    fn import_is_idempotent_and_skips_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LifecycleStore::open(&dir.path().join("b.db")).unwrap();
        let csv = write_dump(
            dir.path(),
            "aa,0,100,0,1000,p2wpkh,bc1qa\n\
             broken,notanint,100,0,1000,p2wpkh,bc1qb\n\
             aa,0,100,0,1000,p2wpkh,bc1qa\n",
        );
        assert_eq!(import_chainstate_csv(&mut store, &csv).unwrap(), 1);
        assert_eq!(import_chainstate_csv(&mut store, &csv).unwrap(), 0);
        assert_eq!(store.utxo_count().unwrap(), 1);
    }

    #[test]
    fn derived_fills_join_heights_and_prices() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LifecycleStore::open(&dir.path().join("b.db")).unwrap();
        let csv = write_dump(dir.path(), "aa,0,100,0,150000000,p2wpkh,bc1qa\n");
        import_chainstate_csv(&mut store, &csv).unwrap();

        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let ts = date.and_hms_opt(12, 0, 0).unwrap().and_utc().timestamp();
        store
            .insert_block_heights(&[HeightRow { height: 100, timestamp: ts, block_hash: "h".into() }])
            .unwrap();
        store.insert_price(date, 60_000.0).unwrap();

        assert_eq!(fill_btc_values(&mut store).unwrap(), 1);
        assert_eq!(fill_creation_prices(&mut store).unwrap(), 1);

        let (btc, price): (f64, f64) = store
            .conn()
            .query_row(
                "SELECT btc_value, creation_price_usd FROM utxo_lifecycle WHERE txid = 'aa'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert!((btc - 1.5).abs() < 1e-12);
        assert!((price - 60_000.0).abs() < 1e-9);

        let stats = import_stats(&store).unwrap();
        assert_eq!(stats.total_utxos, 1);
        assert_eq!(stats.unique_addresses, 1);
        assert_eq!(stats.min_height, Some(100));
    }
}
