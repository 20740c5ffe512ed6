//! Cluster persistence and the wallet cost-basis aggregation.
//!
//! Both operations are destructive rewrites and run as DELETE + bulk insert
//! inside a single transaction: cluster roots can shift between runs, so
//! incremental reconciliation is unsafe and a full GROUP BY recompute is
//! cheaper at this scale anyway. Consumers must treat cluster ids as opaque.

use anyhow::{Context, Result};
use rusqlite::params;
use utxolens_cluster::UnionFind;

use crate::store::LifecycleStore;

/// Serialize the disjoint-set into `address_clusters`: every (member,
/// representative) pair, replacing the previous projection atomically.
pub fn flush_clusters(store: &mut LifecycleStore, uf: &mut UnionFind, now_ts: i64) -> Result<u64> {
    let tx = store.conn_mut().transaction()?;
    tx.execute("DELETE FROM address_clusters", [])?;
    let mut written = 0u64;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO address_clusters (address, cluster_id, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?3)",
        )?;
        let mut failure: Option<rusqlite::Error> = None;
        uf.for_each_member(|member, rep| {
            if failure.is_some() {
                return;
            }
            match stmt.execute(params![member, rep, now_ts]) {
                Ok(_) => written += 1,
                Err(e) => failure = Some(e),
            }
        });
        if let Some(e) = failure {
            return Err(e).context("writing cluster rows");
        }
    }
    tx.commit()?;
    tracing::info!(written, "cluster table replaced");
    Ok(written)
}

/// Full recompute of `wallet_cost_basis` from unspent UTXOs joined to the
/// cluster map. The average is volume-weighted: SUM(btc x price) / SUM(btc),
/// never an arithmetic mean of prices, which is wrong whenever UTXO sizes
/// differ.
pub fn recompute_cost_basis(store: &mut LifecycleStore) -> Result<u64> {
    let tx = store.conn_mut().transaction()?;
    tx.execute("DELETE FROM wallet_cost_basis", [])?;
    tx.execute(
        "INSERT INTO wallet_cost_basis
             (cluster_id, acquisition_block, btc_amount, weighted_price_usd, earliest_timestamp)
         SELECT
             c.cluster_id,
             u.creation_block,
             SUM(u.btc_value),
             SUM(u.btc_value * u.creation_price_usd) / SUM(u.btc_value),
             MIN(u.creation_timestamp)
         FROM utxo_lifecycle_full u
         JOIN address_clusters c ON c.address = u.address
         WHERE u.is_spent = 0
           AND u.creation_price_usd IS NOT NULL
           AND u.btc_value > 0
         GROUP BY c.cluster_id, u.creation_block",
        [],
    )?;
    let rows = tx.changes();
    tx.commit()?;
    tracing::info!(rows, "wallet cost basis recomputed");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CreationRow, HeightRow, IngestBatch};

    fn seeded() -> (tempfile::TempDir, LifecycleStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStore::open(&dir.path().join("cb.db")).unwrap();
        (dir, store)
    }

    fn utxo(txid: &str, addr: &str, height: u64, btc: f64, price: f64) -> CreationRow {
        CreationRow {
            txid: txid.into(),
            vout: 0,
            height,
            coinbase: false,
            amount_sats: (btc * 1e8) as i64,
            script_type: Some("p2wpkh".into()),
            address: Some(addr.into()),
            creation_price_usd: Some(price),
        }
    }

    #[test]
    fn weighted_average_not_arithmetic_mean() {
        let (_dir, mut store) = seeded();
        // One cluster holding 2 BTC @ 40k and 3 BTC @ 60k at one block.
        store
            .apply_batch(&IngestBatch {
                creations: vec![
                    utxo("t1", "addr_a", 500, 2.0, 40_000.0),
                    utxo("t2", "addr_b", 500, 3.0, 60_000.0),
                ],
                heights: vec![HeightRow { height: 500, timestamp: 1_600_000_000, block_hash: "h".into() }],
                last_block: 500,
                ..Default::default()
            })
            .unwrap();

        let mut uf = UnionFind::new();
        uf.observe_inputs(&["addr_a", "addr_b"]);
        flush_clusters(&mut store, &mut uf, 1_600_000_000).unwrap();
        assert_eq!(recompute_cost_basis(&mut store).unwrap(), 1);

        let (btc, price): (f64, f64) = store
            .conn()
            .query_row(
                "SELECT btc_amount, weighted_price_usd FROM wallet_cost_basis",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert!((btc - 5.0).abs() < 1e-9);
        // (2*40k + 3*60k) / 5 = 52k, NOT the 50k arithmetic mean.
        assert!((price - 52_000.0).abs() < 1e-6);
    }

    #[test]
    fn recompute_replaces_previous_rows() {
        let (_dir, mut store) = seeded();
        store
            .apply_batch(&IngestBatch {
                creations: vec![utxo("t1", "addr_a", 500, 1.0, 40_000.0)],
                heights: vec![HeightRow { height: 500, timestamp: 1_600_000_000, block_hash: "h".into() }],
                last_block: 500,
                ..Default::default()
            })
            .unwrap();
        let mut uf = UnionFind::new();
        uf.observe_inputs(&["addr_a"]);
        flush_clusters(&mut store, &mut uf, 1).unwrap();
        recompute_cost_basis(&mut store).unwrap();
        // Second run is the same size, not doubled.
        recompute_cost_basis(&mut store).unwrap();
        let n: u64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM wallet_cost_basis", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn rows_without_price_or_cluster_are_excluded() {
        let (_dir, mut store) = seeded();
        let mut no_price = utxo("t2", "addr_b", 500, 1.0, 0.0);
        no_price.creation_price_usd = None;
        store
            .apply_batch(&IngestBatch {
                creations: vec![utxo("t1", "addr_a", 500, 1.0, 40_000.0), no_price],
                heights: vec![HeightRow { height: 500, timestamp: 1_600_000_000, block_hash: "h".into() }],
                last_block: 500,
                ..Default::default()
            })
            .unwrap();
        let mut uf = UnionFind::new();
        uf.observe_inputs(&["addr_a"]);
        uf.observe_inputs(&["addr_b"]);
        flush_clusters(&mut store, &mut uf, 1).unwrap();
        recompute_cost_basis(&mut store).unwrap();
        // Only the priced, clustered row contributes.
        let n: u64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM wallet_cost_basis", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }
}
