//! Block ingestor: the hot path.
//!
//! Three stages per batch. Fetch is parallel: stateless workers pull blocks
//! over the batched RPC. Decode is serial and strictly height-ordered (a
//! block's inputs spend creations emitted by earlier blocks, so out-of-order
//! application is forbidden). Persist is bulk: one store transaction per
//! batch covering creation rows, the staged spend join, block heights and
//! the sync checkpoint, so a failed batch rolls back whole and never
//! advances the checkpoint.
//!
//! Cluster hints (input address sets of multi-input transactions) either
//! feed an in-process disjoint-set or append to a CSV pair spool for an
//! offline clustering pass.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use utxolens_cluster::UnionFind;

use crate::pricing::PriceIndex;
use crate::rpc::types::{sats_from_btc, Block};
use crate::rpc::BitcoinRpc;
use crate::store::{CreationRow, HeightRow, IngestBatch, LifecycleStore, SpendRecord};
use crate::CancelFlag;

/// How spend records reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendMode {
    /// Stage every observed input and let the join filter. O(1) memory,
    /// higher disk traffic. Default for large ranges.
    Staging,
    /// Hold the unspent outpoint set in memory and filter before staging.
    /// Lower I/O, ~N x (txid + int) of memory.
    Prefilter,
}

/// Where multi-input address sets go.
pub enum ClusterSink<'a> {
    Disabled,
    InProcess(&'a mut UnionFind),
    Spool(csv::Writer<std::fs::File>),
}

impl ClusterSink<'_> {
    pub fn spool(path: &Path) -> Result<Self> {
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)
            .with_context(|| format!("opening pair spool {}", path.display()))?;
        Ok(ClusterSink::Spool(writer))
    }

    pub fn observe(&mut self, addrs: &[String]) -> Result<()> {
        match self {
            ClusterSink::Disabled => {}
            ClusterSink::InProcess(uf) => uf.observe_inputs(addrs),
            ClusterSink::Spool(writer) => {
                // Chain pairs (a-b, b-c, ...) reproduce the same partition
                // as unioning the whole set at once.
                for pair in addrs.windows(2) {
                    writer.write_record([pair[0].as_str(), pair[1].as_str()])?;
                }
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        if let ClusterSink::Spool(mut writer) = self {
            writer.flush().context("flushing pair spool")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub blocks_processed: u64,
    pub creations_inserted: u64,
    pub spends_marked: u64,
    pub cluster_hints: u64,
    pub last_block: Option<u64>,
    /// Calendar dates covered by the processed blocks, for metric recompute.
    pub dates: BTreeSet<NaiveDate>,
    pub reached_tip: bool,
    pub cancelled: bool,
}

pub struct BlockIngestor<'a> {
    rpc: &'a BitcoinRpc,
    store: &'a mut LifecycleStore,
    workers: usize,
    batch_blocks: usize,
    spend_mode: SpendMode,
    dry_run: bool,
}

/// Input address sets (k >= 2, resolvable addresses only) of every
/// transaction in the block. Shared with the offline clustering pass.
pub fn extract_cluster_hints(block: &Block) -> Vec<Vec<String>> {
    let mut hints = Vec::new();
    for tx in &block.tx {
        let addrs: Vec<String> = tx
            .vin
            .iter()
            .filter(|vin| !vin.is_coinbase())
            .filter_map(|vin| vin.prevout_address().map(str::to_string))
            .collect();
        if addrs.len() >= 2 {
            hints.push(addrs);
        }
    }
    hints
}

/// Fetch a run of heights with `workers` concurrent tasks and reassemble in
/// strictly ascending height order. The result is shorter than asked when
/// the tip is reached; any other gap is an error.
pub async fn fetch_blocks_ordered(
    rpc: &BitcoinRpc,
    heights: &[u64],
    workers: usize,
) -> Result<Vec<Block>> {
    if heights.is_empty() {
        return Ok(Vec::new());
    }
    let per_worker = heights.len().div_ceil(workers.max(1));
    let mut tasks = Vec::new();
    for slice in heights.chunks(per_worker) {
        let rpc = rpc.clone();
        let slice = slice.to_vec();
        tasks.push(tokio::spawn(async move { rpc.blocks_for_heights(&slice).await }));
    }
    let mut blocks = Vec::with_capacity(heights.len());
    for task in tasks {
        blocks.extend(task.await.context("fetch worker panicked")??);
    }
    blocks.sort_by_key(|b| b.height);

    for (block, &expected) in blocks.iter().zip(heights) {
        if block.height != expected {
            bail!(
                "fetch gap: got block {} where {} was expected",
                block.height,
                expected
            );
        }
    }
    Ok(blocks)
}

/// Replay a pair spool into the disjoint-set (the offline clustering merge
/// phase). Returns pairs consumed.
pub fn merge_spool_into(uf: &mut UnionFind, path: &Path) -> Result<u64> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("opening pair spool {}", path.display()))?;
    let mut pairs = 0u64;
    for record in reader.records() {
        let record = record.context("reading pair spool row")?;
        let (Some(a), Some(b)) = (record.get(0), record.get(1)) else {
            bail!("malformed pair spool row {} in {}", pairs + 1, path.display());
        };
        uf.union(a, b);
        pairs += 1;
    }
    Ok(pairs)
}

impl<'a> BlockIngestor<'a> {
    pub fn new(
        rpc: &'a BitcoinRpc,
        store: &'a mut LifecycleStore,
        workers: usize,
        batch_blocks: usize,
    ) -> Self {
        Self {
            rpc,
            store,
            workers: workers.max(1),
            batch_blocks: batch_blocks.max(1),
            spend_mode: SpendMode::Staging,
            dry_run: false,
        }
    }

    pub fn spend_mode(mut self, mode: SpendMode) -> Self {
        self.spend_mode = mode;
        self
    }

    pub fn dry_run(mut self, dry: bool) -> Self {
        self.dry_run = dry;
        self
    }

    /// Ingest `[from, to]` inclusive. Persisted batch by batch; a failure
    /// aborts the in-flight batch without advancing the checkpoint, so the
    /// next run replays from the same point.
    pub async fn run(
        &mut self,
        from: u64,
        to: u64,
        sink: &mut ClusterSink<'_>,
        cancel: &CancelFlag,
    ) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        if from > to {
            return Ok(report);
        }

        let mut unspent = match self.spend_mode {
            SpendMode::Prefilter => Some(self.store.load_unspent_outpoints()?),
            SpendMode::Staging => None,
        };
        if let Some(set) = &unspent {
            tracing::info!(outpoints = set.len(), "prefilter set loaded");
        }

        let mut batch_start = from;
        while batch_start <= to {
            if cancel.is_cancelled() {
                tracing::info!("cancellation observed between batches");
                report.cancelled = true;
                break;
            }

            let batch_end = (batch_start + self.batch_blocks as u64 - 1).min(to);
            let heights: Vec<u64> = (batch_start..=batch_end).collect();
            let blocks = fetch_blocks_ordered(self.rpc, &heights, self.workers).await?;
            if blocks.len() < heights.len() {
                report.reached_tip = true;
            }
            if blocks.is_empty() {
                break;
            }

            let batch = self.decode(&blocks, sink, unspent.as_mut(), &mut report)?;

            if self.dry_run {
                tracing::info!(
                    first = batch_start,
                    last = batch.last_block,
                    creations = batch.creations.len(),
                    spends = batch.spends.len(),
                    "dry run, not persisting"
                );
            } else {
                let stats = self.store.apply_batch(&batch).with_context(|| {
                    format!("persisting batch [{batch_start}, {}]", batch.last_block)
                })?;
                report.creations_inserted += stats.creations_inserted;
                report.spends_marked += stats.spends_marked;
                tracing::info!(
                    first = batch_start,
                    last = batch.last_block,
                    blocks = blocks.len(),
                    creations = stats.creations_inserted,
                    spends = stats.spends_marked,
                    "batch persisted"
                );
            }

            report.blocks_processed += blocks.len() as u64;
            report.last_block = Some(batch.last_block);
            if report.reached_tip {
                break;
            }
            batch_start = batch_end + 1;
        }
        Ok(report)
    }

    /// Serial decode of an ascending run of blocks into one persistable
    /// batch. Emits creation rows for every output, spend records for every
    /// non-coinbase input, and cluster hints for multi-input transactions.
    fn decode(
        &self,
        blocks: &[Block],
        sink: &mut ClusterSink<'_>,
        mut unspent: Option<&mut HashSet<(String, u32)>>,
        report: &mut IngestReport,
    ) -> Result<IngestBatch> {
        let mut batch = IngestBatch::default();
        let prices = PriceIndex::new(self.store.conn());

        for block in blocks {
            let date = chrono::DateTime::from_timestamp(block.time, 0)
                .with_context(|| format!("block {} has invalid time {}", block.height, block.time))?
                .date_naive();
            let block_price = prices.price_for_date(date)?;
            report.dates.insert(date);

            for tx in &block.tx {
                let coinbase = tx.vin.iter().any(|vin| vin.is_coinbase());
                for vout in &tx.vout {
                    if let Some(set) = unspent.as_deref_mut() {
                        set.insert((tx.txid.clone(), vout.n));
                    }
                    batch.creations.push(CreationRow {
                        txid: tx.txid.clone(),
                        vout: vout.n,
                        height: block.height,
                        coinbase,
                        amount_sats: sats_from_btc(vout.value),
                        script_type: vout.script_pub_key.script_type.clone(),
                        address: vout.script_pub_key.address.clone(),
                        creation_price_usd: block_price,
                    });
                }

                let mut hint_addrs: Vec<String> = Vec::new();
                for vin in &tx.vin {
                    let Some((txid, idx)) = vin.outpoint() else {
                        continue;
                    };
                    if let Some(addr) = vin.prevout_address() {
                        hint_addrs.push(addr.to_string());
                    }
                    if let Some(set) = unspent.as_deref_mut() {
                        if !set.remove(&(txid.to_string(), idx)) {
                            continue;
                        }
                    }
                    batch.spends.push(SpendRecord {
                        txid: txid.to_string(),
                        vout: idx,
                        spent_block: block.height,
                        spent_timestamp: block.time,
                        spent_price_usd: block_price,
                    });
                }
                if hint_addrs.len() >= 2 {
                    report.cluster_hints += 1;
                    sink.observe(&hint_addrs)?;
                }
            }

            batch.heights.push(HeightRow {
                height: block.height,
                timestamp: block.time,
                block_hash: block.hash.clone(),
            });
            batch.last_block = block.height;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_json(height: u64, time: i64, txs: serde_json::Value) -> Block {
        serde_json::from_value(serde_json::json!({
            "hash": format!("hash{height}"),
            "height": height,
            "time": time,
            "tx": txs,
        }))
        .unwrap()
    }

    #[test]
    fn hints_need_two_resolvable_inputs() {
        let block = block_json(
            10,
            1_600_000_000,
            serde_json::json!([
                // Coinbase only: no hint.
                {"txid": "cb", "vin": [{"coinbase": "aa"}], "vout": []},
                // Two resolvable inputs: one hint.
                {"txid": "t1", "vin": [
                    {"txid": "p1", "vout": 0, "prevout": {"value": 1.0,
                        "scriptPubKey": {"type": "p2wpkh", "address": "A"}}},
                    {"txid": "p2", "vout": 0, "prevout": {"value": 1.0,
                        "scriptPubKey": {"type": "p2wpkh", "address": "B"}}}
                ], "vout": []},
                // Two inputs, one unresolvable: no hint.
                {"txid": "t2", "vin": [
                    {"txid": "p3", "vout": 0, "prevout": {"value": 1.0,
                        "scriptPubKey": {"type": "p2wpkh", "address": "C"}}},
                    {"txid": "p4", "vout": 0, "prevout": {"value": 1.0,
                        "scriptPubKey": {"type": "nonstandard"}}}
                ], "vout": []}
            ]),
        );
        let hints = extract_cluster_hints(&block);
        assert_eq!(hints, vec![vec!["A".to_string(), "B".to_string()]]);
    }

    #[test]
    fn spool_sink_writes_chained_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.csv");
        let mut sink = ClusterSink::spool(&path).unwrap();
        sink.observe(&["a".into(), "b".into(), "c".into()]).unwrap();
        sink.finish().unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body, "a,b\nb,c\n");
    }

    #[test]
    fn spool_roundtrip_reproduces_the_partition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.csv");
        let mut sink = ClusterSink::spool(&path).unwrap();
        sink.observe(&["a".into(), "b".into(), "c".into()]).unwrap();
        sink.observe(&["x".into(), "y".into()]).unwrap();
        sink.finish().unwrap();

        let mut uf = UnionFind::new();
        assert_eq!(merge_spool_into(&mut uf, &path).unwrap(), 3);
        assert!(uf.connected("a", "c"));
        assert!(uf.connected("x", "y"));
        assert!(!uf.connected("a", "x"));
        assert_eq!(uf.cluster_count(), 2);
    }

    #[test]
    fn in_process_sink_feeds_the_disjoint_set() {
        let mut uf = UnionFind::new();
        {
            let mut sink = ClusterSink::InProcess(&mut uf);
            sink.observe(&["a".into(), "b".into()]).unwrap();
            sink.observe(&["b".into(), "c".into()]).unwrap();
        }
        assert!(uf.connected("a", "c"));
    }
}
