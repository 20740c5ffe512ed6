//! Scheduler driving bootstrap, incremental sync, clustering flushes and
//! metric recomputation.
//!
//! State machine: INIT -> BOOTSTRAP -> INCREMENTAL -> IDLE, with IDLE
//! re-entering INCREMENTAL when the tip moves past the checkpoint.
//! Cancellation is cooperative and observed between batches; an in-flight
//! batch rolls back and the checkpoint stays put, so re-running is always
//! safe.

use std::time::Duration;

use anyhow::{Context, Result};
use utxolens_cluster::{checkpoint, UnionFind};

use crate::bootstrap::run_bootstrap;
use crate::config::EngineConfig;
use crate::costbasis::{flush_clusters, recompute_cost_basis};
use crate::ingest::{BlockIngestor, ClusterSink};
use crate::metrics::MetricEngine;
use crate::rpc::BitcoinRpc;
use crate::store::{LifecycleStore, CONCERN_CLUSTER_FLUSH, CONCERN_INGEST};
use crate::CancelFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Bootstrap,
    Incremental,
    Idle,
}

pub struct Orchestrator {
    cfg: EngineConfig,
    rpc: BitcoinRpc,
    store: LifecycleStore,
    uf: UnionFind,
    cancel: CancelFlag,
    poll_interval: Duration,
    once: bool,
    blocks_since_flush: u64,
}

impl Orchestrator {
    pub fn new(
        cfg: EngineConfig,
        rpc: BitcoinRpc,
        mut store: LifecycleStore,
        cancel: CancelFlag,
        poll_interval: Duration,
        once: bool,
    ) -> Result<Self> {
        if let Some(csv) = &cfg.exchange_addresses_csv {
            crate::metrics::load_exchange_addresses(&mut store, csv)?;
        }
        // Resume the disjoint-set from the newest checkpoint; at most one
        // checkpoint interval of clustering is re-done after a crash.
        let uf = match checkpoint::load_latest(&cfg.checkpoint_dir)? {
            Some((uf, height)) => {
                tracing::info!(height, addresses = uf.len(), "clustering resumed from checkpoint");
                uf
            }
            None => UnionFind::new(),
        };
        Ok(Self {
            cfg,
            rpc,
            store,
            uf,
            cancel,
            poll_interval,
            once,
            blocks_since_flush: 0,
        })
    }

    fn next_block(&self) -> Result<u64> {
        Ok(self
            .store
            .sync_state(CONCERN_INGEST)?
            .and_then(|s| s.last_block)
            .map(|b| b + 1)
            .unwrap_or(0))
    }

    /// Flush the disjoint-set to the cluster table, recompute the wallet
    /// cost basis on top of it, and checkpoint the structure.
    fn flush_clustering(&mut self, last_block: u64, now_ts: i64) -> Result<()> {
        let members = flush_clusters(&mut self.store, &mut self.uf, now_ts)?;
        let rows = recompute_cost_basis(&mut self.store)?;
        checkpoint::save(&self.cfg.checkpoint_dir, &self.uf, last_block)?;
        self.store
            .set_sync_state(CONCERN_CLUSTER_FLUSH, Some(last_block), None)?;
        self.blocks_since_flush = 0;
        tracing::info!(members, cost_basis_rows = rows, last_block, "clustering flushed");
        Ok(())
    }

    pub async fn run(&mut self) -> Result<()> {
        let mut phase = Phase::Init;
        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("orchestrator stopping on cancellation");
                break;
            }
            phase = match phase {
                Phase::Init => {
                    if self.store.utxo_count()? == 0 {
                        Phase::Bootstrap
                    } else {
                        tracing::info!("store already populated, skipping bootstrap");
                        Phase::Incremental
                    }
                }
                Phase::Bootstrap => {
                    match self.cfg.chainstate_csv.clone() {
                        Some(csv) => {
                            let stats = run_bootstrap(&mut self.store, &csv)?;
                            tracing::info!(
                                utxos = stats.total_utxos,
                                btc = stats.total_btc,
                                max_height = stats.max_height,
                                "chainstate bootstrap finished"
                            );
                            // Incremental sync picks up after the dump.
                            if let Some(max) = stats.max_height {
                                self.store.set_sync_state(CONCERN_INGEST, Some(max), None)?;
                            }
                        }
                        None => {
                            tracing::warn!("empty store and no chainstate dump configured, syncing from genesis");
                            self.store.create_indexes()?;
                        }
                    }
                    Phase::Incremental
                }
                Phase::Incremental => {
                    let tip = self.rpc.tip_height().await.context("polling tip")?;
                    let next = self.next_block()?;
                    if next > tip {
                        Phase::Idle
                    } else {
                        let to = (next + self.cfg.batch_blocks as u64 - 1).min(tip);
                        let report = {
                            let mut sink = ClusterSink::InProcess(&mut self.uf);
                            let mut ingestor = BlockIngestor::new(
                                &self.rpc,
                                &mut self.store,
                                self.cfg.workers,
                                self.cfg.batch_blocks,
                            );
                            ingestor.run(next, to, &mut sink, &self.cancel).await?
                        };
                        tracing::info!(
                            from = next,
                            last = report.last_block,
                            blocks = report.blocks_processed,
                            creations = report.creations_inserted,
                            spends = report.spends_marked,
                            hints = report.cluster_hints,
                            "incremental batch done"
                        );

                        self.blocks_since_flush += report.blocks_processed;
                        if let Some(last) = report.last_block {
                            if self.blocks_since_flush >= self.cfg.checkpoint_interval {
                                let now_ts = self
                                    .store
                                    .conn()
                                    .query_row(
                                        "SELECT COALESCE(MAX(timestamp), 0) FROM block_heights",
                                        [],
                                        |r| r.get(0),
                                    )
                                    .unwrap_or(0);
                                self.flush_clustering(last, now_ts)?;
                            }

                            // Recompute metrics for exactly the dates the
                            // batch touched.
                            let mut engine = MetricEngine::new(&mut self.store);
                            for date in &report.dates {
                                if let Some(daily) = engine.compute_for_date(*date)? {
                                    tracing::debug!(
                                        date = %daily.date,
                                        rows = daily.rows_written,
                                        "metrics recomputed"
                                    );
                                }
                            }
                        }

                        if report.cancelled {
                            break;
                        }
                        Phase::Incremental
                    }
                }
                Phase::Idle => {
                    if self.once {
                        tracing::info!("tip reached, exiting (once mode)");
                        break;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                    Phase::Incremental
                }
            };
        }
        Ok(())
    }
}
