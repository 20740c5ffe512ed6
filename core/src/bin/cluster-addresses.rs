//! Offline clustering pass: stream blocks, feed multi-input address sets to
//! the disjoint-set, checkpoint periodically, then flush the cluster table
//! and recompute the wallet cost basis.
//!
//! With `--spool-dir` the pass runs in two phases like the bulk bootstrap:
//! extraction writes address pairs to a CSV spool, then the spool is merged
//! into the disjoint-set. Without it, hints feed the structure directly.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use utxolens_cluster::{checkpoint, UnionFind};

use utxolens_core::config::EngineConfig;
use utxolens_core::costbasis::{flush_clusters, recompute_cost_basis};
use utxolens_core::ingest::{
    extract_cluster_hints, fetch_blocks_ordered, merge_spool_into, ClusterSink,
};
use utxolens_core::rpc::BitcoinRpc;
use utxolens_core::store::{LifecycleStore, CONCERN_CLUSTER_FLUSH};
use utxolens_core::CancelFlag;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cluster addresses by the multi-input heuristic", long_about = None)]
struct Args {
    /// First block to process
    #[arg(long, default_value_t = 0)]
    start_block: u64,

    /// Last block to process (default: chain tip)
    #[arg(long)]
    end_block: Option<u64>,

    /// Resume from the newest union-find checkpoint
    #[arg(long)]
    resume: bool,

    /// Parallel RPC fetch workers
    #[arg(long)]
    workers: Option<usize>,

    /// Blocks between checkpoints
    #[arg(long)]
    checkpoint_interval: Option<u64>,

    /// Directory for union-find checkpoints (overrides UTXOLENS_CHECKPOINT_DIR)
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Write address pairs to a spool in this directory, then merge (two
    /// phases) instead of feeding the structure inline
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// Path to the analytical DB file (overrides UTXOLENS_DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("cluster-addresses: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut cfg = EngineConfig::from_env()?;
    if let Some(path) = args.db_path {
        cfg.db_path = path;
    }
    if let Some(dir) = args.checkpoint_dir {
        cfg.checkpoint_dir = dir;
    }
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }
    if let Some(interval) = args.checkpoint_interval {
        cfg.checkpoint_interval = interval;
    }
    cfg.validate()?;

    let mut store = LifecycleStore::open(&cfg.db_path)?;
    let rpc = BitcoinRpc::connect(&cfg)?;
    let cancel = CancelFlag::hooked_to_ctrl_c();

    let (mut uf, mut next) = if args.resume {
        match checkpoint::load_latest(&cfg.checkpoint_dir)? {
            Some((uf, height)) => {
                println!("Resuming from checkpoint at block {height} ({} addresses)", uf.len());
                (uf, height + 1)
            }
            None => {
                println!("No checkpoint found, starting at block {}", args.start_block);
                (UnionFind::new(), args.start_block)
            }
        }
    } else {
        (UnionFind::new(), args.start_block)
    };

    let end = match args.end_block {
        Some(end) => end,
        None => rpc.tip_height().await?,
    };

    let spool_path = match &args.spool_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Some(dir.join(format!("pairs_{next}_{end}.csv")))
        }
        None => None,
    };
    let mut sink = match &spool_path {
        Some(path) => ClusterSink::spool(path)?,
        None => ClusterSink::InProcess(&mut uf),
    };

    let chunk = (cfg.workers * 20).max(1) as u64;
    let mut blocks_processed = 0u64;
    let mut hints = 0u64;
    let mut since_checkpoint = 0u64;
    let mut last_block = next.saturating_sub(1);

    // Phase 1: extract hints (into the spool or straight into the set).
    while next <= end {
        if cancel.is_cancelled() {
            println!("Interrupted at block {last_block}");
            break;
        }
        let chunk_end = (next + chunk - 1).min(end);
        let heights: Vec<u64> = (next..=chunk_end).collect();
        let blocks = fetch_blocks_ordered(&rpc, &heights, cfg.workers).await?;
        let reached_tip = blocks.len() < heights.len();

        for block in &blocks {
            for addrs in extract_cluster_hints(block) {
                sink.observe(&addrs)?;
                hints += 1;
            }
            last_block = block.height;
            blocks_processed += 1;
            since_checkpoint += 1;
        }

        // Inline mode checkpoints as it goes; spool mode checkpoints after
        // the merge.
        if spool_path.is_none() && since_checkpoint >= cfg.checkpoint_interval {
            if let ClusterSink::InProcess(uf) = &sink {
                checkpoint::save(&cfg.checkpoint_dir, uf, last_block)?;
            }
            since_checkpoint = 0;
        }
        if blocks_processed % 10_000 < chunk {
            tracing::info!(last_block, blocks_processed, hints, "clustering progress");
        }
        if reached_tip {
            break;
        }
        next = chunk_end + 1;
    }

    sink.finish()?;

    // Phase 2 (spool mode): merge the pairs into the disjoint-set.
    if let Some(path) = &spool_path {
        let pairs = merge_spool_into(&mut uf, path)?;
        println!("Merged {pairs} pairs from {}", path.display());
        std::fs::remove_file(path)?;
    }

    checkpoint::save(&cfg.checkpoint_dir, &uf, last_block)?;
    let stats = uf.stats();

    // Phase 3: persist the projection and rebuild the cost basis on it.
    let now_ts: i64 = store
        .conn()
        .query_row("SELECT COALESCE(MAX(timestamp), 0) FROM block_heights", [], |r| r.get(0))?;
    let saved = flush_clusters(&mut store, &mut uf, now_ts)?;
    let basis_rows = recompute_cost_basis(&mut store)?;
    store.set_sync_state(CONCERN_CLUSTER_FLUSH, Some(last_block), None)?;

    println!();
    println!("Clustering complete:");
    println!("  Blocks processed:  {blocks_processed}");
    println!("  Multi-input hints: {hints}");
    println!("  Addresses:         {}", stats.total_addresses);
    println!("  Clusters:          {}", stats.cluster_count);
    println!("  Largest cluster:   {}", stats.max_cluster_size);
    println!("  Rows flushed:      {saved}");
    println!("  Cost-basis rows:   {basis_rows}");
    Ok(())
}
