//! Incremental block sync: extend creation/spend state over a height range.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use utxolens_core::config::EngineConfig;
use utxolens_core::ingest::{BlockIngestor, ClusterSink, SpendMode};
use utxolens_core::rpc::BitcoinRpc;
use utxolens_core::store::{LifecycleStore, CONCERN_INGEST};
use utxolens_core::CancelFlag;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sync block range into the UTXO store", long_about = None)]
struct Args {
    /// First block to process
    #[arg(long)]
    start_block: Option<u64>,

    /// Last block to process (default: chain tip)
    #[arg(long)]
    end_block: Option<u64>,

    /// Resume from the ingest checkpoint
    #[arg(long)]
    resume: bool,

    /// Parallel RPC fetch workers
    #[arg(long)]
    workers: Option<usize>,

    /// Blocks per persisted batch
    #[arg(long)]
    batch_blocks: Option<usize>,

    /// Decode and report without writing to the store
    #[arg(long)]
    dry_run: bool,

    /// Filter spends against the in-memory unspent set instead of staging
    #[arg(long)]
    prefilter: bool,

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
        eprintln!("sync-blocks: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut cfg = EngineConfig::from_env()?;
    if let Some(path) = args.db_path {
        cfg.db_path = path;
    }
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }
    if let Some(batch) = args.batch_blocks {
        cfg.batch_blocks = batch;
    }
    cfg.validate()?;

    let mut store = LifecycleStore::open(&cfg.db_path)?;
    let rpc = BitcoinRpc::connect(&cfg)?;

    let start = if args.resume {
        let state = store
            .sync_state(CONCERN_INGEST)?
            .and_then(|s| s.last_block)
            .context("no ingest checkpoint to resume from, use --start-block")?;
        state + 1
    } else {
        args.start_block.context("--start-block required (or --resume)")?
    };
    let end = match args.end_block {
        Some(end) => end,
        None => rpc.tip_height().await?,
    };
    if start > end {
        println!("Already synced to chain tip ({end})");
        return Ok(());
    }

    let cancel = CancelFlag::hooked_to_ctrl_c();
    let mode = if args.prefilter { SpendMode::Prefilter } else { SpendMode::Staging };

    let mut ingestor = BlockIngestor::new(&rpc, &mut store, cfg.workers, cfg.batch_blocks)
        .spend_mode(mode)
        .dry_run(args.dry_run);
    let mut sink = ClusterSink::Disabled;
    let report = ingestor.run(start, end, &mut sink, &cancel).await?;

    println!();
    println!("Sync complete:");
    println!("  Blocks:        {start} - {}", report.last_block.unwrap_or(start));
    println!("  Processed:     {}", report.blocks_processed);
    println!("  UTXOs created: {}", report.creations_inserted);
    println!("  UTXOs spent:   {}", report.spends_marked);
    if report.cancelled {
        println!("  (interrupted, checkpoint at last committed batch)");
    }
    Ok(())
}
