use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use utxolens_core::config::EngineConfig;
use utxolens_core::orchestrator::Orchestrator;
use utxolens_core::rpc::BitcoinRpc;
use utxolens_core::store::LifecycleStore;
use utxolens_core::CancelFlag;

#[derive(Parser, Debug)]
#[command(author, version, about = "UTXO lifecycle analytics daemon", long_about = None)]
struct Args {
    /// Path to the analytical DB file (overrides UTXOLENS_DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Parallel RPC fetch workers
    #[arg(long)]
    workers: Option<usize>,

    /// Blocks per persisted batch
    #[arg(long)]
    batch_blocks: Option<usize>,

    /// Blocks between cluster flush / cost-basis recompute / checkpoint
    #[arg(long)]
    checkpoint_interval: Option<u64>,

    /// Seconds between tip polls while idle
    #[arg(long, default_value_t = 30)]
    poll_secs: u64,

    /// Sync to the tip once and exit instead of idling
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("utxolens: {e:#}");
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
    if let Some(interval) = args.checkpoint_interval {
        cfg.checkpoint_interval = interval;
    }
    cfg.validate()?;

    println!("Starting UTXOLens engine");
    println!("DB: {}", cfg.db_path.display());
    println!("RPC: {}", cfg.rpc_url);
    println!("Workers: {}  Batch: {} blocks", cfg.workers, cfg.batch_blocks);

    let store = LifecycleStore::open(&cfg.db_path)?;
    let rpc = BitcoinRpc::connect(&cfg)?;
    let cancel = CancelFlag::hooked_to_ctrl_c();

    let mut orchestrator = Orchestrator::new(
        cfg,
        rpc,
        store,
        cancel,
        Duration::from_secs(args.poll_secs),
        args.once,
    )?;
    orchestrator.run().await
}
