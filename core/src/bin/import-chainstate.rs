//! One-time bootstrap: import a chainstate CSV dump into the store.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use utxolens_core::bootstrap::{
    fill_btc_values, fill_creation_prices, import_chainstate_csv, import_stats,
};
use utxolens_core::config::EngineConfig;
use utxolens_core::store::LifecycleStore;

#[derive(Parser, Debug)]
#[command(author, version, about = "Import a chainstate CSV dump", long_about = None)]
struct Args {
    /// CSV file from the chainstate dump tool
    #[arg(long)]
    csv_path: PathBuf,

    /// Path to the analytical DB file (overrides UTXOLENS_DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Fill creation prices after import (needs price/height tables)
    #[arg(long)]
    compute_prices: bool,

    /// Build indexes after import
    #[arg(long)]
    create_indexes: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("import-chainstate: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut cfg = EngineConfig::from_env()?;
    if let Some(path) = args.db_path {
        cfg.db_path = path;
    }

    let mut store = LifecycleStore::open(&cfg.db_path)?;
    let started = std::time::Instant::now();

    let inserted = import_chainstate_csv(&mut store, &args.csv_path)?;
    let elapsed = started.elapsed().as_secs_f64().max(0.001);
    println!("Imported {inserted} UTXOs in {elapsed:.1}s ({:.0} rows/sec)", inserted as f64 / elapsed);

    fill_btc_values(&mut store)?;
    if args.compute_prices {
        let priced = fill_creation_prices(&mut store)?;
        println!("Filled creation prices for {priced} rows");
    }
    if args.create_indexes {
        store.create_indexes()?;
    }

    let stats = import_stats(&store)?;
    println!();
    println!("Import statistics:");
    println!("  Total UTXOs:      {}", stats.total_utxos);
    println!("  Total BTC:        {:.2}", stats.total_btc);
    println!(
        "  Height range:     {} - {}",
        stats.min_height.unwrap_or(0),
        stats.max_height.unwrap_or(0)
    );
    println!("  Unique addresses: {}", stats.unique_addresses);
    Ok(())
}
