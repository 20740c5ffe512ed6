//! Backfill the daily price table from the price feed and the block-height
//! table from the node.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use utxolens_core::config::EngineConfig;
use utxolens_core::pricing::{backfill_block_heights, PriceFeed, PriceIndex};
use utxolens_core::rpc::BitcoinRpc;
use utxolens_core::store::LifecycleStore;

#[derive(Parser, Debug)]
#[command(author, version, about = "Backfill daily prices and block heights", long_about = None)]
struct Args {
    /// First date to fetch (YYYY-MM-DD)
    #[arg(long, default_value = "2011-01-01")]
    start_date: NaiveDate,

    /// Last date to fetch (default: last fully elapsed day is up to the
    /// operator; pass it explicitly)
    #[arg(long)]
    end_date: NaiveDate,

    /// Price endpoint base URL (overrides PRICE_API_URL)
    #[arg(long)]
    price_url: Option<String>,

    /// Skip the price backfill
    #[arg(long)]
    skip_prices: bool,

    /// Skip the block-height backfill
    #[arg(long)]
    skip_heights: bool,

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
        eprintln!("backfill-prices: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut cfg = EngineConfig::from_env()?;
    if let Some(path) = args.db_path {
        cfg.db_path = path;
    }
    if let Some(url) = args.price_url {
        cfg.price_api_url = url;
    }

    let mut store = LifecycleStore::open(&cfg.db_path)?;

    if !args.skip_heights {
        let rpc = BitcoinRpc::connect(&cfg)?;
        let tip = rpc.tip_height().await?;
        let start = PriceIndex::new(store.conn())
            .max_indexed_height()?
            .map(|h| h + 1)
            .unwrap_or(0);
        if start <= tip {
            let inserted = backfill_block_heights(&rpc, &mut store, start, tip).await?;
            println!("Inserted {inserted} block heights ({start} - {tip})");
        } else {
            println!("Block heights already at tip ({tip})");
        }
    }

    if !args.skip_prices {
        let feed = PriceFeed::new(&cfg.price_api_url)?;
        let inserted = feed.backfill(&mut store, args.start_date, args.end_date).await?;
        println!("Inserted {inserted} daily prices ({} - {})", args.start_date, args.end_date);
    }

    Ok(())
}
