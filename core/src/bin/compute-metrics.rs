//! Compute and persist the daily metric family for one date or a trailing
//! backfill window.

use std::path::PathBuf;

use anyhow::Context;
use chrono::{Days, NaiveDate};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use utxolens_core::config::EngineConfig;
use utxolens_core::metrics::MetricEngine;
use utxolens_core::store::LifecycleStore;

#[derive(Parser, Debug)]
#[command(author, version, about = "Compute daily on-chain metrics", long_about = None)]
struct Args {
    /// Date to compute (YYYY-MM-DD)
    #[arg(long, conflicts_with = "backfill")]
    date: Option<NaiveDate>,

    /// Recompute the last N dates ending at the newest indexed block's date
    #[arg(long)]
    backfill: Option<u64>,

    /// Compute and report without writing metric rows
    #[arg(long)]
    dry_run: bool,

    /// Path to the analytical DB file (overrides UTXOLENS_DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("compute-metrics: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut cfg = EngineConfig::from_env()?;
    if let Some(path) = args.db_path {
        cfg.db_path = path;
    }

    let mut store = LifecycleStore::open(&cfg.db_path)?;

    let dates: Vec<NaiveDate> = match (args.date, args.backfill) {
        (Some(date), _) => vec![date],
        (None, Some(days)) => {
            let newest_ts: Option<i64> = store
                .conn()
                .query_row("SELECT MAX(timestamp) FROM block_heights", [], |r| r.get(0))?;
            let newest = chrono::DateTime::from_timestamp(newest_ts.context("height index is empty")?, 0)
                .context("invalid newest block timestamp")?
                .date_naive();
            (0..days)
                .rev()
                .filter_map(|back| newest.checked_sub_days(Days::new(back)))
                .collect()
        }
        (None, None) => anyhow::bail!("pass --date or --backfill"),
    };

    let mut engine = MetricEngine::new(&mut store).dry_run(args.dry_run);
    let mut computed = 0u64;
    let mut skipped = 0u64;
    for date in dates {
        match engine.compute_for_date(date)? {
            Some(report) => {
                computed += 1;
                println!(
                    "{date}: blocks {}-{}, {} metric rows{}",
                    report.block_range.0,
                    report.block_range.1,
                    report.rows_written,
                    if args.dry_run { " (dry run)" } else { "" }
                );
            }
            None => {
                skipped += 1;
                println!("{date}: no blocks indexed, skipped");
            }
        }
    }
    println!();
    println!("Done: {computed} dates computed, {skipped} skipped");
    Ok(())
}
