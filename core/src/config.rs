//! Engine configuration.
//!
//! Everything is environment-driven with defaults and threaded explicitly
//! through component constructors. There is no process-wide singleton; a
//! binary builds one `EngineConfig`, applies its CLI overrides, and passes
//! it down. No option here changes correctness, only throughput and memory
//! footprint.

use std::path::PathBuf;

use anyhow::{Context, Result};

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_BATCH_BLOCKS: usize = 250;
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10_000;
pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8332";
pub const DEFAULT_PRICE_API_URL: &str = "https://mempool.space/api/v1/historical-price";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub rpc_cookie: Option<PathBuf>,
    pub bitcoin_datadir: Option<PathBuf>,
    pub price_api_url: String,
    pub chainstate_csv: Option<PathBuf>,
    pub exchange_addresses_csv: Option<PathBuf>,
    pub checkpoint_dir: PathBuf,
    pub workers: usize,
    pub batch_blocks: usize,
    pub checkpoint_interval: u64,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(env_var("UTXOLENS_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let db_path = env_var("UTXOLENS_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("utxolens.db"));
        let checkpoint_dir = env_var("UTXOLENS_CHECKPOINT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("checkpoints"));

        let cfg = Self {
            data_dir,
            db_path,
            rpc_url: env_var("BITCOIN_RPC_URL").unwrap_or_else(|| DEFAULT_RPC_URL.into()),
            rpc_user: env_var("BITCOIN_RPC_USER"),
            rpc_password: env_var("BITCOIN_RPC_PASSWORD"),
            rpc_cookie: env_var("BITCOIN_RPC_COOKIE").map(PathBuf::from),
            bitcoin_datadir: env_var("BITCOIN_DATADIR").map(PathBuf::from),
            price_api_url: env_var("PRICE_API_URL").unwrap_or_else(|| DEFAULT_PRICE_API_URL.into()),
            chainstate_csv: env_var("UTXOLENS_CHAINSTATE_CSV").map(PathBuf::from),
            exchange_addresses_csv: env_var("EXCHANGE_ADDRESSES_CSV").map(PathBuf::from),
            checkpoint_dir,
            workers: parse_env("UTXOLENS_WORKERS", DEFAULT_WORKERS)?,
            batch_blocks: parse_env("UTXOLENS_BATCH_BLOCKS", DEFAULT_BATCH_BLOCKS)?,
            checkpoint_interval: parse_env("UTXOLENS_CHECKPOINT_INTERVAL", DEFAULT_CHECKPOINT_INTERVAL)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Configuration errors surface here, at startup, never mid-run.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.workers >= 1, "workers must be >= 1");
        anyhow::ensure!(self.batch_blocks >= 1, "batch_blocks must be >= 1");
        anyhow::ensure!(self.checkpoint_interval >= 1, "checkpoint_interval must be >= 1");
        anyhow::ensure!(
            !self.rpc_url.trim().is_empty(),
            "BITCOIN_RPC_URL must not be empty"
        );
        if let Some(path) = &self.rpc_cookie {
            anyhow::ensure!(
                path.exists(),
                "RPC cookie file {} does not exist",
                path.display()
            );
        }
        Ok(())
    }

    /// Cookie path to try when no explicit user/password is configured:
    /// the explicit `BITCOIN_RPC_COOKIE` first, then `<datadir>/.cookie`.
    pub fn cookie_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.rpc_cookie {
            return Some(path.clone());
        }
        self.bitcoin_datadir.as_ref().map(|d| d.join(".cookie"))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_var(name) {
        Some(v) => v.parse::<T>().with_context(|| format!("invalid {name}: {v}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EngineConfig {
        EngineConfig {
            data_dir: "./data".into(),
            db_path: "./data/utxolens.db".into(),
            rpc_url: DEFAULT_RPC_URL.into(),
            rpc_user: None,
            rpc_password: None,
            rpc_cookie: None,
            bitcoin_datadir: None,
            price_api_url: DEFAULT_PRICE_API_URL.into(),
            chainstate_csv: None,
            exchange_addresses_csv: None,
            checkpoint_dir: "./data/checkpoints".into(),
            workers: DEFAULT_WORKERS,
            batch_blocks: DEFAULT_BATCH_BLOCKS,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }

    #[test]
    fn defaults_are_valid() {
        base().validate().unwrap();
    }

    #[test]
    fn zero_workers_rejected() {
        let mut cfg = base();
        cfg.workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_cookie_file_rejected() {
        let mut cfg = base();
        cfg.rpc_cookie = Some("/nonexistent/.cookie".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cookie_path_falls_back_to_datadir() {
        let mut cfg = base();
        cfg.bitcoin_datadir = Some("/var/bitcoin".into());
        assert_eq!(cfg.cookie_path().unwrap(), PathBuf::from("/var/bitcoin/.cookie"));
    }
}
