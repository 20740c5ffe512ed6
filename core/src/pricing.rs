//! Price & height index.
//!
//! Read side: `PriceIndex` wraps any connection and answers
//! `price_for_date`, `price_for_block` (height -> block timestamp ->
//! calendar date -> price bar) and `height_of_timestamp` (closest block at
//! or before). Missing days return `None`; callers decide whether to skip,
//! carry forward or zero out, per metric.
//!
//! Write side: `PriceFeed` backfills the daily price table from an HTTP
//! endpoint answering `{"USD": <float>}` for a Unix timestamp, skipping
//! dates already present; `backfill_block_heights` fills the height table
//! from the node via batched header fetches.

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};

use crate::rpc::BitcoinRpc;
use crate::store::{HeightRow, LifecycleStore};

pub struct PriceIndex<'a> {
    conn: &'a Connection,
}

impl<'a> PriceIndex<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Daily close for `date`, if the bar exists.
    pub fn price_for_date(&self, date: NaiveDate) -> Result<Option<f64>> {
        let price = self
            .conn
            .query_row(
                "SELECT price_usd FROM daily_prices WHERE date = ?1",
                params![date.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(price)
    }

    /// Price at the block's calendar date. None when either the height or
    /// the day's bar is missing.
    pub fn price_for_block(&self, height: u64) -> Result<Option<f64>> {
        let price = self
            .conn
            .query_row(
                "SELECT p.price_usd
                 FROM block_heights h
                 JOIN daily_prices p ON p.date = date(h.timestamp, 'unixepoch')
                 WHERE h.height = ?1",
                params![height],
                |r| r.get(0),
            )
            .optional()?;
        Ok(price)
    }

    /// Closest block at or before `ts`.
    pub fn height_of_timestamp(&self, ts: i64) -> Result<Option<u64>> {
        let height = self
            .conn
            .query_row(
                "SELECT height FROM block_heights
                 WHERE timestamp <= ?1
                 ORDER BY timestamp DESC LIMIT 1",
                params![ts],
                |r| r.get(0),
            )
            .optional()?;
        Ok(height)
    }

    pub fn timestamp_of_height(&self, height: u64) -> Result<Option<i64>> {
        let ts = self
            .conn
            .query_row(
                "SELECT timestamp FROM block_heights WHERE height = ?1",
                params![height],
                |r| r.get(0),
            )
            .optional()?;
        Ok(ts)
    }

    /// Inclusive block range whose timestamps fall on `date`, or None when
    /// the height table has no blocks for that day.
    pub fn blocks_for_date(&self, date: NaiveDate) -> Result<Option<(u64, u64)>> {
        let start = date.and_hms_opt(0, 0, 0).context("invalid date")?.and_utc().timestamp();
        let end = start + 86_400;
        let range: Option<(Option<u64>, Option<u64>)> = self
            .conn
            .query_row(
                "SELECT MIN(height), MAX(height) FROM block_heights
                 WHERE timestamp >= ?1 AND timestamp < ?2",
                params![start, end],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(match range {
            Some((Some(lo), Some(hi))) => Some((lo, hi)),
            _ => None,
        })
    }

    pub fn max_indexed_height(&self) -> Result<Option<u64>> {
        let h = self
            .conn
            .query_row("SELECT MAX(height) FROM block_heights", [], |r| r.get(0))
            .optional()?
            .flatten();
        Ok(h)
    }
}

/// Backfill client for the daily price endpoint.
pub struct PriceFeed {
    client: reqwest::Client,
    base_url: String,
}

#[derive(serde::Deserialize)]
struct PricePoint {
    #[serde(rename = "USD")]
    usd: Option<f64>,
}

impl PriceFeed {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building price feed client")?;
        Ok(Self { client, base_url: base_url.to_string() })
    }

    /// One day's USD close, queried at midnight UTC of `date`. Zero or
    /// missing prices come back as None; they are never fabricated.
    pub async fn fetch_price(&self, date: NaiveDate) -> Result<Option<f64>> {
        let ts = date
            .and_hms_opt(0, 0, 0)
            .context("invalid date")?
            .and_utc()
            .timestamp();
        let url = format!("{}?currency=USD&timestamp={ts}", self.base_url);
        let point: PricePoint = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("fetching price for {date}"))?
            .error_for_status()
            .with_context(|| format!("price endpoint rejected {date}"))?
            .json()
            .await
            .with_context(|| format!("decoding price for {date}"))?;
        Ok(point.usd.filter(|p| *p > 0.0))
    }

    /// Fill `daily_prices` over `[start, end]`, skipping dates already
    /// present. Returns how many bars were inserted.
    pub async fn backfill(
        &self,
        store: &mut LifecycleStore,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<u64> {
        let mut inserted = 0u64;
        let mut missing = 0u64;
        let mut date = start;
        while date <= end {
            let already: bool = store
                .conn()
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM daily_prices WHERE date = ?1)",
                    params![date.to_string()],
                    |r| r.get(0),
                )?;
            if !already {
                match self.fetch_price(date).await? {
                    Some(price) => {
                        store.insert_price(date, price)?;
                        inserted += 1;
                    }
                    None => {
                        tracing::warn!(%date, "no price for date, leaving gap");
                        missing += 1;
                    }
                }
            }
            date = date
                .checked_add_days(Days::new(1))
                .context("date overflow while backfilling")?;
        }
        tracing::info!(inserted, missing, %start, %end, "price backfill done");
        Ok(inserted)
    }
}

/// Fill `block_heights` over `[start, end]` from the node. Batches hash and
/// header lookups; heights above the tip shorten the run.
pub async fn backfill_block_heights(
    rpc: &BitcoinRpc,
    store: &mut LifecycleStore,
    start: u64,
    end: u64,
) -> Result<u64> {
    const CHUNK: usize = 500;
    let mut inserted = 0u64;
    let mut height = start;
    while height <= end {
        let chunk_end = (height + CHUNK as u64 - 1).min(end);
        let heights: Vec<u64> = (height..=chunk_end).collect();
        let hashes = rpc.batch_block_hashes(&heights).await?;
        if hashes.is_empty() {
            break;
        }
        let truncated = hashes.len() < heights.len();
        let headers = rpc.batch_block_headers(&hashes).await?;
        let rows: Vec<HeightRow> = headers
            .into_iter()
            .map(|h| HeightRow { height: h.height, timestamp: h.time, block_hash: h.hash })
            .collect();
        inserted += store.insert_block_heights(&rows)?;
        if truncated {
            break;
        }
        height = chunk_end + 1;
    }
    tracing::info!(inserted, start, end, "block height backfill done");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LifecycleStore;

    fn seeded_store() -> (tempfile::TempDir, LifecycleStore) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LifecycleStore::open(&dir.path().join("p.db")).unwrap();
        // Three blocks across two calendar days.
        let day = 86_400i64;
        let t0 = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        store
            .insert_block_heights(&[
                HeightRow { height: 100, timestamp: t0 + 600, block_hash: "h100".into() },
                HeightRow { height: 101, timestamp: t0 + 1_200, block_hash: "h101".into() },
                HeightRow { height: 102, timestamp: t0 + day + 600, block_hash: "h102".into() },
            ])
            .unwrap();
        store.insert_price(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 42_000.0).unwrap();
        (dir, store)
    }

    #[test]
    fn block_price_joins_height_to_date() {
        let (_dir, store) = seeded_store();
        let idx = PriceIndex::new(store.conn());
        assert_eq!(idx.price_for_block(100).unwrap(), Some(42_000.0));
        assert_eq!(idx.price_for_block(101).unwrap(), Some(42_000.0));
        // Jan 2 has no price bar: null propagation, never fabricated.
        assert_eq!(idx.price_for_block(102).unwrap(), None);
        // Unknown height.
        assert_eq!(idx.price_for_block(999).unwrap(), None);
    }

    #[test]
    fn height_of_timestamp_is_at_or_before() {
        let (_dir, store) = seeded_store();
        let idx = PriceIndex::new(store.conn());
        let t0 = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        assert_eq!(idx.height_of_timestamp(t0 + 700).unwrap(), Some(100));
        assert_eq!(idx.height_of_timestamp(t0 + 1_200).unwrap(), Some(101));
        assert_eq!(idx.height_of_timestamp(t0 - 1).unwrap(), None);
    }

    #[test]
    fn blocks_for_date_bounds_the_day() {
        let (_dir, store) = seeded_store();
        let idx = PriceIndex::new(store.conn());
        let jan1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let jan2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let jan3 = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        assert_eq!(idx.blocks_for_date(jan1).unwrap(), Some((100, 101)));
        assert_eq!(idx.blocks_for_date(jan2).unwrap(), Some((102, 102)));
        assert_eq!(idx.blocks_for_date(jan3).unwrap(), None);
    }

    #[test]
    fn duplicate_price_bars_are_rejected() {
        let (_dir, mut store) = seeded_store();
        let jan1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        // Second insert for the same date is ignored, first bar wins.
        assert!(!store.insert_price(jan1, 99_999.0).unwrap());
        let idx = PriceIndex::new(store.conn());
        assert_eq!(idx.price_for_date(jan1).unwrap(), Some(42_000.0));
    }
}
