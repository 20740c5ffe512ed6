//! The UTXO store: a single SQLite file owning every persisted entity
//! (UTXO rows, price bars, block heights, cluster map, cost basis, sync
//! state, metric rows).
//!
//! Single writer by design; readers open separate read-only connections.
//! Bulk primitives only: creation rows append in one transaction per batch,
//! spends land in a staging table and apply as one set-based `UPDATE ...
//! FROM` join (per-row UPDATE is orders of magnitude slower here), and every
//! destructive operation is bracketed by an explicit transaction that rolls
//! back on any failure path.

mod schema;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OpenFlags};

pub use schema::{INDEX_SQL, SCHEMA_SQL};

/// Sync-state concerns, one row each.
pub const CONCERN_INGEST: &str = "ingest";
pub const CONCERN_CLUSTER_FLUSH: &str = "cluster_flush";
pub const CONCERN_METRICS: &str = "metrics";

/// A creation row, one per transaction output.
#[derive(Debug, Clone)]
pub struct CreationRow {
    pub txid: String,
    pub vout: u32,
    pub height: u64,
    pub coinbase: bool,
    pub amount_sats: i64,
    pub script_type: Option<String>,
    pub address: Option<String>,
    pub creation_price_usd: Option<f64>,
}

/// A spend observation: the outpoint being consumed plus the spending
/// block's attributes.
#[derive(Debug, Clone)]
pub struct SpendRecord {
    pub txid: String,
    pub vout: u32,
    pub spent_block: u64,
    pub spent_timestamp: i64,
    pub spent_price_usd: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct HeightRow {
    pub height: u64,
    pub timestamp: i64,
    pub block_hash: String,
}

/// Everything one ingest batch persists atomically.
#[derive(Debug, Default)]
pub struct IngestBatch {
    pub creations: Vec<CreationRow>,
    pub spends: Vec<SpendRecord>,
    pub heights: Vec<HeightRow>,
    pub last_block: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub creations_inserted: u64,
    pub spends_marked: u64,
}

#[derive(Debug, Clone)]
pub struct SyncState {
    pub last_block: Option<u64>,
    pub last_date: Option<NaiveDate>,
}

pub struct LifecycleStore {
    conn: Connection,
    path: PathBuf,
}

impl LifecycleStore {
    /// Open (creating if needed) the store and ensure the schema exists.
    /// Indexes are NOT created here; see [`LifecycleStore::create_indexes`].
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening store {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA_SQL).context("applying schema")?;
        tracing::debug!(path = %path.display(), "lifecycle store open");
        Ok(Self { conn, path: path.to_path_buf() })
    }

    /// A separate read-only connection for concurrent readers.
    pub fn open_read_only(path: &Path) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("opening {} read-only", path.display()))?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Build the deferred indexes (post bulk-load step).
    pub fn create_indexes(&self) -> Result<()> {
        self.conn.execute_batch(INDEX_SQL).context("building indexes")?;
        tracing::info!("store indexes built");
        Ok(())
    }

    pub fn utxo_count(&self) -> Result<u64> {
        let n: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM utxo_lifecycle", [], |r| r.get(0))?;
        Ok(n)
    }

    /// Apply one ingest batch in a single transaction: block heights, then
    /// creation rows, then the staged spend join, then the checkpoint.
    /// Creations use INSERT OR IGNORE and the spend join only touches rows
    /// still unspent, so replaying an already-processed range is a no-op.
    pub fn apply_batch(&mut self, batch: &IngestBatch) -> Result<BatchStats> {
        let tx = self.conn.transaction()?;
        let mut stats = BatchStats::default();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO block_heights (height, timestamp, block_hash) VALUES (?1, ?2, ?3)",
            )?;
            for h in &batch.heights {
                stmt.execute(params![h.height, h.timestamp, h.block_hash])?;
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO utxo_lifecycle
                   (txid, vout, height, coinbase, amount, script_type, address,
                    creation_price_usd, btc_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?5 / 100000000.0)",
            )?;
            for row in &batch.creations {
                stats.creations_inserted += stmt.execute(params![
                    row.txid,
                    row.vout,
                    row.height,
                    row.coinbase,
                    row.amount_sats,
                    row.script_type,
                    row.address,
                    row.creation_price_usd,
                ])? as u64;
            }
        }

        if !batch.spends.is_empty() {
            tx.execute_batch(
                "CREATE TEMP TABLE IF NOT EXISTS spent_staging (
                     txid TEXT NOT NULL,
                     vout INTEGER NOT NULL,
                     spent_block INTEGER NOT NULL,
                     spent_timestamp INTEGER NOT NULL,
                     spent_price_usd REAL
                 );
                 CREATE INDEX IF NOT EXISTS idx_spent_staging ON spent_staging(txid, vout);
                 DELETE FROM spent_staging;",
            )?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO spent_staging (txid, vout, spent_block, spent_timestamp, spent_price_usd)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for s in &batch.spends {
                    stmt.execute(params![
                        s.txid,
                        s.vout,
                        s.spent_block,
                        s.spent_timestamp,
                        s.spent_price_usd
                    ])?;
                }
            }
            // The is_spent guard makes spend fields write-once: once set
            // they never revert, and replays change nothing.
            tx.execute(
                "UPDATE utxo_lifecycle SET
                     is_spent = 1,
                     spent_block = s.spent_block,
                     spent_timestamp = s.spent_timestamp,
                     spent_price_usd = s.spent_price_usd
                 FROM spent_staging AS s
                 WHERE utxo_lifecycle.txid = s.txid
                   AND utxo_lifecycle.vout = s.vout
                   AND utxo_lifecycle.is_spent = 0",
                [],
            )?;
            stats.spends_marked = tx.changes();
            tx.execute("DELETE FROM spent_staging", [])?;
        }

        tx.execute(
            "INSERT INTO sync_state (concern, last_block, updated_at)
             VALUES (?1, ?2, strftime('%s','now'))
             ON CONFLICT (concern) DO UPDATE SET
                 last_block = excluded.last_block,
                 updated_at = excluded.updated_at",
            params![CONCERN_INGEST, batch.last_block],
        )?;

        tx.commit()?;
        Ok(stats)
    }

    /// The set of currently unspent outpoints (pre-filter spend mode). This
    /// costs ~N x (txid + int) of memory; large ranges should prefer the
    /// staging mode.
    pub fn load_unspent_outpoints(&self) -> Result<HashSet<(String, u32)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT txid, vout FROM utxo_lifecycle WHERE is_spent = 0")?;
        let mut set = HashSet::new();
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?;
        for row in rows {
            set.insert(row?);
        }
        Ok(set)
    }

    pub fn sync_state(&self, concern: &str) -> Result<Option<SyncState>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT last_block, last_date FROM sync_state WHERE concern = ?1")?;
        let mut rows = stmt.query(params![concern])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let last_block: Option<u64> = row.get(0)?;
        let last_date: Option<String> = row.get(1)?;
        Ok(Some(SyncState {
            last_block,
            last_date: last_date.and_then(|d| d.parse().ok()),
        }))
    }

    pub fn set_sync_state(
        &mut self,
        concern: &str,
        last_block: Option<u64>,
        last_date: Option<NaiveDate>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_state (concern, last_block, last_date, updated_at)
             VALUES (?1, ?2, ?3, strftime('%s','now'))
             ON CONFLICT (concern) DO UPDATE SET
                 last_block = excluded.last_block,
                 last_date = excluded.last_date,
                 updated_at = excluded.updated_at",
            params![concern, last_block, last_date.map(|d| d.to_string())],
        )?;
        Ok(())
    }

    pub fn insert_price(&mut self, date: NaiveDate, price_usd: f64) -> Result<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO daily_prices (date, price_usd) VALUES (?1, ?2)",
            params![date.to_string(), price_usd],
        )?;
        Ok(n > 0)
    }

    pub fn insert_block_heights(&mut self, rows: &[HeightRow]) -> Result<u64> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0u64;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO block_heights (height, timestamp, block_hash) VALUES (?1, ?2, ?3)",
            )?;
            for row in rows {
                inserted += stmt.execute(params![row.height, row.timestamp, row.block_hash])? as u64;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Persist one metric row; recomputation overwrites.
    pub fn upsert_metric(
        &mut self,
        metric: &str,
        date: NaiveDate,
        value: Option<f64>,
        detail: &str,
        confidence: f64,
        block_height: Option<u64>,
    ) -> Result<()> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&confidence),
            "confidence {confidence} outside [0,1] for {metric}"
        );
        self.conn.execute(
            "INSERT OR REPLACE INTO metrics_daily
               (metric, date, value, detail, confidence, block_height, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, strftime('%s','now'))",
            params![metric, date.to_string(), value, detail, confidence, block_height],
        )?;
        Ok(())
    }

    /// Retention primitive: drop spent rows created before the cutoff date.
    /// Returns the number of rows deleted. Unbounded retention is the
    /// default; this is only invoked explicitly.
    pub fn prune_spent_before(&mut self, cutoff: NaiveDate) -> Result<u64> {
        let cutoff_ts = cutoff
            .and_hms_opt(0, 0, 0)
            .context("invalid cutoff date")?
            .and_utc()
            .timestamp();
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM utxo_lifecycle
             WHERE is_spent = 1
               AND height IN (SELECT height FROM block_heights WHERE timestamp < ?1)",
            params![cutoff_ts],
        )?;
        let deleted = tx.changes();
        tx.commit()?;
        tracing::info!(deleted, cutoff = %cutoff, "pruned spent rows");
        Ok(deleted)
    }
}
