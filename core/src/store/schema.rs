//! Authoritative schema for the analytical store.
//!
//! Tables are created up front; indexes are NOT. Bulk loads run against the
//! bare tables and `create_indexes` is an explicit post-load step, which
//! keeps COPY-style ingestion at line rate.

/// Tables, constraints and the lifecycle view. Idempotent.
pub const SCHEMA_SQL: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS utxo_lifecycle (
    txid                TEXT    NOT NULL,
    vout                INTEGER NOT NULL,
    height              INTEGER NOT NULL,
    coinbase            INTEGER NOT NULL DEFAULT 0,
    amount              INTEGER NOT NULL,
    script_type         TEXT,
    address             TEXT,
    creation_price_usd  REAL,
    btc_value           REAL,
    is_spent            INTEGER NOT NULL DEFAULT 0,
    spent_block         INTEGER,
    spent_timestamp     INTEGER,
    spent_price_usd     REAL,
    PRIMARY KEY (txid, vout),
    CHECK (amount >= 0),
    CHECK (is_spent IN (0, 1)),
    -- Same-block spend chains are legal on-chain, hence >= and not >.
    CHECK (spent_block IS NULL OR spent_block >= height),
    -- Unspent rows carry no spend attributes; spent rows always know the
    -- spending block (the price may be unavailable and stay null).
    CHECK (is_spent = 1 OR (spent_block IS NULL AND spent_timestamp IS NULL AND spent_price_usd IS NULL)),
    CHECK (is_spent = 0 OR spent_block IS NOT NULL)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS block_heights (
    height      INTEGER PRIMARY KEY,
    timestamp   INTEGER NOT NULL,
    block_hash  TEXT
);

CREATE TABLE IF NOT EXISTS daily_prices (
    date       TEXT PRIMARY KEY,
    price_usd  REAL NOT NULL CHECK (price_usd > 0)
);

CREATE TABLE IF NOT EXISTS address_clusters (
    address     TEXT PRIMARY KEY,
    cluster_id  TEXT NOT NULL,
    first_seen  INTEGER,
    last_seen   INTEGER
);

CREATE TABLE IF NOT EXISTS wallet_cost_basis (
    cluster_id          TEXT    NOT NULL,
    acquisition_block   INTEGER NOT NULL,
    btc_amount          REAL    NOT NULL CHECK (btc_amount > 0),
    weighted_price_usd  REAL    NOT NULL CHECK (weighted_price_usd >= 0),
    earliest_timestamp  INTEGER,
    PRIMARY KEY (cluster_id, acquisition_block)
);

CREATE TABLE IF NOT EXISTS exchange_addresses (
    exchange_name  TEXT NOT NULL,
    address        TEXT PRIMARY KEY,
    type           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_state (
    concern     TEXT PRIMARY KEY,
    last_block  INTEGER,
    last_date   TEXT,
    updated_at  INTEGER
);

CREATE TABLE IF NOT EXISTS metrics_daily (
    metric        TEXT NOT NULL,
    date          TEXT NOT NULL,
    value         REAL,
    detail        TEXT,
    confidence    REAL CHECK (confidence >= 0 AND confidence <= 1),
    block_height  INTEGER,
    created_at    INTEGER,
    PRIMARY KEY (metric, date)
);

CREATE VIEW IF NOT EXISTS utxo_lifecycle_full AS
SELECT
    u.txid,
    u.vout,
    u.height                                   AS creation_block,
    bh.timestamp                               AS creation_timestamp,
    u.coinbase,
    u.amount,
    u.script_type,
    u.address,
    u.creation_price_usd,
    COALESCE(u.btc_value, u.amount / 100000000.0)            AS btc_value,
    u.creation_price_usd * COALESCE(u.btc_value, u.amount / 100000000.0)
                                               AS realized_value_usd,
    u.is_spent,
    u.spent_block,
    u.spent_timestamp,
    u.spent_price_usd,
    CASE
        WHEN u.is_spent = 1 AND u.spent_timestamp IS NOT NULL AND bh.timestamp IS NOT NULL
        THEN (u.spent_timestamp - bh.timestamp) / 86400.0
    END                                        AS age_days
FROM utxo_lifecycle u
LEFT JOIN block_heights bh ON bh.height = u.height;
"#;

/// Deferred indexes, built once after bulk load.
pub const INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_utxo_height          ON utxo_lifecycle(height);
CREATE INDEX IF NOT EXISTS idx_utxo_is_spent        ON utxo_lifecycle(is_spent);
CREATE INDEX IF NOT EXISTS idx_utxo_creation_price  ON utxo_lifecycle(creation_price_usd);
CREATE INDEX IF NOT EXISTS idx_utxo_address         ON utxo_lifecycle(address);
CREATE INDEX IF NOT EXISTS idx_utxo_spent_block     ON utxo_lifecycle(spent_block);
CREATE INDEX IF NOT EXISTS idx_utxo_spent_ts        ON utxo_lifecycle(spent_timestamp);
CREATE INDEX IF NOT EXISTS idx_block_heights_ts     ON block_heights(timestamp);
CREATE INDEX IF NOT EXISTS idx_clusters_cluster_id  ON address_clusters(cluster_id);
"#;
