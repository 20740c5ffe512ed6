//! Chain source adapter: JSON-RPC client for a trusted Bitcoin Core node.
//!
//! Auth is basic auth, either explicit user/password or the node's cookie
//! file. Batch calls pack multiple requests into one HTTP POST as a JSON
//! array. The client is cheap to clone and safe to share across workers:
//! connection pooling is disabled so each in-flight call rides its own
//! connection, which avoids head-of-line blocking under bursty fan-out.
//!
//! Transient failures (transport errors, HTTP 5xx, a node still warming up)
//! retry with exponential backoff up to a small budget; authentication
//! failures surface immediately; a height above the tip is not an error,
//! the caller just observes a shorter result slice.

pub mod types;

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::EngineConfig;
pub use types::{Block, BlockHeader};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_RETRIES: u32 = 4;
const BACKOFF_BASE_MS: u64 = 500;
/// Blocks fetched per batched `getblock` request; verbosity-3 blocks are
/// large, so this stays well below the hash batch size.
const BLOCKS_PER_BATCH: usize = 10;
/// Bitcoin Core "Block height out of range".
const ERR_OUT_OF_RANGE: i64 = -8;
/// Bitcoin Core "Loading block index..." (still warming up).
const ERR_WARMING_UP: i64 = -28;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc transport failure: {0}")]
    Transport(String),
    #[error("rpc authentication rejected (HTTP {0})")]
    Auth(u16),
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },
    #[error("malformed rpc response: {0}")]
    Protocol(String),
}

impl RpcError {
    fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport(_) => true,
            RpcError::Node { code, .. } => *code == ERR_WARMING_UP,
            _ => false,
        }
    }

    fn is_out_of_range(&self) -> bool {
        matches!(self, RpcError::Node { code, .. } if *code == ERR_OUT_OF_RANGE)
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Clone)]
pub struct BitcoinRpc {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl BitcoinRpc {
    /// Resolve credentials and build the client. Missing credentials are a
    /// configuration error and surface here, before any sync work starts.
    pub fn connect(cfg: &EngineConfig) -> Result<Self> {
        let (user, password) = match (&cfg.rpc_user, &cfg.rpc_password) {
            (Some(u), Some(p)) => (u.clone(), p.clone()),
            _ => {
                let cookie_path = cfg.cookie_path().context(
                    "no RPC credentials: set BITCOIN_RPC_USER/BITCOIN_RPC_PASSWORD, \
                     BITCOIN_RPC_COOKIE, or BITCOIN_DATADIR",
                )?;
                let cookie = fs::read_to_string(&cookie_path)
                    .with_context(|| format!("reading RPC cookie {}", cookie_path.display()))?;
                let (u, p) = cookie
                    .trim()
                    .split_once(':')
                    .context("malformed RPC cookie (expected user:password)")?;
                (u.to_string(), p.to_string())
            }
        };

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            // One connection per in-flight call; nothing mutable is shared.
            .pool_max_idle_per_host(0)
            .build()
            .context("building HTTP client")?;

        tracing::info!(url = %cfg.rpc_url, "chain RPC client ready");
        Ok(Self {
            client,
            url: cfg.rpc_url.clone(),
            user,
            password,
        })
    }

    async fn post(&self, body: Value) -> Result<Value, RpcError> {
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(RpcError::Auth(status.as_u16()));
        }
        // Core answers RPC-level errors with 500 and a JSON body; anything
        // without a parsable body is a transport-class failure.
        let value: Value = response
            .json()
            .await
            .map_err(|e| RpcError::Transport(format!("HTTP {status}: {e}")))?;
        Ok(value)
    }

    async fn post_with_retry(&self, body: Value) -> Result<Value, RpcError> {
        let mut attempt = 0;
        loop {
            match self.post(body.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    let delay = Duration::from_millis(BACKOFF_BASE_MS << attempt);
                    tracing::warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "rpc retry");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn unpack(raw: Value) -> Result<Value, RpcError> {
        let resp: RpcResponse = serde_json::from_value(raw)
            .map_err(|e| RpcError::Protocol(e.to_string()))?;
        if let Some(err) = resp.error {
            return Err(RpcError::Node { code: err.code, message: err.message });
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    /// Single JSON-RPC call.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let body = serde_json::to_value(RpcRequest {
            jsonrpc: "2.0",
            id: 0,
            method: method.to_string(),
            params,
        })
        .map_err(|e| RpcError::Protocol(e.to_string()))?;
        Self::unpack(self.post_with_retry(body).await?)
    }

    /// Batched calls in one HTTP transaction. Results come back in request
    /// order regardless of how the node ordered its reply array.
    pub async fn batch(
        &self,
        requests: Vec<(&'static str, Value)>,
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let n = requests.len();
        let body: Vec<RpcRequest> = requests
            .into_iter()
            .enumerate()
            .map(|(i, (method, params))| RpcRequest {
                jsonrpc: "2.0",
                id: i as u64,
                method: method.to_string(),
                params,
            })
            .collect();
        let raw = self
            .post_with_retry(serde_json::to_value(&body).map_err(|e| RpcError::Protocol(e.to_string()))?)
            .await?;

        let entries: Vec<Value> = serde_json::from_value(raw)
            .map_err(|e| RpcError::Protocol(format!("batch reply is not an array: {e}")))?;
        if entries.len() != n {
            return Err(RpcError::Protocol(format!(
                "batch reply has {} entries, expected {n}",
                entries.len()
            )));
        }

        let mut slots: Vec<Option<Result<Value, RpcError>>> = (0..n).map(|_| None).collect();
        for entry in entries {
            let id = entry
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| RpcError::Protocol("batch entry without id".into()))?;
            let slot = slots
                .get_mut(id as usize)
                .ok_or_else(|| RpcError::Protocol(format!("batch entry id {id} out of range")))?;
            *slot = Some(Self::unpack(entry));
        }
        slots
            .into_iter()
            .map(|s| s.ok_or_else(|| RpcError::Protocol("batch entry missing".into())))
            .collect()
    }

    pub async fn tip_height(&self) -> Result<u64> {
        let v = self.call("getblockcount", json!([])).await?;
        v.as_u64().context("getblockcount returned a non-integer")
    }

    /// Block hash at `height`, or `None` when the height is above the tip.
    pub async fn block_hash_at(&self, height: u64) -> Result<Option<String>> {
        match self.call("getblockhash", json!([height])).await {
            Ok(v) => Ok(Some(
                v.as_str()
                    .context("getblockhash returned a non-string")?
                    .to_string(),
            )),
            Err(e) if e.is_out_of_range() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Full block with prevout data for every input (verbosity 3).
    pub async fn block(&self, hash: &str) -> Result<Block> {
        let v = self.call("getblock", json!([hash, 3])).await?;
        serde_json::from_value(v).context("decoding getblock verbosity=3 reply")
    }

    /// Hashes for a run of heights, in one batched request. Heights above
    /// the tip are dropped from the tail, so the result may be shorter than
    /// the input.
    pub async fn batch_block_hashes(&self, heights: &[u64]) -> Result<Vec<String>> {
        let requests = heights
            .iter()
            .map(|&h| ("getblockhash", json!([h])))
            .collect();
        let mut hashes = Vec::with_capacity(heights.len());
        for (i, result) in self.batch(requests).await?.into_iter().enumerate() {
            match result {
                Ok(v) => hashes.push(
                    v.as_str()
                        .context("getblockhash returned a non-string")?
                        .to_string(),
                ),
                Err(e) if e.is_out_of_range() => {
                    tracing::debug!(height = heights[i], "height above tip, truncating batch");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(hashes)
    }

    /// Full blocks for a set of hashes, split into small batched requests.
    pub async fn batch_blocks(&self, hashes: &[String]) -> Result<Vec<Block>> {
        let mut blocks = Vec::with_capacity(hashes.len());
        for chunk in hashes.chunks(BLOCKS_PER_BATCH) {
            let requests = chunk.iter().map(|h| ("getblock", json!([h, 3]))).collect();
            for result in self.batch(requests).await? {
                let v = result?;
                blocks.push(serde_json::from_value(v).context("decoding getblock reply")?);
            }
        }
        Ok(blocks)
    }

    /// Headers (hash, height, time) for a set of hashes.
    pub async fn batch_block_headers(&self, hashes: &[String]) -> Result<Vec<BlockHeader>> {
        let mut headers = Vec::with_capacity(hashes.len());
        for chunk in hashes.chunks(50) {
            let requests = chunk
                .iter()
                .map(|h| ("getblockheader", json!([h, true])))
                .collect();
            for result in self.batch(requests).await? {
                let v = result?;
                headers.push(serde_json::from_value(v).context("decoding getblockheader reply")?);
            }
        }
        Ok(headers)
    }

    /// Convenience: fetch full blocks for a run of heights. The result is
    /// truncated at the tip and ordered by the input heights.
    pub async fn blocks_for_heights(&self, heights: &[u64]) -> Result<Vec<Block>> {
        let hashes = self.batch_block_hashes(heights).await?;
        self.batch_blocks(&hashes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_is_not_transient() {
        let err = RpcError::Node { code: ERR_OUT_OF_RANGE, message: "Block height out of range".into() };
        assert!(err.is_out_of_range());
        assert!(!err.is_transient());
    }

    #[test]
    fn warming_up_is_transient() {
        let err = RpcError::Node { code: ERR_WARMING_UP, message: "Loading block index...".into() };
        assert!(err.is_transient());
    }

    #[test]
    fn auth_is_neither() {
        let err = RpcError::Auth(401);
        assert!(!err.is_transient());
        assert!(!err.is_out_of_range());
    }

    #[test]
    fn unpack_surfaces_node_errors() {
        let raw = json!({"id": 0, "result": null, "error": {"code": -8, "message": "out of range"}});
        match BitcoinRpc::unpack(raw) {
            Err(RpcError::Node { code, .. }) => assert_eq!(code, -8),
            other => panic!("expected node error, got {other:?}"),
        }
    }

    #[test]
    fn unpack_passes_results_through() {
        let raw = json!({"id": 0, "result": 840000, "error": null});
        assert_eq!(BitcoinRpc::unpack(raw).unwrap(), json!(840000));
    }
}
