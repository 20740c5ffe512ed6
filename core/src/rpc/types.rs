//! Wire types for `getblock` verbosity=3 and `getblockheader`.
//!
//! Verbosity 3 (Core 25.0+) attaches the previous output to every
//! non-coinbase input, so spend processing needs no extra lookups.

use serde::Deserialize;

/// Satoshis per BTC as a float divisor.
pub const SATS_PER_BTC: f64 = 100_000_000.0;

/// Convert a JSON amount (BTC as float) to integer satoshis.
pub fn sats_from_btc(value: f64) -> i64 {
    (value * SATS_PER_BTC).round() as i64
}

#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    pub hash: String,
    pub height: u64,
    /// Block time, Unix seconds.
    pub time: i64,
    #[serde(default)]
    pub tx: Vec<Tx>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    pub height: u64,
    pub time: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tx {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<Vin>,
    #[serde(default)]
    pub vout: Vec<Vout>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Vin {
    /// Present only on the coinbase input.
    pub coinbase: Option<String>,
    pub txid: Option<String>,
    pub vout: Option<u32>,
    pub prevout: Option<Prevout>,
}

impl Vin {
    pub fn is_coinbase(&self) -> bool {
        self.coinbase.is_some()
    }

    /// The outpoint this input spends, when it is a real spend.
    pub fn outpoint(&self) -> Option<(&str, u32)> {
        match (&self.txid, self.vout) {
            (Some(txid), Some(vout)) if !txid.is_empty() => Some((txid, vout)),
            _ => None,
        }
    }

    /// Address of the output being spent, when the script resolves to one.
    pub fn prevout_address(&self) -> Option<&str> {
        self.prevout
            .as_ref()
            .and_then(|p| p.script_pub_key.address.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prevout {
    pub height: Option<u64>,
    /// Amount in BTC.
    pub value: f64,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Vout {
    /// Amount in BTC.
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPubKey {
    #[serde(rename = "type")]
    pub script_type: Option<String>,
    /// Absent for OP_RETURN, bare multisig and other unaddressable scripts.
    pub address: Option<String>,
}
