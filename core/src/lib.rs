//! UTXO lifecycle indexing and on-chain analytics engine.
//!
//! Ingests the Bitcoin blockchain from a trusted full node, maintains a
//! derived analytical store of every unspent and historically-spent output
//! enriched with acquisition price, spend price, age and cluster
//! membership, and computes a family of on-chain economic indicators over
//! the result.
//!
//! Data flow is strictly one-way: raw chain data -> UTXO rows -> cluster
//! rows -> metric rows. Execution is parallel for I/O and serial for
//! mutation; components coordinate through the store's sync state only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod bootstrap;
pub mod config;
pub mod costbasis;
pub mod ingest;
pub mod metrics;
pub mod orchestrator;
pub mod pricing;
pub mod rpc;
pub mod store;

/// Cooperative cancellation, observed between batches. The in-flight batch
/// rolls back; the checkpoint is not advanced.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// A flag wired to ctrl-c. Must be called inside a tokio runtime.
    pub fn hooked_to_ctrl_c() -> Self {
        let flag = Self::new();
        let hooked = flag.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, finishing current batch");
                hooked.cancel();
            }
        });
        flag
    }
}
