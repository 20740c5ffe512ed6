//! Checkpoint files for the disjoint-set.
//!
//! Format: one bincode-encoded record per file, `{last_height, addresses,
//! parent, rank}`. The vectors are length-prefixed by bincode, the address
//! table is indexed by id. Writes go to a temp file in the same directory
//! and are renamed into place so a crash never leaves a torn checkpoint.
//! The newest three files are retained; older ones are pruned.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::UnionFind;

const PREFIX: &str = "unionfind_";
const SUFFIX: &str = ".bin";
const KEEP: usize = 3;

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    last_height: u64,
    addresses: Vec<Box<str>>,
    parent: Vec<u32>,
    rank: Vec<u8>,
}

fn checkpoint_path(dir: &Path, height: u64) -> PathBuf {
    dir.join(format!("{PREFIX}{height:09}{SUFFIX}"))
}

/// Parse the height out of a checkpoint file name, if it is one.
fn parse_height(name: &str) -> Option<u64> {
    name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?.parse().ok()
}

/// Serialize `uf` atomically as the checkpoint for `last_height`, then prune
/// old checkpoints down to the retention count.
pub fn save(dir: &Path, uf: &UnionFind, last_height: u64) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating checkpoint dir {}", dir.display()))?;

    let (addrs, parent, rank) = uf.parts();
    let record = CheckpointFile {
        last_height,
        addresses: addrs.to_vec(),
        parent: parent.to_vec(),
        rank: rank.to_vec(),
    };

    let final_path = checkpoint_path(dir, last_height);
    let tmp_path = final_path.with_extension("bin.tmp");

    let bytes = bincode::serialize(&record).context("encoding checkpoint")?;
    fs::write(&tmp_path, &bytes)
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("renaming into {}", final_path.display()))?;

    tracing::info!(
        height = last_height,
        addresses = record.addresses.len(),
        bytes = bytes.len(),
        "wrote union-find checkpoint"
    );

    prune(dir)?;
    Ok(final_path)
}

/// Load the newest checkpoint in `dir`, returning the structure and the last
/// processed height. `Ok(None)` when no checkpoint exists.
pub fn load_latest(dir: &Path) -> Result<Option<(UnionFind, u64)>> {
    let Some((path, height)) = latest_path(dir)? else {
        return Ok(None);
    };
    let bytes =
        fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let record: CheckpointFile =
        bincode::deserialize(&bytes).with_context(|| format!("decoding {}", path.display()))?;
    anyhow::ensure!(
        record.last_height == height,
        "checkpoint {} claims height {} but is named for {}",
        path.display(),
        record.last_height,
        height
    );
    let uf = UnionFind::from_parts(record.addresses, record.parent, record.rank)?;
    tracing::info!(height, addresses = uf.len(), "loaded union-find checkpoint");
    Ok(Some((uf, height)))
}

/// Path and height of the newest checkpoint, if any.
pub fn latest_path(dir: &Path) -> Result<Option<(PathBuf, u64)>> {
    Ok(list(dir)?.into_iter().max_by_key(|&(_, h)| h))
}

fn list(dir: &Path) -> Result<Vec<(PathBuf, u64)>> {
    let mut found = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(h) = name.to_str().and_then(parse_height) {
            found.push((entry.path(), h));
        }
    }
    Ok(found)
}

/// Delete all but the newest `KEEP` checkpoints.
fn prune(dir: &Path) -> Result<usize> {
    let mut found = list(dir)?;
    if found.len() <= KEEP {
        return Ok(0);
    }
    found.sort_by_key(|&(_, h)| std::cmp::Reverse(h));
    let mut removed = 0;
    for (path, height) in found.split_off(KEEP) {
        fs::remove_file(&path)
            .with_context(|| format!("pruning {}", path.display()))?;
        tracing::debug!(height, "pruned old checkpoint");
        removed += 1;
    }
    Ok(removed)
}
