//! Shard files: per-worker partial outputs and their discovery.
//!
//! Each upstream worker writes its partial output under a shared root with a
//! deterministic name, `"{stream}_{rank:05}.shard"`. The stream component
//! lets multiple corpora share one root; the zero-padded rank both identifies
//! the producer and fixes concatenation order at planning time. Shards are
//! immutable once written and are only ever read by later stages.

use crate::error::{MergeError, MergeResult};
use anyhow::{Context, Result};
use glob::glob;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Extension shared by all shard files.
pub const SHARD_EXT: &str = "shard";

/// One worker's partial output, as discovered under the source root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardFile {
    /// Logical stream name (corpus / base filename) this shard belongs to.
    pub stream: String,
    /// Rank of the worker that produced it; the ordering key for merging.
    pub rank: u32,
    /// Absolute storage path.
    pub path: PathBuf,
    /// Size in bytes at discovery time.
    pub size: u64,
}

/// Deterministic shard filename for (`stream`, `rank`).
#[must_use]
pub fn shard_filename(stream: &str, rank: u32) -> String {
    format!("{stream}_{rank:05}.{SHARD_EXT}")
}

/// Parse a shard filename back into (stream, rank).
///
/// Returns `None` for files that do not follow the shard naming scheme;
/// discovery skips those rather than failing, since a shared root may hold
/// unrelated files (logs, temp files from in-flight publishes).
#[must_use]
pub fn parse_shard_name(name: &str) -> Option<(String, u32)> {
    let stem = name.strip_suffix(&format!(".{SHARD_EXT}"))?;
    let (stream, rank) = stem.rsplit_once('_')?;
    if stream.is_empty() || rank.len() != 5 {
        return None;
    }
    let rank: u32 = rank.parse().ok()?;
    Some((stream.to_string(), rank))
}

/// Discover all shards under `root`, grouped by stream name.
///
/// When `stream` is `Some`, only that stream's shards are listed. Results are
/// grouped into a `BTreeMap` and sorted by (rank, path) within each stream,
/// so the outcome is identical regardless of filesystem listing order.
///
/// # Errors
///
/// [`MergeError::Discovery`] if no shard matches; planning over an empty
/// source set is an operator error, not an empty plan.
pub fn discover_shards(
    root: &Path,
    stream: Option<&str>,
) -> MergeResult<BTreeMap<String, Vec<ShardFile>>> {
    let pattern = match stream {
        Some(s) => format!("{}/{s}_*.{SHARD_EXT}", root.display()),
        None => format!("{}/*.{SHARD_EXT}", root.display()),
    };

    let mut groups: BTreeMap<String, Vec<ShardFile>> = BTreeMap::new();
    let entries = glob(&pattern).map_err(|_| MergeError::Discovery {
        pattern: pattern.clone(),
    })?;
    for entry in entries.flatten() {
        if !entry.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((shard_stream, rank)) = parse_shard_name(name) else {
            continue;
        };
        if stream.is_some_and(|s| s != shard_stream) {
            continue;
        }
        let size = entry
            .metadata()
            .map_err(|source| MergeError::Publish {
                path: entry.clone(),
                source,
            })?
            .len();
        groups.entry(shard_stream.clone()).or_default().push(ShardFile {
            stream: shard_stream,
            rank,
            path: entry,
            size,
        });
    }

    if groups.is_empty() {
        return Err(MergeError::Discovery { pattern });
    }
    for shards in groups.values_mut() {
        shards.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.path.cmp(&b.path)));
    }
    Ok(groups)
}

/// Write one shard under `root` with the canonical name, atomically.
///
/// This is the Stage 1 side of the contract: producers use the same naming
/// scheme discovery parses, and the same temp-then-rename publication as the
/// merge phase, so a killed producer never leaves a half-written shard. A
/// shard already published by a previous attempt of the same rank is adopted
/// as-is, making producer restarts idempotent.
///
/// # Errors
///
/// Returns an error if the shard cannot be written or published.
pub fn write_shard(root: &Path, stream: &str, rank: u32, content: &[u8]) -> Result<PathBuf> {
    let path = root.join(shard_filename(stream, rank));
    match crate::publish::publish_atomic(&path, |w| w.write_all(content)) {
        Ok(_) | Err(MergeError::WriteConflict { .. }) => Ok(path),
        Err(e) => Err(e).with_context(|| format!("write shard {}", path.display())),
    }
}
