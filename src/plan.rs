//! Merge plans: deterministic assignment of shards to final output targets.
//!
//! Planning is the single point where cross-worker ordering is decided. One
//! planning task discovers every shard produced by the upstream stage, fixes
//! the concatenation order (rank ascending, ties broken by path), packs
//! contiguous rank ranges into a bounded number of output targets, and
//! publishes the result as a plan file. Executor workers only ever read that
//! file; they never re-derive or re-order anything.
//!
//! # The plan artifact
//!
//! A plan is a pretty-printed JSON file at
//! `"{plan_root}/{save_filename}.plan.json"` so an operator can inspect it
//! with nothing but a pager. It carries:
//!
//! - `version` - schema version, checked on load
//! - `checksum` - SHA-256 over the serialized target list, checked on load
//! - `targets` - per target: an id, the stream it belongs to, and the ordered
//!   `(rank, path, size)` source list
//!
//! # Invariants
//!
//! - Every discovered shard appears in exactly one target's source list.
//! - In-target order is sorted by (rank, path); reproducible from the same
//!   shard set regardless of filesystem listing order.
//! - A published plan is immutable. Re-running the planner loads and
//!   validates the existing file instead of re-deriving it, and a planner
//!   that loses the publish race adopts the winner's plan.

use crate::error::{MergeError, MergeResult};
use crate::publish::publish_atomic;
use crate::shard::{ShardFile, discover_shards};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::read_to_string;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Current plan schema version.
pub const PLAN_VERSION: u32 = 1;

/// One shard reference inside a target's ordered source list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSource {
    /// Rank of the producing worker.
    pub rank: u32,
    /// Storage path of the shard.
    pub path: PathBuf,
    /// Shard size in bytes at planning time.
    pub size: u64,
}

/// One final output target and the shards that feed it, in merge order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTarget {
    /// Target identifier, unique across the whole plan.
    pub id: u32,
    /// Logical stream this target belongs to.
    pub stream: String,
    /// Ordered source list; the executor concatenates exactly in this order.
    pub sources: Vec<PlanSource>,
}

impl PlanTarget {
    /// Total bytes across this target's sources.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.sources.iter().map(|s| s.size).sum()
    }
}

/// A persisted, immutable mapping of shards to output targets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    /// Schema version of this plan file.
    pub version: u32,
    /// SHA-256 over the serialized target list.
    pub checksum: String,
    /// All output targets, id ascending.
    pub targets: Vec<PlanTarget>,
}

impl MergePlan {
    /// Build a plan from targets, stamping the current schema version and
    /// the integrity checksum.
    #[must_use]
    pub fn new(targets: Vec<PlanTarget>) -> Self {
        let checksum = targets_checksum(&targets);
        Self {
            version: PLAN_VERSION,
            checksum,
            targets,
        }
    }

    /// Load a plan from `path`, verifying schema version and checksum.
    ///
    /// # Errors
    ///
    /// [`MergeError::PlanNotFound`] if the file does not exist (the barrier
    /// signal), [`MergeError::SchemaMismatch`] if it exists but carries an
    /// incompatible version, undecodable content, or a failed checksum; all
    /// of those require an explicit re-plan.
    pub fn load(path: &Path) -> MergeResult<Self> {
        let text = match read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MergeError::PlanNotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(source) => {
                return Err(MergeError::Publish {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let mismatch = |found| MergeError::SchemaMismatch {
            path: path.to_path_buf(),
            found,
            expected: PLAN_VERSION,
        };
        let plan: Self = serde_json::from_str(&text).map_err(|_| {
            // Recover the version for the error message when possible.
            let found = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("version").and_then(serde_json::Value::as_u64))
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0);
            mismatch(found)
        })?;
        if plan.version != PLAN_VERSION {
            return Err(mismatch(plan.version));
        }
        if plan.checksum != targets_checksum(&plan.targets) {
            return Err(mismatch(plan.version));
        }
        Ok(plan)
    }

    /// Serialize to the human-inspectable on-disk form.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn targets_checksum(targets: &[PlanTarget]) -> String {
    let mut hasher = Sha256::new();
    let encoded = serde_json::to_vec(targets).unwrap_or_default();
    hasher.update(&encoded);
    format!("{:x}", hasher.finalize())
}

/// Deterministic merged-artifact filename for (`save_filename`, `target_id`).
///
/// Downstream readers can predict final paths from this without consulting
/// the plan.
#[must_use]
pub fn merged_filename(save_filename: &str, target_id: u32) -> String {
    format!("{save_filename}_{target_id:05}.merged")
}

/// Policy deciding how many output targets a stream's shards collapse into.
#[derive(Clone, Copy, Debug)]
pub enum TargetPolicy {
    /// At most this many targets per stream; per-target budget is derived by
    /// dividing the stream's total bytes evenly.
    Count(u32),
    /// As many targets as needed, each at most this many bytes (a single
    /// oversized shard still forms its own target).
    MaxBytes(u64),
}

/// Configuration for the planning task.
#[derive(Clone, Debug)]
pub struct MergePlanner {
    /// Root containing the upstream stage's shard files.
    pub source_root: PathBuf,
    /// Root the plan file is published under.
    pub plan_root: PathBuf,
    /// Save-filename template; names both the plan file and final artifacts.
    pub save_filename: String,
    /// Restrict planning to one stream; `None` plans every stream found.
    pub stream: Option<String>,
    /// Target sizing policy.
    pub policy: TargetPolicy,
}

impl MergePlanner {
    /// Well-known path of the plan artifact.
    #[must_use]
    pub fn plan_path(&self) -> PathBuf {
        self.plan_root.join(format!("{}.plan.json", self.save_filename))
    }

    /// Discover shards, derive the plan, and publish it atomically.
    ///
    /// Idempotent: an existing valid plan is loaded and returned without
    /// touching storage, so re-running the planning stage after a crash is a
    /// no-op. Losing the publish race to a duplicate planning task is also a
    /// success; the published plan is adopted.
    ///
    /// # Errors
    ///
    /// [`MergeError::Discovery`] if no shards exist under the source root,
    /// [`MergeError::SchemaMismatch`] if an existing plan is incompatible,
    /// [`MergeError::Publish`] on storage failure.
    pub fn plan(&self) -> MergeResult<MergePlan> {
        let path = self.plan_path();
        match MergePlan::load(&path) {
            Ok(existing) => {
                info!(
                    path = %path.display(),
                    targets = existing.targets.len(),
                    "adopting existing merge plan"
                );
                return Ok(existing);
            }
            Err(MergeError::PlanNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let groups = discover_shards(&self.source_root, self.stream.as_deref())?;

        let mut targets = Vec::new();
        let mut next_id = 0u32;
        for (stream, shards) in &groups {
            for sources in pack_by_rank_range(shards, self.policy) {
                targets.push(PlanTarget {
                    id: next_id,
                    stream: stream.clone(),
                    sources,
                });
                next_id += 1;
            }
        }
        let plan = MergePlan::new(targets);

        let json = plan.to_json().map_err(|e| MergeError::Publish {
            path: path.clone(),
            source: io::Error::other(e),
        })?;
        match publish_atomic(&path, |w| w.write_all(json.as_bytes())) {
            Ok(_) => {
                info!(
                    path = %path.display(),
                    streams = groups.len(),
                    targets = plan.targets.len(),
                    "published merge plan"
                );
                Ok(plan)
            }
            // A duplicate planning task won the rename; its plan is as good
            // as ours (same inputs, deterministic derivation). Validate and
            // adopt it.
            Err(MergeError::WriteConflict { .. }) => MergePlan::load(&path),
            Err(e) => Err(e),
        }
    }
}

impl crate::stage::Stage for MergePlanner {
    fn name(&self) -> &str {
        "plan-merge"
    }

    // Planning is a single-task stage, but a duplicate task is harmless:
    // derivation is deterministic and the publish race has one winner whose
    // plan everyone adopts.
    fn run(&self, _ctx: &crate::stage::WorkerContext) -> anyhow::Result<()> {
        self.plan()?;
        Ok(())
    }
}

/// Pack rank-sorted shards into contiguous-range bins.
///
/// Walks shards in rank order, closing the current bin once its byte budget
/// is reached. Every shard lands in exactly one bin and bins cover contiguous
/// rank ranges, so the mapping is reproducible without any prior plan state.
fn pack_by_rank_range(shards: &[ShardFile], policy: TargetPolicy) -> Vec<Vec<PlanSource>> {
    let total: u64 = shards.iter().map(|s| s.size).sum();
    let (budget, max_bins) = match policy {
        TargetPolicy::Count(n) => {
            let n = u64::from(n.max(1));
            (total.div_ceil(n).max(1), n as usize)
        }
        TargetPolicy::MaxBytes(b) => (b.max(1), usize::MAX),
    };

    let mut bins: Vec<Vec<PlanSource>> = Vec::new();
    let mut current: Vec<PlanSource> = Vec::new();
    let mut current_bytes = 0u64;
    for shard in shards {
        let would_overflow = current_bytes + shard.size > budget;
        if would_overflow && !current.is_empty() && bins.len() + 1 < max_bins {
            bins.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += shard.size;
        current.push(PlanSource {
            rank: shard.rank,
            path: shard.path.clone(),
            size: shard.size,
        });
    }
    if !current.is_empty() {
        bins.push(current);
    }
    bins
}
