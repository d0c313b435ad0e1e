//! Merge execution: many workers materialize the plan's output targets.
//!
//! Every executor worker reads the same published plan, claims a disjoint
//! subset of its targets via [`crate::assign`], and concatenates each owned
//! target's sources, byte for byte in plan order, into one atomically
//! published artifact. Workers never talk to each other: the target partition
//! is exhaustive and disjoint by construction, so no locking exists anywhere
//! in this phase.
//!
//! # Restart behavior
//!
//! The cluster scheduler may kill a worker at any point. On relaunch with the
//! same (rank, world_size) the worker claims the same targets, finds the ones
//! it already published (artifact existence is the sole durable completion
//! signal), and redoes only the rest. Nothing partial is ever visible, so
//! redoing a target is always safe.
//!
//! # Failure isolation
//!
//! A target whose source shard is missing fails alone; sibling targets owned
//! by the same worker and all other workers proceed. The returned
//! [`ExecutionReport`] names every failed target and the shard that sank it.

use crate::assign::rank_slice;
use crate::error::{MergeError, MergeResult};
use crate::plan::{MergePlan, PlanTarget, merged_filename};
use crate::publish::publish_atomic;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Configuration for one merge-execution worker.
#[derive(Clone, Debug)]
pub struct MergeExecutor {
    /// Path of the published plan file.
    pub plan_path: PathBuf,
    /// Root the merged artifacts are published under.
    pub output_root: PathBuf,
    /// Save-filename template; combined with the target id it names each
    /// artifact (see [`merged_filename`]).
    pub save_filename: String,
}

/// Per-worker outcome of one execution attempt.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// Targets published by this attempt.
    pub completed: BTreeSet<u32>,
    /// Targets whose artifact already existed (prior attempt finished them).
    pub skipped: BTreeSet<u32>,
    /// Targets that failed, with the error that sank each one.
    pub failed: Vec<(u32, MergeError)>,
}

impl ExecutionReport {
    /// All targets that are durably done after this attempt.
    #[must_use]
    pub fn done(&self) -> BTreeSet<u32> {
        self.completed.union(&self.skipped).copied().collect()
    }

    /// Whether every owned target is done.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl MergeExecutor {
    /// Final artifact path for a plan target.
    #[must_use]
    pub fn artifact_path(&self, target_id: u32) -> PathBuf {
        self.output_root
            .join(merged_filename(&self.save_filename, target_id))
    }

    /// Execute this worker's share of the plan.
    ///
    /// Loads the plan (failing with [`MergeError::PlanNotFound`] if the
    /// planning stage has not published yet - the barrier enforcement point),
    /// computes the owned target subset, and merges each target that is not
    /// already done. Per-target failures are collected in the report rather
    /// than aborting the remaining targets.
    ///
    /// # Errors
    ///
    /// Returns an error only for worker-level problems: a missing or invalid
    /// plan, or an out-of-range (rank, world_size). Per-target failures are
    /// reported, not raised.
    pub fn execute(&self, rank: usize, world_size: usize) -> Result<ExecutionReport> {
        let plan = MergePlan::load(&self.plan_path)
            .with_context(|| format!("load merge plan for rank {rank}/{world_size}"))?;
        let owned = rank_slice(&plan.targets, rank, world_size)?;
        debug!(rank, world_size, owned = owned.len(), "claimed merge targets");

        let outcomes = merge_all(self, &owned);

        let mut report = ExecutionReport::default();
        for (target, outcome) in owned.iter().zip(outcomes) {
            match outcome {
                Ok(Published::Fresh(bytes)) => {
                    info!(target = target.id, bytes, "published merged artifact");
                    report.completed.insert(target.id);
                }
                Ok(Published::AlreadyDone) => {
                    debug!(target = target.id, "artifact already published, skipping");
                    report.skipped.insert(target.id);
                }
                Err(e) => {
                    warn!(target = target.id, error = %e, "target failed");
                    report.failed.push((target.id, e));
                }
            }
        }
        Ok(report)
    }
}

impl crate::stage::Stage for MergeExecutor {
    fn name(&self) -> &str {
        "execute-merge"
    }

    fn run(&self, ctx: &crate::stage::WorkerContext) -> Result<()> {
        let report = self.execute(ctx.rank, ctx.world_size)?;
        if !report.is_success() {
            let failed: Vec<String> = report
                .failed
                .iter()
                .map(|(id, e)| format!("target {id}: {e}"))
                .collect();
            anyhow::bail!("merge worker {} failed targets: {failed:?}", ctx.rank);
        }
        Ok(())
    }
}

enum Published {
    Fresh(u64),
    AlreadyDone,
}

#[cfg(feature = "parallel-exec")]
fn merge_all(exec: &MergeExecutor, owned: &[PlanTarget]) -> Vec<MergeResult<Published>> {
    use rayon::prelude::*;
    owned.par_iter().map(|t| merge_target(exec, t)).collect()
}

#[cfg(not(feature = "parallel-exec"))]
fn merge_all(exec: &MergeExecutor, owned: &[PlanTarget]) -> Vec<MergeResult<Published>> {
    owned.iter().map(|t| merge_target(exec, t)).collect()
}

/// Merge one target: stream its sources, in plan order, into one artifact.
fn merge_target(exec: &MergeExecutor, target: &PlanTarget) -> MergeResult<Published> {
    let artifact = exec.artifact_path(target.id);
    if artifact.is_file() {
        return Ok(Published::AlreadyDone);
    }

    // Fail fast on upstream incompleteness before writing anything. Silently
    // skipping a listed shard would drop content.
    for source in &target.sources {
        if !source.path.is_file() {
            return Err(MergeError::SourceMissing {
                target: target.id,
                path: source.path.clone(),
            });
        }
    }

    let sources = &target.sources;
    let published = publish_atomic(&artifact, |w| {
        for source in sources {
            let f = File::open(&source.path)?;
            io::copy(&mut BufReader::new(f), w)?;
        }
        Ok(())
    });
    match published {
        Ok(bytes) => Ok(Published::Fresh(bytes)),
        // A previous attempt's rename landed between our existence check and
        // ours; the artifact is complete either way.
        Err(MergeError::WriteConflict { .. }) => Ok(Published::AlreadyDone),
        Err(e) => Err(e),
    }
}
