//! # Shardflow
//!
//! A **distributed two-phase shard-merge core** for web-scale batch
//! pipelines. Many independent workers process a corpus in parallel and each
//! writes a partial output shard; Shardflow plans how those thousands of
//! shards collapse into a small, bounded set of final artifacts and executes
//! that plan across an arbitrary number of non-communicating worker
//! processes that coordinate only through shared storage.
//!
//! ## The two phases
//!
//! 1. **Plan** ([`MergePlanner`]) - a single task lists every shard produced
//!    upstream, fixes a deterministic concatenation order (producing rank,
//!    ties by path), packs contiguous rank ranges into output targets, and
//!    publishes an immutable, human-inspectable JSON plan.
//! 2. **Execute** ([`MergeExecutor`]) - `world_size` workers each read the
//!    same plan, claim a disjoint target subset by pure arithmetic
//!    ([`rank_slice`]), and stream-concatenate each owned target's sources
//!    into one atomically published artifact.
//!
//! ## Coordination without a coordinator
//!
//! There is no lock, message, or coordinator process anywhere in this crate.
//! Correctness under partial failure rests on three properties:
//!
//! - **Deterministic partitioning** - a relaunched worker with the same
//!   (rank, world_size) claims exactly the same work ([`assign`]).
//! - **Atomic publication** - every durable file appears via temp-then-rename
//!   ([`publish`]); observers never see partial output, so any worker can be
//!   killed at any point and redone from scratch.
//! - **Existence as completion** - an artifact at its final path is the sole
//!   durable signal that its target is done; restarts skip it.
//!
//! ## Stage chain
//!
//! The surrounding pipeline is a linear chain with barrier dependencies:
//! produce-shards, then plan-merge, then execute-merge, where a stage starts
//! only after every task of its predecessor succeeded. [`StageChain`] models
//! exactly that (no general DAG engine), and [`TaskScheduler`] is the seam to
//! the external cluster scheduler; [`LocalScheduler`] runs tasks on threads
//! for tests and single-machine use.
//!
//! ## Quick start
//!
//! ```no_run
//! use shardflow::*;
//! use std::path::PathBuf;
//! # fn main() -> anyhow::Result<()> {
//! // Phase 1 (single task): derive and publish the plan.
//! let planner = MergePlanner {
//!     source_root: PathBuf::from("out/tokens"),
//!     plan_root: PathBuf::from("out/plan"),
//!     save_filename: "cc-2024-18".to_string(),
//!     stream: None,
//!     policy: TargetPolicy::Count(8),
//! };
//! planner.plan()?;
//!
//! // Phase 2 (many tasks): each worker merges its disjoint target share.
//! let executor = MergeExecutor {
//!     plan_path: planner.plan_path(),
//!     output_root: PathBuf::from("out/merged"),
//!     save_filename: "cc-2024-18".to_string(),
//! };
//! let report = executor.execute(/* rank */ 0, /* world_size */ 16)?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! ## Error model
//!
//! [`MergeError`] splits failures along the recovery axis: `Discovery` and
//! `SchemaMismatch` need an operator; `PlanNotFound` is the barrier signal
//! (wait and retry); `SourceMissing` is fatal for one target only; `Publish`
//! is always safe to retry because nothing partial ever becomes visible.
//!
//! ## Feature flags
//!
//! - `parallel-exec` - merge a worker's owned targets on a rayon pool
//! - `compression-zstd` / `compression-gzip` - codecs for the post-merge
//!   [`CompressFiles`] stage

pub mod assign;
#[cfg(any(feature = "compression-gzip", feature = "compression-zstd"))]
pub mod compress;
pub mod error;
pub mod executor;
pub mod plan;
pub mod publish;
pub mod shard;
pub mod stage;

// General re-exports
pub use assign::{rank_indices, rank_slice};
pub use error::{MergeError, MergeResult};
pub use executor::{ExecutionReport, MergeExecutor};
pub use plan::{
    MergePlan, MergePlanner, PLAN_VERSION, PlanSource, PlanTarget, TargetPolicy, merged_filename,
};
pub use publish::publish_atomic;
pub use shard::{ShardFile, discover_shards, parse_shard_name, shard_filename, write_shard};
pub use stage::{
    LocalScheduler, ProcessCache, Stage, StageChain, StageOutcome, StageSpec, StageState,
    TaskScheduler, WorkerContext,
};

// Gated re-exports
#[cfg(any(feature = "compression-gzip", feature = "compression-zstd"))]
pub use compress::{Codec, CompressFiles};
