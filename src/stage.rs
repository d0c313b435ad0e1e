//! Stage descriptors, the worker execution context, and the barrier chain.
//!
//! The pipeline is a linear chain of stages (produce shards, plan the merge,
//! execute the merge) with one rule: stage *k+1* must not start any worker
//! task until every task of stage *k* has succeeded. That is a barrier, not a
//! generic DAG; the chain is modeled as an ordered list of descriptors with a
//! completion precondition, nothing more.
//!
//! Process spawning belongs to the external cluster scheduler. This module
//! only expresses the dependency through the [`TaskScheduler`] seam; the
//! bundled [`LocalScheduler`] runs tasks on threads for tests and
//! single-machine runs.

use anyhow::{Result, bail};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// A pipeline stage: consumes a rank/world-size context and produces either
/// shard files or other terminal side effects.
pub trait Stage: Send + Sync {
    /// Stage name, used in logs and operator-facing reports.
    fn name(&self) -> &str;

    /// Run this stage's share of the work as worker `ctx.rank` of
    /// `ctx.world_size`.
    ///
    /// # Errors
    ///
    /// A returned error marks the whole stage failed and blocks dependents.
    fn run(&self, ctx: &WorkerContext) -> Result<()>;
}

/// Explicit per-process cache for lazily built, reusable resources.
///
/// A worker process often needs an expensive object (a tokenizer, a scoring
/// model) shared across calls within that process. Rather than hiding it in
/// module-level mutable state, each worker owns one cache, constructed with
/// the context and torn down with the process.
#[derive(Default)]
pub struct ProcessCache {
    slots: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ProcessCache {
    /// Fetch the cached value under `key`, building it on first use.
    ///
    /// # Errors
    ///
    /// Propagates the initializer's error; nothing is cached on failure.
    /// Also fails if `key` was previously initialized with a different type.
    pub fn get_or_try_init<T, F>(&self, key: &str, init: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T>,
    {
        let mut slots = self.slots.lock().expect("cache lock poisoned");
        if let Some(existing) = slots.get(key) {
            return Arc::clone(existing)
                .downcast::<T>()
                .map_err(|_| anyhow::anyhow!("cache key {key} holds a different type"));
        }
        let value = Arc::new(init()?);
        slots.insert(key.to_string(), Arc::clone(&value) as Arc<dyn Any + Send + Sync>);
        Ok(value)
    }
}

/// Identity and resources of one worker task.
pub struct WorkerContext {
    /// 0-based index of this worker within the stage's pool.
    pub rank: usize,
    /// Total worker count for the stage.
    pub world_size: usize,
    /// Process-lifetime cache owned by this worker.
    pub cache: Arc<ProcessCache>,
}

impl WorkerContext {
    /// Context for worker `rank` of `world_size`, with a fresh cache.
    #[must_use]
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self {
            rank,
            world_size,
            cache: Arc::new(ProcessCache::default()),
        }
    }
}

/// One stage of the chain: what to run and how many tasks to fan out.
#[derive(Clone)]
pub struct StageSpec {
    /// The stage implementation.
    pub stage: Arc<dyn Stage>,
    /// Number of worker tasks (the stage's world size).
    pub tasks: usize,
}

impl StageSpec {
    /// Descriptor for `stage` fanned out over `tasks` workers.
    #[must_use]
    pub fn new(stage: Arc<dyn Stage>, tasks: usize) -> Self {
        Self { stage, tasks }
    }
}

/// Lifecycle of a stage within one chain run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Per-task failures reported by a scheduler launch.
#[derive(Debug, Default)]
pub struct StageOutcome {
    /// (rank, error message) for every task that did not succeed.
    pub failures: Vec<(usize, String)>,
}

impl StageOutcome {
    /// Whether every task of the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// External-scheduler seam: launch a stage's tasks and report completion.
///
/// Implementations own process spawning, resource requests, and queueing.
/// The chain only needs "run these N tasks and tell me whether all of them
/// succeeded".
pub trait TaskScheduler {
    /// Launch `spec.tasks` worker tasks for the stage and block until every
    /// task has terminated.
    ///
    /// # Errors
    ///
    /// Returns an error only for launch-level problems (the stage could not
    /// be started at all); per-task failures belong in the outcome.
    fn launch(&self, spec: &StageSpec) -> Result<StageOutcome>;
}

/// Thread-backed scheduler for tests and single-machine runs.
///
/// Each task gets its own [`WorkerContext`] (and therefore its own cache),
/// matching the independent-process model: tasks share nothing but storage.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalScheduler;

impl TaskScheduler for LocalScheduler {
    fn launch(&self, spec: &StageSpec) -> Result<StageOutcome> {
        if spec.tasks == 0 {
            bail!("stage {} configured with zero tasks", spec.stage.name());
        }
        let mut outcome = StageOutcome::default();
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..spec.tasks)
                .map(|rank| {
                    let stage = Arc::clone(&spec.stage);
                    let world_size = spec.tasks;
                    scope.spawn(move || {
                        let ctx = WorkerContext::new(rank, world_size);
                        stage.run(&ctx)
                    })
                })
                .collect();
            for (rank, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => outcome.failures.push((rank, format!("{e:#}"))),
                    Err(_) => outcome.failures.push((rank, "task panicked".to_string())),
                }
            }
        });
        Ok(outcome)
    }
}

/// Ordered stage chain with a fully-complete barrier between stages.
pub struct StageChain {
    stages: Vec<StageSpec>,
    states: Vec<StageState>,
}

impl StageChain {
    /// Build a chain from ordered stage descriptors.
    #[must_use]
    pub fn new(stages: Vec<StageSpec>) -> Self {
        let states = vec![StageState::Pending; stages.len()];
        Self { stages, states }
    }

    /// Current state of each stage, in chain order.
    #[must_use]
    pub fn states(&self) -> &[StageState] {
        &self.states
    }

    /// Run stages in order, enforcing the barrier.
    ///
    /// A stage launches only after its predecessor's tasks have all
    /// succeeded. On the first failure the chain stops: the failed stage is
    /// marked `Failed`, every dependent stays `Pending` (never auto-started),
    /// and the error names the failed tasks so the operator can intervene.
    ///
    /// # Errors
    ///
    /// Returns an error when any stage fails; blind auto-retry of a systemic
    /// failure risks masking corruption, so recovery is left to the operator.
    pub fn run(&mut self, scheduler: &dyn TaskScheduler) -> Result<()> {
        for i in 0..self.stages.len() {
            let spec = self.stages[i].clone();
            let name = spec.stage.name().to_string();
            info!(stage = %name, tasks = spec.tasks, "launching stage");
            self.states[i] = StageState::Running;

            let outcome = match scheduler.launch(&spec) {
                Ok(o) => o,
                Err(e) => {
                    self.states[i] = StageState::Failed;
                    return Err(e.context(format!("launch stage {name}")));
                }
            };
            if !outcome.is_success() {
                self.states[i] = StageState::Failed;
                let blocked: Vec<&str> = self.stages[i + 1..]
                    .iter()
                    .map(|s| s.stage.name())
                    .collect();
                error!(stage = %name, failures = outcome.failures.len(), "stage failed");
                bail!(
                    "stage {name} failed on tasks {:?}; dependent stages remain pending: {blocked:?}",
                    outcome.failures
                );
            }
            info!(stage = %name, "stage succeeded");
            self.states[i] = StageState::Succeeded;
        }
        Ok(())
    }
}
