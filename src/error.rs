//! Error taxonomy for the merge coordination core.
//!
//! Every failure names the specific path, target, or shard involved so that an
//! operator never has to work backwards from a bare process exit code. The
//! variants split along the recovery axis:
//!
//! - [`MergeError::Discovery`] - no input shards found; fatal, needs operator
//!   intervention, never retried automatically
//! - [`MergeError::SchemaMismatch`] - a persisted plan has an incompatible
//!   version; fatal, requires an explicit re-plan
//! - [`MergeError::PlanNotFound`] - the planning stage has not published yet;
//!   a barrier signal, safe to wait and retry
//! - [`MergeError::SourceMissing`] - a shard listed in the plan is absent at
//!   execution time; fatal for that target only, siblings proceed
//! - [`MergeError::Publish`] - transient storage failure; the target path is
//!   untouched until the final rename, so retrying the whole target is safe
//! - [`MergeError::WriteConflict`] - a duplicate publisher raced us to the
//!   final rename; the loser adopts the published artifact

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Error type for planning and merge execution.
#[derive(Debug)]
pub enum MergeError {
    /// No source shards found under the given pattern.
    Discovery { pattern: String },
    /// A persisted plan carries an unsupported schema version.
    SchemaMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    /// No plan published at the expected path (barrier not yet passed).
    PlanNotFound { path: PathBuf },
    /// A shard listed in the plan is absent from storage.
    SourceMissing { target: u32, path: PathBuf },
    /// Writing or publishing an artifact failed.
    Publish {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A concurrent publisher won the atomic rename for this path.
    WriteConflict { path: PathBuf },
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovery { pattern } => {
                write!(f, "no source shards found matching {pattern}")
            }
            Self::SchemaMismatch {
                path,
                found,
                expected,
            } => write!(
                f,
                "plan {} has schema version {found}, expected {expected}",
                path.display()
            ),
            Self::PlanNotFound { path } => {
                write!(f, "no merge plan published at {}", path.display())
            }
            Self::SourceMissing { target, path } => write!(
                f,
                "target {target}: source shard {} is missing",
                path.display()
            ),
            Self::Publish { path, source } => {
                write!(f, "failed to publish {}: {source}", path.display())
            }
            Self::WriteConflict { path } => {
                write!(f, "lost publish race for {}", path.display())
            }
        }
    }
}

impl Error for MergeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Publish { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the planning and execution modules.
pub type MergeResult<T> = Result<T, MergeError>;

impl MergeError {
    /// Whether retrying the failed operation from scratch is safe.
    ///
    /// `PlanNotFound` resolves once the planning stage finishes; `Publish`
    /// never exposes partial output, so the whole target can be redone.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::PlanNotFound { .. } | Self::Publish { .. })
    }
}
