//! Atomic artifact publication: write to a temporary file, then rename.
//!
//! Observers of the output directory either see no file at the target path or
//! a complete one; a partially-written artifact is never visible. This single
//! primitive underlies both plan publication and merged-artifact publication,
//! and it is what makes every phase of the pipeline safe to kill and relaunch:
//! a crash before the final rename leaves the target absent (retry from
//! scratch) and at most one orphaned temp file, which is removed best-effort
//! on drop and is never required for correctness.
//!
//! The rename is no-clobber. If two duplicate tasks race to publish the same
//! path, exactly one wins; the loser gets [`MergeError::WriteConflict`] and
//! can adopt the published artifact.

use crate::error::{MergeError, MergeResult};
use std::fs::create_dir_all;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Stream bytes from `producer` into `target`, publishing atomically.
///
/// The temp file is created in `target`'s parent directory so the final
/// rename never crosses a filesystem boundary. Contents are flushed and
/// fsynced before the rename.
///
/// # Returns
///
/// The number of bytes published.
///
/// # Errors
///
/// [`MergeError::Publish`] if the producer or any I/O step fails (the target
/// path is left untouched), or [`MergeError::WriteConflict`] if another
/// publisher created `target` first.
pub fn publish_atomic(
    target: &Path,
    producer: impl FnOnce(&mut dyn Write) -> io::Result<()>,
) -> MergeResult<u64> {
    let publish_err = |source: io::Error| MergeError::Publish {
        path: target.to_path_buf(),
        source,
    };

    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    if !parent.as_os_str().is_empty() {
        create_dir_all(parent).map_err(publish_err)?;
    }

    let tmp = NamedTempFile::new_in(parent).map_err(publish_err)?;
    let mut w = BufWriter::new(tmp);
    producer(&mut w).map_err(publish_err)?;
    w.flush().map_err(publish_err)?;

    let tmp = w
        .into_inner()
        .map_err(|e| publish_err(e.into_error()))?;
    tmp.as_file().sync_all().map_err(publish_err)?;
    let bytes = tmp.as_file().metadata().map_err(publish_err)?.len();

    match tmp.persist_noclobber(target) {
        Ok(_) => {
            debug!(path = %target.display(), bytes, "published artifact");
            Ok(bytes)
        }
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
            Err(MergeError::WriteConflict {
                path: target.to_path_buf(),
            })
        }
        Err(e) => Err(publish_err(e.error)),
    }
}
