//! Post-merge file compression stage.
//!
//! Merged artifacts are often shipped compressed. This stage strides a file
//! set across the worker pool with the same round-robin assignment as every
//! other stage, compresses each owned file next to the original
//! (`"{path}.zst"` / `"{path}.gz"`), and optionally removes the original once
//! the compressed copy is published. Publication goes through the atomic
//! writer, so a killed compression worker is relaunched like any other: files
//! whose compressed form already exists are skipped.
//!
//! Codecs follow the crate's feature gates: `compression-zstd` (via `zstd`)
//! and `compression-gzip` (via `flate2`).

use crate::assign::rank_slice;
use crate::error::MergeError;
use crate::publish::publish_atomic;
use crate::stage::{Stage, WorkerContext};
use anyhow::{Context, Result};
use glob::glob;
use std::fs::{File, remove_file};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Available compression codecs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    #[cfg(feature = "compression-zstd")]
    Zstd,
    #[cfg(feature = "compression-gzip")]
    Gzip,
}

impl Codec {
    /// Extension appended to compressed files.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => "zst",
            #[cfg(feature = "compression-gzip")]
            Self::Gzip => "gz",
        }
    }

    fn encode(self, src: &Path, w: &mut dyn Write, level: i32) -> io::Result<()> {
        let mut reader = BufReader::new(File::open(src)?);
        match self {
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => zstd::stream::copy_encode(&mut reader, &mut *w, level),
            #[cfg(feature = "compression-gzip")]
            Self::Gzip => {
                #[allow(clippy::cast_sign_loss)]
                let level = flate2::Compression::new(level.clamp(0, 9) as u32);
                let mut enc = flate2::write::GzEncoder::new(&mut *w, level);
                io::copy(&mut reader, &mut enc)?;
                enc.finish().map(|_| ())
            }
        }
    }
}

/// Stage that compresses every file matching a glob pattern.
#[derive(Clone, Debug)]
pub struct CompressFiles {
    /// Glob pattern selecting the files to compress.
    pub pattern: String,
    /// Codec to apply.
    pub codec: Codec,
    /// Codec-specific compression level.
    pub level: i32,
    /// Remove each original after its compressed copy is published.
    pub remove_original: bool,
}

impl CompressFiles {
    fn compressed_path(&self, path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(self.codec.extension());
        PathBuf::from(name)
    }
}

impl Stage for CompressFiles {
    fn name(&self) -> &str {
        "compress-files"
    }

    fn run(&self, ctx: &WorkerContext) -> Result<()> {
        // Sorted listing keeps the stride assignment identical across
        // relaunches of the same rank.
        let mut files: Vec<PathBuf> = glob(&self.pattern)
            .with_context(|| format!("invalid glob pattern: {}", self.pattern))?
            .filter_map(std::result::Result::ok)
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        let owned = rank_slice(&files, ctx.rank, ctx.world_size)?;
        debug!(rank = ctx.rank, files = owned.len(), "claimed files to compress");

        for file in owned {
            let out = self.compressed_path(&file);
            if out.is_file() {
                debug!(path = %out.display(), "compressed file exists, skipping");
            } else {
                let published =
                    publish_atomic(&out, |w| self.codec.encode(&file, w, self.level));
                match published {
                    Ok(bytes) => {
                        info!(path = %out.display(), bytes, "compressed file");
                    }
                    // Another attempt of this rank finished it first.
                    Err(MergeError::WriteConflict { .. }) => {}
                    Err(e) => {
                        return Err(e).with_context(|| format!("compress {}", file.display()));
                    }
                }
            }
            if self.remove_original {
                remove_file(&file)
                    .with_context(|| format!("remove original {}", file.display()))?;
            }
        }
        Ok(())
    }
}
