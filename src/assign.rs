//! Deterministic work partitioning across a fixed-size worker pool.
//!
//! Every stage of the pipeline runs as `world_size` independent processes,
//! each identified by a 0-based `rank`. Workers never communicate, so the
//! only way to divide work safely is a pure function of the item sequence and
//! the worker's identity: item `i` belongs to rank `i % world_size`.
//!
//! That striding gives two guarantees the merge phases depend on:
//!
//! 1. **Exhaustive and disjoint** - the union of all ranks' slices is exactly
//!    the input sequence, each item owned by one rank.
//! 2. **Reproducible** - a crashed rank relaunched with the same
//!    (rank, world_size) claims the same items, which makes skip-if-done
//!    resumption correct without any coordination.
//!
//! Fewer items than workers is a normal condition: the surplus ranks get an
//! empty slice and must treat it as a successful no-op.

use anyhow::{Result, bail};

/// Return the subset of `items` owned by `rank` out of `world_size` workers.
///
/// Ownership is round-robin: element `i` belongs to rank `i % world_size`.
/// Identical inputs always produce identical output.
///
/// # Errors
///
/// Returns an error if `world_size` is zero or `rank` is out of range. An
/// empty result for a valid rank is not an error.
pub fn rank_slice<T: Clone>(items: &[T], rank: usize, world_size: usize) -> Result<Vec<T>> {
    let indices = rank_indices(items.len(), rank, world_size)?;
    Ok(indices.map(|i| items[i].clone()).collect())
}

/// Iterator over the item indices owned by `rank`.
///
/// This is the allocation-free core of [`rank_slice`], useful when the caller
/// only needs positions (e.g. target ids) rather than cloned items.
///
/// # Errors
///
/// Returns an error if `world_size` is zero or `rank` is out of range.
pub fn rank_indices(
    len: usize,
    rank: usize,
    world_size: usize,
) -> Result<impl Iterator<Item = usize>> {
    if world_size == 0 {
        bail!("world_size must be at least 1");
    }
    if rank >= world_size {
        bail!("rank {rank} out of range for world_size {world_size}");
    }
    Ok((rank..len).step_by(world_size))
}
