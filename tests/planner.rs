//! Merge planner tests: discovery, determinism, idempotence, packing.

use shardflow::{MergeError, MergePlanner, PLAN_VERSION, TargetPolicy, write_shard};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn planner(source: &Path, plan: &Path, policy: TargetPolicy) -> MergePlanner {
    MergePlanner {
        source_root: source.to_path_buf(),
        plan_root: plan.to_path_buf(),
        save_filename: "part-A".to_string(),
        stream: None,
        policy,
    }
}

#[test]
fn test_empty_source_is_discovery_error() {
    let dir = TempDir::new().unwrap();
    let p = planner(dir.path(), dir.path(), TargetPolicy::Count(1));
    let result = p.plan();
    assert!(matches!(result, Err(MergeError::Discovery { .. })));
}

#[test]
fn test_single_target_orders_sources_by_rank() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    // Write out of rank order; planning must not care.
    write_shard(dir.path(), "part-A", 2, &[2u8; 75])?;
    write_shard(dir.path(), "part-A", 0, &[0u8; 100])?;
    write_shard(dir.path(), "part-A", 3, &[3u8; 25])?;
    write_shard(dir.path(), "part-A", 1, &[1u8; 50])?;

    let plan_root = TempDir::new()?;
    let plan = planner(dir.path(), plan_root.path(), TargetPolicy::Count(1)).plan()?;

    assert_eq!(plan.version, PLAN_VERSION);
    assert_eq!(plan.targets.len(), 1);
    let target = &plan.targets[0];
    assert_eq!(target.stream, "part-A");
    let ranks: Vec<u32> = target.sources.iter().map(|s| s.rank).collect();
    assert_eq!(ranks, vec![0, 1, 2, 3]);
    let sizes: Vec<u64> = target.sources.iter().map(|s| s.size).collect();
    assert_eq!(sizes, vec![100, 50, 75, 25]);
    assert_eq!(target.total_bytes(), 250);
    Ok(())
}

#[test]
fn test_plan_serialization_is_deterministic() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    for rank in 0..7 {
        write_shard(dir.path(), "part-A", rank, &vec![rank as u8; 10 + rank as usize])?;
    }

    // Two independent planning runs over the same shard set must produce
    // byte-identical plan files.
    let root1 = TempDir::new()?;
    let root2 = TempDir::new()?;
    let p1 = planner(dir.path(), root1.path(), TargetPolicy::Count(3));
    let p2 = planner(dir.path(), root2.path(), TargetPolicy::Count(3));
    p1.plan()?;
    p2.plan()?;

    assert_eq!(fs::read(p1.plan_path())?, fs::read(p2.plan_path())?);
    Ok(())
}

#[test]
fn test_replanning_adopts_existing_plan() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_shard(dir.path(), "part-A", 0, b"aaaa")?;
    write_shard(dir.path(), "part-A", 1, b"bbbb")?;

    let plan_root = TempDir::new()?;
    let p = planner(dir.path(), plan_root.path(), TargetPolicy::Count(1));
    let first = p.plan()?;
    let original_bytes = fs::read(p.plan_path())?;

    // A shard appearing after planning must not change the published plan:
    // re-running the stage is a load, not a re-derivation.
    write_shard(dir.path(), "part-A", 2, b"cccc")?;
    let second = p.plan()?;

    assert_eq!(first, second);
    assert_eq!(fs::read(p.plan_path())?, original_bytes);
    Ok(())
}

#[test]
fn test_incompatible_plan_version_is_schema_mismatch() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_shard(dir.path(), "part-A", 0, b"data")?;

    let plan_root = TempDir::new()?;
    let p = planner(dir.path(), plan_root.path(), TargetPolicy::Count(1));
    fs::write(
        p.plan_path(),
        r#"{"version":99,"checksum":"","targets":[]}"#,
    )?;

    match p.plan() {
        Err(MergeError::SchemaMismatch { found, expected, .. }) => {
            assert_eq!(found, 99);
            assert_eq!(expected, PLAN_VERSION);
        }
        other => panic!("expected SchemaMismatch, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_corrupted_plan_is_schema_mismatch() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_shard(dir.path(), "part-A", 0, b"data")?;

    let plan_root = TempDir::new()?;
    let p = planner(dir.path(), plan_root.path(), TargetPolicy::Count(1));

    // Valid version, tampered target list: the checksum catches it.
    fs::write(
        p.plan_path(),
        format!(r#"{{"version":{PLAN_VERSION},"checksum":"deadbeef","targets":[]}}"#),
    )?;
    assert!(matches!(p.plan(), Err(MergeError::SchemaMismatch { .. })));
    Ok(())
}

#[test]
fn test_packing_assigns_every_shard_exactly_once() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let sizes = [100usize, 50, 75, 25, 200, 10, 10, 10];
    for (rank, size) in sizes.iter().enumerate() {
        write_shard(dir.path(), "part-A", rank as u32, &vec![0u8; *size])?;
    }

    let plan_root = TempDir::new()?;
    let plan = planner(dir.path(), plan_root.path(), TargetPolicy::Count(3)).plan()?;

    assert!(plan.targets.len() <= 3);
    assert!(plan.targets.iter().all(|t| !t.sources.is_empty()));

    // Flattening targets in id order recovers the full rank sequence: no
    // shard dropped, none duplicated, ranges contiguous.
    let all_ranks: Vec<u32> = plan
        .targets
        .iter()
        .flat_map(|t| t.sources.iter().map(|s| s.rank))
        .collect();
    assert_eq!(all_ranks, (0..sizes.len() as u32).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_max_bytes_policy_bounds_target_size() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    for rank in 0..10 {
        write_shard(dir.path(), "part-A", rank, &[0u8; 40])?;
    }

    let plan_root = TempDir::new()?;
    let plan = planner(dir.path(), plan_root.path(), TargetPolicy::MaxBytes(100)).plan()?;

    for target in &plan.targets {
        assert!(target.total_bytes() <= 100);
    }
    let total: u64 = plan.targets.iter().map(shardflow::PlanTarget::total_bytes).sum();
    assert_eq!(total, 400);
    Ok(())
}

#[test]
fn test_streams_are_planned_separately() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_shard(dir.path(), "part-A", 0, b"aa")?;
    write_shard(dir.path(), "part-A", 1, b"bb")?;
    write_shard(dir.path(), "part-B", 0, b"cc")?;

    let plan_root = TempDir::new()?;
    let plan = planner(dir.path(), plan_root.path(), TargetPolicy::Count(1)).plan()?;

    // One target per stream, ids unique and ascending.
    assert_eq!(plan.targets.len(), 2);
    assert_eq!(plan.targets[0].stream, "part-A");
    assert_eq!(plan.targets[1].stream, "part-B");
    let ids: Vec<u32> = plan.targets.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![0, 1]);
    Ok(())
}

#[test]
fn test_stream_filter_restricts_discovery() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_shard(dir.path(), "part-A", 0, b"aa")?;
    write_shard(dir.path(), "part-B", 0, b"cc")?;

    let plan_root = TempDir::new()?;
    let mut p = planner(dir.path(), plan_root.path(), TargetPolicy::Count(1));
    p.stream = Some("part-B".to_string());
    let plan = p.plan()?;

    assert_eq!(plan.targets.len(), 1);
    assert_eq!(plan.targets[0].stream, "part-B");
    Ok(())
}

#[test]
fn test_plan_file_is_human_inspectable_json() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_shard(dir.path(), "part-A", 0, b"data")?;

    let plan_root = TempDir::new()?;
    let p = planner(dir.path(), plan_root.path(), TargetPolicy::Count(1));
    p.plan()?;

    let text = fs::read_to_string(p.plan_path())?;
    let value: serde_json::Value = serde_json::from_str(&text)?;
    assert_eq!(value["version"], PLAN_VERSION);
    assert!(value["targets"].is_array());
    assert!(value["targets"][0]["sources"][0]["rank"].is_u64());
    // Pretty-printed, not a single opaque line.
    assert!(text.lines().count() > 1);
    Ok(())
}
