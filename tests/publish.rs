//! Atomic publication tests: no partial output is ever visible.

use shardflow::{MergeError, publish_atomic};
use std::fs::{self, File};
use std::io::{self, Write};
use tempfile::TempDir;

#[test]
fn test_publish_writes_complete_content() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let target = dir.path().join("artifact.bin");

    let bytes = publish_atomic(&target, |w| w.write_all(b"hello world"))?;

    assert_eq!(bytes, 11);
    assert_eq!(fs::read(&target)?, b"hello world");
    Ok(())
}

#[test]
fn test_publish_creates_parent_directories() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let target = dir.path().join("a/b/c/artifact.bin");

    publish_atomic(&target, |w| w.write_all(b"x"))?;

    assert!(target.is_file());
    Ok(())
}

#[test]
fn test_failed_producer_leaves_target_absent() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let target = dir.path().join("artifact.bin");

    let result = publish_atomic(&target, |w| {
        w.write_all(b"partial bytes that must never be seen")?;
        Err(io::Error::other("producer interrupted"))
    });

    assert!(matches!(result, Err(MergeError::Publish { .. })));
    assert!(!target.exists());
    // The orphaned temp file is cleaned up on drop.
    assert_eq!(fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn test_retry_after_interruption_produces_complete_artifact() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let target = dir.path().join("artifact.bin");

    let failed = publish_atomic(&target, |w| {
        w.write_all(b"part")?;
        Err(io::Error::other("killed"))
    });
    assert!(failed.is_err());
    assert!(!target.exists());

    // The target was untouched, so the whole write can simply be redone.
    publish_atomic(&target, |w| w.write_all(b"complete content"))?;
    assert_eq!(fs::read(&target)?, b"complete content");
    Ok(())
}

#[test]
fn test_publish_does_not_clobber_existing_target() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let target = dir.path().join("artifact.bin");
    File::create(&target)?.write_all(b"winner")?;

    let result = publish_atomic(&target, |w| w.write_all(b"loser"));

    assert!(matches!(result, Err(MergeError::WriteConflict { .. })));
    assert_eq!(fs::read(&target)?, b"winner");
    Ok(())
}
