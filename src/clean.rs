//! Removing build state.
//!
//! Backups are never removed here: golden-master sets are made by hand and
//! rolling sets are the only copy of the previous deployment's state.

use std::fs::{self, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use crate::config::Config;
use crate::error::{BuildError, Result, StageResultExt};
use crate::host::Host;
use crate::image::LOCK_FILE;

/// What `stationiso clean` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanTarget {
    /// Extracted tree, ISO contents and build log.
    Work,
    /// Finished images, checksums and the manifest.
    Output,
    /// Downloaded artifacts (backups are kept).
    Cache,
    All,
}

pub fn clean(config: &Config, host: &dyn Host, target: CleanTarget) -> Result<()> {
    match target {
        CleanTarget::Work => clean_work(&config.work_dir, host),
        CleanTarget::Output => clean_output(&config.output_dir),
        CleanTarget::Cache => clean_cache(&config.cache_dir),
        CleanTarget::All => {
            clean_work(&config.work_dir, host)?;
            clean_output(&config.output_dir)?;
            clean_cache(&config.cache_dir)
        }
    }
}

/// Remove the work tree. Refuses while anything is mounted under it or
/// another build holds its lock.
pub fn clean_work(work_dir: &Path, host: &dyn Host) -> Result<()> {
    if !work_dir.exists() {
        println!("Nothing to clean in {}", work_dir.display());
        return Ok(());
    }
    let work_dir = fs::canonicalize(work_dir)?;

    let mounted = host.mounts_under(&work_dir).or_stage(BuildError::mount)?;
    if !mounted.is_empty() {
        let list: Vec<String> = mounted.iter().map(|p| p.display().to_string()).collect();
        return Err(BuildError::mount(format!(
            "refusing to clean {}: still mounted: {}",
            work_dir.display(),
            list.join(", ")
        )));
    }

    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(work_dir.join(LOCK_FILE))?;
    if lock.try_lock_exclusive().is_err() {
        return Err(BuildError::WorkdirLocked { path: work_dir });
    }

    println!("Removing {}...", work_dir.display());
    for entry in fs::read_dir(&work_dir)? {
        let path = entry?.path();
        if path.file_name().is_some_and(|n| n == LOCK_FILE) {
            continue;
        }
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    FileExt::unlock(&lock)?;
    println!("Work directory cleaned.");
    Ok(())
}

pub fn clean_output(output_dir: &Path) -> Result<()> {
    if output_dir.exists() {
        println!("Removing {}...", output_dir.display());
        fs::remove_dir_all(output_dir)?;
    }
    println!("Output cleaned.");
    Ok(())
}

/// Remove cached artifacts, keeping `backups/`.
pub fn clean_cache(cache_dir: &Path) -> Result<()> {
    if !cache_dir.exists() {
        println!("Nothing to clean in {}", cache_dir.display());
        return Ok(());
    }
    for entry in fs::read_dir(cache_dir)? {
        let path = entry?.path();
        if path.file_name().is_some_and(|n| n == "backups") {
            continue;
        }
        println!("Removing {}...", path.display());
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    println!("Cache cleaned (backups preserved).");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::write_file_with_dirs;
    use crate::host::fake::FakeHost;
    use crate::host::CHROOT_MOUNTS;
    use tempfile::TempDir;

    #[test]
    fn test_clean_work_refuses_while_mounted() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        fs::create_dir_all(&work).unwrap();
        let root = work.canonicalize().unwrap().join("squashfs-root");
        let host = FakeHost::new();
        host.mount(&CHROOT_MOUNTS[0], &root).unwrap();

        let err = clean_work(&work, &host).unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert!(root.join("proc").exists());

        host.unmount(&root.join("proc")).unwrap();
        clean_work(&work, &host).unwrap();
        assert!(!root.exists());
        assert!(work.join(LOCK_FILE).exists());
    }

    #[test]
    fn test_clean_cache_keeps_backups() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path();
        write_file_with_dirs(cache.join("base-image/22.04.5/base.iso"), "iso").unwrap();
        write_file_with_dirs(cache.join("backups/golden-master-20260101T000000Z.tar.zst"), "x").unwrap();

        clean_cache(cache).unwrap();
        assert!(!cache.join("base-image").exists());
        assert!(cache.join("backups/golden-master-20260101T000000Z.tar.zst").exists());
    }

    #[test]
    fn test_clean_missing_dirs_is_noop() {
        let temp = TempDir::new().unwrap();
        let host = FakeHost::new();
        clean_work(&temp.path().join("none"), &host).unwrap();
        clean_output(&temp.path().join("none")).unwrap();
        clean_cache(&temp.path().join("none")).unwrap();
    }
}
