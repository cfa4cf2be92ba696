//! Backup sets: golden-master and rolling user state.
//!
//! A golden-master set is created by hand (`stationiso backup golden`) and
//! never touched by the pipeline. A rolling set is captured at the start of
//! every build from the previous deployment's home directory. Both are
//! restored into `etc/skel` of the new tree, golden-master first, so the
//! rolling state wins wherever the two overlap.
//!
//! Layout under `<cache>/backups`:
//!
//! ```text
//! golden-master-20260101T120000Z.tar.zst
//! rolling-20261019T081502Z.tar.zst
//! last-good                 # file name of the last rolling set restored
//! ```

pub mod archive;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::timing::utc_compact;
use archive::{unpack_archive, validate_archive, write_archive, ArchiveHeader};

pub const ARCHIVE_SUFFIX: &str = ".tar.zst";
const LAST_GOOD: &str = "last-good";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupKind {
    GoldenMaster,
    Rolling,
}

impl BackupKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            BackupKind::GoldenMaster => "golden-master",
            BackupKind::Rolling => "rolling",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// One archive on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSet {
    pub kind: BackupKind,
    pub archive: PathBuf,
    /// Compact UTC timestamp taken from the file name.
    pub captured_at: String,
    /// Relative paths inside the set (empty until read from the header).
    pub paths: Vec<String>,
}

impl BackupSet {
    pub fn file_name(&self) -> String {
        self.archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Timestamp, then the collision counter (`<stamp>-<n>`; none counts as 0).
    fn order_key(&self) -> (&str, u32) {
        match self.captured_at.split_once('-') {
            Some((stamp, n)) => (stamp, n.parse().unwrap_or(0)),
            None => (self.captured_at.as_str(), 0),
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(ARCHIVE_SUFFIX)?;
        let (kind, stamp) = if let Some(stamp) = stem.strip_prefix("golden-master-") {
            (BackupKind::GoldenMaster, stamp)
        } else if let Some(stamp) = stem.strip_prefix("rolling-") {
            (BackupKind::Rolling, stamp)
        } else {
            return None;
        };
        Some(Self {
            kind,
            archive: path.to_path_buf(),
            captured_at: stamp.to_string(),
            paths: Vec::new(),
        })
    }
}

/// What happened when one set was tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Restored { files: usize },
    Missing,
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreAttempt {
    pub set: String,
    pub outcome: AttemptOutcome,
}

impl fmt::Display for RestoreAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            AttemptOutcome::Restored { files } => {
                write!(f, "{}: restored {} file(s)", self.set, files)
            }
            AttemptOutcome::Missing => write!(f, "{}: missing", self.set),
            AttemptOutcome::Corrupt(reason) => write!(f, "{}: corrupt ({})", self.set, reason),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub attempts: Vec<RestoreAttempt>,
    pub restored: Option<BackupSet>,
}

/// Try `sets` in order; the first one that validates and unpacks wins.
///
/// Missing and corrupt sets are recorded and skipped. An error is returned
/// only when the destination itself can't be written.
pub fn restore(dest: &Path, sets: &[BackupSet]) -> Result<RestoreReport> {
    let mut report = RestoreReport::default();

    for set in sets {
        let name = set.file_name();
        if !set.archive.exists() {
            warn!(set = %name, "Backup set missing, trying next");
            report.attempts.push(RestoreAttempt {
                set: name,
                outcome: AttemptOutcome::Missing,
            });
            continue;
        }

        let header = match validate_archive(&set.archive) {
            Ok(header) => header,
            Err(e) => {
                warn!(set = %name, "Backup set failed validation: {:#}", e);
                report.attempts.push(RestoreAttempt {
                    set: name,
                    outcome: AttemptOutcome::Corrupt(format!("{:#}", e)),
                });
                continue;
            }
        };

        if header.kind != set.kind {
            report.attempts.push(RestoreAttempt {
                set: name,
                outcome: AttemptOutcome::Corrupt(format!(
                    "header says {}, file name says {}",
                    header.kind, set.kind
                )),
            });
            continue;
        }

        let files = unpack_archive(&set.archive, dest)
            .with_context(|| format!("Failed to restore {} into {}", name, dest.display()))?;
        info!(set = %name, files, "Restored backup set");
        report.attempts.push(RestoreAttempt {
            set: name,
            outcome: AttemptOutcome::Restored { files },
        });
        let mut restored = set.clone();
        restored.paths = header.paths;
        report.restored = Some(restored);
        break;
    }

    Ok(report)
}

/// Backup directory inside the cache.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sets of `kind`, newest first.
    pub fn list(&self, kind: BackupKind) -> Result<Vec<BackupSet>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut sets: Vec<BackupSet> = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {}", self.dir.display()))?
            .filter_map(|e| e.ok())
            .filter_map(|e| BackupSet::from_path(&e.path()))
            .filter(|s| s.kind == kind)
            .collect();
        sets.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
        Ok(sets)
    }

    pub fn latest_golden(&self) -> Result<Option<BackupSet>> {
        Ok(self.list(BackupKind::GoldenMaster)?.into_iter().next())
    }

    /// Rolling set last restored successfully, if it still exists.
    pub fn last_good(&self) -> Option<BackupSet> {
        let name = fs::read_to_string(self.dir.join(LAST_GOOD)).ok()?;
        let set = BackupSet::from_path(&self.dir.join(name.trim()))?;
        set.archive.exists().then_some(set)
    }

    pub fn mark_good(&self, set: &BackupSet) -> Result<()> {
        let path = self.dir.join(LAST_GOOD);
        fs::write(&path, format!("{}\n", set.file_name()))
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn new_archive_path(&self, kind: BackupKind) -> Result<(PathBuf, String)> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let stamp = utc_compact();
        let mut candidate = stamp.clone();
        let mut n = 1;
        while self
            .dir
            .join(format!("{}-{}{}", kind.prefix(), candidate, ARCHIVE_SUFFIX))
            .exists()
        {
            candidate = format!("{}-{}", stamp, n);
            n += 1;
        }
        let path = self
            .dir
            .join(format!("{}-{}{}", kind.prefix(), candidate, ARCHIVE_SUFFIX));
        Ok((path, candidate))
    }

    fn capture(&self, kind: BackupKind, source: &Path, paths: &[String]) -> Result<Option<BackupSet>> {
        let (path, stamp) = self.new_archive_path(kind)?;
        let part = path.with_extension("zst.part");
        let header = ArchiveHeader {
            kind,
            captured_at: stamp.clone(),
            paths: paths.to_vec(),
        };

        let present = match write_archive(source, paths, &header, &part) {
            Ok(present) => present,
            Err(e) => {
                let _ = fs::remove_file(&part);
                return Err(e);
            }
        };
        if present.is_empty() {
            fs::remove_file(&part).ok();
            return Ok(None);
        }
        fs::rename(&part, &path)
            .with_context(|| format!("Failed to move archive into {}", path.display()))?;

        Ok(Some(BackupSet {
            kind,
            archive: path,
            captured_at: stamp,
            paths: present,
        }))
    }

    /// Capture the previous deployment's state. `None` if there is nothing to capture.
    pub fn capture_rolling(&self, previous_state: &Path, paths: &[String]) -> Result<Option<BackupSet>> {
        if paths.is_empty() {
            debug!("No backup paths declared, skipping rolling capture");
            return Ok(None);
        }
        if !previous_state.is_dir() {
            info!(path = %previous_state.display(), "No previous state, skipping rolling capture");
            return Ok(None);
        }
        let set = self.capture(BackupKind::Rolling, previous_state, paths)?;
        match &set {
            Some(set) => info!(set = %set.file_name(), paths = set.paths.len(), "Captured rolling state"),
            None => info!("None of the backup paths exist in the previous state"),
        }
        Ok(set)
    }

    /// Create a golden-master set from a hand-prepared directory.
    pub fn create_golden(&self, source: &Path, paths: &[String]) -> Result<BackupSet> {
        if !source.is_dir() {
            bail!("{} is not a directory", source.display());
        }
        if paths.is_empty() {
            bail!("No backup paths declared in the station file");
        }
        self.capture(BackupKind::GoldenMaster, source, paths)?
            .with_context(|| format!("None of the backup paths exist under {}", source.display()))
    }

    /// Delete rolling sets beyond the newest `keep`. The last-good set is kept.
    pub fn prune_rolling(&self, keep: usize) -> Result<Vec<PathBuf>> {
        let last_good = self.last_good().map(|s| s.archive);
        let mut removed = Vec::new();
        for set in self.list(BackupKind::Rolling)?.into_iter().skip(keep) {
            if Some(&set.archive) == last_good.as_ref() {
                continue;
            }
            fs::remove_file(&set.archive)
                .with_context(|| format!("Failed to prune {}", set.archive.display()))?;
            debug!(set = %set.file_name(), "Pruned rolling set");
            removed.push(set.archive);
        }
        Ok(removed)
    }

    /// Rolling sets in restore priority: the fresh capture, then last-good.
    pub fn rolling_priority(&self, fresh: Option<BackupSet>) -> Vec<BackupSet> {
        let mut order = Vec::new();
        if let Some(fresh) = fresh {
            order.push(fresh);
        }
        if let Some(good) = self.last_good() {
            if !order.iter().any(|s| s.archive == good.archive) {
                order.push(good);
            }
        }
        order
    }
}

/// Backup sets chosen at the start of a build, consumed by the restore units.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub store: BackupStore,
    pub golden: Option<BackupSet>,
    pub rolling: Vec<BackupSet>,
}

impl RestorePlan {
    pub fn empty(store: BackupStore) -> Self {
        Self {
            store,
            golden: None,
            rolling: Vec::new(),
        }
    }

    /// Capture, prune, and pick the sets to restore.
    pub fn prepare(
        store: BackupStore,
        previous_state: Option<&Path>,
        paths: &[String],
        keep_rolling: usize,
    ) -> Result<Self> {
        let fresh = match previous_state {
            Some(dir) => store.capture_rolling(dir, paths)?,
            None => None,
        };
        store.prune_rolling(keep_rolling)?;
        let golden = store.latest_golden()?;
        let rolling = store.rolling_priority(fresh);
        Ok(Self {
            store,
            golden,
            rolling,
        })
    }

    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        match &self.golden {
            Some(set) => lines.push(format!("golden-master: {}", set.file_name())),
            None => lines.push("golden-master: none".to_string()),
        }
        if self.rolling.is_empty() {
            lines.push("rolling: none".to_string());
        }
        for (i, set) in self.rolling.iter().enumerate() {
            lines.push(format!("rolling #{}: {}", i + 1, set.file_name()));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::write_file_with_dirs;
    use tempfile::TempDir;

    fn paths() -> Vec<String> {
        vec![".config/js8call".into(), ".local/share/WSJT-X".into()]
    }

    fn home_with(dir: &Path, ini: &str) {
        write_file_with_dirs(dir.join(".config/js8call/js8call.ini"), ini).unwrap();
    }

    #[test]
    fn test_same_second_captures_list_by_counter() {
        let temp = TempDir::new().unwrap();
        let store = BackupStore::new(temp.path());
        for suffix in ["", "-2", "-10", "-1"] {
            let name = format!("rolling-20261019T081502Z{}{}", suffix, ARCHIVE_SUFFIX);
            fs::write(temp.path().join(name), "").unwrap();
        }
        fs::write(temp.path().join(format!("rolling-20261018T235959Z{}", ARCHIVE_SUFFIX)), "").unwrap();

        let stamps: Vec<String> = store
            .list(BackupKind::Rolling)
            .unwrap()
            .into_iter()
            .map(|s| s.captured_at)
            .collect();
        assert_eq!(
            stamps,
            vec![
                "20261019T081502Z-10",
                "20261019T081502Z-2",
                "20261019T081502Z-1",
                "20261019T081502Z",
                "20261018T235959Z",
            ]
        );
    }

    #[test]
    fn test_capture_is_noop_without_previous_state() {
        let temp = TempDir::new().unwrap();
        let store = BackupStore::new(temp.path().join("backups"));
        let set = store
            .capture_rolling(&temp.path().join("no-such-home"), &paths())
            .unwrap();
        assert!(set.is_none());
        assert!(store.list(BackupKind::Rolling).unwrap().is_empty());
    }

    #[test]
    fn test_capture_and_restore_roundtrip() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");
        home_with(&home, "MyCall=KT7RUN\n");
        let store = BackupStore::new(temp.path().join("backups"));

        let set = store.capture_rolling(&home, &paths()).unwrap().unwrap();
        assert_eq!(set.kind, BackupKind::Rolling);
        assert!(set.file_name().starts_with("rolling-"));
        assert!(set.file_name().ends_with(".tar.zst"));

        let skel = temp.path().join("root/etc/skel");
        let report = restore(&skel, &[set.clone()]).unwrap();
        assert_eq!(report.restored.as_ref().map(|s| &s.archive), Some(&set.archive));
        assert_eq!(
            fs::read_to_string(skel.join(".config/js8call/js8call.ini")).unwrap(),
            "MyCall=KT7RUN\n"
        );
    }

    #[test]
    fn test_corrupt_set_falls_back_to_next() {
        let temp = TempDir::new().unwrap();
        let store = BackupStore::new(temp.path().join("backups"));

        let old_home = temp.path().join("old-home");
        home_with(&old_home, "MyCall=OLD\n");
        let good = store.capture_rolling(&old_home, &paths()).unwrap().unwrap();

        let new_home = temp.path().join("new-home");
        home_with(&new_home, "MyCall=NEW\n");
        let fresh = store.capture_rolling(&new_home, &paths()).unwrap().unwrap();
        fs::write(&fresh.archive, b"\x28\xb5\x2f\xfd garbage").unwrap();

        let skel = temp.path().join("skel");
        let report = restore(&skel, &[fresh.clone(), good.clone()]).unwrap();

        assert_eq!(report.attempts.len(), 2);
        assert!(matches!(report.attempts[0].outcome, AttemptOutcome::Corrupt(_)));
        assert!(matches!(report.attempts[1].outcome, AttemptOutcome::Restored { .. }));
        assert_eq!(
            fs::read_to_string(skel.join(".config/js8call/js8call.ini")).unwrap(),
            "MyCall=OLD\n"
        );
    }

    #[test]
    fn test_missing_sets_restore_nothing_without_error() {
        let temp = TempDir::new().unwrap();
        let set = BackupSet {
            kind: BackupKind::Rolling,
            archive: temp.path().join("rolling-20260101T000000Z.tar.zst"),
            captured_at: "20260101T000000Z".into(),
            paths: vec![],
        };
        let report = restore(&temp.path().join("skel"), &[set]).unwrap();
        assert!(report.restored.is_none());
        assert_eq!(report.attempts[0].outcome, AttemptOutcome::Missing);
    }

    #[test]
    fn test_prune_keeps_newest_and_last_good() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("backups");
        fs::create_dir_all(&dir).unwrap();
        for stamp in ["20260101T000000Z", "20260201T000000Z", "20260301T000000Z", "20260401T000000Z"] {
            fs::write(dir.join(format!("rolling-{}.tar.zst", stamp)), b"x").unwrap();
        }
        let store = BackupStore::new(&dir);
        let oldest = BackupSet::from_path(&dir.join("rolling-20260101T000000Z.tar.zst")).unwrap();
        store.mark_good(&oldest).unwrap();

        let removed = store.prune_rolling(2).unwrap();
        assert_eq!(removed, vec![dir.join("rolling-20260201T000000Z.tar.zst")]);

        let left: Vec<String> = store
            .list(BackupKind::Rolling)
            .unwrap()
            .iter()
            .map(|s| s.captured_at.clone())
            .collect();
        assert_eq!(left, vec!["20260401T000000Z", "20260301T000000Z", "20260101T000000Z"]);
    }

    #[test]
    fn test_rolling_priority_is_fresh_then_last_good() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("backups");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("rolling-20260101T000000Z.tar.zst"), b"x").unwrap();
        let store = BackupStore::new(&dir);
        let good = BackupSet::from_path(&dir.join("rolling-20260101T000000Z.tar.zst")).unwrap();
        store.mark_good(&good).unwrap();

        let fresh = BackupSet::from_path(&dir.join("rolling-20261019T000000Z.tar.zst")).unwrap();
        let order = store.rolling_priority(Some(fresh.clone()));
        assert_eq!(order, vec![fresh, good.clone()]);

        // The fresh capture being the last-good one is not listed twice.
        assert_eq!(store.rolling_priority(Some(good.clone())), vec![good]);
    }

    #[test]
    fn test_create_golden_requires_existing_paths() {
        let temp = TempDir::new().unwrap();
        let store = BackupStore::new(temp.path().join("backups"));
        let empty = temp.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        assert!(store.create_golden(&empty, &paths()).is_err());

        home_with(&empty, "x\n");
        let set = store.create_golden(&empty, &paths()).unwrap();
        assert_eq!(set.kind, BackupKind::GoldenMaster);
        assert_eq!(store.latest_golden().unwrap().unwrap().archive, set.archive);
    }
}
