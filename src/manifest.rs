//! Build manifest: the ordered audit trail of one build.
//!
//! Every stage and every customization unit is appended as it finishes,
//! including failures and skips, and the file is rewritten after each
//! record so a crashed or interrupted build is still diagnosable.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::component::{Phase, Policy};
use crate::timing::utc_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    Stage,
    Unit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Applied,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub seq: usize,
    pub kind: EntryKind,
    pub name: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Policy>,
    pub finished_at: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Final state of the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum BuildResult {
    /// Every unit applied.
    Succeeded { output: PathBuf },
    /// Image produced, but deferrable units failed.
    Degraded { output: PathBuf, warnings: usize },
    Failed { kind: String, message: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildManifest {
    pub tool_version: String,
    pub station_id: String,
    pub started_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
    /// Base image tag, installer tag, artifact checksums.
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
    #[serde(default)]
    pub result: Option<BuildResult>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl BuildManifest {
    /// New manifest persisted at `path` after every change.
    pub fn create(path: &Path, station_id: &str) -> Result<Self> {
        let mut manifest = Self::in_memory(station_id);
        manifest.path = Some(path.to_path_buf());
        manifest.persist()?;
        Ok(manifest)
    }

    /// Manifest that is never written to disk.
    pub fn in_memory(station_id: &str) -> Self {
        Self {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            station_id: station_id.to_string(),
            started_at: utc_rfc3339(),
            finished_at: None,
            versions: BTreeMap::new(),
            entries: Vec::new(),
            result: None,
            path: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let mut manifest: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest {}", path.display()))?;
        manifest.path = Some(path.to_path_buf());
        Ok(manifest)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_version(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        self.versions.insert(key.to_string(), value.into());
        self.persist()
    }

    /// Record a pipeline stage.
    pub fn record_stage(
        &mut self,
        name: &str,
        outcome: Outcome,
        duration: Duration,
        error: Option<String>,
    ) -> Result<()> {
        self.push(ManifestEntry {
            seq: self.entries.len(),
            kind: EntryKind::Stage,
            name: name.to_string(),
            outcome,
            phase: None,
            policy: None,
            finished_at: utc_rfc3339(),
            duration_ms: duration.as_millis() as u64,
            error,
            notes: Vec::new(),
        })
    }

    /// Record a customization unit.
    #[allow(clippy::too_many_arguments)]
    pub fn record_unit(
        &mut self,
        name: &str,
        phase: Phase,
        policy: Policy,
        outcome: Outcome,
        duration: Duration,
        error: Option<String>,
        notes: Vec<String>,
    ) -> Result<()> {
        self.push(ManifestEntry {
            seq: self.entries.len(),
            kind: EntryKind::Unit,
            name: name.to_string(),
            outcome,
            phase: Some(phase),
            policy: Some(policy),
            finished_at: utc_rfc3339(),
            duration_ms: duration.as_millis() as u64,
            error,
            notes,
        })
    }

    pub fn finish(&mut self, result: BuildResult) -> Result<()> {
        self.finished_at = Some(utc_rfc3339());
        self.result = Some(result);
        self.persist()
    }

    fn push(&mut self, entry: ManifestEntry) -> Result<()> {
        self.entries.push(entry);
        self.persist()
    }

    /// Write to a sibling temp file and rename over the manifest.
    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize manifest")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move manifest into {}", path.display()))?;
        Ok(())
    }

    /// Unit entries in recorded order.
    pub fn units(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::Unit)
    }

    pub fn stages(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::Stage)
    }

    pub fn entry(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Deferrable unit failures.
    pub fn warnings(&self) -> Vec<&ManifestEntry> {
        self.units()
            .filter(|e| e.outcome == Outcome::Failed && e.policy == Some(Policy::Deferrable))
            .collect()
    }

    /// Print a short human summary.
    pub fn print_summary(&self) {
        println!("Build manifest ({} entries):", self.entries.len());
        for entry in &self.entries {
            let tag = match entry.outcome {
                Outcome::Applied => "  OK ",
                Outcome::Failed => "FAIL ",
                Outcome::Skipped => "SKIP ",
            };
            let kind = match entry.kind {
                EntryKind::Stage => "stage",
                EntryKind::Unit => "unit ",
            };
            println!(
                "  [{}] {} {:<24} {:>8}ms",
                tag, kind, entry.name, entry.duration_ms
            );
            if let Some(error) = &entry.error {
                println!("         {}", error);
            }
            for note in &entry.notes {
                println!("         - {}", note);
            }
        }
        match &self.result {
            Some(BuildResult::Succeeded { output }) => {
                println!("Result: succeeded ({})", output.display())
            }
            Some(BuildResult::Degraded { output, warnings }) => println!(
                "Result: succeeded with {} warning(s) ({})",
                warnings,
                output.display()
            ),
            Some(BuildResult::Failed { kind, message }) => {
                println!("Result: failed [{}] {}", kind, message)
            }
            Some(BuildResult::Cancelled) => println!("Result: cancelled"),
            None => println!("Result: (build did not finish)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_is_persisted_after_every_record() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("output/build-manifest.json");
        let mut manifest = BuildManifest::create(&path, "KT7RUN").unwrap();
        assert!(path.exists());

        manifest
            .record_stage("extract", Outcome::Applied, Duration::from_millis(5), None)
            .unwrap();
        assert_eq!(BuildManifest::load(&path).unwrap().entries.len(), 1);

        manifest
            .record_unit(
                "documentation",
                Phase::Extras,
                Policy::Deferrable,
                Outcome::Failed,
                Duration::from_millis(2),
                Some("docs missing".into()),
                vec![],
            )
            .unwrap();

        let reloaded = BuildManifest::load(&path).unwrap();
        assert_eq!(reloaded.entries.len(), 2);
        assert_eq!(reloaded.entries[1].seq, 1);
        assert_eq!(reloaded.warnings().len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_finish_records_result() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build-manifest.json");
        let mut manifest = BuildManifest::create(&path, "KT7RUN").unwrap();
        manifest.set_version("installer", "v4.0.0").unwrap();
        manifest
            .finish(BuildResult::Failed {
                kind: "mount".into(),
                message: "umount failed".into(),
            })
            .unwrap();

        let reloaded = BuildManifest::load(&path).unwrap();
        assert!(reloaded.finished_at.is_some());
        assert_eq!(reloaded.versions["installer"], "v4.0.0");
        assert!(matches!(reloaded.result, Some(BuildResult::Failed { .. })));
    }

    #[test]
    fn test_in_memory_manifest_never_touches_disk() {
        let mut manifest = BuildManifest::in_memory("KT7RUN");
        manifest
            .record_stage("preseed", Outcome::Skipped, Duration::ZERO, None)
            .unwrap();
        assert!(manifest.path().is_none());
        assert_eq!(manifest.stages().count(), 1);
    }
}
