//! Customization units applied to the extracted tree after the installer.
//!
//! Each unit is a descriptor (name, phase, policy, declared write paths,
//! supersedes list) plus an `apply` operation. The registry keeps them in an
//! explicit ordered list and checks that order statically before anything is
//! written, so a later unit cannot silently overwrite what an earlier one
//! (in particular the backup restore) put down.
//!
//! ```text
//! base-overlay → identity → networking → user-account → desktop-baseline
//!   → packaging → golden-master-restore → rolling-restore → app-config
//!   → documentation → license-import → [operator script units]
//! ```

pub mod registry;
pub mod units;

pub use registry::{ApplyOptions, ApplySummary, Registry, UnitResult};

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::host::Host;
use crate::station::StationFile;

/// Ordering key. Phases must be non-decreasing along the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum Phase {
    /// Files laid over the stock tree before anything else.
    Base = 1,
    /// Hostname and station identity.
    Identity = 2,
    /// Network profiles.
    Network = 3,
    /// Account defaults for the user the installer will create.
    Accounts = 4,
    /// Desktop defaults.
    Desktop = 5,
    /// Package manager policy.
    Packaging = 6,
    /// Golden-master then rolling user state.
    Restore = 7,
    /// Final user-visible configuration.
    FinalConfig = 8,
    /// Docs, licenses and other embedded content.
    Extras = 9,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Base => "base",
            Phase::Identity => "identity",
            Phase::Network => "network",
            Phase::Accounts => "accounts",
            Phase::Desktop => "desktop",
            Phase::Packaging => "packaging",
            Phase::Restore => "restore",
            Phase::FinalConfig => "final-config",
            Phase::Extras => "extras",
        };
        f.write_str(name)
    }
}

/// What happens to the build when a unit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Failure aborts the build.
    Core,
    /// Failure is recorded as a warning and the build continues.
    Deferrable,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Core => f.write_str("core"),
            Policy::Deferrable => f.write_str("deferrable"),
        }
    }
}

/// Static description of a unit. Inspectable without running anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitDescriptor {
    pub name: String,
    pub phase: Phase,
    pub policy: Policy,
    /// Relative paths (files or directory prefixes) the unit may write.
    pub writes: Vec<String>,
    /// Earlier units whose overlapping writes this unit intentionally replaces.
    pub supersedes: Vec<String>,
    /// Embedded content; skipped in minimal builds.
    pub embedding: bool,
}

impl UnitDescriptor {
    pub fn new(name: impl Into<String>, phase: Phase, policy: Policy) -> Self {
        Self {
            name: name.into(),
            phase,
            policy,
            writes: Vec::new(),
            supersedes: Vec::new(),
            embedding: false,
        }
    }

    pub fn writes<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writes.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn supersedes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supersedes.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn embedding(mut self) -> Self {
        self.embedding = true;
        self
    }

    pub fn is_restore(&self) -> bool {
        self.phase == Phase::Restore
    }

    pub fn is_base_overlay(&self) -> bool {
        self.phase == Phase::Base
    }

    pub fn is_final_config(&self) -> bool {
        self.phase == Phase::FinalConfig
    }

    /// First pair of overlapping paths between this unit and `other`.
    pub fn overlap_with(&self, other: &UnitDescriptor) -> Option<(String, String)> {
        for a in &self.writes {
            for b in &other.writes {
                if paths_overlap(a, b) {
                    return Some((a.clone(), b.clone()));
                }
            }
        }
        None
    }
}

/// True if one relative path is equal to or nested inside the other.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let a = a.trim_matches('/');
    let b = b.trim_matches('/');
    if a.is_empty() || b.is_empty() {
        return true;
    }
    a == b || is_nested(a, b) || is_nested(b, a)
}

fn is_nested(inner: &str, outer: &str) -> bool {
    inner.len() > outer.len()
        && inner.starts_with(outer)
        && inner.as_bytes()[outer.len()] == b'/'
}

/// Everything a unit may read while applying.
pub struct UnitContext<'a> {
    /// Root of the extracted tree.
    pub root: &'a Path,
    pub station: &'a StationFile,
    pub host: &'a dyn Host,
}

/// Notes a unit wants recorded next to its manifest entry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub notes: Vec<String>,
}

impl UnitReport {
    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

/// An idempotent mutation of the extracted tree.
///
/// Applying a unit twice to the same tree must leave it as applying it once.
pub trait CustomizationUnit {
    fn descriptor(&self) -> &UnitDescriptor;

    fn apply(&self, ctx: &UnitContext<'_>) -> anyhow::Result<UnitReport>;

    fn name(&self) -> &str {
        &self.descriptor().name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering() {
        assert!(Phase::Base < Phase::Identity);
        assert!(Phase::Packaging < Phase::Restore);
        assert!(Phase::Restore < Phase::FinalConfig);
        assert!(Phase::FinalConfig < Phase::Extras);
    }

    #[test]
    fn test_paths_overlap_respects_component_boundaries() {
        assert!(paths_overlap("etc/skel", "etc/skel/.config/app.ini"));
        assert!(paths_overlap("etc/skel/", "etc/skel"));
        assert!(!paths_overlap("etc/skel", "etc/skeleton"));
        assert!(!paths_overlap("etc/hostname", "etc/hosts"));
        assert!(paths_overlap("", "anything"));
    }

    #[test]
    fn test_descriptor_builder() {
        let desc = UnitDescriptor::new("documentation", Phase::Extras, Policy::Deferrable)
            .writes(["usr/share/doc/stationiso"])
            .supersedes(["base-overlay"])
            .embedding();
        assert!(desc.embedding);
        assert_eq!(desc.writes, vec!["usr/share/doc/stationiso"]);
        assert_eq!(desc.supersedes, vec!["base-overlay"]);
    }

    #[test]
    fn test_phase_deserializes_kebab_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            phase: Phase,
        }
        let w: Wrapper = toml::from_str("phase = \"final-config\"").unwrap();
        assert_eq!(w.phase, Phase::FinalConfig);
        assert_eq!(w.phase.to_string(), "final-config");
    }
}
