//! Backup restore units: golden-master first, then rolling state on top.

use std::fs;

use anyhow::Context;
use tracing::info;

use super::BASE_OVERLAY;
use crate::backup::{restore, BackupKind, BackupSet, RestorePlan};
use crate::component::{CustomizationUnit, Phase, Policy, UnitContext, UnitDescriptor, UnitReport};

/// Restored state lands in the skeleton home of the user the installer creates.
pub const RESTORE_TARGET: &str = "etc/skel";

const GOLDEN: &str = "golden-master-restore";

pub struct GoldenMasterRestoreUnit {
    desc: UnitDescriptor,
    set: Option<BackupSet>,
}

impl GoldenMasterRestoreUnit {
    pub fn new(set: Option<BackupSet>) -> Self {
        Self {
            desc: UnitDescriptor::new(GOLDEN, Phase::Restore, Policy::Deferrable)
                .writes([RESTORE_TARGET])
                .supersedes([BASE_OVERLAY]),
            set,
        }
    }
}

impl CustomizationUnit for GoldenMasterRestoreUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    fn apply(&self, ctx: &UnitContext<'_>) -> anyhow::Result<UnitReport> {
        let Some(set) = &self.set else {
            return Ok(UnitReport::default().note("no golden-master set"));
        };
        let dest = ctx.root.join(RESTORE_TARGET);
        fs::create_dir_all(&dest).with_context(|| format!("Failed to create {}", dest.display()))?;

        let report = restore(&dest, std::slice::from_ref(set))?;
        Ok(UnitReport {
            notes: report.attempts.iter().map(|a| a.to_string()).collect(),
        })
    }
}

/// Restores the freshest usable rolling set and remembers it as last-good.
pub struct RollingRestoreUnit {
    desc: UnitDescriptor,
    plan: RestorePlan,
}

impl RollingRestoreUnit {
    pub fn new(plan: RestorePlan) -> Self {
        Self {
            desc: UnitDescriptor::new("rolling-restore", Phase::Restore, Policy::Deferrable)
                .writes([RESTORE_TARGET])
                .supersedes([BASE_OVERLAY, GOLDEN]),
            plan,
        }
    }
}

impl CustomizationUnit for RollingRestoreUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    fn apply(&self, ctx: &UnitContext<'_>) -> anyhow::Result<UnitReport> {
        if self.plan.rolling.is_empty() {
            return Ok(UnitReport::default().note("no rolling sets"));
        }
        let dest = ctx.root.join(RESTORE_TARGET);
        fs::create_dir_all(&dest).with_context(|| format!("Failed to create {}", dest.display()))?;

        let report = restore(&dest, &self.plan.rolling)?;
        let mut notes: Vec<String> = report.attempts.iter().map(|a| a.to_string()).collect();
        match &report.restored {
            Some(set) if set.kind == BackupKind::Rolling => {
                self.plan.store.mark_good(set)?;
                info!(set = %set.file_name(), "Marked rolling set as last-good");
            }
            _ => notes.push("no usable rolling set; golden-master state kept".to_string()),
        }
        Ok(UnitReport { notes })
    }
}
