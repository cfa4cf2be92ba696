//! Operator-supplied script units declared in the station file.

use std::fs;

use anyhow::{bail, Context, Result};

use crate::component::{CustomizationUnit, UnitContext, UnitDescriptor, UnitReport};
use crate::station::ScriptUnitEntry;

/// Runs a shell script against the tree.
///
/// Host-side scripts get the tree root as `$1` and in `STATIONISO_ROOT`.
/// Chroot scripts are copied into the tree's `/tmp` and run inside it with
/// a root of `/`.
pub struct ScriptUnit {
    desc: UnitDescriptor,
    entry: ScriptUnitEntry,
}

impl ScriptUnit {
    pub fn new(entry: ScriptUnitEntry) -> Self {
        let mut desc = UnitDescriptor::new(entry.name.clone(), entry.phase, entry.policy)
            .writes(entry.writes.iter().cloned())
            .supersedes(entry.supersedes.iter().cloned());
        if entry.embedding {
            desc = desc.embedding();
        }
        Self { desc, entry }
    }
}

impl CustomizationUnit for ScriptUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    fn apply(&self, ctx: &UnitContext<'_>) -> Result<UnitReport> {
        let script = &self.entry.script;
        if !script.is_file() {
            bail!("script {} not found", script.display());
        }

        let status = if self.entry.chroot {
            let inside = format!("/tmp/stationiso-unit-{}", self.entry.name);
            let staged = ctx.root.join(inside.trim_start_matches('/'));
            fs::create_dir_all(ctx.root.join("tmp"))?;
            fs::copy(script, &staged)
                .with_context(|| format!("Failed to stage {} in the tree", script.display()))?;
            let status = ctx
                .host
                .chroot(ctx.root, &["/bin/sh", inside.as_str(), "/"], &[("STATIONISO_ROOT", "/")]);
            let _ = fs::remove_file(&staged);
            status?
        } else {
            ctx.host.run_script(script, ctx.root)?
        };

        if !status.success() {
            bail!(
                "{} exited with code {}",
                script.display(),
                status.code().unwrap_or(-1)
            );
        }
        Ok(UnitReport::default().note(format!("ran {}", script.display())))
    }
}
