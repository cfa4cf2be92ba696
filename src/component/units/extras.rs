//! Embedded documentation and third-party license texts.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use super::BASE_OVERLAY;
use crate::common::files::list_files;
use crate::common::{copy_tree, write_file_with_dirs};
use crate::component::{CustomizationUnit, Phase, Policy, UnitContext, UnitDescriptor, UnitReport};

const MANUAL_DIR: &str = "usr/share/doc/stationiso/manual";
const LICENSES_DIR: &str = "usr/share/doc/stationiso/licenses";

/// Copies the operator manual into the image. Skipped in minimal builds.
pub struct DocumentationUnit {
    desc: UnitDescriptor,
    source: Option<PathBuf>,
}

impl DocumentationUnit {
    pub fn new(source: Option<PathBuf>) -> Self {
        Self {
            desc: UnitDescriptor::new("documentation", Phase::Extras, Policy::Deferrable)
                .writes([MANUAL_DIR])
                .supersedes([BASE_OVERLAY])
                .embedding(),
            source,
        }
    }
}

impl CustomizationUnit for DocumentationUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    fn apply(&self, ctx: &UnitContext<'_>) -> Result<UnitReport> {
        let Some(source) = &self.source else {
            return Ok(UnitReport::default().note("no documentation configured"));
        };
        if !source.is_dir() {
            bail!("documentation source {} is not a directory", source.display());
        }
        let copied = copy_tree(source, &ctx.root.join(MANUAL_DIR))
            .with_context(|| format!("Failed to copy {}", source.display()))?;
        Ok(UnitReport::default().note(format!("{} file(s)", copied)))
    }
}

/// Copies license texts and writes an index of what was imported.
pub struct LicenseImportUnit {
    desc: UnitDescriptor,
    source: Option<PathBuf>,
}

impl LicenseImportUnit {
    pub fn new(source: Option<PathBuf>) -> Self {
        Self {
            desc: UnitDescriptor::new("license-import", Phase::Extras, Policy::Deferrable)
                .writes([LICENSES_DIR])
                .supersedes([BASE_OVERLAY]),
            source,
        }
    }
}

impl CustomizationUnit for LicenseImportUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    fn apply(&self, ctx: &UnitContext<'_>) -> Result<UnitReport> {
        let Some(source) = &self.source else {
            return Ok(UnitReport::default().note("no licenses configured"));
        };
        if !source.is_dir() {
            bail!("license source {} is not a directory", source.display());
        }
        let files = list_files(source)?;
        if files.is_empty() {
            bail!("license source {} is empty", source.display());
        }

        let dest = ctx.root.join(LICENSES_DIR);
        copy_tree(source, &dest)?;

        let mut index = String::new();
        for file in files.iter().filter(|f| f.as_str() != "INDEX") {
            let _ = writeln!(index, "{}", file);
        }
        write_file_with_dirs(dest.join("INDEX"), index)?;
        Ok(UnitReport::default().note(format!("{} license file(s)", files.len())))
    }
}
