use std::path::PathBuf;

use anyhow::Context;

use super::BASE_OVERLAY;
use crate::common::copy_tree;
use crate::common::files::list_files;
use crate::component::{CustomizationUnit, Phase, Policy, UnitContext, UnitDescriptor, UnitReport};
use crate::error::{BuildError, Result};

/// Copies the station's overlay directory over the stock tree.
///
/// Its declared writes are the overlay's own file list, so later units only
/// have to acknowledge it when they really touch the same files.
pub struct BaseOverlayUnit {
    desc: UnitDescriptor,
    source: Option<PathBuf>,
}

impl BaseOverlayUnit {
    pub fn new(source: Option<PathBuf>) -> Result<Self> {
        let mut desc = UnitDescriptor::new(BASE_OVERLAY, Phase::Base, Policy::Core);
        if let Some(dir) = &source {
            if !dir.is_dir() {
                return Err(BuildError::config(format!(
                    "customize.overlay {} is not a directory",
                    dir.display()
                )));
            }
            let files = list_files(dir).map_err(|e| BuildError::config(format!("{:#}", e)))?;
            desc = desc.writes(files);
        }
        Ok(Self { desc, source })
    }
}

impl CustomizationUnit for BaseOverlayUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    fn apply(&self, ctx: &UnitContext<'_>) -> anyhow::Result<UnitReport> {
        let Some(source) = &self.source else {
            return Ok(UnitReport::default().note("no overlay configured"));
        };
        let copied = copy_tree(source, ctx.root)
            .with_context(|| format!("Failed to apply overlay {}", source.display()))?;
        Ok(UnitReport::default().note(format!("{} file(s) from {}", copied, source.display())))
    }
}
