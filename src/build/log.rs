//! Build log sink shared by tracing and child processes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};

/// Append-only `build.log` in the work directory.
///
/// Cloning shares the underlying file. Child processes get their own
/// duplicated descriptor so their output lands in order with ours.
#[derive(Debug, Clone)]
pub struct BuildLog {
    path: PathBuf,
    file: Arc<File>,
}

impl BuildLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open build log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A handle suitable for a child's stdout or stderr.
    pub fn stdio(&self) -> Result<Stdio> {
        let dup = self
            .file
            .try_clone()
            .context("Failed to duplicate build log handle")?;
        Ok(Stdio::from(dup))
    }

    /// Write one marker line (command lines, stage banners).
    pub fn note(&self, line: &str) -> Result<()> {
        let mut file: &File = &self.file;
        writeln!(file, "{}", line).context("Failed to write build log")?;
        Ok(())
    }
}
