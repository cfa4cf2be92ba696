//! Build context threaded through every pipeline stage.

use std::fs;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use super::BuildLog;
use crate::config::Config;
use crate::error::{BuildError, Result};
use crate::interrupt::Interrupt;
use crate::manifest::{BuildManifest, Outcome};
use crate::release::ReleaseSelector;
use crate::station::StationFile;

/// Operator choices for one build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub release: ReleaseSelector,
    /// Skip embedding units (documentation and the like).
    pub minimal: bool,
    /// Allow a non-empty work tree to be wiped and reused.
    pub reuse: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            release: ReleaseSelector::Stable,
            minimal: false,
            reuse: false,
        }
    }
}

/// Shared state for one build: paths, station, log sink, manifest, interrupt.
pub struct BuildContext {
    pub config: Config,
    pub station: StationFile,
    pub options: BuildOptions,
    pub log: BuildLog,
    pub manifest: BuildManifest,
    pub interrupt: Arc<Interrupt>,
}

impl BuildContext {
    /// Create directories, open the build log and start a fresh manifest.
    pub fn new(
        config: Config,
        station: StationFile,
        options: BuildOptions,
        interrupt: Arc<Interrupt>,
    ) -> Result<Self> {
        for dir in [&config.work_dir, &config.output_dir, &config.cache_dir] {
            fs::create_dir_all(dir)?;
        }
        let log = BuildLog::open(&config.log_file())
            .map_err(|e| BuildError::config(format!("{:#}", e)))?;
        let manifest = BuildManifest::create(&config.manifest_file(), &station.station.id)
            .map_err(|e| BuildError::config(format!("{:#}", e)))?;

        Ok(Self {
            config,
            station,
            options,
            log,
            manifest,
            interrupt,
        })
    }

    /// Record a finished stage in the manifest and the build log.
    pub fn record_stage<T>(
        &mut self,
        name: &str,
        started: Instant,
        result: &Result<T>,
    ) -> Result<()> {
        let elapsed = started.elapsed();
        let (outcome, error) = match result {
            Ok(_) => (Outcome::Applied, None),
            Err(e) => (Outcome::Failed, Some(e.to_string())),
        };

        match &error {
            None => info!(stage = name, "[{}] {}", crate::timing::format_duration(elapsed), name),
            Some(e) => error!(stage = name, "Stage failed: {}", e),
        }
        self.log
            .note(&format!("== {} {} ==", name, if error.is_none() { "done" } else { "FAILED" }))
            .map_err(io_error)?;
        self.manifest
            .record_stage(name, outcome, elapsed, error)
            .map_err(io_error)
    }

    /// Fail with `Cancelled` (and record it) if an interrupt arrived.
    pub fn checkpoint(&mut self, next_stage: &str) -> Result<()> {
        if let Err(e) = self.interrupt.check() {
            self.manifest
                .record_stage(next_stage, Outcome::Skipped, Default::default(), Some(e.to_string()))
                .map_err(io_error)?;
            return Err(e);
        }
        self.log
            .note(&format!("== {} ==", next_stage))
            .map_err(io_error)?;
        Ok(())
    }
}

fn io_error(e: anyhow::Error) -> BuildError {
    BuildError::Io(std::io::Error::other(format!("{:#}", e)))
}
