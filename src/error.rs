//! Error taxonomy for the image build pipeline.
//!
//! Helpers inside a stage return `anyhow::Result` with context; the stage
//! boundary converts into a `BuildError` so `main` can pick an exit code.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Build pipeline errors.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Artifact download failed after all retries.
    #[error("Failed to fetch {artifact} after {attempts} attempt(s): {reason}")]
    Fetch {
        artifact: String,
        attempts: u32,
        reason: String,
    },

    /// A cached artifact no longer matches its pinned checksum.
    #[error("Integrity check failed for {}: expected sha256 {expected}, got {actual}", path.display())]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Extraction, bind or unbind failure.
    #[error("Mount error: {reason}")]
    Mount { reason: String },

    /// Third-party installer exited nonzero or left no marker.
    #[error("Installer failed: {reason}")]
    InstallerFailure { reason: String },

    /// A customization unit failed.
    #[error("Customization unit '{unit}' failed: {reason}")]
    UnitFailure { unit: String, reason: String },

    /// The registry's declared order would let a unit clobber another.
    #[error("Unit ordering violation: {reason}")]
    OrderingViolation { reason: String },

    /// Invalid or inconsistent preseed profile.
    #[error("Preseed generation failed: {reason}")]
    Preseed { reason: String },

    /// Squashfs or ISO creation failed.
    #[error("Repack failed: {reason}")]
    Repack { reason: String },

    /// Invalid station file or environment configuration.
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    /// Host tool or privilege missing.
    #[error("Missing prerequisite: {reason}")]
    Prerequisite { reason: String },

    /// Another build holds the working directory.
    #[error("Working directory {} is in use by another build", path.display())]
    WorkdirLocked { path: PathBuf },

    /// Operator interrupted the build.
    #[error("Build was cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, BuildError>;

impl BuildError {
    pub fn mount(reason: String) -> Self {
        Self::Mount { reason }
    }

    pub fn installer(reason: String) -> Self {
        Self::InstallerFailure { reason }
    }

    pub fn preseed(reason: String) -> Self {
        Self::Preseed { reason }
    }

    pub fn repack(reason: String) -> Self {
        Self::Repack { reason }
    }

    pub fn config(reason: String) -> Self {
        Self::Config { reason }
    }

    pub fn prerequisite(reason: String) -> Self {
        Self::Prerequisite { reason }
    }

    pub fn ordering(reason: String) -> Self {
        Self::OrderingViolation { reason }
    }

    pub fn unit(unit: &str, reason: String) -> Self {
        Self::UnitFailure {
            unit: unit.to_string(),
            reason,
        }
    }

    /// Short machine-readable kind, used in the build manifest.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "fetch",
            Self::Integrity { .. } => "integrity",
            Self::Mount { .. } => "mount",
            Self::InstallerFailure { .. } => "installer",
            Self::UnitFailure { .. } => "unit",
            Self::OrderingViolation { .. } => "ordering",
            Self::Preseed { .. } => "preseed",
            Self::Repack { .. } => "repack",
            Self::Config { .. } => "config",
            Self::Prerequisite { .. } => "prerequisite",
            Self::WorkdirLocked { .. } => "locked",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Prerequisite { .. } | Self::Config { .. } | Self::OrderingViolation { .. } => 2,
            Self::Fetch { .. } => 3,
            Self::Integrity { .. } => 4,
            Self::Mount { .. } => 5,
            Self::InstallerFailure { .. } => 6,
            Self::UnitFailure { .. } => 7,
            Self::Preseed { .. } => 8,
            Self::Repack { .. } => 9,
            Self::WorkdirLocked { .. } => 10,
            Self::Cancelled => 130,
            Self::Io(_) => 1,
        }
    }
}

/// Exit code for an error that may or may not wrap a `BuildError`.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|e| e.downcast_ref::<BuildError>())
        .map(BuildError::exit_code)
        .unwrap_or(1)
}

/// Convert helper-level `anyhow` errors into the taxonomy at a stage boundary.
///
/// A `BuildError` already inside the chain (cancellation, integrity) is kept
/// as-is; anything else is wrapped by `wrap`.
pub trait StageResultExt<T> {
    fn or_stage(self, wrap: impl FnOnce(String) -> BuildError) -> Result<T>;
}

impl<T> StageResultExt<T> for anyhow::Result<T> {
    fn or_stage(self, wrap: impl FnOnce(String) -> BuildError) -> Result<T> {
        self.map_err(|err| match err.downcast::<BuildError>() {
            Ok(build) => build,
            Err(other) => wrap(render(&other)),
        })
    }
}

fn render(err: &impl fmt::Display) -> String {
    format!("{:#}", err)
}
