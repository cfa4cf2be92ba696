//! Runs the third-party installer inside the chroot.
//!
//! The installer is opaque: it gets its tag and a noninteractive apt
//! frontend, its output goes to the build log, and only its exit status and
//! the marker directory it leaves behind are checked. It is never retried.

use std::fs;
use std::process::ExitStatus;

use tracing::info;

use crate::cache::Artifact;
use crate::error::{BuildError, Result, StageResultExt};
use crate::image::ChrootGuard;
use crate::station::InstallerSection;

/// Staging location inside the tree, removed after the run.
pub const STAGING_DIR: &str = "opt/stationiso-installer";

pub fn run(
    guard: &ChrootGuard<'_>,
    package: &Artifact,
    installer: &InstallerSection,
) -> Result<ExitStatus> {
    let staging = guard.root().join(STAGING_DIR);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }

    let result = stage_and_run(guard, package, installer);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    let status = result?;

    let marker = guard.root().join(&installer.marker);
    if !marker.is_dir() {
        return Err(BuildError::installer(format!(
            "installer exited successfully but did not create {}",
            installer.marker
        )));
    }
    info!(tag = %package.descriptor.tag, "Installer finished");
    Ok(status)
}

fn stage_and_run(
    guard: &ChrootGuard<'_>,
    package: &Artifact,
    installer: &InstallerSection,
) -> Result<ExitStatus> {
    let staging = guard.root().join(STAGING_DIR);
    guard
        .host()
        .unpack_tarball(&package.path, &staging)
        .or_stage(BuildError::installer)?;

    if !staging.join(&installer.script).is_file() {
        return Err(BuildError::installer(format!(
            "{} has no entry script '{}'",
            package.descriptor.file_name, installer.script
        )));
    }

    info!(tag = %package.descriptor.tag, "Running installer {}", installer.script);
    let command = format!("cd /{} && ./{}", STAGING_DIR, installer.script);
    let status = guard
        .run(
            &["/bin/bash", "-c", command.as_str()],
            &[
                ("STATIONISO_TAG", package.descriptor.tag.as_str()),
                ("DEBIAN_FRONTEND", "noninteractive"),
            ],
        )
        .or_stage(BuildError::installer)?;

    if !status.success() {
        return Err(BuildError::installer(format!(
            "{} exited with code {}",
            installer.script,
            status.code().unwrap_or(-1)
        )));
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ArtifactDescriptor, FetchState};
    use crate::host::fake::{FailPoint, FakeHost};
    use crate::image;
    use crate::station::fixtures::STATION_TOML;
    use crate::station::StationFile;
    use serial_test::serial;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn package(dir: &Path) -> Artifact {
        let path = dir.join("v2.0.3.tar.gz");
        fs::write(&path, "tarball").unwrap();
        Artifact {
            descriptor: ArtifactDescriptor {
                name: "installer".into(),
                url: "https://example.org/tarball/v2.0.3".into(),
                tag: "v2.0.3".into(),
                file_name: "v2.0.3.tar.gz".into(),
                sha256: None,
            },
            path,
            sha256: String::new(),
            state: FetchState::Cached,
        }
    }

    fn iso(temp: &TempDir) -> PathBuf {
        let path = temp.path().join("base.iso");
        fs::write(&path, "iso").unwrap();
        path
    }

    #[test]
    #[serial]
    fn test_successful_run_checks_marker_and_cleans_staging() {
        let temp = TempDir::new().unwrap();
        let station = StationFile::parse(STATION_TOML).unwrap();
        let host = FakeHost::new().with_installer_marker("opt/station-tools");
        let mut ctx = image::extract(&host, &iso(&temp), &temp.path().join("work"), false).unwrap();

        let guard = ChrootGuard::enter(&host, &mut ctx).unwrap();
        run(&guard, &package(temp.path()), &station.installer).unwrap();
        assert!(guard.root().join("opt/station-tools").is_dir());
        assert!(!guard.root().join(STAGING_DIR).exists());
        assert!(host
            .calls()
            .iter()
            .any(|c| c == "chroot /bin/bash -c cd /opt/stationiso-installer && ./install.sh"));
        guard.leave().unwrap();
    }

    #[test]
    #[serial]
    fn test_nonzero_exit_is_installer_failure() {
        let temp = TempDir::new().unwrap();
        let station = StationFile::parse(STATION_TOML).unwrap();
        let host = FakeHost::new().with_installer_marker("opt/station-tools");
        host.fail_at(FailPoint::Installer);
        let mut ctx = image::extract(&host, &iso(&temp), &temp.path().join("work"), false).unwrap();

        let guard = ChrootGuard::enter(&host, &mut ctx).unwrap();
        let err = run(&guard, &package(temp.path()), &station.installer).unwrap_err();
        assert!(matches!(err, BuildError::InstallerFailure { .. }));
        assert!(err.to_string().contains("exit"));
        assert_eq!(err.exit_code(), 6);
        assert!(!guard.root().join(STAGING_DIR).exists());
    }

    #[test]
    #[serial]
    fn test_missing_marker_is_installer_failure() {
        let temp = TempDir::new().unwrap();
        let station = StationFile::parse(STATION_TOML).unwrap();
        let host = FakeHost::new();
        let mut ctx = image::extract(&host, &iso(&temp), &temp.path().join("work"), false).unwrap();

        let guard = ChrootGuard::enter(&host, &mut ctx).unwrap();
        let err = run(&guard, &package(temp.path()), &station.installer).unwrap_err();
        assert!(err.to_string().contains("opt/station-tools"));
    }
}
