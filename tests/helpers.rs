//! Shared test utilities for stationiso integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use stationiso::build::{BuildContext, BuildOptions};
use stationiso::cache::{Artifact, ArtifactDescriptor, FetchState};
use stationiso::config::Config;
use stationiso::host::fake::FakeHost;
use stationiso::interrupt::Interrupt;
use stationiso::pipeline::BuildInputs;
use stationiso::release::Release;
use stationiso::station::StationFile;

/// Installer marker the fake installer leaves behind.
pub const MARKER: &str = "opt/station-tools";

/// Station file used by every pipeline test. Extra TOML is appended.
pub const STATION: &str = r#"
[station]
id = "KT7RUN"
description = "Portable ops box"

[image]
url = "https://releases.example.org/base-22.04.5-desktop-amd64.iso"
tag = "22.04.5"

[installer]
repo = "example/station-tools"
marker = "opt/station-tools"

[[network]]
id = "home"
ssid = "Home Net"
psk = "correct horse battery"
"#;

const PRESEED_FREE_SPACE: &str = r#"
[preseed]
locale = "en_US.UTF-8"
keyboard = "us"
timezone = "America/Denver"
username = "operator"
full_name = "Station Operator"
password_hash = "$6$rounds=4096$saltsalt$Q4V5o1H7kQm3lKk1o0VZQ5m6m0m0"
partition = "free-space"
target_disk = "/dev/sda"
"#;

/// Temporary project directory with a station file and config.
pub struct TestEnv {
    /// Kept alive for the lifetime of the environment
    pub _temp_dir: TempDir,
    pub base_dir: PathBuf,
    pub config: Config,
}

impl TestEnv {
    /// Free-space preseed, no backups, no script units.
    pub fn new() -> Self {
        Self::with_station(&format!("{}{}", STATION, PRESEED_FREE_SPACE))
    }

    pub fn with_station(content: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base_dir = temp_dir.path().to_path_buf();

        let mut vars = HashMap::new();
        vars.insert(
            "STATIONISO_CACHE_DIR".to_string(),
            base_dir.join("cache").display().to_string(),
        );
        let config = Config::from_vars(&base_dir, &vars);
        fs::write(&config.station_file, content).expect("Failed to write station file");

        Self {
            _temp_dir: temp_dir,
            base_dir,
            config,
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.base_dir.join(rel)
    }

    pub fn station(&self) -> StationFile {
        StationFile::load(&self.config.station_file).expect("station file should be valid")
    }

    pub fn context(&self) -> BuildContext {
        self.context_with(BuildOptions::default(), Interrupt::new())
    }

    pub fn context_with(
        &self,
        options: BuildOptions,
        interrupt: std::sync::Arc<Interrupt>,
    ) -> BuildContext {
        BuildContext::new(self.config.clone(), self.station(), options, interrupt)
            .expect("Failed to create build context")
    }

    /// Cached artifacts for a build that never touches the network.
    pub fn inputs(&self) -> BuildInputs {
        let dir = self.path("cache/artifacts");
        fs::create_dir_all(&dir).unwrap();

        let iso = dir.join("base-22.04.5-desktop-amd64.iso");
        fs::write(&iso, "stock iso").unwrap();
        let tarball = dir.join("station-tools-v2.0.3.tar.gz");
        fs::write(&tarball, "tarball").unwrap();

        BuildInputs {
            base_image: artifact("base-image", "22.04.5", iso),
            installer: artifact("installer", "v2.0.3", tarball),
            release: Release {
                tag_name: "v2.0.3".to_string(),
                name: Some("2.0.3".to_string()),
                prerelease: false,
                draft: false,
                tarball_url: "https://api.github.com/repos/example/station-tools/tarball/v2.0.3"
                    .to_string(),
                published_at: Some("2026-09-01T12:00:00Z".to_string()),
            },
        }
    }

    /// Host script that the pipeline runs as a unit.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path(&format!("scripts/{}", name));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// The extracted system tree.
    pub fn tree(&self) -> PathBuf {
        self.config.work_dir.join("squashfs-root")
    }

    /// The extracted ISO contents.
    pub fn iso_root(&self) -> PathBuf {
        self.config.work_dir.join("iso")
    }
}

pub fn host() -> FakeHost {
    FakeHost::new().with_installer_marker(MARKER)
}

pub fn preseed_free_space() -> &'static str {
    PRESEED_FREE_SPACE
}

fn artifact(name: &str, tag: &str, path: PathBuf) -> Artifact {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Artifact {
        descriptor: ArtifactDescriptor {
            name: name.to_string(),
            url: format!("https://releases.example.org/{}", file_name),
            tag: tag.to_string(),
            file_name,
            sha256: None,
        },
        path,
        sha256: "0".repeat(64),
        state: FetchState::Cached,
    }
}

/// Assert a file exists and contains `needle`.
pub fn assert_file_contains(path: &Path, needle: &str) {
    let content = fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
    assert!(
        content.contains(needle),
        "{} should contain '{}', got:\n{}",
        path.display(),
        needle,
        content
    );
}
