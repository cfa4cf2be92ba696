//! Configuration management for stationiso.
//!
//! Reads path configuration from a .env file and environment variables.
//! Environment variables take precedence over the .env file. The station
//! itself (callsign, networks, preseed answers) lives in the typed station
//! file, see [`crate::station`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Default station file name, relative to the base directory.
pub const DEFAULT_STATION_FILE: &str = "station.toml";

/// stationiso configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Scratch space for the extracted ISO and squashfs tree
    pub work_dir: PathBuf,
    /// Where finished images and the build manifest land
    pub output_dir: PathBuf,
    /// Artifact cache and backup archives
    pub cache_dir: PathBuf,
    /// Typed station file
    pub station_file: PathBuf,
    /// Installer repository override (`owner/name`)
    pub installer_repo: Option<String>,
}

impl Config {
    /// Load configuration from `<base_dir>/.env` and the process environment.
    pub fn load(base_dir: &Path) -> Self {
        let mut env_vars = HashMap::new();

        let env_path = base_dir.join(".env");
        if env_path.exists() {
            match dotenvy::from_path_iter(&env_path) {
                Ok(iter) => {
                    for item in iter {
                        match item {
                            Ok((key, value)) => {
                                env_vars.insert(key, value);
                            }
                            Err(e) => warn!(path = %env_path.display(), "Skipping bad .env line: {}", e),
                        }
                    }
                }
                Err(e) => warn!(path = %env_path.display(), "Failed to read .env: {}", e),
            }
        }

        // Environment variables override .env file
        for (key, value) in std::env::vars() {
            env_vars.insert(key, value);
        }

        Self::from_vars(base_dir, &env_vars)
    }

    /// Build a configuration from an explicit variable map.
    pub fn from_vars(base_dir: &Path, vars: &HashMap<String, String>) -> Self {
        let path_var = |key: &str, default: PathBuf| {
            vars.get(key)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    let path = PathBuf::from(s);
                    if path.is_absolute() {
                        path
                    } else {
                        base_dir.join(path)
                    }
                })
                .unwrap_or(default)
        };

        let default_cache = dirs::cache_dir()
            .map(|dir| dir.join("stationiso"))
            .unwrap_or_else(|| base_dir.join(".cache"));

        Self {
            work_dir: path_var("STATIONISO_WORK_DIR", base_dir.join("work")),
            output_dir: path_var("STATIONISO_OUTPUT_DIR", base_dir.join("output")),
            cache_dir: path_var("STATIONISO_CACHE_DIR", default_cache),
            station_file: path_var("STATIONISO_STATION_FILE", base_dir.join(DEFAULT_STATION_FILE)),
            installer_repo: vars
                .get("STATIONISO_INSTALLER_REPO")
                .filter(|s| !s.is_empty())
                .cloned(),
        }
    }

    /// Build log path inside the work directory.
    pub fn log_file(&self) -> PathBuf {
        self.work_dir.join("build.log")
    }

    /// Backup archive directory inside the cache.
    pub fn backup_dir(&self) -> PathBuf {
        self.cache_dir.join("backups")
    }

    /// Build manifest path inside the output directory.
    pub fn manifest_file(&self) -> PathBuf {
        self.output_dir.join("build-manifest.json")
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  STATIONISO_WORK_DIR: {}", self.work_dir.display());
        println!("  STATIONISO_OUTPUT_DIR: {}", self.output_dir.display());
        println!("  STATIONISO_CACHE_DIR: {}", self.cache_dir.display());
        println!("  STATIONISO_STATION_FILE: {}", self.station_file.display());
        println!(
            "  STATIONISO_INSTALLER_REPO: {}",
            self.installer_repo.as_deref().unwrap_or("(from station file)")
        );
        if self.station_file.exists() {
            println!("  Station file: FOUND");
        } else {
            println!("  Station file: NOT FOUND (copy station.example.toml to get started)");
        }
    }
}
