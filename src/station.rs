//! Typed station file (`station.toml`).
//!
//! Everything that makes one image different from another lives here: the
//! station id, the base image and installer to start from, preseed answers,
//! networks, backup paths and operator script units. The file is validated
//! as a whole at load time so a bad value fails before any download starts.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::component::{Phase, Policy};
use crate::error::{BuildError, Result};
use crate::preseed::{derive_hostname, PartitionStrategy};

/// Parsed and validated station file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StationFile {
    pub station: StationSection,
    pub image: ImageSection,
    pub installer: InstallerSection,
    pub preseed: PreseedSection,
    #[serde(default)]
    pub desktop: DesktopSection,
    #[serde(default, rename = "network")]
    pub networks: Vec<NetworkEntry>,
    #[serde(default)]
    pub backup: BackupSection,
    #[serde(default)]
    pub customize: CustomizeSection,
    #[serde(default, rename = "unit")]
    pub units: Vec<ScriptUnitEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StationSection {
    /// Station identifier (callsign); drives hostname and ISO naming.
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    /// Download URL of the stock installer ISO.
    pub url: String,
    /// Version label of the base image (cache key).
    pub tag: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default = "default_volume_label")]
    pub volume_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallerSection {
    /// GitHub repository (`owner/name`) publishing installer releases.
    pub repo: String,
    /// Entry script inside the release tarball.
    #[serde(default = "default_installer_script")]
    pub script: String,
    /// Directory (relative to the tree root) a successful install leaves behind.
    pub marker: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreseedSection {
    pub locale: String,
    pub keyboard: String,
    pub timezone: String,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    /// crypt(3) hash; plaintext passwords are rejected.
    pub password_hash: String,
    #[serde(default = "default_partition")]
    pub partition: PartitionStrategy,
    #[serde(default)]
    pub target_disk: Option<String>,
    #[serde(default)]
    pub existing_partition: Option<String>,
    /// Saved `lsblk -J -b` output of the target machine, used by auto-detect.
    #[serde(default)]
    pub layout_file: Option<PathBuf>,
    #[serde(default = "default_min_root_gb")]
    pub min_root_gb: u64,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default = "default_user_groups")]
    pub user_groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesktopSection {
    #[serde(default = "default_gtk_theme")]
    pub gtk_theme: String,
    #[serde(default = "default_icon_theme")]
    pub icon_theme: String,
    #[serde(default = "default_true")]
    pub dark_mode: bool,
    #[serde(default)]
    pub wallpaper: Option<PathBuf>,
}

impl Default for DesktopSection {
    fn default() -> Self {
        Self {
            gtk_theme: default_gtk_theme(),
            icon_theme: default_icon_theme(),
            dark_mode: true,
            wallpaper: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Security {
    None,
    WpaPsk,
    Sae,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Addressing {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkEntry {
    /// Profile id; becomes the keyfile name.
    pub id: String,
    pub ssid: String,
    #[serde(default = "default_security")]
    pub security: Security,
    #[serde(default)]
    pub psk: Option<String>,
    #[serde(default = "default_addressing")]
    pub addressing: Addressing,
    /// CIDR address for manual addressing, e.g. `10.0.0.5/24`.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default = "default_true")]
    pub autoconnect: bool,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupSection {
    /// Home directory of the previous deployment; rolling capture reads it.
    #[serde(default)]
    pub previous_state: Option<PathBuf>,
    /// Relative paths (under the home directory) that make up user state.
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default = "default_keep_rolling")]
    pub keep_rolling: usize,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            previous_state: None,
            paths: Vec::new(),
            keep_rolling: default_keep_rolling(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomizeSection {
    /// Files copied verbatim over the tree before anything else.
    #[serde(default)]
    pub overlay: Option<PathBuf>,
    /// Per-application templates rendered into `etc/skel`.
    #[serde(default)]
    pub templates: Option<PathBuf>,
    /// Offline documentation embedded under `usr/share/doc/stationiso`.
    #[serde(default)]
    pub docs: Option<PathBuf>,
    /// License texts copied under `usr/share/doc/stationiso/licenses`.
    #[serde(default)]
    pub licenses: Option<PathBuf>,
}

/// Operator-supplied script unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptUnitEntry {
    pub name: String,
    pub script: PathBuf,
    pub phase: Phase,
    #[serde(default = "default_policy")]
    pub policy: Policy,
    pub writes: Vec<String>,
    #[serde(default)]
    pub supersedes: Vec<String>,
    /// Run inside the chroot instead of on the host.
    #[serde(default)]
    pub chroot: bool,
    /// Skipped in minimal builds.
    #[serde(default)]
    pub embedding: bool,
}

fn default_volume_label() -> String {
    "STATIONISO".to_string()
}
fn default_installer_script() -> String {
    "install.sh".to_string()
}
fn default_partition() -> PartitionStrategy {
    PartitionStrategy::AutoDetect
}
fn default_min_root_gb() -> u64 {
    40
}
fn default_user_groups() -> Vec<String> {
    ["adm", "audio", "dialout", "plugdev", "sudo"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_gtk_theme() -> String {
    "Yaru-dark".to_string()
}
fn default_icon_theme() -> String {
    "Yaru".to_string()
}
fn default_true() -> bool {
    true
}
fn default_security() -> Security {
    Security::WpaPsk
}
fn default_addressing() -> Addressing {
    Addressing::Auto
}
fn default_keep_rolling() -> usize {
    3
}
fn default_policy() -> Policy {
    Policy::Core
}

/// Names the built-in units use; script units may not reuse them.
pub const RESERVED_UNIT_NAMES: &[&str] = &[
    "base-overlay",
    "identity",
    "networking",
    "user-account",
    "desktop-baseline",
    "packaging",
    "golden-master-restore",
    "rolling-restore",
    "app-config",
    "documentation",
    "license-import",
];

impl StationFile {
    /// Load, resolve relative paths against the file's directory, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BuildError::config(format!("Cannot read station file {}: {}", path.display(), e))
        })?;
        let mut station = Self::parse(&content)
            .map_err(|e| BuildError::config(format!("{}: {}", path.display(), e)))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        station.resolve_paths(base);
        station.validate()?;
        Ok(station)
    }

    /// Parse TOML without validating or resolving paths.
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Make every relative file reference absolute against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        for path in [
            &mut self.customize.overlay,
            &mut self.customize.templates,
            &mut self.customize.docs,
            &mut self.customize.licenses,
            &mut self.desktop.wallpaper,
            &mut self.backup.previous_state,
            &mut self.preseed.layout_file,
        ]
        .into_iter()
        .flatten()
        {
            resolve(path);
        }
        for unit in &mut self.units {
            resolve(&mut unit.script);
        }
    }

    /// Hostname the image and the preseed use.
    pub fn hostname(&self) -> Result<String> {
        derive_hostname(&self.station.id)
    }

    /// Reject values that would only fail halfway through a build.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(BuildError::config(msg));

        if self.station.id.trim().is_empty() {
            return fail("station.id must not be empty".to_string());
        }
        self.hostname()
            .map_err(|e| BuildError::config(format!("station.id: {}", e)))?;

        if !self.installer.repo.contains('/') || self.installer.repo.split('/').count() != 2 {
            return fail(format!(
                "installer.repo '{}' must be 'owner/name'",
                self.installer.repo
            ));
        }
        if !is_simple_name(&self.installer.script) {
            return fail(format!(
                "installer.script '{}' must be a plain file name",
                self.installer.script
            ));
        }
        check_relative("installer.marker", &self.installer.marker)?;

        for (field, sum) in [
            ("image.sha256", &self.image.sha256),
            ("installer.sha256", &self.installer.sha256),
        ] {
            if let Some(sum) = sum {
                if sum.len() != 64 || !sum.chars().all(|c| c.is_ascii_hexdigit()) {
                    return fail(format!("{} must be 64 hex characters", field));
                }
            }
        }

        self.validate_networks()?;

        for path in &self.backup.paths {
            check_relative("backup.paths", path)?;
        }
        if self.backup.keep_rolling == 0 {
            return fail("backup.keep_rolling must be at least 1".to_string());
        }

        let mut names = HashSet::new();
        for unit in &self.units {
            if !is_simple_name(&unit.name) {
                return fail(format!("unit name '{}' must be a plain identifier", unit.name));
            }
            if RESERVED_UNIT_NAMES.contains(&unit.name.as_str()) {
                return fail(format!("unit name '{}' is reserved for a built-in unit", unit.name));
            }
            if !names.insert(unit.name.as_str()) {
                return fail(format!("duplicate unit name '{}'", unit.name));
            }
            if unit.writes.is_empty() {
                return fail(format!("unit '{}' must declare the paths it writes", unit.name));
            }
            for path in &unit.writes {
                check_relative(&format!("unit '{}' writes", unit.name), path)?;
            }
        }

        // Preseed answers are checked by the generator itself.
        crate::preseed::PreseedProfile::from_station(self)
            .map_err(|e| BuildError::config(e.to_string()))?;

        Ok(())
    }

    fn validate_networks(&self) -> Result<()> {
        let fail = |msg: String| Err(BuildError::config(msg));
        let mut ids = HashSet::new();

        for net in &self.networks {
            if !is_simple_name(&net.id) {
                return fail(format!("network id '{}' must be a plain identifier", net.id));
            }
            if !ids.insert(net.id.as_str()) {
                return fail(format!("duplicate network id '{}'", net.id));
            }
            if net.ssid.is_empty() || net.ssid.len() > 32 {
                return fail(format!("network '{}': ssid must be 1-32 bytes", net.id));
            }
            match (net.security, &net.psk) {
                (Security::None, Some(_)) => {
                    return fail(format!("network '{}': open network must not set psk", net.id))
                }
                (Security::None, None) => {}
                (_, None) => return fail(format!("network '{}': psk is required", net.id)),
                (_, Some(psk)) => {
                    let hex_key = psk.len() == 64 && psk.chars().all(|c| c.is_ascii_hexdigit());
                    if !hex_key && !(8..=63).contains(&psk.len()) {
                        return fail(format!(
                            "network '{}': psk must be 8-63 characters or 64 hex digits",
                            net.id
                        ));
                    }
                }
            }
            if net.addressing == Addressing::Manual && net.address.is_none() {
                return fail(format!(
                    "network '{}': manual addressing needs an address",
                    net.id
                ));
            }
            if let Some(address) = &net.address {
                if !address.contains('/') {
                    return fail(format!(
                        "network '{}': address '{}' must be in CIDR form",
                        net.id, address
                    ));
                }
            }
        }
        Ok(())
    }
}

fn is_simple_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.')
}

fn check_relative(field: &str, path: &str) -> Result<()> {
    let p = Path::new(path);
    if path.is_empty()
        || p.is_absolute()
        || p.components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(BuildError::config(format!(
            "{}: '{}' must be a relative path inside the tree",
            field, path
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// A complete, valid station file used across unit tests.
    pub const STATION_TOML: &str = r#"
[station]
id = "KT7RUN"

[image]
url = "https://releases.example.org/base-22.04.5-desktop-amd64.iso"
tag = "22.04.5"

[installer]
repo = "example/station-tools"
marker = "opt/station-tools"

[preseed]
locale = "en_US.UTF-8"
keyboard = "us"
timezone = "America/Denver"
username = "operator"
password_hash = "$6$rounds=4096$saltsalt$Q4V5o1H7kQm3lKk1o0VZQ5m6m0m0"
partition = "free-space"

[[network]]
id = "home"
ssid = "Home Net"
psk = "correct horse battery"

[[network]]
id = "field"
ssid = "Field;Ops=1"
psk = "p@ss#word;with=odd\\chars"

[backup]
paths = [".config/js8call", ".local/share/WSJT-X"]
"#;
}
