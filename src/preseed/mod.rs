//! Unattended-install answers and the matching boot parameters.
//!
//! The preseed file and the boot-loader patch are generated together from
//! one [`PreseedProfile`] so the two can never disagree about locale,
//! keyboard or hostname. They are written to disjoint places in the ISO
//! root:
//!
//! ```text
//! iso/preseed/stationiso.seed        # answers
//! iso/boot/grub/grub.cfg             # linux ... <params> ---
//! iso/isolinux/txt.cfg               # append ... <params> ---
//! ```

pub mod bootloader;
pub mod partition;

pub use partition::{DiskLayout, PartitionInfo, PartitionStrategy, Resolution};

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::common::write_file_with_dirs;
use crate::error::{BuildError, Result};
use crate::station::StationFile;

/// Preseed location inside the ISO root.
pub const PRESEED_REL: &str = "preseed/stationiso.seed";
/// The same file as the installer sees it at boot.
pub const PRESEED_BOOT_PATH: &str = "/cdrom/preseed/stationiso.seed";

const BOOT_CONFIGS: &[(&str, BootLoader)] = &[
    ("boot/grub/grub.cfg", BootLoader::Grub),
    ("boot/grub/loopback.cfg", BootLoader::Grub),
    ("isolinux/txt.cfg", BootLoader::Isolinux),
];

const CRYPT_PREFIXES: &[&str] = &["$6$", "$5$", "$y$"];

/// Hostname derived from a station id: lowercase, `[a-z0-9-]`, at most 63
/// characters, no leading or trailing dash.
pub fn derive_hostname(station_id: &str) -> Result<String> {
    let mut host = String::with_capacity(station_id.len());
    for c in station_id.chars() {
        if c.is_ascii_alphanumeric() {
            host.push(c.to_ascii_lowercase());
        } else if !host.ends_with('-') {
            host.push('-');
        }
    }
    let host: String = host.trim_matches('-').chars().take(63).collect();
    let host = host.trim_end_matches('-').to_string();
    if host.is_empty() {
        return Err(BuildError::preseed(format!(
            "station id '{}' yields an empty hostname",
            station_id
        )));
    }
    Ok(host)
}

/// Everything the generator needs, checked once up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreseedProfile {
    pub strategy: PartitionStrategy,
    pub locale: String,
    pub keyboard: String,
    pub timezone: String,
    pub username: String,
    pub full_name: String,
    pub password_hash: String,
    pub hostname: String,
    pub target_disk: Option<String>,
    pub existing_partition: Option<String>,
    pub min_root_gb: u64,
    pub packages: Vec<String>,
    pub user_groups: Vec<String>,
}

impl PreseedProfile {
    pub fn from_station(station: &StationFile) -> Result<Self> {
        let p = &station.preseed;
        let fail = |msg: String| Err(BuildError::preseed(msg));

        for (field, value) in [
            ("locale", &p.locale),
            ("keyboard", &p.keyboard),
            ("timezone", &p.timezone),
            ("username", &p.username),
        ] {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return fail(format!("preseed.{} must be a single non-empty word", field));
            }
        }
        if !p.username.starts_with(|c: char| c.is_ascii_lowercase())
            || !p
                .username
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
            || p.username.len() > 32
        {
            return fail(format!(
                "preseed.username '{}' is not a valid login name",
                p.username
            ));
        }
        if !CRYPT_PREFIXES.iter().any(|prefix| p.password_hash.starts_with(prefix))
            || p.password_hash.chars().any(char::is_whitespace)
        {
            return fail(
                "preseed.password_hash must be a crypt hash ($6$, $5$ or $y$); plaintext is rejected"
                    .to_string(),
            );
        }
        let full_name = p.full_name.clone().unwrap_or_else(|| p.username.clone());
        if full_name.contains('\n') {
            return fail("preseed.full_name must be one line".to_string());
        }
        for pkg in &p.packages {
            if pkg.is_empty() || pkg.chars().any(char::is_whitespace) {
                return fail(format!("preseed.packages entry '{}' is not a package name", pkg));
            }
        }

        for (field, value) in [
            ("target_disk", &p.target_disk),
            ("existing_partition", &p.existing_partition),
        ] {
            if let Some(dev) = value {
                if !is_device_path(dev) {
                    return fail(format!("preseed.{} '{}' is not a /dev path", field, dev));
                }
            }
        }

        match p.partition {
            PartitionStrategy::ExistingPartition if p.existing_partition.is_none() => {
                return fail("existing-partition needs preseed.existing_partition".to_string())
            }
            PartitionStrategy::EntireDisk if p.target_disk.is_none() => {
                return fail("entire-disk needs an explicit preseed.target_disk".to_string())
            }
            PartitionStrategy::AutoDetect if p.target_disk.is_none() => {
                return fail("auto-detect needs preseed.target_disk to inspect".to_string())
            }
            _ => {}
        }

        Ok(Self {
            strategy: p.partition,
            locale: p.locale.clone(),
            keyboard: p.keyboard.clone(),
            timezone: p.timezone.clone(),
            username: p.username.clone(),
            full_name,
            password_hash: p.password_hash.clone(),
            hostname: station.hostname()?,
            target_disk: p.target_disk.clone(),
            existing_partition: p.existing_partition.clone(),
            min_root_gb: p.min_root_gb,
            packages: p.packages.clone(),
            user_groups: p.user_groups.clone(),
        })
    }

    /// Kernel parameters that must match the preseed.
    pub fn boot_params(&self) -> String {
        format!(
            "auto=true priority=critical preseed/file={} debian-installer/locale={} \
             keyboard-configuration/layoutcode={} netcfg/get_hostname={}",
            PRESEED_BOOT_PATH, self.locale, self.keyboard, self.hostname
        )
    }
}

/// Generated preseed plus the boot parameter patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreseedOutput {
    pub preseed: String,
    pub boot_params: String,
    /// Strategy actually written (auto-detect resolved).
    pub resolved: PartitionStrategy,
}

/// Render the preseed. `layout` is required for auto-detect.
pub fn generate(profile: &PreseedProfile, layout: Option<&DiskLayout>) -> Result<PreseedOutput> {
    let (resolution, disk) = match profile.strategy {
        PartitionStrategy::AutoDetect => {
            let layout = layout.ok_or_else(|| {
                BuildError::preseed("auto-detect needs the target disk layout".to_string())
            })?;
            (resolve_with(layout, profile.min_root_gb)?, Some(layout.disk.clone()))
        }
        PartitionStrategy::ExistingPartition => (
            Resolution::Existing {
                partition: profile.existing_partition.clone().unwrap_or_default(),
            },
            profile.target_disk.clone(),
        ),
        PartitionStrategy::FreeSpace => (Resolution::FreeSpace, profile.target_disk.clone()),
        PartitionStrategy::EntireDisk => (Resolution::EmptyDisk, profile.target_disk.clone()),
    };

    let mut s = String::new();
    let mut d = |question: &str, kind: &str, value: &str| {
        let _ = writeln!(s, "d-i {} {} {}", question, kind, value);
    };
    d("debian-installer/locale", "string", &profile.locale);
    d("keyboard-configuration/xkb-keymap", "select", &profile.keyboard);
    d("keyboard-configuration/layoutcode", "string", &profile.keyboard);
    d("console-setup/ask_detect", "boolean", "false");
    d("netcfg/choose_interface", "select", "auto");
    d("netcfg/get_hostname", "string", &profile.hostname);
    d("netcfg/hostname", "string", &profile.hostname);
    d("netcfg/get_domain", "string", "local");
    d("clock-setup/utc", "boolean", "true");
    d("time/zone", "string", &profile.timezone);
    d("passwd/root-login", "boolean", "false");
    d("passwd/user-fullname", "string", &profile.full_name);
    d("passwd/username", "string", &profile.username);
    d("passwd/user-password-crypted", "password", &profile.password_hash);
    d("passwd/user-default-groups", "string", &profile.user_groups.join(" "));
    d("user-setup/encrypt-home", "boolean", "false");

    match &resolution {
        Resolution::Existing { partition } => {
            // Only the named partition is formatted; the rest of the disk is
            // left alone, so no whole-disk method or disk is answered.
            d(
                "partman/early_command",
                "string",
                &format!(
                    "test -b {0} || exit 1; debconf-set stationiso/target-partition {0}",
                    partition
                ),
            );
            let min_mb = profile.min_root_gb.saturating_mul(1024).max(1);
            d(
                "partman-auto/expert_recipe",
                "string",
                &format!(
                    "stationiso-reuse :: {0} {0} -1 ext4 $reusemethod{{ }} method{{ format }} \
                     format{{ }} use_filesystem{{ }} filesystem{{ ext4 }} mountpoint{{ / }} .",
                    min_mb
                ),
            );
            d("partman-auto/choose_recipe", "select", "stationiso-reuse");
            d("partman-basicfilesystems/no_swap", "boolean", "false");
            d("grub-installer/only_debian", "boolean", "false");
            d("grub-installer/with_other_os", "boolean", "true");
        }
        Resolution::FreeSpace => {
            if let Some(disk) = &disk {
                d("partman-auto/disk", "string", disk);
            }
            d("partman-auto/method", "string", "regular");
            d("partman-auto/init_automatically_partition", "select", "biggest_free");
            d("partman-auto/choose_recipe", "select", "atomic");
            d("grub-installer/only_debian", "boolean", "false");
            d("grub-installer/with_other_os", "boolean", "true");
        }
        Resolution::EmptyDisk => {
            if let Some(disk) = &disk {
                d("partman-auto/disk", "string", disk);
            }
            d("partman-auto/method", "string", "regular");
            d("partman-auto/choose_recipe", "select", "atomic");
            d("partman-partitioning/confirm_write_new_label", "boolean", "true");
            d("grub-installer/only_debian", "boolean", "true");
        }
    }
    d("partman/choose_partition", "select", "finish");
    d("partman/confirm", "boolean", "true");
    d("partman/confirm_nooverwrite", "boolean", "true");

    if !profile.packages.is_empty() {
        d("pkgsel/include", "string", &profile.packages.join(" "));
    }
    d("pkgsel/upgrade", "select", "none");
    d("pkgsel/update-policy", "select", "none");
    d("finish-install/reboot_in_progress", "note", "");

    let _ = writeln!(s, "stationiso stationiso/partition-strategy string {}", profile.strategy);
    let _ = writeln!(s, "stationiso stationiso/partition-resolved string {}", resolution.strategy());
    if let Resolution::Existing { partition } = &resolution {
        let _ = writeln!(s, "stationiso stationiso/target-partition string {}", partition);
    }

    let mut preseed = format!("# stationiso preseed for {}\n", profile.hostname);
    preseed.push_str(&s);

    Ok(PreseedOutput {
        preseed,
        boot_params: profile.boot_params(),
        resolved: resolution.strategy(),
    })
}

/// `/dev/...` made of characters that are safe inside an installer shell command.
fn is_device_path(dev: &str) -> bool {
    dev.len() > "/dev/".len()
        && dev.starts_with("/dev/")
        && dev
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | ':'))
}

fn resolve_with(layout: &DiskLayout, min_root_gb: u64) -> Result<Resolution> {
    let resolution = layout.resolve(min_root_gb)?;
    info!(disk = %layout.disk, resolved = %resolution.strategy(), "Auto-detected partition strategy");
    Ok(resolution)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootLoader {
    Grub,
    Isolinux,
}

/// Where generated output goes inside one ISO root.
#[derive(Debug, Clone)]
pub struct PreseedTargets {
    pub preseed_file: PathBuf,
    boot_configs: Vec<(PathBuf, BootLoader)>,
}

impl PreseedTargets {
    pub fn for_iso_root(iso_root: &Path) -> Self {
        Self {
            preseed_file: iso_root.join(PRESEED_REL),
            boot_configs: BOOT_CONFIGS
                .iter()
                .map(|(rel, kind)| (iso_root.join(rel), *kind))
                .collect(),
        }
    }

    pub fn boot_configs(&self) -> impl Iterator<Item = &Path> {
        self.boot_configs.iter().map(|(p, _)| p.as_path())
    }
}

/// Write the preseed and patch every boot config present. Returns the
/// patched config paths; having none to patch is an error.
pub fn write(output: &PreseedOutput, targets: &PreseedTargets) -> Result<Vec<PathBuf>> {
    write_file_with_dirs(&targets.preseed_file, &output.preseed)
        .map_err(|e| BuildError::preseed(format!("{:#}", e)))?;

    let mut patched = Vec::new();
    for (path, kind) in &targets.boot_configs {
        if !path.is_file() {
            continue;
        }
        let content = fs::read_to_string(path)?;
        let (text, lines) = match kind {
            BootLoader::Grub => bootloader::patch_grub(&content, &output.boot_params),
            BootLoader::Isolinux => bootloader::patch_isolinux(&content, &output.boot_params),
        };
        if lines == 0 {
            continue;
        }
        fs::write(path, text)?;
        patched.push(path.clone());
    }

    if patched.is_empty() {
        return Err(BuildError::preseed(
            "no boot loader config with a kernel line found to patch".to_string(),
        ));
    }
    Ok(patched)
}

/// Read a preseed back into question → value pairs.
///
/// Lines ending in `\` continue on the next line. Comments and blank lines
/// are skipped.
pub fn parse_preseed(content: &str) -> BTreeMap<String, String> {
    let mut answers = BTreeMap::new();
    let mut pending = String::new();

    for line in content.lines() {
        if let Some(head) = line.strip_suffix('\\') {
            pending.push_str(head);
            continue;
        }
        pending.push_str(line);
        let full = std::mem::take(&mut pending);
        let full = full.trim();
        if full.is_empty() || full.starts_with('#') {
            continue;
        }

        // owner, question, type, then the value runs to end of line
        let mut rest = full;
        let mut fields = [""; 3];
        for field in &mut fields {
            rest = rest.trim_start();
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            *field = &rest[..end];
            rest = &rest[end..];
        }
        if !fields[1].is_empty() {
            answers.insert(fields[1].to_string(), rest.trim().to_string());
        }
    }
    answers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::{FAKE_GRUB_CFG, FAKE_TXT_CFG};
    use crate::station::fixtures::STATION_TOML;
    use tempfile::TempDir;

    fn profile() -> PreseedProfile {
        PreseedProfile::from_station(&StationFile::parse(STATION_TOML).unwrap()).unwrap()
    }

    #[test]
    fn test_derive_hostname() {
        assert_eq!(derive_hostname("KT7RUN").unwrap(), "kt7run");
        assert_eq!(derive_hostname("  Field Day / 2026 ").unwrap(), "field-day-2026");
        assert_eq!(derive_hostname(&"A".repeat(80)).unwrap().len(), 63);
        assert!(derive_hostname("--//--").is_err());
    }

    #[test]
    fn test_round_trip_locale_hostname_strategy() {
        let out = generate(&profile(), None).unwrap();
        let answers = parse_preseed(&out.preseed);

        assert_eq!(answers["debian-installer/locale"], "en_US.UTF-8");
        assert_eq!(answers["netcfg/get_hostname"], "kt7run");
        assert_eq!(answers["time/zone"], "America/Denver");
        assert_eq!(answers["stationiso/partition-strategy"], "free-space");
        assert_eq!(answers["stationiso/partition-resolved"], "free-space");
        assert_eq!(answers["partman-auto/init_automatically_partition"], "biggest_free");
        assert_eq!(answers["partman/confirm_nooverwrite"], "true");
        assert_eq!(
            answers["passwd/user-password-crypted"],
            "$6$rounds=4096$saltsalt$Q4V5o1H7kQm3lKk1o0VZQ5m6m0m0"
        );
    }

    #[test]
    fn test_boot_params_agree_with_preseed() {
        let out = generate(&profile(), None).unwrap();
        let answers = parse_preseed(&out.preseed);
        for param in out.boot_params.split_whitespace() {
            if let Some((key, value)) = param.split_once('=') {
                if let Some(answer) = answers.get(key) {
                    assert_eq!(answer, value, "{} disagrees", key);
                }
            }
        }
        assert!(out.boot_params.contains("preseed/file=/cdrom/preseed/stationiso.seed"));
    }

    #[test]
    fn test_auto_detect_resolves_against_layout() {
        let mut p = profile();
        p.strategy = PartitionStrategy::AutoDetect;
        assert!(generate(&p, None).is_err());

        let layout = DiskLayout {
            disk: "/dev/sda".into(),
            size_bytes: 500 * 1024 * 1024 * 1024,
            partitions: Vec::new(),
        };
        let out = generate(&p, Some(&layout)).unwrap();
        let answers = parse_preseed(&out.preseed);
        assert_eq!(out.resolved, PartitionStrategy::EntireDisk);
        assert_eq!(answers["stationiso/partition-strategy"], "auto-detect");
        assert_eq!(answers["stationiso/partition-resolved"], "entire-disk");
        assert_eq!(answers["partman-auto/disk"], "/dev/sda");
    }

    #[test]
    fn test_every_strategy_confirms_without_prompting() {
        let mut p = profile();
        for strategy in [PartitionStrategy::FreeSpace, PartitionStrategy::EntireDisk] {
            p.strategy = strategy;
            p.target_disk = Some("/dev/sda".into());
            let answers = parse_preseed(&generate(&p, None).unwrap().preseed);
            assert_eq!(answers["partman/confirm_nooverwrite"], "true", "{}", strategy);
            assert_eq!(answers["partman/confirm"], "true", "{}", strategy);
        }
    }

    #[test]
    fn test_existing_partition_touches_only_that_partition() {
        let mut p = profile();
        p.strategy = PartitionStrategy::ExistingPartition;
        p.existing_partition = Some("/dev/sda3".into());
        p.target_disk = Some("/dev/sda".into());

        let out = generate(&p, None).unwrap();
        let answers = parse_preseed(&out.preseed);
        assert!(out
            .preseed
            .lines()
            .any(|l| l.starts_with("d-i ") && l.contains("/dev/sda3")));
        assert!(answers["partman/early_command"].contains("test -b /dev/sda3"));
        assert!(answers["partman-auto/expert_recipe"].contains("$reusemethod{ }"));
        assert_eq!(answers["partman-auto/choose_recipe"], "stationiso-reuse");
        assert!(!answers.contains_key("partman-auto/method"));
        assert!(!answers.contains_key("partman-auto/disk"));
        assert!(!answers.contains_key("partman-auto/init_automatically_partition"));
        assert_eq!(answers["partman/confirm_nooverwrite"], "true");
    }

    #[test]
    fn test_device_paths_must_be_plain_dev_paths() {
        let mut station = StationFile::parse(STATION_TOML).unwrap();
        station.preseed.partition = PartitionStrategy::ExistingPartition;
        station.preseed.existing_partition = Some("/dev/sda3; rm -rf /".into());
        assert!(matches!(
            PreseedProfile::from_station(&station),
            Err(BuildError::Preseed { .. })
        ));
        station.preseed.existing_partition = Some("/dev/sda3".into());
        assert!(PreseedProfile::from_station(&station).is_ok());
    }

    #[test]
    fn test_strategy_requirements() {
        let mut station = StationFile::parse(STATION_TOML).unwrap();
        station.preseed.partition = PartitionStrategy::EntireDisk;
        assert!(PreseedProfile::from_station(&station).is_err());
        station.preseed.target_disk = Some("/dev/sda".into());
        assert!(PreseedProfile::from_station(&station).is_ok());

        station.preseed.partition = PartitionStrategy::ExistingPartition;
        assert!(PreseedProfile::from_station(&station).is_err());
    }

    #[test]
    fn test_plaintext_and_bad_usernames_rejected() {
        let mut station = StationFile::parse(STATION_TOML).unwrap();
        station.preseed.password_hash = "hunter2".into();
        assert!(matches!(
            PreseedProfile::from_station(&station),
            Err(BuildError::Preseed { .. })
        ));

        let mut station = StationFile::parse(STATION_TOML).unwrap();
        station.preseed.username = "Root User".into();
        assert!(PreseedProfile::from_station(&station).is_err());
    }

    #[test]
    fn test_write_patches_both_loaders_idempotently() {
        let temp = TempDir::new().unwrap();
        let iso = temp.path();
        write_file_with_dirs(iso.join("boot/grub/grub.cfg"), FAKE_GRUB_CFG).unwrap();
        write_file_with_dirs(iso.join("isolinux/txt.cfg"), FAKE_TXT_CFG).unwrap();

        let out = generate(&profile(), None).unwrap();
        let targets = PreseedTargets::for_iso_root(iso);
        let patched = write(&out, &targets).unwrap();
        assert_eq!(patched.len(), 2);
        let grub_once = fs::read_to_string(iso.join("boot/grub/grub.cfg")).unwrap();

        write(&out, &targets).unwrap();
        assert_eq!(fs::read_to_string(iso.join("boot/grub/grub.cfg")).unwrap(), grub_once);
        assert!(grub_once.contains("netcfg/get_hostname=kt7run ---"));
        assert_eq!(fs::read_to_string(&targets.preseed_file).unwrap(), out.preseed);
    }

    #[test]
    fn test_write_without_boot_configs_fails() {
        let temp = TempDir::new().unwrap();
        let out = generate(&profile(), None).unwrap();
        let err = write(&out, &PreseedTargets::for_iso_root(temp.path())).unwrap_err();
        assert!(matches!(err, BuildError::Preseed { .. }));
    }

    #[test]
    fn test_parse_preseed_handles_continuations() {
        let text = "# comment\nd-i pkgsel/include string js8call \\\n  flrig\n\nd-i passwd/root-login boolean false\n";
        let answers = parse_preseed(text);
        assert_eq!(answers["pkgsel/include"], "js8call   flrig");
        assert_eq!(answers["passwd/root-login"], "false");
    }
}
