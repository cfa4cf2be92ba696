//! Repacking the customized tree into a bootable image.
//!
//! ```text
//! work/squashfs-root ──mksquashfs──▶ iso/casper/filesystem.squashfs
//!                                    iso/casper/filesystem.size
//!                                    iso/.disk/info, iso/stationiso/build-info.txt
//!                                    iso/md5sum.txt
//! iso/ ──xorriso (boot records replayed)──▶ output/<name>.iso + .sha256
//! ```
//!
//! Nothing here has a timeout; mksquashfs over a full desktop tree takes as
//! long as it takes.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::cache::sha256_file;
use crate::common::files::tree_size;
use crate::common::write_file_with_dirs;
use crate::error::{BuildError, Result, StageResultExt};
use crate::host::{Host, IsoRequest};
use crate::image::{ImageContext, MountState};
use crate::timing::utc_rfc3339;

/// Build metadata location inside the ISO root.
pub const BUILD_INFO_REL: &str = "stationiso/build-info.txt";

/// Versions stamped into the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub station_id: String,
    pub hostname: String,
    pub base_tag: String,
    pub installer_tag: String,
    pub tool_version: String,
    pub built_at: String,
}

impl VersionInfo {
    pub fn new(station_id: &str, hostname: &str, base_tag: &str, installer_tag: &str) -> Self {
        Self {
            station_id: station_id.to_string(),
            hostname: hostname.to_string(),
            base_tag: base_tag.to_string(),
            installer_tag: installer_tag.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            built_at: utc_rfc3339(),
        }
    }

    /// One-line description for `.disk/info`.
    pub fn disk_info(&self) -> String {
        format!(
            "stationiso {} (base {}, installer {}) {}\n",
            self.station_id, self.base_tag, self.installer_tag, self.built_at
        )
    }

    pub fn build_info(&self) -> String {
        format!(
            "station_id={}\nhostname={}\nbase_image={}\ninstaller={}\nstationiso={}\nbuilt_at={}\n",
            self.station_id,
            self.hostname,
            self.base_tag,
            self.installer_tag,
            self.tool_version,
            self.built_at
        )
    }

    /// `stationiso-<hostname>-<base tag>.iso`
    pub fn iso_file_name(&self) -> String {
        let tag: String = self
            .base_tag
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
            .collect();
        format!("stationiso-{}-{}.iso", self.hostname, tag)
    }
}

/// Finished image and its checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedImage {
    pub iso: PathBuf,
    pub sha256: String,
}

pub struct ImageRepacker<'a> {
    host: &'a dyn Host,
    output_dir: PathBuf,
    volume_label: String,
}

impl<'a> ImageRepacker<'a> {
    pub fn new(host: &'a dyn Host, output_dir: impl Into<PathBuf>, volume_label: &str) -> Self {
        Self {
            host,
            output_dir: output_dir.into(),
            volume_label: volume_label.to_string(),
        }
    }

    /// Repack `ctx` into a new ISO. The context must be fully unmounted.
    pub fn pack(&self, ctx: &ImageContext, version: &VersionInfo) -> Result<PackedImage> {
        if ctx.state() != MountState::Unmounted {
            return Err(BuildError::repack(format!(
                "image must be unmounted before repacking (state: {})",
                ctx.state()
            )));
        }
        let residual = self
            .host
            .mounts_under(ctx.work_dir())
            .or_stage(BuildError::mount)?;
        if !residual.is_empty() {
            return Err(BuildError::mount(format!(
                "{} mount(s) still active under {}",
                residual.len(),
                ctx.work_dir().display()
            )));
        }
        let squashfs = ctx
            .squashfs()
            .ok_or_else(|| BuildError::repack("no system image location recorded".to_string()))?;

        self.write_squashfs(ctx.root(), squashfs)?;
        stamp_version(ctx.iso_root(), version)?;

        println!("Regenerating md5sum.txt...");
        self.host
            .write_md5sums(ctx.iso_root())
            .or_stage(BuildError::repack)?;

        let iso = self.output_dir.join(version.iso_file_name());
        println!("Building {}...", iso.display());
        self.host
            .mkiso(&IsoRequest {
                source_iso: ctx.source_iso().to_path_buf(),
                iso_root: ctx.iso_root().to_path_buf(),
                output: iso.clone(),
                volume_label: self.volume_label.clone(),
            })
            .or_stage(BuildError::repack)?;

        let sha256 = write_checksum(&iso)?;
        let size = fs::metadata(&iso)?.len();
        info!(iso = %iso.display(), sha256 = %sha256, "Image written ({} MB)", size / 1024 / 1024);
        Ok(PackedImage { iso, sha256 })
    }

    fn write_squashfs(&self, root: &Path, squashfs: &Path) -> Result<()> {
        println!("Creating squashfs from {}...", root.display());
        let staged = squashfs.with_extension("squashfs.new");
        if staged.exists() {
            fs::remove_file(&staged)?;
        }
        let packed = self.host.mksquashfs(root, &staged).or_stage(BuildError::repack);
        if let Err(e) = packed {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }
        fs::rename(&staged, squashfs)?;

        // casper checks free space against this before copying the system
        if squashfs.file_name().is_some_and(|n| n == "filesystem.squashfs") {
            let size = tree_size(root).or_stage(BuildError::repack)?;
            let size_file = squashfs.with_file_name("filesystem.size");
            fs::write(&size_file, format!("{}\n", size))?;
        }
        Ok(())
    }
}

fn stamp_version(iso_root: &Path, version: &VersionInfo) -> Result<()> {
    write_file_with_dirs(iso_root.join(".disk/info"), version.disk_info())
        .or_stage(BuildError::repack)?;
    write_file_with_dirs(iso_root.join(BUILD_INFO_REL), version.build_info())
        .or_stage(BuildError::repack)?;
    Ok(())
}

/// Write `<iso>.sha256` in `sha256sum` format and return the digest.
fn write_checksum(iso: &Path) -> Result<String> {
    let sum = sha256_file(iso)?;
    let name = iso
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut sidecar = iso.as_os_str().to_owned();
    sidecar.push(".sha256");
    fs::write(PathBuf::from(sidecar), format!("{}  {}\n", sum, name))?;
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::{FailPoint, FakeHost};
    use crate::image;
    use serial_test::serial;
    use tempfile::TempDir;

    fn version() -> VersionInfo {
        VersionInfo::new("KT7RUN", "kt7run", "22.04.5", "v2.0.3")
    }

    fn extracted(temp: &TempDir, host: &FakeHost) -> ImageContext {
        let iso = temp.path().join("base.iso");
        fs::write(&iso, "iso").unwrap();
        image::extract(host, &iso, &temp.path().join("work"), false).unwrap()
    }

    #[test]
    #[serial]
    fn test_pack_produces_iso_metadata_and_sidecar() {
        let temp = TempDir::new().unwrap();
        let host = FakeHost::new();
        let mut ctx = extracted(&temp, &host);
        ctx.unmount(&host).unwrap();

        let repacker = ImageRepacker::new(&host, temp.path().join("output"), "STATIONISO");
        let packed = repacker.pack(&ctx, &version()).unwrap();

        assert_eq!(packed.iso.file_name().unwrap(), "stationiso-kt7run-22.04.5.iso");
        assert_eq!(fs::read_to_string(&packed.iso).unwrap(), "ISO STATIONISO\n");
        let sidecar = fs::read_to_string(temp.path().join("output/stationiso-kt7run-22.04.5.iso.sha256")).unwrap();
        assert_eq!(sidecar, format!("{}  stationiso-kt7run-22.04.5.iso\n", packed.sha256));

        let iso_root = ctx.iso_root();
        assert_eq!(
            fs::read_to_string(iso_root.join("casper/filesystem.squashfs")).unwrap(),
            "repacked squashfs"
        );
        assert!(!iso_root.join("casper/filesystem.squashfs.new").exists());
        let size: u64 = fs::read_to_string(iso_root.join("casper/filesystem.size"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(size > 0);
        assert!(fs::read_to_string(iso_root.join(".disk/info")).unwrap().starts_with("stationiso KT7RUN"));
        let info = fs::read_to_string(iso_root.join(BUILD_INFO_REL)).unwrap();
        assert!(info.contains("installer=v2.0.3"));
        assert!(fs::read_to_string(iso_root.join("md5sum.txt")).unwrap().contains("./stationiso/build-info.txt"));

        let calls = host.calls();
        let squash = calls.iter().position(|c| c.starts_with("mksquashfs")).unwrap();
        let md5 = calls.iter().position(|c| c == "md5sums").unwrap();
        let iso = calls.iter().position(|c| c.starts_with("mkiso")).unwrap();
        assert!(squash < md5 && md5 < iso);
    }

    #[test]
    #[serial]
    fn test_pack_requires_unmounted_context() {
        let temp = TempDir::new().unwrap();
        let host = FakeHost::new();
        let ctx = extracted(&temp, &host);
        let repacker = ImageRepacker::new(&host, temp.path().join("output"), "STATIONISO");

        let err = repacker.pack(&ctx, &version()).unwrap_err();
        assert!(matches!(err, BuildError::Repack { .. }));
        assert!(err.to_string().contains("Extracted"));
        assert!(!host.called("mksquashfs"));
    }

    #[test]
    #[serial]
    fn test_mksquashfs_failure_is_repack_error_and_keeps_original() {
        let temp = TempDir::new().unwrap();
        let host = FakeHost::new();
        host.fail_at(FailPoint::Mksquashfs);
        let mut ctx = extracted(&temp, &host);
        ctx.unmount(&host).unwrap();

        let repacker = ImageRepacker::new(&host, temp.path().join("output"), "STATIONISO");
        let err = repacker.pack(&ctx, &version()).unwrap_err();
        assert_eq!(err.exit_code(), 9);
        assert_eq!(
            fs::read_to_string(ctx.iso_root().join("casper/filesystem.squashfs")).unwrap(),
            "fake squashfs"
        );
        assert!(!host.called("mkiso"));
    }

    #[test]
    fn test_iso_name_sanitizes_tag() {
        let v = VersionInfo::new("KT7RUN", "kt7run", "22.04.5 beta/2", "v1");
        assert_eq!(v.iso_file_name(), "stationiso-kt7run-22.04.5-beta-2.iso");
    }
}
