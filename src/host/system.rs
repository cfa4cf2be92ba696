//! Real host operations via external tools.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use super::{parse_mountinfo, Host, IsoRequest, MountKind, MountSpec};
use crate::build::BuildLog;
use crate::interrupt::Interrupt;
use crate::process::Cmd;

/// Runs mount, chroot, unsquashfs, mksquashfs and xorriso for real.
///
/// Long-running tools stream into the build log and are registered with the
/// interrupt handle while they run.
pub struct SystemHost {
    log: BuildLog,
    interrupt: Arc<Interrupt>,
}

impl SystemHost {
    pub fn new(log: BuildLog, interrupt: Arc<Interrupt>) -> Self {
        Self { log, interrupt }
    }

    fn logged(&self, cmd: Cmd) -> Result<ExitStatus> {
        cmd.run_logged(&self.log, &self.interrupt)
    }
}

impl Host for SystemHost {
    fn extract_iso(&self, iso: &Path, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        self.logged(
            Cmd::new("xorriso")
                .args(["-osirrox", "on", "-indev"])
                .arg_path(iso)
                .args(["-extract", "/"])
                .arg_path(dest)
                .error_msg("xorriso extraction failed"),
        )?;
        // ISO9660 files come out read-only.
        Cmd::new("chmod")
            .args(["-R", "u+w"])
            .arg_path(dest)
            .error_msg("Failed to make extracted ISO writable")
            .run()?;
        Ok(())
    }

    fn unsquash(&self, squashfs: &Path, dest: &Path) -> Result<()> {
        self.logged(
            Cmd::new("unsquashfs")
                .args(["-f", "-d"])
                .arg_path(dest)
                .arg_path(squashfs)
                .error_msg("unsquashfs failed"),
        )?;
        Ok(())
    }

    fn mount(&self, spec: &MountSpec, root: &Path) -> Result<()> {
        let target = root.join(spec.target);
        fs::create_dir_all(&target)
            .with_context(|| format!("Failed to create mount point {}", target.display()))?;
        let cmd = match spec.kind {
            MountKind::Fs(fstype) => Cmd::new("mount").args(["-t", fstype, spec.source]),
            MountKind::Bind => Cmd::new("mount").args(["--bind", spec.source]),
        };
        cmd.arg_path(&target)
            .error_msg(format!("Failed to mount {}", target.display()))
            .run()?;
        debug!(target = %target.display(), "Mounted");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let result = Cmd::new("umount").arg_path(target).allow_fail().run()?;
        if result.success() {
            debug!(target = %target.display(), "Unmounted");
            return Ok(());
        }

        warn!(
            target = %target.display(),
            "umount failed ({}), retrying lazily",
            result.stderr_trimmed()
        );
        Cmd::new("umount")
            .args(["--lazy"])
            .arg_path(target)
            .error_msg(format!("Failed to unmount {}", target.display()))
            .run()?;
        Ok(())
    }

    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let content = fs::read_to_string("/proc/self/mountinfo")
            .context("Failed to read /proc/self/mountinfo")?;
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        Ok(parse_mountinfo(&content, &root))
    }

    fn resolv_conf(&self) -> Option<PathBuf> {
        let path = PathBuf::from("/etc/resolv.conf");
        path.exists().then_some(path)
    }

    fn chroot(&self, root: &Path, argv: &[&str], env: &[(&str, &str)]) -> Result<ExitStatus> {
        let mut cmd = Cmd::new("chroot").arg_path(root).args(argv).allow_fail();
        for (key, value) in env {
            cmd = cmd.env(key, value);
        }
        self.logged(cmd)
    }

    fn run_script(&self, script: &Path, root: &Path) -> Result<ExitStatus> {
        let root_str = root.to_string_lossy().into_owned();
        self.logged(
            Cmd::new("sh")
                .arg_path(script)
                .arg(&root_str)
                .env("STATIONISO_ROOT", &root_str)
                .allow_fail(),
        )
    }

    fn unpack_tarball(&self, tarball: &Path, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        Cmd::new("tar")
            .args(["-xzf"])
            .arg_path(tarball)
            .args(["--strip-components=1", "-C"])
            .arg_path(dest)
            .error_msg(format!("Failed to unpack {}", tarball.display()))
            .run()?;
        Ok(())
    }

    fn mksquashfs(&self, source: &Path, output: &Path) -> Result<()> {
        if output.exists() {
            fs::remove_file(output)
                .with_context(|| format!("Failed to remove old {}", output.display()))?;
        }
        self.logged(
            Cmd::new("mksquashfs")
                .arg_path(source)
                .arg_path(output)
                .args(["-comp", "xz", "-b", "1M", "-noappend", "-no-progress"])
                .error_msg("mksquashfs failed"),
        )?;
        Ok(())
    }

    fn write_md5sums(&self, iso_root: &Path) -> Result<()> {
        let result = Cmd::new("sh")
            .args([
                "-c",
                "find . -type f ! -name md5sum.txt ! -name boot.cat -print0 | sort -z | xargs -0 md5sum",
            ])
            .dir(iso_root)
            .error_msg("Failed to compute md5sums")
            .run()?;
        if result.stdout.trim().is_empty() {
            bail!("md5sum produced no output for {}", iso_root.display());
        }
        fs::write(iso_root.join("md5sum.txt"), result.stdout)
            .context("Failed to write md5sum.txt")?;
        Ok(())
    }

    fn mkiso(&self, request: &IsoRequest) -> Result<()> {
        if request.output.exists() {
            fs::remove_file(&request.output)
                .with_context(|| format!("Failed to remove old {}", request.output.display()))?;
        }
        if let Some(parent) = request.output.parent() {
            fs::create_dir_all(parent)?;
        }
        self.logged(
            Cmd::new("xorriso")
                .arg("-indev")
                .arg_path(&request.source_iso)
                .arg("-outdev")
                .arg_path(&request.output)
                .args(["-volid", &request.volume_label])
                .arg("-map")
                .arg_path(&request.iso_root)
                .arg("/")
                .args(["-boot_image", "any", "replay"])
                .error_msg("xorriso failed to build the ISO"),
        )?;
        Ok(())
    }
}
