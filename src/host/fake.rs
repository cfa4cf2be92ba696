//! In-memory host used by tests.
//!
//! Simulates a stock live ISO, tracks mounts, and fails on request so the
//! pipeline's unwind path can be exercised at every stage.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use anyhow::{bail, Result};

use super::{Host, IsoRequest, MountSpec, CHROOT_MOUNTS};
use crate::common::write_file_with_dirs;
use crate::interrupt::Interrupt;
use crate::process::Cmd;

/// Where the fake should fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ExtractIso,
    Unsquash,
    /// Mounting the given chroot target (`proc`, `dev/pts`, ...).
    Mount(&'static str),
    /// The `/bin/true` entry probe.
    ChrootProbe,
    /// Installer exits nonzero.
    Installer,
    Unmount(&'static str),
    Mksquashfs,
    Mkiso,
}

pub const FAKE_GRUB_CFG: &str = "\
set timeout=5
menuentry \"Try or Install Ubuntu\" {
\tset gfxpayload=keep
\tlinux\t/casper/vmlinuz  file=/cdrom/preseed/ubuntu.seed maybe-ubiquity quiet splash ---
\tinitrd\t/casper/initrd
}
";

pub const FAKE_TXT_CFG: &str = "\
default live
label live
  menu label ^Try Ubuntu without installing
  kernel /casper/vmlinuz
  append  file=/cdrom/preseed/ubuntu.seed initrd=/casper/initrd quiet splash ---
";

#[doc(hidden)]
#[derive(Default)]
pub struct FakeHost {
    mounts: RefCell<Vec<PathBuf>>,
    calls: RefCell<Vec<String>>,
    failures: RefCell<HashSet<FailPoint>>,
    installer_marker: RefCell<Option<String>>,
    resolv_conf: RefCell<Option<PathBuf>>,
    interrupt_in_installer: RefCell<Option<Arc<Interrupt>>>,
    max_mounts: Cell<usize>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail at `point` from now on.
    pub fn fail_at(&self, point: FailPoint) {
        self.failures.borrow_mut().insert(point);
    }

    /// Directory (relative) the fake installer creates on success.
    pub fn with_installer_marker(self, marker: &str) -> Self {
        *self.installer_marker.borrow_mut() = Some(marker.to_string());
        self
    }

    /// Host resolver file copied into the chroot on entry.
    pub fn with_resolv_conf(self, path: &Path) -> Self {
        *self.resolv_conf.borrow_mut() = Some(path.to_path_buf());
        self
    }

    /// Deliver SIGTERM to `interrupt` while the installer runs, as if the
    /// operator stopped the build mid-install.
    pub fn interrupt_during_installer(self, interrupt: Arc<Interrupt>) -> Self {
        *self.interrupt_in_installer.borrow_mut() = Some(interrupt);
        self
    }

    pub fn active_mounts(&self) -> Vec<PathBuf> {
        self.mounts.borrow().clone()
    }

    /// Highest number of simultaneous mounts seen.
    pub fn peak_mounts(&self) -> usize {
        self.max_mounts.get()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls.borrow().iter().any(|c| c.starts_with(prefix))
    }

    fn record(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }

    fn fails(&self, point: &FailPoint) -> bool {
        self.failures.borrow().contains(point)
    }
}

fn status(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code << 8)
}

impl Host for FakeHost {
    fn extract_iso(&self, iso: &Path, dest: &Path) -> Result<()> {
        self.record(format!("extract_iso {}", iso.display()));
        if self.fails(&FailPoint::ExtractIso) {
            bail!("xorriso extraction failed (injected)");
        }
        write_file_with_dirs(dest.join("casper/filesystem.squashfs"), "fake squashfs")?;
        write_file_with_dirs(dest.join("casper/filesystem.size"), "0\n")?;
        write_file_with_dirs(dest.join("boot/grub/grub.cfg"), FAKE_GRUB_CFG)?;
        write_file_with_dirs(dest.join("isolinux/txt.cfg"), FAKE_TXT_CFG)?;
        write_file_with_dirs(dest.join(".disk/info"), "Ubuntu 22.04.5 LTS \"Jammy Jellyfish\"\n")?;
        write_file_with_dirs(dest.join("md5sum.txt"), "")?;
        Ok(())
    }

    fn unsquash(&self, squashfs: &Path, dest: &Path) -> Result<()> {
        self.record(format!("unsquash {}", squashfs.display()));
        if self.fails(&FailPoint::Unsquash) {
            bail!("unsquashfs failed (injected)");
        }
        write_file_with_dirs(dest.join("etc/hostname"), "ubuntu\n")?;
        write_file_with_dirs(dest.join("etc/hosts"), "127.0.0.1\tlocalhost\n127.0.1.1\tubuntu\n")?;
        write_file_with_dirs(
            dest.join("etc/adduser.conf"),
            "DSHELL=/bin/bash\n#EXTRA_GROUPS=\"dialout cdrom floppy audio video plugdev users\"\n#ADD_EXTRA_GROUPS=1\n",
        )?;
        write_file_with_dirs(dest.join("etc/resolv.conf"), "nameserver 127.0.0.53\n")?;
        write_file_with_dirs(dest.join("etc/skel/.bashrc"), "# stock bashrc\n")?;
        fs::create_dir_all(dest.join("usr/bin"))?;
        fs::create_dir_all(dest.join("tmp"))?;
        Ok(())
    }

    fn mount(&self, spec: &MountSpec, root: &Path) -> Result<()> {
        self.record(format!("mount {}", spec.target));
        if self.fails(&FailPoint::Mount(spec.target)) {
            bail!("mount {} failed (injected)", spec.target);
        }
        let target = root.join(spec.target);
        fs::create_dir_all(&target)?;
        let mut mounts = self.mounts.borrow_mut();
        mounts.push(target);
        self.max_mounts.set(self.max_mounts.get().max(mounts.len()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.record(format!("unmount {}", target.display()));
        let injected = self
            .failures
            .borrow()
            .iter()
            .any(|f| matches!(f, FailPoint::Unmount(rel) if target.ends_with(rel)));
        if injected {
            bail!("umount {} failed (injected)", target.display());
        }
        let mut mounts = self.mounts.borrow_mut();
        match mounts.iter().position(|m| m == target) {
            Some(i) => {
                mounts.remove(i);
                Ok(())
            }
            None => bail!("{} is not mounted", target.display()),
        }
    }

    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut found: Vec<PathBuf> = self
            .mounts
            .borrow()
            .iter()
            .filter(|m| m.starts_with(root))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.components().count().cmp(&a.components().count()));
        Ok(found)
    }

    fn resolv_conf(&self) -> Option<PathBuf> {
        self.resolv_conf.borrow().clone()
    }

    fn chroot(&self, root: &Path, argv: &[&str], _env: &[(&str, &str)]) -> Result<ExitStatus> {
        self.record(format!("chroot {}", argv.join(" ")));
        let bound = CHROOT_MOUNTS
            .iter()
            .all(|spec| self.mounts.borrow().contains(&root.join(spec.target)));
        if !bound {
            bail!("chroot into {} without special filesystems", root.display());
        }

        if argv == ["/bin/true"] {
            return Ok(status(if self.fails(&FailPoint::ChrootProbe) { 1 } else { 0 }));
        }

        if argv.iter().any(|a| a.contains("stationiso-installer")) {
            if self.fails(&FailPoint::Installer) {
                return Ok(status(3));
            }
            if let Some(interrupt) = self.interrupt_in_installer.borrow().as_ref() {
                interrupt.trigger(libc::SIGTERM);
            }
            if let Some(marker) = self.installer_marker.borrow().as_deref() {
                fs::create_dir_all(root.join(marker))?;
            }
        }
        Ok(status(0))
    }

    fn run_script(&self, script: &Path, root: &Path) -> Result<ExitStatus> {
        self.record(format!("script {}", script.display()));
        let root_str = root.to_string_lossy().into_owned();
        let result = Cmd::new("sh")
            .arg_path(script)
            .arg(&root_str)
            .env("STATIONISO_ROOT", &root_str)
            .allow_fail()
            .run()?;
        Ok(result.status)
    }

    fn unpack_tarball(&self, tarball: &Path, dest: &Path) -> Result<()> {
        self.record(format!("unpack {}", tarball.display()));
        write_file_with_dirs(dest.join("install.sh"), "#!/bin/bash\nexit 0\n")?;
        Ok(())
    }

    fn mksquashfs(&self, source: &Path, output: &Path) -> Result<()> {
        self.record(format!("mksquashfs {}", source.display()));
        if !self.mounts_under(source)?.is_empty() {
            bail!("mksquashfs over a mounted tree");
        }
        if self.fails(&FailPoint::Mksquashfs) {
            bail!("mksquashfs failed (injected)");
        }
        fs::write(output, "repacked squashfs")?;
        Ok(())
    }

    fn write_md5sums(&self, iso_root: &Path) -> Result<()> {
        self.record("md5sums".to_string());
        let files = crate::common::files::list_files(iso_root)?;
        let listing: String = files
            .iter()
            .filter(|f| f.as_str() != "md5sum.txt")
            .map(|f| format!("00000000000000000000000000000000  ./{}\n", f))
            .collect();
        fs::write(iso_root.join("md5sum.txt"), listing)?;
        Ok(())
    }

    fn mkiso(&self, request: &IsoRequest) -> Result<()> {
        self.record(format!("mkiso {}", request.output.display()));
        if self.fails(&FailPoint::Mkiso) {
            bail!("xorriso failed (injected)");
        }
        if let Some(parent) = request.output.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.output, format!("ISO {}\n", request.volume_label))?;
        Ok(())
    }
}
