//! Host operations that need privileges or external tools.
//!
//! Everything that mounts, chroots or shells out to an image tool goes
//! through the [`Host`] trait. [`SystemHost`] does it for real; the fake in
//! [`fake`] records calls and simulates mounts so the pipeline's unwind
//! behaviour can be tested without root.

pub mod fake;
mod system;

pub use system::SystemHost;

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use anyhow::Result;

/// How a special filesystem is attached inside the chroot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// `mount -t <fstype> <source> <target>`
    Fs(&'static str),
    /// `mount --bind <source> <target>`
    Bind,
}

/// One special filesystem mounted for the chroot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountSpec {
    pub source: &'static str,
    /// Target relative to the tree root.
    pub target: &'static str,
    pub kind: MountKind,
}

/// Bound in this order on entry, released in reverse on exit.
pub const CHROOT_MOUNTS: [MountSpec; 5] = [
    MountSpec {
        source: "proc",
        target: "proc",
        kind: MountKind::Fs("proc"),
    },
    MountSpec {
        source: "sysfs",
        target: "sys",
        kind: MountKind::Fs("sysfs"),
    },
    MountSpec {
        source: "/dev",
        target: "dev",
        kind: MountKind::Bind,
    },
    MountSpec {
        source: "/dev/pts",
        target: "dev/pts",
        kind: MountKind::Bind,
    },
    MountSpec {
        source: "/run",
        target: "run",
        kind: MountKind::Bind,
    },
];

/// Inputs for rebuilding the bootable image.
#[derive(Debug, Clone)]
pub struct IsoRequest {
    /// Stock ISO whose boot records are replayed.
    pub source_iso: PathBuf,
    /// Modified ISO contents.
    pub iso_root: PathBuf,
    pub output: PathBuf,
    pub volume_label: String,
}

pub trait Host {
    /// Copy the ISO's file tree into `dest`.
    fn extract_iso(&self, iso: &Path, dest: &Path) -> Result<()>;

    /// Unpack a squashfs image into `dest`.
    fn unsquash(&self, squashfs: &Path, dest: &Path) -> Result<()>;

    fn mount(&self, spec: &MountSpec, root: &Path) -> Result<()>;

    /// Release one mount point (absolute path).
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Mount points at or below `root`, deepest first.
    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>>;

    /// Host resolver configuration copied into the chroot, if any.
    fn resolv_conf(&self) -> Option<PathBuf>;

    /// Run `argv` inside the chroot at `root`. Output goes to the build log.
    fn chroot(&self, root: &Path, argv: &[&str], env: &[(&str, &str)]) -> Result<ExitStatus>;

    /// Run an operator script on the host with the tree root as argument.
    fn run_script(&self, script: &Path, root: &Path) -> Result<ExitStatus>;

    /// Unpack a release tarball (gzip) into `dest`, dropping the top directory.
    fn unpack_tarball(&self, tarball: &Path, dest: &Path) -> Result<()>;

    fn mksquashfs(&self, source: &Path, output: &Path) -> Result<()>;

    /// Regenerate `md5sum.txt` in the ISO root.
    fn write_md5sums(&self, iso_root: &Path) -> Result<()>;

    fn mkiso(&self, request: &IsoRequest) -> Result<()>;
}

/// Parse `/proc/self/mountinfo` and return mount points at or below `root`,
/// deepest first.
pub fn parse_mountinfo(content: &str, root: &Path) -> Vec<PathBuf> {
    let mut mounts: Vec<PathBuf> = content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_mount_path(field)))
        .filter(|path| path.starts_with(root))
        .collect();
    mounts.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| b.cmp(a))
    });
    mounts.dedup();
    mounts
}

/// Undo the kernel's octal escaping (`\040` for space and friends).
fn unescape_mount_path(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
