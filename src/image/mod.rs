//! Extracted image lifecycle.
//!
//! ```text
//! Unextracted → Extracted → ChrootBound → Unmounting → Unmounted
//!                    (any) → Failed
//! ```
//!
//! An [`ImageContext`] owns the extracted tree under the work directory.
//! Only one may be live per process, and an exclusive lock file keeps a
//! second build away from the same work directory.

mod chroot;

pub use chroot::ChrootGuard;

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::common::files::dir_has_entries;
use crate::error::{BuildError, Result, StageResultExt};
use crate::host::{Host, CHROOT_MOUNTS};

/// Squashfs locations tried in order inside the ISO.
pub const SQUASHFS_CANDIDATES: &[&str] = &[
    "casper/filesystem.squashfs",
    "live/filesystem.squashfs",
    "LiveOS/squashfs.img",
];

/// Marker that allows the next build to wipe and reuse the work tree.
pub const REUSABLE_MARKER: &str = ".stationiso-reusable";

/// Exclusive lock held by the live context for the whole build.
pub const LOCK_FILE: &str = ".stationiso.lock";
const RESOLV_BACKUP: &str = "etc/resolv.conf.stationiso-orig";

static LIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unextracted,
    Extracted,
    ChrootBound,
    Unmounting,
    Unmounted,
    Failed,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Holds the process-wide "one live context" slot and the work dir lock.
struct Ownership {
    lock: File,
}

impl Ownership {
    fn acquire(work_dir: &Path) -> Result<Self> {
        if LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BuildError::mount(
                "another image context is already live in this process".to_string(),
            ));
        }

        let lock_path = work_dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path);
        let lock = match lock {
            Ok(file) => file,
            Err(e) => {
                LIVE.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        if lock.try_lock_exclusive().is_err() {
            LIVE.store(false, Ordering::SeqCst);
            return Err(BuildError::WorkdirLocked {
                path: work_dir.to_path_buf(),
            });
        }
        Ok(Self { lock })
    }
}

impl Drop for Ownership {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock) {
            warn!("Failed to release work dir lock: {}", e);
        }
        LIVE.store(false, Ordering::SeqCst);
    }
}

/// The extracted tree and everything mounted into it.
pub struct ImageContext {
    work_dir: PathBuf,
    iso_root: PathBuf,
    root: PathBuf,
    source_iso: PathBuf,
    squashfs: Option<PathBuf>,
    state: MountState,
    bound: Vec<PathBuf>,
    resolv_swapped: bool,
    _ownership: Ownership,
}

impl ImageContext {
    /// Claim the work directory for `source_iso`. Nothing is extracted yet.
    pub fn open(work_dir: &Path, source_iso: &Path) -> Result<Self> {
        fs::create_dir_all(work_dir)?;
        let work_dir = fs::canonicalize(work_dir)?;
        let ownership = Ownership::acquire(&work_dir)?;

        Ok(Self {
            iso_root: work_dir.join("iso"),
            root: work_dir.join("squashfs-root"),
            work_dir,
            source_iso: source_iso.to_path_buf(),
            squashfs: None,
            state: MountState::Unextracted,
            bound: Vec::new(),
            resolv_swapped: false,
            _ownership: ownership,
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Root of the unsquashed system tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Extracted ISO contents (boot configs, preseed, squashfs).
    pub fn iso_root(&self) -> &Path {
        &self.iso_root
    }

    pub fn source_iso(&self) -> &Path {
        &self.source_iso
    }

    /// Squashfs inside the ISO root, once extracted.
    pub fn squashfs(&self) -> Option<&Path> {
        self.squashfs.as_deref()
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    /// Special filesystems currently bound, in bind order.
    pub fn bound(&self) -> &[PathBuf] {
        &self.bound
    }

    fn expect(&self, expected: &[MountState], action: &str) -> Result<()> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(BuildError::mount(format!(
                "cannot {} in state {}",
                action, self.state
            )))
        }
    }

    /// Extract the ISO and unsquash its system image.
    pub fn extract(&mut self, host: &dyn Host, reuse: bool) -> Result<()> {
        self.expect(&[MountState::Unextracted], "extract")?;
        let result = self.extract_inner(host, reuse);
        self.state = match result {
            Ok(()) => MountState::Extracted,
            Err(_) => MountState::Failed,
        };
        result
    }

    fn extract_inner(&mut self, host: &dyn Host, reuse: bool) -> Result<()> {
        let marker = self.work_dir.join(REUSABLE_MARKER);
        let dirty = dir_has_entries(&self.root) || dir_has_entries(&self.iso_root);
        if dirty {
            if !reuse && !marker.exists() {
                return Err(BuildError::mount(format!(
                    "{} is not empty; pass --reuse or run 'stationiso clean work'",
                    self.work_dir.display()
                )));
            }
            let stale = host.mounts_under(&self.work_dir).or_stage(BuildError::mount)?;
            if !stale.is_empty() {
                return Err(BuildError::mount(format!(
                    "refusing to reuse {}: still mounted: {}",
                    self.work_dir.display(),
                    join_paths(&stale)
                )));
            }
            info!(work = %self.work_dir.display(), "Reusing work directory");
            for dir in [&self.root, &self.iso_root] {
                if dir.exists() {
                    fs::remove_dir_all(dir)?;
                }
            }
        }
        if marker.exists() {
            fs::remove_file(&marker)?;
        }

        info!(iso = %self.source_iso.display(), "Extracting ISO");
        host.extract_iso(&self.source_iso, &self.iso_root)
            .or_stage(BuildError::mount)?;

        let squashfs = SQUASHFS_CANDIDATES
            .iter()
            .map(|rel| self.iso_root.join(rel))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                BuildError::mount(format!(
                    "no system image found in {} (looked for {})",
                    self.source_iso.display(),
                    SQUASHFS_CANDIDATES.join(", ")
                ))
            })?;

        info!(squashfs = %squashfs.display(), "Unpacking system image");
        host.unsquash(&squashfs, &self.root)
            .or_stage(BuildError::mount)?;
        self.squashfs = Some(squashfs);
        Ok(())
    }

    /// Bind the special filesystems, install the resolver, and probe entry.
    ///
    /// On failure whatever was bound is released again in reverse.
    pub(crate) fn enter_chroot(&mut self, host: &dyn Host) -> Result<()> {
        self.expect(&[MountState::Extracted], "enter chroot")?;

        if let Err(e) = self.bind_and_probe(host) {
            let unwind = self.unwind_binds(host);
            self.state = MountState::Failed;
            if let Err(leaked) = unwind {
                warn!("Unwinding failed chroot entry left mounts: {}", leaked);
            }
            return Err(e);
        }
        self.state = MountState::ChrootBound;
        Ok(())
    }

    fn bind_and_probe(&mut self, host: &dyn Host) -> Result<()> {
        for spec in CHROOT_MOUNTS.iter() {
            host.mount(spec, &self.root).or_stage(|r| {
                BuildError::mount(format!("binding {}: {}", spec.target, r))
            })?;
            self.bound.push(self.root.join(spec.target));
        }

        self.install_resolv_conf(host)?;

        let status = host
            .chroot(&self.root, &["/bin/true"], &[])
            .or_stage(BuildError::mount)?;
        if !status.success() {
            return Err(BuildError::mount(format!(
                "chroot entry probe /bin/true failed (exit code {})",
                status.code().unwrap_or(-1)
            )));
        }
        debug!(root = %self.root.display(), "Chroot ready");
        Ok(())
    }

    fn install_resolv_conf(&mut self, host: &dyn Host) -> Result<()> {
        let Some(source) = host.resolv_conf() else {
            return Ok(());
        };
        let target = self.root.join("etc/resolv.conf");
        let backup = self.root.join(RESOLV_BACKUP);
        let content = fs::read(&source)?;
        if target.symlink_metadata().is_ok() {
            fs::rename(&target, &backup)?;
        }
        self.resolv_swapped = true;
        fs::write(&target, content)?;
        Ok(())
    }

    fn restore_resolv_conf(&mut self) -> Result<()> {
        if !self.resolv_swapped {
            return Ok(());
        }
        let target = self.root.join("etc/resolv.conf");
        let backup = self.root.join(RESOLV_BACKUP);
        if target.symlink_metadata().is_ok() {
            fs::remove_file(&target)?;
        }
        if backup.symlink_metadata().is_ok() {
            fs::rename(&backup, &target)?;
        }
        self.resolv_swapped = false;
        Ok(())
    }

    /// Release bound filesystems in strict reverse order.
    ///
    /// Mounts that fail to release stay in `bound` and are reported.
    fn unwind_binds(&mut self, host: &dyn Host) -> std::result::Result<(), String> {
        let mut failures = Vec::new();
        if let Err(e) = self.restore_resolv_conf() {
            failures.push(format!("resolv.conf: {}", e));
        }
        let mut kept = Vec::new();
        while let Some(target) = self.bound.pop() {
            match host.unmount(&target) {
                Ok(()) => debug!(target = %target.display(), "Unbound"),
                Err(e) => {
                    failures.push(format!("{}: {:#}", target.display(), e));
                    kept.push(target);
                }
            }
        }
        kept.reverse();
        self.bound = kept;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }

    /// Unbind everything `enter_chroot` bound and restore the resolver.
    pub(crate) fn leave_chroot(&mut self, host: &dyn Host) -> Result<()> {
        self.expect(&[MountState::ChrootBound], "leave chroot")?;
        self.state = MountState::Unmounting;
        match self.unwind_binds(host) {
            Ok(()) => Ok(()),
            Err(leaked) => {
                self.state = MountState::Failed;
                Err(BuildError::mount(format!(
                    "failed to release chroot mounts: {}",
                    leaked
                )))
            }
        }
    }

    /// Release anything still mounted under the work directory.
    ///
    /// From `Failed` this still cleans up, but the context stays `Failed`.
    pub fn unmount(&mut self, host: &dyn Host) -> Result<()> {
        self.expect(
            &[
                MountState::Extracted,
                MountState::Unmounting,
                MountState::Unmounted,
                MountState::Failed,
            ],
            "unmount",
        )?;

        let mut failures = Vec::new();
        if let Err(leaked) = self.unwind_binds(host) {
            warn!("Releasing chroot binds before unmount: {}", leaked);
            failures.push(leaked);
        }
        for target in host.mounts_under(&self.work_dir).or_stage(BuildError::mount)? {
            if let Err(e) = host.unmount(&target) {
                failures.push(format!("{}: {:#}", target.display(), e));
            }
        }

        let residual = host.mounts_under(&self.work_dir).or_stage(BuildError::mount)?;
        if !residual.is_empty() {
            self.state = MountState::Failed;
            return Err(BuildError::mount(format!(
                "mounts still active under {}: {}{}",
                self.work_dir.display(),
                join_paths(&residual),
                if failures.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", failures.join("; "))
                }
            )));
        }

        self.bound.clear();
        if self.state != MountState::Failed {
            self.state = MountState::Unmounted;
        }
        Ok(())
    }

    /// Let the next build wipe and reuse this work directory.
    pub fn mark_reusable(&self) -> Result<()> {
        self.expect(&[MountState::Unmounted], "mark the tree reusable")?;
        fs::write(self.work_dir.join(REUSABLE_MARKER), "")?;
        Ok(())
    }
}

/// Claim `work_dir`, extract `iso` into it, and return the live context.
pub fn extract(host: &dyn Host, iso: &Path, work_dir: &Path, reuse: bool) -> Result<ImageContext> {
    let mut ctx = ImageContext::open(work_dir, iso)?;
    ctx.extract(host, reuse)?;
    Ok(ctx)
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
