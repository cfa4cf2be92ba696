//! The image build pipeline.
//!
//! ```text
//! fetch → capture-rolling → plan → extract → enter-chroot → installer
//!   → customize → preseed → leave-chroot → unmount → repack
//! ```
//!
//! Every stage is recorded in the manifest as it finishes. Whatever goes
//! wrong after extraction, the tree is unbound and unmounted before the
//! error leaves this module, and a mount that cannot be released turns an
//! otherwise successful build into a mount error.

use std::fs;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::backup::{BackupStore, RestorePlan};
use crate::build::BuildContext;
use crate::config::Config;
use crate::cache::{Artifact, ArtifactCache, ArtifactDescriptor, Transport};
use crate::component::{ApplyOptions, ApplySummary, Registry, UnitContext};
use crate::error::{BuildError, Result, StageResultExt};
use crate::host::Host;
use crate::image::{self, ChrootGuard, ImageContext};
use crate::installer;
use crate::interrupt::Interrupt;
use crate::manifest::BuildResult;
use crate::preseed::{self, DiskLayout, PartitionStrategy, PreseedProfile, PreseedTargets};
use crate::release::{Release, ReleaseCatalog, ReleaseSelector};
use crate::repack::{ImageRepacker, PackedImage, VersionInfo};
use crate::station::StationFile;

/// Everything fetched before the tree is touched.
#[derive(Debug, Clone)]
pub struct BuildInputs {
    pub base_image: Artifact,
    pub installer: Artifact,
    pub release: Release,
}

/// What a finished build produced.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub image: PackedImage,
    pub summary: ApplySummary,
}

pub struct Pipeline<'a> {
    host: &'a dyn Host,
}

impl<'a> Pipeline<'a> {
    pub fn new(host: &'a dyn Host) -> Self {
        Self { host }
    }

    /// Fetch inputs, build, and record the final result in the manifest.
    pub fn run(&self, ctx: &mut BuildContext, transport: &dyn Transport) -> Result<BuildOutput> {
        let result = self
            .fetch_inputs(ctx, transport)
            .and_then(|inputs| self.build(ctx, &inputs));
        finish(ctx, &result)?;
        result
    }

    /// Build from already fetched inputs and record the final result.
    pub fn execute(&self, ctx: &mut BuildContext, inputs: &BuildInputs) -> Result<BuildOutput> {
        let result = self.build(ctx, inputs);
        finish(ctx, &result)?;
        result
    }

    /// Fetch both artifacts and record their versions in the manifest.
    pub fn fetch_inputs(
        &self,
        ctx: &mut BuildContext,
        transport: &dyn Transport,
    ) -> Result<BuildInputs> {
        stage(ctx, "fetch", |ctx| {
            let inputs = fetch_artifacts(
                &ctx.config,
                &ctx.station,
                &ctx.options.release,
                transport,
                Some(Arc::clone(&ctx.interrupt)),
            )?;
            for (key, value) in [
                ("base_image", inputs.base_image.descriptor.tag.as_str()),
                ("base_image_sha256", inputs.base_image.sha256.as_str()),
                ("installer", inputs.installer.descriptor.tag.as_str()),
                ("installer_sha256", inputs.installer.sha256.as_str()),
            ] {
                ctx.manifest
                    .set_version(key, value)
                    .or_stage(|reason| BuildError::Io(std::io::Error::other(reason)))?;
            }
            Ok(inputs)
        })
    }

    fn build(&self, ctx: &mut BuildContext, inputs: &BuildInputs) -> Result<BuildOutput> {
        // 1. Rolling state comes from the previous deployment, so it is
        //    captured before anything else happens.
        let plan = stage(ctx, "capture-rolling", |ctx| Ok(capture_rolling(ctx)))?;

        // 2. A bad unit order fails here, before the tree exists.
        let registry = stage(ctx, "plan", |ctx| {
            let registry = Registry::standard(&ctx.station, plan)?;
            registry.validate()?;
            Ok(registry)
        })?;

        // 3. Extract. Nothing is mounted yet if this fails.
        let mut tree = stage(ctx, "extract", |ctx| {
            image::extract(
                self.host,
                &inputs.base_image.path,
                &ctx.config.work_dir,
                ctx.options.reuse,
            )
        })?;

        // 4. Everything that needs the chroot. The guard unbinds on any exit.
        let chrooted = self.in_chroot(ctx, inputs, &registry, &mut tree);

        // 5. Always unmount, even after a failure or an interrupt.
        let unmounted = record(ctx, "unmount", |_| tree.unmount(self.host));

        let summary = match (chrooted, unmounted) {
            (Ok(summary), Ok(())) => summary,
            (Ok(_), Err(leak)) => return Err(leak),
            (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(leak)) => {
                error!("Unwinding after failure left mounts behind: {}", leak);
                return Err(e);
            }
        };

        // 6. Repack.
        let image = stage(ctx, "repack", |ctx| {
            let version = VersionInfo::new(
                &ctx.station.station.id,
                &ctx.station.hostname()?,
                &inputs.base_image.descriptor.tag,
                &inputs.installer.descriptor.tag,
            );
            ImageRepacker::new(self.host, ctx.config.output_dir.clone(), &ctx.station.image.volume_label)
                .pack(&tree, &version)
        })?;

        tree.mark_reusable()?;
        Ok(BuildOutput { image, summary })
    }

    fn in_chroot(
        &self,
        ctx: &mut BuildContext,
        inputs: &BuildInputs,
        registry: &Registry,
        tree: &mut ImageContext,
    ) -> Result<ApplySummary> {
        ctx.checkpoint("enter-chroot")?;
        let started = Instant::now();
        let entered = ChrootGuard::enter(self.host, tree);
        ctx.record_stage("enter-chroot", started, &entered)?;
        let guard = entered?;

        stage(ctx, "installer", |ctx| {
            installer::run(&guard, &inputs.installer, &ctx.station.installer)
        })?;

        let summary = stage(ctx, "customize", |ctx| {
            let unit_ctx = UnitContext {
                root: guard.root(),
                station: &ctx.station,
                host: self.host,
            };
            let options = ApplyOptions {
                minimal: ctx.options.minimal,
            };
            registry.apply_all(&unit_ctx, &mut ctx.manifest, &ctx.interrupt, options)
        })?;

        stage(ctx, "preseed", |ctx| {
            let profile = PreseedProfile::from_station(&ctx.station)?;
            let layout = target_layout(&ctx.station)?;
            let output = preseed::generate(&profile, layout.as_ref())?;
            let patched = preseed::write(&output, &PreseedTargets::for_iso_root(guard.context().iso_root()))?;
            info!(
                strategy = %profile.strategy,
                resolved = %output.resolved,
                "Preseed written, {} boot config(s) patched",
                patched.len()
            );
            Ok(())
        })?;

        stage(ctx, "leave-chroot", |_| guard.leave())?;
        Ok(summary)
    }
}

/// Resolve the installer release and fetch both artifacts into the cache.
///
/// The installer repository comes from `STATIONISO_INSTALLER_REPO` when set,
/// otherwise from the station file.
pub fn fetch_artifacts(
    config: &Config,
    station: &StationFile,
    selector: &ReleaseSelector,
    transport: &dyn Transport,
    interrupt: Option<Arc<Interrupt>>,
) -> Result<BuildInputs> {
    let repo = config
        .installer_repo
        .as_deref()
        .unwrap_or(&station.installer.repo);
    let catalog = ReleaseCatalog::fetch(transport, repo)?;
    let release = catalog.select(selector)?.clone();
    info!(tag = %release.tag_name, channel = release.channel(), "Selected installer release");

    let mut cache = ArtifactCache::new(config.cache_dir.clone(), transport);
    if let Some(interrupt) = interrupt {
        cache = cache.with_interrupt(interrupt);
    }
    let base_image = cache.fetch(&ArtifactDescriptor::base_image(station))?;
    let installer = cache.fetch(&ArtifactDescriptor::installer(station, &release))?;
    Ok(BuildInputs {
        base_image,
        installer,
        release,
    })
}

/// Checkpoint for cancellation, run `f`, record the outcome.
fn stage<T>(
    ctx: &mut BuildContext,
    name: &str,
    f: impl FnOnce(&mut BuildContext) -> Result<T>,
) -> Result<T> {
    ctx.checkpoint(name)?;
    record(ctx, name, f)
}

/// Run `f` and record it without a cancellation checkpoint (unwind stages).
fn record<T>(
    ctx: &mut BuildContext,
    name: &str,
    f: impl FnOnce(&mut BuildContext) -> Result<T>,
) -> Result<T> {
    let started = Instant::now();
    let result = f(ctx);
    ctx.record_stage(name, started, &result)?;
    result
}

/// Capture the previous deployment and choose the restore sets.
///
/// A failed capture never stops the build; the older rolling sets and the
/// golden-master are still there to fall back on.
fn capture_rolling(ctx: &BuildContext) -> RestorePlan {
    let backup = &ctx.station.backup;
    let store = BackupStore::new(ctx.config.backup_dir());
    let previous = backup.previous_state.as_deref();

    match RestorePlan::prepare(store.clone(), previous, &backup.paths, backup.keep_rolling) {
        Ok(plan) => {
            for line in plan.describe() {
                info!("Restore plan: {}", line);
            }
            plan
        }
        Err(e) => {
            warn!("Rolling capture failed, continuing with existing sets: {:#}", e);
            println!("  [WARN] rolling capture failed: {:#}", e);
            RestorePlan::prepare(store.clone(), None, &backup.paths, backup.keep_rolling)
                .unwrap_or_else(|_| RestorePlan::empty(store))
        }
    }
}

/// Disk layout for auto-detect: a saved `lsblk` dump if given, else a probe.
fn target_layout(station: &StationFile) -> Result<Option<DiskLayout>> {
    let preseed = &station.preseed;
    if preseed.partition != PartitionStrategy::AutoDetect {
        return Ok(None);
    }
    if let Some(file) = &preseed.layout_file {
        let json = fs::read_to_string(file).map_err(|e| {
            BuildError::preseed(format!("cannot read layout file {}: {}", file.display(), e))
        })?;
        return DiskLayout::parse_lsblk(&json).map(Some);
    }
    match &preseed.target_disk {
        Some(disk) => DiskLayout::probe(disk).map(Some),
        None => Err(BuildError::preseed(
            "auto-detect needs preseed.target_disk or preseed.layout_file".to_string(),
        )),
    }
}

fn finish(ctx: &mut BuildContext, result: &Result<BuildOutput>) -> Result<()> {
    let final_result = match result {
        Ok(out) if out.summary.warnings.is_empty() => BuildResult::Succeeded {
            output: out.image.iso.clone(),
        },
        Ok(out) => BuildResult::Degraded {
            output: out.image.iso.clone(),
            warnings: out.summary.warnings.len(),
        },
        Err(BuildError::Cancelled) => BuildResult::Cancelled,
        Err(e) => BuildResult::Failed {
            kind: e.kind().to_string(),
            message: e.to_string(),
        },
    };
    ctx.manifest
        .finish(final_result)
        .or_stage(|reason| BuildError::Io(std::io::Error::other(reason)))
}
