//! Ordered unit registry with static ordering validation.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{info, warn};

use super::units;
use super::{CustomizationUnit, Phase, Policy, UnitContext, UnitDescriptor, UnitReport};
use crate::backup::RestorePlan;
use crate::error::{BuildError, Result};
use crate::interrupt::Interrupt;
use crate::manifest::{BuildManifest, Outcome};
use crate::station::StationFile;

/// Outcome of applying one unit.
#[derive(Debug)]
pub enum UnitResult {
    Applied(UnitReport),
    Failed(String),
    Skipped(&'static str),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Skip units flagged as embedding content.
    pub minimal: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    /// Deferrable units that failed.
    pub warnings: Vec<String>,
}

/// Explicit, ordered list of customization units.
#[derive(Default)]
pub struct Registry {
    units: Vec<Box<dyn CustomizationUnit>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in units followed by the station's script units.
    pub fn standard(station: &StationFile, plan: RestorePlan) -> Result<Self> {
        let mut registry = Self::new();
        registry.push(units::BaseOverlayUnit::new(station.customize.overlay.clone())?);
        registry.push(units::IdentityUnit::new());
        registry.push(units::NetworkProfilesUnit::new());
        registry.push(units::UserAccountUnit::new());
        registry.push(units::DesktopBaselineUnit::new());
        registry.push(units::PackagingUnit::new());
        registry.push(units::GoldenMasterRestoreUnit::new(plan.golden.clone()));
        registry.push(units::RollingRestoreUnit::new(plan));
        registry.push(units::AppConfigUnit::new(station.customize.templates.clone()));
        registry.push(units::DocumentationUnit::new(station.customize.docs.clone()));
        registry.push(units::LicenseImportUnit::new(station.customize.licenses.clone()));

        for entry in &station.units {
            registry.insert_by_phase(units::ScriptUnit::new(entry.clone()));
        }
        Ok(registry)
    }

    /// Append a unit at the end.
    pub fn push(&mut self, unit: impl CustomizationUnit + 'static) {
        self.units.push(Box::new(unit));
    }

    /// Insert after the last unit whose phase is not later than this one.
    pub fn insert_by_phase(&mut self, unit: impl CustomizationUnit + 'static) {
        let phase = unit.descriptor().phase;
        let index = self
            .units
            .iter()
            .rposition(|u| u.descriptor().phase <= phase)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.units.insert(index, Box::new(unit));
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn descriptors(&self) -> Vec<&UnitDescriptor> {
        self.units.iter().map(|u| u.descriptor()).collect()
    }

    /// `(name, phase, policy)` for every unit, in order.
    pub fn classification(&self) -> Vec<(String, Phase, Policy)> {
        self.units
            .iter()
            .map(|u| {
                let d = u.descriptor();
                (d.name.clone(), d.phase, d.policy)
            })
            .collect()
    }

    /// Statically check the declared order.
    pub fn validate(&self) -> Result<()> {
        validate_descriptors(&self.descriptors())
    }

    /// Apply one unit.
    pub fn apply(&self, unit: &dyn CustomizationUnit, ctx: &UnitContext<'_>) -> UnitResult {
        match unit.apply(ctx) {
            Ok(report) => UnitResult::Applied(report),
            Err(e) => UnitResult::Failed(format!("{:#}", e)),
        }
    }

    /// Validate, then apply every unit in order, recording each in `manifest`.
    ///
    /// A core failure stops here with `UnitFailure`; a deferrable failure is
    /// recorded and the next unit runs.
    pub fn apply_all(
        &self,
        ctx: &UnitContext<'_>,
        manifest: &mut BuildManifest,
        interrupt: &Interrupt,
        options: ApplyOptions,
    ) -> Result<ApplySummary> {
        self.validate()?;

        let mut summary = ApplySummary::default();
        for unit in &self.units {
            interrupt.check()?;
            let desc = unit.descriptor();
            let started = Instant::now();

            let result = if options.minimal && desc.embedding {
                UnitResult::Skipped("minimal build")
            } else {
                info!(unit = %desc.name, phase = %desc.phase, "Applying unit");
                self.apply(unit.as_ref(), ctx)
            };

            // A unit interrupted mid-run reports its child's failure; the
            // cancellation is what matters.
            if interrupt.is_cancelled() {
                manifest.record_unit(
                    &desc.name,
                    desc.phase,
                    desc.policy,
                    Outcome::Failed,
                    started.elapsed(),
                    Some("cancelled".to_string()),
                    Vec::new(),
                )
                .map_err(manifest_error)?;
                return Err(BuildError::Cancelled);
            }

            match result {
                UnitResult::Applied(report) => {
                    manifest
                        .record_unit(
                            &desc.name,
                            desc.phase,
                            desc.policy,
                            Outcome::Applied,
                            started.elapsed(),
                            None,
                            report.notes,
                        )
                        .map_err(manifest_error)?;
                    summary.applied.push(desc.name.clone());
                }
                UnitResult::Skipped(reason) => {
                    println!("  [SKIP] {} ({})", desc.name, reason);
                    manifest
                        .record_unit(
                            &desc.name,
                            desc.phase,
                            desc.policy,
                            Outcome::Skipped,
                            started.elapsed(),
                            None,
                            vec![reason.to_string()],
                        )
                        .map_err(manifest_error)?;
                    summary.skipped.push(desc.name.clone());
                }
                UnitResult::Failed(reason) => {
                    manifest
                        .record_unit(
                            &desc.name,
                            desc.phase,
                            desc.policy,
                            Outcome::Failed,
                            started.elapsed(),
                            Some(reason.clone()),
                            Vec::new(),
                        )
                        .map_err(manifest_error)?;
                    match desc.policy {
                        Policy::Core => return Err(BuildError::unit(&desc.name, reason)),
                        Policy::Deferrable => {
                            warn!(unit = %desc.name, "Deferrable unit failed: {}", reason);
                            println!("  [WARN] {} failed: {}", desc.name, reason);
                            summary.warnings.push(desc.name.clone());
                        }
                    }
                }
            }
        }
        Ok(summary)
    }
}

fn manifest_error(e: anyhow::Error) -> BuildError {
    BuildError::Io(std::io::Error::other(format!("{:#}", e)))
}

/// Ordering rules over a descriptor list.
///
/// - phases never decrease;
/// - names are unique;
/// - restore units come after every base-overlay unit;
/// - final-config units overlapping a restore unit come after it;
/// - overlapping writes are acknowledged by the later unit's `supersedes`,
///   and `supersedes` never names a unit that runs later.
pub fn validate_descriptors(descriptors: &[&UnitDescriptor]) -> Result<()> {
    let violation = |msg: String| Err(BuildError::ordering(msg));

    let mut positions: HashMap<&str, usize> = HashMap::new();
    for (i, desc) in descriptors.iter().enumerate() {
        if positions.insert(desc.name.as_str(), i).is_some() {
            return violation(format!("duplicate unit name '{}'", desc.name));
        }
    }

    for pair in descriptors.windows(2) {
        if pair[1].phase < pair[0].phase {
            return violation(format!(
                "'{}' (phase {}) is listed after '{}' (phase {})",
                pair[1].name, pair[1].phase, pair[0].name, pair[0].phase
            ));
        }
    }

    let last_base = descriptors.iter().rposition(|d| d.is_base_overlay());
    for (i, desc) in descriptors.iter().enumerate() {
        if !desc.is_restore() {
            continue;
        }
        if let Some(base) = last_base {
            if base > i {
                return violation(format!(
                    "restore unit '{}' runs before base overlay '{}'",
                    desc.name, descriptors[base].name
                ));
            }
        }
        for (j, other) in descriptors.iter().enumerate() {
            if other.is_final_config() && j < i && other.overlap_with(desc).is_some() {
                return violation(format!(
                    "final-config unit '{}' writes paths restored by '{}' but runs first",
                    other.name, desc.name
                ));
            }
        }
    }

    for (i, desc) in descriptors.iter().enumerate() {
        for name in &desc.supersedes {
            match positions.get(name.as_str()) {
                None => {
                    return violation(format!(
                        "'{}' supersedes unknown unit '{}'",
                        desc.name, name
                    ))
                }
                Some(&j) if j >= i => {
                    return violation(format!(
                        "'{}' supersedes '{}', which runs later",
                        desc.name, name
                    ))
                }
                Some(_) => {}
            }
        }

        for earlier in &descriptors[..i] {
            if let Some((mine, theirs)) = desc.overlap_with(earlier) {
                if !desc.supersedes.iter().any(|s| s == &earlier.name) {
                    return violation(format!(
                        "'{}' writes '{}' which overlaps '{}' from '{}'; declare supersedes = [\"{}\"] if intended",
                        desc.name, mine, theirs, earlier.name, earlier.name
                    ));
                }
            }
        }
    }

    Ok(())
}
