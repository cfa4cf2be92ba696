//! Show command - displays information.

use anyhow::{bail, Result};

use stationiso::backup::{BackupStore, RestorePlan};
use stationiso::component::Registry;
use stationiso::config::Config;
use stationiso::manifest::BuildManifest;
use stationiso::station::StationFile;

/// Show target for the show command.
pub enum ShowTarget {
    /// Show configuration
    Config,
    /// Show customization units in apply order
    Registry,
    /// Show the last build manifest
    Manifest,
}

/// Execute the show command.
pub fn cmd_show(config: &Config, target: ShowTarget) -> Result<()> {
    match target {
        ShowTarget::Config => config.print(),
        ShowTarget::Registry => {
            let station = StationFile::load(&config.station_file)?;
            let plan = RestorePlan::empty(BackupStore::new(config.backup_dir()));
            let registry = Registry::standard(&station, plan)?;

            println!("{:<4} {:<28} {:<10} policy", "#", "unit", "phase");
            for (i, (name, phase, policy)) in registry.classification().iter().enumerate() {
                println!("{:<4} {:<28} {:<10} {}", i + 1, name, phase.to_string(), policy);
            }
            match registry.validate() {
                Ok(()) => println!("\nOrder OK ({} units)", registry.len()),
                Err(e) => {
                    println!("\n[FAIL] {}", e);
                    return Err(e.into());
                }
            }
        }
        ShowTarget::Manifest => {
            let path = config.manifest_file();
            if !path.exists() {
                bail!("No manifest at {}. Run 'stationiso build' first.", path.display());
            }
            BuildManifest::load(&path)?.print_summary();
        }
    }
    Ok(())
}
