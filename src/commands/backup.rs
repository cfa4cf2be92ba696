//! Backup command - golden-master creation and listing.

use std::path::PathBuf;

use anyhow::{bail, Result};

use stationiso::backup::{BackupKind, BackupStore};
use stationiso::config::Config;
use stationiso::station::StationFile;

pub enum BackupAction {
    /// Capture a golden-master set from a reference home directory.
    Golden { from: PathBuf },
    List,
}

/// Execute the backup command.
pub fn cmd_backup(config: &Config, action: BackupAction) -> Result<()> {
    let store = BackupStore::new(config.backup_dir());
    match action {
        BackupAction::Golden { from } => {
            let station = StationFile::load(&config.station_file)?;
            if station.backup.paths.is_empty() {
                bail!("backup.paths is empty in {}", config.station_file.display());
            }
            if !from.is_dir() {
                bail!("{} is not a directory", from.display());
            }
            let set = store.create_golden(&from, &station.backup.paths)?;
            println!("Golden-master written: {}", set.archive.display());
        }
        BackupAction::List => {
            let last_good = store.last_good().map(|s| s.file_name());
            for kind in [BackupKind::GoldenMaster, BackupKind::Rolling] {
                let sets = store.list(kind)?;
                println!("{} ({}):", kind, sets.len());
                for set in sets {
                    let name = set.file_name();
                    let marker = if last_good.as_deref() == Some(name.as_str()) {
                        " (last good)"
                    } else {
                        ""
                    };
                    println!("  {}{}", name, marker);
                }
            }
        }
    }
    Ok(())
}
