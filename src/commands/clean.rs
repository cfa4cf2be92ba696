//! Clean command - removes build state.

use anyhow::Result;

use stationiso::build::BuildLog;
use stationiso::clean::{self, CleanTarget};
use stationiso::config::Config;
use stationiso::host::SystemHost;
use stationiso::interrupt::Interrupt;

/// Execute the clean command.
pub fn cmd_clean(config: &Config, target: CleanTarget) -> Result<()> {
    // Only used to look up mounts, so a fresh interrupt flag is enough.
    let log = BuildLog::open(&config.log_file())?;
    let host = SystemHost::new(log, Interrupt::new());
    clean::clean(config, &host, target)?;
    println!("Clean complete.");
    Ok(())
}
