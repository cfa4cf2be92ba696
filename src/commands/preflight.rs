//! Preflight command - runs preflight checks.

use anyhow::Result;

use stationiso::config::Config;
use stationiso::preflight;
use stationiso::BuildError;

/// Execute the preflight command.
///
/// Exits with the prerequisite code when any check fails (or, with
/// `strict`, when any check warns).
pub fn cmd_preflight(config: &Config, strict: bool) -> Result<()> {
    let report = preflight::run_preflight(config);
    report.print();

    let blocking = report.blocking(strict);
    if blocking.is_empty() {
        println!("All preflight checks passed!");
        return Ok(());
    }
    if !strict && report.warn_count() > 0 {
        println!("Warnings do not block a build. Use --strict to treat them as failures.");
    }
    Err(BuildError::prerequisite(format!(
        "{} preflight check(s) failed: {}",
        blocking.len(),
        blocking.join(", ")
    ))
    .into())
}
