//! Preflight checks for a station build.
//!
//! Verifies host tools, privileges, the station file and the working
//! directories before anything is downloaded or mounted. Run on its own with
//! `stationiso preflight`; `build` runs it first and refuses to start on a
//! failure.

mod environment;
mod host_tools;
mod types;

use crate::config::Config;
use crate::error::{BuildError, Result};

pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Run all preflight checks.
pub fn run_preflight(config: &Config) -> PreflightReport {
    let mut checks = Vec::new();

    println!("Running preflight checks...\n");

    println!("Checking host tools...");
    checks.extend(host_tools::check_host_tools());

    println!("Checking privileges...");
    checks.push(environment::check_privileges());

    println!("Checking station file...");
    checks.extend(environment::check_station(config));

    println!("Checking build environment...");
    checks.extend(environment::check_build_environment(config));

    println!();

    PreflightReport { checks }
}

/// Run preflight and fail with a prerequisite error on any failed check.
///
/// With `strict`, warnings count as failures too.
pub fn run_preflight_or_fail(config: &Config, strict: bool) -> Result<()> {
    let report = run_preflight(config);
    report.print();

    let blocking = report.blocking(strict);
    if !blocking.is_empty() {
        return Err(BuildError::prerequisite(format!(
            "{} preflight check(s) failed: {}",
            blocking.len(),
            blocking.join(", ")
        )));
    }

    println!("All preflight checks passed!\n");
    Ok(())
}
