//! Build command - builds the station image.

use anyhow::{Context, Result};
use tracing::info;

use stationiso::build::{BuildContext, BuildOptions};
use stationiso::cache::DefaultTransport;
use stationiso::config::Config;
use stationiso::host::SystemHost;
use stationiso::interrupt::Interrupt;
use stationiso::pipeline::Pipeline;
use stationiso::preflight;
use stationiso::station::StationFile;
use stationiso::timing::{format_duration, Timer};

/// Execute the build command.
pub fn cmd_build(config: &Config, options: BuildOptions) -> Result<()> {
    println!("=== stationiso build ===\n");
    let timer = Timer::start("Build");

    preflight::run_preflight_or_fail(config, false)?;

    let station = StationFile::load(&config.station_file)?;
    println!(
        "Station {}, installer release: {}",
        station.station.id, options.release
    );
    if options.minimal {
        println!("Minimal build: embedding units are skipped");
    }

    let interrupt = Interrupt::install()?;
    let mut ctx = BuildContext::new(config.clone(), station, options, interrupt)
        .context("Failed to prepare build context")?;
    let host = SystemHost::new(ctx.log.clone(), ctx.interrupt.clone());

    let result = Pipeline::new(&host).run(&mut ctx, &DefaultTransport);

    println!();
    ctx.manifest.print_summary();
    let elapsed = timer.finish();

    let output = result?;
    println!("\n=== Build Complete ({}) ===", format_duration(elapsed));
    println!("  ISO:    {}", output.image.iso.display());
    println!("  SHA256: {}", output.image.sha256);
    if !output.summary.warnings.is_empty() {
        println!("\n  {} unit(s) finished with warnings:", output.summary.warnings.len());
        for warning in &output.summary.warnings {
            println!("    - {}", warning);
        }
    }
    if let Some(path) = ctx.manifest.path() {
        println!("  Manifest: {}", path.display());
    }
    info!(iso = %output.image.iso.display(), "Build finished");
    Ok(())
}
