//! Download command - fills the artifact cache without building.

use anyhow::Result;

use stationiso::cache::DefaultTransport;
use stationiso::config::Config;
use stationiso::interrupt::Interrupt;
use stationiso::pipeline::fetch_artifacts;
use stationiso::release::ReleaseSelector;
use stationiso::station::StationFile;

/// Execute the download command.
pub fn cmd_download(config: &Config, selector: ReleaseSelector) -> Result<()> {
    let station = StationFile::load(&config.station_file)?;
    let interrupt = Interrupt::install()?;

    println!("Fetching artifacts into {}...", config.cache_dir.display());
    let inputs = fetch_artifacts(config, &station, &selector, &DefaultTransport, Some(interrupt))?;

    for artifact in [&inputs.base_image, &inputs.installer] {
        println!(
            "  [{}] {} {}",
            artifact.state, artifact.descriptor.name, artifact.descriptor.tag
        );
        println!("         {}", artifact.path.display());
        println!("         sha256 {}", artifact.sha256);
    }
    Ok(())
}
