//! Releases command - lists installer releases.

use anyhow::Result;

use stationiso::cache::DefaultTransport;
use stationiso::config::Config;
use stationiso::release::{ReleaseCatalog, ReleaseSelector};
use stationiso::station::StationFile;

/// Execute the releases command.
pub fn cmd_releases(config: &Config) -> Result<()> {
    let repo = match &config.installer_repo {
        Some(repo) => repo.clone(),
        None => StationFile::load(&config.station_file)?.installer.repo,
    };
    let catalog = ReleaseCatalog::fetch(&DefaultTransport, &repo)?;

    let stable = catalog
        .select(&ReleaseSelector::Stable)
        .ok()
        .map(|r| r.tag_name.clone());

    println!("Releases of {}:", repo);
    for release in catalog.releases() {
        let marker = if stable.as_deref() == Some(release.tag_name.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            " {} {:<20} {:<12} {}",
            marker,
            release.tag_name,
            release.channel(),
            release.published_at.as_deref().unwrap_or("-")
        );
    }
    println!("\n* default for `stationiso build` (newest stable)");
    Ok(())
}
