//! CLI command handlers.
//!
//! Each submodule handles one `stationiso` subcommand:
//! - `build` - Build the station image
//! - `releases` - List installer releases
//! - `download` - Fetch artifacts into the cache
//! - `preflight` - Run preflight checks
//! - `backup` - Create and list state backups
//! - `show` - Display configuration, units or the last manifest
//! - `clean` - Remove build state

pub mod backup;
pub mod build;
pub mod clean;
pub mod download;
mod preflight;
pub mod releases;
pub mod show;

pub use backup::cmd_backup;
pub use build::cmd_build;
pub use clean::cmd_clean;
pub use download::cmd_download;
pub use preflight::cmd_preflight;
pub use releases::cmd_releases;
pub use show::cmd_show;
