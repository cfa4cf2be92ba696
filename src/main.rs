//! stationiso - customized installation images for amateur radio stations.
//!
//! Takes a stock desktop ISO, runs the station's installer release and
//! customization units inside its system image, writes a preseed for
//! unattended installation, and repacks everything into a bootable ISO.

mod commands;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use stationiso::build::BuildOptions;
use stationiso::clean::CleanTarget as CleanWhat;
use stationiso::config::Config;
use stationiso::error::exit_code_for;
use stationiso::release::ReleaseSelector;

use commands::backup::BackupAction;
use commands::show::ShowTarget as ShowWhat;

#[derive(Parser)]
#[command(name = "stationiso")]
#[command(version, about = "Station installation image builder")]
#[command(
    after_help = "QUICK START:\n  stationiso preflight  Check host tools and the station file\n  stationiso build      Build the station ISO\n  stationiso show manifest  What the last build did\n  stationiso clean      Remove the work tree"
)]
struct Cli {
    /// More output (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Trace level output, including child process commands
    #[arg(long, global = true)]
    debug: bool,

    /// Station file (default: ./station.toml or STATIONISO_STATION_FILE)
    #[arg(long, global = true)]
    station: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the station image (downloads artifacts automatically)
    #[command(group(ArgGroup::new("release").args(["stable", "latest", "tag"])))]
    Build {
        /// Use the newest stable installer release (default)
        #[arg(long)]
        stable: bool,
        /// Use the newest installer release, pre-releases included
        #[arg(long)]
        latest: bool,
        /// Use a specific installer release
        #[arg(long)]
        tag: Option<String>,
        /// Skip embedding units (documentation and similar payloads)
        #[arg(long)]
        minimal: bool,
        /// Wipe and reuse a work tree left by an earlier build
        #[arg(long)]
        reuse: bool,
    },

    /// List installer releases
    Releases,

    /// Fetch the base image and installer into the cache without building
    #[command(group(ArgGroup::new("release").args(["stable", "latest", "tag"])))]
    Download {
        #[arg(long)]
        stable: bool,
        #[arg(long)]
        latest: bool,
        #[arg(long)]
        tag: Option<String>,
    },

    /// Run preflight checks (verify all prerequisites before build)
    Preflight {
        /// Treat warnings as failures
        #[arg(long)]
        strict: bool,
    },

    /// Manage state backups
    Backup {
        #[command(subcommand)]
        action: BackupCommand,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Clean build state (default: work tree only)
    Clean {
        #[command(subcommand)]
        what: Option<CleanTarget>,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Capture a golden-master set from a reference home directory
    Golden {
        #[arg(long)]
        from: PathBuf,
    },
    /// List backup sets, newest first
    List,
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration
    Config,
    /// Show customization units in apply order
    Registry,
    /// Show the last build manifest
    Manifest,
}

#[derive(Subcommand)]
enum CleanTarget {
    /// Extracted tree and build log
    Work,
    /// Finished images and the manifest
    Output,
    /// Downloaded artifacts (backups are kept)
    Cache,
    /// Everything above
    All,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let base_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Error: cannot determine working directory: {}", e);
            return ExitCode::from(1);
        }
    };

    let mut config = Config::load(&base_dir);
    if let Some(station) = &cli.station {
        config.station_file = base_dir.join(station);
    }

    let log_file = matches!(cli.command, Commands::Build { .. }).then(|| config.log_file());
    if let Err(e) = init_tracing(cli.verbose, cli.debug, log_file.as_deref()) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }

    match run(cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn run(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Build {
            stable: _,
            latest,
            tag,
            minimal,
            reuse,
        } => commands::cmd_build(
            config,
            BuildOptions {
                release: ReleaseSelector::from_flags(latest, tag),
                minimal,
                reuse,
            },
        ),
        Commands::Releases => commands::cmd_releases(config),
        Commands::Download {
            stable: _,
            latest,
            tag,
        } => commands::cmd_download(config, ReleaseSelector::from_flags(latest, tag)),
        Commands::Preflight { strict } => commands::cmd_preflight(config, strict),
        Commands::Backup { action } => {
            let action = match action {
                BackupCommand::Golden { from } => BackupAction::Golden { from },
                BackupCommand::List => BackupAction::List,
            };
            commands::cmd_backup(config, action)
        }
        Commands::Show { what } => {
            let target = match what {
                ShowTarget::Config => ShowWhat::Config,
                ShowTarget::Registry => ShowWhat::Registry,
                ShowTarget::Manifest => ShowWhat::Manifest,
            };
            commands::cmd_show(config, target)
        }
        Commands::Clean { what } => {
            let target = match what {
                None | Some(CleanTarget::Work) => CleanWhat::Work,
                Some(CleanTarget::Output) => CleanWhat::Output,
                Some(CleanTarget::Cache) => CleanWhat::Cache,
                Some(CleanTarget::All) => CleanWhat::All,
            };
            commands::cmd_clean(config, target)
        }
    }
}

/// Console output at info (or `-v`/`--debug`), `RUST_LOG` wins when set.
/// Builds also get a plain-text copy in the build log.
fn init_tracing(verbose: bool, debug: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if debug {
        "trace"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let file = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(())
}
