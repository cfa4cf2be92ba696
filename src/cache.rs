//! Artifact cache: the base image and the installer package.
//!
//! Layout: `<cache>/<name>/<tag>/<file>` with a `<file>.sha256` pin next to
//! it. A cached file that matches its checksum is returned without touching
//! the network. A cached file that does not match is an integrity error,
//! never a silent re-download.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{BuildError, Result};
use crate::interrupt::Interrupt;
use crate::process::Cmd;
use crate::release::Release;
use crate::station::StationFile;

/// What to fetch and where it lives in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub url: String,
    pub tag: String,
    pub file_name: String,
    /// Expected sha256; when absent the first download's checksum is pinned.
    pub sha256: Option<String>,
}

impl ArtifactDescriptor {
    /// The station's base installation image.
    pub fn base_image(station: &StationFile) -> Self {
        let url = station.image.url.clone();
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("base.iso")
            .to_string();
        Self {
            name: "base-image".to_string(),
            tag: station.image.tag.clone(),
            file_name,
            url,
            sha256: station.image.sha256.clone(),
        }
    }

    /// The installer tarball for a resolved release.
    pub fn installer(station: &StationFile, release: &Release) -> Self {
        Self {
            name: "installer".to_string(),
            url: release.tarball_url.clone(),
            tag: release.tag_name.clone(),
            file_name: format!("{}.tar.gz", release.tag_name.replace('/', "_")),
            sha256: station.installer.sha256.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Already present and verified; no network access.
    Cached,
    Downloaded,
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchState::Cached => f.write_str("cached"),
            FetchState::Downloaded => f.write_str("downloaded"),
        }
    }
}

/// A verified file in the cache.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub descriptor: ArtifactDescriptor,
    pub path: PathBuf,
    pub sha256: String,
    pub state: FetchState,
}

/// How bytes get from a URL to disk.
pub trait Transport {
    fn download(&self, url: &str, dest: &Path) -> anyhow::Result<()>;

    fn get_text(&self, url: &str) -> anyhow::Result<String>;
}

/// Production transport backed by `curl`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurlTransport;

impl Transport for CurlTransport {
    fn download(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let status = Cmd::new("curl")
            .args(["-fL", "--retry", "0", "--progress-bar", "-o"])
            .arg_path(dest)
            .arg(url)
            .allow_fail()
            .run_interactive()?;
        if !status.success() {
            bail!("curl exited with code {}", status.code().unwrap_or(-1));
        }
        Ok(())
    }

    fn get_text(&self, url: &str) -> anyhow::Result<String> {
        let result = Cmd::new("curl")
            .args(["-fsSL", "-H", "Accept: application/vnd.github+json", url])
            .error_msg(format!("Failed to fetch {}", url))
            .run()?;
        Ok(result.stdout)
    }
}

/// Bounded retries with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct ArtifactCache<'a> {
    dir: PathBuf,
    transport: &'a dyn Transport,
    retry: RetryPolicy,
    interrupt: Option<Arc<Interrupt>>,
}

impl<'a> ArtifactCache<'a> {
    pub fn new(dir: impl Into<PathBuf>, transport: &'a dyn Transport) -> Self {
        Self {
            dir: dir.into(),
            transport,
            retry: RetryPolicy::default(),
            interrupt: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Arc<Interrupt>) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn transport(&self) -> &'a dyn Transport {
        self.transport
    }

    pub fn path_for(&self, desc: &ArtifactDescriptor) -> PathBuf {
        self.dir.join(&desc.name).join(&desc.tag).join(&desc.file_name)
    }

    /// Return the cached artifact, downloading it first if absent.
    pub fn fetch(&self, desc: &ArtifactDescriptor) -> Result<Artifact> {
        let path = self.path_for(desc);
        let pin = pin_path(&path);
        let expected = match &desc.sha256 {
            Some(sum) => Some(sum.to_ascii_lowercase()),
            None => read_pin(&pin)?,
        };

        if path.exists() {
            let actual = sha256_file(&path)?;
            if let Some(expected) = expected {
                if expected != actual {
                    return Err(BuildError::Integrity {
                        path,
                        expected,
                        actual,
                    });
                }
            } else {
                write_pin(&pin, &actual)?;
            }
            debug!(artifact = %desc.name, path = %path.display(), "Cache hit");
            return Ok(Artifact {
                descriptor: desc.clone(),
                path,
                sha256: actual,
                state: FetchState::Cached,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let part = part_path(&path);
        self.download_with_retry(desc, &part)?;

        let actual = sha256_file(&part)?;
        if let Some(expected) = expected {
            if expected != actual {
                let _ = fs::remove_file(&part);
                return Err(BuildError::Integrity {
                    path,
                    expected,
                    actual,
                });
            }
        }
        fs::rename(&part, &path)?;
        write_pin(&pin, &actual)?;
        info!(artifact = %desc.name, tag = %desc.tag, "Downloaded {}", desc.file_name);

        Ok(Artifact {
            descriptor: desc.clone(),
            path,
            sha256: actual,
            state: FetchState::Downloaded,
        })
    }

    fn download_with_retry(&self, desc: &ArtifactDescriptor, part: &Path) -> Result<()> {
        let mut last_error = String::new();
        for attempt in 1..=self.retry.attempts {
            if let Some(interrupt) = &self.interrupt {
                interrupt.check()?;
            }
            let _ = fs::remove_file(part);
            info!(artifact = %desc.name, attempt, "Downloading {}", desc.url);
            match self.transport.download(&desc.url, part) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = format!("{:#}", e);
                    warn!(artifact = %desc.name, attempt, "Download failed: {}", last_error);
                }
            }
            if attempt < self.retry.attempts {
                std::thread::sleep(self.retry.delay(attempt));
            }
        }
        let _ = fs::remove_file(part);
        Err(BuildError::Fetch {
            artifact: desc.name.clone(),
            attempts: self.retry.attempts,
            reason: last_error,
        })
    }
}

fn pin_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn read_pin(pin: &Path) -> Result<Option<String>> {
    if !pin.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(pin)?;
    Ok(content
        .split_whitespace()
        .next()
        .map(|s| s.to_ascii_lowercase()))
}

fn write_pin(pin: &Path, sum: &str) -> Result<()> {
    fs::write(pin, format!("{}\n", sum))?;
    Ok(())
}

/// Streamed sha256 of a file, lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Copy a local file into place as if it had been downloaded.
///
/// Lets `file://` URLs and pre-seeded images work without a network.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn download(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let source = url.strip_prefix("file://").unwrap_or(url);
        fs::copy(source, dest).with_context(|| format!("Failed to copy {}", source))?;
        Ok(())
    }

    fn get_text(&self, url: &str) -> anyhow::Result<String> {
        let source = url.strip_prefix("file://").unwrap_or(url);
        fs::read_to_string(source).with_context(|| format!("Failed to read {}", source))
    }
}

/// Routes `file://` URLs to [`LocalTransport`] and everything else to curl.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransport;

impl Transport for DefaultTransport {
    fn download(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        if url.starts_with("file://") {
            LocalTransport.download(url, dest)
        } else {
            CurlTransport.download(url, dest)
        }
    }

    fn get_text(&self, url: &str) -> anyhow::Result<String> {
        if url.starts_with("file://") {
            LocalTransport.get_text(url)
        } else {
            CurlTransport.get_text(url)
        }
    }
}
