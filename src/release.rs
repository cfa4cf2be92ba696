//! Installer release catalog.
//!
//! Releases come from the GitHub releases API of the installer repository.
//! Drafts are never offered; the catalog is ordered newest first.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::Transport;
use crate::error::{BuildError, Result};

const API_BASE: &str = "https://api.github.com/repos";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    pub tarball_url: String,
    #[serde(default)]
    pub published_at: Option<String>,
}

impl Release {
    pub fn channel(&self) -> &'static str {
        if self.prerelease {
            "pre-release"
        } else {
            "stable"
        }
    }
}

/// Which release a build uses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReleaseSelector {
    /// Newest non-prerelease.
    #[default]
    Stable,
    /// Newest release of any kind.
    Latest,
    Tag(String),
}

impl ReleaseSelector {
    /// Map the mutually exclusive CLI flags to a selector.
    pub fn from_flags(latest: bool, tag: Option<String>) -> Self {
        match (latest, tag) {
            (_, Some(tag)) => ReleaseSelector::Tag(tag),
            (true, None) => ReleaseSelector::Latest,
            (false, None) => ReleaseSelector::Stable,
        }
    }
}

impl fmt::Display for ReleaseSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseSelector::Stable => f.write_str("stable"),
            ReleaseSelector::Latest => f.write_str("latest"),
            ReleaseSelector::Tag(tag) => write!(f, "tag {}", tag),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseCatalog {
    pub repo: String,
    releases: Vec<Release>,
}

impl ReleaseCatalog {
    /// Fetch the catalog for `owner/name`.
    pub fn fetch(transport: &dyn Transport, repo: &str) -> Result<Self> {
        let url = format!("{}/{}/releases?per_page=100", API_BASE, repo);
        debug!(url = %url, "Fetching release catalog");
        let body = transport.get_text(&url).map_err(|e| BuildError::Fetch {
            artifact: format!("release catalog for {}", repo),
            attempts: 1,
            reason: format!("{:#}", e),
        })?;
        Self::from_json(repo, &body)
    }

    pub fn from_json(repo: &str, json: &str) -> Result<Self> {
        let releases: Vec<Release> = serde_json::from_str(json).map_err(|e| BuildError::Fetch {
            artifact: format!("release catalog for {}", repo),
            attempts: 1,
            reason: format!("unexpected response: {}", e),
        })?;
        Ok(Self::from_releases(repo, releases))
    }

    pub fn from_releases(repo: &str, releases: Vec<Release>) -> Self {
        let mut releases: Vec<Release> = releases.into_iter().filter(|r| !r.draft).collect();
        // RFC 3339 timestamps sort lexically; undated releases go last.
        releases.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        Self {
            repo: repo.to_string(),
            releases,
        }
    }

    pub fn releases(&self) -> &[Release] {
        &self.releases
    }

    pub fn select(&self, selector: &ReleaseSelector) -> Result<&Release> {
        let found = match selector {
            ReleaseSelector::Stable => self.releases.iter().find(|r| !r.prerelease),
            ReleaseSelector::Latest => self.releases.first(),
            ReleaseSelector::Tag(tag) => self.releases.iter().find(|r| &r.tag_name == tag),
        };
        found.ok_or_else(|| {
            BuildError::config(format!(
                "no {} release of {} ({} release(s) available)",
                selector,
                self.repo,
                self.releases.len()
            ))
        })
    }
}
