//! NetworkManager keyfile profiles, one per `[[network]]` entry.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use super::BASE_OVERLAY;
use crate::cache::sha256_hex;
use crate::common::files::file_mode;
use crate::common::write_file_mode;
use crate::component::{CustomizationUnit, Phase, Policy, UnitContext, UnitDescriptor, UnitReport};
use crate::station::{Addressing, NetworkEntry, Security, StationFile};

pub const CONNECTIONS_DIR: &str = "etc/NetworkManager/system-connections";

const PROFILE_PREFIX: &str = "stationiso-";
const PROFILE_SUFFIX: &str = ".nmconnection";
const PROFILE_MODE: u32 = 0o600;

/// Sections of a parsed keyfile, each a key → unescaped value map.
pub type Keyfile = BTreeMap<String, BTreeMap<String, String>>;

pub struct NetworkProfilesUnit {
    desc: UnitDescriptor,
}

impl NetworkProfilesUnit {
    pub fn new() -> Self {
        Self {
            desc: UnitDescriptor::new("networking", Phase::Network, Policy::Core)
                .writes([CONNECTIONS_DIR])
                .supersedes([BASE_OVERLAY]),
        }
    }
}

impl Default for NetworkProfilesUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl CustomizationUnit for NetworkProfilesUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    fn apply(&self, ctx: &UnitContext<'_>) -> Result<UnitReport> {
        let dir = ctx.root.join(CONNECTIONS_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut wanted = HashSet::new();
        let mut report = UnitReport::default();
        for net in &ctx.station.networks {
            let file_name = profile_file_name(&net.id);
            let path = dir.join(&file_name);
            write_file_mode(&path, render_profile(ctx.station, net), PROFILE_MODE)?;

            let mode = file_mode(&path)?;
            if mode != PROFILE_MODE {
                bail!(
                    "configuration error: {} has mode {:o}, NetworkManager requires {:o}",
                    path.display(),
                    mode,
                    PROFILE_MODE
                );
            }
            report = report.note(format!("{} ({})", file_name, net.ssid));
            wanted.insert(file_name);
        }

        for stale in stale_profiles(&dir, &wanted)? {
            fs::remove_file(dir.join(&stale))
                .with_context(|| format!("Failed to remove stale profile {}", stale))?;
            report = report.note(format!("removed {}", stale));
        }
        Ok(report)
    }
}

fn profile_file_name(id: &str) -> String {
    format!("{}{}{}", PROFILE_PREFIX, id, PROFILE_SUFFIX)
}

fn stale_profiles(dir: &Path, wanted: &HashSet<String>) -> Result<Vec<String>> {
    let mut stale = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with(PROFILE_PREFIX)
            && name.ends_with(PROFILE_SUFFIX)
            && !wanted.contains(&name)
        {
            stale.push(name);
        }
    }
    stale.sort();
    Ok(stale)
}

/// Stable UUID for a station/network pair, so rebuilds don't churn profiles.
fn connection_uuid(station_id: &str, network_id: &str) -> String {
    let hex = sha256_hex(format!("stationiso:{}:{}", station_id, network_id).as_bytes());
    let mut bytes: Vec<u8> = (0..16)
        .map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap_or(0))
        .collect();
    bytes[6] = (bytes[6] & 0x0f) | 0x50;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let mut out = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn render_profile(station: &StationFile, net: &NetworkEntry) -> String {
    let mut out = String::new();
    let ssid = keyfile_escape(&net.ssid, true);

    out.push_str("[connection]\n");
    let _ = writeln!(out, "id={}", ssid);
    let _ = writeln!(out, "uuid={}", connection_uuid(&station.station.id, &net.id));
    out.push_str("type=wifi\n");
    let _ = writeln!(out, "autoconnect={}", net.autoconnect);
    out.push('\n');

    out.push_str("[wifi]\nmode=infrastructure\n");
    let _ = writeln!(out, "ssid={}", ssid);
    if net.hidden {
        out.push_str("hidden=true\n");
    }
    out.push('\n');

    let key_mgmt = match net.security {
        Security::None => None,
        Security::WpaPsk => Some("wpa-psk"),
        Security::Sae => Some("sae"),
    };
    if let (Some(key_mgmt), Some(psk)) = (key_mgmt, &net.psk) {
        out.push_str("[wifi-security]\n");
        let _ = writeln!(out, "key-mgmt={}", key_mgmt);
        let _ = writeln!(out, "psk={}", keyfile_escape(psk, false));
        out.push('\n');
    }

    out.push_str("[ipv4]\n");
    match net.addressing {
        Addressing::Auto => out.push_str("method=auto\n"),
        Addressing::Manual => {
            out.push_str("method=manual\n");
            if let Some(address) = &net.address {
                match &net.gateway {
                    Some(gw) => {
                        let _ = writeln!(out, "address1={},{}", address, gw);
                    }
                    None => {
                        let _ = writeln!(out, "address1={}", address);
                    }
                }
            }
        }
    }
    if !net.dns.is_empty() {
        let _ = writeln!(out, "dns={};", net.dns.join(";"));
    }
    out.push('\n');

    out.push_str("[ipv6]\naddr-gen-mode=default\nmethod=auto\n");
    out
}

/// Escape a value with GLib keyfile rules.
///
/// `list_safe` also escapes `;`, which NetworkManager would otherwise read as
/// a list separator in SSIDs.
pub fn keyfile_escape(value: &str, list_safe: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            ' ' if i == 0 => out.push_str("\\s"),
            ';' if list_safe => out.push_str("\\;"),
            c => out.push(c),
        }
    }
    out
}

fn keyfile_unescape(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('s') => out.push(' '),
            Some(';') => out.push(';'),
            Some(other) => bail!("invalid escape '\\{}' in '{}'", other, value),
            None => bail!("trailing backslash in '{}'", value),
        }
    }
    Ok(out)
}

/// Parse a keyfile back into unescaped values.
pub fn parse_keyfile(content: &str) -> Result<Keyfile> {
    let mut sections = Keyfile::new();
    let mut current: Option<String> = None;

    for (n, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            sections.entry(name.to_string()).or_default();
            current = Some(name.to_string());
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            bail!("line {}: expected key=value", n + 1);
        };
        let Some(section) = &current else {
            bail!("line {}: key outside of a section", n + 1);
        };
        sections
            .entry(section.clone())
            .or_default()
            .insert(key.trim_end().to_string(), keyfile_unescape(value)?);
    }
    Ok(sections)
}
