//! Privilege, station file and working directory checks.

use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::host::parse_mountinfo;
use crate::process::Cmd;
use crate::station::StationFile;

use super::types::CheckResult;

/// The tree is mounted, chrooted and owned by root; nothing works without it.
pub fn check_privileges() -> CheckResult {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        CheckResult::pass_with("root privileges", "euid 0")
    } else {
        CheckResult::fail(
            "root privileges",
            &format!("running as euid {}; mount and chroot need root", euid),
        )
    }
}

/// Load the station file and check the files it points at.
pub fn check_station(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();
    let station = match StationFile::load(&config.station_file) {
        Ok(station) => station,
        Err(e) => {
            results.push(CheckResult::fail("station file", &e.to_string()));
            return results;
        }
    };
    let hostname = station.hostname().unwrap_or_default();
    results.push(CheckResult::pass_with(
        "station file",
        &format!("{} (hostname {})", station.station.id, hostname),
    ));

    // Core inputs fail the build; embedded extras only warn.
    let core = [
        ("customize.overlay", station.customize.overlay.as_deref()),
        ("customize.templates", station.customize.templates.as_deref()),
        ("desktop.wallpaper", station.desktop.wallpaper.as_deref()),
        ("preseed.layout_file", station.preseed.layout_file.as_deref()),
    ];
    for (field, path) in core {
        if let Some(path) = path {
            results.push(check_exists(field, path, true));
        }
    }
    for (field, path) in [
        ("customize.docs", station.customize.docs.as_deref()),
        ("customize.licenses", station.customize.licenses.as_deref()),
    ] {
        if let Some(path) = path {
            results.push(check_exists(field, path, false));
        }
    }
    for unit in &station.units {
        results.push(check_exists(&format!("unit {}", unit.name), &unit.script, true));
    }
    results
}

fn check_exists(name: &str, path: &Path, required: bool) -> CheckResult {
    if path.exists() {
        CheckResult::pass_with(name, &path.display().to_string())
    } else if required {
        CheckResult::fail(name, &format!("{} does not exist", path.display()))
    } else {
        CheckResult::warn(name, &format!("{} does not exist; unit will be recorded as failed", path.display()))
    }
}

/// Check build directories, leftover mounts and free space.
pub fn check_build_environment(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    for (name, dir) in [
        ("work dir", &config.work_dir),
        ("output dir", &config.output_dir),
        ("cache dir", &config.cache_dir),
    ] {
        results.push(check_writable(name, dir));
    }

    if let Ok(mountinfo) = fs::read_to_string("/proc/self/mountinfo") {
        let root = config
            .work_dir
            .canonicalize()
            .unwrap_or_else(|_| config.work_dir.clone());
        let stale = parse_mountinfo(&mountinfo, &root);
        if stale.is_empty() {
            results.push(CheckResult::pass("no stale mounts"));
        } else {
            let list: Vec<String> = stale.iter().map(|p| p.display().to_string()).collect();
            results.push(CheckResult::fail(
                "no stale mounts",
                &format!("still mounted: {}; unmount them first", list.join(", ")),
            ));
        }
    }

    // Unpacked desktop tree plus the old and new ISO.
    if let Ok(result) = Cmd::new("df")
        .args(["--output=avail", "-B1"])
        .arg_path(&config.work_dir)
        .allow_fail()
        .run()
    {
        let avail = result
            .stdout
            .lines()
            .nth(1)
            .and_then(|line| line.trim().parse::<u64>().ok());
        if let (true, Some(bytes)) = (result.success(), avail) {
            let free_gb = bytes / (1024 * 1024 * 1024);
            if free_gb < 25 {
                results.push(CheckResult::warn(
                    "disk space",
                    &format!("{}GB free in work dir - a build needs ~25GB", free_gb),
                ));
            } else {
                results.push(CheckResult::pass_with("disk space", &format!("{}GB free", free_gb)));
            }
        }
    }

    results
}

fn check_writable(name: &str, dir: &Path) -> CheckResult {
    if let Err(e) = fs::create_dir_all(dir) {
        return CheckResult::fail(name, &format!("Cannot create {}: {}", dir.display(), e));
    }
    let probe = dir.join(".preflight-test");
    match fs::write(&probe, "test") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            CheckResult::pass_with(name, &dir.display().to_string())
        }
        Err(e) => CheckResult::fail(name, &format!("Cannot write to {}: {}", dir.display(), e)),
    }
}
