//! Host tool availability checks.

use super::types::CheckResult;

/// (tool, package, purpose)
const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("xorriso", "xorriso", "extracts and rebuilds the ISO"),
    ("unsquashfs", "squashfs-tools", "unpacks the system image"),
    ("mksquashfs", "squashfs-tools", "repacks the system image"),
    ("mount", "util-linux", "binds special filesystems"),
    ("umount", "util-linux", "releases special filesystems"),
    ("chroot", "coreutils", "runs the installer inside the tree"),
    ("curl", "curl", "downloads the base image and installer"),
    ("tar", "tar", "unpacks the installer release"),
    ("md5sum", "coreutils", "regenerates md5sum.txt"),
];

const OPTIONAL_TOOLS: &[(&str, &str, &str)] = &[(
    "lsblk",
    "util-linux",
    "needed only when auto-detect probes a local disk",
)];

/// Check host tools are installed.
pub fn check_host_tools() -> Vec<CheckResult> {
    let mut results = Vec::new();
    for (tool, package, purpose) in REQUIRED_TOOLS {
        results.push(check_tool(tool, package, purpose, true));
    }
    for (tool, package, purpose) in OPTIONAL_TOOLS {
        results.push(check_tool(tool, package, purpose, false));
    }
    results
}

fn check_tool(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match which::which(tool) {
        Ok(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        Err(_) => {
            let msg = format!("Not found. Install '{}' ({})", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::CheckStatus;

    #[test]
    fn test_missing_required_tool_fails() {
        let result = check_tool("stationiso-no-such-tool", "nothing", "testing", true);
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.details.unwrap().contains("nothing"));
    }

    #[test]
    fn test_missing_optional_tool_warns() {
        let result = check_tool("stationiso-no-such-tool", "nothing", "testing", false);
        assert_eq!(result.status, CheckStatus::Warn);
    }

    #[test]
    fn test_present_tool_passes_with_path() {
        let result = check_tool("sh", "dash", "testing", true);
        assert_eq!(result.status, CheckStatus::Pass);
        assert!(result.details.unwrap().ends_with("/sh"));
    }
}
