//! Built-in customization units and the operator script unit.
//!
//! Every built-in that writes into the tree acknowledges `base-overlay`,
//! because the overlay may ship any file and the built-in's answer wins.

mod accounts;
mod app_config;
mod desktop;
mod extras;
mod identity;
mod network;
mod overlay;
mod packaging;
mod restore;
mod script;

pub use accounts::UserAccountUnit;
pub use app_config::{render_template, AppConfigUnit};
pub use desktop::DesktopBaselineUnit;
pub use extras::{DocumentationUnit, LicenseImportUnit};
pub use identity::IdentityUnit;
pub use network::{keyfile_escape, parse_keyfile, NetworkProfilesUnit, CONNECTIONS_DIR};
pub use overlay::BaseOverlayUnit;
pub use packaging::PackagingUnit;
pub use restore::{GoldenMasterRestoreUnit, RollingRestoreUnit, RESTORE_TARGET};
pub use script::ScriptUnit;

pub(crate) const BASE_OVERLAY: &str = "base-overlay";

/// Replace the first line for which `matches` is true with `line` and drop
/// any later matches; append `line` when nothing matched.
pub(crate) fn set_line(content: &str, line: &str, matches: impl Fn(&str) -> bool) -> String {
    let mut out = Vec::new();
    let mut placed = false;
    for existing in content.lines() {
        if matches(existing) {
            if !placed {
                out.push(line.to_string());
                placed = true;
            }
        } else {
            out.push(existing.to_string());
        }
    }
    if !placed {
        out.push(line.to_string());
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_line_replaces_commented_default() {
        let content = "A=1\n#EXTRA_GROUPS=\"x\"\nB=2\nEXTRA_GROUPS=\"y\"\n";
        let out = set_line(content, "EXTRA_GROUPS=\"z\"", |l| {
            l.trim_start_matches('#').starts_with("EXTRA_GROUPS=")
        });
        assert_eq!(out, "A=1\nEXTRA_GROUPS=\"z\"\nB=2\n");
    }

    #[test]
    fn test_set_line_appends_when_missing() {
        assert_eq!(set_line("", "X=1", |l| l.starts_with("X=")), "X=1\n");
    }
}
