use std::fmt::Write as _;
use std::fs;

use anyhow::{bail, Context};

use super::BASE_OVERLAY;
use crate::common::write_file_with_dirs;
use crate::component::{CustomizationUnit, Phase, Policy, UnitContext, UnitDescriptor, UnitReport};

const DCONF_PROFILE: &str = "etc/dconf/profile/user";
const DCONF_DB: &str = "etc/dconf/db/local.d/00-stationiso";
const BACKGROUNDS: &str = "usr/share/backgrounds/stationiso";

/// System dconf defaults: theme, icons, dark mode and wallpaper.
pub struct DesktopBaselineUnit {
    desc: UnitDescriptor,
}

impl DesktopBaselineUnit {
    pub fn new() -> Self {
        Self {
            desc: UnitDescriptor::new("desktop-baseline", Phase::Desktop, Policy::Core)
                .writes(["etc/dconf", BACKGROUNDS])
                .supersedes([BASE_OVERLAY]),
        }
    }
}

impl Default for DesktopBaselineUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl CustomizationUnit for DesktopBaselineUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    fn apply(&self, ctx: &UnitContext<'_>) -> anyhow::Result<UnitReport> {
        let desktop = &ctx.station.desktop;
        let mut report = UnitReport::default();

        write_file_with_dirs(ctx.root.join(DCONF_PROFILE), "user-db:user\nsystem-db:local\n")?;

        let mut db = String::from("[org/gnome/desktop/interface]\n");
        let _ = writeln!(db, "gtk-theme='{}'", desktop.gtk_theme);
        let _ = writeln!(db, "icon-theme='{}'", desktop.icon_theme);
        let scheme = if desktop.dark_mode { "prefer-dark" } else { "default" };
        let _ = writeln!(db, "color-scheme='{}'", scheme);

        if let Some(wallpaper) = &desktop.wallpaper {
            let name = wallpaper
                .file_name()
                .with_context(|| format!("Wallpaper {} has no file name", wallpaper.display()))?;
            let target = ctx.root.join(BACKGROUNDS).join(name);
            fs::create_dir_all(ctx.root.join(BACKGROUNDS))?;
            fs::copy(wallpaper, &target)
                .with_context(|| format!("Failed to copy wallpaper {}", wallpaper.display()))?;

            let uri = format!("file:///{}/{}", BACKGROUNDS, name.to_string_lossy());
            db.push_str("\n[org/gnome/desktop/background]\n");
            let _ = writeln!(db, "picture-uri='{}'", uri);
            let _ = writeln!(db, "picture-uri-dark='{}'", uri);
            report = report.note(format!("wallpaper {}", name.to_string_lossy()));
        }
        write_file_with_dirs(ctx.root.join(DCONF_DB), db)?;

        // Compile the database when the image ships dconf; otherwise it is
        // compiled on first boot.
        if ctx.root.join("usr/bin/dconf").exists() {
            let status = ctx.host.chroot(ctx.root, &["dconf", "update"], &[])?;
            if !status.success() {
                bail!("dconf update failed (exit code {})", status.code().unwrap_or(-1));
            }
            report = report.note("dconf database compiled");
        }

        Ok(report.note(format!("theme {} / {}", desktop.gtk_theme, desktop.icon_theme)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::units::testing::Tree;
    use crate::station::fixtures::STATION_TOML;
    use crate::station::StationFile;

    #[test]
    fn test_dconf_defaults() {
        let tree = Tree::new();
        tree.assert_idempotent(&DesktopBaselineUnit::new());

        let db = tree.read(DCONF_DB);
        assert!(db.contains("gtk-theme='Yaru-dark'"));
        assert!(db.contains("color-scheme='prefer-dark'"));
        assert!(!db.contains("picture-uri"));
        assert_eq!(tree.read(DCONF_PROFILE), "user-db:user\nsystem-db:local\n");
        assert!(!tree.host.called("chroot"));
    }

    #[test]
    fn test_wallpaper_copied_and_referenced() {
        let scratch = tempfile::TempDir::new().unwrap();
        let wallpaper = scratch.path().join("shack.png");
        fs::write(&wallpaper, "png").unwrap();

        let mut station = StationFile::parse(STATION_TOML).unwrap();
        station.desktop.wallpaper = Some(wallpaper);
        let tree = Tree::with_station(station);
        tree.apply(&DesktopBaselineUnit::new()).unwrap();

        assert_eq!(tree.read(&format!("{}/shack.png", BACKGROUNDS)), "png");
        assert!(tree
            .read(DCONF_DB)
            .contains("picture-uri='file:///usr/share/backgrounds/stationiso/shack.png'"));
    }
}
