//! Per-application configuration rendered from station templates.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use super::restore::RESTORE_TARGET;
use super::BASE_OVERLAY;
use crate::common::write_file_with_dirs;
use crate::component::{CustomizationUnit, Phase, Policy, UnitContext, UnitDescriptor, UnitReport};
use crate::station::StationFile;

const TEMPLATE_SUFFIX: &str = ".tmpl";

/// Renders `customize.templates` into the skeleton home.
///
/// Files ending in `.tmpl` have `{{station_id}}`, `{{hostname}}`,
/// `{{username}}` and `{{locale}}` substituted and lose the suffix; other
/// files are copied as they are. Runs after both restore units, so these
/// values win over restored state.
pub struct AppConfigUnit {
    desc: UnitDescriptor,
    templates: Option<PathBuf>,
}

impl AppConfigUnit {
    pub fn new(templates: Option<PathBuf>) -> Self {
        Self {
            desc: UnitDescriptor::new("app-config", Phase::FinalConfig, Policy::Core)
                .writes([RESTORE_TARGET])
                .supersedes([BASE_OVERLAY, "golden-master-restore", "rolling-restore"]),
            templates,
        }
    }
}

impl CustomizationUnit for AppConfigUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    fn apply(&self, ctx: &UnitContext<'_>) -> Result<UnitReport> {
        let Some(source) = &self.templates else {
            return Ok(UnitReport::default().note("no templates configured"));
        };
        let vars = variables(ctx.station)?;
        let dest = ctx.root.join(RESTORE_TARGET);

        let mut rendered = 0;
        for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(source)?.to_string_lossy().into_owned();

            if let Some(stripped) = rel.strip_suffix(TEMPLATE_SUFFIX) {
                let text = fs::read_to_string(entry.path())
                    .with_context(|| format!("Template {} is not UTF-8", entry.path().display()))?;
                let output = render_template(&text, &vars)
                    .with_context(|| format!("Failed to render {}", rel))?;
                write_file_with_dirs(dest.join(stripped), output)?;
            } else {
                let target = dest.join(&rel);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &target)
                    .with_context(|| format!("Failed to copy {}", rel))?;
            }
            rendered += 1;
        }
        Ok(UnitReport::default().note(format!("{} file(s) from {}", rendered, source.display())))
    }
}

fn variables(station: &StationFile) -> Result<Vec<(&'static str, String)>> {
    Ok(vec![
        ("station_id", station.station.id.clone()),
        ("hostname", station.hostname()?),
        ("username", station.preseed.username.clone()),
        ("locale", station.preseed.locale.clone()),
    ])
}

/// Substitute `{{name}}` placeholders. Unknown names are an error.
pub fn render_template(text: &str, vars: &[(&str, String)]) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            bail!("unterminated placeholder");
        };
        let name = after[..end].trim();
        match vars.iter().find(|(key, _)| *key == name) {
            Some((_, value)) => out.push_str(value),
            None => bail!("unknown placeholder '{{{{{}}}}}'", name),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::units::testing::Tree;
    use tempfile::TempDir;

    #[test]
    fn test_render_template() {
        let vars = vec![("hostname", "kt7run".to_string())];
        assert_eq!(render_template("host={{ hostname }}\n", &vars).unwrap(), "host=kt7run\n");
        assert_eq!(render_template("no placeholders", &vars).unwrap(), "no placeholders");
        assert!(render_template("{{nope}}", &vars).is_err());
        assert!(render_template("{{hostname", &vars).is_err());
    }

    #[test]
    fn test_templates_render_into_skel() {
        let templates = TempDir::new().unwrap();
        write_file_with_dirs(
            templates.path().join(".config/js8call/js8call.ini.tmpl"),
            "[Configuration]\nMyCall={{station_id}}\n",
        )
        .unwrap();
        write_file_with_dirs(templates.path().join(".config/flrig/flrig.prefs"), "xcvr=IC-7300\n").unwrap();

        let tree = Tree::new();
        let unit = AppConfigUnit::new(Some(templates.path().to_path_buf()));
        tree.assert_idempotent(&unit);

        assert_eq!(
            tree.read("etc/skel/.config/js8call/js8call.ini"),
            "[Configuration]\nMyCall=KT7RUN\n"
        );
        assert_eq!(tree.read("etc/skel/.config/flrig/flrig.prefs"), "xcvr=IC-7300\n");
        assert!(!tree.root().join("etc/skel/.config/js8call/js8call.ini.tmpl").exists());
    }
}
