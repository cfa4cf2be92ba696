use std::fs;

use anyhow::Context;

use super::{set_line, BASE_OVERLAY};
use crate::common::write_file_with_dirs;
use crate::component::{CustomizationUnit, Phase, Policy, UnitContext, UnitDescriptor, UnitReport};

const ADDUSER_CONF: &str = "etc/adduser.conf";

/// Group defaults for the account the installer creates.
pub struct UserAccountUnit {
    desc: UnitDescriptor,
}

impl UserAccountUnit {
    pub fn new() -> Self {
        Self {
            desc: UnitDescriptor::new("user-account", Phase::Accounts, Policy::Core)
                .writes([ADDUSER_CONF])
                .supersedes([BASE_OVERLAY]),
        }
    }
}

impl Default for UserAccountUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl CustomizationUnit for UserAccountUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    fn apply(&self, ctx: &UnitContext<'_>) -> anyhow::Result<UnitReport> {
        let path = ctx.root.join(ADDUSER_CONF);
        let conf = if path.exists() {
            fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?
        } else {
            String::new()
        };

        let groups = ctx.station.preseed.user_groups.join(" ");
        let conf = set_line(&conf, &format!("EXTRA_GROUPS=\"{}\"", groups), |l| {
            l.trim_start_matches('#').starts_with("EXTRA_GROUPS=")
        });
        let conf = set_line(&conf, "ADD_EXTRA_GROUPS=1", |l| {
            l.trim_start_matches('#').starts_with("ADD_EXTRA_GROUPS=")
        });
        write_file_with_dirs(&path, conf)?;

        Ok(UnitReport::default().note(format!(
            "{} joins: {}",
            ctx.station.preseed.username, groups
        )))
    }
}
