use super::BASE_OVERLAY;
use crate::common::write_file_with_dirs;
use crate::component::{CustomizationUnit, Phase, Policy, UnitContext, UnitDescriptor, UnitReport};

const APT_CONF: &str = "etc/apt/apt.conf.d/99stationiso";

/// Periodic apt jobs stay off; stations update when the operator says so.
const APT_POLICY: &str = "\
APT::Periodic::Update-Package-Lists \"0\";
APT::Periodic::Download-Upgradeable-Packages \"0\";
APT::Periodic::AutocleanInterval \"0\";
APT::Periodic::Unattended-Upgrade \"0\";
";

pub struct PackagingUnit {
    desc: UnitDescriptor,
}

impl PackagingUnit {
    pub fn new() -> Self {
        Self {
            desc: UnitDescriptor::new("packaging", Phase::Packaging, Policy::Core)
                .writes([APT_CONF])
                .supersedes([BASE_OVERLAY]),
        }
    }
}

impl Default for PackagingUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl CustomizationUnit for PackagingUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    fn apply(&self, ctx: &UnitContext<'_>) -> anyhow::Result<UnitReport> {
        write_file_with_dirs(ctx.root.join(APT_CONF), APT_POLICY)?;
        Ok(UnitReport::default().note("periodic apt jobs disabled"))
    }
}
