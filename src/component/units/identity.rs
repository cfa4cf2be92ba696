use std::fs;

use super::{set_line, BASE_OVERLAY};
use crate::common::write_file_with_dirs;
use crate::component::{CustomizationUnit, Phase, Policy, UnitContext, UnitDescriptor, UnitReport};

const STATION_CONF: &str = "etc/stationiso/station.conf";

/// Hostname, `/etc/hosts` loopback entry and the station descriptor.
pub struct IdentityUnit {
    desc: UnitDescriptor,
}

impl IdentityUnit {
    pub fn new() -> Self {
        Self {
            desc: UnitDescriptor::new("identity", Phase::Identity, Policy::Core)
                .writes(["etc/hostname", "etc/hosts", STATION_CONF])
                .supersedes([BASE_OVERLAY]),
        }
    }
}

impl Default for IdentityUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl CustomizationUnit for IdentityUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    fn apply(&self, ctx: &UnitContext<'_>) -> anyhow::Result<UnitReport> {
        let hostname = ctx.station.hostname()?;
        write_file_with_dirs(ctx.root.join("etc/hostname"), format!("{}\n", hostname))?;

        let hosts_path = ctx.root.join("etc/hosts");
        let hosts = fs::read_to_string(&hosts_path)
            .unwrap_or_else(|_| "127.0.0.1\tlocalhost\n".to_string());
        let hosts = set_line(&hosts, &format!("127.0.1.1\t{}", hostname), |l| {
            l.split_whitespace().next() == Some("127.0.1.1")
        });
        write_file_with_dirs(&hosts_path, hosts)?;

        let mut conf = format!(
            "STATION_ID={}\nHOSTNAME={}\n",
            ctx.station.station.id, hostname
        );
        if let Some(description) = &ctx.station.station.description {
            conf.push_str(&format!("DESCRIPTION=\"{}\"\n", description.replace('"', "'")));
        }
        write_file_with_dirs(ctx.root.join(STATION_CONF), conf)?;

        Ok(UnitReport::default().note(format!("hostname {}", hostname)))
    }
}
