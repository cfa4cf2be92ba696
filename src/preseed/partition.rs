//! Target disk layout and partition strategy resolution.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};
use crate::process::Cmd;

const GIB: u64 = 1024 * 1024 * 1024;

/// Label that marks a partition as a previous station root.
pub const STATION_LABEL: &str = "stationiso";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStrategy {
    /// Reuse one named partition; nothing else is touched.
    ExistingPartition,
    /// Wipe the whole target disk. Only when explicitly asked for.
    EntireDisk,
    /// Install into the largest free region (dual boot).
    FreeSpace,
    /// Inspect the target disk and pick the least destructive option.
    AutoDetect,
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartitionStrategy::ExistingPartition => "existing-partition",
            PartitionStrategy::EntireDisk => "entire-disk",
            PartitionStrategy::FreeSpace => "free-space",
            PartitionStrategy::AutoDetect => "auto-detect",
        })
    }
}

/// Concrete answer after auto-detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Existing { partition: String },
    FreeSpace,
    /// The disk has no partitions, so using all of it destroys nothing.
    EmptyDisk,
}

impl Resolution {
    pub fn strategy(&self) -> PartitionStrategy {
        match self {
            Resolution::Existing { .. } => PartitionStrategy::ExistingPartition,
            Resolution::FreeSpace => PartitionStrategy::FreeSpace,
            Resolution::EmptyDisk => PartitionStrategy::EntireDisk,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Device path, e.g. `/dev/sda3`.
    pub device: String,
    pub size_bytes: u64,
    pub fstype: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub disk: String,
    pub size_bytes: u64,
    pub partitions: Vec<PartitionInfo>,
}

#[derive(Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Deserialize)]
struct LsblkDevice {
    name: String,
    size: LsblkSize,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Older lsblk prints sizes as strings even with `-b`.
#[derive(Deserialize)]
#[serde(untagged)]
enum LsblkSize {
    Number(u64),
    Text(String),
}

impl LsblkSize {
    fn bytes(&self) -> Result<u64> {
        match self {
            LsblkSize::Number(n) => Ok(*n),
            LsblkSize::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| BuildError::preseed(format!("lsblk size '{}' is not a byte count", s))),
        }
    }
}

fn device_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/dev/{}", name)
    }
}

impl DiskLayout {
    /// Parse `lsblk -J -b -o NAME,SIZE,TYPE,FSTYPE,LABEL <disk>` output.
    pub fn parse_lsblk(json: &str) -> Result<Self> {
        let output: LsblkOutput = serde_json::from_str(json)
            .map_err(|e| BuildError::preseed(format!("unreadable lsblk output: {}", e)))?;
        let disk = output
            .blockdevices
            .into_iter()
            .find(|d| d.kind == "disk")
            .ok_or_else(|| BuildError::preseed("lsblk reported no disk".to_string()))?;

        let mut partitions = Vec::new();
        for child in disk.children.iter().filter(|c| c.kind == "part") {
            partitions.push(PartitionInfo {
                device: device_path(&child.name),
                size_bytes: child.size.bytes()?,
                fstype: child.fstype.clone(),
                label: child.label.clone(),
            });
        }
        Ok(Self {
            disk: device_path(&disk.name),
            size_bytes: disk.size.bytes()?,
            partitions,
        })
    }

    /// Read the layout of `disk` on this host.
    pub fn probe(disk: &str) -> Result<Self> {
        let result = Cmd::new("lsblk")
            .args(["-J", "-b", "-o", "NAME,SIZE,TYPE,FSTYPE,LABEL", disk])
            .error_msg(format!("Failed to inspect {}", disk))
            .run()
            .map_err(|e| BuildError::preseed(format!("{:#}", e)))?;
        Self::parse_lsblk(&result.stdout)
    }

    /// Bytes not covered by any partition.
    pub fn free_bytes(&self) -> u64 {
        let used: u64 = self.partitions.iter().map(|p| p.size_bytes).sum();
        self.size_bytes.saturating_sub(used)
    }

    /// Least destructive option that fits `min_root_gb`.
    ///
    /// A previous station root (labelled [`STATION_LABEL`]) comes first, then
    /// free space, then a disk with no partitions at all. Any other partition
    /// may hold user data and is never chosen, whatever its filesystem.
    pub fn resolve(&self, min_root_gb: u64) -> Result<Resolution> {
        let min = min_root_gb.saturating_mul(GIB);

        let reusable = self
            .partitions
            .iter()
            .find(|p| p.label.as_deref() == Some(STATION_LABEL) && p.size_bytes >= min);
        if let Some(part) = reusable {
            return Ok(Resolution::Existing {
                partition: part.device.clone(),
            });
        }
        if self.partitions.is_empty() && self.size_bytes >= min {
            return Ok(Resolution::EmptyDisk);
        }
        if !self.partitions.is_empty() && self.free_bytes() >= min {
            return Ok(Resolution::FreeSpace);
        }
        Err(BuildError::preseed(format!(
            "auto-detect found no safe place for a {} GiB root on {} ({} partition(s), {} GiB free); \
             choose a partition strategy explicitly",
            min_root_gb,
            self.disk,
            self.partitions.len(),
            self.free_bytes() / GIB
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUAL_BOOT: &str = r#"{
       "blockdevices": [
          {"name":"sda", "size":512110190592, "type":"disk", "fstype":null, "label":null,
             "children": [
                {"name":"sda1", "size":536870912, "type":"part", "fstype":"vfat", "label":"EFI"},
                {"name":"sda2", "size":214748364800, "type":"part", "fstype":"ntfs", "label":"Windows"}
             ]
          }
       ]
    }"#;

    #[test]
    fn test_parse_lsblk() {
        let layout = DiskLayout::parse_lsblk(DUAL_BOOT).unwrap();
        assert_eq!(layout.disk, "/dev/sda");
        assert_eq!(layout.partitions.len(), 2);
        assert_eq!(layout.partitions[1].device, "/dev/sda2");
        assert_eq!(layout.partitions[1].fstype.as_deref(), Some("ntfs"));
    }

    #[test]
    fn test_string_sizes_accepted() {
        let json = r#"{"blockdevices":[{"name":"vda","size":"107374182400","type":"disk"}]}"#;
        let layout = DiskLayout::parse_lsblk(json).unwrap();
        assert_eq!(layout.size_bytes, 100 * GIB);
        assert!(layout.partitions.is_empty());
    }

    #[test]
    fn test_free_space_preferred_over_foreign_partitions() {
        let layout = DiskLayout::parse_lsblk(DUAL_BOOT).unwrap();
        assert_eq!(layout.resolve(40).unwrap(), Resolution::FreeSpace);
    }

    #[test]
    fn test_existing_station_partition_preferred() {
        let mut layout = DiskLayout::parse_lsblk(DUAL_BOOT).unwrap();
        layout.partitions.push(PartitionInfo {
            device: "/dev/sda3".into(),
            size_bytes: 60 * GIB,
            fstype: Some("ext4".into()),
            label: Some(STATION_LABEL.into()),
        });
        assert_eq!(
            layout.resolve(40).unwrap(),
            Resolution::Existing {
                partition: "/dev/sda3".into()
            }
        );
    }

    #[test]
    fn test_unlabelled_ext4_data_is_never_reused() {
        let mut layout = DiskLayout {
            disk: "/dev/sda".into(),
            size_bytes: 500 * GIB,
            partitions: vec![PartitionInfo {
                device: "/dev/sda1".into(),
                size_bytes: 400 * GIB,
                fstype: Some("ext4".into()),
                label: Some("home-data".into()),
            }],
        };
        assert_eq!(layout.resolve(40).unwrap(), Resolution::FreeSpace);

        layout.partitions[0].size_bytes = 500 * GIB;
        let err = layout.resolve(40).unwrap_err();
        assert!(matches!(err, BuildError::Preseed { .. }));
    }

    #[test]
    fn test_empty_disk_is_used_whole() {
        let layout = DiskLayout {
            disk: "/dev/nvme0n1".into(),
            size_bytes: 256 * GIB,
            partitions: Vec::new(),
        };
        let resolution = layout.resolve(40).unwrap();
        assert_eq!(resolution, Resolution::EmptyDisk);
        assert_eq!(resolution.strategy(), PartitionStrategy::EntireDisk);
    }

    #[test]
    fn test_full_disk_is_an_error_not_a_wipe() {
        let layout = DiskLayout {
            disk: "/dev/sda".into(),
            size_bytes: 100 * GIB,
            partitions: vec![PartitionInfo {
                device: "/dev/sda1".into(),
                size_bytes: 100 * GIB,
                fstype: Some("ntfs".into()),
                label: None,
            }],
        };
        let err = layout.resolve(40).unwrap_err();
        assert!(matches!(err, BuildError::Preseed { .. }));
        assert_eq!(err.exit_code(), 8);
    }
}
