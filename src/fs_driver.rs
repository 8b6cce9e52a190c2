//! Filesystem driver registry
//!
//! Each supported filesystem is described by a capability record: how
//! to mount it, how to format it, and which external tools write its
//! label and UUID. Probing and label/UUID reads go through blkid with
//! the cache disabled; writers are always spawned commands, never
//! linked libraries. A `nofs` driver exists as the mandatory fallback
//! for anything the probe cannot identify.

use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};

/// How a filesystem gets mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountCapability {
    /// mount(2) with the kernel driver named by `mount_name`.
    Native,
    /// An external `mount.<mount_name>` helper binary.
    External,
}

/// Capability record for one filesystem kind.
pub struct FsDriver {
    name: &'static str,
    tag: &'static str,
    mount: Option<(MountCapability, &'static str, &'static str)>,
    /// argv template; `{dev}` expands to the device path.
    format_cmd: Option<&'static [&'static str]>,
    /// argv template; `{dev}` and `{label}` expand.
    label_cmd: Option<&'static [&'static str]>,
    /// argv template; `{dev}` and `{uuid}` expand.
    uuid_cmd: Option<&'static [&'static str]>,
}

impl FsDriver {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Tag stored in the partition descriptor.
    pub fn wire_tag(&self) -> &'static str {
        self.tag
    }

    /// `None` means the filesystem cannot be mounted at all (swap,
    /// nofs); its partitions carry no payload.
    pub fn mount_capability(&self) -> Option<MountCapability> {
        self.mount.map(|(cap, _, _)| cap)
    }

    pub fn mount_name(&self) -> &'static str {
        self.mount.map(|(_, name, _)| name).unwrap_or("")
    }

    pub fn mount_options(&self) -> &'static str {
        self.mount.map(|(_, _, opts)| opts).unwrap_or("")
    }

    pub fn format_command(&self) -> Option<&'static [&'static str]> {
        self.format_cmd
    }

    pub fn supports_label(&self) -> bool {
        self.label_cmd.is_some()
    }

    pub fn supports_uuid(&self) -> bool {
        self.uuid_cmd.is_some()
    }

    /// Filesystem label, via blkid. Empty when absent or unreadable.
    pub fn read_label(&self, dev: &Path) -> String {
        blkid_value(dev, "LABEL").unwrap_or_default()
    }

    /// Filesystem UUID, via blkid. Empty when absent or unreadable.
    pub fn read_uuid(&self, dev: &Path) -> String {
        blkid_value(dev, "UUID").unwrap_or_default()
    }

    pub fn write_label(&self, dev: &Path, label: &str) -> Result<()> {
        let Some(template) = self.label_cmd else {
            return Ok(()); // silently skipped, matching read-side leniency
        };
        if label.is_empty() {
            return Ok(());
        }
        run_template(template, dev, label).map_err(|_| Error::WriteData(dev.display().to_string()))
    }

    pub fn write_uuid(&self, dev: &Path, uuid: &str) -> Result<()> {
        let Some(template) = self.uuid_cmd else {
            return Ok(());
        };
        if uuid.is_empty() {
            return Ok(());
        }
        run_template(template, dev, uuid).map_err(|_| Error::WriteData(dev.display().to_string()))
    }

    pub fn format(&self, dev: &Path) -> Result<()> {
        let Some(template) = self.format_cmd else {
            return Err(Error::Format(dev.to_path_buf()));
        };
        run_template(template, dev, "").map_err(|_| Error::Format(dev.to_path_buf()))
    }
}

/// Expand an argv template and run it, discarding output.
fn run_template(template: &[&str], dev: &Path, value: &str) -> std::io::Result<()> {
    let argv: Vec<String> = template
        .iter()
        .map(|arg| {
            arg.replace("{dev}", &dev.display().to_string())
                .replace("{label}", value)
                .replace("{uuid}", value)
        })
        .collect();
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if !status.success() {
        return Err(std::io::Error::other(format!(
            "{} exited with {status}",
            argv[0]
        )));
    }
    Ok(())
}

/// One blkid tag value for a device, cache disabled.
fn blkid_value(dev: &Path, tag: &str) -> Option<String> {
    let out = Command::new("blkid")
        .args(["-c", "/dev/null", "-o", "value", "-s", tag])
        .arg(dev)
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Probe the filesystem kind of a device. Returns the wire tag of the
/// matching driver, `"nofs"` when the probe yields nothing we know.
pub fn probe_tag(dev: &Path) -> &'static str {
    match blkid_value(dev, "TYPE") {
        Some(ty) => driver_for_blkid_type(&ty).wire_tag(),
        None => NOFS.wire_tag(),
    }
}

static EXT2: FsDriver = FsDriver {
    name: "Ext2",
    tag: "ext2",
    mount: Some((MountCapability::Native, "ext2", "")),
    format_cmd: Some(&["mke2fs", "-F", "-t", "ext2", "{dev}"]),
    label_cmd: Some(&["e2label", "{dev}", "{label}"]),
    uuid_cmd: Some(&["tune2fs", "-U", "{uuid}", "{dev}"]),
};

static EXT3: FsDriver = FsDriver {
    name: "Ext3",
    tag: "ext3",
    mount: Some((MountCapability::Native, "ext3", "")),
    format_cmd: Some(&["mke2fs", "-F", "-t", "ext3", "{dev}"]),
    label_cmd: Some(&["e2label", "{dev}", "{label}"]),
    uuid_cmd: Some(&["tune2fs", "-U", "{uuid}", "{dev}"]),
};

static EXT4: FsDriver = FsDriver {
    name: "Ext4",
    tag: "ext4",
    mount: Some((MountCapability::Native, "ext4", "")),
    format_cmd: Some(&["mke2fs", "-F", "-t", "ext4", "{dev}"]),
    label_cmd: Some(&["e2label", "{dev}", "{label}"]),
    uuid_cmd: Some(&["tune2fs", "-U", "{uuid}", "{dev}"]),
};

static FAT32: FsDriver = FsDriver {
    name: "Fat32",
    tag: "fat32",
    mount: Some((MountCapability::Native, "vfat", "")),
    format_cmd: Some(&["mkfs.vfat", "-F", "32", "{dev}"]),
    label_cmd: Some(&["fatlabel", "{dev}", "{label}"]),
    uuid_cmd: None,
};

static NTFS: FsDriver = FsDriver {
    name: "Ntfs",
    tag: "ntfs",
    mount: Some((MountCapability::External, "ntfs-3g", "")),
    format_cmd: Some(&["mkntfs", "-f", "{dev}"]),
    label_cmd: Some(&["ntfslabel", "{dev}", "{label}"]),
    uuid_cmd: None,
};

static XFS: FsDriver = FsDriver {
    name: "Xfs",
    tag: "xfs",
    mount: Some((MountCapability::Native, "xfs", "")),
    format_cmd: Some(&["mkfs.xfs", "-f", "{dev}"]),
    label_cmd: Some(&["xfs_admin", "-L", "{label}", "{dev}"]),
    uuid_cmd: Some(&["xfs_admin", "-U", "{uuid}", "{dev}"]),
};

static BTRFS: FsDriver = FsDriver {
    name: "Btrfs",
    tag: "btrfs",
    mount: Some((MountCapability::Native, "btrfs", "")),
    format_cmd: Some(&["mkfs.btrfs", "-f", "{dev}"]),
    label_cmd: Some(&["btrfs", "filesystem", "label", "{dev}", "{label}"]),
    uuid_cmd: Some(&["btrfstune", "-f", "-U", "{uuid}", "{dev}"]),
};

static REISERFS: FsDriver = FsDriver {
    name: "Reiserfs",
    tag: "reiserfs",
    mount: Some((MountCapability::Native, "reiserfs", "")),
    format_cmd: Some(&["mkreiserfs", "-q", "{dev}"]),
    label_cmd: Some(&["reiserfstune", "-l", "{label}", "{dev}"]),
    uuid_cmd: Some(&["reiserfstune", "-u", "{uuid}", "{dev}"]),
};

static JFS: FsDriver = FsDriver {
    name: "Jfs",
    tag: "jfs",
    mount: Some((MountCapability::Native, "jfs", "")),
    format_cmd: Some(&["jfs_mkfs", "-q", "{dev}"]),
    label_cmd: Some(&["jfs_tune", "-L", "{label}", "{dev}"]),
    uuid_cmd: Some(&["jfs_tune", "-U", "{uuid}", "{dev}"]),
};

static HFSPLUS: FsDriver = FsDriver {
    name: "HfsPlus",
    tag: "hfsp",
    mount: Some((MountCapability::Native, "hfsplus", "")),
    format_cmd: Some(&["mkfs.hfsplus", "{dev}"]),
    label_cmd: None,
    uuid_cmd: None,
};

static SWAP: FsDriver = FsDriver {
    name: "Swap",
    tag: "swap",
    mount: None,
    format_cmd: Some(&["mkswap", "{dev}"]),
    label_cmd: Some(&["swaplabel", "-L", "{label}", "{dev}"]),
    uuid_cmd: Some(&["swaplabel", "-U", "{uuid}", "{dev}"]),
};

static NOFS: FsDriver = FsDriver {
    name: "NoFs",
    tag: "nofs",
    mount: None,
    format_cmd: None,
    label_cmd: None,
    uuid_cmd: None,
};

static REGISTRY: &[&FsDriver] = &[
    &EXT2, &EXT3, &EXT4, &FAT32, &NTFS, &XFS, &BTRFS, &REISERFS, &JFS, &HFSPLUS, &SWAP, &NOFS,
];

/// Driver for a wire tag. Unknown tags get the `nofs` fallback.
pub fn driver_for_tag(tag: &str) -> &'static FsDriver {
    REGISTRY
        .iter()
        .find(|d| d.wire_tag() == tag)
        .copied()
        .unwrap_or(&NOFS)
}

/// Driver for a blkid TYPE value. blkid speaks `vfat` and `ntfs-3g`
/// dialects that differ from our wire tags.
fn driver_for_blkid_type(ty: &str) -> &'static FsDriver {
    match ty {
        "vfat" | "fat32" => &FAT32,
        "ntfs" | "ntfs-3g" => &NTFS,
        "swap" | "linux-swap" => &SWAP,
        "hfsplus" => &HFSPLUS,
        other => driver_for_tag(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_lookup_with_nofs_fallback() {
        assert_eq!(driver_for_tag("ext4").name(), "Ext4");
        assert_eq!(driver_for_tag("fat32").mount_name(), "vfat");
        assert_eq!(driver_for_tag("zfs").wire_tag(), "nofs");
        assert_eq!(driver_for_tag("").wire_tag(), "nofs");
    }

    #[test]
    fn blkid_dialect_mapping() {
        assert_eq!(driver_for_blkid_type("vfat").wire_tag(), "fat32");
        assert_eq!(driver_for_blkid_type("ntfs").wire_tag(), "ntfs");
        assert_eq!(driver_for_blkid_type("ext3").wire_tag(), "ext3");
        assert_eq!(driver_for_blkid_type("minix").wire_tag(), "nofs");
    }

    #[test]
    fn capabilities_match_the_driver_table() {
        assert_eq!(
            driver_for_tag("ntfs").mount_capability(),
            Some(MountCapability::External)
        );
        assert_eq!(
            driver_for_tag("ext4").mount_capability(),
            Some(MountCapability::Native)
        );
        assert_eq!(driver_for_tag("swap").mount_capability(), None);
        assert_eq!(driver_for_tag("nofs").mount_capability(), None);

        assert!(driver_for_tag("ext2").supports_uuid());
        assert!(!driver_for_tag("fat32").supports_uuid());
        assert!(!driver_for_tag("nofs").supports_label());
    }

    #[test]
    fn every_mountable_driver_names_its_mount() {
        for driver in REGISTRY {
            if driver.mount_capability().is_some() {
                assert!(!driver.mount_name().is_empty(), "{}", driver.name());
            }
        }
    }
}
