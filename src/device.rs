//! Device inspector
//!
//! Turns a live disk into an image header plus partition descriptors:
//! geometry fractions from the partition library, filesystem identity
//! from a cache-less blkid probe, used bytes from a read-only scratch
//! mount. Probing is behind a small trait so the inspector itself can
//! be exercised against a fixture table.

use std::path::Path;

use crate::error::Result;
use crate::fs_driver::{self, FsDriver};
use crate::image::{ImageHeader, ImageType, LabelKind, PartFlags, PartType, PartitionDesc};
use crate::mounts::{Materializer, MountTable};
use crate::parted::PartitionTable;

pub trait Probe {
    /// Wire tag of the filesystem on `dev`; `"nofs"` when unknown.
    fn fs_tag(&self, dev: &Path) -> String;
    fn label(&self, dev: &Path, driver: &'static FsDriver) -> String;
    fn uuid(&self, dev: &Path, driver: &'static FsDriver) -> String;
    fn used_bytes(
        &self,
        mounts: &MountTable,
        driver: &'static FsDriver,
        dev: &Path,
        uuid: &str,
    ) -> Result<u64>;
}

/// Probe against the running system.
pub struct LiveProbe;

impl Probe for LiveProbe {
    fn fs_tag(&self, dev: &Path) -> String {
        fs_driver::probe_tag(dev).to_string()
    }

    fn label(&self, dev: &Path, driver: &'static FsDriver) -> String {
        driver.read_label(dev)
    }

    fn uuid(&self, dev: &Path, driver: &'static FsDriver) -> String {
        driver.read_uuid(dev)
    }

    fn used_bytes(
        &self,
        mounts: &MountTable,
        driver: &'static FsDriver,
        dev: &Path,
        uuid: &str,
    ) -> Result<u64> {
        Materializer::new(mounts, driver, dev, uuid).used_bytes()
    }
}

/// Describes a whole disk: header plus one descriptor per partition in
/// ascending partition-number order. `image_size` is left at zero; the
/// orchestrator fills it once the payload archives are sized.
pub fn inspect(
    table: &mut dyn PartitionTable,
    mounts: &MountTable,
    probe: &dyn Probe,
) -> Result<(ImageHeader, Vec<PartitionDesc>)> {
    table.open()?;
    let result = inspect_open(table, mounts, probe, None);
    table.close();
    result
}

/// Describes a single partition of the disk as a PARTITION image.
pub fn inspect_partition(
    table: &mut dyn PartitionTable,
    mounts: &MountTable,
    probe: &dyn Probe,
    part_num: u32,
) -> Result<(ImageHeader, Vec<PartitionDesc>)> {
    table.open()?;
    let result = inspect_open(table, mounts, probe, Some(part_num));
    table.close();
    result
}

fn inspect_open(
    table: &mut dyn PartitionTable,
    mounts: &MountTable,
    probe: &dyn Probe,
    only: Option<u32>,
) -> Result<(ImageHeader, Vec<PartitionDesc>)> {
    let disk_sectors = table.disk_length_sectors();
    let geometries: Vec<_> = table
        .partitions()
        .into_iter()
        .filter(|g| only.is_none_or(|n| g.num == n))
        .collect();

    let mut descs = Vec::with_capacity(geometries.len());
    for geom in &geometries {
        let tag = probe.fs_tag(&geom.path);
        let driver = fs_driver::driver_for_tag(&tag);

        let uuid = probe.uuid(&geom.path, driver);
        let label = probe.label(&geom.path, driver);

        let min_size = if geom.part_type == PartType::Extended
            || driver.mount_capability().is_none()
        {
            0
        } else {
            probe.used_bytes(mounts, driver, &geom.path, &uuid)?
        };

        let mut flags = PartFlags::default();
        for (flag, _) in PartFlags::known() {
            if table.get_flag(geom.num, *flag)? {
                flags.set(*flag, true);
            }
        }

        descs.push(PartitionDesc {
            part_type: geom.part_type,
            flags,
            min_size,
            start_pos: geom.start_sector as f64 / disk_sectors as f64,
            used_part: geom.length_sectors as f64 / disk_sectors as f64,
            fs_tag: driver.wire_tag().to_string(),
            label,
            uuid,
        });
    }

    let header = ImageHeader {
        image_type: if only.is_some() {
            ImageType::Partition
        } else {
            ImageType::Disk
        },
        label_kind: if only.is_some() {
            LabelKind::None
        } else {
            table.label_kind()
        },
        partition_count: descs.len() as u8,
        image_size: 0,
    };
    Ok((header, descs))
}

/// Partition number from a device path, e.g. `/dev/sda3` → 3,
/// `/dev/nvme0n1p2` → 2. `None` for whole disks.
pub fn partition_number(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() || digits.len() == name.len() {
        return None;
    }
    // nvme0n1-style names end in a digit without being partitions; a
    // partition name always has a 'p' or letter before the number run.
    let stem = &name[..name.len() - digits.len()];
    if stem.ends_with('n') && stem.starts_with("nvme") {
        return None;
    }
    digits.parse().ok()
}

/// Whether the path names a whole disk rather than one partition.
/// Prefers the kernel's answer; falls back to name parsing when the
/// device is not present in sysfs.
pub fn is_whole_disk(path: &Path) -> bool {
    if let Some(name) = path.file_name() {
        let sys = Path::new("/sys/class/block").join(name);
        if sys.exists() {
            return !sys.join("partition").exists();
        }
    }
    partition_number(path).is_none()
}

/// The disk a partition belongs to: `/dev/sda3` → `/dev/sda`,
/// `/dev/nvme0n1p2` → `/dev/nvme0n1`. Whole disks map to themselves.
pub fn disk_path_of(path: &Path) -> std::path::PathBuf {
    if partition_number(path).is_none() {
        return path.to_path_buf();
    }
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return path.to_path_buf(),
    };
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    // nvme/mmcblk-style names separate the partition number with 'p'.
    let stem = match trimmed.strip_suffix('p') {
        Some(base) if base.ends_with(|c: char| c.is_ascii_digit()) => base,
        _ => trimmed,
    };
    path.with_file_name(stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parted::{MemDisk, PartGeometry};
    use std::collections::HashMap;
    use std::path::PathBuf;

    struct StubProbe {
        tags: HashMap<PathBuf, &'static str>,
        used: HashMap<PathBuf, u64>,
    }

    impl Probe for StubProbe {
        fn fs_tag(&self, dev: &Path) -> String {
            self.tags.get(dev).copied().unwrap_or("nofs").to_string()
        }
        fn label(&self, _dev: &Path, _driver: &'static FsDriver) -> String {
            "rootfs".into()
        }
        fn uuid(&self, _dev: &Path, _driver: &'static FsDriver) -> String {
            "0f0f-1111".into()
        }
        fn used_bytes(
            &self,
            _mounts: &MountTable,
            _driver: &'static FsDriver,
            dev: &Path,
            _uuid: &str,
        ) -> Result<u64> {
            Ok(*self.used.get(dev).unwrap_or(&0))
        }
    }

    fn mounts() -> MountTable {
        MountTable::new()
    }

    #[test]
    fn half_disk_partition_yields_expected_fractions() {
        // 1,048,576-sector disk; one ext4 partition at sector 2048
        // covering exactly half the disk, boot flag set.
        let mut disk = MemDisk::new(LabelKind::Mbr, 1_048_576);
        disk.push(
            PartGeometry {
                num: 1,
                path: PathBuf::from("/dev/fixture1"),
                part_type: PartType::Primary,
                start_sector: 2048,
                length_sectors: 524_288,
            },
            PartFlags::BOOT,
        );
        let probe = StubProbe {
            tags: [(PathBuf::from("/dev/fixture1"), "ext4")].into(),
            used: [(PathBuf::from("/dev/fixture1"), 10 * 1024 * 1024)].into(),
        };

        let (header, descs) = inspect(&mut disk, &mounts(), &probe).unwrap();
        assert_eq!(header.image_type, ImageType::Disk);
        assert_eq!(header.label_kind, LabelKind::Mbr);
        assert_eq!(header.partition_count, 1);

        let d = &descs[0];
        assert_eq!(d.start_pos, 0.001953125);
        assert_eq!(d.used_part, 0.5);
        assert_eq!(d.flags.0, PartFlags::BOOT);
        assert_eq!(d.fs_tag, "ext4");
        assert_eq!(d.min_size, 10 * 1024 * 1024);
    }

    #[test]
    fn unprobable_partitions_become_nofs_with_zero_size() {
        let mut disk = MemDisk::new(LabelKind::Mbr, 1 << 21);
        disk.push(
            PartGeometry {
                num: 1,
                path: PathBuf::from("/dev/fixture1"),
                part_type: PartType::Primary,
                start_sector: 2048,
                length_sectors: 4096,
            },
            0,
        );
        let probe = StubProbe {
            tags: HashMap::new(),
            used: [(PathBuf::from("/dev/fixture1"), 999)].into(),
        };

        let (_, descs) = inspect(&mut disk, &mounts(), &probe).unwrap();
        assert_eq!(descs[0].fs_tag, "nofs");
        assert_eq!(descs[0].min_size, 0, "nofs partitions report zero used bytes");
    }

    #[test]
    fn descriptors_come_out_in_partition_order() {
        let mut disk = MemDisk::new(LabelKind::Gpt, 1 << 22);
        for num in [3u32, 1, 2] {
            disk.push(
                PartGeometry {
                    num,
                    path: PathBuf::from(format!("/dev/fixture{num}")),
                    part_type: PartType::Primary,
                    start_sector: 2048 * num as u64,
                    length_sectors: 1024,
                },
                0,
            );
        }
        let probe = StubProbe {
            tags: HashMap::new(),
            used: HashMap::new(),
        };
        let (header, descs) = inspect(&mut disk, &mounts(), &probe).unwrap();
        assert_eq!(header.partition_count, 3);
        let starts: Vec<u64> = descs
            .iter()
            .map(|d| (d.start_pos * (1u64 << 22) as f64) as u64)
            .collect();
        assert_eq!(starts, vec![2048, 4096, 6144]);
    }

    #[test]
    fn disk_with_no_usable_partitions() {
        let mut disk = MemDisk::new(LabelKind::Gpt, 1 << 20);
        let probe = StubProbe {
            tags: HashMap::new(),
            used: HashMap::new(),
        };
        let (header, descs) = inspect(&mut disk, &mounts(), &probe).unwrap();
        assert_eq!(header.partition_count, 0);
        assert!(descs.is_empty());
    }

    #[test]
    fn single_partition_mode() {
        let mut disk = MemDisk::new(LabelKind::Mbr, 1 << 21);
        for num in [1u32, 2] {
            disk.push(
                PartGeometry {
                    num,
                    path: PathBuf::from(format!("/dev/fixture{num}")),
                    part_type: PartType::Primary,
                    start_sector: 2048 * num as u64,
                    length_sectors: 1024,
                },
                0,
            );
        }
        let probe = StubProbe {
            tags: [(PathBuf::from("/dev/fixture2"), "ext2")].into(),
            used: [(PathBuf::from("/dev/fixture2"), 4096)].into(),
        };
        let (header, descs) = inspect_partition(&mut disk, &mounts(), &probe, 2).unwrap();
        assert_eq!(header.image_type, ImageType::Partition);
        assert_eq!(header.partition_count, 1);
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].fs_tag, "ext2");
    }

    #[test]
    fn partition_numbers_from_device_names() {
        assert_eq!(partition_number(Path::new("/dev/sda3")), Some(3));
        assert_eq!(partition_number(Path::new("/dev/nvme0n1p2")), Some(2));
        assert_eq!(partition_number(Path::new("/dev/sda")), None);
        assert_eq!(partition_number(Path::new("/dev/nvme0n1")), None);
    }

    #[test]
    fn partitions_map_back_to_their_disk() {
        assert_eq!(
            disk_path_of(Path::new("/dev/sda3")),
            Path::new("/dev/sda")
        );
        assert_eq!(
            disk_path_of(Path::new("/dev/nvme0n1p2")),
            Path::new("/dev/nvme0n1")
        );
        assert_eq!(disk_path_of(Path::new("/dev/sda")), Path::new("/dev/sda"));
    }
}
