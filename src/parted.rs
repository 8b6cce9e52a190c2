//! Partition-library facade
//!
//! Table manipulation is an external collaborator: the rest of the
//! crate only sees the `PartitionTable` trait. The shipped Linux
//! implementation reads geometry from sysfs and drives `sfdisk` /
//! `parted` for writes; tests substitute [`MemDisk`].
//!
//! Handles are reference-counted: `open` calls nest, the table is
//! loaded on the first and stays cached until the matching `close`.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{Error, Result};
use crate::image::{LabelKind, PartFlags, PartType};

/// Geometry of one partition as the library reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartGeometry {
    /// Partition number, 1-based.
    pub num: u32,
    pub path: PathBuf,
    pub part_type: PartType,
    pub start_sector: u64,
    pub length_sectors: u64,
}

/// A partition to be created when writing a table.
#[derive(Debug, Clone)]
pub struct PlannedPartition {
    pub num: u32,
    pub part_type: PartType,
    pub start_sector: u64,
    pub length_sectors: u64,
    pub fs_tag: String,
}

pub trait PartitionTable {
    /// Nested opens are counted; the first one loads the table.
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    /// Flush pending changes to the kernel's view of the disk.
    fn commit(&mut self) -> Result<()>;

    fn disk_path(&self) -> &Path;
    fn label_kind(&self) -> LabelKind;
    fn disk_length_sectors(&self) -> u64;
    fn sector_size(&self) -> u64;

    /// All partitions in ascending partition-number order.
    fn partitions(&self) -> Vec<PartGeometry>;
    fn partition(&self, num: u32) -> Result<PartGeometry>;

    fn is_flag_available(&self, num: u32, flag: u16) -> bool;
    fn get_flag(&self, num: u32, flag: u16) -> Result<bool>;
    fn set_flag(&mut self, num: u32, flag: u16, value: bool) -> Result<()>;

    fn write_table(&mut self, label: LabelKind, parts: &[PlannedPartition]) -> Result<()>;
}

pub fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// parted's name for each of our flag bits.
fn parted_flag_name(flag: u16) -> Option<&'static str> {
    Some(match flag {
        PartFlags::BOOT => "boot",
        PartFlags::ROOT => "root",
        PartFlags::SWAP => "swap",
        PartFlags::HIDDEN => "hidden",
        PartFlags::RAID => "raid",
        PartFlags::LVM => "lvm",
        PartFlags::LBA => "lba",
        PartFlags::HPSERVICE => "hp-service",
        PartFlags::PALO => "palo",
        PartFlags::PREP => "prep",
        PartFlags::MSFT_RESERVED => "msftres",
        PartFlags::BIOS_GRUB => "bios_grub",
        PartFlags::APPLE_TV_RECOVERY => "atvrecv",
        PartFlags::DIAG => "diag",
        _ => return None,
    })
}

/// Flags each label kind can represent.
fn flags_for_label(label: LabelKind) -> u16 {
    match label {
        LabelKind::Mbr => {
            PartFlags::BOOT
                | PartFlags::HIDDEN
                | PartFlags::RAID
                | PartFlags::LVM
                | PartFlags::LBA
                | PartFlags::PALO
                | PartFlags::PREP
                | PartFlags::DIAG
        }
        LabelKind::Gpt => {
            PartFlags::BOOT
                | PartFlags::ROOT
                | PartFlags::SWAP
                | PartFlags::HIDDEN
                | PartFlags::RAID
                | PartFlags::LVM
                | PartFlags::HPSERVICE
                | PartFlags::PREP
                | PartFlags::MSFT_RESERVED
                | PartFlags::BIOS_GRUB
                | PartFlags::APPLE_TV_RECOVERY
                | PartFlags::DIAG
        }
        LabelKind::None => 0,
    }
}

/// Linux implementation over sysfs + sfdisk/parted.
pub struct SysDisk {
    path: PathBuf,
    open_count: usize,
    label: LabelKind,
    sectors: u64,
    sector_size: u64,
    parts: Vec<PartGeometry>,
    flags: HashMap<u32, u16>,
}

impl SysDisk {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !is_block_device(&path) {
            return Err(Error::NoBlockDevice(path));
        }
        Ok(SysDisk {
            path,
            open_count: 0,
            label: LabelKind::None,
            sectors: 0,
            sector_size: 512,
            parts: Vec::new(),
            flags: HashMap::new(),
        })
    }

    fn sys_dir(&self) -> Result<PathBuf> {
        let name = self
            .path
            .file_name()
            .ok_or_else(|| Error::NoBlockDevice(self.path.clone()))?;
        Ok(Path::new("/sys/class/block").join(name))
    }

    fn load(&mut self) -> Result<()> {
        let sys = self.sys_dir()?;
        // sysfs "size" is always in 512-byte units.
        self.sectors = read_sys_u64(&sys.join("size"))?;
        self.sector_size = read_sys_u64(&sys.join("queue/logical_block_size")).unwrap_or(512);
        self.label = probe_label_kind(&self.path);
        self.parts = self.scan_partitions(&sys)?;
        self.flags = self.scan_flags();
        Ok(())
    }

    fn scan_partitions(&self, sys: &Path) -> Result<Vec<PartGeometry>> {
        let mut parts = Vec::new();
        let entries =
            fs::read_dir(sys).map_err(|_| Error::NoBlockDevice(self.path.clone()))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let part_dir = entry.path();
            let num_file = part_dir.join("partition");
            if !num_file.exists() {
                continue;
            }
            let num = read_sys_u64(&num_file)? as u32;
            let start_sector = read_sys_u64(&part_dir.join("start"))?;
            let length_sectors = read_sys_u64(&part_dir.join("size"))?;
            let part_name = part_dir.file_name().unwrap().to_string_lossy().to_string();
            // MBR extended containers surface in sysfs with a 1-2
            // sector length; numbers from 5 up are logical.
            let part_type = if self.label == LabelKind::Mbr && num >= 5 {
                PartType::Logical
            } else if self.label == LabelKind::Mbr && length_sectors <= 2 {
                PartType::Extended
            } else {
                PartType::Primary
            };
            parts.push(PartGeometry {
                num,
                path: self.path.with_file_name(&part_name),
                part_type,
                start_sector,
                length_sectors,
            });
        }
        parts.sort_by_key(|p| p.num);
        Ok(parts)
    }

    /// Flag bits per partition, parsed from `parted -ms print`.
    fn scan_flags(&self) -> HashMap<u32, u16> {
        let mut out = HashMap::new();
        let Ok(output) = Command::new("parted")
            .args(["-ms", &self.path.display().to_string(), "print"])
            .stderr(Stdio::null())
            .output()
        else {
            return out;
        };
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let line = line.trim_end_matches(';');
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                continue;
            }
            let Ok(num) = fields[0].parse::<u32>() else {
                continue;
            };
            let mut bits = 0u16;
            for name in fields[6].split(',').map(str::trim) {
                for (flag, _) in PartFlags::known() {
                    if parted_flag_name(*flag) == Some(name) {
                        bits |= flag;
                    }
                }
            }
            out.insert(num, bits);
        }
        out
    }
}

fn read_sys_u64(path: &Path) -> Result<u64> {
    fs::read_to_string(path)
        .map_err(|_| Error::FileNotFound(path.to_path_buf()))?
        .trim()
        .parse()
        .map_err(|_| Error::ReadData(path.display().to_string()))
}

fn probe_label_kind(dev: &Path) -> LabelKind {
    let Ok(out) = Command::new("blkid")
        .args(["-c", "/dev/null", "-o", "value", "-s", "PTTYPE"])
        .arg(dev)
        .stderr(Stdio::null())
        .output()
    else {
        return LabelKind::None;
    };
    match String::from_utf8_lossy(&out.stdout).trim() {
        "dos" => LabelKind::Mbr,
        "gpt" => LabelKind::Gpt,
        _ => LabelKind::None,
    }
}

/// MBR partition id / GPT type GUID for an sfdisk script line.
fn sfdisk_type(label: LabelKind, part_type: PartType, fs_tag: &str) -> &'static str {
    match label {
        LabelKind::Gpt => match fs_tag {
            "swap" => "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F",
            "ntfs" | "fat32" => "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7",
            _ => "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
        },
        _ => match part_type {
            PartType::Extended => "5",
            _ => match fs_tag {
                "swap" => "82",
                "ntfs" => "7",
                "fat32" => "c",
                _ => "83",
            },
        },
    }
}

impl PartitionTable for SysDisk {
    fn open(&mut self) -> Result<()> {
        if self.open_count == 0 {
            self.load()?;
        }
        self.open_count += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.open_count = self.open_count.saturating_sub(1);
    }

    fn commit(&mut self) -> Result<()> {
        unsafe { libc::sync() };
        let _ = Command::new("udevadm")
            .arg("settle")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if self.open_count > 0 {
            self.load()?;
        }
        Ok(())
    }

    fn disk_path(&self) -> &Path {
        &self.path
    }

    fn label_kind(&self) -> LabelKind {
        self.label
    }

    fn disk_length_sectors(&self) -> u64 {
        self.sectors
    }

    fn sector_size(&self) -> u64 {
        self.sector_size
    }

    fn partitions(&self) -> Vec<PartGeometry> {
        self.parts.clone()
    }

    fn partition(&self, num: u32) -> Result<PartGeometry> {
        self.parts
            .iter()
            .find(|p| p.num == num)
            .cloned()
            .ok_or_else(|| Error::NoBlockDevice(self.path.join(num.to_string())))
    }

    fn is_flag_available(&self, _num: u32, flag: u16) -> bool {
        flags_for_label(self.label) & flag != 0
    }

    fn get_flag(&self, num: u32, flag: u16) -> Result<bool> {
        Ok(self.flags.get(&num).map(|bits| bits & flag != 0).unwrap_or(false))
    }

    fn set_flag(&mut self, num: u32, flag: u16, value: bool) -> Result<()> {
        let Some(name) = parted_flag_name(flag) else {
            return Ok(()); // unknown bits cannot be expressed, dropped
        };
        let status = Command::new("parted")
            .args([
                "-s",
                &self.path.display().to_string(),
                "set",
                &num.to_string(),
                name,
                if value { "on" } else { "off" },
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| Error::WriteData(e.to_string()))?;
        if !status.success() {
            return Err(Error::WriteData(format!(
                "parted set {num} {name} on {}",
                self.path.display()
            )));
        }
        let entry = self.flags.entry(num).or_insert(0);
        if value {
            *entry |= flag;
        } else {
            *entry &= !flag;
        }
        Ok(())
    }

    fn write_table(&mut self, label: LabelKind, parts: &[PlannedPartition]) -> Result<()> {
        let mut script = String::new();
        script.push_str(match label {
            LabelKind::Gpt => "label: gpt\n",
            _ => "label: dos\n",
        });
        for part in parts {
            script.push_str(&format!(
                "start={}, size={}, type={}\n",
                part.start_sector,
                part.length_sectors,
                sfdisk_type(label, part.part_type, &part.fs_tag)
            ));
        }

        let mut child = Command::new("sfdisk")
            .arg(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::WriteData(e.to_string()))?;
        child
            .stdin
            .as_mut()
            .expect("sfdisk stdin is piped")
            .write_all(script.as_bytes())
            .map_err(|e| Error::WriteData(e.to_string()))?;
        let status = child
            .wait()
            .map_err(|e| Error::WriteData(e.to_string()))?;
        if !status.success() {
            return Err(Error::WriteData(format!(
                "sfdisk on {}",
                self.path.display()
            )));
        }
        self.commit()
    }
}

/// In-memory fixture table for tests and dry runs.
pub struct MemDisk {
    pub path: PathBuf,
    pub label: LabelKind,
    pub sectors: u64,
    pub sector_size: u64,
    pub parts: Vec<PartGeometry>,
    pub flags: HashMap<u32, u16>,
    pub committed: usize,
    open_count: usize,
}

impl MemDisk {
    pub fn new(label: LabelKind, sectors: u64) -> Self {
        MemDisk {
            path: PathBuf::from("/dev/fixture"),
            label,
            sectors,
            sector_size: 512,
            parts: Vec::new(),
            flags: HashMap::new(),
            committed: 0,
            open_count: 0,
        }
    }

    pub fn push(&mut self, part: PartGeometry, flags: u16) {
        self.flags.insert(part.num, flags);
        self.parts.push(part);
        self.parts.sort_by_key(|p| p.num);
    }
}

impl PartitionTable for MemDisk {
    fn open(&mut self) -> Result<()> {
        self.open_count += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.open_count = self.open_count.saturating_sub(1);
    }

    fn commit(&mut self) -> Result<()> {
        self.committed += 1;
        Ok(())
    }

    fn disk_path(&self) -> &Path {
        &self.path
    }

    fn label_kind(&self) -> LabelKind {
        self.label
    }

    fn disk_length_sectors(&self) -> u64 {
        self.sectors
    }

    fn sector_size(&self) -> u64 {
        self.sector_size
    }

    fn partitions(&self) -> Vec<PartGeometry> {
        self.parts.clone()
    }

    fn partition(&self, num: u32) -> Result<PartGeometry> {
        self.parts
            .iter()
            .find(|p| p.num == num)
            .cloned()
            .ok_or_else(|| Error::NoBlockDevice(self.path.clone()))
    }

    fn is_flag_available(&self, _num: u32, flag: u16) -> bool {
        flags_for_label(self.label) & flag != 0
    }

    fn get_flag(&self, num: u32, flag: u16) -> Result<bool> {
        Ok(self.flags.get(&num).map(|bits| bits & flag != 0).unwrap_or(false))
    }

    fn set_flag(&mut self, num: u32, flag: u16, value: bool) -> Result<()> {
        let entry = self.flags.entry(num).or_insert(0);
        if value {
            *entry |= flag;
        } else {
            *entry &= !flag;
        }
        Ok(())
    }

    fn write_table(&mut self, label: LabelKind, parts: &[PlannedPartition]) -> Result<()> {
        self.label = label;
        self.parts = parts
            .iter()
            .map(|p| PartGeometry {
                num: p.num,
                path: self.path.join(p.num.to_string()),
                part_type: p.part_type,
                start_sector: p.start_sector,
                length_sectors: p.length_sectors,
            })
            .collect();
        self.committed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_availability_tracks_label_kind() {
        let mbr = MemDisk::new(LabelKind::Mbr, 1 << 20);
        assert!(mbr.is_flag_available(1, PartFlags::BOOT));
        assert!(mbr.is_flag_available(1, PartFlags::LBA));
        assert!(!mbr.is_flag_available(1, PartFlags::BIOS_GRUB));

        let gpt = MemDisk::new(LabelKind::Gpt, 1 << 20);
        assert!(gpt.is_flag_available(1, PartFlags::BIOS_GRUB));
        assert!(!gpt.is_flag_available(1, PartFlags::LBA));
    }

    #[test]
    fn open_close_nest() {
        let mut disk = MemDisk::new(LabelKind::Mbr, 1 << 20);
        disk.open().unwrap();
        disk.open().unwrap();
        disk.close();
        disk.close();
        disk.close(); // extra close must not underflow
        assert!(disk.open().is_ok());
    }

    #[test]
    fn sfdisk_type_mapping() {
        assert_eq!(sfdisk_type(LabelKind::Mbr, PartType::Primary, "ext4"), "83");
        assert_eq!(sfdisk_type(LabelKind::Mbr, PartType::Extended, "nofs"), "5");
        assert_eq!(sfdisk_type(LabelKind::Mbr, PartType::Primary, "swap"), "82");
        assert_eq!(
            sfdisk_type(LabelKind::Gpt, PartType::Primary, "ext4"),
            "0FC63DAF-8483-4772-8E79-3D69D8477DE4"
        );
    }

    #[test]
    fn unknown_parted_flags_have_no_name() {
        assert_eq!(parted_flag_name(0x4000), None);
        assert_eq!(parted_flag_name(PartFlags::DIAG), Some("diag"));
    }
}
