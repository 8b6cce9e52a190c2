//! Image header and partition descriptor codec
//!
//! Everything multi-byte is big-endian on the wire. Fractions travel as
//! the raw IEEE-754 bit pattern of an f64, also big-endian; no other
//! float representation is permitted.

use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::protocol::{DESC_LEN, HEADER_LEN, MAGIC, MAX_PARTITIONS, VERSION};

/// What the image contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Disk = 1,
    Partition = 2,
}

impl ImageType {
    fn from_wire(v: u8) -> Result<Self> {
        match v {
            1 => Ok(ImageType::Disk),
            2 => Ok(ImageType::Partition),
            _ => Err(Error::InvalidImage("unknown image type")),
        }
    }
}

/// Disk-label kind. Only meaningful for [`ImageType::Disk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    None = 0,
    Mbr = 1,
    Gpt = 2,
}

impl LabelKind {
    fn from_wire(v: u8) -> Result<Self> {
        match v {
            0 => Ok(LabelKind::None),
            1 => Ok(LabelKind::Mbr),
            2 => Ok(LabelKind::Gpt),
            _ => Err(Error::InvalidImage("unknown disk label kind")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartType {
    Primary = 1,
    Extended = 2,
    Logical = 3,
}

impl PartType {
    fn from_wire(v: u8) -> Result<Self> {
        match v {
            1 => Ok(PartType::Primary),
            2 => Ok(PartType::Extended),
            3 => Ok(PartType::Logical),
            _ => Err(Error::InvalidImage("unknown partition type")),
        }
    }
}

/// Partition flag bitset. Bits beyond the named ones are preserved
/// verbatim across encode/decode; they are only dropped at write time
/// when the partition library reports the flag unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartFlags(pub u16);

impl PartFlags {
    pub const BOOT: u16 = 1 << 0;
    pub const ROOT: u16 = 1 << 1;
    pub const SWAP: u16 = 1 << 2;
    pub const HIDDEN: u16 = 1 << 3;
    pub const RAID: u16 = 1 << 4;
    pub const LVM: u16 = 1 << 5;
    pub const LBA: u16 = 1 << 6;
    pub const HPSERVICE: u16 = 1 << 7;
    pub const PALO: u16 = 1 << 8;
    pub const PREP: u16 = 1 << 9;
    pub const MSFT_RESERVED: u16 = 1 << 10;
    pub const BIOS_GRUB: u16 = 1 << 11;
    pub const APPLE_TV_RECOVERY: u16 = 1 << 12;
    pub const DIAG: u16 = 1 << 13;

    pub fn contains(self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u16, value: bool) {
        if value {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    /// All named flags, paired with the bit value.
    pub fn known() -> &'static [(u16, &'static str)] {
        &[
            (Self::BOOT, "boot"),
            (Self::ROOT, "root"),
            (Self::SWAP, "swap"),
            (Self::HIDDEN, "hidden"),
            (Self::RAID, "raid"),
            (Self::LVM, "lvm"),
            (Self::LBA, "lba"),
            (Self::HPSERVICE, "hpservice"),
            (Self::PALO, "palo"),
            (Self::PREP, "prep"),
            (Self::MSFT_RESERVED, "msftres"),
            (Self::BIOS_GRUB, "bios_grub"),
            (Self::APPLE_TV_RECOVERY, "atvrecv"),
            (Self::DIAG, "diag"),
        ]
    }
}

/// Fixed-size image header, written at offset 0 of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub image_type: ImageType,
    pub label_kind: LabelKind,
    pub partition_count: u8,
    /// Total payload size in bytes, after header and descriptors.
    pub image_size: u64,
}

impl ImageHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..6].copy_from_slice(MAGIC);
        buf[6..8].copy_from_slice(&VERSION.to_be_bytes());
        buf[8] = self.image_type as u8;
        buf[9] = self.label_kind as u8;
        buf[10] = self.partition_count;
        // buf[11..16] reserved, zero
        buf[16..24].copy_from_slice(&self.image_size.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        if &buf[0..6] != MAGIC {
            return Err(Error::InvalidImage("bad magic"));
        }
        let version = u16::from_be_bytes([buf[6], buf[7]]);
        if version != VERSION {
            return Err(Error::InvalidImage("unsupported format version"));
        }
        let image_type = ImageType::from_wire(buf[8])?;
        let label_kind = LabelKind::from_wire(buf[9])?;
        let partition_count = buf[10];
        if partition_count > MAX_PARTITIONS {
            return Err(Error::InvalidImage("partition count out of range"));
        }
        let image_size = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        Ok(ImageHeader {
            image_type,
            label_kind,
            partition_count,
            image_size,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode())
            .map_err(|e| Error::WriteData(e.to_string()))
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_LEN];
        r.read_exact(&mut buf)
            .map_err(|_| Error::InvalidImage("truncated header"))?;
        Self::decode(&buf)
    }
}

/// One partition of the imaged disk. In PARTITION mode the image holds
/// exactly one of these; in DISK mode, one per partition in ascending
/// partition-number order.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionDesc {
    pub part_type: PartType,
    pub flags: PartFlags,
    /// Used blocks times block size; 0 for extended and `nofs`.
    pub min_size: u64,
    /// Start sector divided by disk length, in [0, 1].
    pub start_pos: f64,
    /// Partition length divided by disk length, in [0, 1].
    pub used_part: f64,
    /// Filesystem tag, e.g. `ext4`, `ntfs`, `fat32`, `swap`, `nofs`.
    pub fs_tag: String,
    pub label: String,
    pub uuid: String,
}

const FS_TAG_LEN: usize = 32;
const LABEL_LEN: usize = 28;
const UUID_LEN: usize = 37;

fn put_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
}

fn get_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl PartitionDesc {
    /// A descriptor that carries a filesystem archive in the payload
    /// region. Extended partitions and `nofs` carry nothing.
    pub fn has_payload(&self) -> bool {
        self.part_type != PartType::Extended && self.fs_tag != "nofs" && self.min_size > 0
    }

    pub fn encode(&self) -> [u8; DESC_LEN] {
        let mut buf = [0u8; DESC_LEN];
        buf[0] = self.part_type as u8;
        buf[1..3].copy_from_slice(&self.flags.0.to_be_bytes());
        buf[3..11].copy_from_slice(&self.min_size.to_be_bytes());
        buf[11..19].copy_from_slice(&self.start_pos.to_bits().to_be_bytes());
        buf[19..27].copy_from_slice(&self.used_part.to_bits().to_be_bytes());
        put_str(&mut buf[27..27 + FS_TAG_LEN], &self.fs_tag);
        put_str(&mut buf[59..59 + LABEL_LEN], &self.label);
        put_str(&mut buf[87..87 + UUID_LEN], &self.uuid);
        buf
    }

    pub fn decode(buf: &[u8; DESC_LEN]) -> Result<Self> {
        let part_type = PartType::from_wire(buf[0])?;
        let flags = PartFlags(u16::from_be_bytes([buf[1], buf[2]]));
        let min_size = u64::from_be_bytes(buf[3..11].try_into().unwrap());
        let start_pos = f64::from_bits(u64::from_be_bytes(buf[11..19].try_into().unwrap()));
        let used_part = f64::from_bits(u64::from_be_bytes(buf[19..27].try_into().unwrap()));

        if !start_pos.is_finite() || !(0.0..=1.0).contains(&start_pos) {
            return Err(Error::InvalidImage("start position out of range"));
        }
        if !used_part.is_finite() || !(0.0..=1.0).contains(&used_part) {
            return Err(Error::InvalidImage("used portion out of range"));
        }
        if part_type != PartType::Extended && start_pos + used_part > 1.0 {
            return Err(Error::InvalidImage("partition extends past end of disk"));
        }

        Ok(PartitionDesc {
            part_type,
            flags,
            min_size,
            start_pos,
            used_part,
            fs_tag: get_str(&buf[27..27 + FS_TAG_LEN]),
            label: get_str(&buf[59..59 + LABEL_LEN]),
            uuid: get_str(&buf[87..87 + UUID_LEN]),
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode())
            .map_err(|e| Error::WriteData(e.to_string()))
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; DESC_LEN];
        r.read_exact(&mut buf)
            .map_err(|_| Error::InvalidImage("truncated partition descriptor"))?;
        Self::decode(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_desc() -> PartitionDesc {
        PartitionDesc {
            part_type: PartType::Primary,
            flags: PartFlags(PartFlags::BOOT),
            min_size: 123_456_789,
            start_pos: 2048.0 / 1_048_576.0,
            used_part: 524_288.0 / 1_048_576.0,
            fs_tag: "ext4".into(),
            label: "rootfs".into(),
            uuid: "f3b1c9d2-4e5a-4b6c-8d7e-9f0a1b2c3d4e".into(),
        }
    }

    #[test]
    fn header_round_trip() {
        let hdr = ImageHeader {
            image_type: ImageType::Disk,
            label_kind: LabelKind::Mbr,
            partition_count: 3,
            image_size: 16 * 1024 * 1024,
        };
        let decoded = ImageHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn header_bad_magic_rejected() {
        let hdr = ImageHeader {
            image_type: ImageType::Partition,
            label_kind: LabelKind::None,
            partition_count: 1,
            image_size: 0,
        };
        let mut buf = hdr.encode();
        buf[0] = b'X';
        assert!(matches!(
            ImageHeader::decode(&buf),
            Err(Error::InvalidImage("bad magic"))
        ));
    }

    #[test]
    fn header_version_mismatch_rejected() {
        let mut buf = ImageHeader {
            image_type: ImageType::Disk,
            label_kind: LabelKind::Gpt,
            partition_count: 0,
            image_size: 0,
        }
        .encode();
        buf[6..8].copy_from_slice(&99u16.to_be_bytes());
        assert!(ImageHeader::decode(&buf).is_err());
    }

    #[test]
    fn header_partition_count_capped() {
        let mut buf = ImageHeader {
            image_type: ImageType::Disk,
            label_kind: LabelKind::Mbr,
            partition_count: 0,
            image_size: 0,
        }
        .encode();
        buf[10] = 65;
        assert!(ImageHeader::decode(&buf).is_err());
        buf[10] = 64;
        assert_eq!(ImageHeader::decode(&buf).unwrap().partition_count, 64);
    }

    #[test]
    fn descriptor_round_trip() {
        let desc = sample_desc();
        let decoded = PartitionDesc::decode(&desc.encode()).unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn fractions_encode_as_big_endian_ieee754() {
        let desc = sample_desc();
        let buf = desc.encode();
        // start_pos = 2048/1048576 = 0.001953125
        assert_eq!(
            buf[11..19],
            0.001953125f64.to_bits().to_be_bytes(),
            "start_pos wire bytes"
        );
        assert_eq!(buf[19..27], 0.5f64.to_bits().to_be_bytes(), "used_part wire bytes");
    }

    #[test]
    fn descriptor_rejects_out_of_range_fraction() {
        let mut desc = sample_desc();
        desc.used_part = 1.5;
        assert!(PartitionDesc::decode(&desc.encode()).is_err());

        let mut buf = sample_desc().encode();
        buf[11..19].copy_from_slice(&f64::NAN.to_bits().to_be_bytes());
        assert!(PartitionDesc::decode(&buf).is_err());

        buf = sample_desc().encode();
        buf[11..19].copy_from_slice(&(-0.25f64).to_bits().to_be_bytes());
        assert!(PartitionDesc::decode(&buf).is_err());
    }

    #[test]
    fn descriptor_rejects_overlapping_end() {
        let mut desc = sample_desc();
        desc.start_pos = 0.75;
        desc.used_part = 0.5;
        assert!(PartitionDesc::decode(&desc.encode()).is_err());

        // The sum rule does not apply to extended partitions.
        desc.part_type = PartType::Extended;
        assert!(PartitionDesc::decode(&desc.encode()).is_ok());
    }

    #[test]
    fn unknown_flag_bits_survive_round_trip() {
        let mut desc = sample_desc();
        desc.flags = PartFlags(PartFlags::BOOT | 0x4000 | 0x8000);
        let decoded = PartitionDesc::decode(&desc.encode()).unwrap();
        assert_eq!(decoded.flags.0, PartFlags::BOOT | 0x4000 | 0x8000);
    }

    #[test]
    fn nofs_and_extended_have_no_payload() {
        let mut desc = sample_desc();
        assert!(desc.has_payload());
        desc.fs_tag = "nofs".into();
        assert!(!desc.has_payload());

        let mut ext = sample_desc();
        ext.part_type = PartType::Extended;
        ext.min_size = 0;
        assert!(!ext.has_payload());
    }

    #[test]
    fn string_fields_are_nul_padded_and_bounded() {
        let mut desc = sample_desc();
        desc.label = "x".repeat(64); // longer than the 28-byte field
        let decoded = PartitionDesc::decode(&desc.encode()).unwrap();
        assert_eq!(decoded.label, "x".repeat(28));

        let buf = desc.encode();
        // fs tag "ext4" is NUL-padded to 32 bytes
        assert_eq!(&buf[27..31], b"ext4");
        assert!(buf[31..59].iter().all(|&b| b == 0));
    }
}
