//! BIOS Parameter Block / boot sector codecs.
//!
//! Three header variants are stacked by inclusion, per the Microsoft FAT
//! specification: the DOS 2.0 BPB (25 bytes, common to all three widths)
//! is followed by either the legacy (non-32) Extended BPB (26 bytes) or
//! the FAT32 Extended BPB (54 bytes). Everything is little-endian and
//! packed, so this module keeps the teacher's `#[repr(packed)]` +
//! raw-pointer-cast idiom rather than reaching for a bit-level parser
//! combinator the rest of the pack does not use.

use std::mem::size_of;

use crate::error::{Error, Result};

pub const BOOT_SECTOR_SIZE: usize = 512;
const BOOT_SIGNATURE: u16 = 0xAA55;

const VALID_SECTOR_SIZES: [u16; 4] = [512, 1024, 2048, 4096];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// Classify by data-cluster count, the thresholds the Microsoft FAT
    /// spec itself prescribes (and the only reliable signal — the
    /// `BS_FilSysType` string is informational only).
    pub fn from_cluster_count(data_cluster_cnt: u32) -> Self {
        if data_cluster_cnt < 4085 {
            FatType::Fat12
        } else if data_cluster_cnt < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    pub fn eoc_mask(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    pub fn canonical_eoc(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    pub fn entry_bits(self) -> u32 {
        match self {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        }
    }
}

/// The DOS 2.0 BPB, common ground for all three widths. 25 bytes,
/// starting at offset 11 of the boot sector.
#[repr(packed)]
#[derive(Clone, Copy)]
pub struct BasicBpb {
    pub byts_per_sec: u16,
    pub sec_per_clus: u8,
    pub rsvd_sec_cnt: u16,
    pub num_fats: u8,
    pub root_ent_cnt: u16,
    pub tot_sec16: u16,
    pub media: u8,
    pub fat_sz16: u16,
    pub sec_per_trk: u16,
    pub num_heads: u16,
    pub hidd_sec: u32,
    pub tot_sec32: u32,
}

impl BasicBpb {
    pub const SIZE: usize = size_of::<BasicBpb>();

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; Self::SIZE];
        buf.copy_from_slice(&bytes[..Self::SIZE]);
        unsafe { core::mem::transmute(buf) }
    }

    fn as_bytes(&self) -> [u8; Self::SIZE] {
        unsafe { core::mem::transmute_copy(self) }
    }

    fn validate(&self) -> Result<()> {
        if !VALID_SECTOR_SIZES.contains(&{ self.byts_per_sec }) {
            return Err(Error::InvalidBootSector {
                reason: format!("bytes-per-sector {} is not a supported size", {
                    self.byts_per_sec
                }),
            });
        }
        let spc = self.sec_per_clus;
        if spc == 0 || spc > 128 || !spc.is_power_of_two() {
            return Err(Error::InvalidBootSector {
                reason: format!("sectors-per-cluster {spc} is not a power of two in [1,128]"),
            });
        }
        Ok(())
    }

    fn total_sectors(&self) -> u32 {
        if self.tot_sec16 != 0 {
            self.tot_sec16 as u32
        } else {
            self.tot_sec32
        }
    }
}

/// Extended BPB for FAT12/FAT16 (26 bytes, offset 36).
#[repr(packed)]
#[derive(Clone, Copy)]
pub struct Ebpb1216 {
    pub bs_drv_num: u8,
    pub bs_reserved1: u8,
    pub bs_boot_sig: u8,
    pub bs_vol_id: u32,
    pub bs_vol_lab: [u8; 11],
    pub bs_fil_sys_type: [u8; 8],
}

impl Ebpb1216 {
    pub const SIZE: usize = size_of::<Ebpb1216>();

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; Self::SIZE];
        buf.copy_from_slice(&bytes[..Self::SIZE]);
        unsafe { core::mem::transmute(buf) }
    }

    fn as_bytes(&self) -> [u8; Self::SIZE] {
        unsafe { core::mem::transmute_copy(self) }
    }
}

/// Extended BPB for FAT32 (54 bytes, offset 36).
#[repr(packed)]
#[derive(Clone, Copy)]
pub struct Ebpb32 {
    pub fat_sz32: u32,
    pub ext_flags: u16,
    pub fs_ver: u16,
    pub root_clus: u32,
    pub fs_info: u16,
    pub bk_boot_sec: u16,
    pub reserved: [u8; 12],
    pub bs_drv_num: u8,
    pub bs_reserved1: u8,
    pub bs_boot_sig: u8,
    pub bs_vol_id: u32,
    pub bs_vol_lab: [u8; 11],
    pub bs_fil_sys_type: [u8; 8],
}

impl Ebpb32 {
    pub const SIZE: usize = size_of::<Ebpb32>();

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; Self::SIZE];
        buf.copy_from_slice(&bytes[..Self::SIZE]);
        unsafe { core::mem::transmute(buf) }
    }

    fn as_bytes(&self) -> [u8; Self::SIZE] {
        unsafe { core::mem::transmute_copy(self) }
    }
}

#[derive(Clone, Copy)]
pub enum Extended {
    Legacy(Ebpb1216),
    Fat32(Ebpb32),
}

/// The fully parsed boot sector: jump instruction, OEM name, the common
/// BPB, the width-specific Extended BPB, and enough of the raw bytes to
/// reproduce an unchanged boot sector byte-for-byte on re-emit (bootstrap
/// code, reserved padding).
#[derive(Clone)]
pub struct BootSector {
    pub bs_jmp_boot: [u8; 3],
    pub bs_oem_name: [u8; 8],
    pub bpb: BasicBpb,
    pub extended: Extended,
    /// Bytes between the end of the Extended BPB and the trailing
    /// signature (bootstrap code + padding). Preserved verbatim so a
    /// `parse(emit(x)) == x` round trip holds even though this engine
    /// never executes or edits bootstrap code.
    boot_code: Vec<u8>,
}

impl BootSector {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BOOT_SECTOR_SIZE {
            return Err(Error::InvalidBootSector {
                reason: "boot sector shorter than 512 bytes".into(),
            });
        }
        let signature = u16::from_le_bytes([bytes[510], bytes[511]]);
        if signature != BOOT_SIGNATURE {
            return Err(Error::InvalidBootSector {
                reason: format!("missing 0x55AA signature, found {signature:#06x}"),
            });
        }

        let mut bs_jmp_boot = [0u8; 3];
        bs_jmp_boot.copy_from_slice(&bytes[0..3]);
        let mut bs_oem_name = [0u8; 8];
        bs_oem_name.copy_from_slice(&bytes[3..11]);

        let bpb = BasicBpb::from_bytes(&bytes[11..11 + BasicBpb::SIZE]);
        bpb.validate()?;

        let ext_start = 11 + BasicBpb::SIZE;
        // The width is not known until classification by cluster count,
        // which itself depends on the width-specific FAT-size field.
        // `BPB_FATSz16 == 0` is the standard tell that the FAT32 Extended
        // BPB (with its own 32-bit `FATSz32`) is in play.
        let extended = if bpb.fat_sz16 == 0 {
            Extended::Fat32(Ebpb32::from_bytes(&bytes[ext_start..ext_start + Ebpb32::SIZE]))
        } else {
            Extended::Legacy(Ebpb1216::from_bytes(
                &bytes[ext_start..ext_start + Ebpb1216::SIZE],
            ))
        };

        let ext_len = match &extended {
            Extended::Legacy(_) => Ebpb1216::SIZE,
            Extended::Fat32(_) => Ebpb32::SIZE,
        };
        let boot_code = bytes[ext_start + ext_len..510].to_vec();

        Ok(Self {
            bs_jmp_boot,
            bs_oem_name,
            bpb,
            extended,
            boot_code,
        })
    }

    pub fn emit(&self) -> [u8; BOOT_SECTOR_SIZE] {
        let mut out = [0u8; BOOT_SECTOR_SIZE];
        out[0..3].copy_from_slice(&self.bs_jmp_boot);
        out[3..11].copy_from_slice(&self.bs_oem_name);
        let bpb_bytes = self.bpb.as_bytes();
        out[11..11 + BasicBpb::SIZE].copy_from_slice(&bpb_bytes);

        let ext_start = 11 + BasicBpb::SIZE;
        let ext_len = match &self.extended {
            Extended::Legacy(e) => {
                let b = e.as_bytes();
                out[ext_start..ext_start + Ebpb1216::SIZE].copy_from_slice(&b);
                Ebpb1216::SIZE
            }
            Extended::Fat32(e) => {
                let b = e.as_bytes();
                out[ext_start..ext_start + Ebpb32::SIZE].copy_from_slice(&b);
                Ebpb32::SIZE
            }
        };

        let code_start = ext_start + ext_len;
        let copy_len = self.boot_code.len().min(510usize.saturating_sub(code_start));
        out[code_start..code_start + copy_len].copy_from_slice(&self.boot_code[..copy_len]);
        out[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
        out
    }

    pub fn bytes_per_sector(&self) -> u32 {
        self.bpb.byts_per_sec as u32
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        self.bpb.sec_per_clus as u32
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector() * self.sectors_per_cluster()
    }

    pub fn reserved_sector_cnt(&self) -> u32 {
        self.bpb.rsvd_sec_cnt as u32
    }

    pub fn num_fats(&self) -> u32 {
        self.bpb.num_fats as u32
    }

    pub fn root_ent_cnt(&self) -> u32 {
        self.bpb.root_ent_cnt as u32
    }

    pub fn total_sectors(&self) -> u32 {
        self.bpb.total_sectors()
    }

    pub fn fat_sz(&self) -> u32 {
        match &self.extended {
            Extended::Legacy(_) => self.bpb.fat_sz16 as u32,
            Extended::Fat32(e) => e.fat_sz32,
        }
    }

    pub fn fs_info_sector(&self) -> u32 {
        match &self.extended {
            Extended::Legacy(_) => 0,
            Extended::Fat32(e) => e.fs_info as u32,
        }
    }

    pub fn backup_boot_sector(&self) -> u32 {
        match &self.extended {
            Extended::Legacy(_) => 0,
            Extended::Fat32(e) => e.bk_boot_sec as u32,
        }
    }

    /// Root-dir cluster for FAT32; meaningless for FAT12/16, which use
    /// the fixed region instead — see `Root` in `dir.rs`.
    pub fn root_cluster(&self) -> u32 {
        match &self.extended {
            Extended::Legacy(_) => 2,
            Extended::Fat32(e) => e.root_clus,
        }
    }

    pub fn root_dir_sectors(&self) -> u32 {
        let bytes = self.root_ent_cnt() * 32;
        (bytes + self.bytes_per_sector() - 1) / self.bytes_per_sector()
    }

    pub fn first_fat_sector(&self) -> u32 {
        self.reserved_sector_cnt()
    }

    pub fn first_root_dir_sector(&self) -> u32 {
        self.first_fat_sector() + self.num_fats() * self.fat_sz()
    }

    pub fn first_data_sector(&self) -> u32 {
        self.first_root_dir_sector() + self.root_dir_sectors()
    }

    pub fn data_sector_cnt(&self) -> u32 {
        self.total_sectors() - self.first_data_sector()
    }

    pub fn data_cluster_cnt(&self) -> u32 {
        self.data_sector_cnt() / self.sectors_per_cluster()
    }

    pub fn fat_type(&self) -> FatType {
        FatType::from_cluster_count(self.data_cluster_cnt())
    }

    /// Byte offset (relative to the window start) of the first sector of
    /// `cluster`. Clusters 0/1 are not addressable data clusters.
    pub fn offset_of_cluster(&self, cluster: u32) -> u64 {
        let sector = self.first_data_sector() as u64
            + (cluster as u64 - 2) * self.sectors_per_cluster() as u64;
        sector * self.bytes_per_sector() as u64
    }

    pub fn volume_label(&self) -> [u8; 11] {
        match &self.extended {
            Extended::Legacy(e) => e.bs_vol_lab,
            Extended::Fat32(e) => e.bs_vol_lab,
        }
    }

    pub fn set_volume_label(&mut self, label: [u8; 11]) {
        match &mut self.extended {
            Extended::Legacy(e) => e.bs_vol_lab = label,
            Extended::Fat32(e) => e.bs_vol_lab = label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fat32_bytes() -> [u8; BOOT_SECTOR_SIZE] {
        let bpb = BasicBpb {
            byts_per_sec: 512,
            sec_per_clus: 8,
            rsvd_sec_cnt: 32,
            num_fats: 2,
            root_ent_cnt: 0,
            tot_sec16: 0,
            media: 0xF8,
            fat_sz16: 0,
            sec_per_trk: 63,
            num_heads: 255,
            hidd_sec: 0,
            tot_sec32: 20480, // 10 MiB / 512
        };
        let ebpb = Ebpb32 {
            fat_sz32: 20,
            ext_flags: 0,
            fs_ver: 0,
            root_clus: 2,
            fs_info: 1,
            bk_boot_sec: 6,
            reserved: [0; 12],
            bs_drv_num: 0x80,
            bs_reserved1: 0,
            bs_boot_sig: 0x29,
            bs_vol_id: 0x1234_5678,
            bs_vol_lab: *b"TEST512    ",
            bs_fil_sys_type: *b"FAT32   ",
        };
        let sector = BootSector {
            bs_jmp_boot: [0xEB, 0x58, 0x90],
            bs_oem_name: *b"MSWIN4.1",
            bpb,
            extended: Extended::Fat32(ebpb),
            boot_code: Vec::new(),
        };
        sector.emit()
    }

    #[test]
    fn parse_emit_roundtrip() {
        let bytes = sample_fat32_bytes();
        let parsed = BootSector::parse(&bytes).unwrap();
        assert_eq!(parsed.emit(), bytes);
    }

    #[test]
    fn classifies_as_fat32() {
        let bytes = sample_fat32_bytes();
        let parsed = BootSector::parse(&bytes).unwrap();
        assert_eq!(parsed.fat_type(), FatType::Fat32);
    }

    #[test]
    fn rejects_missing_signature() {
        let mut bytes = sample_fat32_bytes();
        bytes[511] = 0;
        assert!(BootSector::parse(&bytes).is_err());
    }
}
