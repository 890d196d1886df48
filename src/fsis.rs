//! FAT32 FileSystem Information Sector (FSIS).
//!
//! A 512-byte sector carrying three fixed signatures plus a free-cluster
//! count and a next-free-cluster hint. Both counts are hints: on mismatch
//! with a FAT scan, the FAT is authoritative (§3).

use crate::error::{Error, FsisSignature, Result};

const LEAD_SIGNATURE: u32 = 0x4161_5252;
const STRUCT_SIGNATURE: u32 = 0x6141_7272;
const TRAIL_SIGNATURE: u32 = 0xAA55_0000;

pub const FSIS_SIZE: usize = 512;

/// Sentinel meaning "no hint available", distinct from a genuine count.
pub const UNKNOWN: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy)]
pub struct Fsis {
    pub free_cluster_cnt: u32,
    pub next_free_cluster: u32,
}

impl Fsis {
    pub fn new(free_cluster_cnt: u32, next_free_cluster: u32) -> Self {
        Self {
            free_cluster_cnt,
            next_free_cluster,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FSIS_SIZE {
            return Err(Error::InvalidBootSector {
                reason: "FSIS shorter than 512 bytes".into(),
            });
        }
        let lead = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if lead != LEAD_SIGNATURE {
            return Err(Error::InvalidFsis {
                which: FsisSignature::Lead,
            });
        }
        let structsig = u32::from_le_bytes(bytes[484..488].try_into().unwrap());
        if structsig != STRUCT_SIGNATURE {
            return Err(Error::InvalidFsis {
                which: FsisSignature::Struct,
            });
        }
        let trail = u32::from_le_bytes(bytes[508..512].try_into().unwrap());
        if trail != TRAIL_SIGNATURE {
            return Err(Error::InvalidFsis {
                which: FsisSignature::Trail,
            });
        }
        let free_cluster_cnt = u32::from_le_bytes(bytes[488..492].try_into().unwrap());
        let next_free_cluster = u32::from_le_bytes(bytes[492..496].try_into().unwrap());
        Ok(Self {
            free_cluster_cnt,
            next_free_cluster,
        })
    }

    pub fn emit(&self) -> [u8; FSIS_SIZE] {
        let mut out = [0u8; FSIS_SIZE];
        out[0..4].copy_from_slice(&LEAD_SIGNATURE.to_le_bytes());
        out[484..488].copy_from_slice(&STRUCT_SIGNATURE.to_le_bytes());
        out[488..492].copy_from_slice(&self.free_cluster_cnt.to_le_bytes());
        out[492..496].copy_from_slice(&self.next_free_cluster.to_le_bytes());
        out[508..512].copy_from_slice(&TRAIL_SIGNATURE.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let fsis = Fsis::new(1234, 56);
        let bytes = fsis.emit();
        let parsed = Fsis::parse(&bytes).unwrap();
        assert_eq!(parsed.free_cluster_cnt, 1234);
        assert_eq!(parsed.next_free_cluster, 56);
    }

    #[test]
    fn rejects_bad_lead_signature() {
        let mut bytes = Fsis::new(0, 0).emit();
        bytes[0] = 0;
        assert!(matches!(
            Fsis::parse(&bytes),
            Err(Error::InvalidFsis {
                which: FsisSignature::Lead
            })
        ));
    }
}
