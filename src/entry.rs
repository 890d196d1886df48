//! Short (8.3) and long-filename (VFAT) directory entry codecs, and the
//! short-name derivation algorithm that bridges the two.

use std::collections::HashSet;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::time::DosTimestamp;

pub const DIRENT_SIZE: usize = 32;
pub const LFN_CHARS_PER_SLOT: usize = 13;

pub const DIR_ENTRY_FREE: u8 = 0x00;
pub const DIR_ENTRY_DELETED: u8 = 0xE5;
/// Encodes a real leading 0xE5 byte in a short name (§3).
pub const DIR_ENTRY_KANJI_E5: u8 = 0x05;
const LAST_LONG_ENTRY: u8 = 0x40;

bitflags! {
    /// Typed view of the attribute byte. Unknown bits round-trip
    /// unchanged because `Attributes` is a thin wrapper over the raw
    /// byte rather than a closed set (§9: "preserve unknown bits").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY  = 0x01;
        const HIDDEN     = 0x02;
        const SYSTEM     = 0x04;
        const VOLUME_ID  = 0x08;
        const DIRECTORY  = 0x10;
        const ARCHIVE    = 0x20;
        const LONG_NAME  = Self::READ_ONLY.bits() | Self::HIDDEN.bits() | Self::SYSTEM.bits() | Self::VOLUME_ID.bits();
    }
}

/// Case-flag bits in `ShortDirEntry::nt_res`: base/extension stored in
/// lowercase despite the on-disk bytes being uppercase.
const CASE_LOWER_BASE: u8 = 0x08;
const CASE_LOWER_EXT: u8 = 0x10;

#[repr(packed)]
#[derive(Clone, Copy)]
pub struct ShortDirEntry {
    pub name: [u8; 8],
    pub ext: [u8; 3],
    pub attr: u8,
    pub nt_res: u8,
    pub crt_time_tenth: u8,
    pub crt_time: u16,
    pub crt_date: u16,
    pub lst_acc_date: u16,
    pub fst_clus_hi: u16,
    pub wrt_time: u16,
    pub wrt_date: u16,
    pub fst_clus_lo: u16,
    pub file_size: u32,
}

impl ShortDirEntry {
    pub fn empty() -> Self {
        Self {
            name: [0x20; 8],
            ext: [0x20; 3],
            attr: 0,
            nt_res: 0,
            crt_time_tenth: 0,
            crt_time: 0,
            crt_date: 0,
            lst_acc_date: 0,
            fst_clus_hi: 0,
            wrt_time: 0,
            wrt_date: 0,
            fst_clus_lo: 0,
            file_size: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; DIRENT_SIZE];
        buf.copy_from_slice(&bytes[..DIRENT_SIZE]);
        unsafe { core::mem::transmute(buf) }
    }

    pub fn as_bytes(&self) -> [u8; DIRENT_SIZE] {
        unsafe { core::mem::transmute_copy(self) }
    }

    pub fn first_byte(&self) -> u8 {
        self.name[0]
    }

    pub fn is_free(&self) -> bool {
        matches!(self.first_byte(), DIR_ENTRY_FREE)
    }

    pub fn is_deleted(&self) -> bool {
        self.first_byte() == DIR_ENTRY_DELETED
    }

    pub fn is_volume_label(&self) -> bool {
        Attributes::from_bits_truncate(self.attr).contains(Attributes::VOLUME_ID)
    }

    pub fn attributes(&self) -> Attributes {
        Attributes::from_bits_truncate(self.attr)
    }

    pub fn set_attributes(&mut self, attr: Attributes) {
        self.attr = attr.bits();
    }

    pub fn delete(&mut self) {
        self.name[0] = DIR_ENTRY_DELETED;
    }

    pub fn first_cluster(&self) -> u32 {
        ((self.fst_clus_hi as u32) << 16) | self.fst_clus_lo as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.fst_clus_hi = (cluster >> 16) as u16;
        self.fst_clus_lo = (cluster & 0xFFFF) as u16;
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn set_file_size(&mut self, size: u32) {
        self.file_size = size;
    }

    pub fn set_timestamps(&mut self, created: DosTimestamp, modified: DosTimestamp) {
        self.crt_time_tenth = created.time_tenth;
        self.crt_time = created.time;
        self.crt_date = created.date;
        self.lst_acc_date = modified.date;
        self.wrt_time = modified.time;
        self.wrt_date = modified.date;
    }

    pub fn modified(&self) -> DosTimestamp {
        DosTimestamp {
            date: self.wrt_date,
            time: self.wrt_time,
            time_tenth: 0,
        }
    }

    /// 8.3 name with the case-flag bits applied, rendered lowercase where
    /// NT_Res marks it, for display (§4.8 `ReadDir`).
    pub fn display_name(&self) -> String {
        let base = String::from_utf8_lossy(trim_spaces(&self.name)).into_owned();
        let ext = String::from_utf8_lossy(trim_spaces(&self.ext)).into_owned();
        let base = if self.nt_res & CASE_LOWER_BASE != 0 {
            base.to_lowercase()
        } else {
            base
        };
        let ext = if self.nt_res & CASE_LOWER_EXT != 0 {
            ext.to_lowercase()
        } else {
            ext
        };
        if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        }
    }

    /// The 11-byte packed name used for the VFAT checksum (§4.5).
    pub fn packed_name(&self) -> [u8; 11] {
        let mut out = [0u8; 11];
        out[..8].copy_from_slice(&self.name);
        out[8..].copy_from_slice(&self.ext);
        out
    }

    pub fn checksum(&self) -> u8 {
        checksum_of(&self.packed_name())
    }
}

fn trim_spaces(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0x20).map(|i| i + 1).unwrap_or(0);
    &bytes[..end]
}

/// 8-bit left-rotate-and-add over the 11-byte packed short name (§4.5).
pub fn checksum_of(packed_name: &[u8; 11]) -> u8 {
    let mut sum = 0u8;
    for &b in packed_name {
        sum = (sum >> 1).wrapping_add(sum << 7).wrapping_add(b);
    }
    sum
}

#[repr(packed)]
#[derive(Clone, Copy)]
pub struct LongDirEntry {
    pub ord: u8,
    pub name1: [u16; 5],
    pub attr: u8,
    pub ldir_type: u8,
    pub chk_sum: u8,
    pub name2: [u16; 6],
    pub fst_clus_lo: u16,
    pub name3: [u16; 2],
}

impl LongDirEntry {
    pub fn empty() -> Self {
        Self {
            ord: 0,
            name1: [0; 5],
            attr: Attributes::LONG_NAME.bits(),
            ldir_type: 0,
            chk_sum: 0,
            name2: [0; 6],
            fst_clus_lo: 0,
            name3: [0; 2],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; DIRENT_SIZE];
        buf.copy_from_slice(&bytes[..DIRENT_SIZE]);
        unsafe { core::mem::transmute(buf) }
    }

    pub fn as_bytes(&self) -> [u8; DIRENT_SIZE] {
        unsafe { core::mem::transmute_copy(self) }
    }

    pub fn is_long_name(&self) -> bool {
        self.attr == Attributes::LONG_NAME.bits()
    }

    pub fn is_last(&self) -> bool {
        self.ord & LAST_LONG_ENTRY != 0
    }

    pub fn ordinal(&self) -> u8 {
        self.ord & !LAST_LONG_ENTRY
    }

    /// Build slot `index` (0-based from the start of the name) of `count`
    /// total slots for `name`, with checksum `chk_sum` of the companion
    /// short entry.
    pub fn for_slot(name: &[u16], index: usize, count: usize, chk_sum: u8) -> Self {
        let is_last = index == count - 1;
        let slot_start = index * LFN_CHARS_PER_SLOT;
        let mut chars = [0xFFFFu16; LFN_CHARS_PER_SLOT];
        for (i, slot) in chars.iter_mut().enumerate() {
            let pos = slot_start + i;
            if pos < name.len() {
                *slot = name[pos];
            } else if pos == name.len() {
                *slot = 0x0000;
            }
        }
        let mut entry = Self::empty();
        let ord = (index as u8) + 1;
        entry.ord = if is_last { ord | LAST_LONG_ENTRY } else { ord };
        entry.chk_sum = chk_sum;
        entry.name1.copy_from_slice(&chars[0..5]);
        entry.name2.copy_from_slice(&chars[5..11]);
        entry.name3.copy_from_slice(&chars[11..13]);
        entry
    }

    /// Extract this slot's up-to-13 UCS-2 units, stopping at the first
    /// NUL terminator (slots beyond the name's length are all 0xFFFF).
    pub fn chars(&self) -> Vec<u16> {
        let mut all = Vec::with_capacity(LFN_CHARS_PER_SLOT);
        all.extend_from_slice(&self.name1);
        all.extend_from_slice(&self.name2);
        all.extend_from_slice(&self.name3);
        if let Some(end) = all.iter().position(|&c| c == 0x0000) {
            all.truncate(end);
        } else {
            all.retain(|&c| c != 0xFFFF);
        }
        all
    }
}

/// Alphabet legal in an 8.3 short name (uppercase ASCII letters/digits
/// plus a conservative punctuation set; everything else gets replaced
/// with `_` during SFN derivation, per §4.5).
fn is_legal_sfn_byte(b: u8) -> bool {
    b.is_ascii_uppercase()
        || b.is_ascii_digit()
        || matches!(
            b,
            b'$' | b'%' | b'\'' | b'-' | b'_' | b'@' | b'~' | b'`' | b'!' | b'(' | b')' | b'{' | b'}' | b'^' | b'#' | b'&'
        )
}

pub fn is_legal_name_char(c: char) -> bool {
    !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && c != '\0'
}

/// Result of deriving a short name from a long one.
pub struct ShortName {
    pub name: [u8; 8],
    pub ext: [u8; 3],
    pub lower_base: bool,
    pub lower_ext: bool,
    /// Whether the long name must be retained as a companion LFN chain.
    pub needs_lfn: bool,
}

/// Split `"name.ext"` into base/extension on the *last* dot, per §4.5
/// ("strip ... dots except the last dot before a 1-3 char extension").
fn split_base_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 && name.len() - pos - 1 <= 3 && name.len() - pos - 1 > 0 => {
            (&name[..pos], &name[pos + 1..])
        }
        _ => (name, ""),
    }
}

/// Derive an 8.3 short name for `long_name`, disambiguating against
/// `existing` (the set of short names already present, uppercase,
/// `"BASE.EXT"` or `"BASE"` form) with the full `~1..=999` search (§9
/// open question: earlier code stopped at the first candidate).
pub fn derive_short_name(long_name: &str, existing: &HashSet<String>) -> Result<ShortName> {
    let (base_raw, ext_raw) = split_base_ext(long_name);
    let base_upper = base_raw.to_uppercase();
    let ext_upper = ext_raw.to_uppercase();

    let mut needs_lfn = false;
    let mut base_clean = String::new();
    for c in base_upper.chars().filter(|&c| c != ' ') {
        if c.is_ascii() && is_legal_sfn_byte(c as u8) {
            base_clean.push(c);
        } else {
            base_clean.push('_');
            needs_lfn = true;
        }
    }
    let mut ext_clean = String::new();
    for c in ext_upper.chars().filter(|&c| c != ' ') {
        if c.is_ascii() && is_legal_sfn_byte(c as u8) {
            ext_clean.push(c);
        } else {
            ext_clean.push('_');
            needs_lfn = true;
        }
    }

    if base_clean.len() > 8 || ext_clean.len() > 3 {
        needs_lfn = true;
    }
    if base_raw.chars().any(|c| !c.is_ascii()) || ext_raw.chars().any(|c| !c.is_ascii()) {
        needs_lfn = true;
    }

    let ext_trunc: String = ext_clean.chars().take(3).collect();

    let base_fits = base_clean.len() <= 8;
    let lower_base = !needs_lfn && base_raw.chars().all(|c| c.is_lowercase() || !c.is_alphabetic());
    let lower_ext = !needs_lfn && ext_raw.chars().all(|c| c.is_lowercase() || !c.is_alphabetic());

    let base_final = if base_fits && !needs_lfn {
        base_clean.clone()
    } else {
        // Truncate to 6 chars and disambiguate with ~N, trying every N
        // in 1..=999 rather than stopping at the first guess.
        let truncated: String = base_clean.chars().take(6).collect();
        let mut chosen = None;
        for n in 1u32..=999 {
            let candidate = format!("{truncated}~{n}");
            if candidate.len() > 8 {
                continue;
            }
            let key = if ext_trunc.is_empty() {
                candidate.clone()
            } else {
                format!("{candidate}.{ext_trunc}")
            };
            if !existing.contains(&key) {
                chosen = Some(candidate);
                break;
            }
        }
        match chosen {
            Some(c) => c,
            None => {
                return Err(Error::InvalidName {
                    name: long_name.to_string(),
                })
            }
        }
    };

    let mut name = [0x20u8; 8];
    name[..base_final.len()].copy_from_slice(base_final.as_bytes());
    let mut ext = [0x20u8; 3];
    ext[..ext_trunc.len()].copy_from_slice(ext_trunc.as_bytes());

    Ok(ShortName {
        name,
        ext,
        lower_base,
        lower_ext,
        needs_lfn,
    })
}

/// Encode `name` (already validated against `is_legal_name_char`) as
/// UTF-16 code units for LFN slots.
pub fn encode_utf16(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}

pub fn decode_utf16_lossy(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_for_lowercase_ascii_sets_case_flags() {
        let existing = HashSet::new();
        let sn = derive_short_name("a.txt", &existing).unwrap();
        assert_eq!(&sn.name[..1], b"A");
        assert_eq!(&sn.ext[..3], b"TXT");
        assert!(sn.lower_base);
        assert!(sn.lower_ext);
        assert!(!sn.needs_lfn);
    }

    #[test]
    fn short_name_truncates_and_disambiguates() {
        let existing = HashSet::new();
        let sn = derive_short_name("VeryLongName.ft", &existing).unwrap();
        assert!(sn.needs_lfn);
        let base = String::from_utf8(sn.name.to_vec()).unwrap();
        assert_eq!(base.trim_end(), "VERYLO~1");
        assert_eq!(&sn.ext, b"FT ");
    }

    #[test]
    fn short_name_disambiguation_scans_past_first_collision() {
        let mut existing = HashSet::new();
        existing.insert("VERYLO~1.FT".to_string());
        existing.insert("VERYLO~2.FT".to_string());
        let sn = derive_short_name("VeryLongName.ft", &existing).unwrap();
        let base = String::from_utf8(sn.name.to_vec()).unwrap();
        assert_eq!(base.trim_end(), "VERYLO~3");
    }

    #[test]
    fn lfn_checksum_matches_across_slots() {
        let sde = {
            let mut e = ShortDirEntry::empty();
            e.name = *b"VERYLO~1";
            e.ext = *b"FT ";
            e
        };
        let name_units = encode_utf16("VeryLongName.ft");
        let lde = LongDirEntry::for_slot(&name_units, 0, 2, sde.checksum());
        assert_eq!(lde.chk_sum, sde.checksum());
        assert!(!lde.is_last());
    }

    #[test]
    fn long_entry_last_ordinal_has_high_bit() {
        let lde = LongDirEntry::for_slot(&encode_utf16("x"), 0, 1, 0);
        assert!(lde.is_last());
        assert_eq!(lde.ordinal(), 1);
    }
}
