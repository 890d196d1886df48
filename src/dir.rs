//! Directory object: a mutable ordered list of directory entries bound
//! to a cluster chain (or, for FAT12/16, to the fixed root region).
//!
//! `Directory` itself does no I/O; the `Filesystem` façade reads the
//! backing bytes from the Backend and hands them to `Directory::parse`,
//! then writes back whatever `Directory::serialize` produces. This keeps
//! the directory's structural logic (name lookup, SFN disambiguation,
//! `.`/`..` bookkeeping) independent of the cache/backend plumbing,
//! which is what lets `Filesystem` own a plain arena of `Directory`
//! values indexed by cluster number instead of the source's cyclic
//! `Arc<RwLock<..>>` back-references (§9).

use std::collections::HashSet;

use crate::entry::{
    derive_short_name, encode_utf16, Attributes, LongDirEntry, ShortDirEntry, DIRENT_SIZE,
    DIR_ENTRY_DELETED, DIR_ENTRY_FREE, DIR_ENTRY_KANJI_E5, LFN_CHARS_PER_SLOT,
};
use crate::error::{Error, Result};
use crate::time::{Clock, DosTimestamp};

/// Where a directory's entries physically live. FAT12/16 keep the root
/// directory in a fixed-size region ahead of the data area; FAT32 (and
/// every non-root directory on any width) stores it as an ordinary
/// cluster chain. Keeping these as distinct variants, rather than one
/// Directory abstraction that special-cases the root, is the §9 redesign
/// note this crate follows rather than silently reproducing the
/// source's mixed handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    FixedRegion { first_sector: u32, sector_count: u32 },
    Chain { cluster: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirLocation {
    Root(Root),
    Sub { cluster: u32 },
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub long_name: Option<String>,
    pub short_name: String, // "BASE" or "BASE.EXT", uppercase, used for dedup + fallback display
    pub attr: Attributes,
    pub case_flags: u8,
    pub first_cluster: u32,
    pub file_size: u32,
    pub created: DosTimestamp,
    pub modified: DosTimestamp,
}

impl DirEntry {
    pub fn display_name(&self) -> String {
        self.long_name.clone().unwrap_or_else(|| self.short_name.clone())
    }

    pub fn is_dir(&self) -> bool {
        self.attr.contains(Attributes::DIRECTORY)
    }

    pub fn is_volume_label(&self) -> bool {
        self.attr.contains(Attributes::VOLUME_ID)
    }

    fn matches(&self, name: &str) -> bool {
        let upper = name.to_uppercase();
        self.short_name.eq_ignore_ascii_case(&upper)
            || self
                .long_name
                .as_deref()
                .map(|n| n.eq_ignore_ascii_case(name))
                .unwrap_or(false)
    }
}

pub struct Directory {
    pub location: DirLocation,
    entries: Vec<DirEntry>,
}

impl Directory {
    pub fn empty(location: DirLocation) -> Self {
        Self {
            location,
            entries: Vec::new(),
        }
    }

    /// Parse a directory's full byte stream (all of its clusters, or the
    /// whole fixed root region, concatenated) into an ordered entry list.
    pub fn parse(location: DirLocation, bytes: &[u8]) -> Self {
        let mut entries = Vec::new();
        let mut pending_lfn: Vec<LongDirEntry> = Vec::new();

        let mut offset = 0;
        while offset + DIRENT_SIZE <= bytes.len() {
            let raw = &bytes[offset..offset + DIRENT_SIZE];
            offset += DIRENT_SIZE;

            if raw[0] == DIR_ENTRY_FREE {
                break;
            }
            if raw[0] == DIR_ENTRY_DELETED {
                pending_lfn.clear();
                continue;
            }

            let attr = Attributes::from_bits_truncate(raw[11]);
            if attr == Attributes::LONG_NAME {
                pending_lfn.push(LongDirEntry::from_bytes(raw));
                continue;
            }

            let sde = ShortDirEntry::from_bytes(raw);
            if sde.is_volume_label() {
                pending_lfn.clear();
                continue;
            }

            let short_name = sde.display_name().to_uppercase();
            let long_name = reassemble_long_name(&mut pending_lfn, sde.checksum());

            if short_name == "." || short_name == ".." {
                pending_lfn.clear();
                continue;
            }

            entries.push(DirEntry {
                long_name,
                short_name,
                attr: sde.attributes(),
                case_flags: sde.nt_res,
                first_cluster: sde.first_cluster(),
                file_size: sde.file_size(),
                created: DosTimestamp {
                    date: sde.crt_date,
                    time: sde.crt_time,
                    time_tenth: sde.crt_time_tenth,
                },
                modified: sde.modified(),
            });
        }

        Self { location, entries }
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// All entries a `ReadDir` caller should see: excludes the volume
    /// label and (since `parse` already drops them) `.`/`..` (§4.8).
    pub fn visible_entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().filter(|e| !e.is_volume_label())
    }

    pub fn find(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|e| !e.is_volume_label() && e.matches(name))
    }

    pub fn find_index(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| !e.is_volume_label() && e.matches(name))
    }

    pub fn is_empty_of_user_entries(&self) -> bool {
        self.entries.iter().all(|e| e.is_volume_label())
    }

    fn existing_short_names(&self) -> HashSet<String> {
        self.entries
            .iter()
            .filter(|e| !e.is_volume_label())
            .map(|e| e.short_name.clone())
            .collect()
    }

    /// Append a new file/subdirectory entry named `name`. Fails with
    /// `AlreadyExists` if a case-insensitive match is already present,
    /// or `InvalidName` if the name is empty, too long, carries a
    /// reserved character, or the SFN disambiguation space (~1..~999) is
    /// exhausted (§4.5, §4.9).
    pub fn create_entry(
        &mut self,
        name: &str,
        first_cluster: u32,
        is_dir: bool,
        clock: &Clock,
    ) -> Result<()> {
        validate_name(name)?;
        if self.find(name).is_some() {
            return Err(Error::AlreadyExists {
                path: name.to_string(),
            });
        }

        let existing = self.existing_short_names();
        let short = derive_short_name(name, &existing)?;

        let mut sde = ShortDirEntry::empty();
        sde.name = short.name;
        sde.ext = short.ext;
        let attr = if is_dir {
            Attributes::DIRECTORY
        } else {
            Attributes::ARCHIVE
        };
        sde.set_attributes(attr);
        if short.lower_base {
            sde.nt_res |= 0x08;
        }
        if short.lower_ext {
            sde.nt_res |= 0x10;
        }
        sde.set_first_cluster(first_cluster);
        let now = clock.now();
        sde.set_timestamps(now, now);

        let short_name_key = sde.display_name().to_uppercase();

        self.entries.push(DirEntry {
            long_name: if short.needs_lfn {
                Some(name.to_string())
            } else {
                None
            },
            short_name: short_name_key,
            attr,
            case_flags: sde.nt_res,
            first_cluster,
            file_size: 0,
            created: now,
            modified: now,
        });
        Ok(())
    }

    /// Append `entry` under `new_name`, carrying over its attributes,
    /// timestamps, first cluster and size verbatim — only the short/long
    /// name fields are recomputed. This is what a cross-directory move
    /// needs (§4.8 step 4: "append to new parent and remove from old"),
    /// as distinct from `create_entry`, which fabricates a brand-new
    /// entry from scratch.
    pub fn insert_existing_entry(&mut self, new_name: &str, entry: &DirEntry) -> Result<()> {
        validate_name(new_name)?;
        if self.find(new_name).is_some() {
            return Err(Error::AlreadyExists {
                path: new_name.to_string(),
            });
        }

        let existing = self.existing_short_names();
        let short = derive_short_name(new_name, &existing)?;

        let mut sde = ShortDirEntry::empty();
        sde.name = short.name;
        sde.ext = short.ext;
        let mut case_flags = entry.case_flags & !0x18;
        if short.lower_base {
            case_flags |= 0x08;
        }
        if short.lower_ext {
            case_flags |= 0x10;
        }
        let short_name_key = sde.display_name().to_uppercase();

        self.entries.push(DirEntry {
            long_name: if short.needs_lfn {
                Some(new_name.to_string())
            } else {
                None
            },
            short_name: short_name_key,
            attr: entry.attr,
            case_flags,
            first_cluster: entry.first_cluster,
            file_size: entry.file_size,
            created: entry.created,
            modified: entry.modified,
        });
        Ok(())
    }

    pub fn remove_entry(&mut self, name: &str) -> Result<DirEntry> {
        let idx = self.find_index(name).ok_or_else(|| Error::NotFound {
            path: name.to_string(),
        })?;
        Ok(self.entries.remove(idx))
    }

    /// Rename in place. If `new_name` already exists the caller must
    /// have removed it first (§4.8 step 3); this only performs the
    /// bookkeeping mutation, keeping `first_cluster` unchanged (§4.6).
    pub fn rename_entry(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        let idx = self.find_index(old_name).ok_or_else(|| Error::NotFound {
            path: old_name.to_string(),
        })?;
        let existing: HashSet<String> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, e)| e.short_name.clone())
            .collect();
        let short = derive_short_name(new_name, &existing)?;
        let entry = &mut self.entries[idx];
        let mut sde = ShortDirEntry::empty();
        sde.name = short.name;
        sde.ext = short.ext;
        entry.short_name = sde.display_name().to_uppercase();
        entry.long_name = if short.needs_lfn {
            Some(new_name.to_string())
        } else {
            None
        };
        if short.lower_base {
            entry.case_flags |= 0x08;
        }
        if short.lower_ext {
            entry.case_flags |= 0x10;
        }
        Ok(())
    }

    pub fn set_file_size(&mut self, name: &str, size: u32, clock: &Clock) -> Result<()> {
        let idx = self.find_index(name).ok_or_else(|| Error::NotFound {
            path: name.to_string(),
        })?;
        self.entries[idx].file_size = size;
        self.entries[idx].modified = clock.now();
        Ok(())
    }

    pub fn set_first_cluster(&mut self, name: &str, cluster: u32) -> Result<()> {
        let idx = self.find_index(name).ok_or_else(|| Error::NotFound {
            path: name.to_string(),
        })?;
        self.entries[idx].first_cluster = cluster;
        Ok(())
    }

    /// Create or update the root directory's `VOLUME_LABEL` entry (§4.8:
    /// the label "lives both in the EBPB ... and as a special
    /// root-directory entry"). `label` is the raw 11-byte BPB field.
    pub fn set_volume_label(&mut self, label: &[u8; 11], clock: &Clock) {
        let base = String::from_utf8_lossy(&label[..8]).trim_end().to_string();
        let ext = String::from_utf8_lossy(&label[8..11]).trim_end().to_string();
        let short_name = if ext.is_empty() { base } else { format!("{base}.{ext}") };
        let now = clock.now();
        if let Some(e) = self.entries.iter_mut().find(|e| e.is_volume_label()) {
            e.short_name = short_name;
            e.modified = now;
        } else {
            self.entries.push(DirEntry {
                long_name: None,
                short_name,
                attr: Attributes::VOLUME_ID,
                case_flags: 0,
                first_cluster: 0,
                file_size: 0,
                created: now,
                modified: now,
            });
        }
    }

    /// Toggle the read-only/hidden/system bits, preserving every other
    /// attribute bit already set (§4.7 `SetSystem`/`SetHidden`/`SetReadOnly`).
    pub fn set_attributes(&mut self, name: &str, attr: Attributes, value: bool) -> Result<()> {
        let idx = self.find_index(name).ok_or_else(|| Error::NotFound {
            path: name.to_string(),
        })?;
        if value {
            self.entries[idx].attr |= attr;
        } else {
            self.entries[idx].attr -= attr;
        }
        Ok(())
    }

    /// A freshly allocated subdirectory's own content: `.` and `..`
    /// entries only (§3, §4.6). Root directories never call this.
    pub fn new_subdir_entries(own_cluster: u32, parent_cluster: u32, clock: &Clock) -> Vec<u8> {
        let now = clock.now();
        let mut dot = ShortDirEntry::empty();
        dot.name = *b".       ";
        dot.set_attributes(Attributes::DIRECTORY);
        dot.set_first_cluster(own_cluster);
        dot.set_timestamps(now, now);

        let mut dotdot = ShortDirEntry::empty();
        dotdot.name = *b"..      ";
        dotdot.set_attributes(Attributes::DIRECTORY);
        // Root's parent is conventionally encoded as cluster 0 even
        // though the real root cluster is 2 (§3: "but root is stored as 0").
        dotdot.set_first_cluster(if parent_cluster == 0 { 0 } else { parent_cluster });
        dotdot.set_timestamps(now, now);

        let mut out = Vec::with_capacity(DIRENT_SIZE * 2);
        out.extend_from_slice(&dot.as_bytes());
        out.extend_from_slice(&dotdot.as_bytes());
        out
    }

    /// Serialize every live entry back to its on-disk slot sequence.
    /// `.`/`..` entries for non-root directories are supplied by the
    /// caller (`Filesystem` keeps them out of band since they never
    /// change once a directory is created) and are not regenerated here.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            let mut sde = ShortDirEntry::empty();
            let (name, ext) = split_short(&entry.short_name);
            sde.name = name;
            sde.ext = ext;
            sde.set_attributes(entry.attr);
            sde.nt_res = entry.case_flags;
            sde.set_first_cluster(entry.first_cluster);
            sde.set_file_size(entry.file_size);
            sde.set_timestamps(entry.created, entry.modified);

            if let Some(long) = &entry.long_name {
                let units = encode_utf16(long);
                let mut padded = units.clone();
                padded.push(0x0000);
                let count = (padded.len() + LFN_CHARS_PER_SLOT - 1) / LFN_CHARS_PER_SLOT;
                let chk = sde.checksum();
                for slot_index in (0..count).rev() {
                    let lde = LongDirEntry::for_slot(&padded, slot_index, count, chk);
                    out.extend_from_slice(&lde.as_bytes());
                }
            }
            out.extend_from_slice(&sde.as_bytes());
        }
        out
    }
}

fn split_short(short_name: &str) -> ([u8; 8], [u8; 3]) {
    let (base, ext) = match short_name.split_once('.') {
        Some((b, e)) => (b, e),
        None => (short_name, ""),
    };
    let mut name = [0x20u8; 8];
    let base_bytes = base.as_bytes();
    name[..base_bytes.len().min(8)].copy_from_slice(&base_bytes[..base_bytes.len().min(8)]);
    let mut ext_arr = [0x20u8; 3];
    let ext_bytes = ext.as_bytes();
    ext_arr[..ext_bytes.len().min(3)].copy_from_slice(&ext_bytes[..ext_bytes.len().min(3)]);
    (name, ext_arr)
}

fn reassemble_long_name(pending: &mut Vec<LongDirEntry>, sde_checksum: u8) -> Option<String> {
    if pending.is_empty() {
        return None;
    }
    // Slots were pushed in on-disk order: highest ordinal (last) first.
    // Checksum and ordinal-descends-to-1 invariants both get checked; a
    // mismatch drops the LFN and keeps the short name only (§4.5).
    let valid = pending.iter().all(|s| s.chk_sum == sde_checksum)
        && pending
            .iter()
            .enumerate()
            .all(|(i, s)| s.ordinal() as usize == pending.len() - i)
        && pending.last().map(|s| s.ordinal() == 1).unwrap_or(false);

    let result = if valid {
        let mut units = Vec::new();
        for slot in pending.iter() {
            units.extend(slot.chars());
        }
        Some(crate::entry::decode_utf16_lossy(&units))
    } else {
        None
    };
    pending.clear();
    result
}

/// Reserved-character / emptiness / byte-0xE5-disguise checks shared by
/// `create_entry` and `rename_entry`. Disallows any of the characters
/// the Microsoft FAT spec reserves in a path component.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(Error::InvalidName {
            name: name.to_string(),
        });
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidName {
            name: name.to_string(),
        });
    }
    for c in name.chars() {
        if !crate::entry::is_legal_name_char(c) {
            return Err(Error::InvalidName {
                name: name.to_string(),
            });
        }
    }
    if name.as_bytes()[0] == DIR_ENTRY_KANJI_E5 {
        return Err(Error::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> Clock {
        Clock::resolve(true, Some(1609459200))
    }

    #[test]
    fn create_then_find_roundtrips_through_serialize() {
        let mut dir = Directory::empty(DirLocation::Root(Root::Chain { cluster: 2 }));
        dir.create_entry("hello.txt", 5, false, &clock()).unwrap();
        let bytes = dir.serialize();
        let parsed = Directory::parse(DirLocation::Root(Root::Chain { cluster: 2 }), &bytes);
        let found = parsed.find("HELLO.TXT").unwrap();
        assert_eq!(found.first_cluster, 5);
        assert!(!found.is_dir());
    }

    #[test]
    fn long_name_survives_roundtrip() {
        let mut dir = Directory::empty(DirLocation::Sub { cluster: 10 });
        let long = "a".repeat(255);
        dir.create_entry(&long, 7, false, &clock()).unwrap();
        let bytes = dir.serialize();
        let parsed = Directory::parse(DirLocation::Sub { cluster: 10 }, &bytes);
        let found = parsed.find(&long).unwrap();
        assert_eq!(found.display_name(), long);
    }

    #[test]
    fn duplicate_name_rejected_case_insensitively() {
        let mut dir = Directory::empty(DirLocation::Sub { cluster: 10 });
        dir.create_entry("EFI", 2, true, &clock()).unwrap();
        let err = dir.create_entry("efi", 3, true, &clock()).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn remove_then_find_fails() {
        let mut dir = Directory::empty(DirLocation::Sub { cluster: 10 });
        dir.create_entry("a.txt", 5, false, &clock()).unwrap();
        dir.remove_entry("a.txt").unwrap();
        assert!(dir.find("a.txt").is_none());
    }
}
