//! Filesystem façade: `Format`/`Mount`, path resolution, file open/read/
//! write/close, `Mkdir`/`Remove`/`Rename`/`ReadDir`, volume label.
//!
//! Every mutable resource — backend, cache, FAT, the directory arena — is
//! a plain field reached through `&mut self`. That single-owner shape is
//! what replaces the source's `Arc<RwLock<FileSystem>>` plus a cyclic
//! `Arc<RwLock<VirtFile>>` back into it (§5, §9): callers hold a
//! `Filesystem` and `FileHandle`s that carry no back-reference, and every
//! operation routes through the one `&mut Filesystem` instead of locking
//! shared state.

use std::collections::{HashMap, HashSet};

use log::info;

use crate::backend::{Backend, DiskWindow};
use crate::bpb::{BasicBpb, BootSector, Ebpb1216, Ebpb32, Extended, FatType, BOOT_SECTOR_SIZE};
use crate::cache::BlockCache;
use crate::dir::{DirEntry, DirLocation, Directory, Root};
use crate::error::{Error, Result};
use crate::fat::{FatTable, FIRST_DATA_CLUSTER};
use crate::file::{FileHandle, OpenFlags, MAX_FILE_SIZE};
use crate::fsis::{self, Fsis};
use crate::time::Clock;

const DEFAULT_CACHE_CAPACITY: usize = 64;
/// §4.8 mount-time size bounds: below this, there isn't room for a boot
/// sector, at least one FAT copy and a minimal data area; above this,
/// FAT32's 32-bit sector-count field can't address the whole image.
const MIN_VOLUME_SIZE: u64 = 512 * 1024;
const MAX_FAT32_VOLUME_SIZE: u64 = 2 * 1024 * 1024 * 1024 * 1024;
/// Directory-arena key standing in for the FAT12/16 fixed root region,
/// which (unlike every other directory) has no cluster number of its own.
/// Real data clusters start at 2, so 0 never collides (dir.rs uses the
/// same convention for root's own `..`, §3).
const FIXED_ROOT_KEY: u32 = 0;

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub reproducible: bool,
    pub source_date_epoch: Option<i64>,
    pub cache_capacity: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            reproducible: false,
            source_date_epoch: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub bytes_per_sector: u16,
    /// Force a cluster size instead of picking one from the §4.8 size
    /// table keyed on the backend's window size.
    pub sectors_per_cluster: Option<u8>,
    pub num_fats: u8,
    pub media: u8,
    pub volume_label: [u8; 11],
    /// Force a width instead of picking one from the backend's size.
    pub fat_type: Option<FatType>,
    pub reproducible: bool,
    pub source_date_epoch: Option<i64>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            bytes_per_sector: 512,
            sectors_per_cluster: None,
            num_fats: 2,
            media: 0xF8,
            volume_label: *b"NO NAME    ",
            fat_type: None,
            reproducible: false,
            source_date_epoch: None,
        }
    }
}

/// §4.8 format-time cluster-size table, keyed on the volume's total byte
/// size: small volumes get small clusters, large volumes get large ones so
/// the FAT itself doesn't grow unreasonably.
fn default_sectors_per_cluster(volume_size: u64) -> u8 {
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;
    if volume_size <= 260 * MIB {
        1
    } else if volume_size <= 8 * GIB {
        8
    } else if volume_size <= 16 * GIB {
        16
    } else if volume_size <= 32 * GIB {
        32
    } else {
        64
    }
}

pub struct Filesystem<B: Backend> {
    backend: B,
    window: DiskWindow,
    boot: BootSector,
    boot_dirty: bool,
    fsis: Option<Fsis>,
    fat: FatTable,
    cache: BlockCache,
    dirs: HashMap<u32, Directory>,
    dirty_dirs: HashSet<u32>,
    /// child arena key -> parent arena key, populated as directories are
    /// discovered while walking a path. Needed because `Directory::parse`
    /// drops `.`/`..` entries (dir.rs), so a directory alone cannot answer
    /// "who is my parent" (§4.8 path resolution).
    parents: HashMap<u32, u32>,
    clock: Clock,
    read_only: bool,
}

impl<B: Backend> Filesystem<B> {
    /// `Create`: write a fresh boot sector, FAT(s), FSIS (FAT32 only) and
    /// an empty root directory, per §4.8.
    pub fn format(mut backend: B, window: DiskWindow, opts: FormatOptions) -> Result<Self> {
        let bytes_per_sector = opts.bytes_per_sector as u32;
        let total_sectors = (window.size / bytes_per_sector as u64) as u32;

        let fat_type = opts.fat_type.unwrap_or_else(|| {
            if total_sectors < 8_400 {
                FatType::Fat12
            } else if total_sectors < 1_048_576 {
                FatType::Fat16
            } else {
                FatType::Fat32
            }
        });
        let is_fat32 = matches!(fat_type, FatType::Fat32);
        let sectors_per_cluster = opts
            .sectors_per_cluster
            .unwrap_or_else(|| default_sectors_per_cluster(window.size));

        let root_ent_cnt: u16 = if is_fat32 { 0 } else { 512 };
        let root_dir_sectors = (root_ent_cnt as u32 * 32 + bytes_per_sector - 1) / bytes_per_sector;
        let reserved_sectors: u32 = if is_fat32 { 32 } else { 1 };

        // Microsoft FAT spec's closed-form FATSz solution (fatgen103 §on
        // formatting): avoids iterating to a fixed point.
        let tmp1 = total_sectors.saturating_sub(reserved_sectors + root_dir_sectors);
        let mut tmp2 = 256 * sectors_per_cluster as u32 + opts.num_fats as u32;
        if is_fat32 {
            tmp2 /= 2;
        }
        let fat_sz = (tmp1 + tmp2 - 1) / tmp2.max(1);

        let bpb = BasicBpb {
            byts_per_sec: opts.bytes_per_sector,
            sec_per_clus: sectors_per_cluster,
            rsvd_sec_cnt: reserved_sectors as u16,
            num_fats: opts.num_fats,
            root_ent_cnt,
            tot_sec16: if total_sectors < 0x1_0000 { total_sectors as u16 } else { 0 },
            media: opts.media,
            fat_sz16: if is_fat32 { 0 } else { fat_sz as u16 },
            sec_per_trk: 63,
            num_heads: 255,
            hidd_sec: 0,
            tot_sec32: if total_sectors >= 0x1_0000 { total_sectors } else { 0 },
        };

        let extended = if is_fat32 {
            Extended::Fat32(Ebpb32 {
                fat_sz32: fat_sz,
                ext_flags: 0,
                fs_ver: 0,
                root_clus: 2,
                fs_info: 1,
                bk_boot_sec: 6,
                reserved: [0; 12],
                bs_drv_num: 0x80,
                bs_reserved1: 0,
                bs_boot_sig: 0x29,
                bs_vol_id: 0,
                bs_vol_lab: opts.volume_label,
                bs_fil_sys_type: *b"FAT32   ",
            })
        } else {
            Extended::Legacy(Ebpb1216 {
                bs_drv_num: 0x80,
                bs_reserved1: 0,
                bs_boot_sig: 0x29,
                bs_vol_id: 0,
                bs_vol_lab: opts.volume_label,
                bs_fil_sys_type: if matches!(fat_type, FatType::Fat12) {
                    *b"FAT12   "
                } else {
                    *b"FAT16   "
                },
            })
        };

        let boot = BootSector {
            bs_jmp_boot: [0xEB, 0x58, 0x90],
            bs_oem_name: *b"FATENGIN",
            bpb,
            extended,
            boot_code: Vec::new(),
        };
        window.write_at(&mut backend, &boot.emit(), 0)?;

        let max_cluster = boot.data_cluster_cnt() + 1;
        let fat = FatTable::new_formatted(fat_type, max_cluster, opts.media);
        let fsis = if is_fat32 {
            Some(Fsis::new(fat.free_count(), FIRST_DATA_CLUSTER))
        } else {
            None
        };
        let clock = Clock::resolve(opts.reproducible, opts.source_date_epoch);

        let mut fs = Self {
            backend,
            window,
            boot,
            boot_dirty: false,
            fsis,
            fat,
            cache: BlockCache::new(DEFAULT_CACHE_CAPACITY),
            dirs: HashMap::new(),
            dirty_dirs: HashSet::new(),
            parents: HashMap::new(),
            clock,
            read_only: false,
        };

        let root_key = fs.root_key();
        fs.parents.insert(root_key, root_key);
        if is_fat32 {
            fs.fat.set_eoc(2);
            let empty = vec![0u8; fs.boot.bytes_per_cluster() as usize];
            fs.cache.write(2, &empty, &mut fs.backend, &fs.window, &fs.boot)?;
        } else {
            let first_sector = fs.boot.first_root_dir_sector();
            let sector_count = fs.boot.root_dir_sectors();
            let len = sector_count as u64 * fs.boot.bytes_per_sector() as u64;
            let offset = first_sector as u64 * fs.boot.bytes_per_sector() as u64;
            fs.window.write_at(&mut fs.backend, &vec![0u8; len as usize], offset)?;
        }
        let mut root = Directory::empty(fs.root_location());
        root.set_volume_label(&opts.volume_label, &fs.clock);
        fs.dirs.insert(root_key, root);
        fs.dirty_dirs.insert(root_key);
        fs.flush_dir(root_key)?;

        fs.sync()?;
        info!("formatted {fat_type:?} filesystem, {} free clusters", fs.fat.free_count());
        Ok(fs)
    }

    /// `Mount`: parse the boot sector, FSIS and FAT, and stage the root
    /// directory (§4.8).
    pub fn mount(backend: B, window: DiskWindow, opts: MountOptions) -> Result<Self> {
        if window.size < MIN_VOLUME_SIZE {
            return Err(Error::InvalidBootSector {
                reason: format!("volume size {} is below the {MIN_VOLUME_SIZE}-byte minimum", window.size),
            });
        }
        let mut boot_bytes = vec![0u8; BOOT_SECTOR_SIZE];
        window.read_at(&backend, &mut boot_bytes, 0)?;
        let boot = BootSector::parse(&boot_bytes)?;
        let fat_type = boot.fat_type();
        if matches!(fat_type, FatType::Fat32) && window.size > MAX_FAT32_VOLUME_SIZE {
            return Err(Error::InvalidBootSector {
                reason: format!("FAT32 volume size {} exceeds the 2 TiB maximum", window.size),
            });
        }

        let fsis = if matches!(fat_type, FatType::Fat32) {
            let mut buf = vec![0u8; fsis::FSIS_SIZE];
            let offset = boot.fs_info_sector() as u64 * boot.bytes_per_sector() as u64;
            window.read_at(&backend, &mut buf, offset)?;
            Some(Fsis::parse(&buf)?)
        } else {
            None
        };

        let fat_offset = boot.first_fat_sector() as u64 * boot.bytes_per_sector() as u64;
        let fat_len = boot.fat_sz() as u64 * boot.bytes_per_sector() as u64;
        let mut fat_bytes = vec![0u8; fat_len as usize];
        window.read_at(&backend, &mut fat_bytes, fat_offset)?;
        let max_cluster = boot.data_cluster_cnt() + 1;
        let mut fat = FatTable::load(&fat_bytes, fat_type, max_cluster);
        if let Some(f) = &fsis {
            if f.next_free_cluster != fsis::UNKNOWN {
                fat.set_next_free_hint(f.next_free_cluster);
            }
        }

        let clock = Clock::resolve(opts.reproducible, opts.source_date_epoch);
        let mut fs = Self {
            backend,
            window,
            boot,
            boot_dirty: false,
            fsis,
            fat,
            cache: BlockCache::new(opts.cache_capacity.max(1)),
            dirs: HashMap::new(),
            dirty_dirs: HashSet::new(),
            parents: HashMap::new(),
            clock,
            read_only: opts.read_only,
        };

        let root_key = fs.root_key();
        fs.parents.insert(root_key, root_key);
        fs.load_dir(root_key)?;
        info!("mounted {fat_type:?} filesystem, {} free clusters", fs.fat.free_count());
        Ok(fs)
    }

    pub fn fat_type(&self) -> FatType {
        self.boot.fat_type()
    }

    pub fn free_clusters(&self) -> u32 {
        self.fat.free_count()
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.boot.bytes_per_cluster()
    }

    pub fn label(&self) -> String {
        String::from_utf8_lossy(trim_trailing_spaces(&self.boot.volume_label()))
            .trim_end()
            .to_string()
    }

    pub fn set_label(&mut self, label: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyFilesystem);
        }
        let mut bytes = [0x20u8; 11];
        let src = label.as_bytes();
        let len = src.len().min(11);
        bytes[..len].copy_from_slice(&src[..len]);
        self.boot.set_volume_label(bytes);
        self.boot_dirty = true;

        let root_key = self.root_key();
        self.load_dir(root_key)?;
        let clock = self.clock;
        self.dirs.get_mut(&root_key).unwrap().set_volume_label(&bytes, &clock);
        self.dirty_dirs.insert(root_key);
        self.flush_dir(root_key)?;
        Ok(())
    }

    /// Write back every dirty directory, cached cluster, FAT copy, FSIS
    /// and boot sector. Callers are responsible for calling this (or
    /// relying on per-operation flushes) — there is no implicit flush on
    /// drop, matching the no-journal, no-implicit-recovery non-goal (§9).
    pub fn sync(&mut self) -> Result<()> {
        for key in self.dirty_dirs.clone() {
            self.flush_dir(key)?;
        }
        self.cache.flush_all(&mut self.backend, &self.window, &self.boot)?;
        self.flush_fat()?;
        self.flush_fsis()?;
        self.flush_boot()?;
        Ok(())
    }

    fn flush_fat(&mut self) -> Result<()> {
        for i in 0..self.boot.num_fats() {
            let offset =
                (self.boot.first_fat_sector() as u64 + i as u64 * self.boot.fat_sz() as u64) * self.boot.bytes_per_sector() as u64;
            self.window.write_at(&mut self.backend, self.fat.emit(), offset)?;
        }
        Ok(())
    }

    /// The free-count/next-free hint are cheap to recompute and rewrite
    /// on every `sync`, so — unlike `boot_dirty`, which guards a real
    /// byte-for-byte-unchanged fast path — this doesn't track a fine-grained
    /// dirty bit per allocation; it just stays current across any session
    /// that ever calls `allocate`/`free` (§4.3: "updated after every
    /// allocation and after flush").
    fn flush_fsis(&mut self) -> Result<()> {
        if let Some(fsis) = &mut self.fsis {
            fsis.free_cluster_cnt = self.fat.free_count();
            let offset = self.boot.fs_info_sector() as u64 * self.boot.bytes_per_sector() as u64;
            self.window.write_at(&mut self.backend, &fsis.emit(), offset)?;
        }
        Ok(())
    }

    fn flush_boot(&mut self) -> Result<()> {
        if self.boot_dirty {
            self.window.write_at(&mut self.backend, &self.boot.emit(), 0)?;
            self.boot_dirty = false;
        }
        Ok(())
    }

    fn root_key(&self) -> u32 {
        if matches!(self.boot.fat_type(), FatType::Fat32) {
            self.boot.root_cluster()
        } else {
            FIXED_ROOT_KEY
        }
    }

    fn root_location(&self) -> DirLocation {
        if matches!(self.boot.fat_type(), FatType::Fat32) {
            DirLocation::Root(Root::Chain { cluster: self.boot.root_cluster() })
        } else {
            DirLocation::Root(Root::FixedRegion {
                first_sector: self.boot.first_root_dir_sector(),
                sector_count: self.boot.root_dir_sectors(),
            })
        }
    }

    fn dir_key(location: DirLocation) -> u32 {
        match location {
            DirLocation::Root(Root::FixedRegion { .. }) => FIXED_ROOT_KEY,
            DirLocation::Root(Root::Chain { cluster }) | DirLocation::Sub { cluster } => cluster,
        }
    }

    fn load_dir(&mut self, key: u32) -> Result<()> {
        if self.dirs.contains_key(&key) {
            return Ok(());
        }
        let location = if key == self.root_key() {
            self.root_location()
        } else {
            DirLocation::Sub { cluster: key }
        };
        let bytes = self.read_dir_bytes(location)?;
        self.dirs.insert(key, Directory::parse(location, &bytes));
        Ok(())
    }

    fn read_dir_bytes(&mut self, location: DirLocation) -> Result<Vec<u8>> {
        match location {
            DirLocation::Root(Root::FixedRegion { first_sector, sector_count }) => {
                let len = sector_count as u64 * self.boot.bytes_per_sector() as u64;
                let mut buf = vec![0u8; len as usize];
                let offset = first_sector as u64 * self.boot.bytes_per_sector() as u64;
                self.window.read_at(&self.backend, &mut buf, offset)?;
                Ok(buf)
            }
            DirLocation::Root(Root::Chain { cluster }) | DirLocation::Sub { cluster } => {
                let chain = self.fat.chain(cluster)?;
                let mut buf = Vec::with_capacity(chain.len() * self.boot.bytes_per_cluster() as usize);
                for c in chain {
                    let data = self.cache.read(c, &mut self.backend, &self.window, &self.boot)?;
                    buf.extend_from_slice(data);
                }
                Ok(buf)
            }
        }
    }

    fn flush_dir(&mut self, key: u32) -> Result<()> {
        let Some(dir) = self.dirs.get(&key) else {
            return Ok(());
        };
        let location = dir.location;
        let mut bytes = dir.serialize();
        match location {
            DirLocation::Root(Root::FixedRegion { first_sector, sector_count }) => {
                let region_len = sector_count as u64 * self.boot.bytes_per_sector() as u64;
                bytes.resize(region_len as usize, 0);
                let offset = first_sector as u64 * self.boot.bytes_per_sector() as u64;
                self.window.write_at(&mut self.backend, &bytes, offset)?;
            }
            DirLocation::Root(Root::Chain { cluster }) | DirLocation::Sub { cluster } => {
                let prefix = if matches!(location, DirLocation::Sub { .. }) {
                    let parent = *self.parents.get(&cluster).unwrap_or(&cluster);
                    Directory::new_subdir_entries(cluster, parent, &self.clock)
                } else {
                    Vec::new()
                };
                let mut full = prefix;
                full.extend_from_slice(&bytes);
                self.write_chain_content(cluster, &full)?;
            }
        }
        self.dirty_dirs.remove(&key);
        Ok(())
    }

    /// Grow or shrink `first_cluster`'s chain to fit `data`, writing it
    /// cluster by cluster (zero-padding the final cluster).
    fn write_chain_content(&mut self, first_cluster: u32, data: &[u8]) -> Result<()> {
        let bpc = self.boot.bytes_per_cluster() as usize;
        let needed = ((data.len() + bpc - 1) / bpc).max(1);
        let mut chain = self.fat.chain(first_cluster)?;
        if chain.len() < needed {
            chain = self.fat.allocate(needed - chain.len(), Some(first_cluster))?;
        } else if chain.len() > needed {
            let (keep, drop) = chain.split_at(needed);
            let drop = drop.to_vec();
            self.fat.set_eoc(*keep.last().unwrap());
            self.fat.free(&drop);
            chain.truncate(needed);
        }
        for (i, &cluster) in chain.iter().enumerate() {
            let start = i * bpc;
            let end = (start + bpc).min(data.len());
            let mut block = vec![0u8; bpc];
            if start < data.len() {
                block[..end - start].copy_from_slice(&data[start..end]);
            }
            self.cache.write(cluster, &block, &mut self.backend, &self.window, &self.boot)?;
        }
        Ok(())
    }

    fn ensure_chain_capacity(&mut self, first_cluster: u32, needed_bytes: u64) -> Result<(u32, Vec<u32>)> {
        let bpc = self.boot.bytes_per_cluster() as u64;
        let needed_clusters = ((needed_bytes + bpc - 1) / bpc).max(1) as usize;
        if first_cluster == 0 {
            if needed_bytes == 0 {
                return Ok((0, Vec::new()));
            }
            let chain = self.fat.allocate(needed_clusters, None)?;
            return Ok((chain[0], chain));
        }
        let mut chain = self.fat.chain(first_cluster)?;
        if chain.len() < needed_clusters {
            chain = self.fat.allocate(needed_clusters - chain.len(), Some(first_cluster))?;
        }
        Ok((first_cluster, chain))
    }

    fn split_components(path: &str) -> Vec<&str> {
        path.split('/').filter(|s| !s.is_empty() && *s != ".").collect()
    }

    fn walk(&mut self, components: &[&str]) -> Result<u32> {
        let mut key = self.root_key();
        for comp in components {
            if *comp == ".." {
                key = *self.parents.get(&key).unwrap_or(&key);
                continue;
            }
            self.load_dir(key)?;
            let child = {
                let dir = self.dirs.get(&key).unwrap();
                let entry = dir.find(comp).ok_or_else(|| Error::NotFound { path: comp.to_string() })?;
                if !entry.is_dir() {
                    return Err(Error::NotADirectory { path: comp.to_string() });
                }
                entry.first_cluster
            };
            self.parents.entry(child).or_insert(key);
            key = child;
        }
        Ok(key)
    }

    fn resolve_dir(&mut self, path: &str) -> Result<u32> {
        self.walk(&Self::split_components(path))
    }

    fn resolve_parent(&mut self, path: &str) -> Result<(u32, String)> {
        let comps = Self::split_components(path);
        let (last, rest) = comps
            .split_last()
            .ok_or_else(|| Error::InvalidName { name: path.to_string() })?;
        let key = self.walk(rest)?;
        Ok((key, (*last).to_string()))
    }

    pub fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let key = self.resolve_dir(path)?;
        self.load_dir(key)?;
        Ok(self.dirs.get(&key).unwrap().visible_entries().cloned().collect())
    }

    /// Resolves the deepest existing ancestor and creates every missing
    /// component beneath it (§4.8). Idempotent on a path that already
    /// names a directory, at any depth.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyFilesystem);
        }
        let mut key = self.root_key();
        for comp in Self::split_components(path) {
            if comp == ".." {
                key = *self.parents.get(&key).unwrap_or(&key);
                continue;
            }
            self.load_dir(key)?;
            let existing = self.dirs.get(&key).unwrap().find(comp).cloned();
            key = match existing {
                Some(entry) if entry.is_dir() => {
                    self.parents.entry(entry.first_cluster).or_insert(key);
                    entry.first_cluster
                }
                Some(_) => return Err(Error::NotADirectory { path: path.to_string() }),
                None => self.create_child_dir(key, comp)?,
            };
        }
        Ok(())
    }

    fn create_child_dir(&mut self, parent_key: u32, name: &str) -> Result<u32> {
        let chain = self.fat.allocate(1, None)?;
        let new_cluster = chain[0];
        let mut content = Directory::new_subdir_entries(new_cluster, parent_key, &self.clock);
        content.resize(self.boot.bytes_per_cluster() as usize, 0);
        self.cache.write(new_cluster, &content, &mut self.backend, &self.window, &self.boot)?;

        let clock = self.clock;
        let dir = self.dirs.get_mut(&parent_key).unwrap();
        dir.create_entry(name, new_cluster, true, &clock)?;
        self.dirty_dirs.insert(parent_key);
        self.flush_dir(parent_key)?;

        self.dirs.insert(new_cluster, Directory::empty(DirLocation::Sub { cluster: new_cluster }));
        self.parents.insert(new_cluster, parent_key);
        Ok(new_cluster)
    }

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        if flags.write && self.read_only {
            return Err(Error::ReadOnlyFilesystem);
        }
        let (parent_key, name) = self.resolve_parent(path)?;
        self.load_dir(parent_key)?;
        let existing = self.dirs.get(&parent_key).unwrap().find(&name).cloned();

        let (first_cluster, len) = match existing {
            Some(entry) if entry.is_dir() => {
                // Opening a directory succeeds only for pure read access;
                // the handle always reads as EOF rather than exposing the
                // raw directory stream as file bytes (§4.8).
                if flags.write || flags.create || flags.truncate || flags.append {
                    return Err(Error::IsADirectory { path: path.to_string() });
                }
                (entry.first_cluster, 0u64)
            }
            Some(entry) => {
                if flags.truncate && flags.write {
                    if entry.first_cluster != 0 {
                        let old_chain = self.fat.chain(entry.first_cluster)?;
                        self.fat.free(&old_chain);
                        for c in old_chain {
                            self.cache.invalidate(c);
                        }
                    }
                    let clock = self.clock;
                    let dir = self.dirs.get_mut(&parent_key).unwrap();
                    dir.set_file_size(&name, 0, &clock)?;
                    dir.set_first_cluster(&name, 0)?;
                    self.dirty_dirs.insert(parent_key);
                    self.flush_dir(parent_key)?;
                    (0u32, 0u64)
                } else {
                    (entry.first_cluster, entry.file_size as u64)
                }
            }
            None => {
                if !flags.create {
                    return Err(Error::NotFound { path: path.to_string() });
                }
                let clock = self.clock;
                let dir = self.dirs.get_mut(&parent_key).unwrap();
                dir.create_entry(&name, 0, false, &clock)?;
                self.dirty_dirs.insert(parent_key);
                self.flush_dir(parent_key)?;
                (0u32, 0u64)
            }
        };

        let parent_location = self.dirs.get(&parent_key).unwrap().location;
        Ok(FileHandle::new(parent_location, name, first_cluster, len, flags))
    }

    pub fn read(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        handle.ensure_readable()?;
        if handle.offset >= handle.len || buf.is_empty() {
            return Ok(0);
        }
        let to_read = buf.len().min((handle.len - handle.offset) as usize);
        let bpc = self.boot.bytes_per_cluster() as u64;
        let chain = self.fat.chain(handle.first_cluster)?;
        let mut done = 0usize;
        while done < to_read {
            let abs = handle.offset + done as u64;
            let idx = (abs / bpc) as usize;
            let in_off = (abs % bpc) as usize;
            let cluster = *chain
                .get(idx)
                .ok_or(Error::InvalidClusterChain { at: handle.first_cluster })?;
            let data = self.cache.read(cluster, &mut self.backend, &self.window, &self.boot)?;
            let take = (data.len() - in_off).min(to_read - done);
            buf[done..done + take].copy_from_slice(&data[in_off..in_off + take]);
            done += take;
        }
        handle.offset += done as u64;
        Ok(done)
    }

    pub fn write(&mut self, handle: &mut FileHandle, buf: &[u8]) -> Result<usize> {
        handle.ensure_writable()?;
        if self.read_only {
            return Err(Error::ReadOnlyFilesystem);
        }
        if handle.flags.append {
            handle.offset = handle.len;
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let new_end = handle.offset + buf.len() as u64;
        if new_end > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge);
        }

        let (first_cluster, chain) = self.ensure_chain_capacity(handle.first_cluster, new_end)?;
        handle.first_cluster = first_cluster;

        let bpc = self.boot.bytes_per_cluster() as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let abs = handle.offset + done as u64;
            let idx = (abs / bpc) as usize;
            let in_off = (abs % bpc) as usize;
            let cluster = chain[idx];
            let mut block = self.cache.read(cluster, &mut self.backend, &self.window, &self.boot)?.to_vec();
            let take = (block.len() - in_off).min(buf.len() - done);
            block[in_off..in_off + take].copy_from_slice(&buf[done..done + take]);
            self.cache.write(cluster, &block, &mut self.backend, &self.window, &self.boot)?;
            done += take;
        }
        handle.offset += done as u64;
        if handle.offset > handle.len {
            handle.len = handle.offset;
            handle.size_dirty = true;
        }
        Ok(done)
    }

    /// Bulk path for a source whose length isn't known up front: reads and
    /// writes in 16 MiB chunks so a long stream doesn't scan the FAT once
    /// per small write. Still honours the 4 GiB ceiling mid-stream, since
    /// every chunk goes through the same `write` that enforces it (§4.7).
    pub fn write_from<R: std::io::Read>(&mut self, handle: &mut FileHandle, reader: &mut R) -> Result<u64> {
        const CHUNK: usize = 16 * 1024 * 1024;
        let mut buf = vec![0u8; CHUNK];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let mut written = 0;
            while written < n {
                written += self.write(handle, &buf[written..n])?;
            }
            total += n as u64;
        }
        Ok(total)
    }

    /// Expose the on-disk cluster numbers backing an open file, in chain
    /// order (§4.7). An empty file (`first_cluster == 0`) has none.
    pub fn cluster_chain(&mut self, handle: &FileHandle) -> Result<Vec<u32>> {
        if handle.first_cluster == 0 {
            return Ok(Vec::new());
        }
        self.fat.chain(handle.first_cluster)
    }

    /// Same chain as `cluster_chain`, expressed as absolute
    /// `(byte_offset, byte_len)` ranges into the backend, with consecutive
    /// clusters coalesced into a single range (§4.7).
    pub fn disk_ranges(&mut self, handle: &FileHandle) -> Result<Vec<(u64, u64)>> {
        let chain = self.cluster_chain(handle)?;
        let bpc = self.boot.bytes_per_cluster() as u64;
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for cluster in chain {
            let offset = self.window.start_offset + self.boot.offset_of_cluster(cluster);
            match ranges.last_mut() {
                Some((start, len)) if *start + *len == offset => *len += bpc,
                _ => ranges.push((offset, bpc)),
            }
        }
        Ok(ranges)
    }

    pub fn close(&mut self, mut handle: FileHandle) -> Result<()> {
        handle.ensure_open()?;
        if handle.size_dirty || !handle.pending_attrs.is_empty() {
            let key = Self::dir_key(handle.parent);
            self.load_dir(key)?;
            let clock = self.clock;
            let dir = self.dirs.get_mut(&key).unwrap();
            if handle.size_dirty {
                dir.set_file_size(&handle.name, handle.len as u32, &clock)?;
                dir.set_first_cluster(&handle.name, handle.first_cluster)?;
            }
            for (attr, value) in handle.pending_attrs.drain(..) {
                dir.set_attributes(&handle.name, attr, value)?;
            }
            self.dirty_dirs.insert(key);
            self.flush_dir(key)?;
        }
        handle.mark_closed();
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyFilesystem);
        }
        let (parent_key, name) = self.resolve_parent(path)?;
        self.load_dir(parent_key)?;
        let entry = self
            .dirs
            .get(&parent_key)
            .unwrap()
            .find(&name)
            .cloned()
            .ok_or_else(|| Error::NotFound { path: path.to_string() })?;

        if entry.is_dir() {
            let child_key = entry.first_cluster;
            self.load_dir(child_key)?;
            if !self.dirs.get(&child_key).unwrap().is_empty_of_user_entries() {
                return Err(Error::DirectoryNotEmpty { path: path.to_string() });
            }
            self.dirs.remove(&child_key);
            self.parents.remove(&child_key);
        }
        if entry.first_cluster != 0 {
            let chain = self.fat.chain(entry.first_cluster)?;
            self.fat.free(&chain);
            for c in chain {
                self.cache.invalidate(c);
            }
        }
        let dir = self.dirs.get_mut(&parent_key).unwrap();
        dir.remove_entry(&name)?;
        self.dirty_dirs.insert(parent_key);
        self.flush_dir(parent_key)?;
        self.flush_fat()?;
        Ok(())
    }

    /// Same-directory renames are a pure bookkeeping change. Cross-directory
    /// moves append the existing entry to the new parent and remove it from
    /// the old one (§4.8 step 4), carrying attributes and timestamps over
    /// intact — only the short/long name fields change.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyFilesystem);
        }
        let (src_parent, src_name) = self.resolve_parent(from)?;
        let (dst_parent, dst_name) = self.resolve_parent(to)?;
        self.load_dir(src_parent)?;
        self.load_dir(dst_parent)?;

        if self.dirs.get(&dst_parent).unwrap().find(&dst_name).is_some() {
            return Err(Error::AlreadyExists { path: to.to_string() });
        }
        let entry = self
            .dirs
            .get(&src_parent)
            .unwrap()
            .find(&src_name)
            .cloned()
            .ok_or_else(|| Error::NotFound { path: from.to_string() })?;

        if src_parent == dst_parent {
            let dir = self.dirs.get_mut(&src_parent).unwrap();
            dir.rename_entry(&src_name, &dst_name)?;
            self.dirty_dirs.insert(src_parent);
            self.flush_dir(src_parent)?;
            return Ok(());
        }

        self.dirs.get_mut(&src_parent).unwrap().remove_entry(&src_name)?;
        self.dirty_dirs.insert(src_parent);
        self.flush_dir(src_parent)?;

        let dst_dir = self.dirs.get_mut(&dst_parent).unwrap();
        dst_dir.insert_existing_entry(&dst_name, &entry)?;
        self.dirty_dirs.insert(dst_parent);
        self.flush_dir(dst_parent)?;

        if entry.is_dir() {
            self.parents.insert(entry.first_cluster, dst_parent);
        }
        Ok(())
    }

    /// Reclaim the backend, e.g. to inspect or remount the image bytes
    /// after the `Filesystem` itself is no longer needed.
    pub fn into_backend(self) -> B {
        self.backend
    }
}

fn trim_trailing_spaces(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0x20).map(|i| i + 1).unwrap_or(0);
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn small_fs() -> Filesystem<MemoryBackend> {
        let backend = MemoryBackend::new(4 * 1024 * 1024);
        let window = DiskWindow::whole_backend(backend.size(), 512);
        let opts = FormatOptions {
            reproducible: true,
            source_date_epoch: Some(1_609_459_200),
            ..FormatOptions::default()
        };
        Filesystem::format(backend, window, opts).unwrap()
    }

    #[test]
    fn format_mount_create_read_roundtrip() {
        let mut fs = small_fs();
        let mut h = fs.open("hello.txt", OpenFlags::create_write()).unwrap();
        fs.write(&mut h, b"hello world").unwrap();
        fs.close(h).unwrap();

        let mut h = fs.open("hello.txt", OpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 11];
        let n = fs.read(&mut h, &mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn large_file_spans_multiple_clusters() {
        let mut fs = small_fs();
        let bpc = fs.bytes_per_cluster() as usize;
        let payload = vec![0x5Au8; bpc * 3 + 17];
        let mut h = fs.open("big.bin", OpenFlags::create_write()).unwrap();
        fs.write(&mut h, &payload).unwrap();
        fs.close(h).unwrap();

        let mut h = fs.open("big.bin", OpenFlags::read_only()).unwrap();
        let mut buf = vec![0u8; payload.len()];
        fs.read(&mut h, &mut buf).unwrap();
        assert_eq!(buf, payload);
    }

    #[test]
    fn write_past_4gib_ceiling_is_rejected_before_any_write() {
        let mut fs = small_fs();
        let mut h = fs.open("huge.bin", OpenFlags::create_write()).unwrap();
        h.seek(crate::file::SeekFrom::Start(MAX_FILE_SIZE - 2)).unwrap();
        let free_before = fs.free_clusters();
        let err = fs.write(&mut h, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, Error::FileTooLarge));
        assert_eq!(fs.free_clusters(), free_before);
    }

    #[test]
    fn mkdir_is_case_insensitive_and_idempotent() {
        let mut fs = small_fs();
        fs.mkdir("EFI").unwrap();
        fs.mkdir("efi").unwrap();
        let entries = fs.read_dir("/").unwrap();
        assert_eq!(entries.iter().filter(|e| e.display_name().eq_ignore_ascii_case("efi")).count(), 1);
    }

    #[test]
    fn mkdir_creates_missing_ancestors() {
        let mut fs = small_fs();
        fs.mkdir("/EFI/BOOT").unwrap();
        fs.mkdir("/efi/boot").unwrap();
        let root_entries = fs.read_dir("/").unwrap();
        assert_eq!(root_entries.iter().filter(|e| e.display_name().eq_ignore_ascii_case("efi")).count(), 1);
        let sub_entries = fs.read_dir("/EFI").unwrap();
        assert!(sub_entries.iter().any(|e| e.display_name().eq_ignore_ascii_case("boot")));
    }

    #[test]
    fn rename_across_directories_moves_entry() {
        let mut fs = small_fs();
        fs.mkdir("sub").unwrap();
        let mut h = fs.open("a.txt", OpenFlags::create_write()).unwrap();
        fs.write(&mut h, b"data").unwrap();
        fs.close(h).unwrap();

        fs.rename("a.txt", "sub/a.txt").unwrap();
        assert!(fs.read_dir("/").unwrap().iter().all(|e| e.display_name() != "a.txt"));
        assert!(fs.read_dir("sub").unwrap().iter().any(|e| e.display_name() == "a.txt"));
    }

    #[test]
    fn rename_across_directories_preserves_attrs_and_timestamps() {
        let mut fs = small_fs();
        fs.mkdir("sub").unwrap();
        let mut h = fs.open("ro.txt", OpenFlags::create_write()).unwrap();
        fs.write(&mut h, b"x").unwrap();
        h.set_read_only(true).unwrap();
        h.set_hidden(true).unwrap();
        fs.close(h).unwrap();

        let before = fs.read_dir("/").unwrap().into_iter().find(|e| e.display_name() == "ro.txt").unwrap();

        fs.rename("ro.txt", "sub/ro.txt").unwrap();
        let after = fs.read_dir("sub").unwrap().into_iter().find(|e| e.display_name() == "ro.txt").unwrap();

        assert_eq!(after.attr, before.attr);
        assert!(after.attr.contains(crate::entry::Attributes::READ_ONLY));
        assert!(after.attr.contains(crate::entry::Attributes::HIDDEN));
        assert_eq!(after.created, before.created);
        assert_eq!(after.modified, before.modified);
    }

    #[test]
    fn cluster_chain_and_disk_ranges_coalesce() {
        let mut fs = small_fs();
        let bpc = fs.bytes_per_cluster() as u64;
        let mut h = fs.open("big.bin", OpenFlags::create_write()).unwrap();
        fs.write(&mut h, &vec![0x7Eu8; bpc as usize * 3 + 1]).unwrap();

        let chain = fs.cluster_chain(&h).unwrap();
        assert_eq!(chain.len(), 4);
        // a freshly allocated chain is contiguous, so the ranges coalesce
        // into exactly one (start, len) pair.
        let ranges = fs.disk_ranges(&h).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].1, bpc * 4);
        fs.close(h).unwrap();
    }

    #[test]
    fn opening_a_directory_read_only_yields_immediate_eof() {
        let mut fs = small_fs();
        fs.mkdir("sub").unwrap();
        let mut h = fs.open("sub", OpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.read(&mut h, &mut buf).unwrap(), 0);
        assert!(matches!(
            fs.open("sub", OpenFlags::create_write()),
            Err(Error::IsADirectory { .. })
        ));
    }

    #[test]
    fn format_sets_volume_label_entry_and_set_label_updates_it() {
        let mut fs = small_fs();
        let entries = fs.read_dir("/").unwrap();
        assert!(entries.is_empty(), "volume label entry must not appear in ReadDir");
        fs.set_label("NEWLABEL").unwrap();
        assert_eq!(fs.label(), "NEWLABEL");
    }

    #[test]
    fn write_from_reader_matches_single_shot_write() {
        let mut fs = small_fs();
        let bpc = fs.bytes_per_cluster() as usize;
        let payload = vec![0x3Cu8; bpc * 2 + 5];

        let mut h = fs.open("stream.bin", OpenFlags::create_write()).unwrap();
        let mut reader = std::io::Cursor::new(payload.clone());
        let n = fs.write_from(&mut h, &mut reader).unwrap();
        assert_eq!(n, payload.len() as u64);
        fs.close(h).unwrap();

        let mut h = fs.open("stream.bin", OpenFlags::read_only()).unwrap();
        let mut buf = vec![0u8; payload.len()];
        fs.read(&mut h, &mut buf).unwrap();
        assert_eq!(buf, payload);
    }

    #[test]
    fn attribute_toggle_is_deferred_until_close() {
        let mut fs = small_fs();
        let mut h = fs.open("ro.txt", OpenFlags::create_write()).unwrap();
        fs.write(&mut h, b"x").unwrap();
        h.set_read_only(true).unwrap();
        h.set_hidden(true).unwrap();
        fs.close(h).unwrap();

        let entries = fs.read_dir("/").unwrap();
        let entry = entries.iter().find(|e| e.display_name() == "ro.txt").unwrap();
        assert!(entry.attr.contains(crate::entry::Attributes::READ_ONLY));
        assert!(entry.attr.contains(crate::entry::Attributes::HIDDEN));
    }

    #[test]
    fn mount_rejects_volume_below_minimum_size() {
        let backend = MemoryBackend::new(64 * 1024);
        let window = DiskWindow::whole_backend(backend.size(), 512);
        let err = Filesystem::mount(backend, window, MountOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidBootSector { .. }));
    }

    #[test]
    fn remove_nonempty_directory_fails() {
        let mut fs = small_fs();
        fs.mkdir("sub").unwrap();
        let mut h = fs.open("sub/a.txt", OpenFlags::create_write()).unwrap();
        fs.write(&mut h, b"x").unwrap();
        fs.close(h).unwrap();
        assert!(matches!(fs.remove("sub"), Err(Error::DirectoryNotEmpty { .. })));
        fs.remove("sub/a.txt").unwrap();
        fs.remove("sub").unwrap();
    }
}
