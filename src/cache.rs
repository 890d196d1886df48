//! Per-cluster LRU block cache.
//!
//! The source kept a global `BlockCacheManager` behind `lazy_static!` and
//! `Arc<spin::Mutex<..>>` so unrelated block devices could share one
//! process-wide cache. The single-threaded, single-owner model (§5) has
//! no unrelated devices to share with, so this is a plain struct the
//! `Filesystem` owns directly and reaches with `&mut self` — `lru`
//! supplies the eviction policy, nothing supplies the locking because
//! nothing needs it.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::backend::{Backend, DiskWindow};
use crate::bpb::BootSector;
use crate::error::Result;

struct CachedCluster {
    data: Vec<u8>,
    dirty: bool,
}

pub struct BlockCache {
    capacity: usize,
    entries: LruCache<u32, CachedCluster>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap()),
        }
    }

    fn ensure_loaded<B: Backend>(
        &mut self,
        cluster: u32,
        backend: &mut B,
        window: &DiskWindow,
        boot: &BootSector,
    ) -> Result<()> {
        if self.entries.contains(&cluster) {
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            if let Some((evicted_cluster, evicted)) = self.entries.pop_lru() {
                if evicted.dirty {
                    window.write_at(backend, &evicted.data, boot.offset_of_cluster(evicted_cluster))?;
                }
            }
        }
        let mut buf = vec![0u8; boot.bytes_per_cluster() as usize];
        window.read_at(backend, &mut buf, boot.offset_of_cluster(cluster))?;
        self.entries.put(cluster, CachedCluster { data: buf, dirty: false });
        Ok(())
    }

    pub fn read<B: Backend>(
        &mut self,
        cluster: u32,
        backend: &mut B,
        window: &DiskWindow,
        boot: &BootSector,
    ) -> Result<&[u8]> {
        self.ensure_loaded(cluster, backend, window, boot)?;
        Ok(&self.entries.get(&cluster).unwrap().data)
    }

    /// Overwrite a whole cluster's cached bytes and mark it dirty, loading
    /// it first if this is the cache's first touch (needed so a partial
    /// write — less than a full cluster — has the untouched bytes to
    /// merge into, via the caller's read-modify-write).
    pub fn write<B: Backend>(
        &mut self,
        cluster: u32,
        data: &[u8],
        backend: &mut B,
        window: &DiskWindow,
        boot: &BootSector,
    ) -> Result<()> {
        self.ensure_loaded(cluster, backend, window, boot)?;
        let entry = self.entries.get_mut(&cluster).unwrap();
        entry.data.copy_from_slice(data);
        entry.dirty = true;
        Ok(())
    }

    pub fn invalidate(&mut self, cluster: u32) {
        self.entries.pop(&cluster);
    }

    pub fn flush_all<B: Backend>(&mut self, backend: &mut B, window: &DiskWindow, boot: &BootSector) -> Result<()> {
        for (&cluster, entry) in self.entries.iter_mut() {
            if entry.dirty {
                window.write_at(backend, &entry.data, boot.offset_of_cluster(cluster))?;
                entry.dirty = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::bpb::{BasicBpb, Ebpb32, Extended};

    fn boot() -> BootSector {
        BootSector {
            bs_jmp_boot: [0xEB, 0x58, 0x90],
            bs_oem_name: *b"MSWIN4.1",
            bpb: BasicBpb {
                byts_per_sec: 512,
                sec_per_clus: 1,
                rsvd_sec_cnt: 1,
                num_fats: 1,
                root_ent_cnt: 0,
                tot_sec16: 0,
                media: 0xF8,
                fat_sz16: 0,
                sec_per_trk: 0,
                num_heads: 0,
                hidd_sec: 0,
                tot_sec32: 2048,
            },
            extended: Extended::Fat32(Ebpb32 {
                fat_sz32: 8,
                ext_flags: 0,
                fs_ver: 0,
                root_clus: 2,
                fs_info: 1,
                bk_boot_sec: 0,
                reserved: [0; 12],
                bs_drv_num: 0x80,
                bs_reserved1: 0,
                bs_boot_sig: 0x29,
                bs_vol_id: 0,
                bs_vol_lab: *b"NO NAME    ",
                bs_fil_sys_type: *b"FAT32   ",
            }),
            boot_code: Vec::new(),
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut backend = MemoryBackend::new(2048 * 512);
        let window = DiskWindow::whole_backend(backend.size(), 512);
        let b = boot();
        let mut cache = BlockCache::new(2);
        let data = vec![0xABu8; b.bytes_per_cluster() as usize];
        cache.write(2, &data, &mut backend, &window, &b).unwrap();
        assert_eq!(cache.read(2, &mut backend, &window, &b).unwrap(), &data[..]);
    }

    #[test]
    fn eviction_flushes_dirty_cluster() {
        let mut backend = MemoryBackend::new(2048 * 512);
        let window = DiskWindow::whole_backend(backend.size(), 512);
        let b = boot();
        let mut cache = BlockCache::new(1);
        let data = vec![0x11u8; b.bytes_per_cluster() as usize];
        cache.write(2, &data, &mut backend, &window, &b).unwrap();
        // Touching cluster 3 evicts cluster 2, which must flush to the backend.
        cache.read(3, &mut backend, &window, &b).unwrap();
        let mut raw = vec![0u8; b.bytes_per_cluster() as usize];
        window.read_at(&backend, &mut raw, b.offset_of_cluster(2)).unwrap();
        assert_eq!(raw, data);
    }
}
