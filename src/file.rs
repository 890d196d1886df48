//! Open-file handle: cursor state over a cluster chain.
//!
//! `FileHandle` carries no reference back to the `Filesystem` — only the
//! directory location and name needed to flush a changed size back to the
//! owning entry. All actual I/O (`Filesystem::read`/`write`/`close`) goes
//! through the `Filesystem` that owns the cache, FAT and backend, which is
//! what keeps this arena-of-plain-values instead of the source's
//! `Arc<RwLock<VirtFile>>` handles (§9).

use crate::dir::DirLocation;
use crate::entry::Attributes;
use crate::error::{Error, Result};

/// One past the largest byte offset a FAT `DIR_FileSize` field (a `u32`)
/// can express (§4.7, §9 non-goal boundary).
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub append: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self { read: true, write: false, create: false, append: false, truncate: false }
    }

    pub fn read_write() -> Self {
        Self { read: true, write: true, create: false, append: false, truncate: false }
    }

    pub fn create_write() -> Self {
        Self { read: true, write: true, create: true, append: false, truncate: false }
    }

    pub fn with_append(mut self) -> Self {
        self.append = true;
        self
    }

    pub fn with_truncate(mut self) -> Self {
        self.truncate = true;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// An open regular file. Directories are never opened through this path
/// (`Filesystem::read_dir` walks a `Directory` directly, §4.8).
pub struct FileHandle {
    pub(crate) parent: DirLocation,
    pub(crate) name: String,
    pub(crate) first_cluster: u32,
    pub(crate) len: u64,
    pub(crate) offset: u64,
    pub(crate) flags: OpenFlags,
    pub(crate) size_dirty: bool,
    pub(crate) pending_attrs: Vec<(Attributes, bool)>,
    closed: bool,
}

impl FileHandle {
    pub(crate) fn new(parent: DirLocation, name: String, first_cluster: u32, len: u64, flags: OpenFlags) -> Self {
        let offset = if flags.append { len } else { 0 };
        Self {
            parent,
            name,
            first_cluster,
            len,
            offset,
            flags,
            size_dirty: false,
            pending_attrs: Vec::new(),
            closed: false,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&self) -> u64 {
        self.offset
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn ensure_readable(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.flags.read {
            return Err(Error::ReadOnlyFilesystem);
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.flags.write {
            return Err(Error::ReadOnlyFilesystem);
        }
        Ok(())
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_open()?;
        let base = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(delta) => offset_by(self.offset, delta)?,
            SeekFrom::End(delta) => offset_by(self.len, delta)?,
        };
        self.offset = base;
        Ok(self.offset)
    }

    /// Queue an attribute bit flip; not written back until `Close` (§4.7).
    fn queue_attr(&mut self, attr: Attributes, value: bool) -> Result<()> {
        self.ensure_open()?;
        self.pending_attrs.push((attr, value));
        Ok(())
    }

    pub fn set_read_only(&mut self, value: bool) -> Result<()> {
        self.queue_attr(Attributes::READ_ONLY, value)
    }

    pub fn set_hidden(&mut self, value: bool) -> Result<()> {
        self.queue_attr(Attributes::HIDDEN, value)
    }

    pub fn set_system(&mut self, value: bool) -> Result<()> {
        self.queue_attr(Attributes::SYSTEM, value)
    }
}

fn offset_by(base: u64, delta: i64) -> Result<u64> {
    if delta >= 0 {
        Ok(base.saturating_add(delta as u64))
    } else {
        base.checked_sub((-delta) as u64).ok_or(Error::InvalidSeek)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::Root;

    fn handle(len: u64, flags: OpenFlags) -> FileHandle {
        FileHandle::new(DirLocation::Root(Root::Chain { cluster: 2 }), "a.txt".into(), 5, len, flags)
    }

    #[test]
    fn append_mode_starts_at_end() {
        let h = handle(10, OpenFlags::read_write().with_append());
        assert_eq!(h.position(), 10);
    }

    #[test]
    fn seek_before_start_errs() {
        let mut h = handle(10, OpenFlags::read_write());
        assert!(matches!(h.seek(SeekFrom::Current(-1)), Err(Error::InvalidSeek)));
    }

    #[test]
    fn closed_handle_rejects_io() {
        let mut h = handle(10, OpenFlags::read_write());
        h.mark_closed();
        assert!(matches!(h.ensure_readable(), Err(Error::Closed)));
    }
}
