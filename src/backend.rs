//! Random-access byte-level view of the image this filesystem lives inside.
//!
//! This is the seam §6 calls the collaborator interface: the outer Disk /
//! partition-table layer (out of scope here) hands the `Filesystem` a
//! `Backend` plus a `(start_offset, size)` window, and every higher layer
//! addresses the backend only through byte offsets already translated to
//! be relative to that window.

use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};

/// Random read/write access to the bytes backing an image.
///
/// Unlike the teacher's `BlockDevice` (block-aligned, `offset` and
/// `buf.len()` both multiples of `BLOCK_SIZE`), this engine needs
/// byte-granular access so the Filesystem layer can address directory
/// entries and file content at arbitrary offsets without re-deriving
/// block alignment at every call site.
pub trait Backend {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize>;
    fn size(&self) -> u64;
    fn is_read_only(&self) -> bool {
        false
    }

    /// Borrow self as a write-capable backend, or fail with
    /// `ReadOnlyBackend` if this backend was opened read-only.
    fn writable(&mut self) -> Result<&mut dyn Backend>
    where
        Self: Sized,
    {
        if self.is_read_only() {
            Err(Error::ReadOnlyBackend)
        } else {
            Ok(self)
        }
    }
}

/// The `(start_offset, size, logical_block_size)` view of the image the
/// Filesystem was handed by the (out-of-scope) partition-table layer.
#[derive(Debug, Clone, Copy)]
pub struct DiskWindow {
    pub start_offset: u64,
    pub size: u64,
    pub logical_block_size: u32,
}

impl DiskWindow {
    pub fn whole_backend(size: u64, logical_block_size: u32) -> Self {
        Self {
            start_offset: 0,
            size,
            logical_block_size,
        }
    }

    fn check(&self, offset: u64, len: u64) -> Result<u64> {
        if offset + len > self.size {
            return Err(Error::OutOfRange {
                offset,
                len,
                window_size: self.size,
            });
        }
        Ok(self.start_offset + offset)
    }

    pub fn read_at(&self, backend: &dyn Backend, buf: &mut [u8], offset: u64) -> Result<usize> {
        let abs = self.check(offset, buf.len() as u64)?;
        backend.read_at(buf, abs)
    }

    pub fn write_at(&self, backend: &mut dyn Backend, buf: &[u8], offset: u64) -> Result<usize> {
        let abs = self.check(offset, buf.len() as u64)?;
        backend.write_at(buf, abs)
    }
}

/// A plain file (or block device node) opened with `std::fs::File`, the
/// same collaborator the teacher's own std-mode example (`demos/fat32-fs-std`)
/// wires a `BlockDevice` impl around. Interior mutability via `RefCell`
/// lets `read_at` take `&self` (matching the `Backend` contract) while
/// still driving a `Seek`-based file handle underneath, consistent with
/// the single-threaded, lock-free ownership model of §5.
pub struct FileBackend {
    file: RefCell<File>,
    size: u64,
    read_only: bool,
}

impl FileBackend {
    pub fn open(file: File, read_only: bool) -> std::io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            file: RefCell::new(file),
            size,
            read_only,
        })
    }
}

impl Backend for FileBackend {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.read(buf)?)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        if self.read_only {
            return Err(Error::ReadOnlyBackend);
        }
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        let written = file.write(buf)?;
        if offset + written as u64 > self.size {
            self.size = offset + written as u64;
        }
        Ok(written)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// An in-memory backend, used by the end-to-end tests in `tests/` and
/// available to callers who want to format/inspect an image without
/// touching the filesystem (e.g. to stage bytes before writing them out).
pub struct MemoryBackend {
    data: Vec<u8>,
    read_only: bool,
}

impl MemoryBackend {
    pub fn new(size: u64) -> Self {
        Self {
            data: vec![0u8; size as usize],
            read_only: false,
        }
    }

    /// Wrap an already-formatted image's bytes, e.g. to remount one that
    /// was just produced by `MemoryBackend::into_vec`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, read_only: false }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Backend for MemoryBackend {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let offset = offset as usize;
        let end = (offset + buf.len()).min(self.data.len());
        if offset >= end {
            return Ok(0);
        }
        let len = end - offset;
        buf[..len].copy_from_slice(&self.data[offset..end]);
        Ok(len)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        if self.read_only {
            return Err(Error::ReadOnlyBackend);
        }
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
