//! Read, create and mutate FAT12/FAT16/FAT32 images: boot sector and FAT
//! table codecs, short/long directory entries, directory and file
//! mutation, and the `Filesystem` façade that ties them together.
//!
//! This crate handles the filesystem layer only — it expects a `Backend`
//! already windowed onto a single partition's bytes; partition tables,
//! disk images and other filesystem drivers are out of scope (§6).

pub mod backend;
pub mod bpb;
pub mod cache;
pub mod dir;
pub mod entry;
pub mod error;
pub mod fat;
pub mod file;
pub mod fsis;
pub mod fs;
pub mod time;

pub use backend::{Backend, DiskWindow, FileBackend, MemoryBackend};
pub use bpb::{BootSector, FatType};
pub use dir::DirEntry;
pub use entry::Attributes;
pub use error::{Error, Result};
pub use file::{FileHandle, OpenFlags, SeekFrom};
pub use fs::{Filesystem, FormatOptions, MountOptions};
pub use time::Clock;
