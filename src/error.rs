//! Crate-wide error type.
//!
//! One flat enum covers every taxonomic class from the on-disk invariant
//! violations (mount-time) through resource exhaustion, path validation,
//! backend I/O, and use-after-close. Internal codecs still return narrower
//! enums (`FatError`, `DirError`, ...) and get folded into this one at the
//! module boundary, the same layering the block-cache/FAT/dir split already
//! used internally.

use std::string::String;
use thiserror::Error;

/// The component of the FSIS whose signature failed to validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsisSignature {
    Lead,
    Struct,
    Trail,
}

impl core::fmt::Display for FsisSignature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            FsisSignature::Lead => "lead",
            FsisSignature::Struct => "struct",
            FsisSignature::Trail => "trail",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum Error {
    // -- Backend I/O (class 4) --
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("offset {offset} + len {len} is outside the backend window of size {window_size}")]
    OutOfRange {
        offset: u64,
        len: u64,
        window_size: u64,
    },
    #[error("backend is read-only")]
    ReadOnlyBackend,

    // -- Invariant violations in the on-disk image (class 1) --
    #[error("invalid boot sector: {reason}")]
    InvalidBootSector { reason: String },
    #[error("invalid FSIS signature ({which})")]
    InvalidFsis { which: FsisSignature },
    #[error("start cluster {cluster} is invalid (must be in 2..={max_cluster})")]
    InvalidStartCluster { cluster: u32, max_cluster: u32 },
    #[error("cluster chain broken at cluster {at}")]
    InvalidClusterChain { at: u32 },

    // -- Resource exhaustion (class 2) --
    #[error("not enough free clusters to satisfy the request")]
    NoSpace,
    #[error("file would exceed the 4 GiB FAT size limit")]
    FileTooLarge,

    // -- Validation (class 3) --
    #[error("path not found: {path}")]
    NotFound { path: String },
    #[error("path already exists: {path}")]
    AlreadyExists { path: String },
    #[error("not a directory: {path}")]
    NotADirectory { path: String },
    #[error("is a directory: {path}")]
    IsADirectory { path: String },
    #[error("directory not empty: {path}")]
    DirectoryNotEmpty { path: String },
    #[error("invalid name: {name}")]
    InvalidName { name: String },

    // -- Use-after-close (class 5) --
    #[error("operation attempted on a closed handle")]
    Closed,

    // -- Filesystem is mounted read-only or the handle was opened read-only --
    #[error("filesystem or handle is read-only")]
    ReadOnlyFilesystem,

    #[error("seek before start of file")]
    InvalidSeek,
}

pub type Result<T> = core::result::Result<T, Error>;
