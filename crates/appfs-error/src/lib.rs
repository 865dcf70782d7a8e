#![forbid(unsafe_code)]
//! Error types for AppFS.
//!
//! Defines `AppFsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for FUSE response codes.

use appfs_types::{BlockPos, ParseError};
use thiserror::Error;

/// Unified error type for all AppFS engine operations.
#[derive(Debug, Error)]
pub enum AppFsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A positioned read went past the end of the image.
    #[error("read past end of image")]
    Eof,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("malformed block at {pos}: {detail}")]
    Malformed { pos: BlockPos, detail: String },

    #[error("cannot extend image")]
    OutOfSpace,

    #[error("symbolic link cycle")]
    Loop,

    #[error("busy: {0}")]
    Busy(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("name too long: {0}")]
    NameTooLong(String),
}

impl AppFsError {
    /// Wrap a field-level parse failure with the block it came from.
    #[must_use]
    pub fn malformed(pos: BlockPos, err: ParseError) -> Self {
        Self::Malformed {
            pos,
            detail: err.to_string(),
        }
    }

    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Eof | Self::Malformed { .. } => libc::EIO,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::OutOfSpace => libc::ENOSPC,
            Self::Loop => libc::ELOOP,
            Self::Busy(_) => libc::EBUSY,
            Self::Exists(_) => libc::EEXIST,
            Self::NameTooLong(_) => libc::ENAMETOOLONG,
        }
    }
}

/// Result alias using `AppFsError`.
pub type Result<T> = std::result::Result<T, AppFsError>;
