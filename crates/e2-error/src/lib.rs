#![forbid(unsafe_code)]
//! Error types for e2mend.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `e2-types` | Byte-level format violations |
//! | Runtime | `E2Error` | `e2-error` (this crate) | Errors surfaced to the CLI and library callers |
//!
//! ## Mapping Policy: ParseError → E2Error
//!
//! `e2-error` does not depend on `e2-types`. The conversion lives in the
//! crates that touch both (`e2-image` at open time, the mutating crates while
//! the image is live):
//!
//! | ParseError Variant | E2Error Variant |
//! |--------------------|-----------------|
//! | `InsufficientData` | `Corruption { block, detail }` |
//! | `InvalidMagic` | `Format(detail)` |
//! | `InvalidField` | `Format` at open time, `Corruption` afterwards |
//! | `IntegerConversion` | `Corruption { block, detail }` |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`E2Error::to_errno`];
//! the CLI uses it as its exit status. The mapping has no wildcard arm.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `ImageUnavailable` | `ENOENT` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `InvalidPath` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `Exists` | `EEXIST` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `NoSpace` | `ENOSPC` |
//! | `FileTooLarge` | `EFBIG` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotPermittedName` | `EINVAL` |
//! | `NotRecoverable` | `ENOENT` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified error type for all e2mend operations.
#[derive(Debug, Error)]
pub enum E2Error {
    /// Operating system I/O error while reading or writing the image file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image file could not be opened or loaded. Always fatal.
    #[error("image unavailable: {0}")]
    ImageUnavailable(String),

    /// Live metadata is inconsistent with the on-disk format.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    /// Not an ext2 image this engine understands (bad magic, revision).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Layout parameters out of the supported single-group range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A path argument that is not absolute or otherwise malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A path component or target entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// The target name is already present in its parent.
    #[error("file exists")]
    Exists,

    /// Name longer than 255 bytes.
    #[error("name too long")]
    NameTooLong,

    /// No free inode or block left (or not enough for the whole operation).
    #[error("no space left on device")]
    NoSpace,

    /// More data than twelve direct blocks plus one indirect block can map.
    #[error("file too large: {0} bytes")]
    FileTooLarge(u64),

    /// A directory target without the recursive flag.
    #[error("is a directory")]
    IsDirectory,

    /// ".", ".." or "/" named directly as a target.
    #[error("refusing to operate on '{0}'")]
    NotPermittedName(String),

    /// Undelete candidate whose inode or blocks have been reused.
    #[error("cannot restore: {0}")]
    NotRecoverable(String),

    /// The image was opened read-only and a flush was requested.
    #[error("read-only image")]
    ReadOnly,
}

impl E2Error {
    /// Convert this error into a POSIX errno.
    ///
    /// Policy notes:
    /// - `ImageUnavailable` → `ENOENT`: the CLI cannot find or load the image.
    /// - `NotRecoverable` → `ENOENT`: the deleted entry is gone for good.
    /// - `NotPermittedName` → `EINVAL`: matches `rm .` on Linux.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::ImageUnavailable(_) | Self::NotFound(_) | Self::NotRecoverable(_) => {
                libc::ENOENT
            }
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidPath(_)
            | Self::NotPermittedName(_) => libc::EINVAL,
            Self::NotDirectory => libc::ENOTDIR,
            Self::Exists => libc::EEXIST,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NoSpace => libc::ENOSPC,
            Self::FileTooLarge(_) => libc::EFBIG,
            Self::IsDirectory => libc::EISDIR,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Shorthand for a `Corruption` error.
    pub fn corruption(block: u32, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }
}

/// Result alias using `E2Error`.
pub type Result<T> = std::result::Result<T, E2Error>;
