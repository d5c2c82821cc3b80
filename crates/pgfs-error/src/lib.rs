#![forbid(unsafe_code)]
//! Error types for PageFS.
//!
//! # Error Taxonomy
//!
//! PageFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `pgfs-types` | Metadata region bytes that do not decode |
//! | Runtime | `PgfsError` | `pgfs-error` (this crate) | User-facing errors for FUSE, CLI, and API consumers |
//!
//! `pgfs-error` is intentionally independent of `pgfs-types` to avoid cyclic
//! dependencies. Crates that decode on-disk records (`pgfs-inode`,
//! `pgfs-dir`) convert a `ParseError` into [`PgfsError::Corruption`] with
//! the block number that failed to decode.
//!
//! ## Engine conditions
//!
//! The storage engine reports a small closed set of conditions. The three
//! core ones are:
//!
//! - [`PgfsError::NotFound`]: a path component does not resolve.
//! - [`PgfsError::NoSpace`]: inode, block, or directory-slot exhaustion.
//! - [`PgfsError::InvalidArgument`]: an operation precondition is violated
//!   (relative path, write beyond the maximum file size, removing root).
//!
//! The remaining variants refine those conditions so FUSE callers receive
//! the errno a POSIX filesystem would return.
//!
//! ## FUSE errno Mapping
//!
//! Every `PgfsError` variant maps to exactly one POSIX errno via
//! [`PgfsError::to_errno`]. The mapping has no wildcard arm.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw os error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Exists` | `EEXIST` |
//! | `NotPermitted` | `EPERM` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified error type for all PageFS operations.
#[derive(Debug, Error)]
pub enum PgfsError {
    /// Operating system I/O error on the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata that does not decode, or a block map that disagrees with the
    /// inode's size.
    ///
    /// The `block` field names the block being read when the problem was
    /// detected (0 for the metadata region).
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The backing file cannot hold a PageFS volume (wrong length, bad
    /// geometry).
    #[error("invalid backing store: {0}")]
    Format(String),

    /// Operation-specific precondition violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No free blocks, inodes, or directory slots available.
    #[error("no space left on device")]
    NoSpace,

    /// File, directory, or other named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// rmdir on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// Filename exceeds the directory slot's name buffer.
    #[error("name too long")]
    NameTooLong,

    /// Target name already exists in the directory.
    #[error("file exists")]
    Exists,

    /// Operation is never allowed on this object (hard link to a directory).
    #[error("operation not permitted")]
    NotPermitted,

    /// Volume is mounted read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl PgfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    ///
    /// The mapping is exhaustive. Adding a new variant without updating this
    /// function is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::NotPermitted => libc::EPERM,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using `PgfsError`.
pub type Result<T> = std::result::Result<T, PgfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(PgfsError, libc::c_int)> = vec![
            (PgfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                PgfsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (PgfsError::Format("test".into()), libc::EINVAL),
            (PgfsError::InvalidArgument("test".into()), libc::EINVAL),
            (PgfsError::NoSpace, libc::ENOSPC),
            (PgfsError::NotFound("test".into()), libc::ENOENT),
            (PgfsError::NotDirectory, libc::ENOTDIR),
            (PgfsError::IsDirectory, libc::EISDIR),
            (PgfsError::NotEmpty, libc::ENOTEMPTY),
            (PgfsError::NameTooLong, libc::ENAMETOOLONG),
            (PgfsError::Exists, libc::EEXIST),
            (PgfsError::NotPermitted, libc::EPERM),
            (PgfsError::ReadOnly, libc::EROFS),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = PgfsError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = PgfsError::Corruption {
            block: 42,
            detail: "indirect entry missing".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: indirect entry missing"
        );

        assert_eq!(PgfsError::NoSpace.to_string(), "no space left on device");
        assert_eq!(
            PgfsError::NotFound("/a/b".into()).to_string(),
            "not found: /a/b"
        );
        assert_eq!(
            PgfsError::InvalidArgument("path must be absolute".into()).to_string(),
            "invalid argument: path must be absolute"
        );
    }
}
