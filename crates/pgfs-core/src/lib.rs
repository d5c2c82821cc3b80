#![forbid(unsafe_code)]
//! PageFS engine.
//!
//! [`PageFs`] turns a fixed-size backing file into a hierarchy of files and
//! directories. It exposes two equivalent surfaces:
//!
//! - path operations (`read("/a/b", ..)`, `mknod("/a/c", ..)`, ...), and
//! - the inode-addressed [`FsOps`] trait consumed by the FUSE adapter.
//!
//! Both go through the same internal routines under a single engine lock.

mod fs;

pub use fs::PageFs;
pub use pgfs_error::{PgfsError, Result};
pub use pgfs_types::{
    BlockNumber, DIR_ENTRIES, DIR_NAME_LEN, IMAGE_SIZE, InodeNumber, MAX_FILE_SIZE, MAX_INODES,
    PAGE_COUNT, PAGE_SIZE, S_IFDIR, S_IFMT, S_IFREG,
};

use pgfs_types::{S_IFBLK, S_IFCHR, S_IFIFO, S_IFLNK, S_IFSOCK};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ── Configuration ───────────────────────────────────────────────────────────

/// Owner reported for every inode. Ownership is not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Options for opening a PageFS backing file.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Create the backing file if it does not exist.
    pub create: bool,
    /// `fsync` the backing file after every flush.
    pub sync_writes: bool,
    /// Owner reported by `stat`. Defaults to the backing file's owner.
    pub owner: Option<Owner>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            create: true,
            sync_writes: false,
            owner: None,
        }
    }
}

// ── VFS semantics layer ─────────────────────────────────────────────────────

/// File type derived from the mode bits of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileType {
    /// Type encoded in `mode`. Unknown type bits read as a regular file.
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            S_IFBLK => Self::BlockDevice,
            S_IFCHR => Self::CharDevice,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Socket,
            _ => Self::RegularFile,
        }
    }
}

/// Inode attributes returned by [`FsOps::getattr`], [`FsOps::lookup`] and
/// [`PageFs::stat`]. Analogous to POSIX `struct stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    /// Inode number.
    pub ino: InodeNumber,
    /// File size in bytes.
    pub size: u64,
    /// Number of 512-byte blocks allocated, indirect block included.
    pub blocks: u64,
    /// Last access time.
    pub atime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last status change time.
    pub ctime: SystemTime,
    /// File type.
    pub kind: FileType,
    /// POSIX permission bits (lower 12 bits of mode).
    pub perm: u16,
    /// Number of hard links.
    pub nlink: u32,
    /// Owner user ID.
    pub uid: u32,
    /// Owner group ID.
    pub gid: u32,
    /// Preferred I/O block size.
    pub blksize: u32,
}

/// A directory entry returned by [`FsOps::readdir`] and [`PageFs::readdir`].
///
/// `offset` is an opaque cookie for resuming iteration: FUSE passes it back
/// on the next `readdir` call and only later entries are returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Inode number of the target.
    pub ino: InodeNumber,
    /// Opaque offset cookie for readdir continuation.
    pub offset: u64,
    /// File type of the target.
    pub kind: FileType,
    /// Entry name (filename component, not a full path).
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Attribute changes applied by [`FsOps::setattr`]. `None` leaves the field
/// unchanged. Times are seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttrRequest {
    /// New permission bits. File-type bits are ignored.
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

/// Volume usage returned by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub blocks: u64,
    pub blocks_free: u64,
    pub inodes: u64,
    pub inodes_free: u64,
    pub block_size: u32,
    pub name_max: u32,
}

/// Inode-addressed filesystem operations.
///
/// This is the interface the FUSE adapter calls.
///
/// - Inode numbers are engine numbers (root is `InodeNumber(0)`).
/// - Errors are `PgfsError`, which maps to POSIX errnos via
///   [`PgfsError::to_errno()`].
/// - The trait is `Send + Sync` so that FUSE can call it from multiple
///   threads concurrently.
pub trait FsOps: Send + Sync {
    /// Attributes of `ino`. `NotFound` if the inode is not allocated.
    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr>;

    /// Attributes of the child named `name` in directory `parent`.
    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr>;

    /// Entries of directory `ino` after cookie `offset` (0 for the first
    /// call). An empty result marks the end of the directory.
    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>>;

    /// Up to `size` bytes from `offset`. Fewer bytes at EOF.
    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, growing the file as needed.
    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<u32>;

    /// Create a node named `name` in `parent`.
    fn mknod(&self, parent: InodeNumber, name: &OsStr, mode: u32) -> Result<InodeAttr>;

    /// Create a directory named `name` in `parent`.
    fn mkdir(&self, parent: InodeNumber, name: &OsStr, mode: u32) -> Result<InodeAttr>;

    /// Add a hard link to `ino` as `newparent/newname`.
    fn link(&self, ino: InodeNumber, newparent: InodeNumber, newname: &OsStr)
    -> Result<InodeAttr>;

    /// Remove the non-directory entry `parent/name`.
    fn unlink(&self, parent: InodeNumber, name: &OsStr) -> Result<()>;

    /// Remove the empty directory `parent/name`.
    fn rmdir(&self, parent: InodeNumber, name: &OsStr) -> Result<()>;

    /// Move `parent/name` to `newparent/newname`.
    fn rename(
        &self,
        parent: InodeNumber,
        name: &OsStr,
        newparent: InodeNumber,
        newname: &OsStr,
    ) -> Result<()>;

    /// Apply mode, size and timestamp changes.
    fn setattr(&self, ino: InodeNumber, request: &SetAttrRequest) -> Result<InodeAttr>;

    /// Volume usage.
    fn statfs(&self) -> Result<FsStats>;
}

// ── Time helpers ────────────────────────────────────────────────────────────

/// Seconds since the Unix epoch. Clocks before 1970 read as 0.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_secs()).ok())
        .unwrap_or(0)
}

/// Stored seconds to `SystemTime`.
#[must_use]
pub fn to_system_time(secs: i64) -> SystemTime {
    let magnitude = Duration::from_secs(secs.unsigned_abs());
    if secs >= 0 {
        UNIX_EPOCH + magnitude
    } else {
        UNIX_EPOCH - magnitude
    }
}

/// `SystemTime` to stored seconds, truncating sub-second precision.
#[must_use]
pub fn to_unix_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_secs())
            .map(|s| -s)
            .unwrap_or(i64::MIN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_from_mode() {
        assert_eq!(FileType::from_mode(S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(FileType::from_mode(S_IFREG | 0o644), FileType::RegularFile);
        assert_eq!(FileType::from_mode(S_IFIFO | 0o600), FileType::Fifo);
        assert_eq!(FileType::from_mode(0o644), FileType::RegularFile);
    }

    #[test]
    fn time_conversions_round_trip() {
        for secs in [0_i64, 1, 1_700_000_000, -86_400] {
            assert_eq!(to_unix_secs(to_system_time(secs)), secs);
        }
        assert!(unix_now() > 1_600_000_000);
    }

    #[test]
    fn open_options_defaults() {
        let opts = OpenOptions::default();
        assert!(opts.create);
        assert!(!opts.sync_writes);
        assert!(opts.owner.is_none());
    }

    #[test]
    fn dir_entry_name_str_is_lossy() {
        let entry = DirEntry {
            ino: InodeNumber(1),
            offset: 1,
            kind: FileType::RegularFile,
            name: vec![b'a', 0xFF],
        };
        assert_eq!(entry.name_str(), "a\u{FFFD}");
    }

    #[test]
    fn inode_attr_serializes() {
        let attr = InodeAttr {
            ino: InodeNumber(0),
            size: 4096,
            blocks: 8,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 1,
            uid: 0,
            gid: 0,
            blksize: 4096,
        };
        let json = serde_json::to_string(&attr).expect("serialize");
        assert!(json.contains("\"kind\":\"Directory\""));
    }
}
