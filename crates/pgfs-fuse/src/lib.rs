#![forbid(unsafe_code)]
//! FUSE adapter for PageFS.
//!
//! Kernel requests arrive through `fuser`, are translated to engine inode
//! numbers and forwarded to a [`FsOps`] implementation (normally
//! [`pgfs_core::PageFs`]). Errors are mapped through
//! [`PgfsError::to_errno()`].

use fuser::{
    FUSE_ROOT_ID, FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, Request, TimeOrNow,
};
use pgfs_core::{
    DirEntry, FileType as PgfsFileType, FsOps, InodeAttr, InodeNumber, SetAttrRequest,
    to_unix_secs,
};
use pgfs_error::PgfsError;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// TTL for cached attributes and entries. Every change goes through this
/// mount, so the kernel cache only needs to outlive a burst of lookups.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── FUSE error context ─────────────────────────────────────────────────────

/// Operation name, inode and offset of a failed request, for structured
/// logging of the error reply.
pub struct FuseErrorContext<'a> {
    pub error: &'a PgfsError,
    pub operation: &'static str,
    pub ino: u64,
    pub offset: Option<u64>,
}

impl FuseErrorContext<'_> {
    /// Log this error context via tracing and return the errno for the reply.
    pub fn log_and_errno(&self) -> c_int {
        let errno = self.error.to_errno();
        // Lookups of missing names are routine.
        if errno == libc::ENOENT {
            trace!(
                op = self.operation,
                ino = self.ino,
                errno,
                error = %self.error,
                "FUSE op returned ENOENT"
            );
        } else {
            warn!(
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "FUSE op failed"
            );
        }
        errno
    }
}

// ── Type conversions ────────────────────────────────────────────────────────

/// FUSE inode number of engine inode `inum`. The root directory (inode 0)
/// becomes `FUSE_ROOT_ID`.
#[must_use]
pub fn to_fuse_ino(inum: InodeNumber) -> u64 {
    u64::from(inum.0) + FUSE_ROOT_ID
}

/// Engine inode number for a FUSE inode number. Numbers with no engine
/// counterpart map to an inode that never exists, so the engine answers
/// `NotFound`.
#[must_use]
pub fn from_fuse_ino(ino: u64) -> InodeNumber {
    ino.checked_sub(FUSE_ROOT_ID)
        .and_then(|n| u32::try_from(n).ok())
        .map_or(InodeNumber(u32::MAX), InodeNumber)
}

fn to_fuser_file_type(ft: PgfsFileType) -> FileType {
    match ft {
        PgfsFileType::RegularFile => FileType::RegularFile,
        PgfsFileType::Directory => FileType::Directory,
        PgfsFileType::Symlink => FileType::Symlink,
        PgfsFileType::BlockDevice => FileType::BlockDevice,
        PgfsFileType::CharDevice => FileType::CharDevice,
        PgfsFileType::Fifo => FileType::NamedPipe,
        PgfsFileType::Socket => FileType::Socket,
    }
}

/// Convert engine attributes to `fuser::FileAttr`, reporting `uid`/`gid`
/// as the owner.
fn to_file_attr(attr: &InodeAttr, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino: to_fuse_ino(attr.ino),
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid,
        gid,
        rdev: 0,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn resolve_time(t: TimeOrNow) -> i64 {
    match t {
        TimeOrNow::SpecificTime(st) => to_unix_secs(st),
        TimeOrNow::Now => to_unix_secs(SystemTime::now()),
    }
}

/// One directory entry as handed to `ReplyDirectory::add`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DirReplyEntry {
    ino: u64,
    offset: i64,
    kind: FileType,
    name: Vec<u8>,
}

/// Cookies 1 and 2 belong to `.` and `..`; engine cookies are shifted past
/// them.
const DOT_ENTRIES: u64 = 2;

/// Engine cookie to resume from for a kernel `readdir` offset.
fn engine_offset(offset: i64) -> u64 {
    u64::try_from(offset).unwrap_or(0).saturating_sub(DOT_ENTRIES)
}

/// Entries to return for a kernel `readdir` at `offset`, `.` and `..`
/// included. PageFS keeps no parent link, so `..` names the directory
/// itself. The kernel resolves `..` from its own dentry cache.
fn plan_readdir(ino: u64, offset: i64, entries: &[DirEntry]) -> Vec<DirReplyEntry> {
    let mut out = Vec::with_capacity(entries.len() + 2);
    if offset < 1 {
        out.push(DirReplyEntry {
            ino,
            offset: 1,
            kind: FileType::Directory,
            name: b".".to_vec(),
        });
    }
    if offset < 2 {
        out.push(DirReplyEntry {
            ino,
            offset: 2,
            kind: FileType::Directory,
            name: b"..".to_vec(),
        });
    }
    out.extend(entries.iter().map(|entry| DirReplyEntry {
        ino: to_fuse_ino(entry.ino),
        offset: i64::try_from(entry.offset + DOT_ENTRIES).unwrap_or(i64::MAX),
        kind: to_fuser_file_type(entry.kind),
        name: entry.name.clone(),
    }));
    out
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_other: false,
            auto_unmount: true,
        }
    }
}

// ── Cache-line padding ──────────────────────────────────────────────────────

/// Pad a value to 64 bytes so counters bumped from different cores do not
/// share a cache line.
#[repr(C, align(64))]
pub struct CacheLinePadded<T>(pub T);

impl<T: std::fmt::Debug> std::fmt::Debug for CacheLinePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ── Atomic metrics ──────────────────────────────────────────────────────────

/// Lock-free per-mount request counters.
#[repr(C)]
pub struct AtomicMetrics {
    pub requests_total: CacheLinePadded<AtomicU64>,
    pub requests_ok: CacheLinePadded<AtomicU64>,
    pub requests_err: CacheLinePadded<AtomicU64>,
    pub bytes_read: CacheLinePadded<AtomicU64>,
    pub bytes_written: CacheLinePadded<AtomicU64>,
}

impl AtomicMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_total: CacheLinePadded(AtomicU64::new(0)),
            requests_ok: CacheLinePadded(AtomicU64::new(0)),
            requests_err: CacheLinePadded(AtomicU64::new(0)),
            bytes_read: CacheLinePadded(AtomicU64::new(0)),
            bytes_written: CacheLinePadded(AtomicU64::new(0)),
        }
    }

    fn record_ok(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_ok.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record_err(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_err.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record<T>(&self, result: &pgfs_error::Result<T>) {
        if result.is_ok() {
            self.record_ok();
        } else {
            self.record_err();
        }
    }

    fn record_bytes_read(&self, n: u64) {
        self.bytes_read.0.fetch_add(n, Ordering::Relaxed);
    }

    fn record_bytes_written(&self, n: u64) {
        self.bytes_written.0.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.0.load(Ordering::Relaxed),
            requests_ok: self.requests_ok.0.load(Ordering::Relaxed),
            requests_err: self.requests_err.0.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.0.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.0.load(Ordering::Relaxed),
        }
    }
}

impl Default for AtomicMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AtomicMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot();
        f.debug_struct("AtomicMetrics")
            .field("requests_total", &s.requests_total)
            .field("requests_ok", &s.requests_ok)
            .field("requests_err", &s.requests_err)
            .field("bytes_read", &s.bytes_read)
            .field("bytes_written", &s.bytes_written)
            .finish()
    }
}

/// Point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_err: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter that delegates every operation to a [`FsOps`]
/// implementation.
pub struct PageFuse {
    ops: Arc<dyn FsOps>,
    metrics: Arc<AtomicMetrics>,
    read_only: bool,
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<PageFuse>;
};

impl std::fmt::Debug for PageFuse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFuse")
            .field("metrics", &self.metrics)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl PageFuse {
    #[must_use]
    pub fn new(ops: Arc<dyn FsOps>) -> Self {
        Self::with_options(ops, &MountOptions::default())
    }

    #[must_use]
    pub fn with_options(ops: Arc<dyn FsOps>, options: &MountOptions) -> Self {
        info!(read_only = options.read_only, "PageFuse initialized");
        Self {
            ops,
            metrics: Arc::new(AtomicMetrics::new()),
            read_only: options.read_only,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &AtomicMetrics {
        &self.metrics
    }

    /// Shared handle to the counters, usable after the adapter moves into
    /// the FUSE session.
    #[must_use]
    pub fn metrics_handle(&self) -> Arc<AtomicMetrics> {
        Arc::clone(&self.metrics)
    }

    /// `Err(ReadOnly)` on a read-only mount. Checked before any mutating
    /// request reaches the engine.
    fn check_writable(&self) -> pgfs_error::Result<()> {
        if self.read_only {
            Err(PgfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn call<T>(&self, f: impl FnOnce(&dyn FsOps) -> pgfs_error::Result<T>) -> pgfs_error::Result<T> {
        let result = f(self.ops.as_ref());
        self.metrics.record(&result);
        result
    }

    fn call_mut<T>(
        &self,
        f: impl FnOnce(&dyn FsOps) -> pgfs_error::Result<T>,
    ) -> pgfs_error::Result<T> {
        self.call(|ops| {
            self.check_writable()?;
            f(ops)
        })
    }

    fn reply_error_attr(ctx: &FuseErrorContext<'_>, reply: ReplyAttr) {
        reply.error(ctx.log_and_errno());
    }

    fn reply_error_entry(ctx: &FuseErrorContext<'_>, reply: ReplyEntry) {
        reply.error(ctx.log_and_errno());
    }

    fn reply_error_data(ctx: &FuseErrorContext<'_>, reply: ReplyData) {
        reply.error(ctx.log_and_errno());
    }

    fn reply_error_dir(ctx: &FuseErrorContext<'_>, reply: ReplyDirectory) {
        reply.error(ctx.log_and_errno());
    }

    fn reply_error_empty(ctx: &FuseErrorContext<'_>, reply: ReplyEmpty) {
        reply.error(ctx.log_and_errno());
    }

    fn reply_error_write(ctx: &FuseErrorContext<'_>, reply: ReplyWrite) {
        reply.error(ctx.log_and_errno());
    }

    fn reply_entry(
        req: &Request<'_>,
        result: pgfs_error::Result<InodeAttr>,
        operation: &'static str,
        parent: u64,
        reply: ReplyEntry,
    ) {
        match result {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr, req.uid(), req.gid()), 0),
            Err(e) => Self::reply_error_entry(
                &FuseErrorContext {
                    error: &e,
                    operation,
                    ino: parent,
                    offset: None,
                },
                reply,
            ),
        }
    }

    fn reply_empty(
        result: pgfs_error::Result<()>,
        operation: &'static str,
        ino: u64,
        reply: ReplyEmpty,
    ) {
        match result {
            Ok(()) => reply.ok(),
            Err(e) => Self::reply_error_empty(
                &FuseErrorContext {
                    error: &e,
                    operation,
                    ino,
                    offset: None,
                },
                reply,
            ),
        }
    }
}

impl Filesystem for PageFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        debug!(metrics = ?self.metrics.snapshot(), "PageFuse destroyed");
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.call(|ops| ops.lookup(from_fuse_ino(parent), name));
        Self::reply_entry(req, result, "lookup", parent, reply);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.call(|ops| ops.getattr(from_fuse_ino(ino))) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr, req.uid(), req.gid())),
            Err(e) => Self::reply_error_attr(
                &FuseErrorContext {
                    error: &e,
                    operation: "getattr",
                    ino,
                    offset: None,
                },
                reply,
            ),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if uid.is_some() || gid.is_some() {
            // Ownership is not stored.
            trace!(ino, ?uid, ?gid, "ignoring ownership change");
        }
        let request = SetAttrRequest {
            mode,
            size,
            atime: atime.map(resolve_time),
            mtime: mtime.map(resolve_time),
        };
        match self.call_mut(|ops| ops.setattr(from_fuse_ino(ino), &request)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr, req.uid(), req.gid())),
            Err(e) => Self::reply_error_attr(
                &FuseErrorContext {
                    error: &e,
                    operation: "setattr",
                    ino,
                    offset: size,
                },
                reply,
            ),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let fs_offset = engine_offset(offset);
        match self.call(|ops| ops.readdir(from_fuse_ino(ino), fs_offset)) {
            Ok(entries) => {
                for entry in plan_readdir(ino, offset, &entries) {
                    let full = reply.add(
                        entry.ino,
                        entry.offset,
                        entry.kind,
                        OsStr::from_bytes(&entry.name),
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => Self::reply_error_dir(
                &FuseErrorContext {
                    error: &e,
                    operation: "readdir",
                    ino,
                    offset: Some(fs_offset),
                },
                reply,
            ),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.call_mut(|ops| ops.mknod(from_fuse_ino(parent), name, mode & !umask));
        Self::reply_entry(req, result, "mknod", parent, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.call_mut(|ops| ops.mkdir(from_fuse_ino(parent), name, mode & !umask));
        Self::reply_entry(req, result, "mkdir", parent, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.call_mut(|ops| ops.unlink(from_fuse_ino(parent), name));
        Self::reply_empty(result, "unlink", parent, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.call_mut(|ops| ops.rmdir(from_fuse_ino(parent), name));
        Self::reply_empty(result, "rmdir", parent, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // RENAME_NOREPLACE / RENAME_EXCHANGE are not supported.
            reply.error(libc::EINVAL);
            return;
        }
        let result = self.call_mut(|ops| {
            ops.rename(
                from_fuse_ino(parent),
                name,
                from_fuse_ino(newparent),
                newname,
            )
        });
        Self::reply_empty(result, "rename", parent, reply);
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.call_mut(|ops| {
            ops.link(from_fuse_ino(ino), from_fuse_ino(newparent), newname)
        });
        Self::reply_entry(req, result, "link", ino, reply);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let writing = flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0;
        let result = self.call(|ops| {
            if writing {
                self.check_writable()?;
            }
            ops.getattr(from_fuse_ino(ino)).map(|_| ())
        });
        match result {
            // Stateless open: no file handles are tracked.
            Ok(()) => reply.opened(0, 0),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "open",
                    ino,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.call(|ops| ops.getattr(from_fuse_ino(ino))) {
            Ok(attr) if attr.kind == PgfsFileType::Directory => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "opendir",
                    ino,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.call(|ops| ops.read(from_fuse_ino(ino), byte_offset, size)) {
            Ok(data) => {
                self.metrics
                    .record_bytes_read(u64::try_from(data.len()).unwrap_or(u64::MAX));
                reply.data(&data);
            }
            Err(e) => Self::reply_error_data(
                &FuseErrorContext {
                    error: &e,
                    operation: "read",
                    ino,
                    offset: Some(byte_offset),
                },
                reply,
            ),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.call_mut(|ops| ops.write(from_fuse_ino(ino), byte_offset, data)) {
            Ok(written) => {
                self.metrics.record_bytes_written(u64::from(written));
                reply.written(written);
            }
            Err(e) => Self::reply_error_write(
                &FuseErrorContext {
                    error: &e,
                    operation: "write",
                    ino,
                    offset: Some(byte_offset),
                },
                reply,
            ),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.call_mut(|ops| ops.mknod(from_fuse_ino(parent), name, mode & !umask)) {
            Ok(attr) => reply.created(
                &ATTR_TTL,
                &to_file_attr(&attr, req.uid(), req.gid()),
                0,
                0,
                0,
            ),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "create",
                    ino: parent,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let result = self.call(|ops| {
            if mask & libc::W_OK != 0 {
                self.check_writable()?;
            }
            ops.getattr(from_fuse_ino(ino)).map(|_| ())
        });
        Self::reply_empty(result, "access", ino, reply);
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.call(|ops| ops.statfs()) {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.blocks_free,
                stats.blocks_free,
                stats.inodes,
                stats.inodes_free,
                stats.block_size,
                stats.name_max,
                stats.block_size,
            ),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "statfs",
                    ino,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("pagefs".to_owned()),
        MountOption::Subtype("pgfs".to_owned()),
        MountOption::DefaultPermissions,
    ];
    opts.push(if options.read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

/// Mount `ops` at `mountpoint`. Blocks until the filesystem is unmounted.
pub fn mount(
    ops: Arc<dyn FsOps>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let fs = PageFuse::with_options(ops, options);
    let metrics = fs.metrics_handle();
    info!(mountpoint = %mountpoint.display(), read_only = options.read_only, "mounting");
    fuser::mount2(fs, mountpoint, &fuse_opts)?;
    info!(
        mountpoint = %mountpoint.display(),
        metrics = ?metrics.snapshot(),
        "unmounted"
    );
    Ok(())
}
