//! The PageFS engine: one lock around the block store, the block allocator
//! and the inode table.

use crate::{
    DirEntry, FileType, FsOps, FsStats, InodeAttr, OpenOptions, Owner, SetAttrRequest,
    to_system_time, unix_now,
};
use parking_lot::Mutex;
use pgfs_alloc::BlockAllocator;
use pgfs_block::{BlockStore, ByteDevice, FileByteDevice};
use pgfs_error::{PgfsError, Result};
use pgfs_inode::{Inode, InodeTable, resolve_block};
use pgfs_types::{
    BlockNumber, DIR_NAME_LEN, IMAGE_SIZE, InodeNumber, MAX_FILE_SIZE, MAX_INODES, PAGE_COUNT,
    PAGE_SIZE, PAGE_SIZE_U64, S_IFDIR, S_IFMT, S_IFREG, S_IPERM,
};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::{debug, info, trace, warn};

/// Mode of the root directory on a freshly formatted volume.
const ROOT_MODE: u32 = S_IFDIR | 0o755;

/// All mutable engine state. Internal routines take `&mut EngineState` and
/// never lock.
#[derive(Debug)]
struct EngineState {
    store: BlockStore,
    alloc: BlockAllocator,
    inodes: InodeTable,
}

/// A mounted PageFS volume.
///
/// Every public operation takes the engine lock once, runs to completion and
/// flushes dirty blocks before returning.
#[derive(Debug)]
pub struct PageFs {
    state: Mutex<EngineState>,
    owner: Owner,
}

impl PageFs {
    /// Open (or create and format) the backing file at `path`.
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let dev = FileByteDevice::open_or_create(path, IMAGE_SIZE, options.create)?;
        let owner = match options.owner {
            Some(owner) => owner,
            None => {
                let (uid, gid) = dev.owner()?;
                Owner { uid, gid }
            }
        };
        info!(path = %path.display(), "opening backing file");
        Self::from_device_with_owner(Box::new(dev), options, owner)
    }

    /// Open a volume on an already-opened device. The device must be exactly
    /// `IMAGE_SIZE` bytes. The owner defaults to uid/gid 0.
    pub fn from_device(dev: Box<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        Self::from_device_with_owner(dev, options, options.owner.unwrap_or_default())
    }

    fn from_device_with_owner(
        dev: Box<dyn ByteDevice>,
        options: &OpenOptions,
        owner: Owner,
    ) -> Result<Self> {
        let store = BlockStore::open(dev, options.sync_writes)?;
        let alloc = BlockAllocator::load(store.metadata())?;
        let mut state = if alloc.is_formatted() {
            let inodes = InodeTable::load(store.metadata())?;
            let root = inodes.try_get(InodeNumber::ROOT).map_err(|_| PgfsError::Corruption {
                block: 0,
                detail: "root inode is not allocated".into(),
            })?;
            if !root.is_dir() || root.block_count() != 1 {
                return Err(PgfsError::Corruption {
                    block: 0,
                    detail: "root inode is not a single-block directory".into(),
                });
            }
            info!(
                blocks_used = alloc.used_count(),
                inodes_used = inodes.used_count(),
                "opened volume"
            );
            EngineState {
                store,
                alloc,
                inodes,
            }
        } else {
            let mut state = EngineState {
                store,
                alloc,
                inodes: InodeTable::empty(),
            };
            state.format()?;
            info!(
                page_size = PAGE_SIZE,
                page_count = PAGE_COUNT,
                max_inodes = MAX_INODES,
                "formatted new volume"
            );
            state
        };
        state.persist()?;
        Ok(Self {
            state: Mutex::new(state),
            owner,
        })
    }

    /// Owner reported for every inode.
    #[must_use]
    pub fn owner(&self) -> Owner {
        self.owner
    }

    fn query<T>(&self, f: impl FnOnce(&EngineState) -> Result<T>) -> Result<T> {
        let state = self.state.lock();
        f(&state)
    }

    /// Run `f` and flush whatever it touched, even when it failed.
    fn mutate<T>(&self, f: impl FnOnce(&mut EngineState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        let result = f(&mut state);
        let persisted = state.persist();
        drop(state);
        let value = result?;
        persisted?;
        Ok(value)
    }

    // ── Path operations ─────────────────────────────────────────────────

    /// Inode named by the absolute `path`.
    pub fn resolve(&self, path: &str) -> Result<InodeNumber> {
        self.query(|st| st.resolve(path))
    }

    /// Up to `size` bytes of `path` starting at `offset`, clamped to the file
    /// size. Reading at or past EOF returns an empty buffer.
    pub fn read(&self, path: &str, size: usize, offset: u64) -> Result<Vec<u8>> {
        self.mutate(|st| {
            let inum = st.resolve(path)?;
            st.read(inum, offset, size as u64)
        })
    }

    /// Write `data` to `path` at `offset`, growing the file first if needed.
    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize> {
        self.mutate(|st| {
            let inum = st.resolve(path)?;
            st.write(inum, offset, data)
        })
    }

    /// Create the node at `path`. Without file-type bits `mode` creates a
    /// regular file.
    pub fn mknod(&self, path: &str, mode: u32) -> Result<InodeNumber> {
        self.mutate(|st| {
            let (parent, name) = st.resolve_parent(path)?;
            st.mknod(parent, name, mode)
        })
    }

    /// Create the directory at `path`.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<InodeNumber> {
        self.mknod(path, S_IFDIR | (mode & S_IPERM))
    }

    /// Make `to` another name for the file at `from`.
    pub fn link(&self, from: &str, to: &str) -> Result<()> {
        self.mutate(|st| {
            let inum = st.resolve(from)?;
            let (parent, name) = st.resolve_parent(to)?;
            st.link(inum, parent, name)
        })
    }

    /// Remove the name `path`. The inode is freed with its last link.
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.mutate(|st| {
            let (parent, name) = st.resolve_parent(path)?;
            st.unlink(parent, name)
        })
    }

    /// Remove the empty directory at `path`.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.mutate(|st| {
            let (parent, name) = st.resolve_parent(path)?;
            st.rmdir(parent, name)
        })
    }

    /// Move `from` to `to`, replacing a non-directory (or empty directory)
    /// at `to`.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.mutate(|st| {
            let (parent, name) = st.resolve_parent(from)?;
            let (newparent, newname) = st.resolve_parent(to)?;
            st.rename(parent, name, newparent, newname)
        })
    }

    /// Replace the permission bits of `path`, keeping its file type.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.mutate(|st| {
            let inum = st.resolve(path)?;
            st.chmod(inum, mode);
            Ok(())
        })
    }

    /// Set the size of `path`, freeing or zero-filling blocks.
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        self.mutate(|st| {
            let inum = st.resolve(path)?;
            st.truncate(inum, size)
        })
    }

    pub fn stat(&self, path: &str) -> Result<InodeAttr> {
        self.query(|st| {
            let inum = st.resolve(path)?;
            Ok(st.attr(inum, self.owner))
        })
    }

    /// Overwrite the access and modification times of `path` (seconds since
    /// the Unix epoch).
    pub fn set_time(&self, path: &str, atime: i64, mtime: i64) -> Result<()> {
        self.mutate(|st| {
            let inum = st.resolve(path)?;
            let inode = st.inodes.get_mut(inum);
            inode.atime = atime;
            inode.mtime = mtime;
            Ok(())
        })
    }

    /// Live entries of the directory at `path`, in slot order.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.query(|st| {
            let inum = st.resolve(path)?;
            st.readdir(inum, 0)
        })
    }

    /// Existence check. Permission bits are stored but never enforced.
    pub fn access(&self, path: &str) -> Result<()> {
        self.resolve(path).map(|_| ())
    }

    pub fn statfs(&self) -> Result<FsStats> {
        self.query(|st| Ok(st.statfs()))
    }
}

// ── Engine internals ────────────────────────────────────────────────────────

fn split_components(path: &str) -> Result<impl Iterator<Item = &str>> {
    if !path.starts_with('/') {
        return Err(PgfsError::InvalidArgument(format!(
            "path must be absolute: {path:?}"
        )));
    }
    Ok(path.split('/').filter(|c| !c.is_empty()))
}

impl EngineState {
    fn format(&mut self) -> Result<()> {
        self.alloc.format();
        self.inodes = InodeTable::empty();
        let root = self.inodes.alloc()?;
        debug_assert!(root.is_root());
        let now = unix_now();
        let inode = self.inodes.get_mut(root);
        inode.mode = ROOT_MODE;
        inode.refs = 1;
        inode.atime = now;
        inode.mtime = now;
        inode.ctime = now;
        self.inodes
            .grow(&mut self.store, &mut self.alloc, root, PAGE_SIZE_U64)
    }

    /// Encode the bitmaps and inode table into the metadata region and write
    /// every dirty block back.
    fn persist(&mut self) -> Result<()> {
        self.alloc.encode_into(self.store.metadata_mut());
        self.inodes.encode_into(self.store.metadata_mut());
        self.store.flush()
    }

    fn inode(&self, inum: InodeNumber) -> Result<Inode> {
        self.inodes.try_get(inum).copied()
    }

    /// The single data block of directory `dir`.
    fn dir_block(&self, dir: InodeNumber) -> Result<BlockNumber> {
        let inode = self.inode(dir)?;
        if !inode.is_dir() {
            return Err(PgfsError::NotDirectory);
        }
        resolve_block(&self.store, &inode, 0)
    }

    fn lookup_child(&self, dir: InodeNumber, name: &[u8]) -> Result<Option<InodeNumber>> {
        let block = self.dir_block(dir)?;
        pgfs_dir::lookup(self.store.block(block), name)
    }

    fn child(&self, dir: InodeNumber, name: &[u8]) -> Result<InodeNumber> {
        self.lookup_child(dir, name)?
            .ok_or_else(|| PgfsError::NotFound(String::from_utf8_lossy(name).into_owned()))
    }

    fn resolve(&self, path: &str) -> Result<InodeNumber> {
        let mut current = InodeNumber::ROOT;
        for component in split_components(path)? {
            current = self
                .lookup_child(current, component.as_bytes())?
                .ok_or_else(|| PgfsError::NotFound(path.to_owned()))?;
        }
        trace!(path, inode = current.0, "resolved path");
        Ok(current)
    }

    /// Parent directory and leaf name of `path`. The root has no parent.
    fn resolve_parent<'p>(&self, path: &'p str) -> Result<(InodeNumber, &'p [u8])> {
        let components: Vec<&str> = split_components(path)?.collect();
        let Some((leaf, dirs)) = components.split_last() else {
            return Err(PgfsError::InvalidArgument(
                "the root directory has no parent".into(),
            ));
        };
        let mut parent = InodeNumber::ROOT;
        for component in dirs {
            parent = self
                .lookup_child(parent, component.as_bytes())?
                .ok_or_else(|| PgfsError::NotFound(path.to_owned()))?;
        }
        if !self.inode(parent)?.is_dir() {
            return Err(PgfsError::NotDirectory);
        }
        let leaf: &'p str = *leaf;
        Ok((parent, leaf.as_bytes()))
    }

    fn attr(&self, inum: InodeNumber, owner: Owner) -> InodeAttr {
        let inode = self.inodes.get(inum);
        let indirect = u64::from(!inode.iptr.is_none());
        InodeAttr {
            ino: inum,
            size: u64::from(inode.size),
            blocks: (inode.block_count() + indirect) * (PAGE_SIZE_U64 / 512),
            atime: to_system_time(inode.atime),
            mtime: to_system_time(inode.mtime),
            ctime: to_system_time(inode.ctime),
            kind: FileType::from_mode(inode.mode),
            perm: (inode.mode & S_IPERM) as u16,
            nlink: inode.refs,
            uid: owner.uid,
            gid: owner.gid,
            blksize: PAGE_SIZE as u32,
        }
    }

    fn statfs(&self) -> FsStats {
        FsStats {
            blocks: u64::from(PAGE_COUNT),
            blocks_free: u64::from(self.alloc.free_count()),
            inodes: u64::from(MAX_INODES),
            inodes_free: u64::from(self.inodes.free_count()),
            block_size: PAGE_SIZE as u32,
            name_max: DIR_NAME_LEN as u32,
        }
    }

    // ── File data ───────────────────────────────────────────────────────

    fn read(&mut self, inum: InodeNumber, offset: u64, size: u64) -> Result<Vec<u8>> {
        let inode = self.inode(inum)?;
        if inode.is_dir() {
            return Err(PgfsError::IsDirectory);
        }
        let file_size = u64::from(inode.size);
        let end = file_size.min(offset.saturating_add(size));
        let mut out = Vec::with_capacity(end.saturating_sub(offset) as usize);

        let mut pos = offset;
        while pos < end {
            let within = (pos % PAGE_SIZE_U64) as usize;
            let chunk = (PAGE_SIZE - within).min((end - pos) as usize);
            let block = resolve_block(&self.store, &inode, pos / PAGE_SIZE_U64)?;
            out.extend_from_slice(&self.store.block(block)[within..within + chunk]);
            pos += chunk as u64;
        }

        self.inodes.get_mut(inum).atime = unix_now();
        trace!(inode = inum.0, offset, len = out.len(), "read");
        Ok(out)
    }

    fn write(&mut self, inum: InodeNumber, offset: u64, data: &[u8]) -> Result<usize> {
        let inode = self.inode(inum)?;
        if inode.is_dir() {
            return Err(PgfsError::IsDirectory);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= MAX_FILE_SIZE)
            .ok_or_else(|| {
                PgfsError::InvalidArgument(format!(
                    "write of {} bytes at {offset} exceeds maximum file size {MAX_FILE_SIZE}",
                    data.len()
                ))
            })?;
        if end > u64::from(inode.size) {
            self.inodes
                .grow(&mut self.store, &mut self.alloc, inum, end)?;
        }

        let inode = *self.inodes.get(inum);
        let mut pos = offset;
        let mut written = 0_usize;
        while written < data.len() {
            let within = (pos % PAGE_SIZE_U64) as usize;
            let chunk = (PAGE_SIZE - within).min(data.len() - written);
            let block = resolve_block(&self.store, &inode, pos / PAGE_SIZE_U64)?;
            self.store.block_mut(block)[within..within + chunk]
                .copy_from_slice(&data[written..written + chunk]);
            written += chunk;
            pos += chunk as u64;
        }

        let now = unix_now();
        let inode = self.inodes.get_mut(inum);
        inode.atime = now;
        inode.mtime = now;
        inode.ctime = now;
        debug!(inode = inum.0, offset, len = data.len(), size = inode.size, "write");
        Ok(written)
    }

    fn truncate(&mut self, inum: InodeNumber, size: u64) -> Result<()> {
        let inode = self.inode(inum)?;
        if inode.is_dir() {
            return Err(PgfsError::IsDirectory);
        }
        if size > MAX_FILE_SIZE {
            return Err(PgfsError::InvalidArgument(format!(
                "size {size} exceeds maximum file size {MAX_FILE_SIZE}"
            )));
        }
        let old = u64::from(inode.size);
        if size > old {
            self.inodes
                .grow(&mut self.store, &mut self.alloc, inum, size)?;
        } else if size < old {
            self.inodes
                .shrink(&mut self.store, &mut self.alloc, inum, size)?;
        }
        let now = unix_now();
        let inode = self.inodes.get_mut(inum);
        inode.mtime = now;
        inode.ctime = now;
        debug!(inode = inum.0, old, new = size, "truncate");
        Ok(())
    }

    // ── Namespace ───────────────────────────────────────────────────────

    fn mknod(&mut self, parent: InodeNumber, name: &[u8], mode: u32) -> Result<InodeNumber> {
        pgfs_dir::validate_name(name)?;
        let parent_block = self.dir_block(parent)?;
        if pgfs_dir::lookup(self.store.block(parent_block), name)?.is_some() {
            return Err(PgfsError::Exists);
        }

        let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
        let inum = self.inodes.alloc()?;
        let now = unix_now();
        {
            let inode = self.inodes.get_mut(inum);
            inode.mode = mode;
            inode.refs = 1;
            inode.atime = now;
            inode.mtime = now;
            inode.ctime = now;
        }

        let created = (|| -> Result<()> {
            if mode & S_IFMT == S_IFDIR {
                self.inodes
                    .grow(&mut self.store, &mut self.alloc, inum, PAGE_SIZE_U64)?;
            }
            pgfs_dir::put(self.store.block_mut(parent_block), name, inum)?;
            Ok(())
        })();

        if let Err(err) = created {
            warn!(
                parent = parent.0,
                inode = inum.0,
                error = %err,
                "mknod failed, releasing inode"
            );
            self.inodes
                .free(&mut self.store, &mut self.alloc, inum)?;
            return Err(err);
        }

        self.touch_dir(parent, now);
        debug!(
            parent = parent.0,
            inode = inum.0,
            name = %String::from_utf8_lossy(name),
            mode = format_args!("{mode:o}"),
            "mknod"
        );
        Ok(inum)
    }

    fn touch_dir(&mut self, dir: InodeNumber, now: i64) {
        let inode = self.inodes.get_mut(dir);
        inode.mtime = now;
        inode.ctime = now;
    }

    /// Add `newparent/newname -> inum` and count the new reference. A failed
    /// insertion leaves the link count unchanged.
    fn add_link(&mut self, inum: InodeNumber, newparent: InodeNumber, newname: &[u8]) -> Result<()> {
        pgfs_dir::validate_name(newname)?;
        let block = self.dir_block(newparent)?;
        pgfs_dir::put(self.store.block_mut(block), newname, inum)?;
        let now = unix_now();
        let inode = self.inodes.get_mut(inum);
        inode.refs += 1;
        inode.ctime = now;
        self.touch_dir(newparent, now);
        Ok(())
    }

    /// Drop one reference to `inum`, freeing it with the last one.
    fn drop_link(&mut self, inum: InodeNumber) -> Result<()> {
        let inode = self.inodes.get_mut(inum);
        inode.refs = inode.refs.saturating_sub(1);
        if inode.refs == 0 {
            self.inodes.free(&mut self.store, &mut self.alloc, inum)?;
            debug!(inode = inum.0, "freed inode with last link");
        } else {
            inode.ctime = unix_now();
        }
        Ok(())
    }

    /// Remove `dir/name` and return the inode it referenced. References are
    /// not touched.
    fn remove_entry(&mut self, dir: InodeNumber, name: &[u8]) -> Result<InodeNumber> {
        let block = self.dir_block(dir)?;
        let removed = pgfs_dir::delete(self.store.block_mut(block), name)?
            .ok_or_else(|| PgfsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        self.touch_dir(dir, unix_now());
        Ok(removed)
    }

    fn link(&mut self, inum: InodeNumber, newparent: InodeNumber, newname: &[u8]) -> Result<()> {
        if self.inode(inum)?.is_dir() {
            return Err(PgfsError::NotPermitted);
        }
        self.add_link(inum, newparent, newname)?;
        debug!(
            inode = inum.0,
            parent = newparent.0,
            name = %String::from_utf8_lossy(newname),
            "link"
        );
        Ok(())
    }

    fn unlink(&mut self, parent: InodeNumber, name: &[u8]) -> Result<()> {
        let inum = self.child(parent, name)?;
        if self.inodes.get(inum).is_dir() {
            return Err(PgfsError::IsDirectory);
        }
        self.remove_entry(parent, name)?;
        self.drop_link(inum)?;
        debug!(parent = parent.0, inode = inum.0, "unlink");
        Ok(())
    }

    fn rmdir(&mut self, parent: InodeNumber, name: &[u8]) -> Result<()> {
        let inum = self.child(parent, name)?;
        if !self.inodes.get(inum).is_dir() {
            return Err(PgfsError::NotDirectory);
        }
        if inum.is_root() {
            return Err(PgfsError::InvalidArgument(
                "cannot remove the root directory".into(),
            ));
        }
        let block = self.dir_block(inum)?;
        if pgfs_dir::live_count(self.store.block(block))? > 0 {
            return Err(PgfsError::NotEmpty);
        }
        self.remove_entry(parent, name)?;
        self.inodes.free(&mut self.store, &mut self.alloc, inum)?;
        debug!(parent = parent.0, inode = inum.0, "rmdir");
        Ok(())
    }

    /// True when `target` is `dir` or lies anywhere below it.
    fn subtree_contains(&self, dir: InodeNumber, target: InodeNumber) -> Result<bool> {
        let mut stack = vec![dir];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return Ok(true);
            }
            if !seen.insert(current) {
                continue;
            }
            let block = self.dir_block(current)?;
            for entry in pgfs_dir::entries(self.store.block(block))? {
                if self.inodes.get(entry.inum).is_dir() {
                    stack.push(entry.inum);
                }
            }
        }
        Ok(false)
    }

    fn rename(
        &mut self,
        parent: InodeNumber,
        name: &[u8],
        newparent: InodeNumber,
        newname: &[u8],
    ) -> Result<()> {
        let inum = self.child(parent, name)?;
        pgfs_dir::validate_name(newname)?;
        if parent == newparent && name == newname {
            return Ok(());
        }
        let moving_dir = self.inodes.get(inum).is_dir();
        if moving_dir && self.subtree_contains(inum, newparent)? {
            return Err(PgfsError::InvalidArgument(
                "cannot move a directory into its own subtree".into(),
            ));
        }

        if let Some(existing) = self.lookup_child(newparent, newname)? {
            if existing == inum {
                // Both names already refer to the same file.
                return Ok(());
            }
            let existing_is_dir = self.inodes.get(existing).is_dir();
            match (moving_dir, existing_is_dir) {
                (false, true) => return Err(PgfsError::IsDirectory),
                (true, false) => return Err(PgfsError::NotDirectory),
                (true, true) => self.rmdir(newparent, newname)?,
                (false, false) => self.unlink(newparent, newname)?,
            }
        }

        // Link under the new name first so the inode is never unreachable.
        self.add_link(inum, newparent, newname)?;
        if let Err(err) = self.remove_entry(parent, name) {
            warn!(
                inode = inum.0,
                error = %err,
                "rename failed after link, rolling back"
            );
            self.remove_entry(newparent, newname)?;
            let inode = self.inodes.get_mut(inum);
            inode.refs = inode.refs.saturating_sub(1);
            return Err(err);
        }
        self.drop_link(inum)?;
        debug!(
            inode = inum.0,
            from_parent = parent.0,
            to_parent = newparent.0,
            to = %String::from_utf8_lossy(newname),
            "rename"
        );
        Ok(())
    }

    fn chmod(&mut self, inum: InodeNumber, mode: u32) {
        let inode = self.inodes.get_mut(inum);
        inode.mode = (inode.mode & S_IFMT) | (mode & S_IPERM);
        inode.ctime = unix_now();
        debug!(inode = inum.0, mode = format_args!("{:o}", inode.mode), "chmod");
    }

    fn setattr(&mut self, inum: InodeNumber, request: &SetAttrRequest) -> Result<()> {
        self.inode(inum)?;
        if let Some(size) = request.size {
            self.truncate(inum, size)?;
        }
        if let Some(mode) = request.mode {
            self.chmod(inum, mode);
        }
        let inode = self.inodes.get_mut(inum);
        if let Some(atime) = request.atime {
            inode.atime = atime;
        }
        if let Some(mtime) = request.mtime {
            inode.mtime = mtime;
        }
        Ok(())
    }

    fn readdir(&self, dir: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        let block = self.dir_block(dir)?;
        let entries = pgfs_dir::entries(self.store.block(block))?;
        Ok(entries
            .into_iter()
            .map(|entry| DirEntry {
                ino: entry.inum,
                offset: entry.slot as u64 + 1,
                kind: FileType::from_mode(self.inodes.get(entry.inum).mode),
                name: entry.name,
            })
            .filter(|entry| entry.offset > offset)
            .collect())
    }
}

// ── FsOps ───────────────────────────────────────────────────────────────────

impl FsOps for PageFs {
    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        self.query(|st| {
            st.inode(ino)?;
            Ok(st.attr(ino, self.owner))
        })
    }

    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr> {
        self.query(|st| {
            let inum = st.child(parent, name.as_bytes())?;
            Ok(st.attr(inum, self.owner))
        })
    }

    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        self.query(|st| st.readdir(ino, offset))
    }

    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.mutate(|st| st.read(ino, offset, u64::from(size)))
    }

    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<u32> {
        let len = u32::try_from(data.len())
            .map_err(|_| PgfsError::InvalidArgument("write larger than 4 GiB".into()))?;
        self.mutate(|st| st.write(ino, offset, data))?;
        Ok(len)
    }

    fn mknod(&self, parent: InodeNumber, name: &OsStr, mode: u32) -> Result<InodeAttr> {
        self.mutate(|st| {
            let inum = st.mknod(parent, name.as_bytes(), mode)?;
            Ok(st.attr(inum, self.owner))
        })
    }

    fn mkdir(&self, parent: InodeNumber, name: &OsStr, mode: u32) -> Result<InodeAttr> {
        FsOps::mknod(self, parent, name, S_IFDIR | (mode & S_IPERM))
    }

    fn link(
        &self,
        ino: InodeNumber,
        newparent: InodeNumber,
        newname: &OsStr,
    ) -> Result<InodeAttr> {
        self.mutate(|st| {
            st.link(ino, newparent, newname.as_bytes())?;
            Ok(st.attr(ino, self.owner))
        })
    }

    fn unlink(&self, parent: InodeNumber, name: &OsStr) -> Result<()> {
        self.mutate(|st| st.unlink(parent, name.as_bytes()))
    }

    fn rmdir(&self, parent: InodeNumber, name: &OsStr) -> Result<()> {
        self.mutate(|st| st.rmdir(parent, name.as_bytes()))
    }

    fn rename(
        &self,
        parent: InodeNumber,
        name: &OsStr,
        newparent: InodeNumber,
        newname: &OsStr,
    ) -> Result<()> {
        self.mutate(|st| st.rename(parent, name.as_bytes(), newparent, newname.as_bytes()))
    }

    fn setattr(&self, ino: InodeNumber, request: &SetAttrRequest) -> Result<InodeAttr> {
        self.mutate(|st| {
            st.setattr(ino, request)?;
            Ok(st.attr(ino, self.owner))
        })
    }

    fn statfs(&self) -> Result<FsStats> {
        PageFs::statfs(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgfs_block::MemoryByteDevice;
    use pgfs_types::{DIR_ENTRIES, METADATA_BLOCKS};
    use std::sync::Arc;

    fn memory_fs() -> (Arc<MemoryByteDevice>, PageFs) {
        let dev = Arc::new(MemoryByteDevice::new(IMAGE_SIZE as usize));
        let fs = PageFs::from_device(Box::new(Arc::clone(&dev)), &OpenOptions::default())
            .expect("open");
        (dev, fs)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    // ── Format / resolve ────────────────────────────────────────────────

    #[test]
    fn fresh_volume_has_root_directory() {
        let (_dev, fs) = memory_fs();
        assert_eq!(fs.resolve("/").unwrap(), InodeNumber::ROOT);
        let attr = fs.stat("/").unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.size, PAGE_SIZE_U64);
        assert_eq!(attr.nlink, 1);
        assert!(fs.readdir("/").unwrap().is_empty());

        let stats = fs.statfs().unwrap();
        assert_eq!(stats.blocks_free, u64::from(PAGE_COUNT - METADATA_BLOCKS - 1));
        assert_eq!(stats.inodes_free, u64::from(MAX_INODES - 1));
    }

    #[test]
    fn relative_paths_are_invalid() {
        let (_dev, fs) = memory_fs();
        assert!(matches!(
            fs.resolve("a/b"),
            Err(PgfsError::InvalidArgument(_))
        ));
        assert!(matches!(fs.resolve(""), Err(PgfsError::InvalidArgument(_))));
    }

    #[test]
    fn empty_components_are_ignored() {
        let (_dev, fs) = memory_fs();
        let inum = fs.mknod("/a", 0o644).unwrap();
        assert_eq!(fs.resolve("//a/").unwrap(), inum);
        assert_eq!(fs.resolve("/a").unwrap(), inum);
    }

    #[test]
    fn file_component_in_the_middle_is_not_directory() {
        let (_dev, fs) = memory_fs();
        fs.mknod("/file", 0o644).unwrap();
        assert!(matches!(
            fs.resolve("/file/x"),
            Err(PgfsError::NotDirectory)
        ));
        assert!(matches!(
            fs.mknod("/file/x", 0o644),
            Err(PgfsError::NotDirectory)
        ));
    }

    // ── Data path ───────────────────────────────────────────────────────

    #[test]
    fn write_read_round_trips() {
        let (_dev, fs) = memory_fs();
        for (i, len) in [100_usize, 4096, 5000, 20_000].into_iter().enumerate() {
            let path = format!("/f{i}");
            fs.mknod(&path, 0o644).unwrap();
            let data = pattern(len);
            assert_eq!(fs.write(&path, &data, 0).unwrap(), len);
            assert_eq!(fs.read(&path, len, 0).unwrap(), data);
            assert_eq!(fs.stat(&path).unwrap().size, len as u64);
        }
    }

    #[test]
    fn read_is_clamped_to_file_size() {
        let (_dev, fs) = memory_fs();
        fs.mknod("/f", 0o644).unwrap();
        fs.write("/f", b"hello", 0).unwrap();
        assert_eq!(fs.read("/f", 100, 0).unwrap(), b"hello");
        assert_eq!(fs.read("/f", 100, 3).unwrap(), b"lo");
        assert!(fs.read("/f", 10, 5).unwrap().is_empty());
        assert!(fs.read("/f", 10, 9999).unwrap().is_empty());
    }

    #[test]
    fn unaligned_overwrite_spans_blocks() {
        let (_dev, fs) = memory_fs();
        fs.mknod("/f", 0o644).unwrap();
        fs.write("/f", &vec![b'a'; 3 * PAGE_SIZE], 0).unwrap();
        fs.write("/f", &vec![b'b'; 100], PAGE_SIZE_U64 - 50).unwrap();
        let data = fs.read("/f", 3 * PAGE_SIZE, 0).unwrap();
        assert_eq!(data.len(), 3 * PAGE_SIZE);
        assert!(data[..PAGE_SIZE - 50].iter().all(|&b| b == b'a'));
        assert!(data[PAGE_SIZE - 50..PAGE_SIZE + 50].iter().all(|&b| b == b'b'));
        assert!(data[PAGE_SIZE + 50..].iter().all(|&b| b == b'a'));
    }

    #[test]
    fn write_past_max_size_is_invalid() {
        let (_dev, fs) = memory_fs();
        fs.mknod("/f", 0o644).unwrap();
        assert!(matches!(
            fs.write("/f", b"x", MAX_FILE_SIZE),
            Err(PgfsError::InvalidArgument(_))
        ));
        assert_eq!(fs.stat("/f").unwrap().size, 0);
    }

    #[test]
    fn sparse_write_reads_zeros_in_gap() {
        let (_dev, fs) = memory_fs();
        fs.mknod("/f", 0o644).unwrap();
        fs.write("/f", b"end", 10_000).unwrap();
        let data = fs.read("/f", 10_003, 0).unwrap();
        assert!(data[..10_000].iter().all(|&b| b == 0));
        assert_eq!(&data[10_000..], b"end");
    }

    #[test]
    fn directories_reject_data_io() {
        let (_dev, fs) = memory_fs();
        fs.mkdir("/d", 0o755).unwrap();
        assert!(matches!(fs.read("/d", 1, 0), Err(PgfsError::IsDirectory)));
        assert!(matches!(
            fs.write("/d", b"x", 0),
            Err(PgfsError::IsDirectory)
        ));
        assert!(matches!(fs.truncate("/d", 0), Err(PgfsError::IsDirectory)));
    }

    #[test]
    fn failed_grow_leaves_file_unchanged() {
        let (_dev, fs) = memory_fs();
        fs.mknod("/big", 0o644).unwrap();
        fs.mknod("/small", 0o644).unwrap();
        fs.write("/small", b"keep", 0).unwrap();

        // The volume holds far fewer blocks than a maximal file needs.
        let err = fs
            .write("/big", &vec![1_u8; 300 * PAGE_SIZE], 0)
            .unwrap_err();
        assert!(matches!(err, PgfsError::NoSpace));
        assert_eq!(fs.stat("/big").unwrap().size, 0);
        assert_eq!(fs.read("/small", 10, 0).unwrap(), b"keep");
        let stats = fs.statfs().unwrap();
        // Root block and /small's block.
        assert_eq!(
            stats.blocks_free,
            u64::from(PAGE_COUNT - METADATA_BLOCKS - 2)
        );
    }

    #[test]
    fn truncate_down_then_up_reads_zeros() {
        let (_dev, fs) = memory_fs();
        fs.mknod("/f", 0o644).unwrap();
        fs.write("/f", &vec![0xEE; 10_000], 0).unwrap();
        fs.truncate("/f", 100).unwrap();
        assert_eq!(fs.stat("/f").unwrap().size, 100);
        fs.truncate("/f", 10_000).unwrap();
        let data = fs.read("/f", 10_000, 0).unwrap();
        assert!(data[..100].iter().all(|&b| b == 0xEE));
        assert!(data[100..].iter().all(|&b| b == 0));
    }

    // ── Namespace ───────────────────────────────────────────────────────

    #[test]
    fn mknod_then_stat() {
        let (_dev, fs) = memory_fs();
        let inum = fs.mknod("/new", 0o640).unwrap();
        assert_eq!(fs.resolve("/new").unwrap(), inum);
        let attr = fs.stat("/new").unwrap();
        assert_eq!(attr.size, 0);
        assert_eq!(attr.blocks, 0);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.nlink, 1);
        assert!(matches!(fs.mknod("/new", 0o644), Err(PgfsError::Exists)));
    }

    #[test]
    fn mknod_name_rules() {
        let (_dev, fs) = memory_fs();
        assert!(matches!(
            fs.mknod(&format!("/{}", "n".repeat(DIR_NAME_LEN + 1)), 0o644),
            Err(PgfsError::NameTooLong)
        ));
        assert!(fs.mknod(&format!("/{}", "n".repeat(DIR_NAME_LEN)), 0o644).is_ok());
        assert!(matches!(
            fs.mknod("/", 0o644),
            Err(PgfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.mknod("/missing/f", 0o644),
            Err(PgfsError::NotFound(_))
        ));
    }

    #[test]
    fn full_directory_rejects_entry_without_leaking() {
        let (_dev, fs) = memory_fs();
        for i in 0..DIR_ENTRIES {
            fs.mknod(&format!("/f{i}"), 0o644).unwrap();
        }
        let before = fs.statfs().unwrap();
        assert!(matches!(
            fs.mknod("/overflow", 0o644),
            Err(PgfsError::NoSpace)
        ));
        assert!(matches!(
            fs.mkdir("/overflow", 0o755),
            Err(PgfsError::NoSpace)
        ));
        assert_eq!(fs.statfs().unwrap(), before);
        assert_eq!(fs.readdir("/").unwrap().len(), DIR_ENTRIES);
        assert!(fs.resolve("/f0").is_ok());
    }

    #[test]
    fn link_and_unlink_count_references() {
        let (_dev, fs) = memory_fs();
        let inum = fs.mknod("/a", 0o644).unwrap();
        fs.write("/a", b"shared", 0).unwrap();
        fs.link("/a", "/b").unwrap();
        assert_eq!(fs.resolve("/b").unwrap(), inum);
        assert_eq!(fs.stat("/a").unwrap().nlink, 2);

        fs.unlink("/a").unwrap();
        assert!(matches!(fs.resolve("/a"), Err(PgfsError::NotFound(_))));
        assert_eq!(fs.stat("/b").unwrap().nlink, 1);
        assert_eq!(fs.read("/b", 6, 0).unwrap(), b"shared");

        let before = fs.statfs().unwrap();
        fs.unlink("/b").unwrap();
        assert!(matches!(fs.resolve("/b"), Err(PgfsError::NotFound(_))));
        let after = fs.statfs().unwrap();
        assert_eq!(after.inodes_free, before.inodes_free + 1);
        assert_eq!(after.blocks_free, before.blocks_free + 1);
    }

    #[test]
    fn link_failure_keeps_reference_count() {
        let (_dev, fs) = memory_fs();
        fs.mknod("/a", 0o644).unwrap();
        fs.mknod("/b", 0o644).unwrap();
        assert!(matches!(fs.link("/a", "/b"), Err(PgfsError::Exists)));
        assert_eq!(fs.stat("/a").unwrap().nlink, 1);
    }

    #[test]
    fn directories_cannot_be_hard_linked_or_unlinked() {
        let (_dev, fs) = memory_fs();
        fs.mkdir("/d", 0o755).unwrap();
        assert!(matches!(fs.link("/d", "/e"), Err(PgfsError::NotPermitted)));
        assert!(matches!(fs.unlink("/d"), Err(PgfsError::IsDirectory)));
    }

    #[test]
    fn rmdir_rules() {
        let (_dev, fs) = memory_fs();
        fs.mkdir("/d", 0o755).unwrap();
        fs.mknod("/d/f", 0o644).unwrap();
        fs.mknod("/plain", 0o644).unwrap();
        assert!(matches!(fs.rmdir("/d"), Err(PgfsError::NotEmpty)));
        assert!(matches!(fs.rmdir("/plain"), Err(PgfsError::NotDirectory)));
        assert!(matches!(fs.rmdir("/"), Err(PgfsError::InvalidArgument(_))));

        let before = fs.statfs().unwrap();
        fs.unlink("/d/f").unwrap();
        fs.rmdir("/d").unwrap();
        assert!(matches!(fs.resolve("/d"), Err(PgfsError::NotFound(_))));
        let after = fs.statfs().unwrap();
        assert_eq!(after.inodes_free, before.inodes_free + 2);
        assert_eq!(after.blocks_free, before.blocks_free + 1);
    }

    #[test]
    fn chmod_keeps_file_type() {
        let (_dev, fs) = memory_fs();
        fs.mkdir("/d", 0o755).unwrap();
        fs.chmod("/d", S_IFREG | 0o700).unwrap();
        let attr = fs.stat("/d").unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o700);
    }

    #[test]
    fn access_checks_existence_only() {
        let (_dev, fs) = memory_fs();
        fs.mknod("/locked", 0o000).unwrap();
        fs.access("/locked").unwrap();
        fs.access("/").unwrap();
        assert!(matches!(fs.access("/nope"), Err(PgfsError::NotFound(_))));
    }

    #[test]
    fn set_time_overwrites_timestamps() {
        let (_dev, fs) = memory_fs();
        fs.mknod("/f", 0o644).unwrap();
        fs.set_time("/f", 1_000, 2_000).unwrap();
        let attr = fs.stat("/f").unwrap();
        assert_eq!(attr.atime, to_system_time(1_000));
        assert_eq!(attr.mtime, to_system_time(2_000));
    }

    // ── Rename ──────────────────────────────────────────────────────────

    #[test]
    fn rename_moves_file_between_directories() {
        let (_dev, fs) = memory_fs();
        fs.mkdir("/src", 0o755).unwrap();
        fs.mkdir("/dst", 0o755).unwrap();
        let inum = fs.mknod("/src/f", 0o644).unwrap();
        fs.write("/src/f", b"data", 0).unwrap();

        fs.rename("/src/f", "/dst/g").unwrap();
        assert!(matches!(fs.resolve("/src/f"), Err(PgfsError::NotFound(_))));
        assert_eq!(fs.resolve("/dst/g").unwrap(), inum);
        assert_eq!(fs.stat("/dst/g").unwrap().nlink, 1);
        assert_eq!(fs.read("/dst/g", 4, 0).unwrap(), b"data");
    }

    #[test]
    fn rename_replaces_existing_file() {
        let (_dev, fs) = memory_fs();
        let a = fs.mknod("/a", 0o644).unwrap();
        fs.mknod("/b", 0o644).unwrap();
        fs.write("/b", b"old", 0).unwrap();
        let before = fs.statfs().unwrap();

        fs.rename("/a", "/b").unwrap();
        assert_eq!(fs.resolve("/b").unwrap(), a);
        assert!(matches!(fs.resolve("/a"), Err(PgfsError::NotFound(_))));
        let after = fs.statfs().unwrap();
        assert_eq!(after.inodes_free, before.inodes_free + 1);
        assert_eq!(after.blocks_free, before.blocks_free + 1);
    }

    #[test]
    fn rename_directory_and_type_conflicts() {
        let (_dev, fs) = memory_fs();
        fs.mkdir("/d", 0o755).unwrap();
        fs.mknod("/d/inner", 0o644).unwrap();
        fs.mknod("/f", 0o644).unwrap();
        fs.mkdir("/full", 0o755).unwrap();
        fs.mknod("/full/x", 0o644).unwrap();

        assert!(matches!(fs.rename("/f", "/d"), Err(PgfsError::IsDirectory)));
        assert!(matches!(fs.rename("/d", "/f"), Err(PgfsError::NotDirectory)));
        assert!(matches!(fs.rename("/d", "/full"), Err(PgfsError::NotEmpty)));
        assert!(matches!(
            fs.rename("/d", "/d/sub"),
            Err(PgfsError::InvalidArgument(_))
        ));

        fs.rename("/d", "/moved").unwrap();
        assert!(fs.resolve("/moved/inner").is_ok());
        assert_eq!(fs.stat("/moved").unwrap().nlink, 1);
    }

    #[test]
    fn rename_into_full_directory_changes_nothing() {
        let (_dev, fs) = memory_fs();
        fs.mkdir("/full", 0o755).unwrap();
        for i in 0..DIR_ENTRIES {
            fs.mknod(&format!("/full/f{i}"), 0o644).unwrap();
        }
        let inum = fs.mknod("/a", 0o644).unwrap();
        assert!(matches!(
            fs.rename("/a", "/full/a"),
            Err(PgfsError::NoSpace)
        ));
        assert_eq!(fs.resolve("/a").unwrap(), inum);
        assert_eq!(fs.stat("/a").unwrap().nlink, 1);
    }

    #[test]
    fn rename_to_same_path_is_noop() {
        let (_dev, fs) = memory_fs();
        let inum = fs.mknod("/a", 0o644).unwrap();
        fs.rename("/a", "/a").unwrap();
        assert_eq!(fs.resolve("/a").unwrap(), inum);
        assert_eq!(fs.stat("/a").unwrap().nlink, 1);
    }

    // ── FsOps ───────────────────────────────────────────────────────────

    #[test]
    fn fsops_readdir_offsets_resume() {
        let (_dev, fs) = memory_fs();
        for name in ["a", "b", "c"] {
            fs.mknod(&format!("/{name}"), 0o644).unwrap();
        }
        let all = FsOps::readdir(&fs, InodeNumber::ROOT, 0).unwrap();
        assert_eq!(all.len(), 3);
        let rest = FsOps::readdir(&fs, InodeNumber::ROOT, all[0].offset).unwrap();
        let names: Vec<_> = rest.iter().map(DirEntry::name_str).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(FsOps::readdir(&fs, InodeNumber::ROOT, all[2].offset)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn fsops_lookup_and_setattr() {
        let (_dev, fs) = memory_fs();
        let attr = FsOps::mknod(&fs, InodeNumber::ROOT, OsStr::new("f"), 0o600).unwrap();
        let found = FsOps::lookup(&fs, InodeNumber::ROOT, OsStr::new("f")).unwrap();
        assert_eq!(found.ino, attr.ino);

        let updated = FsOps::setattr(
            &fs,
            attr.ino,
            &SetAttrRequest {
                mode: Some(0o644),
                size: Some(5000),
                atime: Some(7),
                mtime: Some(8),
            },
        )
        .unwrap();
        assert_eq!(updated.perm, 0o644);
        assert_eq!(updated.size, 5000);
        assert_eq!(updated.mtime, to_system_time(8));
        assert_eq!(updated.blocks, 16);

        assert!(matches!(
            FsOps::getattr(&fs, InodeNumber(200)),
            Err(PgfsError::NotFound(_))
        ));
    }

    #[test]
    fn metadata_reaches_the_device_after_each_operation() {
        let (dev, fs) = memory_fs();
        fs.mknod("/persisted", 0o644).unwrap();
        let image = dev.snapshot();
        // Inode bitmap: root and the new file.
        assert_eq!(image[pgfs_ondisk::INODE_BITMAP_OFFSET], 0xC0);

        let reopened =
            PageFs::from_device(Box::new(MemoryByteDevice::from_bytes(image)), &OpenOptions::default())
                .unwrap();
        assert!(reopened.resolve("/persisted").is_ok());
    }
}
