#![forbid(unsafe_code)]
//! Backing store for a PageFS volume.
//!
//! The whole region is small (`PAGE_COUNT * PAGE_SIZE` bytes), so it is loaded
//! once into an in-memory arena. Callers address blocks by index and borrow
//! them in place. Mutable borrows mark blocks dirty, and `flush` writes the
//! dirty set back through a [`ByteDevice`].

use parking_lot::Mutex;
use pgfs_error::{PgfsError, Result};
use pgfs_types::{BlockNumber, IMAGE_SIZE, METADATA_BLOCKS, PAGE_COUNT, PAGE_SIZE};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, trace};

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64, what: &str) -> Result<()> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| PgfsError::Format(format!("{what} range overflows u64")))?;
    if end > device_len {
        return Err(PgfsError::Format(format!(
            "{what} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `std::os::unix::fs::FileExt`, which is
/// thread-safe and does not require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open `path` read-write, creating it when `create` is set, and force its
    /// length to exactly `len` bytes. A fresh or extended file reads as zeros.
    pub fn open_or_create(path: impl AsRef<Path>, len: u64, create: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;
        let current = file.metadata()?.len();
        if current != len {
            info!(
                path = %path.display(),
                current,
                target = len,
                "resizing backing file"
            );
            file.set_len(len)?;
        }
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// Owner `(uid, gid)` of the backing file.
    pub fn owner(&self) -> Result<(u32, u32)> {
        let meta = self.file.metadata()?;
        Ok((meta.uid(), meta.gid()))
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

fn len_u64(bytes: &[u8]) -> u64 {
    u64::try_from(bytes.len()).unwrap_or(0)
}

/// Volatile device backed by a `Vec<u8>`.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    /// Device initialized with `bytes`, e.g. an image captured by `snapshot`.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Copy of the current device contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        len_u64(&self.bytes.lock())
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), len_u64(&bytes), "read")?;
        let start = usize::try_from(offset)
            .map_err(|_| PgfsError::Format("offset overflow".into()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), len_u64(&bytes), "write")?;
        let start = usize::try_from(offset)
            .map_err(|_| PgfsError::Format("offset overflow".into()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// The volume image as an arena of `PAGE_COUNT` blocks.
///
/// Invariant: `arena.len() == IMAGE_SIZE`. Block indices outside
/// `0..PAGE_COUNT` are programmer errors and panic.
pub struct BlockStore {
    device: Box<dyn ByteDevice>,
    arena: Vec<u8>,
    dirty: BTreeSet<u32>,
    sync_writes: bool,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("len", &self.arena.len())
            .field("dirty", &self.dirty.len())
            .field("sync_writes", &self.sync_writes)
            .finish_non_exhaustive()
    }
}

impl BlockStore {
    /// Load the full region from `device`, which must be exactly
    /// `IMAGE_SIZE` bytes long.
    pub fn open(device: Box<dyn ByteDevice>, sync_writes: bool) -> Result<Self> {
        let len = device.len_bytes();
        if len != IMAGE_SIZE {
            return Err(PgfsError::Format(format!(
                "backing store is {len} bytes, expected {IMAGE_SIZE}"
            )));
        }
        let mut arena = vec![0_u8; PAGE_COUNT as usize * PAGE_SIZE];
        device.read_exact_at(0, &mut arena)?;
        trace!(len, "loaded backing store");
        Ok(Self {
            device,
            arena,
            dirty: BTreeSet::new(),
            sync_writes,
        })
    }

    fn range(block: BlockNumber) -> std::ops::Range<usize> {
        assert!(
            block.0 < PAGE_COUNT,
            "block {block} out of range (PAGE_COUNT = {PAGE_COUNT})"
        );
        let start = block.index() * PAGE_SIZE;
        start..start + PAGE_SIZE
    }

    /// Borrow block `block` in place.
    #[must_use]
    pub fn block(&self, block: BlockNumber) -> &[u8] {
        &self.arena[Self::range(block)]
    }

    /// Mutably borrow block `block` and mark it dirty.
    pub fn block_mut(&mut self, block: BlockNumber) -> &mut [u8] {
        let range = Self::range(block);
        self.dirty.insert(block.0);
        &mut self.arena[range]
    }

    /// Fill block `block` with zeros.
    pub fn zero_block(&mut self, block: BlockNumber) {
        self.block_mut(block).fill(0);
    }

    /// The metadata region (blocks `0..METADATA_BLOCKS`).
    #[must_use]
    pub fn metadata(&self) -> &[u8] {
        &self.arena[..METADATA_BLOCKS as usize * PAGE_SIZE]
    }

    /// Mutable metadata region. Marks every metadata block dirty.
    pub fn metadata_mut(&mut self) -> &mut [u8] {
        self.dirty.extend(0..METADATA_BLOCKS);
        &mut self.arena[..METADATA_BLOCKS as usize * PAGE_SIZE]
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Write every dirty block back to the device, coalescing adjacent blocks
    /// into one write. Blocks stay dirty if a write fails.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        let mut runs: Vec<(u32, u32)> = Vec::new();
        for &block in &self.dirty {
            match runs.last_mut() {
                Some((_, end)) if *end == block => *end += 1,
                _ => runs.push((block, block + 1)),
            }
        }

        for &(start, end) in &runs {
            let from = start as usize * PAGE_SIZE;
            let to = end as usize * PAGE_SIZE;
            self.device
                .write_all_at(BlockNumber(start).byte_offset(), &self.arena[from..to])?;
        }
        if self.sync_writes {
            self.device.sync()?;
        }

        trace!(
            blocks = self.dirty.len(),
            writes = runs.len(),
            "flushed dirty blocks"
        );
        self.dirty.clear();
        Ok(())
    }
}
