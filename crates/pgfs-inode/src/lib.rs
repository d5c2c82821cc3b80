#![forbid(unsafe_code)]
//! Inode management.
//!
//! The inode table holds `MAX_INODES` fixed-size records and a slot bitmap.
//! Each inode maps its logical blocks through two direct pointers and one
//! indirect block:
//!
//! ```text
//! logical 0, 1    -> ptrs[0], ptrs[1]
//! logical 2..1026 -> entry (logical - 2) of the iptr block
//! ```
//!
//! For every live inode exactly `ceil(size / PAGE_SIZE)` data blocks are
//! mapped, populated in logical order, and the indirect block exists iff more
//! than `DIRECT_PTRS` blocks are mapped. `grow` and `shrink` are the only
//! routines that change the mapping.

use pgfs_alloc::{BlockAllocator, bitmap_count_free, bitmap_find_free, bitmap_get, bitmap_put};
use pgfs_block::BlockStore;
use pgfs_error::{PgfsError, Result};
use pgfs_ondisk::{
    INODE_BITMAP_LEN, INODE_BITMAP_OFFSET, INODE_RECORD_SIZE, inode_record_offset,
    read_indirect_entry, write_indirect_entry,
};
use pgfs_types::{
    BlockNumber, DIRECT_PTRS, InodeNumber, MAX_FILE_SIZE, MAX_INODES, PAGE_SIZE, PAGE_SIZE_U64,
    ParseError, bytes_to_blocks,
};
use tracing::{trace, warn};

pub use pgfs_ondisk::InodeRecord as Inode;

fn corrupt(block: BlockNumber, detail: impl Into<String>) -> PgfsError {
    PgfsError::Corruption {
        block: u64::from(block.0),
        detail: detail.into(),
    }
}

fn parse_corrupt(offset: usize, err: &ParseError) -> PgfsError {
    PgfsError::Corruption {
        block: (offset / PAGE_SIZE) as u64,
        detail: err.to_string(),
    }
}

// ── Block map ───────────────────────────────────────────────────────────────

/// Physical block backing logical block `logical` of `inode`.
///
/// Never allocates. Asking for a block at or past `ceil(size / PAGE_SIZE)`
/// is a caller bug and reports `Corruption`, as does a hole inside the
/// mapped range.
pub fn resolve_block(store: &BlockStore, inode: &Inode, logical: u64) -> Result<BlockNumber> {
    if logical >= inode.block_count() {
        return Err(corrupt(
            BlockNumber::NONE,
            format!(
                "logical block {logical} beyond mapped range of {} blocks",
                inode.block_count()
            ),
        ));
    }
    let logical = logical as usize;
    let block = if logical < DIRECT_PTRS {
        inode.ptrs[logical]
    } else {
        if inode.iptr.is_none() {
            return Err(corrupt(
                BlockNumber::NONE,
                format!("logical block {logical} needs an indirect block but none is mapped"),
            ));
        }
        read_indirect_entry(store.block(inode.iptr), logical - DIRECT_PTRS)
            .map_err(|err| corrupt(inode.iptr, err.to_string()))?
    };
    if block.is_none() {
        let holder = if logical < DIRECT_PTRS {
            BlockNumber::NONE
        } else {
            inode.iptr
        };
        return Err(corrupt(
            holder,
            format!("logical block {logical} is unmapped inside the file"),
        ));
    }
    Ok(block)
}

/// Point logical block `logical` at `block` (or unmap it with
/// `BlockNumber::NONE`). The indirect block must already exist for
/// `logical >= DIRECT_PTRS`.
fn set_mapping(store: &mut BlockStore, inode: &mut Inode, logical: usize, block: BlockNumber) {
    if logical < DIRECT_PTRS {
        inode.ptrs[logical] = block;
    } else {
        write_indirect_entry(store.block_mut(inode.iptr), logical - DIRECT_PTRS, block);
    }
}

fn indirect_is_empty(store: &BlockStore, iptr: BlockNumber) -> bool {
    store.block(iptr).iter().all(|&b| b == 0)
}

// ── Inode table ─────────────────────────────────────────────────────────────

/// All inode records plus their slot bitmap, decoded from the metadata
/// region. Callers share records by index through `get`/`get_mut`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeTable {
    bitmap: [u8; INODE_BITMAP_LEN],
    records: Vec<Inode>,
}

impl InodeTable {
    /// Decode the inode bitmap and every record from the metadata region.
    pub fn load(metadata: &[u8]) -> Result<Self> {
        let raw = metadata
            .get(INODE_BITMAP_OFFSET..INODE_BITMAP_OFFSET + INODE_BITMAP_LEN)
            .ok_or_else(|| corrupt(BlockNumber(0), "metadata region too short for inode bitmap"))?;
        let mut bitmap = [0_u8; INODE_BITMAP_LEN];
        bitmap.copy_from_slice(raw);

        let mut records = Vec::with_capacity(MAX_INODES as usize);
        for inum in 0..MAX_INODES {
            let offset = inode_record_offset(InodeNumber(inum));
            let bytes = metadata
                .get(offset..offset + INODE_RECORD_SIZE)
                .ok_or_else(|| corrupt(BlockNumber(0), "metadata region too short for inode table"))?;
            let record = if bitmap_get(&bitmap, inum) {
                Inode::parse_from_bytes(bytes).map_err(|err| parse_corrupt(offset, &err))?
            } else {
                Inode::default()
            };
            records.push(record);
        }
        Ok(Self { bitmap, records })
    }

    /// An empty table with every slot free.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            bitmap: [0; INODE_BITMAP_LEN],
            records: vec![Inode::default(); MAX_INODES as usize],
        }
    }

    /// Write the bitmap and every record back into the metadata region.
    pub fn encode_into(&self, metadata: &mut [u8]) {
        metadata[INODE_BITMAP_OFFSET..INODE_BITMAP_OFFSET + INODE_BITMAP_LEN]
            .copy_from_slice(&self.bitmap);
        for (inum, record) in (0..MAX_INODES).zip(&self.records) {
            let offset = inode_record_offset(InodeNumber(inum));
            record.write_to_bytes(&mut metadata[offset..offset + INODE_RECORD_SIZE]);
        }
    }

    /// Claim the lowest free slot and reset its record to zeros.
    pub fn alloc(&mut self) -> Result<InodeNumber> {
        let idx = bitmap_find_free(&self.bitmap, MAX_INODES).ok_or(PgfsError::NoSpace)?;
        bitmap_put(&mut self.bitmap, idx, true);
        self.records[idx as usize] = Inode::default();
        trace!(inode = idx, "alloc inode");
        Ok(InodeNumber(idx))
    }

    #[must_use]
    pub fn is_allocated(&self, inum: InodeNumber) -> bool {
        inum.0 < MAX_INODES && bitmap_get(&self.bitmap, inum.0)
    }

    /// Record for `inum`. Panics if `inum >= MAX_INODES`.
    #[must_use]
    pub fn get(&self, inum: InodeNumber) -> &Inode {
        &self.records[inum.index()]
    }

    /// Mutable record for `inum`. Panics if `inum >= MAX_INODES`.
    pub fn get_mut(&mut self, inum: InodeNumber) -> &mut Inode {
        &mut self.records[inum.index()]
    }

    /// Record for an externally supplied inode number.
    pub fn try_get(&self, inum: InodeNumber) -> Result<&Inode> {
        if self.is_allocated(inum) {
            Ok(self.get(inum))
        } else {
            Err(PgfsError::NotFound(format!("inode {inum}")))
        }
    }

    #[must_use]
    pub fn used_count(&self) -> u32 {
        MAX_INODES - self.free_count()
    }

    #[must_use]
    pub fn free_count(&self) -> u32 {
        bitmap_count_free(&self.bitmap, MAX_INODES)
    }

    /// Allocated inode numbers in increasing order.
    pub fn allocated(&self) -> impl Iterator<Item = InodeNumber> + '_ {
        (0..MAX_INODES)
            .filter(|&inum| bitmap_get(&self.bitmap, inum))
            .map(InodeNumber)
    }

    /// Every data block mapped by `inum`, in logical order. The indirect
    /// block itself is not included.
    pub fn mapped_blocks(&self, store: &BlockStore, inum: InodeNumber) -> Result<Vec<BlockNumber>> {
        let inode = self.get(inum);
        (0..inode.block_count())
            .map(|logical| resolve_block(store, inode, logical))
            .collect()
    }

    /// Extend `inum` to `new_size` bytes, allocating the missing blocks in
    /// logical order.
    ///
    /// All or nothing: if any allocation fails, every block taken by this
    /// call is released, the mapping is restored, and the size is unchanged.
    pub fn grow(
        &mut self,
        store: &mut BlockStore,
        alloc: &mut BlockAllocator,
        inum: InodeNumber,
        new_size: u64,
    ) -> Result<()> {
        if new_size > MAX_FILE_SIZE {
            return Err(PgfsError::InvalidArgument(format!(
                "size {new_size} exceeds maximum file size {MAX_FILE_SIZE}"
            )));
        }
        let original = *self.get(inum);
        if new_size <= u64::from(original.size) {
            return Ok(());
        }

        let have = original.block_count() as usize;
        let want = bytes_to_blocks(new_size) as usize;
        let mut inode = original;
        let mut added: Vec<(usize, BlockNumber)> = Vec::with_capacity(want - have);
        let mut fresh_iptr = None;

        let outcome = (|| -> Result<()> {
            for logical in have..want {
                if logical >= DIRECT_PTRS && inode.iptr.is_none() {
                    let iptr = alloc.alloc()?;
                    store.zero_block(iptr);
                    inode.iptr = iptr;
                    fresh_iptr = Some(iptr);
                }
                let block = alloc.alloc()?;
                store.zero_block(block);
                set_mapping(store, &mut inode, logical, block);
                added.push((logical, block));
            }
            Ok(())
        })();

        if let Err(err) = outcome {
            warn!(
                inode = inum.0,
                size = original.size,
                new_size,
                allocated = added.len(),
                error = %err,
                "grow failed, rolling back"
            );
            for &(logical, block) in added.iter().rev() {
                if logical >= DIRECT_PTRS && fresh_iptr.is_none() {
                    set_mapping(store, &mut inode, logical, BlockNumber::NONE);
                }
                alloc.free(store, block)?;
            }
            if let Some(iptr) = fresh_iptr {
                alloc.free(store, iptr)?;
            }
            *self.get_mut(inum) = original;
            return Err(err);
        }

        inode.size = new_size as u32;
        *self.get_mut(inum) = inode;
        trace!(inode = inum.0, blocks = want, size = new_size, "grew inode");
        Ok(())
    }

    /// Cut `inum` down to `new_size` bytes.
    ///
    /// Blocks past the new end are zeroed and released from the highest
    /// logical index down. The indirect block goes once it holds no entries.
    /// Bytes of the last kept block past `new_size` are zeroed, so a later
    /// `grow` never exposes stale data.
    pub fn shrink(
        &mut self,
        store: &mut BlockStore,
        alloc: &mut BlockAllocator,
        inum: InodeNumber,
        new_size: u64,
    ) -> Result<()> {
        let old_size = u64::from(self.get(inum).size);
        if new_size > old_size {
            return Err(PgfsError::InvalidArgument(format!(
                "shrink to {new_size} would grow a {old_size}-byte file"
            )));
        }

        let keep = bytes_to_blocks(new_size);
        let have = bytes_to_blocks(old_size);
        for logical in (keep..have).rev() {
            let block = resolve_block(store, self.get(inum), logical)?;
            alloc.free(store, block)?;
            let inode = &mut self.records[inum.index()];
            set_mapping(store, inode, logical as usize, BlockNumber::NONE);
            // Keep the block-count invariant at every step.
            inode.size = (logical * PAGE_SIZE_U64) as u32;
        }

        let inode = &mut self.records[inum.index()];
        if !inode.iptr.is_none() && indirect_is_empty(store, inode.iptr) {
            let iptr = inode.iptr;
            inode.iptr = BlockNumber::NONE;
            alloc.free(store, iptr)?;
        }

        let tail = (new_size % PAGE_SIZE_U64) as usize;
        if tail != 0 {
            let last = resolve_block(store, self.get(inum), keep - 1)?;
            store.block_mut(last)[tail..].fill(0);
        }

        self.get_mut(inum).size = new_size as u32;
        trace!(inode = inum.0, old_size, new_size, "shrank inode");
        Ok(())
    }

    /// Release every block of `inum` and return its slot to the free pool.
    pub fn free(
        &mut self,
        store: &mut BlockStore,
        alloc: &mut BlockAllocator,
        inum: InodeNumber,
    ) -> Result<()> {
        if inum.is_root() {
            return Err(PgfsError::InvalidArgument("the root inode is never freed".into()));
        }
        if !self.is_allocated(inum) {
            warn!(inode = inum.0, "free of unallocated inode ignored");
            return Ok(());
        }
        self.shrink(store, alloc, inum, 0)?;
        *self.get_mut(inum) = Inode::default();
        bitmap_put(&mut self.bitmap, inum.0, false);
        trace!(inode = inum.0, "free inode");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgfs_block::MemoryByteDevice;
    use pgfs_ondisk::METADATA_LEN;
    use pgfs_types::{IMAGE_SIZE, METADATA_BLOCKS, PAGE_COUNT, S_IFREG};
    use proptest::prelude::*;
    use std::collections::HashSet;

    struct Fixture {
        store: BlockStore,
        alloc: BlockAllocator,
        table: InodeTable,
    }

    impl Fixture {
        fn new() -> Self {
            let dev = MemoryByteDevice::new(IMAGE_SIZE as usize);
            let store = BlockStore::open(Box::new(dev), false).expect("store");
            let mut alloc = BlockAllocator::load(store.metadata()).expect("alloc");
            alloc.format();
            Self {
                store,
                alloc,
                table: InodeTable::empty(),
            }
        }

        fn file(&mut self) -> InodeNumber {
            let inum = self.table.alloc().expect("alloc inode");
            self.table.get_mut(inum).mode = S_IFREG | 0o644;
            self.table.get_mut(inum).refs = 1;
            inum
        }

        fn grow(&mut self, inum: InodeNumber, size: u64) -> Result<()> {
            self.table.grow(&mut self.store, &mut self.alloc, inum, size)
        }

        fn shrink(&mut self, inum: InodeNumber, size: u64) -> Result<()> {
            self.table.shrink(&mut self.store, &mut self.alloc, inum, size)
        }

        fn assert_block_count_invariant(&self, inum: InodeNumber) {
            let inode = self.table.get(inum);
            let blocks = self
                .table
                .mapped_blocks(&self.store, inum)
                .expect("mapped blocks");
            assert_eq!(blocks.len() as u64, bytes_to_blocks(u64::from(inode.size)));
            let distinct: HashSet<_> = blocks.iter().copied().collect();
            assert_eq!(distinct.len(), blocks.len(), "blocks must be distinct");
            for block in &blocks {
                assert!(self.alloc.is_allocated(*block));
            }
            assert_eq!(!inode.iptr.is_none(), blocks.len() > DIRECT_PTRS);
        }
    }

    // ── Table tests ─────────────────────────────────────────────────────

    #[test]
    fn alloc_returns_lowest_free_slot() {
        let mut table = InodeTable::empty();
        assert_eq!(table.alloc().expect("0"), InodeNumber(0));
        assert_eq!(table.alloc().expect("1"), InodeNumber(1));
        assert_eq!(table.used_count(), 2);
        assert!(table.is_allocated(InodeNumber(1)));
        assert!(!table.is_allocated(InodeNumber(2)));
        assert!(!table.is_allocated(InodeNumber(MAX_INODES)));
    }

    #[test]
    fn alloc_exhaustion_is_no_space() {
        let mut table = InodeTable::empty();
        for _ in 0..MAX_INODES {
            table.alloc().expect("alloc");
        }
        assert!(matches!(table.alloc(), Err(PgfsError::NoSpace)));
    }

    #[test]
    fn get_mut_is_shared_state() {
        let mut table = InodeTable::empty();
        let inum = table.alloc().expect("alloc");
        table.get_mut(inum).refs = 3;
        assert_eq!(table.get(inum).refs, 3);
        assert_eq!(table.try_get(inum).expect("live").refs, 3);
        assert!(matches!(
            table.try_get(InodeNumber(9)),
            Err(PgfsError::NotFound(_))
        ));
    }

    #[test]
    fn encode_and_load_round_trip() {
        let mut fx = Fixture::new();
        let inum = fx.file();
        fx.grow(inum, 9000).expect("grow");
        fx.table.get_mut(inum).mtime = 1234;

        let mut region = vec![0_u8; METADATA_LEN];
        fx.table.encode_into(&mut region);
        let loaded = InodeTable::load(&region).expect("load");
        assert_eq!(loaded, fx.table);
    }

    #[test]
    fn load_reports_corrupt_record() {
        let mut table = InodeTable::empty();
        let inum = table.alloc().expect("alloc");
        table.get_mut(inum).ptrs[0] = BlockNumber(1);
        let mut region = vec![0_u8; METADATA_LEN];
        table.encode_into(&mut region);
        assert!(matches!(
            InodeTable::load(&region),
            Err(PgfsError::Corruption { block: 0, .. })
        ));
    }

    // ── Block map tests ─────────────────────────────────────────────────

    #[test]
    fn grow_maps_direct_then_indirect() {
        let mut fx = Fixture::new();
        let inum = fx.file();

        fx.grow(inum, 100).expect("grow 100");
        assert_eq!(fx.table.get(inum).size, 100);
        assert!(fx.table.get(inum).iptr.is_none());
        fx.assert_block_count_invariant(inum);

        fx.grow(inum, 2 * PAGE_SIZE_U64).expect("grow 2 pages");
        assert!(fx.table.get(inum).iptr.is_none());
        fx.assert_block_count_invariant(inum);

        fx.grow(inum, 20_000).expect("grow 20000");
        assert!(!fx.table.get(inum).iptr.is_none());
        fx.assert_block_count_invariant(inum);
        // 5 data blocks + 1 indirect block.
        assert_eq!(fx.alloc.used_count(), METADATA_BLOCKS + 6);
    }

    #[test]
    fn grow_within_last_block_allocates_nothing() {
        let mut fx = Fixture::new();
        let inum = fx.file();
        fx.grow(inum, 10).expect("grow");
        let used = fx.alloc.used_count();
        fx.grow(inum, 4000).expect("grow in place");
        assert_eq!(fx.alloc.used_count(), used);
        assert_eq!(fx.table.get(inum).size, 4000);
    }

    #[test]
    fn grow_beyond_max_is_invalid() {
        let mut fx = Fixture::new();
        let inum = fx.file();
        assert!(matches!(
            fx.grow(inum, MAX_FILE_SIZE + 1),
            Err(PgfsError::InvalidArgument(_))
        ));
        fx.grow(inum, MAX_FILE_SIZE).expect_err("max size needs more blocks than exist");
    }

    #[test]
    fn resolve_block_never_allocates() {
        let mut fx = Fixture::new();
        let inum = fx.file();
        fx.grow(inum, 10).expect("grow");
        let used = fx.alloc.used_count();
        let inode = *fx.table.get(inum);
        assert!(resolve_block(&fx.store, &inode, 0).is_ok());
        assert!(matches!(
            resolve_block(&fx.store, &inode, 1),
            Err(PgfsError::Corruption { .. })
        ));
        assert!(matches!(
            resolve_block(&fx.store, &inode, 2),
            Err(PgfsError::Corruption { .. })
        ));
        assert_eq!(fx.alloc.used_count(), used);
    }

    #[test]
    fn grow_rolls_back_on_exhaustion() {
        let mut fx = Fixture::new();
        let inum = fx.file();
        fx.grow(inum, 3 * PAGE_SIZE_U64).expect("grow");
        let before_inode = *fx.table.get(inum);

        // Leave exactly two free blocks, then ask for four more.
        let mut hogs = Vec::new();
        while fx.alloc.free_count() > 2 {
            hogs.push(fx.alloc.alloc().expect("hog"));
        }
        let err = fx.grow(inum, 7 * PAGE_SIZE_U64).unwrap_err();
        assert!(matches!(err, PgfsError::NoSpace));
        assert_eq!(*fx.table.get(inum), before_inode);
        assert_eq!(fx.alloc.free_count(), 2);
        fx.assert_block_count_invariant(inum);
    }

    #[test]
    fn grow_rollback_releases_fresh_indirect_block() {
        let mut fx = Fixture::new();
        let inum = fx.file();
        fx.grow(inum, 2 * PAGE_SIZE_U64).expect("grow");

        // One free block: enough for the indirect block, not for data.
        while fx.alloc.free_count() > 1 {
            fx.alloc.alloc().expect("hog");
        }
        let err = fx.grow(inum, 3 * PAGE_SIZE_U64).unwrap_err();
        assert!(matches!(err, PgfsError::NoSpace));
        assert!(fx.table.get(inum).iptr.is_none());
        assert_eq!(fx.alloc.free_count(), 1);
    }

    #[test]
    fn shrink_releases_indirect_and_zeroes_tail() {
        let mut fx = Fixture::new();
        let inum = fx.file();
        fx.grow(inum, 20_000).expect("grow");
        let first = resolve_block(&fx.store, fx.table.get(inum), 0).expect("block 0");
        fx.store.block_mut(first).fill(0x5A);

        fx.shrink(inum, 100).expect("shrink");
        assert_eq!(fx.table.get(inum).size, 100);
        assert!(fx.table.get(inum).iptr.is_none());
        assert_eq!(fx.alloc.used_count(), METADATA_BLOCKS + 1);
        fx.assert_block_count_invariant(inum);

        let block = fx.store.block(first);
        assert!(block[..100].iter().all(|&b| b == 0x5A));
        assert!(block[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn shrink_cannot_grow() {
        let mut fx = Fixture::new();
        let inum = fx.file();
        assert!(matches!(
            fx.shrink(inum, 1),
            Err(PgfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn free_returns_every_block_and_slot() {
        let mut fx = Fixture::new();
        let _root = fx.file();
        let inum = fx.file();
        fx.grow(inum, 50_000).expect("grow");
        fx.table
            .free(&mut fx.store, &mut fx.alloc, inum)
            .expect("free");
        assert!(!fx.table.is_allocated(inum));
        assert_eq!(*fx.table.get(inum), Inode::default());
        assert_eq!(fx.alloc.used_count(), METADATA_BLOCKS);
        assert_eq!(fx.table.alloc().expect("reuse"), inum);
    }

    #[test]
    fn root_is_never_freed() {
        let mut fx = Fixture::new();
        let root = fx.file();
        assert!(root.is_root());
        assert!(matches!(
            fx.table.free(&mut fx.store, &mut fx.alloc, root),
            Err(PgfsError::InvalidArgument(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn resize_sequences_keep_block_count_invariant(
            sizes in proptest::collection::vec(0_u64..(60 * PAGE_SIZE_U64), 1..12),
        ) {
            let mut fx = Fixture::new();
            let inum = fx.file();
            for size in sizes {
                let current = u64::from(fx.table.get(inum).size);
                if size >= current {
                    fx.grow(inum, size).expect("grow");
                } else {
                    fx.shrink(inum, size).expect("shrink");
                }
                prop_assert_eq!(u64::from(fx.table.get(inum).size), size);
                fx.assert_block_count_invariant(inum);
                let indirect = u32::from(!fx.table.get(inum).iptr.is_none());
                prop_assert_eq!(
                    u64::from(fx.alloc.used_count()),
                    u64::from(METADATA_BLOCKS + indirect) + bytes_to_blocks(size)
                );
            }
            prop_assert!(fx.alloc.used_count() <= PAGE_COUNT);
        }
    }
}
