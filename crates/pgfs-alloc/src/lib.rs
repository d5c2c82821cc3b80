#![forbid(unsafe_code)]
//! Block allocation.
//!
//! Two layers:
//!
//! 1. **Bitmap**: raw bit manipulation on byte slices. Bit `i` lives in byte
//!    `i / 8`, most-significant bit first, matching the on-disk bitmaps.
//! 2. **BlockAllocator**: first-fit allocation over the block bitmap.
//!
//! The inode table reuses the bitmap layer for its own slot bitmap.

use pgfs_block::BlockStore;
use pgfs_error::{PgfsError, Result};
use pgfs_ondisk::{BLOCK_BITMAP_LEN, BLOCK_BITMAP_OFFSET};
use pgfs_types::{BlockNumber, METADATA_BLOCKS, PAGE_COUNT};
use tracing::{trace, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

#[inline]
fn bit_mask(idx: u32) -> u8 {
    0x80 >> (idx % 8)
}

/// Get bit `idx`. Panics if `idx` lies beyond the slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    bitmap[(idx / 8) as usize] & bit_mask(idx) != 0
}

/// Set (`true`) or clear (`false`) bit `idx`, leaving every other bit
/// untouched. Panics if `idx` lies beyond the slice.
pub fn bitmap_put(bitmap: &mut [u8], idx: u32, value: bool) {
    let byte = &mut bitmap[(idx / 8) as usize];
    if value {
        *byte |= bit_mask(idx);
    } else {
        *byte &= !bit_mask(idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let mut free: u32 = bitmap[..full_bytes].iter().map(|b| b.count_zeros()).sum();
    for idx in (count - count % 8)..count {
        if !bitmap_get(bitmap, idx) {
            free += 1;
        }
    }
    free
}

/// Lowest free (zero) bit among the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32) -> Option<u32> {
    let full_bytes = (count / 8) as usize;
    if let Some(pos) = bitmap[..full_bytes].iter().position(|&b| b != 0xFF) {
        let byte = bitmap[pos];
        // leading_ones() of a byte that is not 0xFF is below 8.
        let idx = u32::try_from(pos).ok()? * 8 + byte.leading_ones();
        return Some(idx);
    }
    ((count - count % 8)..count).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Block allocator ─────────────────────────────────────────────────────────

/// First-fit allocator over the `PAGE_COUNT`-bit block bitmap.
///
/// Blocks `0..METADATA_BLOCKS` are permanently marked used on a formatted
/// volume and are never handed out or freed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAllocator {
    bitmap: [u8; BLOCK_BITMAP_LEN],
}

impl BlockAllocator {
    /// Decode the block bitmap from the metadata region.
    pub fn load(metadata: &[u8]) -> Result<Self> {
        let raw = metadata
            .get(BLOCK_BITMAP_OFFSET..BLOCK_BITMAP_OFFSET + BLOCK_BITMAP_LEN)
            .ok_or_else(|| PgfsError::Corruption {
                block: 0,
                detail: "metadata region too short for block bitmap".into(),
            })?;
        let mut bitmap = [0_u8; BLOCK_BITMAP_LEN];
        bitmap.copy_from_slice(raw);
        let alloc = Self { bitmap };

        if alloc.is_formatted()
            && (0..METADATA_BLOCKS).any(|b| !bitmap_get(&alloc.bitmap, b))
        {
            return Err(PgfsError::Corruption {
                block: 0,
                detail: "metadata blocks not reserved in block bitmap".into(),
            });
        }
        Ok(alloc)
    }

    /// A zero-filled image has block 0 clear. Every formatted image has it set.
    #[must_use]
    pub fn is_formatted(&self) -> bool {
        bitmap_get(&self.bitmap, 0)
    }

    /// Reset to a fresh volume: only the metadata blocks are in use.
    pub fn format(&mut self) {
        self.bitmap = [0; BLOCK_BITMAP_LEN];
        for block in 0..METADATA_BLOCKS {
            bitmap_put(&mut self.bitmap, block, true);
        }
    }

    /// Allocate the lowest-numbered free block.
    pub fn alloc(&mut self) -> Result<BlockNumber> {
        let idx = bitmap_find_free(&self.bitmap, PAGE_COUNT).ok_or(PgfsError::NoSpace)?;
        bitmap_put(&mut self.bitmap, idx, true);
        trace!(block = idx, "alloc block");
        Ok(BlockNumber(idx))
    }

    /// Zero `block`'s contents and return it to the free pool.
    ///
    /// Freeing an already-free block is a no-op.
    pub fn free(&mut self, store: &mut BlockStore, block: BlockNumber) -> Result<()> {
        if block.0 < METADATA_BLOCKS || block.0 >= PAGE_COUNT {
            return Err(PgfsError::Corruption {
                block: u64::from(block.0),
                detail: "attempt to free a block outside the data region".into(),
            });
        }
        if !bitmap_get(&self.bitmap, block.0) {
            warn!(block = block.0, "double free of block ignored");
            return Ok(());
        }
        store.zero_block(block);
        bitmap_put(&mut self.bitmap, block.0, false);
        trace!(block = block.0, "free block");
        Ok(())
    }

    #[must_use]
    pub fn is_allocated(&self, block: BlockNumber) -> bool {
        block.0 < PAGE_COUNT && bitmap_get(&self.bitmap, block.0)
    }

    #[must_use]
    pub fn free_count(&self) -> u32 {
        bitmap_count_free(&self.bitmap, PAGE_COUNT)
    }

    #[must_use]
    pub fn used_count(&self) -> u32 {
        PAGE_COUNT - self.free_count()
    }

    /// Write the bitmap back into the metadata region.
    pub fn encode_into(&self, metadata: &mut [u8]) {
        metadata[BLOCK_BITMAP_OFFSET..BLOCK_BITMAP_OFFSET + BLOCK_BITMAP_LEN]
            .copy_from_slice(&self.bitmap);
    }
}
