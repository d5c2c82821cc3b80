#![forbid(unsafe_code)]
//! On-disk format of a PageFS volume.
//!
//! Pure encoding crate: no I/O, no side effects. Decodes byte slices into
//! typed records and encodes them back.
//!
//! ```text
//! block 0..METADATA_BLOCKS
//!   +0     block bitmap   (PAGE_COUNT / 8 bytes, MSB first)
//!   +32    inode bitmap   (MAX_INODES / 8 bytes, MSB first)
//!   +64    inode table    (MAX_INODES records of INODE_RECORD_SIZE bytes)
//! block METADATA_BLOCKS..PAGE_COUNT
//!   data, directory and indirect blocks
//! ```

pub mod dir;
pub mod inode;

use pgfs_types::{
    BlockNumber, InodeNumber, MAX_INODES, METADATA_BLOCKS, PAGE_COUNT, PAGE_SIZE,
    PTRS_PER_INDIRECT, ParseError, read_le_u32, write_le_u32,
};

pub use dir::{DIR_SLOT_SIZE, DirSlot, SlotState};
pub use inode::{INODE_RECORD_SIZE, InodeRecord};

pub const BLOCK_BITMAP_OFFSET: usize = 0;
pub const BLOCK_BITMAP_LEN: usize = PAGE_COUNT as usize / 8;
pub const INODE_BITMAP_OFFSET: usize = BLOCK_BITMAP_OFFSET + BLOCK_BITMAP_LEN;
pub const INODE_BITMAP_LEN: usize = MAX_INODES as usize / 8;
pub const INODE_TABLE_OFFSET: usize = 64;
/// Total bytes of the metadata region.
pub const METADATA_LEN: usize = METADATA_BLOCKS as usize * PAGE_SIZE;

const _: () = assert!(INODE_BITMAP_OFFSET + INODE_BITMAP_LEN <= INODE_TABLE_OFFSET);
const _: () =
    assert!(INODE_TABLE_OFFSET + MAX_INODES as usize * INODE_RECORD_SIZE <= METADATA_LEN);

/// Byte offset of inode `inum`'s record inside the metadata region.
#[must_use]
pub fn inode_record_offset(inum: InodeNumber) -> usize {
    INODE_TABLE_OFFSET + inum.index() * INODE_RECORD_SIZE
}

/// True when `block` may be referenced from an inode or indirect block.
#[must_use]
pub fn is_data_block(block: BlockNumber) -> bool {
    (METADATA_BLOCKS..PAGE_COUNT).contains(&block.0)
}

// ── Indirect blocks ─────────────────────────────────────────────────────────

/// Entry `index` of an indirect block. A zero entry means unmapped.
pub fn read_indirect_entry(block: &[u8], index: usize) -> Result<BlockNumber, ParseError> {
    if index >= PTRS_PER_INDIRECT {
        return Err(ParseError::InvalidField {
            field: "indirect_index",
            reason: "beyond indirect block",
        });
    }
    let raw = read_le_u32(block, index * 4)?;
    let entry = BlockNumber(raw);
    if !entry.is_none() && !is_data_block(entry) {
        return Err(ParseError::InvalidField {
            field: "indirect_entry",
            reason: "points outside the data region",
        });
    }
    Ok(entry)
}

/// Store `entry` at `index` of an indirect block. Panics on an out-of-range
/// index.
pub fn write_indirect_entry(block: &mut [u8], index: usize, entry: BlockNumber) {
    assert!(index < PTRS_PER_INDIRECT, "indirect index {index} out of range");
    write_le_u32(block, index * 4, entry.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets_match_original_format() {
        assert_eq!(BLOCK_BITMAP_LEN, 32);
        assert_eq!(INODE_BITMAP_OFFSET, 32);
        assert_eq!(INODE_TABLE_OFFSET, 64);
        assert_eq!(inode_record_offset(InodeNumber(0)), 64);
        assert_eq!(inode_record_offset(InodeNumber(2)), 64 + 2 * 48);
        let last_end = inode_record_offset(InodeNumber(MAX_INODES - 1)) + INODE_RECORD_SIZE;
        assert!(last_end <= METADATA_LEN);
    }

    #[test]
    fn data_block_range_excludes_metadata() {
        assert!(!is_data_block(BlockNumber(0)));
        assert!(!is_data_block(BlockNumber(METADATA_BLOCKS - 1)));
        assert!(is_data_block(BlockNumber(METADATA_BLOCKS)));
        assert!(is_data_block(BlockNumber(PAGE_COUNT - 1)));
        assert!(!is_data_block(BlockNumber(PAGE_COUNT)));
    }

    #[test]
    fn indirect_entries_round_trip() {
        let mut block = vec![0_u8; PAGE_SIZE];
        write_indirect_entry(&mut block, 0, BlockNumber(10));
        write_indirect_entry(&mut block, PTRS_PER_INDIRECT - 1, BlockNumber(255));
        assert_eq!(read_indirect_entry(&block, 0), Ok(BlockNumber(10)));
        assert_eq!(read_indirect_entry(&block, 1), Ok(BlockNumber::NONE));
        assert_eq!(
            read_indirect_entry(&block, PTRS_PER_INDIRECT - 1),
            Ok(BlockNumber(255))
        );
    }

    #[test]
    fn indirect_entry_rejects_metadata_pointer() {
        let mut block = vec![0_u8; PAGE_SIZE];
        write_le_u32(&mut block, 8, 1);
        assert!(matches!(
            read_indirect_entry(&block, 2),
            Err(ParseError::InvalidField {
                field: "indirect_entry",
                ..
            })
        ));
        assert!(read_indirect_entry(&block, PTRS_PER_INDIRECT).is_err());
    }
}
