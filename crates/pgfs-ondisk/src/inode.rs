//! 48-byte inode records.

use pgfs_types::{
    BlockNumber, DIRECT_PTRS, MAX_FILE_SIZE, ParseError, bytes_to_blocks, ensure_slice,
    mode_is_dir, read_le_i64, read_le_u32, write_le_i64, write_le_u32,
};
use serde::{Deserialize, Serialize};

use crate::is_data_block;

pub const INODE_RECORD_SIZE: usize = 48;

const OFF_MODE: usize = 0x00;
const OFF_REFS: usize = 0x04;
const OFF_SIZE: usize = 0x08;
const OFF_PTRS: usize = 0x0C;
const OFF_IPTR: usize = 0x14;
const OFF_ATIME: usize = 0x18;
const OFF_MTIME: usize = 0x20;
const OFF_CTIME: usize = 0x28;

/// Decoded inode record.
///
/// A record whose slot is clear in the inode bitmap is all zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub mode: u32,
    /// Hard link count.
    pub refs: u32,
    pub size: u32,
    /// Direct pointers for logical blocks 0 and 1.
    pub ptrs: [BlockNumber; DIRECT_PTRS],
    /// Indirect block holding logical blocks 2 and up.
    pub iptr: BlockNumber,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl InodeRecord {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        mode_is_dir(self.mode)
    }

    /// Data blocks this inode maps: `ceil(size / PAGE_SIZE)`.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        bytes_to_blocks(u64::from(self.size))
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INODE_RECORD_SIZE)?;

        let size = read_le_u32(bytes, OFF_SIZE)?;
        if u64::from(size) > MAX_FILE_SIZE {
            return Err(ParseError::InvalidField {
                field: "size",
                reason: "exceeds maximum file size",
            });
        }

        let ptrs = [
            parse_pointer(bytes, OFF_PTRS, "ptrs[0]")?,
            parse_pointer(bytes, OFF_PTRS + 4, "ptrs[1]")?,
        ];
        let iptr = parse_pointer(bytes, OFF_IPTR, "iptr")?;

        Ok(Self {
            mode: read_le_u32(bytes, OFF_MODE)?,
            refs: read_le_u32(bytes, OFF_REFS)?,
            size,
            ptrs,
            iptr,
            atime: read_le_i64(bytes, OFF_ATIME)?,
            mtime: read_le_i64(bytes, OFF_MTIME)?,
            ctime: read_le_i64(bytes, OFF_CTIME)?,
        })
    }

    /// Encode into the first `INODE_RECORD_SIZE` bytes of `out`.
    pub fn write_to_bytes(&self, out: &mut [u8]) {
        write_le_u32(out, OFF_MODE, self.mode);
        write_le_u32(out, OFF_REFS, self.refs);
        write_le_u32(out, OFF_SIZE, self.size);
        write_le_u32(out, OFF_PTRS, self.ptrs[0].0);
        write_le_u32(out, OFF_PTRS + 4, self.ptrs[1].0);
        write_le_u32(out, OFF_IPTR, self.iptr.0);
        write_le_i64(out, OFF_ATIME, self.atime);
        write_le_i64(out, OFF_MTIME, self.mtime);
        write_le_i64(out, OFF_CTIME, self.ctime);
    }
}

fn parse_pointer(
    bytes: &[u8],
    offset: usize,
    field: &'static str,
) -> Result<BlockNumber, ParseError> {
    let block = BlockNumber(read_le_u32(bytes, offset)?);
    if !block.is_none() && !is_data_block(block) {
        return Err(ParseError::InvalidField {
            field,
            reason: "points outside the data region",
        });
    }
    Ok(block)
}
