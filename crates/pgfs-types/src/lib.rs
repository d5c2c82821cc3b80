#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Volume geometry ─────────────────────────────────────────────────────────

/// Size of one block in bytes.
pub const PAGE_SIZE: usize = 4096;
/// `PAGE_SIZE` as a `u64`, for byte-offset arithmetic.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;
/// Number of blocks in the backing region.
pub const PAGE_COUNT: u32 = 256;
/// Exact length of the backing file.
pub const IMAGE_SIZE: u64 = PAGE_COUNT as u64 * PAGE_SIZE_U64;

/// Blocks `0..METADATA_BLOCKS` hold the bitmaps and the inode table.
pub const METADATA_BLOCKS: u32 = 4;

/// Number of inode slots.
pub const MAX_INODES: u32 = 256;

/// Direct block pointers per inode.
pub const DIRECT_PTRS: usize = 2;
/// Block numbers held by one indirect block.
pub const PTRS_PER_INDIRECT: usize = PAGE_SIZE / 4;
/// Largest number of data blocks a single file can map.
pub const MAX_FILE_BLOCKS: u64 = (DIRECT_PTRS + PTRS_PER_INDIRECT) as u64;
/// Largest file size in bytes.
pub const MAX_FILE_SIZE: u64 = MAX_FILE_BLOCKS * PAGE_SIZE_U64;

/// Directory slots per directory block.
pub const DIR_ENTRIES: usize = 64;
/// Bytes reserved for a name inside a directory slot.
pub const DIR_NAME_LEN: usize = 48;

/// Number of blocks needed to hold `size` bytes.
#[must_use]
pub fn bytes_to_blocks(size: u64) -> u64 {
    size.div_ceil(PAGE_SIZE_U64)
}

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Index of a block inside the backing region.
///
/// Block 0 is the head of the metadata region and is never a data block, so
/// the on-disk pointer value 0 doubles as "no block".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockNumber(pub u32);

impl BlockNumber {
    /// Pointer value meaning "unmapped".
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Byte offset of this block inside the backing file.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * PAGE_SIZE_U64
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of an inode slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

impl InodeNumber {
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u32 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u32 = 0o010_000;
/// Character device.
pub const S_IFCHR: u32 = 0o020_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Block device.
pub const S_IFBLK: u32 = 0o060_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u32 = 0o140_000;
/// Permission bits, including setuid/setgid/sticky.
pub const S_IPERM: u32 = 0o7777;

#[must_use]
pub fn mode_is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

#[must_use]
pub fn mode_is_reg(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

// ── Parsing helpers ─────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    let bytes = read_fixed::<8>(data, offset)?;
    Ok(i64::from_le_bytes(bytes))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Write `value` little endian at `offset`. Panics if `buf` is too short.
#[inline]
pub fn write_le_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Write `value` little endian at `offset`. Panics if `buf` is too short.
#[inline]
pub fn write_le_i64(buf: &mut [u8], offset: usize, value: i64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// The bytes of `buf` up to (not including) the first NUL.
#[must_use]
pub fn trim_nul_padded(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}
