#![forbid(unsafe_code)]
//! Directory operations.
//!
//! A directory owns exactly one data block holding `DIR_ENTRIES` fixed
//! 64-byte slots. Lookups are a linear scan. Insertion takes the first slot
//! that is not live, so deleted slots are reused before never-used ones.
//! Live names within a block are unique.

use pgfs_error::{PgfsError, Result};
use pgfs_ondisk::{DIR_SLOT_SIZE, DirSlot, SlotState};
use pgfs_types::{DIR_ENTRIES, DIR_NAME_LEN, InodeNumber, PAGE_SIZE};

/// A live entry as seen by `entries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryRecord {
    /// Slot index inside the directory block.
    pub slot: usize,
    pub inum: InodeNumber,
    pub name: Vec<u8>,
}

/// Reject names that cannot be stored in a slot or that would break path
/// resolution.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(PgfsError::InvalidArgument(
            "directory entry name cannot be empty".to_owned(),
        ));
    }
    if name == b"." || name == b".." {
        return Err(PgfsError::InvalidArgument(
            "`.` and `..` are reserved names".to_owned(),
        ));
    }
    if name.iter().any(|&b| b == b'/' || b == 0) {
        return Err(PgfsError::InvalidArgument(
            "directory entry name contains `/` or NUL".to_owned(),
        ));
    }
    if name.len() > DIR_NAME_LEN {
        return Err(PgfsError::NameTooLong);
    }
    Ok(())
}

fn slot(block: &[u8], idx: usize) -> &[u8] {
    &block[idx * DIR_SLOT_SIZE..(idx + 1) * DIR_SLOT_SIZE]
}

fn slot_mut(block: &mut [u8], idx: usize) -> &mut [u8] {
    &mut block[idx * DIR_SLOT_SIZE..(idx + 1) * DIR_SLOT_SIZE]
}

fn check_block(block: &[u8]) -> Result<()> {
    if block.len() < PAGE_SIZE {
        return Err(PgfsError::Corruption {
            block: 0,
            detail: format!("directory block is {} bytes", block.len()),
        });
    }
    Ok(())
}

fn state_at(block: &[u8], idx: usize) -> Result<SlotState> {
    DirSlot::peek_state(slot(block, idx)).map_err(|err| PgfsError::Corruption {
        block: 0,
        detail: format!("directory slot {idx}: {err}"),
    })
}

/// Index of the first live slot named `name`.
fn find(block: &[u8], name: &[u8]) -> Result<Option<usize>> {
    check_block(block)?;
    for idx in 0..DIR_ENTRIES {
        if state_at(block, idx)? != SlotState::Live {
            continue;
        }
        let stored = DirSlot::peek_name(slot(block, idx)).map_err(|err| PgfsError::Corruption {
            block: 0,
            detail: format!("directory slot {idx}: {err}"),
        })?;
        if stored == name {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

fn decode(block: &[u8], idx: usize) -> Result<DirSlot> {
    DirSlot::parse_from_bytes(slot(block, idx)).map_err(|err| PgfsError::Corruption {
        block: 0,
        detail: format!("directory slot {idx}: {err}"),
    })
}

/// Inode named `name`, if a live entry exists.
pub fn lookup(block: &[u8], name: &[u8]) -> Result<Option<InodeNumber>> {
    match find(block, name)? {
        Some(idx) => Ok(Some(decode(block, idx)?.inum)),
        None => Ok(None),
    }
}

/// Insert `name -> inum` into the first non-live slot and return the slot
/// index. On failure the block is unchanged.
pub fn put(block: &mut [u8], name: &[u8], inum: InodeNumber) -> Result<usize> {
    validate_name(name)?;
    if find(block, name)?.is_some() {
        return Err(PgfsError::Exists);
    }
    for idx in 0..DIR_ENTRIES {
        if state_at(block, idx)? != SlotState::Live {
            DirSlot::write_live(slot_mut(block, idx), name, inum);
            return Ok(idx);
        }
    }
    Err(PgfsError::NoSpace)
}

/// Remove the live entry `name` and return the inode it referenced.
pub fn delete(block: &mut [u8], name: &[u8]) -> Result<Option<InodeNumber>> {
    let Some(idx) = find(block, name)? else {
        return Ok(None);
    };
    let inum = decode(block, idx)?.inum;
    DirSlot::write_deleted(slot_mut(block, idx));
    Ok(Some(inum))
}

/// Live entries in slot order.
pub fn entries(block: &[u8]) -> Result<Vec<DirEntryRecord>> {
    check_block(block)?;
    let mut out = Vec::new();
    for idx in 0..DIR_ENTRIES {
        let decoded = decode(block, idx)?;
        if decoded.state == SlotState::Live {
            out.push(DirEntryRecord {
                slot: idx,
                inum: decoded.inum,
                name: decoded.name,
            });
        }
    }
    Ok(out)
}

/// Number of live entries.
pub fn live_count(block: &[u8]) -> Result<usize> {
    check_block(block)?;
    let mut live = 0;
    for idx in 0..DIR_ENTRIES {
        if state_at(block, idx)? == SlotState::Live {
            live += 1;
        }
    }
    Ok(live)
}
