//! 64-byte directory slots.
//!
//! A directory block is an array of `DIR_ENTRIES` slots. Each slot carries an
//! explicit state byte, so a never-used slot, a live entry, and a deleted
//! entry are distinguishable without relying on an empty name.

use pgfs_types::{
    DIR_NAME_LEN, InodeNumber, ParseError, ensure_slice, read_le_u32, trim_nul_padded,
    write_le_u32,
};

pub const DIR_SLOT_SIZE: usize = 64;

const OFF_NAME: usize = 0;
const OFF_INUM: usize = DIR_NAME_LEN;
const OFF_STATE: usize = DIR_NAME_LEN + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Unused = 0,
    Live = 1,
    Deleted = 2,
}

impl SlotState {
    fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Unused),
            1 => Ok(Self::Live),
            2 => Ok(Self::Deleted),
            _ => Err(ParseError::InvalidField {
                field: "slot_state",
                reason: "unknown state tag",
            }),
        }
    }
}

/// Decoded directory slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSlot {
    pub state: SlotState,
    pub inum: InodeNumber,
    pub name: Vec<u8>,
}

impl DirSlot {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(bytes, 0, DIR_SLOT_SIZE)?;
        let state = SlotState::from_raw(raw[OFF_STATE])?;
        let name = trim_nul_padded(&raw[OFF_NAME..OFF_NAME + DIR_NAME_LEN]).to_vec();
        if state == SlotState::Live && name.is_empty() {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "live slot with empty name",
            });
        }
        Ok(Self {
            state,
            inum: InodeNumber(read_le_u32(raw, OFF_INUM)?),
            name,
        })
    }

    /// Cheap state probe that skips decoding the name.
    pub fn peek_state(bytes: &[u8]) -> Result<SlotState, ParseError> {
        let raw = ensure_slice(bytes, 0, DIR_SLOT_SIZE)?;
        SlotState::from_raw(raw[OFF_STATE])
    }

    /// Name bytes of a slot without copying.
    pub fn peek_name(bytes: &[u8]) -> Result<&[u8], ParseError> {
        let raw = ensure_slice(bytes, OFF_NAME, DIR_NAME_LEN)?;
        Ok(trim_nul_padded(raw))
    }

    /// Overwrite `out` with a live entry. `name` must already be validated
    /// (1 to `DIR_NAME_LEN` bytes, no NUL).
    pub fn write_live(out: &mut [u8], name: &[u8], inum: InodeNumber) {
        assert!(
            !name.is_empty() && name.len() <= DIR_NAME_LEN,
            "directory name length {} out of range",
            name.len()
        );
        out[..DIR_SLOT_SIZE].fill(0);
        out[OFF_NAME..OFF_NAME + name.len()].copy_from_slice(name);
        write_le_u32(out, OFF_INUM, inum.0);
        out[OFF_STATE] = SlotState::Live as u8;
    }

    /// Overwrite `out` with a deleted tombstone (name and inode cleared).
    pub fn write_deleted(out: &mut [u8]) {
        out[..DIR_SLOT_SIZE].fill(0);
        out[OFF_STATE] = SlotState::Deleted as u8;
    }
}
