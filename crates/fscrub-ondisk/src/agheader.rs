//! Allocation group headers: free-space header (AGF), inode header (AGI)
//! and the free list (AGFL).

use crate::stamp_crc;
use fscrub_types::{ParseError, read_be_u32, read_fixed, write_be_u32, write_bytes};
use serde::{Deserialize, Serialize};

pub const AGF_MAGIC: u32 = 0x5841_4746;
pub const AGI_MAGIC: u32 = 0x5841_4749;
pub const AGFL_MAGIC: u32 = 0x5841_464C;

pub const AGF_VERSION: u32 = 1;
pub const AGI_VERSION: u32 = 1;

pub const AGF_CRC_OFFSET: usize = 88;
pub const AGI_CRC_OFFSET: usize = 64;
pub const AGFL_CRC_OFFSET: usize = 24;
const AGFL_HEADER_LEN: usize = 28;

/// Sentinel for an empty AGFL slot.
pub const NULL_AGBNO: u32 = u32::MAX;

fn check_magic(block: &[u8], expected: u32) -> Result<(), ParseError> {
    let magic = read_be_u32(block, 0)?;
    if magic != expected {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(expected),
            actual: u64::from(magic),
        });
    }
    Ok(())
}

// ── AGF ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agf {
    pub versionnum: u32,
    pub seqno: u32,
    /// Blocks in this AG.
    pub length: u32,
    pub bno_root: u32,
    pub cnt_root: u32,
    pub rmap_root: u32,
    pub bno_level: u32,
    pub cnt_level: u32,
    pub rmap_level: u32,
    pub flfirst: u32,
    pub fllast: u32,
    pub flcount: u32,
    pub freeblks: u32,
    pub longest: u32,
    pub btreeblks: u32,
    pub uuid: [u8; 16],
    pub refcount_root: u32,
    pub refcount_level: u32,
    pub crc: u32,
}

impl Agf {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        check_magic(block, AGF_MAGIC)?;
        Ok(Self {
            versionnum: read_be_u32(block, 4)?,
            seqno: read_be_u32(block, 8)?,
            length: read_be_u32(block, 12)?,
            bno_root: read_be_u32(block, 16)?,
            cnt_root: read_be_u32(block, 20)?,
            rmap_root: read_be_u32(block, 24)?,
            bno_level: read_be_u32(block, 28)?,
            cnt_level: read_be_u32(block, 32)?,
            rmap_level: read_be_u32(block, 36)?,
            flfirst: read_be_u32(block, 40)?,
            fllast: read_be_u32(block, 44)?,
            flcount: read_be_u32(block, 48)?,
            freeblks: read_be_u32(block, 52)?,
            longest: read_be_u32(block, 56)?,
            btreeblks: read_be_u32(block, 60)?,
            uuid: read_fixed::<16>(block, 64)?,
            refcount_root: read_be_u32(block, 80)?,
            refcount_level: read_be_u32(block, 84)?,
            crc: read_be_u32(block, AGF_CRC_OFFSET)?,
        })
    }

    pub fn to_block(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        let mut block = vec![0_u8; block_size];
        write_be_u32(&mut block, 0, AGF_MAGIC)?;
        for (offset, value) in [
            (4, self.versionnum),
            (8, self.seqno),
            (12, self.length),
            (16, self.bno_root),
            (20, self.cnt_root),
            (24, self.rmap_root),
            (28, self.bno_level),
            (32, self.cnt_level),
            (36, self.rmap_level),
            (40, self.flfirst),
            (44, self.fllast),
            (48, self.flcount),
            (52, self.freeblks),
            (56, self.longest),
            (60, self.btreeblks),
            (80, self.refcount_root),
            (84, self.refcount_level),
        ] {
            write_be_u32(&mut block, offset, value)?;
        }
        write_bytes(&mut block, 64, &self.uuid)?;
        stamp_crc(&mut block, AGF_CRC_OFFSET)?;
        Ok(block)
    }
}

// ── AGI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agi {
    pub versionnum: u32,
    pub seqno: u32,
    pub length: u32,
    /// Allocated inodes.
    pub count: u32,
    pub root: u32,
    pub level: u32,
    pub freecount: u32,
    pub newino: u32,
    pub dirino: u32,
    pub uuid: [u8; 16],
    pub free_root: u32,
    pub free_level: u32,
    pub crc: u32,
}

impl Agi {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        check_magic(block, AGI_MAGIC)?;
        Ok(Self {
            versionnum: read_be_u32(block, 4)?,
            seqno: read_be_u32(block, 8)?,
            length: read_be_u32(block, 12)?,
            count: read_be_u32(block, 16)?,
            root: read_be_u32(block, 20)?,
            level: read_be_u32(block, 24)?,
            freecount: read_be_u32(block, 28)?,
            newino: read_be_u32(block, 32)?,
            dirino: read_be_u32(block, 36)?,
            uuid: read_fixed::<16>(block, 40)?,
            free_root: read_be_u32(block, 56)?,
            free_level: read_be_u32(block, 60)?,
            crc: read_be_u32(block, AGI_CRC_OFFSET)?,
        })
    }

    pub fn to_block(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        let mut block = vec![0_u8; block_size];
        write_be_u32(&mut block, 0, AGI_MAGIC)?;
        for (offset, value) in [
            (4, self.versionnum),
            (8, self.seqno),
            (12, self.length),
            (16, self.count),
            (20, self.root),
            (24, self.level),
            (28, self.freecount),
            (32, self.newino),
            (36, self.dirino),
            (56, self.free_root),
            (60, self.free_level),
        ] {
            write_be_u32(&mut block, offset, value)?;
        }
        write_bytes(&mut block, 40, &self.uuid)?;
        stamp_crc(&mut block, AGI_CRC_OFFSET)?;
        Ok(block)
    }
}

// ── AGFL ────────────────────────────────────────────────────────────────────

/// Circular list of blocks reserved for btree growth.
///
/// Only the slots between the AGF's `flfirst` and `fllast` (inclusive,
/// possibly wrapping) are live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agfl {
    pub seqno: u32,
    pub uuid: [u8; 16],
    pub bno: Vec<u32>,
    pub crc: u32,
}

impl Agfl {
    /// Number of slots in an AGFL block.
    #[must_use]
    pub fn capacity(block_size: usize) -> usize {
        block_size.saturating_sub(AGFL_HEADER_LEN) / 4
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        check_magic(block, AGFL_MAGIC)?;
        let slots = Self::capacity(block.len());
        let mut bno = Vec::with_capacity(slots);
        for slot in 0..slots {
            bno.push(read_be_u32(block, AGFL_HEADER_LEN + slot * 4)?);
        }
        Ok(Self {
            seqno: read_be_u32(block, 4)?,
            uuid: read_fixed::<16>(block, 8)?,
            bno,
            crc: read_be_u32(block, AGFL_CRC_OFFSET)?,
        })
    }

    /// Encode; slots beyond `bno.len()` are filled with [`NULL_AGBNO`].
    pub fn to_block(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        let slots = Self::capacity(block_size);
        if self.bno.len() > slots {
            return Err(ParseError::InvalidField {
                field: "agfl_bno",
                reason: "more entries than slots",
            });
        }
        let mut block = vec![0_u8; block_size];
        write_be_u32(&mut block, 0, AGFL_MAGIC)?;
        write_be_u32(&mut block, 4, self.seqno)?;
        write_bytes(&mut block, 8, &self.uuid)?;
        for slot in 0..slots {
            let value = self.bno.get(slot).copied().unwrap_or(NULL_AGBNO);
            write_be_u32(&mut block, AGFL_HEADER_LEN + slot * 4, value)?;
        }
        stamp_crc(&mut block, AGFL_CRC_OFFSET)?;
        Ok(block)
    }
}
