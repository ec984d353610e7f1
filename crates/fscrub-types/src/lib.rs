#![forbid(unsafe_code)]
//! Shared newtypes, filesystem geometry, and big-endian byte helpers.
//!
//! Every on-disk structure scrubbed by FrankenScrub is big-endian. Address
//! arithmetic is carried out in three unit-carrying spaces:
//!
//! | Type | Space |
//! |------|-------|
//! | [`BlockNumber`] | linear filesystem block (`agno * agblocks + agbno`) |
//! | [`AgBlock`] | block offset inside one allocation group |
//! | [`DaBlock`] | fork-relative logical block of a dir/attr btree |

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Linear filesystem block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Allocation group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgNumber(pub u32);

/// Block offset relative to the start of an allocation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgBlock(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Logical block inside a directory or attribute fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DaBlock(pub u32);

impl BlockNumber {
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl AgBlock {
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AgNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AgBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DaBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Smallest block size accepted by the format.
pub const MIN_BLOCK_SIZE: u32 = 512;
/// Largest block size accepted by the format.
pub const MAX_BLOCK_SIZE: u32 = 65_536;
/// Every AG needs room for its four header blocks plus at least one btree root.
pub const MIN_AG_BLOCKS: u32 = 16;

/// Filesystem geometry derived from the primary superblock.
///
/// All AGs hold `agblocks` blocks except the last, which holds whatever is
/// left of `dblocks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    pub block_size: u32,
    pub agblocks: u32,
    pub agcount: u32,
    pub dblocks: u64,
    pub inodes_per_block: u32,
}

impl FsGeometry {
    pub fn new(
        block_size: u32,
        agblocks: u32,
        agcount: u32,
        dblocks: u64,
        inodes_per_block: u32,
    ) -> Result<Self, ParseError> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        if agblocks < MIN_AG_BLOCKS {
            return Err(ParseError::InvalidField {
                field: "agblocks",
                reason: "allocation group too small",
            });
        }
        if agcount == 0 {
            return Err(ParseError::InvalidField {
                field: "agcount",
                reason: "must be non-zero",
            });
        }
        if inodes_per_block == 0 {
            return Err(ParseError::InvalidField {
                field: "inodes_per_block",
                reason: "must be non-zero",
            });
        }
        let full = u64::from(agcount - 1) * u64::from(agblocks);
        let max = u64::from(agcount) * u64::from(agblocks);
        if dblocks <= full || dblocks > max {
            return Err(ParseError::InvalidField {
                field: "dblocks",
                reason: "inconsistent with agcount * agblocks",
            });
        }
        if dblocks - full < u64::from(MIN_AG_BLOCKS) {
            return Err(ParseError::InvalidField {
                field: "dblocks",
                reason: "last allocation group too small",
            });
        }
        Ok(Self {
            block_size,
            agblocks,
            agcount,
            dblocks,
            inodes_per_block,
        })
    }

    #[must_use]
    pub fn agb_to_fsb(&self, agno: AgNumber, agbno: AgBlock) -> BlockNumber {
        BlockNumber(u64::from(agno.0) * u64::from(self.agblocks) + u64::from(agbno.0))
    }

    #[must_use]
    pub fn fsb_to_agno(&self, fsb: BlockNumber) -> AgNumber {
        let agno = fsb.0.checked_div(u64::from(self.agblocks)).unwrap_or(0);
        AgNumber(u32::try_from(agno).unwrap_or(u32::MAX))
    }

    #[must_use]
    pub fn fsb_to_agbno(&self, fsb: BlockNumber) -> AgBlock {
        let agbno = fsb.0.checked_rem(u64::from(self.agblocks)).unwrap_or(0);
        AgBlock(u32::try_from(agbno).unwrap_or(u32::MAX))
    }

    /// Number of blocks in `agno`, or 0 for a group past the end.
    #[must_use]
    pub fn ag_block_count(&self, agno: AgNumber) -> u32 {
        if agno.0 >= self.agcount {
            return 0;
        }
        if agno.0 + 1 < self.agcount {
            return self.agblocks;
        }
        let start = u64::from(agno.0) * u64::from(self.agblocks);
        u32::try_from(self.dblocks.saturating_sub(start)).unwrap_or(self.agblocks)
    }

    #[must_use]
    pub fn verify_agno(&self, agno: AgNumber) -> bool {
        agno.0 < self.agcount
    }

    #[must_use]
    pub fn verify_agbno(&self, agno: AgNumber, agbno: AgBlock) -> bool {
        agbno.0 < self.ag_block_count(agno)
    }

    #[must_use]
    pub fn verify_fsbno(&self, fsb: BlockNumber) -> bool {
        fsb.0 < self.dblocks && self.verify_agbno(self.fsb_to_agno(fsb), self.fsb_to_agbno(fsb))
    }

    /// Inodes addressable in one AG.
    #[must_use]
    pub fn inodes_per_ag(&self) -> u64 {
        u64::from(self.agblocks) * u64::from(self.inodes_per_block)
    }

    #[must_use]
    pub fn ino_to_agno(&self, ino: InodeNumber) -> AgNumber {
        let agno = ino.0.checked_div(self.inodes_per_ag()).unwrap_or(0);
        AgNumber(u32::try_from(agno).unwrap_or(u32::MAX))
    }

    /// Block inside its AG that holds AG-relative inode `agino`.
    #[must_use]
    pub fn agino_to_agbno(&self, agino: u32) -> AgBlock {
        AgBlock(agino.checked_div(self.inodes_per_block).unwrap_or(0))
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Byte helpers ────────────────────────────────────────────────────────────

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
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
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

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_be_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_be_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_be_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_be_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, value: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, value.len())?.copy_from_slice(value);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

// ── Flag formatting ─────────────────────────────────────────────────────────

/// Names of all bits of `bits` present in `known`.
#[must_use]
pub fn describe_flags(bits: u32, known: &[(u32, &'static str)]) -> Vec<&'static str> {
    known
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Format a bitmask as a pipe-separated list of flag names.
///
/// Example output: `CORRUPT|PREEN` or `(none)` when zero. Unknown bits are
/// appended as hex.
pub fn format_flags(
    f: &mut fmt::Formatter<'_>,
    bits: u32,
    known: &[(u32, &'static str)],
) -> fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut first = true;
    let mut remaining = bits;
    for &(bit, name) in known {
        if remaining & bit != 0 {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            remaining &= !bit;
            first = false;
        }
    }
    if remaining != 0 {
        if !first {
            f.write_str("|")?;
        }
        write!(f, "0x{remaining:X}")?;
    }
    Ok(())
}
