//! Directory and extended-attribute hash btree blocks.
//!
//! These trees are addressed by fork-relative logical block and ordered by
//! a 32-bit name hash. Every block opens with a common info header:
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | forward sibling (u32) |
//! | 4 | back sibling (u32) |
//! | 8 | magic (u16) |
//! | 12 | crc32c |
//! | 16 | self block number (u64) |
//! | 24 | owning inode (u64) |
//!
//! followed by `count` (u16) at 32, `level` or `stale` (u16) at 34 and
//! 8-byte entries from 40.

use crate::stamp_crc;
use fscrub_types::{
    DaBlock, ParseError, read_be_u8, read_be_u16, read_be_u32, read_be_u64, write_be_u16,
    write_be_u32, write_be_u64, write_bytes,
};

/// Deepest node level a hash btree may have.
pub const DA_NODE_MAXDEPTH: usize = 5;

pub const DA3_NODE_MAGIC: u16 = 0x3ebe;
pub const ATTR3_LEAF_MAGIC: u16 = 0x3bee;
pub const DIR3_LEAF1_MAGIC: u16 = 0x3df1;
pub const DIR3_LEAFN_MAGIC: u16 = 0x3dff;

pub const DA_CRC_OFFSET: usize = 12;
const ENTRIES_OFFSET: usize = 40;
const ENTRY_LEN: usize = 8;

/// First logical block of the directory leaf segment.
#[must_use]
pub fn dir_leaf_dablk(block_size: u32) -> DaBlock {
    DaBlock(u32::try_from((1_u64 << 35) / u64::from(block_size.max(1))).unwrap_or(u32::MAX))
}

/// First logical block of the directory free-index segment.
#[must_use]
pub fn dir_free_dablk(block_size: u32) -> DaBlock {
    DaBlock(u32::try_from((1_u64 << 36) / u64::from(block_size.max(1))).unwrap_or(u32::MAX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaBlockInfo {
    pub forw: u32,
    pub back: u32,
    pub magic: u16,
    pub crc: u32,
    pub blkno: u64,
    pub owner: u64,
}

/// One hash-ordered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaEntry {
    /// Interior entry: names hashing at most `hashval` live under `before`.
    Node { hashval: u32, before: u32 },
    AttrLeaf { hashval: u32, nameidx: u16, flags: u8 },
    /// Directory leaf entry pointing at a data block address.
    DirLeaf { hashval: u32, address: u32 },
}

impl DaEntry {
    #[must_use]
    pub fn hashval(&self) -> u32 {
        match *self {
            Self::Node { hashval, .. }
            | Self::AttrLeaf { hashval, .. }
            | Self::DirLeaf { hashval, .. } => hashval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaBody {
    Node { level: u16, entries: Vec<DaEntry> },
    AttrLeaf { entries: Vec<DaEntry> },
    DirLeafN { stale: u16, entries: Vec<DaEntry> },
    /// Single-block directory leaf with its best-free table in the tail.
    DirLeaf1 {
        stale: u16,
        entries: Vec<DaEntry>,
        bests: Vec<u16>,
    },
    /// Magic not recognised; entries are not interpreted.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaTreeBlock {
    pub info: DaBlockInfo,
    pub body: DaBody,
}

fn entry_capacity(block_len: usize, tail: usize) -> usize {
    block_len.saturating_sub(ENTRIES_OFFSET + tail) / ENTRY_LEN
}

fn leaf1_tail_len(bestcount: usize) -> usize {
    4 + bestcount * 2
}

impl DaTreeBlock {
    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        let info = DaBlockInfo {
            forw: read_be_u32(bytes, 0)?,
            back: read_be_u32(bytes, 4)?,
            magic: read_be_u16(bytes, 8)?,
            crc: read_be_u32(bytes, DA_CRC_OFFSET)?,
            blkno: read_be_u64(bytes, 16)?,
            owner: read_be_u64(bytes, 24)?,
        };
        let count = usize::from(read_be_u16(bytes, 32)?);
        let second = read_be_u16(bytes, 34)?;

        let body = match info.magic {
            DA3_NODE_MAGIC => DaBody::Node {
                level: second,
                entries: decode_entries(bytes, count, 0, |b, at| {
                    Ok(DaEntry::Node {
                        hashval: read_be_u32(b, at)?,
                        before: read_be_u32(b, at + 4)?,
                    })
                })?,
            },
            ATTR3_LEAF_MAGIC => DaBody::AttrLeaf {
                entries: decode_entries(bytes, count, 0, |b, at| {
                    Ok(DaEntry::AttrLeaf {
                        hashval: read_be_u32(b, at)?,
                        nameidx: read_be_u16(b, at + 4)?,
                        flags: read_be_u8(b, at + 6)?,
                    })
                })?,
            },
            DIR3_LEAFN_MAGIC => DaBody::DirLeafN {
                stale: second,
                entries: decode_entries(bytes, count, 0, decode_dir_entry)?,
            },
            DIR3_LEAF1_MAGIC => {
                let end = bytes.len();
                let bestcount = usize::try_from(read_be_u32(bytes, end.saturating_sub(4))?)
                    .map_err(|_| ParseError::IntegerConversion { field: "bestcount" })?;
                let tail = leaf1_tail_len(bestcount);
                if tail > end.saturating_sub(ENTRIES_OFFSET) {
                    return Err(ParseError::InvalidField {
                        field: "bestcount",
                        reason: "tail overruns block",
                    });
                }
                let bests_at = end - tail;
                let mut bests = Vec::with_capacity(bestcount);
                for i in 0..bestcount {
                    bests.push(read_be_u16(bytes, bests_at + i * 2)?);
                }
                DaBody::DirLeaf1 {
                    stale: second,
                    entries: decode_entries(bytes, count, tail, decode_dir_entry)?,
                    bests,
                }
            }
            _ => DaBody::Unknown,
        };
        Ok(Self { info, body })
    }

    /// Encode into a block of `block_size` bytes with a fresh checksum.
    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        let mut out = vec![0_u8; block_size];
        write_be_u32(&mut out, 0, self.info.forw)?;
        write_be_u32(&mut out, 4, self.info.back)?;
        write_be_u16(&mut out, 8, self.info.magic)?;
        write_be_u64(&mut out, 16, self.info.blkno)?;
        write_be_u64(&mut out, 24, self.info.owner)?;

        let (second, tail) = match &self.body {
            DaBody::Node { level, .. } => (*level, 0),
            DaBody::DirLeafN { stale, .. } => (*stale, 0),
            DaBody::DirLeaf1 { stale, bests, .. } => {
                let tail = leaf1_tail_len(bests.len());
                let bests_at = block_size.saturating_sub(tail);
                for (i, best) in bests.iter().enumerate() {
                    write_be_u16(&mut out, bests_at + i * 2, *best)?;
                }
                let bestcount = u32::try_from(bests.len())
                    .map_err(|_| ParseError::IntegerConversion { field: "bestcount" })?;
                write_be_u32(&mut out, block_size.saturating_sub(4), bestcount)?;
                (*stale, tail)
            }
            DaBody::AttrLeaf { .. } | DaBody::Unknown => (0, 0),
        };
        let entries = self.entries();
        if entries.len() > entry_capacity(block_size, tail) {
            return Err(ParseError::InvalidField {
                field: "count",
                reason: "exceeds block capacity",
            });
        }
        let count = u16::try_from(entries.len())
            .map_err(|_| ParseError::IntegerConversion { field: "count" })?;
        write_be_u16(&mut out, 32, count)?;
        write_be_u16(&mut out, 34, second)?;

        for (i, entry) in entries.iter().enumerate() {
            let at = ENTRIES_OFFSET + i * ENTRY_LEN;
            write_be_u32(&mut out, at, entry.hashval())?;
            match *entry {
                DaEntry::Node { before, .. } => write_be_u32(&mut out, at + 4, before)?,
                DaEntry::AttrLeaf { nameidx, flags, .. } => {
                    write_be_u16(&mut out, at + 4, nameidx)?;
                    write_bytes(&mut out, at + 6, &[flags])?;
                }
                DaEntry::DirLeaf { address, .. } => write_be_u32(&mut out, at + 4, address)?,
            }
        }
        stamp_crc(&mut out, DA_CRC_OFFSET)?;
        Ok(out)
    }

    #[must_use]
    pub fn entries(&self) -> &[DaEntry] {
        match &self.body {
            DaBody::Node { entries, .. }
            | DaBody::AttrLeaf { entries }
            | DaBody::DirLeafN { entries, .. }
            | DaBody::DirLeaf1 { entries, .. } => entries,
            DaBody::Unknown => &[],
        }
    }

    /// Hash of the last entry; what a parent entry should record.
    #[must_use]
    pub fn last_hash(&self) -> Option<u32> {
        self.entries().last().map(DaEntry::hashval)
    }

    /// Most entries the block could hold given its tail.
    #[must_use]
    pub fn max_entries(&self, block_size: usize) -> usize {
        let tail = match &self.body {
            DaBody::DirLeaf1 { bests, .. } => leaf1_tail_len(bests.len()),
            _ => 0,
        };
        entry_capacity(block_size, tail)
    }
}

fn decode_dir_entry(bytes: &[u8], at: usize) -> Result<DaEntry, ParseError> {
    Ok(DaEntry::DirLeaf {
        hashval: read_be_u32(bytes, at)?,
        address: read_be_u32(bytes, at + 4)?,
    })
}

fn decode_entries(
    bytes: &[u8],
    count: usize,
    tail: usize,
    decode: impl Fn(&[u8], usize) -> Result<DaEntry, ParseError>,
) -> Result<Vec<DaEntry>, ParseError> {
    if count > entry_capacity(bytes.len(), tail) {
        return Err(ParseError::InvalidField {
            field: "count",
            reason: "exceeds block capacity",
        });
    }
    (0..count)
        .map(|i| decode(bytes, ENTRIES_OFFSET + i * ENTRY_LEN))
        .collect()
}
