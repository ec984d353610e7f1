//! Generic btree block codec.
//!
//! One layout serves every btree type; the per-type parts (record and key
//! encodings, pointer width, whether node entries carry a high key) come
//! from the [`RecordFormat`] parameter.
//!
//! Short-pointer header (AG-rooted trees, 32 bytes):
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | magic |
//! | 4 | level (u16) |
//! | 6 | numrecs (u16) |
//! | 8 | left sibling (u32) |
//! | 12 | right sibling (u32) |
//! | 16 | self block number (u64) |
//! | 24 | owner AG (u32) |
//! | 28 | crc32c |
//!
//! The long-pointer header (inode-rooted trees, 48 bytes) widens siblings
//! and owner to u64 and puts the checksum at 40.
//!
//! Node entries are packed as `key [high_key] ptr`.

use crate::records::RecordFormat;
use crate::stamp_crc;
use fscrub_types::{
    ParseError, ensure_slice, ensure_slice_mut, read_be_u16, read_be_u32, read_be_u64,
    write_be_u16, write_be_u32, write_be_u64,
};
use std::fmt;

/// Tallest btree the format allows.
pub const BTREE_MAX_LEVELS: usize = 9;

pub const SHORT_HEADER_LEN: usize = 32;
pub const LONG_HEADER_LEN: usize = 48;
const SHORT_CRC_OFFSET: usize = 28;
const LONG_CRC_OFFSET: usize = 40;

// ── Pointers ────────────────────────────────────────────────────────────────

/// Child or sibling pointer.
///
/// Short pointers are AG block numbers, long pointers are filesystem block
/// numbers. The all-ones value of either width is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BtreePtr {
    Short(u32),
    Long(u64),
}

impl BtreePtr {
    #[must_use]
    pub fn null(long: bool) -> Self {
        if long {
            Self::Long(u64::MAX)
        } else {
            Self::Short(u32::MAX)
        }
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        match self {
            Self::Short(v) => v == u32::MAX,
            Self::Long(v) => v == u64::MAX,
        }
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        match self {
            Self::Short(v) => u64::from(v),
            Self::Long(v) => v,
        }
    }

    fn len(long: bool) -> usize {
        if long { 8 } else { 4 }
    }

    fn decode(bytes: &[u8], offset: usize, long: bool) -> Result<Self, ParseError> {
        if long {
            read_be_u64(bytes, offset).map(Self::Long)
        } else {
            read_be_u32(bytes, offset).map(Self::Short)
        }
    }

    fn encode(self, out: &mut [u8], offset: usize, long: bool) -> Result<(), ParseError> {
        match (self, long) {
            (Self::Long(v), true) => write_be_u64(out, offset, v),
            (Self::Short(v), false) => write_be_u32(out, offset, v),
            _ => Err(ParseError::InvalidField {
                field: "ptr",
                reason: "pointer width does not match tree",
            }),
        }
    }
}

impl fmt::Display for BtreePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "{}", self.raw())
        }
    }
}

// ── Header ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtreeHeader {
    pub magic: u32,
    pub level: u16,
    pub numrecs: u16,
    pub leftsib: BtreePtr,
    pub rightsib: BtreePtr,
    /// Filesystem block this block claims to live at.
    pub blkno: u64,
    /// Owning AG (short) or inode (long).
    pub owner: u64,
    pub crc: u32,
}

#[must_use]
pub fn header_len(long: bool) -> usize {
    if long {
        LONG_HEADER_LEN
    } else {
        SHORT_HEADER_LEN
    }
}

#[must_use]
pub fn crc_offset(long: bool) -> usize {
    if long {
        LONG_CRC_OFFSET
    } else {
        SHORT_CRC_OFFSET
    }
}

impl BtreeHeader {
    pub fn parse(bytes: &[u8], long: bool) -> Result<Self, ParseError> {
        let magic = read_be_u32(bytes, 0)?;
        let level = read_be_u16(bytes, 4)?;
        let numrecs = read_be_u16(bytes, 6)?;
        if long {
            Ok(Self {
                magic,
                level,
                numrecs,
                leftsib: BtreePtr::decode(bytes, 8, true)?,
                rightsib: BtreePtr::decode(bytes, 16, true)?,
                blkno: read_be_u64(bytes, 24)?,
                owner: read_be_u64(bytes, 32)?,
                crc: read_be_u32(bytes, LONG_CRC_OFFSET)?,
            })
        } else {
            Ok(Self {
                magic,
                level,
                numrecs,
                leftsib: BtreePtr::decode(bytes, 8, false)?,
                rightsib: BtreePtr::decode(bytes, 12, false)?,
                blkno: read_be_u64(bytes, 16)?,
                owner: u64::from(read_be_u32(bytes, 24)?),
                crc: read_be_u32(bytes, SHORT_CRC_OFFSET)?,
            })
        }
    }

    fn write(&self, out: &mut [u8], long: bool) -> Result<(), ParseError> {
        write_be_u32(out, 0, self.magic)?;
        write_be_u16(out, 4, self.level)?;
        write_be_u16(out, 6, self.numrecs)?;
        if long {
            self.leftsib.encode(out, 8, true)?;
            self.rightsib.encode(out, 16, true)?;
            write_be_u64(out, 24, self.blkno)?;
            write_be_u64(out, 32, self.owner)
        } else {
            self.leftsib.encode(out, 8, false)?;
            self.rightsib.encode(out, 12, false)?;
            write_be_u64(out, 16, self.blkno)?;
            let owner = u32::try_from(self.owner)
                .map_err(|_| ParseError::IntegerConversion { field: "owner" })?;
            write_be_u32(out, 24, owner)
        }
    }
}

// ── Block ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum BtreeBody<F: RecordFormat> {
    Node {
        keys: Vec<F::Key>,
        /// Empty unless the tree is overlapping.
        high_keys: Vec<F::Key>,
        ptrs: Vec<BtreePtr>,
    },
    Leaf { recs: Vec<F::Rec> },
}

/// A decoded btree block.
#[derive(Debug, Clone, PartialEq)]
pub struct BtreeBlock<F: RecordFormat> {
    pub header: BtreeHeader,
    pub body: BtreeBody<F>,
}

fn node_entry_len<F: RecordFormat>() -> usize {
    let keys = if F::OVERLAPPING { 2 } else { 1 };
    F::KEY_LEN * keys + BtreePtr::len(F::LONG_PTRS)
}

impl<F: RecordFormat> BtreeBlock<F> {
    /// Most entries a block of `block_size` bytes can hold at `level`.
    #[must_use]
    pub fn max_recs(block_size: usize, level: u16) -> usize {
        let space = block_size.saturating_sub(header_len(F::LONG_PTRS));
        if level == 0 {
            space / F::REC_LEN
        } else {
            space / node_entry_len::<F>()
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        let header = BtreeHeader::parse(bytes, F::LONG_PTRS)?;
        if header.magic != F::ID.magic() {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(F::ID.magic()),
                actual: u64::from(header.magic),
            });
        }
        let count = usize::from(header.numrecs);
        if count > Self::max_recs(bytes.len(), header.level) {
            return Err(ParseError::InvalidField {
                field: "numrecs",
                reason: "exceeds block capacity",
            });
        }

        let start = header_len(F::LONG_PTRS);
        let body = if header.level == 0 {
            let mut recs = Vec::with_capacity(count);
            for i in 0..count {
                let at = start + i * F::REC_LEN;
                recs.push(F::decode_rec(ensure_slice(bytes, at, F::REC_LEN)?)?);
            }
            BtreeBody::Leaf { recs }
        } else {
            let entry = node_entry_len::<F>();
            let mut keys = Vec::with_capacity(count);
            let mut high_keys = Vec::new();
            let mut ptrs = Vec::with_capacity(count);
            for i in 0..count {
                let mut at = start + i * entry;
                keys.push(F::decode_key(ensure_slice(bytes, at, F::KEY_LEN)?)?);
                at += F::KEY_LEN;
                if F::OVERLAPPING {
                    high_keys.push(F::decode_key(ensure_slice(bytes, at, F::KEY_LEN)?)?);
                    at += F::KEY_LEN;
                }
                ptrs.push(BtreePtr::decode(bytes, at, F::LONG_PTRS)?);
            }
            BtreeBody::Node {
                keys,
                high_keys,
                ptrs,
            }
        };
        Ok(Self { header, body })
    }

    /// Encode into a block of `block_size` bytes with a fresh checksum.
    ///
    /// `numrecs` is taken from the body, not the header.
    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        let count = self.numrecs();
        if count > Self::max_recs(block_size, self.header.level) {
            return Err(ParseError::InvalidField {
                field: "numrecs",
                reason: "exceeds block capacity",
            });
        }
        let numrecs =
            u16::try_from(count).map_err(|_| ParseError::IntegerConversion { field: "numrecs" })?;
        let mut out = vec![0_u8; block_size];
        BtreeHeader { numrecs, ..self.header }.write(&mut out, F::LONG_PTRS)?;

        let start = header_len(F::LONG_PTRS);
        match &self.body {
            BtreeBody::Leaf { recs } => {
                for (i, rec) in recs.iter().enumerate() {
                    let at = start + i * F::REC_LEN;
                    F::encode_rec(rec, ensure_slice_mut(&mut out, at, F::REC_LEN)?)?;
                }
            }
            BtreeBody::Node {
                keys,
                high_keys,
                ptrs,
            } => {
                if ptrs.len() != keys.len() || (F::OVERLAPPING && high_keys.len() != keys.len()) {
                    return Err(ParseError::InvalidField {
                        field: "node",
                        reason: "key and pointer counts differ",
                    });
                }
                let entry = node_entry_len::<F>();
                for (i, key) in keys.iter().enumerate() {
                    let mut at = start + i * entry;
                    F::encode_key(key, ensure_slice_mut(&mut out, at, F::KEY_LEN)?)?;
                    at += F::KEY_LEN;
                    if F::OVERLAPPING {
                        F::encode_key(&high_keys[i], ensure_slice_mut(&mut out, at, F::KEY_LEN)?)?;
                        at += F::KEY_LEN;
                    }
                    ptrs[i].encode(&mut out, at, F::LONG_PTRS)?;
                }
            }
        }
        stamp_crc(&mut out, crc_offset(F::LONG_PTRS))?;
        Ok(out)
    }

    #[must_use]
    pub fn level(&self) -> u16 {
        self.header.level
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self.body, BtreeBody::Leaf { .. })
    }

    /// Entries actually present in the body.
    #[must_use]
    pub fn numrecs(&self) -> usize {
        match &self.body {
            BtreeBody::Node { keys, .. } => keys.len(),
            BtreeBody::Leaf { recs } => recs.len(),
        }
    }

    #[must_use]
    pub fn rec(&self, index: usize) -> Option<&F::Rec> {
        match &self.body {
            BtreeBody::Leaf { recs } => recs.get(index),
            BtreeBody::Node { .. } => None,
        }
    }

    #[must_use]
    pub fn ptr(&self, index: usize) -> Option<BtreePtr> {
        match &self.body {
            BtreeBody::Node { ptrs, .. } => ptrs.get(index).copied(),
            BtreeBody::Leaf { .. } => None,
        }
    }

    /// Low key of entry `index`, for nodes and leaves alike.
    #[must_use]
    pub fn key(&self, index: usize) -> Option<F::Key> {
        match &self.body {
            BtreeBody::Node { keys, .. } => keys.get(index).copied(),
            BtreeBody::Leaf { recs } => recs.get(index).map(F::key_from_rec),
        }
    }

    /// High key of entry `index`. Nodes of non-overlapping trees only store
    /// low keys, so the low key stands in.
    #[must_use]
    pub fn high_key(&self, index: usize) -> Option<F::Key> {
        match &self.body {
            BtreeBody::Node {
                keys, high_keys, ..
            } => {
                if F::OVERLAPPING {
                    high_keys.get(index).copied()
                } else {
                    keys.get(index).copied()
                }
            }
            BtreeBody::Leaf { recs } => recs.get(index).map(F::high_key_from_rec),
        }
    }

    /// Lowest key in the block.
    #[must_use]
    pub fn low_key(&self) -> Option<F::Key> {
        self.key(0)
    }

    /// Highest key covered by anything in the block.
    #[must_use]
    pub fn block_high_key(&self) -> Option<F::Key> {
        let count = self.numrecs();
        if count == 0 {
            return None;
        }
        if !F::OVERLAPPING {
            return self.key(count - 1);
        }
        (0..count)
            .filter_map(|i| self.high_key(i))
            .reduce(|a, b| {
                if F::cmp_keys(&a, &b) == std::cmp::Ordering::Less {
                    b
                } else {
                    a
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{
        AllocRec, BmapFormat, BmbtRec, BnoFormat, BtreeId, RmapFormat, RmapKey, RmapRec,
    };
    use proptest::prelude::*;

    fn short_header(id: BtreeId, level: u16) -> BtreeHeader {
        BtreeHeader {
            magic: id.magic(),
            level,
            numrecs: 0,
            leftsib: BtreePtr::null(false),
            rightsib: BtreePtr::null(false),
            blkno: 8,
            owner: 1,
            crc: 0,
        }
    }

    #[test]
    fn leaf_block_decodes() {
        let block = BtreeBlock::<BnoFormat> {
            header: short_header(BtreeId::Bno, 0),
            body: BtreeBody::Leaf {
                recs: vec![
                    AllocRec {
                        startblock: 10,
                        blockcount: 2,
                    },
                    AllocRec {
                        startblock: 20,
                        blockcount: 4,
                    },
                ],
            },
        };
        let bytes = block.encode(512).expect("encode");
        crate::verify_crc(&bytes, 28, fscrub_types::BlockNumber(8)).expect("crc");
        let decoded = BtreeBlock::<BnoFormat>::decode(&bytes).expect("decode");
        assert_eq!(decoded.header.numrecs, 2);
        assert_eq!(decoded.rec(1), block.rec(1));
        assert_eq!(decoded.key(0).map(|k| k.startblock), Some(10));
        assert_eq!(decoded.block_high_key().map(|k| k.startblock), Some(20));
        assert!(decoded.header.leftsib.is_null());
    }

    #[test]
    fn overlapping_node_keeps_high_keys() {
        let key = |startblock| RmapKey {
            startblock,
            owner: 5,
            offset: 0,
        };
        let block = BtreeBlock::<RmapFormat> {
            header: short_header(BtreeId::Rmap, 1),
            body: BtreeBody::Node {
                keys: vec![key(1), key(50)],
                high_keys: vec![key(90), key(60)],
                ptrs: vec![BtreePtr::Short(7), BtreePtr::Short(9)],
            },
        };
        let decoded =
            BtreeBlock::<RmapFormat>::decode(&block.encode(1024).expect("encode")).expect("decode");
        assert_eq!(decoded, BtreeBlock { header: decoded.header, ..block });
        assert_eq!(decoded.high_key(0), Some(key(90)));
        // Highest high key wins even when it is not the last entry.
        assert_eq!(decoded.block_high_key(), Some(key(90)));
        let rec = RmapRec {
            startblock: 4,
            blockcount: 1,
            owner: 5,
            offset: 0,
        };
        assert_eq!(RmapFormat::key_from_rec(&rec), key(4));
    }

    #[test]
    fn long_pointer_block() {
        let block = BtreeBlock::<BmapFormat> {
            header: BtreeHeader {
                magic: BtreeId::Bmap.magic(),
                level: 0,
                numrecs: 0,
                leftsib: BtreePtr::null(true),
                rightsib: BtreePtr::Long(99),
                blkno: 77,
                owner: 1234,
                crc: 0,
            },
            body: BtreeBody::Leaf {
                recs: vec![BmbtRec {
                    startoff: 0,
                    startblock: 500,
                    blockcount: 8,
                    flags: 0,
                }],
            },
        };
        let decoded =
            BtreeBlock::<BmapFormat>::decode(&block.encode(512).expect("encode")).expect("decode");
        assert_eq!(decoded.header.rightsib, BtreePtr::Long(99));
        assert_eq!(decoded.header.owner, 1234);
    }

    #[test]
    fn decode_rejects_foreign_magic_and_overfull_block() {
        let mut header = short_header(BtreeId::Cnt, 0);
        let block = BtreeBlock::<BnoFormat> {
            header,
            body: BtreeBody::Leaf { recs: vec![] },
        };
        let bytes = block.encode(512).expect("encode");
        assert!(matches!(
            BtreeBlock::<BnoFormat>::decode(&bytes),
            Err(ParseError::InvalidMagic { .. })
        ));

        header.magic = BtreeId::Bno.magic();
        header.numrecs = 1000;
        let mut bytes = vec![0_u8; 512];
        header.write(&mut bytes, false).expect("write header");
        assert!(matches!(
            BtreeBlock::<BnoFormat>::decode(&bytes),
            Err(ParseError::InvalidField {
                field: "numrecs",
                ..
            })
        ));
    }

    #[test]
    fn pointer_width_mismatch_is_rejected() {
        let mut out = [0_u8; 16];
        assert!(BtreePtr::Long(1).encode(&mut out, 0, false).is_err());
        assert_eq!(BtreePtr::Short(5).to_string(), "5");
        assert_eq!(BtreePtr::null(false).to_string(), "null");
    }

    proptest! {
        #[test]
        fn leaf_capacity_is_respected(count in 0_usize..80) {
            let recs = (0..count)
                .map(|i| AllocRec { startblock: u32::try_from(i).unwrap() * 4, blockcount: 1 })
                .collect();
            let block = BtreeBlock::<BnoFormat> {
                header: short_header(BtreeId::Bno, 0),
                body: BtreeBody::Leaf { recs },
            };
            let fits = count <= BtreeBlock::<BnoFormat>::max_recs(512, 0);
            prop_assert_eq!(block.encode(512).is_ok(), fits);
        }
    }
}
