//! Btree record and key layouts.
//!
//! Each btree type is a zero-sized [`RecordFormat`] that knows how its keys
//! and records are laid out on disk and how they are ordered. The generic
//! block codec and the scrub walker only ever go through this trait.

use fscrub_types::{ParseError, read_be_u32, read_be_u64, write_be_u32, write_be_u64};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ── Btree identities ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BtreeId {
    /// Free space indexed by start block.
    Bno,
    /// Free space indexed by length.
    Cnt,
    Ino,
    Fino,
    Rmap,
    Refc,
    /// File block map, rooted in an inode fork.
    Bmap,
}

impl BtreeId {
    #[must_use]
    pub fn magic(self) -> u32 {
        match self {
            Self::Bno => 0x4142_3342,
            Self::Cnt => 0x4142_3343,
            Self::Ino => 0x4941_4233,
            Self::Fino => 0x4649_4233,
            Self::Rmap => 0x524D_4233,
            Self::Refc => 0x5233_4643,
            Self::Bmap => 0x424D_4133,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Bno => "bnobt",
            Self::Cnt => "cntbt",
            Self::Ino => "inobt",
            Self::Fino => "finobt",
            Self::Rmap => "rmapbt",
            Self::Refc => "refcountbt",
            Self::Bmap => "bmapbt",
        }
    }

    /// Trees that are their own ownership oracle.
    ///
    /// Checking a block of one of these against the free-space or
    /// reverse-map index would need a second cursor into the tree being
    /// walked, so their owner checks are queued until the walk finishes.
    #[must_use]
    pub fn is_own_oracle(self) -> bool {
        matches!(self, Self::Bno | Self::Rmap)
    }
}

impl fmt::Display for BtreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Reverse-mapping owners ──────────────────────────────────────────────────

/// Special owner codes stored in reverse-mapping records.
///
/// Real inode numbers are small; special owners occupy the top of the
/// 64-bit range.
pub struct RmapOwner;

impl RmapOwner {
    pub const NULL: u64 = u64::MAX;
    pub const UNKNOWN: u64 = u64::MAX - 1;
    /// Static filesystem metadata (AG headers).
    pub const FS: u64 = u64::MAX - 2;
    pub const LOG: u64 = u64::MAX - 3;
    /// Free-space and reverse-map btree blocks plus the free list.
    pub const AG: u64 = u64::MAX - 4;
    pub const INOBT: u64 = u64::MAX - 5;
    pub const INODES: u64 = u64::MAX - 6;
    pub const REFC: u64 = u64::MAX - 7;
    pub const COW: u64 = u64::MAX - 8;

    /// Lowest value that is a special owner rather than an inode.
    pub const MIN_SPECIAL: u64 = Self::COW;

    #[must_use]
    pub fn is_special(owner: u64) -> bool {
        owner >= Self::MIN_SPECIAL
    }
}

// ── Format contract ─────────────────────────────────────────────────────────

/// On-disk layout and ordering rules of one btree type.
pub trait RecordFormat: Send + Sync + 'static {
    type Key: Copy + fmt::Debug + PartialEq + Send + Sync;
    type Rec: Copy + fmt::Debug + PartialEq + Send + Sync;

    const ID: BtreeId;
    const KEY_LEN: usize;
    const REC_LEN: usize;
    /// 64-bit block pointers (inode-rooted trees).
    const LONG_PTRS: bool = false;
    /// Node entries carry a high key; records may overlap.
    const OVERLAPPING: bool = false;

    fn decode_key(bytes: &[u8]) -> Result<Self::Key, ParseError>;
    fn encode_key(key: &Self::Key, out: &mut [u8]) -> Result<(), ParseError>;
    fn decode_rec(bytes: &[u8]) -> Result<Self::Rec, ParseError>;
    fn encode_rec(rec: &Self::Rec, out: &mut [u8]) -> Result<(), ParseError>;

    fn key_from_rec(rec: &Self::Rec) -> Self::Key;

    /// Largest key covered by `rec`; equal to the low key unless the record
    /// spans a range in key space.
    fn high_key_from_rec(rec: &Self::Rec) -> Self::Key {
        Self::key_from_rec(rec)
    }

    fn cmp_keys(a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Adjacent node keys at one level.
    fn keys_inorder(a: &Self::Key, b: &Self::Key) -> bool {
        Self::cmp_keys(a, b) == Ordering::Less
    }

    /// Adjacent leaf records.
    fn recs_inorder(a: &Self::Rec, b: &Self::Rec) -> bool;
}

fn extent_end(start: u32, count: u32) -> u64 {
    u64::from(start) + u64::from(count)
}

// ── Free space ──────────────────────────────────────────────────────────────

/// Free extent `[startblock, startblock + blockcount)` inside one AG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocRec {
    pub startblock: u32,
    pub blockcount: u32,
}

fn decode_alloc(bytes: &[u8]) -> Result<AllocRec, ParseError> {
    Ok(AllocRec {
        startblock: read_be_u32(bytes, 0)?,
        blockcount: read_be_u32(bytes, 4)?,
    })
}

fn encode_alloc(rec: &AllocRec, out: &mut [u8]) -> Result<(), ParseError> {
    write_be_u32(out, 0, rec.startblock)?;
    write_be_u32(out, 4, rec.blockcount)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BnoFormat;

impl RecordFormat for BnoFormat {
    type Key = AllocRec;
    type Rec = AllocRec;

    const ID: BtreeId = BtreeId::Bno;
    const KEY_LEN: usize = 8;
    const REC_LEN: usize = 8;

    fn decode_key(bytes: &[u8]) -> Result<AllocRec, ParseError> {
        decode_alloc(bytes)
    }

    fn encode_key(key: &AllocRec, out: &mut [u8]) -> Result<(), ParseError> {
        encode_alloc(key, out)
    }

    fn decode_rec(bytes: &[u8]) -> Result<AllocRec, ParseError> {
        decode_alloc(bytes)
    }

    fn encode_rec(rec: &AllocRec, out: &mut [u8]) -> Result<(), ParseError> {
        encode_alloc(rec, out)
    }

    fn key_from_rec(rec: &AllocRec) -> AllocRec {
        *rec
    }

    fn high_key_from_rec(rec: &AllocRec) -> AllocRec {
        AllocRec {
            startblock: rec
                .startblock
                .saturating_add(rec.blockcount)
                .saturating_sub(1),
            blockcount: 0,
        }
    }

    fn cmp_keys(a: &AllocRec, b: &AllocRec) -> Ordering {
        a.startblock.cmp(&b.startblock)
    }

    fn recs_inorder(a: &AllocRec, b: &AllocRec) -> bool {
        extent_end(a.startblock, a.blockcount) <= u64::from(b.startblock)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CntFormat;

impl RecordFormat for CntFormat {
    type Key = AllocRec;
    type Rec = AllocRec;

    const ID: BtreeId = BtreeId::Cnt;
    const KEY_LEN: usize = 8;
    const REC_LEN: usize = 8;

    fn decode_key(bytes: &[u8]) -> Result<AllocRec, ParseError> {
        decode_alloc(bytes)
    }

    fn encode_key(key: &AllocRec, out: &mut [u8]) -> Result<(), ParseError> {
        encode_alloc(key, out)
    }

    fn decode_rec(bytes: &[u8]) -> Result<AllocRec, ParseError> {
        decode_alloc(bytes)
    }

    fn encode_rec(rec: &AllocRec, out: &mut [u8]) -> Result<(), ParseError> {
        encode_alloc(rec, out)
    }

    fn key_from_rec(rec: &AllocRec) -> AllocRec {
        *rec
    }

    fn cmp_keys(a: &AllocRec, b: &AllocRec) -> Ordering {
        a.blockcount
            .cmp(&b.blockcount)
            .then(a.startblock.cmp(&b.startblock))
    }

    fn recs_inorder(a: &AllocRec, b: &AllocRec) -> bool {
        a.blockcount < b.blockcount
            || (a.blockcount == b.blockcount
                && extent_end(a.startblock, a.blockcount) <= u64::from(b.startblock))
    }
}

// ── Inode chunks ────────────────────────────────────────────────────────────

/// Inodes per chunk record.
pub const INODES_PER_CHUNK: u32 = 64;

/// A chunk of [`INODES_PER_CHUNK`] inodes starting at AG inode `startino`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InodeRec {
    pub startino: u32,
    pub freecount: u32,
    /// One bit per inode in the chunk; set means free.
    pub free: u64,
}

fn decode_inode_rec(bytes: &[u8]) -> Result<InodeRec, ParseError> {
    Ok(InodeRec {
        startino: read_be_u32(bytes, 0)?,
        freecount: read_be_u32(bytes, 4)?,
        free: read_be_u64(bytes, 8)?,
    })
}

fn encode_inode_rec(rec: &InodeRec, out: &mut [u8]) -> Result<(), ParseError> {
    write_be_u32(out, 0, rec.startino)?;
    write_be_u32(out, 4, rec.freecount)?;
    write_be_u64(out, 8, rec.free)
}

fn inode_recs_inorder(a: &InodeRec, b: &InodeRec) -> bool {
    u64::from(a.startino) + u64::from(INODES_PER_CHUNK) <= u64::from(b.startino)
}

macro_rules! inode_format {
    ($name:ident, $id:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name;

        impl RecordFormat for $name {
            type Key = u32;
            type Rec = InodeRec;

            const ID: BtreeId = $id;
            const KEY_LEN: usize = 4;
            const REC_LEN: usize = 16;

            fn decode_key(bytes: &[u8]) -> Result<u32, ParseError> {
                read_be_u32(bytes, 0)
            }

            fn encode_key(key: &u32, out: &mut [u8]) -> Result<(), ParseError> {
                write_be_u32(out, 0, *key)
            }

            fn decode_rec(bytes: &[u8]) -> Result<InodeRec, ParseError> {
                decode_inode_rec(bytes)
            }

            fn encode_rec(rec: &InodeRec, out: &mut [u8]) -> Result<(), ParseError> {
                encode_inode_rec(rec, out)
            }

            fn key_from_rec(rec: &InodeRec) -> u32 {
                rec.startino
            }

            fn cmp_keys(a: &u32, b: &u32) -> Ordering {
                a.cmp(b)
            }

            fn recs_inorder(a: &InodeRec, b: &InodeRec) -> bool {
                inode_recs_inorder(a, b)
            }
        }
    };
}

inode_format!(InoFormat, BtreeId::Ino);
inode_format!(FinoFormat, BtreeId::Fino);

// ── Reverse mappings ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RmapRec {
    pub startblock: u32,
    pub blockcount: u32,
    pub owner: u64,
    /// Logical offset in the owning file; zero for special owners.
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RmapKey {
    pub startblock: u32,
    pub owner: u64,
    pub offset: u64,
}

impl RmapKey {
    /// Smallest key whose start block is `agbno`.
    #[must_use]
    pub fn low(agbno: u32) -> Self {
        Self {
            startblock: agbno,
            owner: 0,
            offset: 0,
        }
    }

    /// Largest key whose start block is `agbno`.
    #[must_use]
    pub fn high(agbno: u32) -> Self {
        Self {
            startblock: agbno,
            owner: u64::MAX,
            offset: u64::MAX,
        }
    }
}

impl RmapRec {
    #[must_use]
    pub fn covers(&self, agbno: u32) -> bool {
        agbno >= self.startblock && u64::from(agbno) < extent_end(self.startblock, self.blockcount)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RmapFormat;

impl RecordFormat for RmapFormat {
    type Key = RmapKey;
    type Rec = RmapRec;

    const ID: BtreeId = BtreeId::Rmap;
    const KEY_LEN: usize = 20;
    const REC_LEN: usize = 24;
    const OVERLAPPING: bool = true;

    fn decode_key(bytes: &[u8]) -> Result<RmapKey, ParseError> {
        Ok(RmapKey {
            startblock: read_be_u32(bytes, 0)?,
            owner: read_be_u64(bytes, 4)?,
            offset: read_be_u64(bytes, 12)?,
        })
    }

    fn encode_key(key: &RmapKey, out: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(out, 0, key.startblock)?;
        write_be_u64(out, 4, key.owner)?;
        write_be_u64(out, 12, key.offset)
    }

    fn decode_rec(bytes: &[u8]) -> Result<RmapRec, ParseError> {
        Ok(RmapRec {
            startblock: read_be_u32(bytes, 0)?,
            blockcount: read_be_u32(bytes, 4)?,
            owner: read_be_u64(bytes, 8)?,
            offset: read_be_u64(bytes, 16)?,
        })
    }

    fn encode_rec(rec: &RmapRec, out: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(out, 0, rec.startblock)?;
        write_be_u32(out, 4, rec.blockcount)?;
        write_be_u64(out, 8, rec.owner)?;
        write_be_u64(out, 16, rec.offset)
    }

    fn key_from_rec(rec: &RmapRec) -> RmapKey {
        RmapKey {
            startblock: rec.startblock,
            owner: rec.owner,
            offset: rec.offset,
        }
    }

    fn high_key_from_rec(rec: &RmapRec) -> RmapKey {
        let span = rec.blockcount.saturating_sub(1);
        let offset = if RmapOwner::is_special(rec.owner) {
            rec.offset
        } else {
            rec.offset.saturating_add(u64::from(span))
        };
        RmapKey {
            startblock: rec.startblock.saturating_add(span),
            owner: rec.owner,
            offset,
        }
    }

    fn cmp_keys(a: &RmapKey, b: &RmapKey) -> Ordering {
        a.startblock
            .cmp(&b.startblock)
            .then(a.owner.cmp(&b.owner))
            .then(a.offset.cmp(&b.offset))
    }

    fn keys_inorder(a: &RmapKey, b: &RmapKey) -> bool {
        Self::cmp_keys(a, b) != Ordering::Greater
    }

    fn recs_inorder(a: &RmapRec, b: &RmapRec) -> bool {
        Self::keys_inorder(&Self::key_from_rec(a), &Self::key_from_rec(b))
    }
}

// ── Reference counts ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefcountRec {
    pub startblock: u32,
    pub blockcount: u32,
    pub refcount: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefcFormat;

impl RecordFormat for RefcFormat {
    type Key = u32;
    type Rec = RefcountRec;

    const ID: BtreeId = BtreeId::Refc;
    const KEY_LEN: usize = 4;
    const REC_LEN: usize = 12;

    fn decode_key(bytes: &[u8]) -> Result<u32, ParseError> {
        read_be_u32(bytes, 0)
    }

    fn encode_key(key: &u32, out: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(out, 0, *key)
    }

    fn decode_rec(bytes: &[u8]) -> Result<RefcountRec, ParseError> {
        Ok(RefcountRec {
            startblock: read_be_u32(bytes, 0)?,
            blockcount: read_be_u32(bytes, 4)?,
            refcount: read_be_u32(bytes, 8)?,
        })
    }

    fn encode_rec(rec: &RefcountRec, out: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(out, 0, rec.startblock)?;
        write_be_u32(out, 4, rec.blockcount)?;
        write_be_u32(out, 8, rec.refcount)
    }

    fn key_from_rec(rec: &RefcountRec) -> u32 {
        rec.startblock
    }

    fn high_key_from_rec(rec: &RefcountRec) -> u32 {
        rec.startblock
            .saturating_add(rec.blockcount)
            .saturating_sub(1)
    }

    fn cmp_keys(a: &u32, b: &u32) -> Ordering {
        a.cmp(b)
    }

    fn recs_inorder(a: &RefcountRec, b: &RefcountRec) -> bool {
        extent_end(a.startblock, a.blockcount) <= u64::from(b.startblock)
    }
}

// ── File block map ──────────────────────────────────────────────────────────

/// Mapping of file offsets `[startoff, startoff + blockcount)` to
/// filesystem blocks starting at `startblock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BmbtRec {
    pub startoff: u64,
    pub startblock: u64,
    pub blockcount: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BmapFormat;

impl RecordFormat for BmapFormat {
    type Key = u64;
    type Rec = BmbtRec;

    const ID: BtreeId = BtreeId::Bmap;
    const KEY_LEN: usize = 8;
    const REC_LEN: usize = 24;
    const LONG_PTRS: bool = true;

    fn decode_key(bytes: &[u8]) -> Result<u64, ParseError> {
        read_be_u64(bytes, 0)
    }

    fn encode_key(key: &u64, out: &mut [u8]) -> Result<(), ParseError> {
        write_be_u64(out, 0, *key)
    }

    fn decode_rec(bytes: &[u8]) -> Result<BmbtRec, ParseError> {
        Ok(BmbtRec {
            startoff: read_be_u64(bytes, 0)?,
            startblock: read_be_u64(bytes, 8)?,
            blockcount: read_be_u32(bytes, 16)?,
            flags: read_be_u32(bytes, 20)?,
        })
    }

    fn encode_rec(rec: &BmbtRec, out: &mut [u8]) -> Result<(), ParseError> {
        write_be_u64(out, 0, rec.startoff)?;
        write_be_u64(out, 8, rec.startblock)?;
        write_be_u32(out, 16, rec.blockcount)?;
        write_be_u32(out, 20, rec.flags)
    }

    fn key_from_rec(rec: &BmbtRec) -> u64 {
        rec.startoff
    }

    fn cmp_keys(a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    fn recs_inorder(a: &BmbtRec, b: &BmbtRec) -> bool {
        a.startoff.saturating_add(u64::from(a.blockcount)) <= b.startoff
    }
}
