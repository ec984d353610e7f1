//! Superblock.
//!
//! The primary copy lives at block 0 of AG 0; every other AG carries a
//! secondary copy at its own block 0.

use crate::stamp_crc;
use fscrub_types::{
    FsGeometry, ParseError, describe_flags, format_flags, read_be_u8, read_be_u16, read_be_u32,
    read_be_u64, read_fixed, trim_nul_padded, write_be_u16, write_be_u32, write_be_u64,
    write_bytes,
};
use serde::{Deserialize, Serialize};

pub const SB_MAGIC: u32 = 0x5846_5342;
/// Bytes of the block covered by [`Superblock`]; the rest must be zero.
pub const SB_SIZE: usize = 144;
pub const SB_CRC_OFFSET: usize = 104;

/// Version number carried in the low nibble of `versionnum`.
pub const SB_VERSION_5: u16 = 5;
pub const SB_VERSION_NUMBITS: u16 = 0x000F;
/// `features2` is only meaningful when this version bit is set.
pub const SB_VERSION_MOREBITS: u16 = 0x8000;
/// Version bits that may be set after mkfs (attr, nlink, quota).
pub const SB_VERSION_LATER_BITS: u16 = 0x0070;
/// Version bits fixed at mkfs time.
pub const SB_VERSION_MKFS_MASK: u16 = !SB_VERSION_LATER_BITS;

// ── Feature flags ───────────────────────────────────────────────────────────

/// Read-only compatible features. Unknown bits force a read-only mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoCompatFeatures(pub u32);

impl RoCompatFeatures {
    pub const FINOBT: Self = Self(0x0001);
    pub const RMAPBT: Self = Self(0x0002);
    pub const REFLINK: Self = Self(0x0004);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "FINOBT"),
        (0x0002, "RMAPBT"),
        (0x0004, "REFLINK"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for RoCompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Second-generation feature word. Older kernels wrote it to the wrong
/// offset, so a copy lives in `bad_features2` and the two must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Features2(pub u32);

impl Features2 {
    pub const LAZYSBCOUNT: Self = Self(0x0002);
    pub const ATTR2: Self = Self(0x0008);
    pub const PROJID32: Self = Self(0x0080);
    pub const CRC: Self = Self(0x0100);
    pub const FTYPE: Self = Self(0x0200);

    /// Bits any version may carry; [`Self::CRC`] needs version 5.
    pub const OK_BITS: u32 =
        Self::LAZYSBCOUNT.0 | Self::ATTR2.0 | Self::PROJID32.0 | Self::FTYPE.0;
    /// Bits fixed at mkfs time.
    pub const MKFS_BITS: u32 =
        Self::LAZYSBCOUNT.0 | Self::PROJID32.0 | Self::CRC.0 | Self::FTYPE.0;

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0002, "LAZYSBCOUNT"),
        (0x0008, "ATTR2"),
        (0x0080, "PROJID32"),
        (0x0100, "CRC"),
        (0x0200, "FTYPE"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for Features2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Incompatible features. Unknown bits make the filesystem unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncompatFeatures(pub u32);

impl IncompatFeatures {
    pub const FTYPE: Self = Self(0x0001);
    pub const SPINODES: Self = Self(0x0002);
    pub const META_UUID: Self = Self(0x0004);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "FTYPE"),
        (0x0002, "SPINODES"),
        (0x0004, "META_UUID"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    /// Raw bits not covered by any named constant.
    #[must_use]
    pub fn unknown_bits(self) -> u32 {
        let known_mask: u32 = Self::KNOWN.iter().map(|(bit, _)| bit).fold(0, |a, b| a | b);
        self.0 & !known_mask
    }
}

impl std::fmt::Display for IncompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub block_size: u32,
    pub dblocks: u64,
    pub agblocks: u32,
    pub agcount: u32,
    pub uuid: [u8; 16],
    pub versionnum: u16,
    pub sectsize: u16,
    pub inodesize: u16,
    pub inopblock: u16,
    pub features_compat: u32,
    pub features_ro_compat: RoCompatFeatures,
    pub features_incompat: IncompatFeatures,
    pub rootino: u64,
    pub logstart: u64,
    pub logblocks: u32,
    pub fname: [u8; 12],
    pub imax_pct: u8,
    /// Stripe unit, in blocks.
    pub unit: u32,
    /// Stripe width, in blocks.
    pub width: u32,
    pub crc: u32,
    pub features2: Features2,
    pub bad_features2: Features2,
    /// Sparse inode chunk alignment, in blocks.
    pub spino_align: u32,
    pub pquotino: u64,
    /// Stamped into metadata headers instead of `uuid` when META_UUID is set.
    pub meta_uuid: [u8; 16],
}

impl Superblock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(block, 0)?;
        if magic != SB_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SB_MAGIC),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            block_size: read_be_u32(block, 4)?,
            dblocks: read_be_u64(block, 8)?,
            agblocks: read_be_u32(block, 16)?,
            agcount: read_be_u32(block, 20)?,
            uuid: read_fixed::<16>(block, 24)?,
            versionnum: read_be_u16(block, 40)?,
            sectsize: read_be_u16(block, 42)?,
            inodesize: read_be_u16(block, 44)?,
            inopblock: read_be_u16(block, 46)?,
            features_compat: read_be_u32(block, 48)?,
            features_ro_compat: RoCompatFeatures(read_be_u32(block, 52)?),
            features_incompat: IncompatFeatures(read_be_u32(block, 56)?),
            rootino: read_be_u64(block, 60)?,
            logstart: read_be_u64(block, 68)?,
            logblocks: read_be_u32(block, 76)?,
            fname: read_fixed::<12>(block, 80)?,
            imax_pct: read_be_u8(block, 92)?,
            unit: read_be_u32(block, 96)?,
            width: read_be_u32(block, 100)?,
            crc: read_be_u32(block, SB_CRC_OFFSET)?,
            features2: Features2(read_be_u32(block, 108)?),
            bad_features2: Features2(read_be_u32(block, 112)?),
            spino_align: read_be_u32(block, 116)?,
            pquotino: read_be_u64(block, 120)?,
            meta_uuid: read_fixed::<16>(block, 128)?,
        })
    }

    /// Encode into a zeroed block of `block_size` bytes with a fresh checksum.
    pub fn to_block(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        let mut block = vec![0_u8; block_size];
        write_be_u32(&mut block, 0, SB_MAGIC)?;
        write_be_u32(&mut block, 4, self.block_size)?;
        write_be_u64(&mut block, 8, self.dblocks)?;
        write_be_u32(&mut block, 16, self.agblocks)?;
        write_be_u32(&mut block, 20, self.agcount)?;
        write_bytes(&mut block, 24, &self.uuid)?;
        write_be_u16(&mut block, 40, self.versionnum)?;
        write_be_u16(&mut block, 42, self.sectsize)?;
        write_be_u16(&mut block, 44, self.inodesize)?;
        write_be_u16(&mut block, 46, self.inopblock)?;
        write_be_u32(&mut block, 48, self.features_compat)?;
        write_be_u32(&mut block, 52, self.features_ro_compat.0)?;
        write_be_u32(&mut block, 56, self.features_incompat.0)?;
        write_be_u64(&mut block, 60, self.rootino)?;
        write_be_u64(&mut block, 68, self.logstart)?;
        write_be_u32(&mut block, 76, self.logblocks)?;
        write_bytes(&mut block, 80, &self.fname)?;
        write_bytes(&mut block, 92, &[self.imax_pct])?;
        write_be_u32(&mut block, 96, self.unit)?;
        write_be_u32(&mut block, 100, self.width)?;
        write_be_u32(&mut block, 108, self.features2.0)?;
        write_be_u32(&mut block, 112, self.bad_features2.0)?;
        write_be_u32(&mut block, 116, self.spino_align)?;
        write_be_u64(&mut block, 120, self.pquotino)?;
        write_bytes(&mut block, 128, &self.meta_uuid)?;
        stamp_crc(&mut block, SB_CRC_OFFSET)?;
        Ok(block)
    }

    pub fn geometry(&self) -> Result<FsGeometry, ParseError> {
        FsGeometry::new(
            self.block_size,
            self.agblocks,
            self.agcount,
            self.dblocks,
            u32::from(self.inopblock),
        )
    }

    #[must_use]
    pub fn version(&self) -> u16 {
        self.versionnum & SB_VERSION_NUMBITS
    }

    /// Version 5 filesystems checksum and self-describe every metadata block.
    #[must_use]
    pub fn has_crc(&self) -> bool {
        self.version() >= SB_VERSION_5
    }

    #[must_use]
    pub fn has_morebits(&self) -> bool {
        (self.versionnum & SB_VERSION_MOREBITS) != 0
    }

    #[must_use]
    pub fn has_meta_uuid(&self) -> bool {
        self.features_incompat.contains(IncompatFeatures::META_UUID)
    }

    #[must_use]
    pub fn has_finobt(&self) -> bool {
        self.features_ro_compat.contains(RoCompatFeatures::FINOBT)
    }

    #[must_use]
    pub fn has_rmapbt(&self) -> bool {
        self.features_ro_compat.contains(RoCompatFeatures::RMAPBT)
    }

    #[must_use]
    pub fn has_reflink(&self) -> bool {
        self.features_ro_compat.contains(RoCompatFeatures::REFLINK)
    }

    #[must_use]
    pub fn label(&self) -> String {
        trim_nul_padded(&self.fname)
    }
}
