#![forbid(unsafe_code)]
//! On-disk metadata codecs.
//!
//! Pure parsing and encoding of the superblock, the AG headers, generic
//! btree blocks and dir/attr hash btree blocks. No I/O happens here: callers
//! hand in a block's bytes and get typed structures back, or the reverse.
//!
//! Every metadata block carries a crc32c computed over the whole block with
//! the checksum field itself treated as zero.

pub mod agheader;
pub mod btree;
pub mod da;
pub mod records;
pub mod sb;

pub use agheader::{Agf, Agfl, Agi};
pub use btree::{BtreeBlock, BtreeBody, BtreeHeader, BtreePtr};
pub use da::{DaBody, DaEntry, DaTreeBlock};
pub use records::{BtreeId, RecordFormat, RmapOwner};
pub use sb::Superblock;

use fscrub_error::ScrubError;
use fscrub_types::{AgBlock, BlockNumber, ParseError, ensure_slice, ensure_slice_mut};

// ── Fixed AG layout ─────────────────────────────────────────────────────────

/// Superblock copy at the start of every AG.
pub const SB_AGBNO: AgBlock = AgBlock(0);
pub const AGF_AGBNO: AgBlock = AgBlock(1);
pub const AGI_AGBNO: AgBlock = AgBlock(2);
pub const AGFL_AGBNO: AgBlock = AgBlock(3);
/// First AG block that may hold anything other than a header.
pub const FIRST_DATA_AGBNO: AgBlock = AgBlock(4);

// ── Checksums ───────────────────────────────────────────────────────────────

/// crc32c of `block` with the four bytes at `crc_offset` taken as zero.
pub fn compute_crc(block: &[u8], crc_offset: usize) -> Result<u32, ParseError> {
    ensure_slice(block, crc_offset, 4)?;
    let tail = crc_offset + 4;
    let crc = crc32c::crc32c(&block[..crc_offset]);
    let crc = crc32c::crc32c_append(crc, &[0_u8; 4]);
    Ok(crc32c::crc32c_append(crc, &block[tail..]))
}

/// Check the stored checksum of the block read from `blkno`.
pub fn verify_crc(
    block: &[u8],
    crc_offset: usize,
    blkno: BlockNumber,
) -> Result<(), ScrubError> {
    let stored = fscrub_types::read_be_u32(block, crc_offset).map_err(|e| corruption(blkno, &e))?;
    let computed = compute_crc(block, crc_offset).map_err(|e| corruption(blkno, &e))?;
    if stored != computed {
        return Err(ScrubError::ChecksumMismatch {
            block: blkno.0,
            stored,
            computed,
        });
    }
    Ok(())
}

/// Recompute and store the checksum of `block`.
pub fn stamp_crc(block: &mut [u8], crc_offset: usize) -> Result<(), ParseError> {
    let crc = compute_crc(block, crc_offset)?;
    ensure_slice_mut(block, crc_offset, 4)?.copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Attach a block number to a byte-level parse failure.
#[must_use]
pub fn corruption(blkno: BlockNumber, err: &ParseError) -> ScrubError {
    ScrubError::Corruption {
        block: blkno.0,
        detail: err.to_string(),
    }
}
