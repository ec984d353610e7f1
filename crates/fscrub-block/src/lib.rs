#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `BlockDevice` trait used by every scrubber, a file-backed
//! implementation for real images, and an in-memory device for building
//! test images. Every read takes a `&Cx` capability context so that a
//! cancelled scrub stops at the next I/O boundary.

use asupersync::Cx;
use fscrub_error::{Result, ScrubError};
use fscrub_types::BlockNumber;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| ScrubError::Cancelled)
}

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;
}

fn checked_end(offset: u64, len: usize, what: &str) -> Result<u64> {
    offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| ScrubError::Format(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| ScrubError::Format(format!("{what} range overflows u64")))
}

/// File-backed byte device.
///
/// Opens read-write when permitted and falls back to read-only; scrubbing
/// itself never writes.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        debug!(
            path = %path.as_ref().display(),
            len,
            writable,
            "file_byte_device_open"
        );
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let end = checked_end(offset, buf.len(), "read")?;
        if end > self.len {
            return Err(ScrubError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        cx_checkpoint(cx)?;
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        if !self.writable {
            return Err(ScrubError::Unsupported(
                "image was opened read-only".to_owned(),
            ));
        }
        let end = checked_end(offset, buf.len(), "write")?;
        if end > self.len {
            return Err(ScrubError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.write_all_at(buf, offset)?;
        cx_checkpoint(cx)?;
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_all()?;
        cx_checkpoint(cx)?;
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;
}

fn block_size_usize(block_size: u32) -> Result<usize> {
    usize::try_from(block_size)
        .map_err(|_| ScrubError::Format("block_size does not fit usize".to_owned()))
}

fn validate_block_size(block_size: u32) -> Result<()> {
    if block_size == 0 || !block_size.is_power_of_two() {
        return Err(ScrubError::Format(format!(
            "invalid block_size={block_size} (must be power of two)"
        )));
    }
    Ok(())
}

fn out_of_range(block: BlockNumber, block_count: u64) -> ScrubError {
    ScrubError::Format(format!(
        "block out of range: block={} block_count={block_count}",
        block.0
    ))
}

/// Adapts a [`ByteDevice`] to fixed-size block I/O.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        validate_block_size(block_size)?;

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(ScrubError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf> {
        cx_checkpoint(cx)?;
        if block.0 >= self.block_count {
            return Err(out_of_range(block, self.block_count));
        }

        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| ScrubError::Format("block offset overflow".to_owned()))?;
        let mut buf = vec![0_u8; block_size_usize(self.block_size)?];
        self.inner.read_exact_at(cx, offset, &mut buf)?;
        trace!(block = block.0, "block_read");
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let expected = block_size_usize(self.block_size)?;
        if data.len() != expected {
            return Err(ScrubError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        if block.0 >= self.block_count {
            return Err(out_of_range(block, self.block_count));
        }

        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| ScrubError::Format("block offset overflow".to_owned()))?;
        self.inner.write_all_at(cx, offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        self.inner.sync(cx)
    }
}

/// Sparse in-memory block device.
///
/// Blocks never written read back as zeroes. Used by image builders and
/// tests; the map only holds blocks that were written.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    blocks: RwLock<HashMap<u64, Vec<u8>>>,
}

impl MemBlockDevice {
    pub fn new(block_size: u32, block_count: u64) -> Result<Self> {
        validate_block_size(block_size)?;
        Ok(Self {
            block_size,
            block_count,
            blocks: RwLock::new(HashMap::new()),
        })
    }

    /// Number of blocks that hold written data.
    #[must_use]
    pub fn written_blocks(&self) -> usize {
        self.blocks.read().len()
    }

    /// Copy every written block out to a byte device, e.g. an image file.
    pub fn copy_to(&self, cx: &Cx, dst: &dyn ByteDevice) -> Result<()> {
        let blocks = self.blocks.read();
        let mut numbers: Vec<u64> = blocks.keys().copied().collect();
        numbers.sort_unstable();
        for block in numbers {
            let offset = block
                .checked_mul(u64::from(self.block_size))
                .ok_or_else(|| ScrubError::Format("block offset overflow".to_owned()))?;
            if let Some(data) = blocks.get(&block) {
                dst.write_all_at(cx, offset, data)?;
            }
        }
        drop(blocks);
        dst.sync(cx)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf> {
        cx_checkpoint(cx)?;
        if block.0 >= self.block_count {
            return Err(out_of_range(block, self.block_count));
        }
        let data = self
            .blocks
            .read()
            .get(&block.0)
            .cloned()
            .map_or_else(|| block_size_usize(self.block_size).map(|n| vec![0_u8; n]), Ok)?;
        Ok(BlockBuf::new(data))
    }

    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let expected = block_size_usize(self.block_size)?;
        if data.len() != expected {
            return Err(ScrubError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        if block.0 >= self.block_count {
            return Err(out_of_range(block, self.block_count));
        }
        self.blocks.write().insert(block.0, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)
    }
}
