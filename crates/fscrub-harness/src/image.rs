//! Synthetic filesystem images.
//!
//! [`Image::build`] lays out every AG the same way: the four fixed headers,
//! then the btrees back to back, the free list blocks, inode chunks, shared
//! data extents and finally the free extents, each preceded by one block of
//! file data. Every piece of metadata is internally consistent, so a fresh
//! image scrubs clean and tests damage exactly what they mean to.

use anyhow::{Context, Result, ensure};
use asupersync::Cx;
use fscrub_block::{BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice, MemBlockDevice};
use fscrub_btree::{AgBtree, BtreeCursor};
use fscrub_core::ScrubMount;
use fscrub_ondisk::agheader::NULL_AGBNO;
use fscrub_ondisk::records::{
    AllocRec, BnoFormat, CntFormat, FinoFormat, INODES_PER_CHUNK, InoFormat, InodeRec,
    RefcFormat, RefcountRec, RmapFormat, RmapRec,
};
use fscrub_ondisk::sb::{
    Features2, IncompatFeatures, RoCompatFeatures, SB_VERSION_5, SB_VERSION_MOREBITS,
};
use fscrub_ondisk::{
    AGF_AGBNO, AGFL_AGBNO, AGI_AGBNO, Agf, Agfl, Agi, BtreeBlock, BtreeBody, BtreeHeader,
    BtreePtr, FIRST_DATA_AGBNO, RecordFormat, RmapOwner, SB_AGBNO, Superblock,
};
use fscrub_types::{AgBlock, AgNumber, BlockNumber, FsGeometry, MIN_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Inode owning the first copy of every shared extent.
const SHARED_OWNER_INO: u64 = 1_000;

// ── Image shape ─────────────────────────────────────────────────────────────

/// Shape of an image to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSpec {
    pub block_size: u32,
    pub agblocks: u32,
    pub agcount: u32,
    pub inode_size: u16,
    pub finobt: bool,
    pub rmapbt: bool,
    pub reflink: bool,
    /// Free extents per AG.
    pub free_extents: u32,
    /// Inode chunks per AG; every other chunk has free inodes.
    pub inode_chunks: u32,
    /// Shared two-block extents per AG, only with `reflink`.
    pub shared_extents: u32,
    /// Blocks parked on each AG's free list. One entry cannot be expressed
    /// without tripping the free list count check.
    pub agfl_blocks: u32,
    /// Records per leaf when bulk-loading; small values give tall trees.
    pub leaf_fill: usize,
    /// Pointers per interior node when bulk-loading.
    pub node_fill: usize,
    pub label: String,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            block_size: 4096,
            agblocks: 512,
            agcount: 4,
            inode_size: 512,
            finobt: false,
            rmapbt: false,
            reflink: false,
            free_extents: 50,
            inode_chunks: 4,
            shared_extents: 3,
            agfl_blocks: 4,
            leaf_fill: 8,
            node_fill: 4,
            label: "fscrub".to_owned(),
        }
    }
}

impl ImageSpec {
    /// Every optional btree turned on.
    #[must_use]
    pub fn all_features() -> Self {
        Self {
            finobt: true,
            rmapbt: true,
            reflink: true,
            ..Self::default()
        }
    }

    fn features(&self) -> RoCompatFeatures {
        let mut bits = 0;
        for (on, flag) in [
            (self.finobt, RoCompatFeatures::FINOBT),
            (self.rmapbt, RoCompatFeatures::RMAPBT),
            (self.reflink, RoCompatFeatures::REFLINK),
        ] {
            if on {
                bits |= flag.bits();
            }
        }
        RoCompatFeatures(bits)
    }

    fn superblock(&self) -> Result<Superblock> {
        ensure!(self.inode_size > 0, "inode size must be non-zero");
        let inopblock = u16::try_from(self.block_size / u32::from(self.inode_size))
            .context("inodes per block")?;
        ensure!(inopblock > 0, "inode size exceeds the block size");
        ensure!(
            INODES_PER_CHUNK % u32::from(inopblock) == 0,
            "{inopblock} inodes per block do not divide an inode chunk"
        );
        ensure!(
            self.agfl_blocks != 1,
            "a one-entry free list is reported as corrupt; use 0 or at least 2"
        );
        let label = self.label.as_bytes();
        ensure!(label.len() <= 12, "label {:?} longer than 12 bytes", self.label);
        let mut fname = [0_u8; 12];
        fname[..label.len()].copy_from_slice(label);
        let features2 =
            Features2(Features2::LAZYSBCOUNT.0 | Features2::ATTR2.0 | Features2::CRC.0);
        Ok(Superblock {
            block_size: self.block_size,
            dblocks: u64::from(self.agblocks) * u64::from(self.agcount),
            agblocks: self.agblocks,
            agcount: self.agcount,
            uuid: *b"fscrub-test-uuid",
            versionnum: SB_VERSION_5 | SB_VERSION_MOREBITS,
            sectsize: u16::try_from(self.block_size.min(4096)).context("sector size")?,
            inodesize: self.inode_size,
            inopblock,
            features_compat: 0,
            features_ro_compat: self.features(),
            features_incompat: IncompatFeatures::FTYPE,
            rootino: 128,
            logstart: 0,
            logblocks: 0,
            fname,
            imax_pct: 25,
            unit: 0,
            width: 0,
            crc: 0,
            features2,
            bad_features2: features2,
            spino_align: 0,
            pquotino: 0,
            meta_uuid: [0; 16],
        })
    }
}

// ── Layout ──────────────────────────────────────────────────────────────────

/// Where a bulk-loaded tree ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeInfo {
    pub root: u32,
    pub nlevels: usize,
    /// Every block of the tree, leaves first, left to right per level.
    pub blocks: Vec<u32>,
    pub leaf_count: usize,
}

impl TreeInfo {
    #[must_use]
    pub fn leaves(&self) -> &[u32] {
        &self.blocks[..self.leaf_count]
    }
}

/// Everything written into one AG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgLayout {
    pub agno: u32,
    pub bno: TreeInfo,
    pub cnt: TreeInfo,
    pub ino: TreeInfo,
    pub fino: Option<TreeInfo>,
    pub refcount: Option<TreeInfo>,
    pub rmap: Option<TreeInfo>,
    pub agfl: Vec<u32>,
    /// Free extents in block order.
    pub free: Vec<AllocRec>,
    pub chunks: Vec<InodeRec>,
    pub shared: Vec<RefcountRec>,
    pub rmaps: Vec<RmapRec>,
}

/// Blocks a bulk load of `records` takes, interior nodes included.
#[must_use]
pub fn tree_blocks(records: usize, leaf_fill: usize, node_fill: usize) -> usize {
    let mut level = records.div_ceil(leaf_fill.max(1)).max(1);
    let mut total = level;
    while level > 1 {
        level = level.div_ceil(node_fill.max(2));
        total += level;
    }
    total
}

/// Hands out AG blocks upward from the first data block.
struct Reserve {
    next: u32,
}

impl Reserve {
    fn take(&mut self, count: usize) -> Result<u32> {
        let start = self.next;
        let count = u32::try_from(count).context("reservation size")?;
        self.next = start
            .checked_add(count)
            .context("AG block numbers overflow")?;
        Ok(start)
    }

    fn align(&mut self, to: u32) {
        self.next = self.next.next_multiple_of(to.max(1));
    }
}

fn mapping(startblock: u32, blockcount: usize, owner: u64, offset: u64) -> Result<RmapRec> {
    Ok(RmapRec {
        startblock,
        blockcount: u32::try_from(blockcount).context("mapping length")?,
        owner,
        offset,
    })
}

fn tree_mapping(tree: &TreeInfo, owner: u64) -> Result<RmapRec> {
    let start = tree.blocks.iter().copied().min().unwrap_or(tree.root);
    mapping(start, tree.blocks.len(), owner, 0)
}

// ── Image ───────────────────────────────────────────────────────────────────

/// An in-memory image plus the layout it was built with.
pub struct Image {
    dev: Arc<MemBlockDevice>,
    sb: Superblock,
    geo: FsGeometry,
    spec: ImageSpec,
    layouts: Vec<AgLayout>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("spec", &self.spec)
            .field("written_blocks", &self.dev.written_blocks())
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Format a fresh image.
    pub fn build(cx: &Cx, spec: &ImageSpec) -> Result<Self> {
        let sb = spec.superblock()?;
        let geo = sb.geometry().context("image geometry")?;
        let dev = MemBlockDevice::new(spec.block_size, geo.dblocks)
            .context("in-memory device")?;
        let mut image = Self {
            dev: Arc::new(dev),
            sb,
            geo,
            spec: spec.clone(),
            layouts: Vec::new(),
        };
        let sb_block = image.sb.to_block(image.block_len())?;
        for agno in 0..geo.agcount {
            image.write(cx, agno, SB_AGBNO, &sb_block)?;
            let layout = image
                .format_ag(cx, agno)
                .with_context(|| format!("formatting AG {agno}"))?;
            image.layouts.push(layout);
        }
        info!(
            agcount = geo.agcount,
            agblocks = geo.agblocks,
            block_size = geo.block_size,
            features = %image.sb.features_ro_compat,
            written = image.dev.written_blocks(),
            "image_built"
        );
        Ok(image)
    }

    fn block_len(&self) -> usize {
        self.geo.block_size as usize
    }

    fn format_ag(&self, cx: &Cx, agno: u32) -> Result<AgLayout> {
        let spec = &self.spec;
        let (leaf, node) = (spec.leaf_fill, spec.node_fill);
        let nfree = spec.free_extents as usize;
        let nchunks = spec.inode_chunks as usize;
        let nshared = if spec.reflink {
            spec.shared_extents as usize
        } else {
            0
        };
        let free_chunks = (0..nchunks).filter(|i| i % 2 == 1).count();
        let capacity = Agfl::capacity(self.block_len());
        ensure!(
            spec.agfl_blocks as usize <= capacity,
            "{} free list blocks but only {capacity} slots",
            spec.agfl_blocks
        );

        let mut reserve = Reserve {
            next: FIRST_DATA_AGBNO.0,
        };
        let bno_at = reserve.take(tree_blocks(nfree, leaf, node))?;
        let cnt_at = reserve.take(tree_blocks(nfree, leaf, node))?;
        let ino_at = reserve.take(tree_blocks(nchunks, leaf, node))?;
        let fino_at = if spec.finobt {
            Some(reserve.take(tree_blocks(free_chunks, leaf, node))?)
        } else {
            None
        };
        let refc_at = if spec.reflink {
            Some(reserve.take(tree_blocks(nshared, leaf, node))?)
        } else {
            None
        };
        let agfl_at = reserve.take(spec.agfl_blocks as usize)?;
        let nrmaps = 4
            + usize::from(spec.finobt)
            + usize::from(spec.reflink)
            + usize::from(spec.agfl_blocks > 0)
            + nchunks
            + 2 * nshared;
        let rmap_at = if spec.rmapbt {
            Some(reserve.take(tree_blocks(nrmaps + 1, leaf, node))?)
        } else {
            None
        };

        let chunk_blocks = INODES_PER_CHUNK / self.geo.inodes_per_block;
        reserve.align(chunk_blocks);
        let mut chunks = Vec::with_capacity(nchunks);
        for i in 0..nchunks {
            let start = reserve.take(chunk_blocks as usize)?;
            let free = if i % 2 == 1 { u64::MAX << 48 } else { 0 };
            chunks.push(InodeRec {
                startino: start * self.geo.inodes_per_block,
                freecount: free.count_ones(),
                free,
            });
        }
        let mut shared = Vec::with_capacity(nshared);
        for _ in 0..nshared {
            shared.push(RefcountRec {
                startblock: reserve.take(2)?,
                blockcount: 2,
                refcount: 2,
            });
        }
        let mut free = Vec::with_capacity(nfree);
        for i in 0..nfree {
            reserve.take(1)?;
            let len = i % 5 + 1;
            free.push(AllocRec {
                startblock: reserve.take(len)?,
                blockcount: u32::try_from(len).context("extent length")?,
            });
        }
        let eoag = self.geo.ag_block_count(AgNumber(agno));
        ensure!(
            reserve.next <= eoag,
            "layout needs {} blocks but the AG holds {eoag}",
            reserve.next
        );

        let bno = self.write_tree::<BnoFormat>(cx, agno, bno_at, &free)?;
        let mut by_size = free.clone();
        by_size.sort_by_key(|r| (r.blockcount, r.startblock));
        let cnt = self.write_tree::<CntFormat>(cx, agno, cnt_at, &by_size)?;
        let ino = self.write_tree::<InoFormat>(cx, agno, ino_at, &chunks)?;
        let fino = match fino_at {
            Some(at) => {
                let partial: Vec<InodeRec> =
                    chunks.iter().filter(|c| c.freecount > 0).copied().collect();
                Some(self.write_tree::<FinoFormat>(cx, agno, at, &partial)?)
            }
            None => None,
        };
        let refcount = match refc_at {
            Some(at) => Some(self.write_tree::<RefcFormat>(cx, agno, at, &shared)?),
            None => None,
        };
        let agfl: Vec<u32> = (agfl_at..agfl_at + spec.agfl_blocks).collect();

        let mut rmaps = vec![mapping(0, FIRST_DATA_AGBNO.0 as usize, RmapOwner::FS, 0)?];
        rmaps.push(tree_mapping(&bno, RmapOwner::AG)?);
        rmaps.push(tree_mapping(&cnt, RmapOwner::AG)?);
        rmaps.push(tree_mapping(&ino, RmapOwner::INOBT)?);
        if let Some(tree) = &fino {
            rmaps.push(tree_mapping(tree, RmapOwner::INOBT)?);
        }
        if let Some(tree) = &refcount {
            rmaps.push(tree_mapping(tree, RmapOwner::REFC)?);
        }
        if !agfl.is_empty() {
            rmaps.push(mapping(agfl_at, agfl.len(), RmapOwner::AG, 0)?);
        }
        if let Some(at) = rmap_at {
            let len = tree_blocks(nrmaps + 1, leaf, node);
            rmaps.push(mapping(at, len, RmapOwner::AG, 0)?);
        }
        for chunk in &chunks {
            let start = self.geo.agino_to_agbno(chunk.startino).0;
            rmaps.push(mapping(start, chunk_blocks as usize, RmapOwner::INODES, 0)?);
        }
        for (i, rec) in shared.iter().enumerate() {
            let offset = u64::try_from(2 * i)?;
            rmaps.push(mapping(rec.startblock, 2, SHARED_OWNER_INO, offset)?);
            rmaps.push(mapping(rec.startblock, 2, SHARED_OWNER_INO + 1, offset)?);
        }
        let rmap = match rmap_at {
            Some(at) => Some(self.write_tree::<RmapFormat>(cx, agno, at, &rmaps)?),
            None => None,
        };

        let flcount = spec.agfl_blocks;
        let agf = Agf {
            versionnum: 1,
            seqno: agno,
            length: eoag,
            bno_root: bno.root,
            cnt_root: cnt.root,
            rmap_root: rmap.as_ref().map_or(NULL_AGBNO, |t| t.root),
            bno_level: u32::try_from(bno.nlevels)?,
            cnt_level: u32::try_from(cnt.nlevels)?,
            rmap_level: rmap.as_ref().map_or(Ok(0), |t| u32::try_from(t.nlevels))?,
            flfirst: 0,
            fllast: flcount.saturating_sub(1),
            flcount,
            freeblks: free.iter().map(|r| r.blockcount).sum(),
            longest: free.iter().map(|r| r.blockcount).max().unwrap_or(0),
            btreeblks: u32::try_from(
                bno.blocks.len() + cnt.blocks.len() + rmap.as_ref().map_or(0, |t| t.blocks.len()),
            )?
            .saturating_sub(2 + u32::from(rmap.is_some())),
            uuid: self.sb.uuid,
            refcount_root: refcount.as_ref().map_or(NULL_AGBNO, |t| t.root),
            refcount_level: refcount.as_ref().map_or(Ok(0), |t| u32::try_from(t.nlevels))?,
            crc: 0,
        };
        let agi = Agi {
            versionnum: 1,
            seqno: agno,
            length: eoag,
            count: u32::try_from(nchunks)? * INODES_PER_CHUNK,
            root: ino.root,
            level: u32::try_from(ino.nlevels)?,
            freecount: chunks.iter().map(|c| c.freecount).sum(),
            newino: chunks.first().map_or(NULL_AGBNO, |c| c.startino),
            dirino: NULL_AGBNO,
            uuid: self.sb.uuid,
            free_root: fino.as_ref().map_or(NULL_AGBNO, |t| t.root),
            free_level: fino.as_ref().map_or(Ok(0), |t| u32::try_from(t.nlevels))?,
            crc: 0,
        };
        self.put_agf(cx, &agf)?;
        self.put_agi(cx, &agi)?;
        let header = Agfl {
            seqno: agno,
            uuid: self.sb.uuid,
            bno: agfl.clone(),
            crc: 0,
        };
        self.write(cx, agno, AGFL_AGBNO, &header.to_block(self.block_len())?)?;

        debug!(
            agno,
            used = reserve.next,
            free = free.len(),
            chunks = chunks.len(),
            rmaps = rmaps.len(),
            "ag_formatted"
        );
        Ok(AgLayout {
            agno,
            bno,
            cnt,
            ino,
            fino,
            refcount,
            rmap,
            agfl,
            free,
            chunks,
            shared,
            rmaps,
        })
    }

    /// Bulk-load `recs` into a tree of AG `agno`, blocks allocated upward
    /// from `first`.
    pub fn write_tree<F: RecordFormat>(
        &self,
        cx: &Cx,
        agno: u32,
        first: u32,
        recs: &[F::Rec],
    ) -> Result<TreeInfo> {
        let (leaf_fill, node_fill) = (self.spec.leaf_fill.max(1), self.spec.node_fill.max(2));
        let mut next = first;
        let mut written = Vec::new();
        let mut bodies: Vec<BtreeBody<F>> = if recs.is_empty() {
            vec![BtreeBody::Leaf { recs: Vec::new() }]
        } else {
            recs.chunks(leaf_fill)
                .map(|c| BtreeBody::Leaf { recs: c.to_vec() })
                .collect()
        };
        let leaf_count = bodies.len();
        let mut level: u16 = 0;
        loop {
            let count = u32::try_from(bodies.len())?;
            let base = next;
            next += count;
            let mut summaries: Vec<(F::Key, F::Key, BtreePtr)> = Vec::new();
            for (i, body) in (0..count).zip(bodies) {
                let agbno = base + i;
                let left = if i > 0 {
                    BtreePtr::Short(agbno - 1)
                } else {
                    BtreePtr::null(F::LONG_PTRS)
                };
                let right = if i + 1 < count {
                    BtreePtr::Short(agbno + 1)
                } else {
                    BtreePtr::null(F::LONG_PTRS)
                };
                let block = BtreeBlock::<F> {
                    header: BtreeHeader {
                        magic: F::ID.magic(),
                        level,
                        numrecs: 0,
                        leftsib: left,
                        rightsib: right,
                        blkno: self.fsb(agno, agbno).0,
                        owner: u64::from(agno),
                        crc: 0,
                    },
                    body,
                };
                let bytes = block
                    .encode(self.block_len())
                    .with_context(|| format!("encoding {} block {agbno}", F::ID))?;
                self.write(cx, agno, AgBlock(agbno), &bytes)?;
                written.push(agbno);
                if let (Some(low), Some(high)) = (block.low_key(), block.block_high_key()) {
                    summaries.push((low, high, BtreePtr::Short(agbno)));
                }
            }
            if count == 1 {
                return Ok(TreeInfo {
                    root: base,
                    nlevels: usize::from(level) + 1,
                    blocks: written,
                    leaf_count,
                });
            }
            level += 1;
            bodies = summaries
                .chunks(node_fill)
                .map(|c| BtreeBody::Node {
                    keys: c.iter().map(|s| s.0).collect(),
                    high_keys: if F::OVERLAPPING {
                        c.iter().map(|s| s.1).collect()
                    } else {
                        Vec::new()
                    },
                    ptrs: c.iter().map(|s| s.2).collect(),
                })
                .collect();
        }
    }

    // ── Access ──────────────────────────────────────────────────────────────

    #[must_use]
    pub fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    #[must_use]
    pub fn layouts(&self) -> &[AgLayout] {
        &self.layouts
    }

    pub fn layout(&self, agno: u32) -> Result<&AgLayout> {
        self.layouts
            .get(agno as usize)
            .with_context(|| format!("no AG {agno} in this image"))
    }

    #[must_use]
    pub fn device(&self) -> Arc<dyn BlockDevice> {
        Arc::clone(&self.dev) as Arc<dyn BlockDevice>
    }

    pub fn mount(&self, cx: &Cx) -> Result<ScrubMount> {
        ScrubMount::open(cx, self.device()).context("mounting in-memory image")
    }

    /// A cursor over one of this image's trees.
    #[must_use]
    pub fn cursor<F: RecordFormat>(&self, agno: u32, tree: &TreeInfo) -> BtreeCursor<AgBtree<F>> {
        BtreeCursor::new(AgBtree::new(
            self.device(),
            self.geo,
            AgNumber(agno),
            AgBlock(tree.root),
            tree.nlevels,
        ))
    }

    #[must_use]
    pub fn fsb(&self, agno: u32, agbno: u32) -> BlockNumber {
        self.geo.agb_to_fsb(AgNumber(agno), AgBlock(agbno))
    }

    pub fn read(&self, cx: &Cx, agno: u32, agbno: AgBlock) -> Result<Vec<u8>> {
        let buf = self.dev.read_block(cx, self.fsb(agno, agbno.0))?;
        Ok(buf.into_inner())
    }

    /// Write raw bytes; checksums are left exactly as given.
    pub fn write(&self, cx: &Cx, agno: u32, agbno: AgBlock, bytes: &[u8]) -> Result<()> {
        self.dev
            .write_block(cx, self.fsb(agno, agbno.0), bytes)
            .with_context(|| format!("writing AG {agno} block {}", agbno.0))
    }

    // ── Damage ──────────────────────────────────────────────────────────────

    /// Decode a btree block, change it and write it back with a fresh
    /// checksum.
    pub fn edit_tree_block<F: RecordFormat>(
        &self,
        cx: &Cx,
        agno: u32,
        agbno: u32,
        edit: impl FnOnce(&mut BtreeBlock<F>),
    ) -> Result<()> {
        let bytes = self.read(cx, agno, AgBlock(agbno))?;
        let mut block = BtreeBlock::<F>::decode(&bytes)
            .with_context(|| format!("decoding {} block {agbno}", F::ID))?;
        edit(&mut block);
        self.write(cx, agno, AgBlock(agbno), &block.encode(self.block_len())?)
    }

    pub fn edit_agf(&self, cx: &Cx, agno: u32, edit: impl FnOnce(&mut Agf)) -> Result<()> {
        let mut agf = Agf::parse(&self.read(cx, agno, AGF_AGBNO)?)?;
        edit(&mut agf);
        self.put_agf(cx, &agf)
    }

    pub fn edit_agi(&self, cx: &Cx, agno: u32, edit: impl FnOnce(&mut Agi)) -> Result<()> {
        let mut agi = Agi::parse(&self.read(cx, agno, AGI_AGBNO)?)?;
        edit(&mut agi);
        self.put_agi(cx, &agi)
    }

    /// Rewrite the superblock copy of one AG. AG 0 holds the primary.
    pub fn edit_superblock(
        &self,
        cx: &Cx,
        agno: u32,
        edit: impl FnOnce(&mut Superblock),
    ) -> Result<()> {
        let mut sb = Superblock::parse(&self.read(cx, agno, SB_AGBNO)?)?;
        edit(&mut sb);
        self.write(cx, agno, SB_AGBNO, &sb.to_block(self.block_len())?)
    }

    fn put_agf(&self, cx: &Cx, agf: &Agf) -> Result<()> {
        self.write(cx, agf.seqno, AGF_AGBNO, &agf.to_block(self.block_len())?)
    }

    fn put_agi(&self, cx: &Cx, agi: &Agi) -> Result<()> {
        self.write(cx, agi.seqno, AGI_AGBNO, &agi.to_block(self.block_len())?)
    }

    // ── Files ───────────────────────────────────────────────────────────────

    /// Write the image out to `path`, replacing whatever is there.
    pub fn save(&self, cx: &Cx, path: &Path) -> Result<()> {
        let len = self.geo.dblocks * u64::from(self.geo.block_size);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("creating {}", path.display()))?;
        file.set_len(len)
            .with_context(|| format!("sizing {}", path.display()))?;
        drop(file);
        let dst = FileByteDevice::open(path)?;
        self.dev
            .copy_to(cx, &dst)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), len, "image_saved");
        Ok(())
    }
}

/// Open an image file for scrubbing. The block size comes from the
/// primary superblock.
pub fn open_image(cx: &Cx, path: &Path) -> Result<ScrubMount> {
    let file = FileByteDevice::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut head = vec![0_u8; MIN_BLOCK_SIZE as usize];
    file.read_exact_at(cx, 0, &mut head)
        .with_context(|| format!("reading the superblock of {}", path.display()))?;
    let sb = Superblock::parse(&head).context("primary superblock")?;
    let dev = ByteBlockDevice::new(file, sb.block_size)
        .with_context(|| format!("{} is not a whole number of blocks", path.display()))?;
    ScrubMount::open(cx, Arc::new(dev)).with_context(|| format!("mounting {}", path.display()))
}
