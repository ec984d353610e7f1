//! Walker for directory and attribute hash btrees.
//!
//! These trees live in an inode fork and are addressed by fork-relative
//! logical block. Keys are 32-bit name hashes and may repeat, so ordering is
//! checked as non-decreasing. The tree has no stored height: the root node
//! reports its own level and every descent must land exactly one level
//! lower.
//!
//! Depth in this module counts from the root (depth 0), the opposite of the
//! generic walker's leaf-relative levels.

use crate::check::{Axis, Fork, Location, absorb_cancel};
use crate::context::{ScrubContext, ScrubMount};
use crate::cx_checkpoint;
use asupersync::Cx;
use fscrub_btree::WalkControl;
use fscrub_error::{Result, ScrubError};
use fscrub_ondisk::da::{
    DA_CRC_OFFSET, DA_NODE_MAXDEPTH, DaBlockInfo, dir_free_dablk, dir_leaf_dablk,
};
use fscrub_ondisk::{DaBody, DaEntry, DaTreeBlock, corruption, verify_crc};
use fscrub_types::{BlockNumber, DaBlock, InodeNumber};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Translates fork-relative blocks to filesystem blocks.
pub trait DaBlockMap {
    /// `None` when nothing is mapped at `dablk`.
    fn map_block(&self, cx: &Cx, dablk: DaBlock) -> Result<Option<BlockNumber>>;
}

impl DaBlockMap for BTreeMap<DaBlock, BlockNumber> {
    fn map_block(&self, _cx: &Cx, dablk: DaBlock) -> Result<Option<BlockNumber>> {
        Ok(self.get(&dablk).copied())
    }
}

/// Storage format of an inode fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkFormat {
    /// Contents stored inline in the inode; there is no tree.
    Local,
    Extents,
    Btree,
}

pub struct DaTarget<'a> {
    pub ino: InodeNumber,
    pub fork: Fork,
    pub format: ForkFormat,
    pub map: &'a dyn DaBlockMap,
}

/// One leaf entry handed to a record checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaRecord {
    pub ino: InodeNumber,
    pub fork: Fork,
    pub dablk: DaBlock,
    pub depth: usize,
    pub index: usize,
    pub magic: u16,
    pub entry: DaEntry,
}

impl DaRecord {
    #[must_use]
    pub fn location(&self) -> Location {
        Location::DaTree {
            ino: self.ino.0,
            fork: self.fork,
            level: self.depth,
            dablk: self.dablk.0,
        }
    }
}

struct PathSlot {
    dablk: DaBlock,
    block: DaTreeBlock,
    index: usize,
}

impl PathSlot {
    fn entry(&self) -> Option<DaEntry> {
        self.block.entries().get(self.index).copied()
    }
}

fn is_node(block: &DaTreeBlock) -> bool {
    matches!(block.body, DaBody::Node { .. })
}

fn read_da_block(
    cx: &Cx,
    mount: &ScrubMount,
    target: &DaTarget<'_>,
    dablk: DaBlock,
) -> Result<Option<DaTreeBlock>> {
    let Some(fsb) = target.map.map_block(cx, dablk)? else {
        return Ok(None);
    };
    let buf = mount.device().read_block(cx, fsb)?;
    if mount.has_crc() {
        verify_crc(buf.as_slice(), DA_CRC_OFFSET, fsb)?;
    }
    let block = DaTreeBlock::decode(buf.as_slice()).map_err(|err| corruption(fsb, &err))?;
    if mount.has_crc() && block.info.blkno != fsb.0 {
        return Err(ScrubError::Corruption {
            block: fsb.0,
            detail: format!("da block claims to live at {}", block.info.blkno),
        });
    }
    trace!(dablk = dablk.0, block = fsb.0, magic = block.info.magic, "da_block_read");
    Ok(Some(block))
}

struct DaWalk<'t, 'a> {
    target: &'t DaTarget<'a>,
    lowest: DaBlock,
    highest: Option<DaBlock>,
    /// Last hash seen at each depth.
    hashes: [u32; DA_NODE_MAXDEPTH],
    /// Node level the block at the current depth must report.
    tree_level: usize,
    path: Vec<PathSlot>,
}

impl DaWalk<'_, '_> {
    fn location(&self, depth: usize, dablk: DaBlock) -> Location {
        Location::DaTree {
            ino: self.target.ino.0,
            fork: self.target.fork,
            level: depth,
            dablk: dablk.0,
        }
    }

    /// Read the block at `dablk` into the path at `depth` and run the
    /// per-block checks. Returns `false` when the walk cannot go on.
    fn visit(
        &mut self,
        cx: &Cx,
        sc: &mut ScrubContext<'_>,
        depth: usize,
        dablk: DaBlock,
    ) -> Result<bool> {
        let location = self.location(depth, dablk);
        sc.outcome.check(
            dablk >= self.lowest && self.highest.is_none_or(|high| dablk < high),
            Axis::Corrupt,
            &location,
            "da pointer outside the tree's block range",
        );

        let read = read_da_block(cx, sc.mount, self.target, dablk);
        let Some(found) = sc.outcome.op_result(read, &location)? else {
            return Ok(false);
        };
        let Some(block) = found else {
            if self.target.fork == Fork::Data && depth == 0 {
                debug!(ino = self.target.ino.0, "da_tree_absent");
                return Ok(false);
            }
            sc.outcome.set(Axis::Corrupt, &location, "da block not mapped");
            return Ok(false);
        };

        if sc.mount.has_crc()
            && !sc.outcome.check(
                block.info.owner == self.target.ino.0,
                Axis::Corrupt,
                &location,
                &format!("owned by inode {}", block.info.owner),
            )
        {
            return Ok(false);
        }

        let info = block.info;
        self.path.truncate(depth);
        self.path.push(PathSlot {
            dablk,
            block,
            index: 0,
        });
        self.check_siblings(cx, sc, depth, &info)?;

        let Some(slot) = self.path.get(depth) else {
            return Ok(false);
        };
        match &slot.block.body {
            DaBody::AttrLeaf { .. } | DaBody::DirLeafN { .. } | DaBody::DirLeaf1 { .. } => {
                sc.outcome.check(
                    self.tree_level == 0,
                    Axis::Corrupt,
                    &location,
                    "leaf block above level 0",
                );
            }
            DaBody::Node { level, .. } => {
                let level = usize::from(*level);
                if depth == 0 {
                    if !sc.outcome.check(
                        level < DA_NODE_MAXDEPTH,
                        Axis::Corrupt,
                        &location,
                        &format!("root level {level} too deep"),
                    ) {
                        return Ok(false);
                    }
                    self.tree_level = level;
                } else if !sc.outcome.check(
                    self.tree_level == level,
                    Axis::Corrupt,
                    &location,
                    &format!("node level {level} where {} expected", self.tree_level),
                ) {
                    return Ok(false);
                }
            }
            DaBody::Unknown => {
                sc.outcome.set(
                    Axis::Corrupt,
                    &location,
                    format!("unrecognised magic {:#06x}", info.magic),
                );
                self.path.truncate(depth);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn check_siblings(
        &mut self,
        cx: &Cx,
        sc: &mut ScrubContext<'_>,
        depth: usize,
        info: &DaBlockInfo,
    ) -> Result<()> {
        let Some(dablk) = self.path.get(depth).map(|s| s.dablk) else {
            return Ok(());
        };
        let location = self.location(depth, dablk);
        if depth == 0 {
            sc.outcome.check(
                info.forw == 0 && info.back == 0,
                Axis::Corrupt,
                &location,
                "root block has siblings",
            );
            return Ok(());
        }
        self.check_sibling(cx, sc, depth, info.back, false, &location)?;
        self.check_sibling(cx, sc, depth, info.forw, true, &location)
    }

    fn check_sibling(
        &self,
        cx: &Cx,
        sc: &mut ScrubContext<'_>,
        depth: usize,
        sibling: u32,
        forward: bool,
        location: &Location,
    ) -> Result<()> {
        if sibling == 0 {
            return Ok(());
        }
        let shifted = self.path_shift(cx, sc.mount, depth, forward);
        let Some(neighbour) = sc.outcome.op_result(shifted, location)? else {
            return Ok(());
        };
        let Some(neighbour) = neighbour else {
            sc.outcome.set(
                Axis::Corrupt,
                location,
                format!("sibling {sibling} but no neighbour at this depth"),
            );
            return Ok(());
        };
        sc.outcome.check(
            neighbour == DaBlock(sibling),
            Axis::Corrupt,
            location,
            &format!("sibling {sibling} but the neighbour is {neighbour}"),
        );
        Ok(())
    }

    /// Block a copy of the path reaches at `depth` after moving one entry
    /// left or right there. `None` at the edge of the tree.
    fn path_shift(
        &self,
        cx: &Cx,
        mount: &ScrubMount,
        depth: usize,
        forward: bool,
    ) -> Result<Option<DaBlock>> {
        let mut pivot = depth;
        let entry = loop {
            if pivot == 0 {
                return Ok(None);
            }
            pivot -= 1;
            let Some(slot) = self.path.get(pivot) else {
                return Ok(None);
            };
            let count = slot.block.entries().len();
            let index = if forward {
                (slot.index + 1 < count).then_some(slot.index + 1)
            } else {
                slot.index.checked_sub(1)
            };
            if let Some(index) = index {
                break slot.block.entries().get(index).copied();
            }
        };

        let mut entry = entry;
        let mut at = pivot + 1;
        loop {
            let Some(DaEntry::Node { before, .. }) = entry else {
                return Err(ScrubError::Corruption {
                    block: 0,
                    detail: format!("no node entry above depth {at}"),
                });
            };
            if at == depth {
                return Ok(Some(DaBlock(before)));
            }
            let block = read_da_block(cx, mount, self.target, DaBlock(before))?.ok_or_else(|| {
                ScrubError::Corruption {
                    block: u64::from(before),
                    detail: "da block not mapped".into(),
                }
            })?;
            let entries = block.entries();
            entry = if forward {
                entries.first().copied()
            } else {
                entries.last().copied()
            };
            at += 1;
        }
    }

    fn check_hash(&mut self, sc: &mut ScrubContext<'_>, depth: usize, hash: u32) {
        let Some(slot) = self.path.get(depth) else {
            return;
        };
        let location = self.location(depth, slot.dablk);
        if let Some(last) = self.hashes.get_mut(depth) {
            sc.outcome
                .check(hash >= *last, Axis::Corrupt, &location, "hash out of order");
            *last = hash;
        }
        if depth == 0 {
            return;
        }
        if let Some(parent) = self.path.get(depth - 1).and_then(PathSlot::entry) {
            sc.outcome.check(
                hash <= parent.hashval(),
                Axis::Corrupt,
                &location,
                "hash above its parent hash",
            );
        }
    }
}

/// Walk the hash btree in one fork of `target.ino`.
///
/// Forks stored inline have no tree and return at once, as does a directory
/// whose data fork has no hashed index. Each leaf entry is handed to
/// `callback` after its hash has been checked.
pub fn scrub_da_btree<'m, Cb>(
    cx: &Cx,
    sc: &mut ScrubContext<'m>,
    target: &DaTarget<'_>,
    mut callback: Cb,
) -> Result<()>
where
    Cb: FnMut(&mut ScrubContext<'m>, &DaRecord) -> Result<WalkControl>,
{
    if target.format == ForkFormat::Local {
        return Ok(());
    }
    let block_size = sc.mount.geometry().block_size;
    let (lowest, highest) = match target.fork {
        Fork::Attr => (DaBlock(0), None),
        Fork::Data => (
            dir_leaf_dablk(block_size),
            Some(dir_free_dablk(block_size)),
        ),
    };
    let mut ds = DaWalk {
        target,
        lowest,
        highest,
        hashes: [0; DA_NODE_MAXDEPTH],
        tree_level: 0,
        path: Vec::with_capacity(DA_NODE_MAXDEPTH),
    };
    let top = ds.location(0, lowest);
    let walked = walk(cx, sc, &mut ds, &mut callback);
    absorb_cancel(&mut sc.outcome, walked, &top).map(|_| ())
}

fn walk<'m, Cb>(
    cx: &Cx,
    sc: &mut ScrubContext<'m>,
    ds: &mut DaWalk<'_, '_>,
    callback: &mut Cb,
) -> Result<()>
where
    Cb: FnMut(&mut ScrubContext<'m>, &DaRecord) -> Result<WalkControl>,
{
    if !ds.visit(cx, sc, 0, ds.lowest)? {
        return Ok(());
    }
    let mut depth = 0;
    while depth < DA_NODE_MAXDEPTH {
        let Some(slot) = ds.path.get(depth) else {
            break;
        };
        let Some(entry) = slot.entry() else {
            // End of block: pop towards the root.
            if depth == 0 {
                break;
            }
            depth -= 1;
            ds.tree_level += 1;
            if let Some(parent) = ds.path.get_mut(depth) {
                parent.index += 1;
            }
            continue;
        };
        let (dablk, index, magic, leaf) = (
            slot.dablk,
            slot.index,
            slot.block.info.magic,
            !is_node(&slot.block),
        );
        ds.check_hash(sc, depth, entry.hashval());

        if leaf {
            let record = DaRecord {
                ino: ds.target.ino,
                fork: ds.target.fork,
                dablk,
                depth,
                index,
                magic,
                entry,
            };
            if callback(sc, &record)? == WalkControl::Stop {
                break;
            }
            cx_checkpoint(cx)?;
            if let Some(slot) = ds.path.get_mut(depth) {
                slot.index += 1;
            }
            continue;
        }

        let DaEntry::Node { before, .. } = entry else {
            break;
        };
        depth += 1;
        ds.tree_level = ds.tree_level.saturating_sub(1);
        if !ds.visit(cx, sc, depth, DaBlock(before))? {
            break;
        }
    }
    Ok(())
}
