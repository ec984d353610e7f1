#![forbid(unsafe_code)]
//! Generic btree access for scrubbing.
//!
//! A btree type plugs in through [`BtreeOps`]: where the root is, how tall
//! the tree is, which pointers are legal and who should own each block.
//! [`BtreeCursor`] builds positioned navigation (sibling moves, lookups,
//! range queries) on top of that contract and the block codec in
//! `fscrub-ondisk`.
//!
//! Cursor levels are numbered from the leaves: level 0 holds records,
//! level `nlevels - 1` holds the root. Indices within a block are 0-based.

use asupersync::Cx;
use fscrub_block::BlockDevice;
use fscrub_error::{Result, ScrubError};
use fscrub_ondisk::btree::{BTREE_MAX_LEVELS, crc_offset};
use fscrub_ondisk::{
    BtreeBlock, BtreeId, BtreePtr, FIRST_DATA_AGBNO, RecordFormat, corruption, verify_crc,
};
use fscrub_types::{
    AgBlock, AgNumber, BlockNumber, FsGeometry, InodeNumber, describe_flags, format_flags,
};
use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::trace;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| ScrubError::Cancelled)
}

// ── Flags ───────────────────────────────────────────────────────────────────

/// Shape of a btree type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BtreeFlags(pub u32);

impl BtreeFlags {
    pub const LONG_PTRS: Self = Self(0x0001);
    /// Root block lives in an inode fork rather than on disk.
    pub const ROOT_IN_INODE: Self = Self(0x0002);
    pub const OVERLAPPING: Self = Self(0x0004);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "LONG_PTRS"),
        (0x0002, "ROOT_IN_INODE"),
        (0x0004, "OVERLAPPING"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    fn of<F: RecordFormat>(root_in_inode: bool) -> Self {
        let mut bits = 0;
        if F::LONG_PTRS {
            bits |= Self::LONG_PTRS.0;
        }
        if root_in_inode {
            bits |= Self::ROOT_IN_INODE.0;
        }
        if F::OVERLAPPING {
            bits |= Self::OVERLAPPING.0;
        }
        Self(bits)
    }
}

impl fmt::Display for BtreeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Returned by per-record callbacks to continue or end an iteration early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    Stop,
}

// ── Per-tree contract ───────────────────────────────────────────────────────

/// What a btree type must provide for generic navigation and checking.
pub trait BtreeOps: Clone + Send + Sync {
    type Format: RecordFormat;

    fn device(&self) -> &dyn BlockDevice;
    fn geometry(&self) -> &FsGeometry;

    /// Height recorded by whoever points at the root.
    fn nlevels(&self) -> usize;

    fn max_levels(&self) -> usize {
        BTREE_MAX_LEVELS
    }

    /// Value every block header's owner field must hold.
    fn owner(&self) -> u64;

    /// On-disk root pointer, or `None` when the root lives in an inode.
    fn root_ptr(&self) -> Option<BtreePtr>;

    /// In-memory root block of an inode-rooted tree.
    fn inode_root(&self) -> Option<Arc<BtreeBlock<Self::Format>>> {
        None
    }

    fn ptr_to_fsb(&self, ptr: BtreePtr) -> Option<BlockNumber>;

    /// Whether `ptr` may address a block of this tree at all.
    fn verify_ptr(&self, ptr: BtreePtr) -> bool;

    fn id(&self) -> BtreeId {
        Self::Format::ID
    }

    fn flags(&self) -> BtreeFlags {
        BtreeFlags::of::<Self::Format>(self.root_ptr().is_none())
    }

    /// Read, checksum, decode and self-check the block at `ptr`, expected to
    /// sit at `level`.
    fn read_block(
        &self,
        cx: &Cx,
        ptr: BtreePtr,
        level: usize,
    ) -> Result<Arc<BtreeBlock<Self::Format>>> {
        let fsb = match self.ptr_to_fsb(ptr) {
            Some(fsb) if self.verify_ptr(ptr) => fsb,
            _ => {
                return Err(ScrubError::Corruption {
                    block: ptr.raw(),
                    detail: format!("{} pointer out of range", self.id()),
                });
            }
        };
        let buf = self.device().read_block(cx, fsb)?;
        verify_crc(buf.as_slice(), crc_offset(Self::Format::LONG_PTRS), fsb)?;
        let block = BtreeBlock::<Self::Format>::decode(buf.as_slice())
            .map_err(|err| corruption(fsb, &err))?;
        check_block_header(self, &block, fsb, level)?;
        trace!(
            btree = %self.id(),
            block = fsb.0,
            level,
            numrecs = block.numrecs(),
            "btree_block_read"
        );
        Ok(Arc::new(block))
    }
}

fn check_block_header<O: BtreeOps + ?Sized>(
    ops: &O,
    block: &BtreeBlock<O::Format>,
    fsb: BlockNumber,
    level: usize,
) -> Result<()> {
    let fail = |detail: String| ScrubError::Corruption {
        block: fsb.0,
        detail,
    };
    if usize::from(block.level()) != level {
        return Err(fail(format!(
            "level {} where {level} expected",
            block.level()
        )));
    }
    if block.header.blkno != fsb.0 {
        return Err(fail(format!(
            "block claims to live at {}",
            block.header.blkno
        )));
    }
    if block.header.owner != ops.owner() {
        return Err(fail(format!(
            "owner {} where {} expected",
            block.header.owner,
            ops.owner()
        )));
    }
    Ok(())
}

// ── AG-rooted trees ─────────────────────────────────────────────────────────

/// A btree rooted in an AG header.
pub struct AgBtree<F: RecordFormat> {
    dev: Arc<dyn BlockDevice>,
    geo: FsGeometry,
    agno: AgNumber,
    root: AgBlock,
    nlevels: usize,
    _format: PhantomData<fn() -> F>,
}

impl<F: RecordFormat> AgBtree<F> {
    #[must_use]
    pub fn new(
        dev: Arc<dyn BlockDevice>,
        geo: FsGeometry,
        agno: AgNumber,
        root: AgBlock,
        nlevels: usize,
    ) -> Self {
        Self {
            dev,
            geo,
            agno,
            root,
            nlevels,
            _format: PhantomData,
        }
    }

    #[must_use]
    pub fn agno(&self) -> AgNumber {
        self.agno
    }
}

impl<F: RecordFormat> Clone for AgBtree<F> {
    fn clone(&self) -> Self {
        Self {
            dev: Arc::clone(&self.dev),
            geo: self.geo,
            agno: self.agno,
            root: self.root,
            nlevels: self.nlevels,
            _format: PhantomData,
        }
    }
}

impl<F: RecordFormat> fmt::Debug for AgBtree<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgBtree")
            .field("btree", &F::ID)
            .field("agno", &self.agno)
            .field("root", &self.root)
            .field("nlevels", &self.nlevels)
            .finish_non_exhaustive()
    }
}

impl<F: RecordFormat> BtreeOps for AgBtree<F> {
    type Format = F;

    fn device(&self) -> &dyn BlockDevice {
        self.dev.as_ref()
    }

    fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    fn nlevels(&self) -> usize {
        self.nlevels
    }

    fn owner(&self) -> u64 {
        u64::from(self.agno.0)
    }

    fn root_ptr(&self) -> Option<BtreePtr> {
        Some(BtreePtr::Short(self.root.0))
    }

    fn ptr_to_fsb(&self, ptr: BtreePtr) -> Option<BlockNumber> {
        match ptr {
            BtreePtr::Short(agbno) => Some(self.geo.agb_to_fsb(self.agno, AgBlock(agbno))),
            BtreePtr::Long(_) => None,
        }
    }

    fn verify_ptr(&self, ptr: BtreePtr) -> bool {
        match ptr {
            BtreePtr::Short(agbno) => {
                !ptr.is_null()
                    && agbno >= FIRST_DATA_AGBNO.0
                    && self.geo.verify_agbno(self.agno, AgBlock(agbno))
            }
            BtreePtr::Long(_) => false,
        }
    }
}

// ── Inode-rooted trees ──────────────────────────────────────────────────────

/// A btree whose root block is embedded in an inode fork.
pub struct InodeBtree<F: RecordFormat> {
    dev: Arc<dyn BlockDevice>,
    geo: FsGeometry,
    ino: InodeNumber,
    root: Arc<BtreeBlock<F>>,
}

impl<F: RecordFormat> InodeBtree<F> {
    #[must_use]
    pub fn new(
        dev: Arc<dyn BlockDevice>,
        geo: FsGeometry,
        ino: InodeNumber,
        root: BtreeBlock<F>,
    ) -> Self {
        Self {
            dev,
            geo,
            ino,
            root: Arc::new(root),
        }
    }
}

impl<F: RecordFormat> Clone for InodeBtree<F> {
    fn clone(&self) -> Self {
        Self {
            dev: Arc::clone(&self.dev),
            geo: self.geo,
            ino: self.ino,
            root: Arc::clone(&self.root),
        }
    }
}

impl<F: RecordFormat> BtreeOps for InodeBtree<F> {
    type Format = F;

    fn device(&self) -> &dyn BlockDevice {
        self.dev.as_ref()
    }

    fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    fn nlevels(&self) -> usize {
        usize::from(self.root.level()) + 1
    }

    fn owner(&self) -> u64 {
        self.ino.0
    }

    fn root_ptr(&self) -> Option<BtreePtr> {
        None
    }

    fn inode_root(&self) -> Option<Arc<BtreeBlock<F>>> {
        Some(Arc::clone(&self.root))
    }

    fn ptr_to_fsb(&self, ptr: BtreePtr) -> Option<BlockNumber> {
        match ptr {
            BtreePtr::Long(fsb) => Some(BlockNumber(fsb)),
            BtreePtr::Short(_) => None,
        }
    }

    fn verify_ptr(&self, ptr: BtreePtr) -> bool {
        match ptr {
            BtreePtr::Long(fsb) => {
                !ptr.is_null()
                    && self.geo.verify_fsbno(BlockNumber(fsb))
                    && self.geo.fsb_to_agbno(BlockNumber(fsb)) >= FIRST_DATA_AGBNO
            }
            BtreePtr::Short(_) => false,
        }
    }
}

// ── Cursor ──────────────────────────────────────────────────────────────────

struct CursorLevel<F: RecordFormat> {
    block: Option<Arc<BtreeBlock<F>>>,
    index: usize,
}

impl<F: RecordFormat> Clone for CursorLevel<F> {
    fn clone(&self) -> Self {
        Self {
            block: self.block.clone(),
            index: self.index,
        }
    }
}

/// Position in a btree: one `(block, index)` slot per level.
///
/// Cloning a cursor duplicates its position; blocks are shared.
pub struct BtreeCursor<O: BtreeOps> {
    ops: O,
    levels: Vec<CursorLevel<O::Format>>,
}

impl<O: BtreeOps> Clone for BtreeCursor<O> {
    fn clone(&self) -> Self {
        Self {
            ops: self.ops.clone(),
            levels: self.levels.clone(),
        }
    }
}

impl<O: BtreeOps> fmt::Debug for BtreeCursor<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path: Vec<(Option<u64>, usize)> = self
            .levels
            .iter()
            .map(|l| (l.block.as_ref().map(|b| b.header.blkno), l.index))
            .collect();
        f.debug_struct("BtreeCursor")
            .field("btree", &self.ops.id())
            .field("path", &path)
            .finish()
    }
}

impl<O: BtreeOps> BtreeCursor<O> {
    /// Unpositioned cursor. Inode-rooted trees have their root installed.
    pub fn new(ops: O) -> Self {
        let nlevels = ops.nlevels();
        let mut levels = vec![
            CursorLevel {
                block: None,
                index: 0,
            };
            nlevels
        ];
        if let (Some(root), Some(top)) = (ops.inode_root(), levels.last_mut()) {
            top.block = Some(root);
        }
        Self { ops, levels }
    }

    #[must_use]
    pub fn ops(&self) -> &O {
        &self.ops
    }

    #[must_use]
    pub fn nlevels(&self) -> usize {
        self.levels.len()
    }

    #[must_use]
    pub fn block(&self, level: usize) -> Option<&Arc<BtreeBlock<O::Format>>> {
        self.levels.get(level).and_then(|l| l.block.as_ref())
    }

    #[must_use]
    pub fn index(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, |l| l.index)
    }

    pub fn set_index(&mut self, level: usize, index: usize) {
        if let Some(slot) = self.levels.get_mut(level) {
            slot.index = index;
        }
    }

    /// Install `block` at `level`, positioned on its first entry.
    pub fn set_block(&mut self, level: usize, block: Arc<BtreeBlock<O::Format>>) {
        if let Some(slot) = self.levels.get_mut(level) {
            slot.block = Some(block);
            slot.index = 0;
        }
    }

    /// Record under the leaf slot.
    #[must_use]
    pub fn get_rec(&self) -> Option<<O::Format as RecordFormat>::Rec> {
        self.block(0)
            .and_then(|b| b.rec(self.index(0)))
            .copied()
    }

    fn load_root(&mut self, cx: &Cx) -> Result<Arc<BtreeBlock<O::Format>>> {
        let top = self.nlevels().checked_sub(1).ok_or_else(|| {
            ScrubError::Corruption {
                block: 0,
                detail: format!("{} has no levels", self.ops.id()),
            }
        })?;
        if let Some(root) = self.ops.inode_root() {
            self.set_block(top, Arc::clone(&root));
            return Ok(root);
        }
        let ptr = self
            .ops
            .root_ptr()
            .unwrap_or_else(|| BtreePtr::null(O::Format::LONG_PTRS));
        let root = self.ops.read_block(cx, ptr, top)?;
        self.set_block(top, Arc::clone(&root));
        Ok(root)
    }

    fn child_ptr(&self, level: usize) -> Result<BtreePtr> {
        self.block(level)
            .and_then(|b| b.ptr(self.index(level)))
            .ok_or_else(|| ScrubError::Corruption {
                block: self.block(level).map_or(0, |b| b.header.blkno),
                detail: format!("no child pointer at level {level}"),
            })
    }

    /// Move to the next entry at `level`, crossing into the right neighbour
    /// block if needed. Returns `false` at the right edge of the tree.
    pub fn increment(&mut self, cx: &Cx, level: usize) -> Result<bool> {
        self.shift(cx, level, true)
    }

    /// Move to the previous entry at `level`. Returns `false` at the left
    /// edge of the tree.
    pub fn decrement(&mut self, cx: &Cx, level: usize) -> Result<bool> {
        self.shift(cx, level, false)
    }

    fn shift(&mut self, cx: &Cx, level: usize, forward: bool) -> Result<bool> {
        cx_checkpoint(cx)?;
        let mut lev = level;
        loop {
            let Some(block) = self.block(lev) else {
                return Ok(false);
            };
            let index = self.index(lev);
            let can_move = if forward {
                index + 1 < block.numrecs()
            } else {
                index > 0
            };
            if can_move {
                self.set_index(lev, if forward { index + 1 } else { index - 1 });
                break;
            }
            lev += 1;
            if lev >= self.nlevels() {
                return Ok(false);
            }
        }
        while lev > level {
            let ptr = self.child_ptr(lev)?;
            lev -= 1;
            let child = self.ops.read_block(cx, ptr, lev)?;
            let index = if forward {
                0
            } else {
                child.numrecs().saturating_sub(1)
            };
            self.set_block(lev, child);
            self.set_index(lev, index);
        }
        Ok(true)
    }

    /// Position on the last record whose key is `<= key` and return it.
    pub fn lookup_le(
        &mut self,
        cx: &Cx,
        key: &<O::Format as RecordFormat>::Key,
    ) -> Result<Option<<O::Format as RecordFormat>::Rec>> {
        let mut block = self.load_root(cx)?;
        let mut level = self.nlevels() - 1;
        loop {
            cx_checkpoint(cx)?;
            let found = (0..block.numrecs())
                .take_while(|&i| {
                    block
                        .key(i)
                        .is_some_and(|k| O::Format::cmp_keys(&k, key) != Ordering::Greater)
                })
                .last();
            let Some(index) = found else {
                return Ok(None);
            };
            self.set_index(level, index);
            if level == 0 {
                return Ok(block.rec(index).copied());
            }
            let ptr = self.child_ptr(level)?;
            level -= 1;
            block = self.ops.read_block(cx, ptr, level)?;
            self.set_block(level, Arc::clone(&block));
        }
    }

    /// Call `f` for every record whose key range intersects `[low, high]`.
    ///
    /// Does not disturb the cursor position.
    pub fn query_range<Cb>(
        &self,
        cx: &Cx,
        low: &<O::Format as RecordFormat>::Key,
        high: &<O::Format as RecordFormat>::Key,
        mut f: Cb,
    ) -> Result<WalkControl>
    where
        Cb: FnMut(&<O::Format as RecordFormat>::Rec) -> Result<WalkControl>,
    {
        let top = self.nlevels().saturating_sub(1);
        let root = match self.ops.inode_root() {
            Some(root) => root,
            None => {
                let ptr = self
                    .ops
                    .root_ptr()
                    .unwrap_or_else(|| BtreePtr::null(O::Format::LONG_PTRS));
                self.ops.read_block(cx, ptr, top)?
            }
        };
        self.query_block(cx, &root, top, low, high, &mut f)
    }

    fn query_block<Cb>(
        &self,
        cx: &Cx,
        block: &BtreeBlock<O::Format>,
        level: usize,
        low: &<O::Format as RecordFormat>::Key,
        high: &<O::Format as RecordFormat>::Key,
        f: &mut Cb,
    ) -> Result<WalkControl>
    where
        Cb: FnMut(&<O::Format as RecordFormat>::Rec) -> Result<WalkControl>,
    {
        cx_checkpoint(cx)?;
        let count = block.numrecs();
        for i in 0..count {
            let Some(key) = block.key(i) else { break };
            if O::Format::cmp_keys(&key, high) == Ordering::Greater {
                break;
            }
            let below_range = if O::Format::OVERLAPPING || level == 0 {
                block
                    .high_key(i)
                    .is_some_and(|hk| O::Format::cmp_keys(&hk, low) == Ordering::Less)
            } else {
                // Subtree i ends where subtree i + 1 begins.
                block
                    .key(i + 1)
                    .is_some_and(|next| O::Format::cmp_keys(&next, low) != Ordering::Greater)
            };
            if below_range {
                continue;
            }
            if level == 0 {
                if let Some(rec) = block.rec(i) {
                    if f(rec)? == WalkControl::Stop {
                        return Ok(WalkControl::Stop);
                    }
                }
                continue;
            }
            let Some(ptr) = block.ptr(i) else { break };
            let child = self.ops.read_block(cx, ptr, level - 1)?;
            if self.query_block(cx, &child, level - 1, low, high, f)? == WalkControl::Stop {
                return Ok(WalkControl::Stop);
            }
        }
        Ok(WalkControl::Continue)
    }

    /// Whether any record intersects `[low, high]`.
    pub fn has_record(
        &self,
        cx: &Cx,
        low: &<O::Format as RecordFormat>::Key,
        high: &<O::Format as RecordFormat>::Key,
    ) -> Result<bool> {
        let mut found = false;
        self.query_range(cx, low, high, |_| {
            found = true;
            Ok(WalkControl::Stop)
        })?;
        Ok(found)
    }
}
