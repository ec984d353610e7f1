//! Generic btree walk.
//!
//! [`scrub_btree`] visits every block of a tree exactly once without
//! recursion, using the cursor's per-level `(block, index)` slots as the
//! path stack. At each block it checks ownership and sibling linkage; at
//! each slot it checks ordering against the previous slot of that level and
//! containment in the parent's key range. Leaf records are then handed to
//! the caller's record checker.
//!
//! The cursor's parent index keeps pointing at the child being walked until
//! that child is exhausted, so parent keys and sibling checks always see the
//! slot that led to the current block.

use crate::ag::AgContext;
use crate::check::{Axis, Location, ScrubOutcome, absorb_cancel};
use crate::context::ScrubContext;
use crate::cx_checkpoint;
use crate::owner::{OwnerCheckQueue, xref_block_owner};
use asupersync::Cx;
use fscrub_btree::{BtreeCursor, BtreeOps, WalkControl};
use fscrub_error::{Result, ScrubError};
use fscrub_ondisk::{BtreeBlock, BtreeId, BtreePtr, RecordFormat};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::trace;

/// Where a leaf record handed to a record checker lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSite {
    pub btree: BtreeId,
    /// Filesystem block of the leaf.
    pub block: u64,
    pub index: usize,
}

impl RecordSite {
    #[must_use]
    pub fn location(&self) -> Location {
        Location::Btree {
            btree: self.btree,
            level: 0,
            block: self.block,
            index: self.index,
        }
    }
}

struct WalkState<F: RecordFormat> {
    btree: BtreeId,
    owner: u64,
    lastrec: Option<F::Rec>,
    lastkey: Vec<Option<F::Key>>,
    owner_checks: OwnerCheckQueue,
}

fn block_addr<O: BtreeOps>(ops: &O, ptr: BtreePtr) -> u64 {
    ops.ptr_to_fsb(ptr).map_or(ptr.raw(), |fsb| fsb.0)
}

fn here<F: RecordFormat>(
    btree: BtreeId,
    level: usize,
    block: &BtreeBlock<F>,
    index: usize,
) -> Location {
    Location::Btree {
        btree,
        level,
        block: block.header.blkno,
        index,
    }
}

fn ptr_ok<O: BtreeOps>(
    outcome: &mut ScrubOutcome,
    ops: &O,
    location: &Location,
    ptr: BtreePtr,
) -> bool {
    outcome.check(
        ops.verify_ptr(ptr),
        Axis::Corrupt,
        location,
        &format!("pointer {ptr} out of range"),
    )
}

/// Walk every block and record of the tree under `cur`.
///
/// `owner` is the reverse-mapping owner every block of the tree must carry.
/// `callback` sees each leaf record once, in key order; returning
/// [`WalkControl::Stop`] ends the walk early without error, and an error
/// aborts it. Findings go to `sc.outcome`. Cancellation through `cx` is
/// polled after every record and ends the walk with INCOMPLETE set.
pub fn scrub_btree<'m, O, Cb>(
    cx: &Cx,
    sc: &mut ScrubContext<'m>,
    cur: &mut BtreeCursor<O>,
    owner: u64,
    mut callback: Cb,
) -> Result<()>
where
    O: BtreeOps,
    Cb: FnMut(
        &mut ScrubContext<'m>,
        &RecordSite,
        &<O::Format as RecordFormat>::Rec,
    ) -> Result<WalkControl>,
{
    let btree = cur.ops().id();
    let nlevels = cur.nlevels();
    let top = Location::Btree {
        btree,
        level: nlevels.saturating_sub(1),
        block: cur.ops().root_ptr().map_or(0, |ptr| block_addr(cur.ops(), ptr)),
        index: 0,
    };
    if !sc.outcome.check(
        (1..=cur.ops().max_levels()).contains(&nlevels),
        Axis::Corrupt,
        &top,
        &format!("tree height {nlevels} out of range"),
    ) {
        return Ok(());
    }

    let mut state = WalkState::<O::Format> {
        btree,
        owner,
        lastrec: None,
        lastkey: vec![None; nlevels],
        owner_checks: OwnerCheckQueue::new(),
    };
    let walked = walk(cx, sc, cur, &mut state, &mut callback);
    let (pending, cancelled) = match absorb_cancel(&mut sc.outcome, walked, &top) {
        Ok(Some(())) => (Ok(()), false),
        Ok(None) => (Ok(()), true),
        Err(err) => (Err(err), false),
    };
    trace!(
        btree = %btree,
        deferred = state.owner_checks.len(),
        cancelled,
        flags = %sc.outcome.flags,
        "btree_walk_done"
    );
    state
        .owner_checks
        .drain(cx, sc, btree, owner, pending, cancelled)
}

fn walk<'m, O, Cb>(
    cx: &Cx,
    sc: &mut ScrubContext<'m>,
    cur: &mut BtreeCursor<O>,
    st: &mut WalkState<O::Format>,
    callback: &mut Cb,
) -> Result<()>
where
    O: BtreeOps,
    Cb: FnMut(
        &mut ScrubContext<'m>,
        &RecordSite,
        &<O::Format as RecordFormat>::Rec,
    ) -> Result<WalkControl>,
{
    let nlevels = cur.nlevels();
    let top = nlevels - 1;

    match cur.ops().inode_root() {
        Some(root) => {
            cur.set_block(top, Arc::clone(&root));
            check_siblings(cx, sc, cur, st, top, &root)?;
        }
        None => {
            let ptr = cur
                .ops()
                .root_ptr()
                .unwrap_or_else(|| BtreePtr::null(O::Format::LONG_PTRS));
            let location = Location::Btree {
                btree: st.btree,
                level: nlevels,
                block: block_addr(cur.ops(), ptr),
                index: 0,
            };
            if !ptr_ok(&mut sc.outcome, cur.ops(), &location, ptr) {
                return Ok(());
            }
            if !visit_block(cx, sc, cur, st, top, ptr)? {
                return Ok(());
            }
        }
    }

    let mut level = top;
    while level < nlevels {
        let Some(block) = cur.block(level).cloned() else {
            break;
        };
        let index = cur.index(level);

        if index >= block.numrecs() {
            if level + 1 < nlevels {
                cur.set_index(level + 1, cur.index(level + 1) + 1);
            }
            level += 1;
            continue;
        }

        if level == 0 {
            check_rec(sc, cur, st, &block, index);
            if let Some(rec) = block.rec(index) {
                let site = RecordSite {
                    btree: st.btree,
                    block: block.header.blkno,
                    index,
                };
                if callback(sc, &site, rec)? == WalkControl::Stop {
                    trace!(btree = %st.btree, block = site.block, index, "btree_walk_stopped");
                    break;
                }
            }
            cx_checkpoint(cx)?;
            cur.set_index(0, index + 1);
            continue;
        }

        check_key(sc, cur, st, &block, level, index);
        let location = here(st.btree, level, &block, index);
        let Some(ptr) = block.ptr(index) else {
            cur.set_index(level, index + 1);
            continue;
        };
        if !ptr_ok(&mut sc.outcome, cur.ops(), &location, ptr) {
            cur.set_index(level, index + 1);
            continue;
        }
        if !visit_block(cx, sc, cur, st, level - 1, ptr)? {
            break;
        }
        level -= 1;
    }
    Ok(())
}

/// Load the block at `ptr` into the cursor at `level` and run the per-block
/// checks. Returns `false` if the block could not be loaded.
fn visit_block<O: BtreeOps>(
    cx: &Cx,
    sc: &mut ScrubContext<'_>,
    cur: &mut BtreeCursor<O>,
    st: &mut WalkState<O::Format>,
    level: usize,
    ptr: BtreePtr,
) -> Result<bool> {
    let location = Location::Btree {
        btree: st.btree,
        level,
        block: block_addr(cur.ops(), ptr),
        index: 0,
    };
    let read = cur.ops().read_block(cx, ptr, level);
    let Some(block) = sc.outcome.op_result(read, &location)? else {
        return Ok(false);
    };
    cur.set_block(level, Arc::clone(&block));
    check_owner(cx, sc, cur.ops(), st, level, ptr)?;
    check_siblings(cx, sc, cur, st, level, &block)?;
    Ok(true)
}

fn check_owner<O: BtreeOps>(
    cx: &Cx,
    sc: &mut ScrubContext<'_>,
    ops: &O,
    st: &mut WalkState<O::Format>,
    level: usize,
    ptr: BtreePtr,
) -> Result<()> {
    let Some(fsb) = ops.ptr_to_fsb(ptr) else {
        return Ok(());
    };
    if st.btree.is_own_oracle() {
        st.owner_checks.defer(fsb, level);
        return Ok(());
    }
    let geo = ops.geometry();
    let agno = geo.fsb_to_agno(fsb);
    let agbno = geo.fsb_to_agbno(fsb);
    let location = Location::Btree {
        btree: st.btree,
        level,
        block: fsb.0,
        index: 0,
    };
    if O::Format::LONG_PTRS {
        let mut xsa = AgContext::acquire_xref(cx, sc.mount, &mut sc.locks, agno)?;
        let checked = xref_block_owner(cx, &mut sc.outcome, &mut xsa, agbno, st.owner, &location);
        xsa.release(&mut sc.locks);
        checked
    } else {
        xref_block_owner(cx, &mut sc.outcome, &mut sc.sa, agbno, st.owner, &location)
    }
}

fn check_siblings<O: BtreeOps>(
    cx: &Cx,
    sc: &mut ScrubContext<'_>,
    cur: &BtreeCursor<O>,
    st: &WalkState<O::Format>,
    level: usize,
    block: &BtreeBlock<O::Format>,
) -> Result<()> {
    let location = here(st.btree, level, block, 0);
    let left = block.header.leftsib;
    let right = block.header.rightsib;
    if level + 1 == cur.nlevels() {
        sc.outcome.check(
            left.is_null() && right.is_null(),
            Axis::Corrupt,
            &location,
            "root block has siblings",
        );
        return Ok(());
    }
    check_sibling(cx, sc, cur, st, level, left, false, &location)?;
    check_sibling(cx, sc, cur, st, level, right, true, &location)
}

/// Compare one sibling pointer against the neighbour a duplicate cursor
/// finds by moving one slot at the parent level.
#[allow(clippy::too_many_arguments)]
fn check_sibling<O: BtreeOps>(
    cx: &Cx,
    sc: &mut ScrubContext<'_>,
    cur: &BtreeCursor<O>,
    st: &WalkState<O::Format>,
    level: usize,
    sibling: BtreePtr,
    forward: bool,
    location: &Location,
) -> Result<()> {
    let parent = level + 1;
    let mut ncur = cur.clone();
    let shifted = if forward {
        ncur.increment(cx, parent)
    } else {
        ncur.decrement(cx, parent)
    };
    let parent_location = Location::Btree {
        btree: st.btree,
        level: parent,
        block: cur.block(parent).map_or(0, |b| b.header.blkno),
        index: cur.index(parent),
    };

    let Some(moved) = sibling_shift(&mut sc.outcome, shifted, &parent_location)? else {
        return Ok(());
    };
    if sibling.is_null() {
        if moved {
            sc.outcome.set(
                Axis::Corrupt,
                location,
                if forward {
                    "null right sibling but the parent level continues"
                } else {
                    "null left sibling but the parent level has a predecessor"
                },
            );
        }
        return Ok(());
    }

    if !sc.outcome.check(
        moved,
        Axis::Corrupt,
        &parent_location,
        &format!("sibling {sibling} has no counterpart at the parent level"),
    ) {
        return Ok(());
    }
    let Some(pp) = ncur.block(parent).and_then(|b| b.ptr(ncur.index(parent))) else {
        return Ok(());
    };
    let neighbour_location = Location::Btree {
        btree: st.btree,
        level: parent,
        block: ncur.block(parent).map_or(0, |b| b.header.blkno),
        index: ncur.index(parent),
    };
    if !ptr_ok(&mut sc.outcome, ncur.ops(), &neighbour_location, pp) {
        return Ok(());
    }
    sc.outcome.check(
        pp == sibling,
        Axis::Corrupt,
        location,
        &format!("sibling {sibling} but the parent level points at {pp}"),
    );
    Ok(())
}

/// Sort the duplicate cursor's move. A corrupt neighbour is a finding; any
/// other failure to reach it leaves the sibling unverified and the walk
/// goes on. Cancellation and lock-order retries still propagate.
fn sibling_shift(
    outcome: &mut ScrubOutcome,
    shifted: Result<bool>,
    location: &Location,
) -> Result<Option<bool>> {
    match shifted {
        Ok(moved) => Ok(Some(moved)),
        Err(err) if err.is_corruption() => outcome.op_result(Err(err), location),
        Err(err) if err.is_retryable() || matches!(err, ScrubError::Cancelled) => Err(err),
        Err(err) => {
            outcome.set(
                Axis::Incomplete,
                location,
                format!("sibling could not be verified: {err}"),
            );
            Ok(None)
        }
    }
}

/// Ordering against the previous record and containment in the parent key.
fn check_rec<O: BtreeOps>(
    sc: &mut ScrubContext<'_>,
    cur: &BtreeCursor<O>,
    st: &mut WalkState<O::Format>,
    block: &BtreeBlock<O::Format>,
    index: usize,
) {
    let Some(rec) = block.rec(index).copied() else {
        return;
    };
    let location = here(st.btree, 0, block, index);
    if let Some(last) = st.lastrec {
        sc.outcome.check(
            <O::Format as RecordFormat>::recs_inorder(&last, &rec),
            Axis::Corrupt,
            &location,
            "record out of order",
        );
    }
    st.lastrec = Some(rec);

    if cur.nlevels() == 1 {
        return;
    }
    let Some(parent) = cur.block(1) else {
        return;
    };
    let pindex = cur.index(1);
    let parent_location = here(st.btree, 1, parent, pindex);
    let key = <O::Format as RecordFormat>::key_from_rec(&rec);
    if let Some(pkey) = parent.key(pindex) {
        sc.outcome.check(
            <O::Format as RecordFormat>::cmp_keys(&key, &pkey) != Ordering::Less,
            Axis::Corrupt,
            &parent_location,
            "record below its parent key",
        );
    }
    if !<O::Format as RecordFormat>::OVERLAPPING {
        return;
    }
    let hkey = <O::Format as RecordFormat>::high_key_from_rec(&rec);
    if let Some(phigh) = parent.high_key(pindex) {
        sc.outcome.check(
            <O::Format as RecordFormat>::cmp_keys(&phigh, &hkey) != Ordering::Less,
            Axis::Corrupt,
            &parent_location,
            "record extends past its parent high key",
        );
    }
}

/// The node-level counterpart of [`check_rec`].
fn check_key<O: BtreeOps>(
    sc: &mut ScrubContext<'_>,
    cur: &BtreeCursor<O>,
    st: &mut WalkState<O::Format>,
    block: &BtreeBlock<O::Format>,
    level: usize,
    index: usize,
) {
    let Some(key) = block.key(index) else {
        return;
    };
    let location = here(st.btree, level, block, index);
    if let Some(Some(last)) = st.lastkey.get(level) {
        sc.outcome.check(
            <O::Format as RecordFormat>::keys_inorder(last, &key),
            Axis::Corrupt,
            &location,
            "key out of order",
        );
    }
    if let Some(slot) = st.lastkey.get_mut(level) {
        *slot = Some(key);
    }

    let Some(parent) = cur.block(level + 1) else {
        return;
    };
    let pindex = cur.index(level + 1);
    if let Some(pkey) = parent.key(pindex) {
        sc.outcome.check(
            <O::Format as RecordFormat>::cmp_keys(&key, &pkey) != Ordering::Less,
            Axis::Corrupt,
            &location,
            "key below its parent key",
        );
    }
    if !<O::Format as RecordFormat>::OVERLAPPING {
        return;
    }
    if let (Some(high), Some(phigh)) = (block.high_key(index), parent.high_key(pindex)) {
        sc.outcome.check(
            <O::Format as RecordFormat>::cmp_keys(&phigh, &high) != Ordering::Less,
            Axis::Corrupt,
            &location,
            "high key above its parent high key",
        );
    }
}
