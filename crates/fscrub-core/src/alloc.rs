//! Record checkers for the per-AG btrees.
//!
//! Each scrubber borrows its cursor out of the invocation's AG context for
//! the walk and hands it back afterwards, so the record checker can reach
//! the other oracle cursors through the same context.

use crate::btree_scrub::{RecordSite, scrub_btree};
use crate::check::{Axis, Location};
use crate::context::ScrubContext;
use asupersync::Cx;
use fscrub_btree::WalkControl;
use fscrub_error::Result;
use fscrub_ondisk::records::{AllocRec, INODES_PER_CHUNK, InodeRec, RefcountRec, RmapRec};
use fscrub_ondisk::{AGFL_AGBNO, FIRST_DATA_AGBNO, RmapOwner};
use fscrub_types::{AgNumber, FsGeometry};

/// `[start, start + len)` is non-empty and lies past the headers, inside
/// the AG.
fn extent_ok(geo: &FsGeometry, agno: AgNumber, start: u32, len: u32) -> bool {
    let end = u64::from(start) + u64::from(len);
    len > 0 && start >= FIRST_DATA_AGBNO.0 && end <= u64::from(geo.ag_block_count(agno))
}

fn agno_of(sc: &ScrubContext<'_>) -> AgNumber {
    sc.sa.agno.unwrap_or(AgNumber(sc.request.agno))
}

// ── Free space ──────────────────────────────────────────────────────────────

fn check_alloc_rec(sc: &mut ScrubContext<'_>, site: &RecordSite, rec: &AllocRec) {
    let geo = *sc.mount.geometry();
    let agno = agno_of(sc);
    sc.outcome.check(
        extent_ok(&geo, agno, rec.startblock, rec.blockcount),
        Axis::Corrupt,
        &site.location(),
        &format!(
            "free extent {}+{} outside the AG",
            rec.startblock, rec.blockcount
        ),
    );
}

/// The other free-space tree must index exactly the same extent.
fn xref_other_alloc(
    cx: &Cx,
    sc: &mut ScrubContext<'_>,
    location: &Location,
    rec: &AllocRec,
    by_size: bool,
) -> Result<()> {
    let found = if by_size {
        match sc.sa.cnt_cur.as_mut() {
            Some(cur) => cur.lookup_le(cx, rec),
            None => return Ok(()),
        }
    } else {
        match sc.sa.bno_cur.as_mut() {
            Some(cur) => cur.lookup_le(cx, rec),
            None => return Ok(()),
        }
    };
    let found = if by_size {
        sc.outcome.xref_result(found, &mut sc.sa.cnt_cur, location)?
    } else {
        sc.outcome.xref_result(found, &mut sc.sa.bno_cur, location)?
    };
    if let Some(found) = found {
        let tree = if by_size { "by-size" } else { "by-block" };
        sc.outcome.check(
            found == Some(*rec),
            Axis::XrefCorrupt,
            location,
            &format!("{tree} tree does not hold this extent"),
        );
    }
    Ok(())
}

/// Walk the free-space-by-block tree.
pub(crate) fn scrub_bnobt(cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
    let Some(mut cur) = sc.sa.bno_cur.take() else {
        return Ok(());
    };
    let walked = scrub_btree(cx, sc, &mut cur, RmapOwner::AG, |sc, site, rec| {
        check_alloc_rec(sc, site, rec);
        xref_other_alloc(cx, sc, &site.location(), rec, true)?;
        Ok(WalkControl::Continue)
    });
    sc.sa.bno_cur = Some(cur);
    walked
}

/// Walk the free-space-by-size tree.
pub(crate) fn scrub_cntbt(cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
    let Some(mut cur) = sc.sa.cnt_cur.take() else {
        return Ok(());
    };
    let walked = scrub_btree(cx, sc, &mut cur, RmapOwner::AG, |sc, site, rec| {
        check_alloc_rec(sc, site, rec);
        xref_other_alloc(cx, sc, &site.location(), rec, false)?;
        Ok(WalkControl::Continue)
    });
    sc.sa.cnt_cur = Some(cur);
    walked
}

// ── Inode chunks ────────────────────────────────────────────────────────────

fn check_inode_rec(sc: &mut ScrubContext<'_>, site: &RecordSite, rec: &InodeRec) {
    let geo = *sc.mount.geometry();
    let agno = agno_of(sc);
    let location = site.location();
    let first = geo.agino_to_agbno(rec.startino);
    let last = rec
        .startino
        .checked_add(INODES_PER_CHUNK - 1)
        .map(|agino| geo.agino_to_agbno(agino));
    let in_ag = last.is_some_and(|last| {
        extent_ok(&geo, agno, first.0, last.0.saturating_sub(first.0) + 1)
    });
    sc.outcome.check(
        in_ag && rec.startino % INODES_PER_CHUNK == 0,
        Axis::Corrupt,
        &location,
        &format!("inode chunk {} outside the AG", rec.startino),
    );
    sc.outcome.check(
        rec.freecount <= INODES_PER_CHUNK && rec.freecount == rec.free.count_ones(),
        Axis::Corrupt,
        &location,
        &format!(
            "free count {} but {} free bits",
            rec.freecount,
            rec.free.count_ones()
        ),
    );
}

pub(crate) fn scrub_inobt(cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
    let Some(mut cur) = sc.sa.ino_cur.take() else {
        return Ok(());
    };
    let walked = scrub_btree(cx, sc, &mut cur, RmapOwner::INOBT, |sc, site, rec| {
        check_inode_rec(sc, site, rec);
        Ok(WalkControl::Continue)
    });
    sc.sa.ino_cur = Some(cur);
    walked
}

pub(crate) fn scrub_finobt(cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
    let Some(mut cur) = sc.sa.fino_cur.take() else {
        return Ok(());
    };
    let walked = scrub_btree(cx, sc, &mut cur, RmapOwner::INOBT, |sc, site, rec| {
        check_inode_rec(sc, site, rec);
        sc.outcome.check(
            rec.freecount > 0,
            Axis::Corrupt,
            &site.location(),
            "free inode index lists a full chunk",
        );
        Ok(WalkControl::Continue)
    });
    sc.sa.fino_cur = Some(cur);
    walked
}

// ── Reverse mappings ────────────────────────────────────────────────────────

fn check_rmap_rec(sc: &mut ScrubContext<'_>, site: &RecordSite, rec: &RmapRec) {
    let geo = *sc.mount.geometry();
    let agno = agno_of(sc);
    let location = site.location();
    if rec.owner == RmapOwner::FS {
        // The static headers are the only blocks below the first data block.
        sc.outcome.check(
            rec.startblock == 0 && rec.blockcount == AGFL_AGBNO.0 + 1,
            Axis::Corrupt,
            &location,
            "filesystem owner does not cover exactly the AG headers",
        );
    } else {
        sc.outcome.check(
            extent_ok(&geo, agno, rec.startblock, rec.blockcount),
            Axis::Corrupt,
            &location,
            &format!(
                "mapping {}+{} outside the AG",
                rec.startblock, rec.blockcount
            ),
        );
    }
    if RmapOwner::is_special(rec.owner) {
        sc.outcome.check(
            rec.offset == 0,
            Axis::Corrupt,
            &location,
            "special owner with a file offset",
        );
    }
    sc.outcome.check(
        rec.owner != RmapOwner::NULL && rec.owner != RmapOwner::UNKNOWN,
        Axis::Corrupt,
        &location,
        &format!("invalid owner {:#x}", rec.owner),
    );
}

pub(crate) fn scrub_rmapbt(cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
    let Some(mut cur) = sc.sa.rmap_cur.take() else {
        return Ok(());
    };
    let walked = scrub_btree(cx, sc, &mut cur, RmapOwner::AG, |sc, site, rec| {
        check_rmap_rec(sc, site, rec);
        Ok(WalkControl::Continue)
    });
    sc.sa.rmap_cur = Some(cur);
    walked
}

// ── Reference counts ────────────────────────────────────────────────────────

fn check_refcount_rec(sc: &mut ScrubContext<'_>, site: &RecordSite, rec: &RefcountRec) {
    let geo = *sc.mount.geometry();
    let agno = agno_of(sc);
    let location = site.location();
    sc.outcome.check(
        extent_ok(&geo, agno, rec.startblock, rec.blockcount),
        Axis::Corrupt,
        &location,
        &format!(
            "shared extent {}+{} outside the AG",
            rec.startblock, rec.blockcount
        ),
    );
    sc.outcome
        .check(rec.refcount > 0, Axis::Corrupt, &location, "zero reference count");
}

pub(crate) fn scrub_refcountbt(cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
    let Some(mut cur) = sc.sa.refc_cur.take() else {
        return Ok(());
    };
    let walked = scrub_btree(cx, sc, &mut cur, RmapOwner::REFC, |sc, site, rec| {
        check_refcount_rec(sc, site, rec);
        Ok(WalkControl::Continue)
    });
    sc.sa.refc_cur = Some(cur);
    walked
}
