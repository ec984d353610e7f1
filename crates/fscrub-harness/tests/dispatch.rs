#![forbid(unsafe_code)]

use asupersync::Cx;
use fscrub_core::{
    AgContext, AgLockSet, AgTarget, Axis, HeaderKind, Location, RetryPolicy, ScrubContext,
    ScrubFlags, ScrubOps, ScrubOptions, ScrubRequest, ScrubType, run_scrub, scrub_metadata,
};
use fscrub_error::{Result, ScrubError};
use fscrub_harness::{Image, ImageSpec, scrub_all};
use fscrub_ondisk::records::{CntFormat, RmapFormat};
use fscrub_ondisk::{AGF_AGBNO, AGFL_AGBNO, AGI_AGBNO, Agfl, RmapOwner};
use fscrub_types::{AgBlock, AgNumber};
use std::cell::Cell;

fn build(spec: &ImageSpec) -> Image {
    Image::build(&Cx::for_testing(), spec).expect("image")
}

fn scrub(image: &Image, scrub_type: ScrubType, agno: u32) -> Result<fscrub_core::ScrubOutcome> {
    let cx = Cx::for_testing();
    let mount = image.mount(&cx).expect("mount");
    scrub_metadata(
        &cx,
        &mount,
        ScrubRequest::for_ag(scrub_type, agno),
        &ScrubOptions::default(),
    )
}

/// Flip one byte of a block without fixing its checksum.
fn smudge(image: &Image, agno: u32, agbno: AgBlock) {
    let cx = Cx::for_testing();
    let mut bytes = image.read(&cx, agno, agbno).expect("read");
    bytes[300] ^= 0xff;
    image.write(&cx, agno, agbno, &bytes).expect("write");
}

// ── Whole-filesystem runs ───────────────────────────────────────────────────

#[test]
fn fresh_image_with_every_feature_is_clean() {
    let image = build(&ImageSpec::all_features());
    let cx = Cx::for_testing();
    let mount = image.mount(&cx).expect("mount");
    let report = scrub_all(&cx, &mount, &ScrubOptions::default());
    assert!(!report.has_problems(), "{report:#?}");
    // Probe once, then ten types in each of four AGs.
    assert_eq!(report.entries.len(), 41);
    assert_eq!(report.clean, 41);
}

#[test]
fn absent_features_are_skipped() {
    let image = build(&ImageSpec::default());
    let cx = Cx::for_testing();
    let mount = image.mount(&cx).expect("mount");
    let report = scrub_all(&cx, &mount, &ScrubOptions::default());
    assert!(!report.has_problems(), "{report:#?}");
    assert_eq!(report.entries.len(), 1 + 7 * 4);
    assert!(report.entries.iter().all(|e| !matches!(
        e.scrub_type,
        ScrubType::Finobt | ScrubType::Rmapbt | ScrubType::Refcountbt
    )));
    assert!(matches!(
        scrub(&image, ScrubType::Rmapbt, 0),
        Err(ScrubError::NotFound(_))
    ));
}

#[test]
fn outcome_serializes_for_reports() {
    let image = build(&ImageSpec::default());
    image
        .edit_superblock(&Cx::for_testing(), 1, |sb| sb.imax_pct = 5)
        .expect("edit");
    let outcome = scrub(&image, ScrubType::Superblock, 1).expect("scrub");
    let json = serde_json::to_value(&outcome).expect("json");
    assert_eq!(json["flags"], serde_json::json!(ScrubFlags::PREEN.bits()));
    assert_eq!(json["findings"][0]["axis"], "preen");
    assert_eq!(json["findings"][0]["location"]["kind"], "header");
}

// ── Request validation ──────────────────────────────────────────────────────

#[test]
fn repair_requests_are_unsupported() {
    let image = build(&ImageSpec::default());
    let cx = Cx::for_testing();
    let mount = image.mount(&cx).expect("mount");
    let mut request = ScrubRequest::for_ag(ScrubType::Bnobt, 0);
    request.flags.insert(ScrubFlags::REPAIR);
    let err = scrub_metadata(&cx, &mount, request, &ScrubOptions::default())
        .expect_err("repair");
    assert!(matches!(err, ScrubError::Unsupported(_)));
}

#[test]
fn group_beyond_the_filesystem_is_invalid() {
    let image = build(&ImageSpec::default());
    let err = scrub(&image, ScrubType::Agf, 4).expect_err("agno");
    assert!(matches!(err, ScrubError::InvalidArgument(_)));
}

// ── Headers ─────────────────────────────────────────────────────────────────

#[test]
fn mirror_with_wrong_group_count_is_corrupt_not_preen() {
    let image = build(&ImageSpec::default());
    image
        .edit_superblock(&Cx::for_testing(), 2, |sb| sb.agcount += 1)
        .expect("edit");
    let outcome = scrub(&image, ScrubType::Superblock, 2).expect("scrub");
    assert!(outcome.has(ScrubFlags::CORRUPT));
    assert!(!outcome.has(ScrubFlags::PREEN));
    assert_eq!(
        outcome.findings[0].location,
        Location::Header {
            agno: 2,
            header: HeaderKind::Superblock
        }
    );
    // Other mirrors are untouched.
    assert!(scrub(&image, ScrubType::Superblock, 3).expect("scrub").is_clean());
}

#[test]
fn damaged_target_header_is_corrupt_but_other_headers_are_withheld() {
    let image = build(&ImageSpec::default());
    smudge(&image, 1, AGI_AGBNO);

    let agi = scrub(&image, ScrubType::Agi, 1).expect("agi scrub");
    assert!(agi.has(ScrubFlags::CORRUPT));
    // The AGF scrub reads the broken AGI too but only withholds it.
    assert!(scrub(&image, ScrubType::Agf, 1).expect("agf scrub").is_clean());
    // A btree scrub needs every header.
    let err = scrub(&image, ScrubType::Inobt, 1).expect_err("inobt setup");
    assert!(err.is_corruption());
}

#[test]
fn withheld_header_leaves_its_cursors_closed() {
    let image = build(&ImageSpec::all_features());
    smudge(&image, 0, AGF_AGBNO);
    let cx = Cx::for_testing();
    let mount = image.mount(&cx).expect("mount");
    let mut locks = AgLockSet::new(&mount);
    let mut sa = AgContext::acquire_xref(&cx, &mount, &mut locks, AgNumber(0)).expect("acquire");
    assert!(sa.agf.is_none());
    assert!(sa.agi.is_some());
    assert!(sa.bno_cur.is_none() && sa.cnt_cur.is_none() && sa.rmap_cur.is_none());
    assert!(sa.ino_cur.is_some() && sa.fino_cur.is_some());
    sa.release(&mut locks);
    assert_eq!(locks.held_count(), 0);
}

#[test]
fn free_list_entry_in_the_headers_is_corrupt() {
    let image = build(&ImageSpec::default());
    let cx = Cx::for_testing();
    let mut agfl = Agfl::parse(&image.read(&cx, 0, AGFL_AGBNO).expect("read")).expect("parse");
    agfl.bno[1] = AGI_AGBNO.0;
    let bytes = agfl
        .to_block(image.geometry().block_size as usize)
        .expect("encode");
    image.write(&cx, 0, AGFL_AGBNO, &bytes).expect("write");

    let outcome = scrub(&image, ScrubType::Agfl, 0).expect("scrub");
    assert_eq!(outcome.count(Axis::Corrupt), 1);
}

#[test]
fn agf_root_past_the_group_is_corrupt() {
    let image = build(&ImageSpec::default());
    let agblocks = image.geometry().agblocks;
    image
        .edit_agf(&Cx::for_testing(), 3, |agf| agf.cnt_root = agblocks)
        .expect("edit");
    let outcome = scrub(&image, ScrubType::Agf, 3).expect("scrub");
    assert!(outcome.has(ScrubFlags::CORRUPT));
    assert!(outcome.findings[0].detail.contains("cntbt"));
}

#[test]
fn agi_free_count_above_count_is_corrupt() {
    let image = build(&ImageSpec::default());
    image
        .edit_agi(&Cx::for_testing(), 0, |agi| agi.freecount = agi.count + 1)
        .expect("edit");
    assert!(scrub(&image, ScrubType::Agi, 0).expect("scrub").is_corrupt());
}

// ── Cross-references ────────────────────────────────────────────────────────

#[test]
fn extent_missing_from_size_tree_is_cross_ref_corrupt() {
    let image = build(&ImageSpec::default());
    let cx = Cx::for_testing();
    let layout = image.layout(1).expect("layout");
    let mut by_size = layout.free.clone();
    by_size.sort_by_key(|r| (r.blockcount, r.startblock));
    by_size.remove(17);
    image
        .write_tree::<CntFormat>(&cx, 1, layout.cnt.blocks[0], &by_size)
        .expect("rebuild");

    let bno = scrub(&image, ScrubType::Bnobt, 1).expect("bnobt");
    assert!(bno.has(ScrubFlags::XCORRUPT));
    assert!(!bno.has(ScrubFlags::CORRUPT));
    assert_eq!(bno.count(Axis::XrefCorrupt), 1);
    // Everything the size tree does hold is in the block tree.
    assert!(scrub(&image, ScrubType::Cntbt, 1).expect("cntbt").is_clean());
}

#[test]
fn tree_block_without_reverse_mapping_is_cross_ref_corrupt() {
    let image = build(&ImageSpec::all_features());
    let cx = Cx::for_testing();
    let layout = image.layout(0).expect("layout");
    let rmap = layout.rmap.clone().expect("rmap tree");
    let cnt_start = layout.cnt.blocks[0];
    let rmaps: Vec<_> = layout
        .rmaps
        .iter()
        .filter(|r| !(r.startblock == cnt_start && r.owner == RmapOwner::AG))
        .copied()
        .collect();
    assert_eq!(rmaps.len() + 1, layout.rmaps.len());
    let rebuilt = image
        .write_tree::<RmapFormat>(&cx, 0, rmap.blocks[0], &rmaps)
        .expect("rebuild");
    assert_eq!(rebuilt.root, rmap.root);

    let cnt = scrub(&image, ScrubType::Cntbt, 0).expect("cntbt");
    assert!(cnt.has(ScrubFlags::XCORRUPT));
    assert!(scrub(&image, ScrubType::Bnobt, 0).expect("bnobt").is_clean());
    assert!(scrub(&image, ScrubType::Rmapbt, 0).expect("rmapbt").is_clean());
}

// ── Locking and retry ───────────────────────────────────────────────────────

#[test]
fn lower_group_after_higher_is_a_deadlock() {
    let image = build(&ImageSpec::default());
    let cx = Cx::for_testing();
    let mount = image.mount(&cx).expect("mount");
    let mut locks = AgLockSet::new(&mount);
    locks.lock(AgNumber(2)).expect("lock 2");
    locks.lock(AgNumber(3)).expect("lock 3");
    let err = locks.lock(AgNumber(1)).expect_err("out of order");
    assert!(matches!(err, ScrubError::Deadlock { wanted: 1, held: 3 }));
    assert!(err.is_retryable());
    locks.lock(AgNumber(2)).expect("re-entry is fine");
}

#[test]
fn context_release_is_idempotent() {
    let image = build(&ImageSpec::default());
    let cx = Cx::for_testing();
    let mount = image.mount(&cx).expect("mount");
    let mut locks = AgLockSet::new(&mount);
    let mut sa =
        AgContext::acquire(&cx, &mount, &mut locks, AgNumber(2), AgTarget::Btree).expect("acquire");
    assert!(sa.is_active());
    assert!(sa.fino_cur.is_none() && sa.rmap_cur.is_none() && sa.refc_cur.is_none());
    assert!(locks.is_held(AgNumber(2)));
    sa.release(&mut locks);
    sa.release(&mut locks);
    assert_eq!(sa.cursor_count(), 0);
    assert!(!sa.is_active());
    assert_eq!(locks.held_count(), 0);
}

/// Reaches back into AG 0 after taking the last AG, as a cross-group check
/// would.
struct BackwardsReach {
    attempts: Cell<u32>,
    conservative: Cell<u32>,
}

impl ScrubOps for BackwardsReach {
    fn setup(&self, _cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
        self.attempts.set(self.attempts.get() + 1);
        if sc.try_harder {
            self.conservative.set(self.conservative.get() + 1);
        }
        Ok(())
    }

    fn scrub(&self, _cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
        let last = sc.mount.geometry().agcount - 1;
        sc.locks.lock(AgNumber(last))?;
        sc.locks.lock(AgNumber(0))?;
        sc.outcome.set(Axis::Warning, &Location::Fs, "reached AG 0");
        Ok(())
    }
}

#[test]
fn deadlock_is_retried_once_with_every_group_locked() {
    let image = build(&ImageSpec::default());
    let cx = Cx::for_testing();
    let mount = image.mount(&cx).expect("mount");
    let ops = BackwardsReach {
        attempts: Cell::new(0),
        conservative: Cell::new(0),
    };
    let outcome = run_scrub(
        &cx,
        &mount,
        ScrubRequest::new(ScrubType::Probe),
        &ops,
        &ScrubOptions::default(),
    )
    .expect("retry succeeds");
    assert_eq!(ops.attempts.get(), 2);
    assert_eq!(ops.conservative.get(), 1);
    // The failed attempt's findings do not leak into the result.
    assert_eq!(outcome.count(Axis::Warning), 1);
}

#[test]
fn deadlock_without_retry_propagates() {
    let image = build(&ImageSpec::default());
    let cx = Cx::for_testing();
    let mount = image.mount(&cx).expect("mount");
    let ops = BackwardsReach {
        attempts: Cell::new(0),
        conservative: Cell::new(0),
    };
    let options = ScrubOptions {
        retry: RetryPolicy::Never,
        ..ScrubOptions::default()
    };
    let err = run_scrub(&cx, &mount, ScrubRequest::new(ScrubType::Probe), &ops, &options)
        .expect_err("deadlock");
    assert!(matches!(err, ScrubError::Deadlock { .. }));
    assert_eq!(ops.attempts.get(), 1);
}

/// Always hits a lock-order hazard, however it is run.
struct AlwaysContended {
    attempts: Cell<u32>,
}

impl ScrubOps for AlwaysContended {
    fn setup(&self, _cx: &Cx, _sc: &mut ScrubContext<'_>) -> Result<()> {
        self.attempts.set(self.attempts.get() + 1);
        Ok(())
    }

    fn scrub(&self, _cx: &Cx, _sc: &mut ScrubContext<'_>) -> Result<()> {
        Err(ScrubError::Deadlock { wanted: 0, held: 1 })
    }
}

#[test]
fn second_deadlock_propagates() {
    let image = build(&ImageSpec::default());
    let cx = Cx::for_testing();
    let mount = image.mount(&cx).expect("mount");
    let ops = AlwaysContended {
        attempts: Cell::new(0),
    };
    let err = run_scrub(
        &cx,
        &mount,
        ScrubRequest::new(ScrubType::Probe),
        &ops,
        &ScrubOptions::default(),
    )
    .expect_err("deadlock");
    assert!(matches!(err, ScrubError::Deadlock { .. }));
    assert_eq!(ops.attempts.get(), 2);
}
