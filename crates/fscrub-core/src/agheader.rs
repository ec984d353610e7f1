//! AG header scrubbers: superblock mirrors, AGF, AGFL and AGI.

use crate::ag::{AgContext, AgTarget};
use crate::check::{Axis, HeaderKind, Location, ScrubOutcome};
use crate::context::{ScrubContext, ScrubMount};
use asupersync::Cx;
use fscrub_error::{Result, ScrubError};
use fscrub_ondisk::btree::BTREE_MAX_LEVELS;
use fscrub_ondisk::sb::{
    Features2, SB_CRC_OFFSET, SB_SIZE, SB_VERSION_LATER_BITS, SB_VERSION_MKFS_MASK,
};
use fscrub_ondisk::{AGF_AGBNO, AGI_AGBNO, Agfl, SB_AGBNO, Superblock, corruption, verify_crc};
use fscrub_types::{AgBlock, AgNumber, BlockNumber, FsGeometry};
use tracing::debug;

fn header_location(agno: AgNumber, header: HeaderKind) -> Location {
    Location::Header {
        agno: agno.0,
        header,
    }
}

/// A btree root must sit past the fixed headers and inside the AG.
fn root_ok(geo: &FsGeometry, agno: AgNumber, eoag: u32, agbno: u32) -> bool {
    agbno > AGI_AGBNO.0
        && agbno < geo.agblocks
        && agbno < eoag
        && geo.agb_to_fsb(agno, AgBlock(agbno)).0 < geo.dblocks
}

fn level_ok(level: u32) -> bool {
    usize::try_from(level).is_ok_and(|level| level > 0 && level <= BTREE_MAX_LEVELS)
}

/// Take the AG context for a header scrub. A failure reading the header
/// being scrubbed is recorded as corruption; returns whether scrubbing can
/// go on.
fn load_headers(cx: &Cx, sc: &mut ScrubContext<'_>, header: HeaderKind) -> Result<bool> {
    let agno = AgNumber(sc.request.agno);
    let mount = sc.mount;
    let acquired = AgContext::acquire(cx, mount, &mut sc.locks, agno, AgTarget::Header(header));
    match sc.outcome.op_result(acquired, &header_location(agno, header))? {
        Some(sa) => {
            sc.sa = sa;
            Ok(true)
        }
        None => Ok(false),
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

fn read_mirror(cx: &Cx, mount: &ScrubMount, fsb: BlockNumber) -> Result<(Superblock, Vec<u8>)> {
    let buf = mount.device().read_block(cx, fsb)?;
    if mount.has_crc() {
        verify_crc(buf.as_slice(), SB_CRC_OFFSET, fsb)?;
    }
    let sb = Superblock::parse(buf.as_slice()).map_err(|err| corruption(fsb, &err))?;
    Ok((sb, buf.into_inner()))
}

/// Compare the superblock copy in AG `agno` against the primary.
///
/// Fields fixed by mkfs must match exactly; fields that can change later
/// and are not propagated to the copies only need preening.
pub(crate) fn scrub_superblock(cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
    let agno = AgNumber(sc.request.agno);
    if agno.0 == 0 {
        return Ok(());
    }
    let mount = sc.mount;
    let location = header_location(agno, HeaderKind::Superblock);
    let fsb = mount.geometry().agb_to_fsb(agno, SB_AGBNO);
    let Some((sb, raw)) = sc.outcome.op_result(read_mirror(cx, mount, fsb), &location)? else {
        return Ok(());
    };
    let primary = mount.superblock();

    let fixed = [
        (sb.block_size == primary.block_size, "block size"),
        (sb.dblocks == primary.dblocks, "data block count"),
        (sb.agblocks == primary.agblocks, "AG size"),
        (sb.agcount == primary.agcount, "AG count"),
        (sb.sectsize == primary.sectsize, "sector size"),
        (sb.inodesize == primary.inodesize, "inode size"),
        (sb.inopblock == primary.inopblock, "inodes per block"),
        (sb.logstart == primary.logstart, "log start"),
        (sb.logblocks == primary.logblocks, "log size"),
        (
            (sb.versionnum & SB_VERSION_MKFS_MASK) == (primary.versionnum & SB_VERSION_MKFS_MASK),
            "version number",
        ),
        (sb.features_compat == primary.features_compat, "compat features"),
        (
            sb.features_ro_compat == primary.features_ro_compat,
            "ro-compat features",
        ),
        (
            sb.features_incompat == primary.features_incompat,
            "incompat features",
        ),
    ];
    for (ok, field) in fixed {
        sc.outcome.check(
            ok,
            Axis::Corrupt,
            &location,
            &format!("{field} differs from the primary"),
        );
    }

    let mutable = [
        (sb.uuid == primary.uuid, "uuid"),
        (sb.rootino == primary.rootino, "root inode"),
        (sb.fname == primary.fname, "label"),
        (sb.imax_pct == primary.imax_pct, "inode space limit"),
        (sb.unit == primary.unit, "stripe unit"),
        (sb.width == primary.width, "stripe width"),
        (
            (sb.versionnum & SB_VERSION_LATER_BITS) == (primary.versionnum & SB_VERSION_LATER_BITS),
            "late version bits",
        ),
    ];
    for (ok, field) in mutable {
        sc.outcome.check(
            ok,
            Axis::Preen,
            &location,
            &format!("{field} differs from the primary"),
        );
    }

    check_superblock_features(&mut sc.outcome, &location, &sb, primary);

    sc.outcome.check(
        raw.get(SB_SIZE..).is_none_or(|tail| tail.iter().all(|b| *b == 0)),
        Axis::Corrupt,
        &location,
        "bytes past the superblock are not zero",
    );
    Ok(())
}

/// The `features2` word and the version 5 fields of a secondary.
fn check_superblock_features(
    out: &mut ScrubOutcome,
    location: &Location,
    sb: &Superblock,
    primary: &Superblock,
) {
    let f2 = sb.features2.bits();
    let primary_f2 = primary.features2.bits();
    if primary.has_morebits() {
        let mut ok_bits = Features2::OK_BITS;
        if primary.has_crc() {
            ok_bits |= Features2::CRC.0;
        }
        out.check(
            (f2 & !ok_bits) == 0,
            Axis::Corrupt,
            location,
            &format!("unknown features2 bits {:#x}", f2 & !ok_bits),
        );
        out.check(
            sb.features2 == sb.bad_features2,
            Axis::Preen,
            location,
            "features2 and its misplaced copy disagree",
        );
    } else {
        out.check(f2 == 0, Axis::Corrupt, location, "features2 set without the version bit");
    }
    out.check(
        (f2 & Features2::MKFS_BITS) == (primary_f2 & Features2::MKFS_BITS),
        Axis::Corrupt,
        location,
        "mkfs-time features2 differ from the primary",
    );
    out.check(
        (f2 & Features2::ATTR2.0) == (primary_f2 & Features2::ATTR2.0),
        Axis::Corrupt,
        location,
        "attr2 feature differs from the primary",
    );

    if primary.has_crc() {
        out.check(
            sb.spino_align == primary.spino_align,
            Axis::Corrupt,
            location,
            "sparse inode alignment differs from the primary",
        );
        out.check(
            sb.pquotino == primary.pquotino,
            Axis::Preen,
            location,
            "project quota inode differs from the primary",
        );
    } else {
        out.check(
            sb.features_compat == 0
                && sb.features_ro_compat.bits() == 0
                && sb.features_incompat.bits() == 0
                && sb.spino_align == 0
                && sb.pquotino == 0
                && sb.meta_uuid == [0; 16],
            Axis::Corrupt,
            location,
            "version 5 fields set on an older filesystem",
        );
    }
    if primary.has_meta_uuid() {
        out.check(
            sb.meta_uuid == primary.meta_uuid,
            Axis::Corrupt,
            location,
            "metadata uuid differs from the primary",
        );
    }
}

// ── AGF ─────────────────────────────────────────────────────────────────────

pub(crate) fn scrub_agf(cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
    if !load_headers(cx, sc, HeaderKind::Agf)? {
        return Ok(());
    }
    let agno = AgNumber(sc.request.agno);
    let location = header_location(agno, HeaderKind::Agf);
    let mount = sc.mount;
    let geo = *mount.geometry();
    let Some(agf) = sc.sa.agf.clone() else {
        return Ok(());
    };
    let out = &mut sc.outcome;

    let eoag = agf.length;
    out.check(
        eoag == geo.ag_block_count(agno),
        Axis::Corrupt,
        &location,
        "length does not match the AG size",
    );

    let mut trees = vec![
        ("bnobt", agf.bno_root, agf.bno_level),
        ("cntbt", agf.cnt_root, agf.cnt_level),
    ];
    if mount.has_rmapbt() {
        trees.push(("rmapbt", agf.rmap_root, agf.rmap_level));
    }
    if mount.has_reflink() {
        trees.push(("refcountbt", agf.refcount_root, agf.refcount_level));
    }
    for (name, root, level) in trees {
        out.check(
            root_ok(&geo, agno, eoag, root),
            Axis::Corrupt,
            &location,
            &format!("{name} root {root} out of range"),
        );
        out.check(
            level_ok(level),
            Axis::Corrupt,
            &location,
            &format!("{name} height {level} out of range"),
        );
    }

    // first == last counts as a full wrap here; see DESIGN.md.
    let size = u32::try_from(Agfl::capacity(geo.block_size as usize)).unwrap_or(u32::MAX);
    let (first, last, count) = (agf.flfirst, agf.fllast, agf.flcount);
    let fl_count = if last > first {
        last - first + 1
    } else {
        size.wrapping_sub(first).wrapping_add(last).wrapping_add(1)
    };
    out.check(
        count == 0 || fl_count == count,
        Axis::Corrupt,
        &location,
        &format!("free list count {count} but first {first} last {last}"),
    );
    Ok(())
}

// ── AGFL ────────────────────────────────────────────────────────────────────

/// Live AGFL slots in walk order. `last >= first` is one run; otherwise the
/// list wraps past the end of the block.
fn agfl_slots(first: u32, last: u32, count: u32, size: usize) -> Vec<usize> {
    if count == 0 {
        return Vec::new();
    }
    let (first, last) = (first as usize, last as usize);
    if last >= first {
        (first..=last).collect()
    } else {
        (first..size).chain(0..=last).collect()
    }
}

pub(crate) fn scrub_agfl(cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
    if !load_headers(cx, sc, HeaderKind::Agfl)? {
        return Ok(());
    }
    let agno = AgNumber(sc.request.agno);
    let location = header_location(agno, HeaderKind::Agfl);
    let geo = *sc.mount.geometry();
    let Some(agf) = sc.sa.agf.as_ref() else {
        let fsb = geo.agb_to_fsb(agno, AGF_AGBNO);
        return Err(ScrubError::Corruption {
            block: fsb.0,
            detail: "free list has no readable AGF".into(),
        });
    };
    let Some(agfl) = sc.sa.agfl.as_ref() else {
        return Ok(());
    };
    let slots = agfl_slots(
        agf.flfirst,
        agf.fllast,
        agf.flcount,
        Agfl::capacity(geo.block_size as usize),
    );
    let eoag = agf.length;
    let mut bad = Vec::new();
    for slot in slots {
        match agfl.bno.get(slot) {
            Some(&agbno) if root_ok(&geo, agno, eoag, agbno) => {}
            Some(&agbno) => bad.push(format!("slot {slot} holds block {agbno}")),
            None => bad.push(format!("slot {slot} past the end of the list")),
        }
    }
    debug!(agno = agno.0, bad = bad.len(), "agfl_walked");
    for detail in bad {
        sc.outcome.set(Axis::Corrupt, &location, detail);
    }
    Ok(())
}

// ── AGI ─────────────────────────────────────────────────────────────────────

pub(crate) fn scrub_agi(cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
    if !load_headers(cx, sc, HeaderKind::Agi)? {
        return Ok(());
    }
    let agno = AgNumber(sc.request.agno);
    let location = header_location(agno, HeaderKind::Agi);
    let mount = sc.mount;
    let geo = *mount.geometry();
    let Some(agi) = sc.sa.agi.clone() else {
        return Ok(());
    };
    let out = &mut sc.outcome;

    let eoag = agi.length;
    out.check(
        eoag == geo.ag_block_count(agno),
        Axis::Corrupt,
        &location,
        "length does not match the AG size",
    );
    let mut trees = vec![("inobt", agi.root, agi.level)];
    if mount.has_finobt() {
        trees.push(("finobt", agi.free_root, agi.free_level));
    }
    for (name, root, level) in trees {
        out.check(
            root_ok(&geo, agno, eoag, root),
            Axis::Corrupt,
            &location,
            &format!("{name} root {root} out of range"),
        );
        out.check(
            level_ok(level),
            Axis::Corrupt,
            &location,
            &format!("{name} height {level} out of range"),
        );
    }
    out.check(
        agi.freecount <= agi.count,
        Axis::Corrupt,
        &location,
        &format!("{} free inodes of {}", agi.freecount, agi.count),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::ScrubFlags;
    use crate::context::{ScrubRequest, ScrubType};
    use crate::testutil::{BS, TestFs};
    use fscrub_ondisk::sb::{IncompatFeatures, RoCompatFeatures, SB_VERSION_MOREBITS};

    fn scrub(
        fs: &TestFs,
        kind: ScrubType,
        agno: u32,
        f: fn(&Cx, &mut ScrubContext<'_>) -> Result<()>,
    ) -> Result<ScrubFlags> {
        let mount = fs.mount();
        let cx = Cx::for_testing();
        let mut sc = ScrubContext::new(&mount, ScrubRequest::for_ag(kind, agno), false)?;
        f(&cx, &mut sc)?;
        Ok(sc.outcome.flags)
    }

    fn formatted() -> TestFs {
        let fs = TestFs::new();
        fs.format_headers();
        fs
    }

    #[test]
    fn clean_headers_pass() {
        let fs = formatted();
        for agno in 0..2 {
            assert!(scrub(&fs, ScrubType::Agf, agno, scrub_agf).expect("agf").is_empty());
            assert!(scrub(&fs, ScrubType::Agfl, agno, scrub_agfl).expect("agfl").is_empty());
            assert!(scrub(&fs, ScrubType::Agi, agno, scrub_agi).expect("agi").is_empty());
            assert!(
                scrub(&fs, ScrubType::Superblock, agno, scrub_superblock)
                    .expect("sb")
                    .is_empty()
            );
        }
    }

    #[test]
    fn mirror_with_wrong_ag_count_is_corrupt() {
        let fs = formatted();
        let mount = fs.mount();
        let mut mirror = fs.sb.clone();
        mirror.agcount += 1;
        fs.write(1, SB_AGBNO, &mirror.to_block(BS as usize).expect("sb"));
        let cx = Cx::for_testing();
        let mut sc =
            ScrubContext::new(&mount, ScrubRequest::for_ag(ScrubType::Superblock, 1), false)
                .expect("sc");
        scrub_superblock(&cx, &mut sc).expect("scrub");
        assert_eq!(sc.outcome.flags, ScrubFlags::CORRUPT);
        assert!(!sc.outcome.has(ScrubFlags::PREEN));
    }

    #[test]
    fn mirror_with_stale_label_needs_preening() {
        let fs = formatted();
        let mount = fs.mount();
        let mut mirror = fs.sb.clone();
        mirror.fname = *b"old\0\0\0\0\0\0\0\0\0";
        fs.write(1, SB_AGBNO, &mirror.to_block(BS as usize).expect("sb"));
        let cx = Cx::for_testing();
        let mut sc =
            ScrubContext::new(&mount, ScrubRequest::for_ag(ScrubType::Superblock, 1), false)
                .expect("sc");
        scrub_superblock(&cx, &mut sc).expect("scrub");
        assert_eq!(sc.outcome.flags, ScrubFlags::PREEN);
    }

    /// Scrub AG 1's superblock after rewriting it as an edited copy of the
    /// primary.
    fn scrub_mirror(fs: &TestFs, edit: impl FnOnce(&mut Superblock)) -> ScrubOutcome {
        let mount = fs.mount();
        let mut mirror = fs.sb.clone();
        edit(&mut mirror);
        fs.write(1, SB_AGBNO, &mirror.to_block(BS as usize).expect("sb"));
        let cx = Cx::for_testing();
        let mut sc =
            ScrubContext::new(&mount, ScrubRequest::for_ag(ScrubType::Superblock, 1), false)
                .expect("sc");
        scrub_superblock(&cx, &mut sc).expect("scrub");
        std::mem::take(&mut sc.outcome)
    }

    fn with_features2() -> TestFs {
        let mut fs = TestFs::new();
        fs.sb.versionnum |= SB_VERSION_MOREBITS;
        fs.sb.features2 = Features2(Features2::ATTR2.0 | Features2::CRC.0);
        fs.sb.bad_features2 = fs.sb.features2;
        fs.format_headers();
        fs
    }

    #[test]
    fn features2_copies_disagreeing_needs_preening() {
        let fs = with_features2();
        assert!(scrub_mirror(&fs, |_| {}).is_clean());
        let out = scrub_mirror(&fs, |sb| sb.bad_features2 = Features2::ATTR2);
        assert_eq!(out.flags, ScrubFlags::PREEN);
    }

    #[test]
    fn features2_mkfs_and_unknown_bits_are_corrupt() {
        let fs = with_features2();
        let out = scrub_mirror(&fs, |sb| {
            sb.features2 = Features2::ATTR2;
            sb.bad_features2 = Features2::ATTR2;
        });
        assert_eq!(out.flags, ScrubFlags::CORRUPT);

        let out = scrub_mirror(&fs, |sb| {
            sb.features2.0 |= 0x1;
            sb.bad_features2 = sb.features2;
        });
        assert_eq!(out.flags, ScrubFlags::CORRUPT);
        assert!(out.findings.iter().any(|f| f.detail.contains("unknown features2")));
    }

    #[test]
    fn features2_without_the_version_bit_is_corrupt() {
        let fs = formatted();
        let out = scrub_mirror(&fs, |sb| {
            sb.features2 = Features2::ATTR2;
            sb.bad_features2 = Features2::ATTR2;
        });
        assert_eq!(out.flags, ScrubFlags::CORRUPT);
        assert!(out.findings.iter().any(|f| f.detail.contains("without the version bit")));
    }

    #[test]
    fn quota_inode_preens_but_sparse_alignment_is_corrupt() {
        let fs = formatted();
        let out = scrub_mirror(&fs, |sb| sb.pquotino = 131);
        assert_eq!(out.flags, ScrubFlags::PREEN);
        let out = scrub_mirror(&fs, |sb| sb.spino_align = 8);
        assert_eq!(out.flags, ScrubFlags::CORRUPT);
    }

    #[test]
    fn metadata_uuid_is_compared_only_when_in_use() {
        let fs = formatted();
        assert!(scrub_mirror(&fs, |sb| sb.meta_uuid = [4; 16]).is_clean());

        let mut fs = TestFs::new();
        fs.sb.features_incompat = IncompatFeatures::META_UUID;
        fs.sb.meta_uuid = [7; 16];
        fs.format_headers();
        assert!(scrub_mirror(&fs, |_| {}).is_clean());
        let out = scrub_mirror(&fs, |sb| sb.meta_uuid = [4; 16]);
        assert_eq!(out.flags, ScrubFlags::CORRUPT);
        assert!(out.findings.iter().any(|f| f.detail.contains("metadata uuid")));
    }

    #[test]
    fn mirror_trailing_garbage_is_corrupt() {
        let fs = formatted();
        let mount = fs.mount();
        let mut block = fs.sb.to_block(BS as usize).expect("sb");
        block[400] = 0xee;
        fscrub_ondisk::stamp_crc(&mut block, SB_CRC_OFFSET).expect("crc");
        fs.write(1, SB_AGBNO, &block);
        let cx = Cx::for_testing();
        let mut sc =
            ScrubContext::new(&mount, ScrubRequest::for_ag(ScrubType::Superblock, 1), false)
                .expect("sc");
        scrub_superblock(&cx, &mut sc).expect("scrub");
        assert_eq!(sc.outcome.flags, ScrubFlags::CORRUPT);
    }

    #[test]
    fn agf_length_and_roots_are_checked() {
        let fs = formatted();
        let mut agf = fs.default_agf(0);
        agf.length -= 1;
        fs.put_agf(&agf);
        assert_eq!(
            scrub(&fs, ScrubType::Agf, 0, scrub_agf).expect("agf"),
            ScrubFlags::CORRUPT
        );

        let mut agf = fs.default_agf(1);
        agf.cnt_root = 2;
        agf.bno_level = 0;
        fs.put_agf(&agf);
        let mount = fs.mount();
        let cx = Cx::for_testing();
        let mut sc =
            ScrubContext::new(&mount, ScrubRequest::for_ag(ScrubType::Agf, 1), false).expect("sc");
        scrub_agf(&cx, &mut sc).expect("scrub");
        assert_eq!(sc.outcome.count(Axis::Corrupt), 2);
    }

    #[test]
    fn agf_rmap_root_only_checked_with_feature() {
        let fs = formatted();
        let mut agf = fs.default_agf(0);
        agf.rmap_root = 0;
        fs.put_agf(&agf);
        assert!(scrub(&fs, ScrubType::Agf, 0, scrub_agf).expect("agf").is_empty());

        let fs = TestFs::with_features(RoCompatFeatures::RMAPBT);
        fs.format_headers();
        fs.put_agf(&agf);
        assert_eq!(
            scrub(&fs, ScrubType::Agf, 0, scrub_agf).expect("agf"),
            ScrubFlags::CORRUPT
        );
    }

    #[test]
    fn agf_free_list_count_follows_wraparound() {
        let size = u32::try_from(Agfl::capacity(BS as usize)).expect("size");
        let fs = formatted();
        let mut agf = fs.default_agf(0);
        (agf.flfirst, agf.fllast, agf.flcount) = (size - 2, 1, 4);
        fs.put_agf(&agf);
        assert!(scrub(&fs, ScrubType::Agf, 0, scrub_agf).expect("agf").is_empty());

        (agf.flfirst, agf.fllast, agf.flcount) = (3, 5, 4);
        fs.put_agf(&agf);
        assert_eq!(
            scrub(&fs, ScrubType::Agf, 0, scrub_agf).expect("agf"),
            ScrubFlags::CORRUPT
        );
    }

    #[test]
    fn agf_single_entry_list_is_counted_as_full_wrap() {
        let fs = formatted();
        let mut agf = fs.default_agf(0);
        (agf.flfirst, agf.fllast, agf.flcount) = (5, 5, 1);
        fs.put_agf(&agf);
        assert_eq!(
            scrub(&fs, ScrubType::Agf, 0, scrub_agf).expect("agf"),
            ScrubFlags::CORRUPT
        );
    }

    #[test]
    fn damaged_target_header_is_corrupt_not_error() {
        let fs = formatted();
        fs.write(0, AGF_AGBNO, &[0xa5; BS as usize]);
        assert_eq!(
            scrub(&fs, ScrubType::Agf, 0, scrub_agf).expect("agf"),
            ScrubFlags::CORRUPT
        );
        // The AGI scrub does not depend on the AGF.
        assert!(scrub(&fs, ScrubType::Agi, 0, scrub_agi).expect("agi").is_empty());
    }

    #[test]
    fn agfl_entries_must_be_inside_the_ag() {
        let fs = formatted();
        let mut agf = fs.default_agf(0);
        (agf.flfirst, agf.fllast, agf.flcount) = (0, 2, 3);
        fs.put_agf(&agf);
        fs.put_agfl(&Agfl {
            seqno: 0,
            uuid: fs.sb.uuid,
            bno: vec![10, 1, 200],
            crc: 0,
        });
        let mount = fs.mount();
        let cx = Cx::for_testing();
        let mut sc =
            ScrubContext::new(&mount, ScrubRequest::for_ag(ScrubType::Agfl, 0), false).expect("sc");
        scrub_agfl(&cx, &mut sc).expect("scrub");
        assert_eq!(sc.outcome.count(Axis::Corrupt), 2);
    }

    #[test]
    fn agfl_walk_wraps_when_last_precedes_first() {
        assert_eq!(agfl_slots(5, 5, 1, 8), vec![5]);
        assert_eq!(agfl_slots(6, 1, 4, 8), vec![6, 7, 0, 1]);
        assert!(agfl_slots(0, 3, 0, 8).is_empty());
    }

    #[test]
    fn agfl_without_agf_is_an_error() {
        let fs = formatted();
        fs.write(0, AGF_AGBNO, &[0; BS as usize]);
        let err = scrub(&fs, ScrubType::Agfl, 0, scrub_agfl).expect_err("no agf");
        assert!(err.is_corruption());
    }

    #[test]
    fn agi_free_count_cannot_exceed_count() {
        let fs = formatted();
        let mut agi = fs.default_agi(1);
        agi.count = 64;
        agi.freecount = 65;
        fs.put_agi(&agi);
        assert_eq!(
            scrub(&fs, ScrubType::Agi, 1, scrub_agi).expect("agi"),
            ScrubFlags::CORRUPT
        );
    }
}
