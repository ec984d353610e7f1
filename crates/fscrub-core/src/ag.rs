//! Per-AG header buffers and cross-reference cursors.
//!
//! An [`AgContext`] is set up once per invocation for the AG being scrubbed,
//! and briefly for any other AG an owner check needs to consult. Headers are
//! always read AGI, then AGF, then AGFL; cursors are opened only for trees
//! whose header was read and whose feature bit is set.

use crate::check::HeaderKind;
use crate::context::{AgLockSet, ScrubMount};
use asupersync::Cx;
use fscrub_btree::{AgBtree, BtreeCursor};
use fscrub_error::{Result, ScrubError};
use fscrub_ondisk::agheader::{AGF_CRC_OFFSET, AGFL_CRC_OFFSET, AGI_CRC_OFFSET};
use fscrub_ondisk::records::{
    BnoFormat, CntFormat, FinoFormat, InoFormat, RefcFormat, RmapFormat,
};
use fscrub_ondisk::{AGF_AGBNO, AGFL_AGBNO, AGI_AGBNO, Agf, Agfl, Agi, corruption, verify_crc};
use fscrub_types::{AgBlock, AgNumber, ParseError};
use std::sync::Arc;
use tracing::{debug, trace};

pub type BnoCursor = BtreeCursor<AgBtree<BnoFormat>>;
pub type CntCursor = BtreeCursor<AgBtree<CntFormat>>;
pub type InoCursor = BtreeCursor<AgBtree<InoFormat>>;
pub type FinoCursor = BtreeCursor<AgBtree<FinoFormat>>;
pub type RmapCursor = BtreeCursor<AgBtree<RmapFormat>>;
pub type RefcCursor = BtreeCursor<AgBtree<RefcFormat>>;

/// Which header read failures the caller wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgTarget {
    /// Scrubbing one header: only its own failure is an error.
    Header(HeaderKind),
    /// Scrubbing a btree: every header failure is an error.
    Btree,
    /// Consulting the AG for a cross-reference: nothing is an error.
    Xref,
}

impl AgTarget {
    fn wants_failure(self, header: HeaderKind) -> bool {
        match self {
            Self::Header(kind) => kind == header,
            Self::Btree => true,
            Self::Xref => false,
        }
    }
}

/// Headers and oracle cursors for one AG.
#[derive(Default)]
pub struct AgContext {
    pub agno: Option<AgNumber>,
    pub agi: Option<Agi>,
    pub agf: Option<Agf>,
    pub agfl: Option<Agfl>,
    pub bno_cur: Option<BnoCursor>,
    pub cnt_cur: Option<CntCursor>,
    pub ino_cur: Option<InoCursor>,
    pub fino_cur: Option<FinoCursor>,
    pub rmap_cur: Option<RmapCursor>,
    pub refc_cur: Option<RefcCursor>,
}

impl std::fmt::Debug for AgContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgContext")
            .field("agno", &self.agno)
            .field("agi", &self.agi.is_some())
            .field("agf", &self.agf.is_some())
            .field("agfl", &self.agfl.is_some())
            .field("cursors", &self.cursor_count())
            .finish()
    }
}

fn read_header<T>(
    cx: &Cx,
    mount: &ScrubMount,
    agno: AgNumber,
    agbno: AgBlock,
    crc_offset: usize,
    parse: fn(&[u8]) -> std::result::Result<T, ParseError>,
    seqno: fn(&T) -> u32,
) -> Result<T> {
    let fsb = mount.geometry().agb_to_fsb(agno, agbno);
    let buf = mount.device().read_block(cx, fsb)?;
    verify_crc(buf.as_slice(), crc_offset, fsb)?;
    let header = parse(buf.as_slice()).map_err(|err| corruption(fsb, &err))?;
    if seqno(&header) != agno.0 {
        return Err(ScrubError::Corruption {
            block: fsb.0,
            detail: format!("header belongs to AG {}", seqno(&header)),
        });
    }
    Ok(header)
}

/// Keep a header read, withhold it, or fail, depending on the target.
fn sift<T>(
    result: Result<T>,
    header: HeaderKind,
    agno: AgNumber,
    target: AgTarget,
) -> Result<Option<T>> {
    match result {
        Ok(header) => Ok(Some(header)),
        Err(err) if err.is_corruption() && !target.wants_failure(header) => {
            debug!(agno = agno.0, header = header.name(), error = %err, "ag_header_withheld");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

impl AgContext {
    /// A context holding nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Lock `agno`, read its headers and open every available oracle cursor.
    ///
    /// On error the lock is dropped again and nothing is returned.
    pub fn acquire(
        cx: &Cx,
        mount: &ScrubMount,
        locks: &mut AgLockSet<'_>,
        agno: AgNumber,
        target: AgTarget,
    ) -> Result<Self> {
        if !mount.geometry().verify_agno(agno) {
            return Err(ScrubError::InvalidArgument(format!(
                "AG {agno} beyond AG count {}",
                mount.geometry().agcount
            )));
        }
        locks.lock(agno)?;
        let mut sa = Self {
            agno: Some(agno),
            ..Self::default()
        };
        if let Err(err) = sa.load(cx, mount, agno, target) {
            sa.release(locks);
            return Err(err);
        }
        debug!(
            agno = agno.0,
            target = ?target,
            agi = sa.agi.is_some(),
            agf = sa.agf.is_some(),
            agfl = sa.agfl.is_some(),
            cursors = sa.cursor_count(),
            "ag_context_acquire"
        );
        Ok(sa)
    }

    /// Short-lived context for cross-referencing: every header failure is
    /// tolerated.
    pub fn acquire_xref(
        cx: &Cx,
        mount: &ScrubMount,
        locks: &mut AgLockSet<'_>,
        agno: AgNumber,
    ) -> Result<Self> {
        Self::acquire(cx, mount, locks, agno, AgTarget::Xref)
    }

    fn load(&mut self, cx: &Cx, mount: &ScrubMount, agno: AgNumber, target: AgTarget) -> Result<()> {
        self.agi = sift(
            read_header(cx, mount, agno, AGI_AGBNO, AGI_CRC_OFFSET, Agi::parse, |h| h.seqno),
            HeaderKind::Agi,
            agno,
            target,
        )?;
        self.agf = sift(
            read_header(cx, mount, agno, AGF_AGBNO, AGF_CRC_OFFSET, Agf::parse, |h| h.seqno),
            HeaderKind::Agf,
            agno,
            target,
        )?;
        self.agfl = sift(
            read_header(cx, mount, agno, AGFL_AGBNO, AGFL_CRC_OFFSET, Agfl::parse, |h| {
                h.seqno
            }),
            HeaderKind::Agfl,
            agno,
            target,
        )?;
        self.open_cursors(mount, agno);
        Ok(())
    }

    fn open_cursors(&mut self, mount: &ScrubMount, agno: AgNumber) {
        let dev = mount.device();
        let geo = *mount.geometry();
        let level = |l: u32| usize::try_from(l).unwrap_or(usize::MAX);
        if let Some(agf) = &self.agf {
            self.bno_cur = Some(BtreeCursor::new(AgBtree::new(
                Arc::clone(dev),
                geo,
                agno,
                AgBlock(agf.bno_root),
                level(agf.bno_level),
            )));
            self.cnt_cur = Some(BtreeCursor::new(AgBtree::new(
                Arc::clone(dev),
                geo,
                agno,
                AgBlock(agf.cnt_root),
                level(agf.cnt_level),
            )));
            if mount.has_rmapbt() {
                self.rmap_cur = Some(BtreeCursor::new(AgBtree::new(
                    Arc::clone(dev),
                    geo,
                    agno,
                    AgBlock(agf.rmap_root),
                    level(agf.rmap_level),
                )));
            }
            if mount.has_reflink() {
                self.refc_cur = Some(BtreeCursor::new(AgBtree::new(
                    Arc::clone(dev),
                    geo,
                    agno,
                    AgBlock(agf.refcount_root),
                    level(agf.refcount_level),
                )));
            }
        }
        if let Some(agi) = &self.agi {
            self.ino_cur = Some(BtreeCursor::new(AgBtree::new(
                Arc::clone(dev),
                geo,
                agno,
                AgBlock(agi.root),
                level(agi.level),
            )));
            if mount.has_finobt() {
                self.fino_cur = Some(BtreeCursor::new(AgBtree::new(
                    Arc::clone(dev),
                    geo,
                    agno,
                    AgBlock(agi.free_root),
                    level(agi.free_level),
                )));
            }
        }
    }

    /// Number of oracle cursors currently open.
    #[must_use]
    pub fn cursor_count(&self) -> usize {
        [
            self.bno_cur.is_some(),
            self.cnt_cur.is_some(),
            self.ino_cur.is_some(),
            self.fino_cur.is_some(),
            self.rmap_cur.is_some(),
            self.refc_cur.is_some(),
        ]
        .into_iter()
        .filter(|open| *open)
        .count()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.agno.is_some()
    }

    /// Drop cursors, then headers, then the AG lock. Idempotent.
    pub fn release(&mut self, locks: &mut AgLockSet<'_>) {
        self.refc_cur = None;
        self.rmap_cur = None;
        self.fino_cur = None;
        self.ino_cur = None;
        self.cnt_cur = None;
        self.bno_cur = None;
        self.agfl = None;
        self.agf = None;
        self.agi = None;
        if let Some(agno) = self.agno.take() {
            locks.unlock(agno);
            trace!(agno = agno.0, "ag_context_release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fscrub_block::{BlockDevice, MemBlockDevice};
    use fscrub_ondisk::Superblock;
    use fscrub_ondisk::agheader::NULL_AGBNO;
    use fscrub_ondisk::sb::{Features2, IncompatFeatures, RoCompatFeatures, SB_VERSION_5};
    use fscrub_types::BlockNumber;

    const BS: u32 = 512;

    fn superblock(features: RoCompatFeatures) -> Superblock {
        Superblock {
            block_size: BS,
            dblocks: 128,
            agblocks: 64,
            agcount: 2,
            uuid: [3; 16],
            versionnum: SB_VERSION_5,
            sectsize: 512,
            inodesize: 256,
            inopblock: 2,
            features_compat: 0,
            features_ro_compat: features,
            features_incompat: IncompatFeatures(0),
            rootino: 128,
            logstart: 0,
            logblocks: 0,
            fname: [0; 12],
            imax_pct: 25,
            unit: 0,
            width: 0,
            crc: 0,
            features2: Features2(0),
            bad_features2: Features2(0),
            spino_align: 0,
            pquotino: 0,
            meta_uuid: [0; 16],
        }
    }

    fn agf(agno: u32) -> Agf {
        Agf {
            versionnum: 1,
            seqno: agno,
            length: 64,
            bno_root: 4,
            cnt_root: 5,
            rmap_root: 6,
            bno_level: 1,
            cnt_level: 1,
            rmap_level: 1,
            flfirst: 0,
            fllast: 0,
            flcount: 0,
            freeblks: 0,
            longest: 0,
            btreeblks: 0,
            uuid: [3; 16],
            refcount_root: 7,
            refcount_level: 1,
            crc: 0,
        }
    }

    fn agi(agno: u32) -> Agi {
        Agi {
            versionnum: 1,
            seqno: agno,
            length: 64,
            count: 0,
            root: 8,
            level: 1,
            freecount: 0,
            newino: NULL_AGBNO,
            dirino: NULL_AGBNO,
            uuid: [3; 16],
            free_root: 9,
            free_level: 1,
            crc: 0,
        }
    }

    fn agfl(agno: u32) -> Agfl {
        Agfl {
            seqno: agno,
            uuid: [3; 16],
            bno: Vec::new(),
            crc: 0,
        }
    }

    fn mount(features: RoCompatFeatures) -> ScrubMount {
        let cx = Cx::for_testing();
        let dev = MemBlockDevice::new(BS, 128).expect("dev");
        let bs = BS as usize;
        let geo = superblock(features).geometry().expect("geo");
        dev.write_block(&cx, BlockNumber(0), &superblock(features).to_block(bs).expect("sb"))
            .expect("sb");
        for agno in 0..2 {
            let ag = AgNumber(agno);
            dev.write_block(&cx, geo.agb_to_fsb(ag, AGF_AGBNO), &agf(agno).to_block(bs).expect("agf"))
                .expect("agf");
            dev.write_block(&cx, geo.agb_to_fsb(ag, AGI_AGBNO), &agi(agno).to_block(bs).expect("agi"))
                .expect("agi");
            dev.write_block(
                &cx,
                geo.agb_to_fsb(ag, AGFL_AGBNO),
                &agfl(agno).to_block(bs).expect("agfl"),
            )
            .expect("agfl");
        }
        ScrubMount::open(&cx, Arc::new(dev)).expect("mount")
    }

    fn smash(mount: &ScrubMount, agno: u32, agbno: AgBlock) {
        let cx = Cx::for_testing();
        let fsb = mount.geometry().agb_to_fsb(AgNumber(agno), agbno);
        let mut block = mount.device().read_block(&cx, fsb).expect("read").into_inner();
        block[40] ^= 0xFF;
        mount.device().write_block(&cx, fsb, &block).expect("write");
    }

    #[test]
    fn featureless_ag_opens_base_cursors_only() {
        let mount = mount(RoCompatFeatures(0));
        let cx = Cx::for_testing();
        let mut locks = AgLockSet::new(&mount);
        let mut sa = AgContext::acquire(&cx, &mount, &mut locks, AgNumber(1), AgTarget::Btree)
            .expect("acquire");
        assert!(sa.agi.is_some() && sa.agf.is_some() && sa.agfl.is_some());
        assert!(sa.bno_cur.is_some() && sa.cnt_cur.is_some() && sa.ino_cur.is_some());
        assert!(sa.fino_cur.is_none() && sa.rmap_cur.is_none() && sa.refc_cur.is_none());
        assert!(locks.is_held(AgNumber(1)));

        sa.release(&mut locks);
        assert_eq!(sa.cursor_count(), 0);
        assert!(!sa.is_active());
        assert!(!locks.is_held(AgNumber(1)));
        sa.release(&mut locks);
        assert_eq!(sa.cursor_count(), 0);
    }

    #[test]
    fn feature_bits_open_optional_cursors() {
        let all = RoCompatFeatures(
            RoCompatFeatures::FINOBT.0 | RoCompatFeatures::RMAPBT.0 | RoCompatFeatures::REFLINK.0,
        );
        let mount = mount(all);
        let cx = Cx::for_testing();
        let mut locks = AgLockSet::new(&mount);
        let mut sa =
            AgContext::acquire_xref(&cx, &mount, &mut locks, AgNumber(0)).expect("acquire");
        assert_eq!(sa.cursor_count(), 6);
        sa.release(&mut locks);
    }

    #[test]
    fn damaged_header_is_withheld_unless_targeted() {
        let mount = mount(RoCompatFeatures(RoCompatFeatures::FINOBT.0));
        smash(&mount, 0, AGI_AGBNO);
        let cx = Cx::for_testing();
        let mut locks = AgLockSet::new(&mount);

        let mut sa = AgContext::acquire(
            &cx,
            &mount,
            &mut locks,
            AgNumber(0),
            AgTarget::Header(HeaderKind::Agf),
        )
        .expect("agi failure tolerated");
        assert!(sa.agi.is_none());
        assert!(sa.ino_cur.is_none() && sa.fino_cur.is_none());
        assert!(sa.bno_cur.is_some());
        sa.release(&mut locks);

        let err = AgContext::acquire(
            &cx,
            &mount,
            &mut locks,
            AgNumber(0),
            AgTarget::Header(HeaderKind::Agi),
        )
        .expect_err("target failure");
        assert!(err.is_corruption());
        assert!(!locks.is_held(AgNumber(0)), "lock dropped on failure");

        assert!(AgContext::acquire(&cx, &mount, &mut locks, AgNumber(0), AgTarget::Btree).is_err());
    }

    #[test]
    fn header_from_another_ag_is_corrupt() {
        let mount = mount(RoCompatFeatures(0));
        let cx = Cx::for_testing();
        let fsb = mount.geometry().agb_to_fsb(AgNumber(1), AGF_AGBNO);
        mount
            .device()
            .write_block(&cx, fsb, &agf(0).to_block(BS as usize).expect("agf"))
            .expect("write");
        let mut locks = AgLockSet::new(&mount);
        let err = AgContext::acquire(
            &cx,
            &mount,
            &mut locks,
            AgNumber(1),
            AgTarget::Header(HeaderKind::Agf),
        )
        .expect_err("seqno");
        assert!(matches!(err, ScrubError::Corruption { .. }));
    }

    #[test]
    fn lower_ag_after_higher_is_deadlock() {
        let mount = mount(RoCompatFeatures(0));
        let cx = Cx::for_testing();
        let mut locks = AgLockSet::new(&mount);
        let mut high = AgContext::acquire_xref(&cx, &mount, &mut locks, AgNumber(1)).expect("1");
        let err = AgContext::acquire_xref(&cx, &mount, &mut locks, AgNumber(0)).expect_err("0");
        assert!(err.is_retryable());
        high.release(&mut locks);
        let mut low = AgContext::acquire_xref(&cx, &mount, &mut locks, AgNumber(0)).expect("0");
        low.release(&mut locks);
    }

    #[test]
    fn out_of_range_ag_is_rejected() {
        let mount = mount(RoCompatFeatures(0));
        let cx = Cx::for_testing();
        let mut locks = AgLockSet::new(&mount);
        assert!(matches!(
            AgContext::acquire_xref(&cx, &mount, &mut locks, AgNumber(2)),
            Err(ScrubError::InvalidArgument(_))
        ));
    }
}
