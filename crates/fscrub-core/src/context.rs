//! Mount state, requests, per-invocation context and AG lock ordering.

use crate::ag::AgContext;
use crate::check::{ScrubFlags, ScrubOutcome};
use asupersync::Cx;
use fscrub_block::BlockDevice;
use fscrub_error::{Result, ScrubError};
use fscrub_ondisk::sb::SB_CRC_OFFSET;
use fscrub_ondisk::{SB_AGBNO, Superblock, verify_crc};
use fscrub_types::{AgNumber, FsGeometry};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace};

// ── Mount ───────────────────────────────────────────────────────────────────

/// A filesystem opened for scrubbing.
///
/// Shared by every invocation; each AG's headers are guarded by a
/// reader-writer lock that scrubbing only ever takes for reading.
pub struct ScrubMount {
    dev: Arc<dyn BlockDevice>,
    sb: Superblock,
    geo: FsGeometry,
    ag_locks: Vec<RwLock<()>>,
}

impl fmt::Debug for ScrubMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrubMount")
            .field("geo", &self.geo)
            .field("label", &self.sb.label())
            .finish_non_exhaustive()
    }
}

impl ScrubMount {
    /// Read and validate the primary superblock.
    pub fn open(cx: &Cx, dev: Arc<dyn BlockDevice>) -> Result<Self> {
        let fsb = dev.read_block(cx, fscrub_types::BlockNumber(u64::from(SB_AGBNO.0)))?;
        let sb = Superblock::parse(fsb.as_slice())
            .map_err(|err| ScrubError::Format(format!("primary superblock: {err}")))?;
        if sb.has_crc() {
            verify_crc(fsb.as_slice(), SB_CRC_OFFSET, fscrub_types::BlockNumber(0))?;
        }
        let geo = sb
            .geometry()
            .map_err(|err| ScrubError::Format(format!("superblock geometry: {err}")))?;
        if geo.block_size != dev.block_size() {
            return Err(ScrubError::Format(format!(
                "superblock block size {} does not match device block size {}",
                geo.block_size,
                dev.block_size()
            )));
        }
        if geo.dblocks > dev.block_count() {
            return Err(ScrubError::Format(format!(
                "filesystem has {} blocks but device only {}",
                geo.dblocks,
                dev.block_count()
            )));
        }
        let ag_locks = (0..geo.agcount).map(|_| RwLock::new(())).collect();
        debug!(
            block_size = geo.block_size,
            agcount = geo.agcount,
            agblocks = geo.agblocks,
            dblocks = geo.dblocks,
            features = %sb.features_ro_compat,
            "scrub_mount_open"
        );
        Ok(Self {
            dev,
            sb,
            geo,
            ag_locks,
        })
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
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
    pub fn has_finobt(&self) -> bool {
        self.sb.has_finobt()
    }

    #[must_use]
    pub fn has_rmapbt(&self) -> bool {
        self.sb.has_rmapbt()
    }

    #[must_use]
    pub fn has_reflink(&self) -> bool {
        self.sb.has_reflink()
    }

    #[must_use]
    pub fn has_crc(&self) -> bool {
        self.sb.has_crc()
    }

    fn ag_lock(&self, agno: AgNumber) -> Option<&RwLock<()>> {
        self.ag_locks.get(usize::try_from(agno.0).ok()?)
    }
}

// ── Lock ordering ───────────────────────────────────────────────────────────

/// AG header locks held by one invocation.
///
/// Groups must be taken in increasing order. Taking a group below the
/// highest one held returns [`ScrubError::Deadlock`] instead of blocking;
/// the dispatcher then retries with every group locked up front.
pub struct AgLockSet<'m> {
    mount: &'m ScrubMount,
    held: BTreeMap<u32, (RwLockReadGuard<'m, ()>, usize)>,
}

impl<'m> AgLockSet<'m> {
    #[must_use]
    pub fn new(mount: &'m ScrubMount) -> Self {
        Self {
            mount,
            held: BTreeMap::new(),
        }
    }

    pub fn lock(&mut self, agno: AgNumber) -> Result<()> {
        if let Some((_, refs)) = self.held.get_mut(&agno.0) {
            *refs += 1;
            return Ok(());
        }
        if let Some((&highest, _)) = self.held.last_key_value() {
            if highest > agno.0 {
                trace!(wanted = agno.0, held = highest, "ag_lock_order_violation");
                return Err(ScrubError::Deadlock {
                    wanted: agno.0,
                    held: highest,
                });
            }
        }
        let lock = self
            .mount
            .ag_lock(agno)
            .ok_or_else(|| ScrubError::InvalidArgument(format!("AG {agno} out of range")))?;
        self.held.insert(agno.0, (lock.read_recursive(), 1));
        trace!(agno = agno.0, "ag_lock");
        Ok(())
    }

    /// Drop one reference to `agno`; the lock is released with the last.
    pub fn unlock(&mut self, agno: AgNumber) {
        let release = match self.held.get_mut(&agno.0) {
            Some((_, refs)) if *refs > 1 => {
                *refs -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if release {
            self.held.remove(&agno.0);
            trace!(agno = agno.0, "ag_unlock");
        }
    }

    /// Take every group in increasing order.
    pub fn lock_all(&mut self) -> Result<()> {
        for agno in 0..self.mount.geo.agcount {
            self.lock(AgNumber(agno))?;
        }
        Ok(())
    }

    pub fn release_all(&mut self) {
        self.held.clear();
    }

    #[must_use]
    pub fn is_held(&self, agno: AgNumber) -> bool {
        self.held.contains_key(&agno.0)
    }

    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

// ── Requests ────────────────────────────────────────────────────────────────

/// Kind of metadata to scrub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrubType {
    /// No-op that exercises the request plumbing.
    Probe,
    Superblock,
    Agf,
    Agfl,
    Agi,
    Bnobt,
    Cntbt,
    Inobt,
    Finobt,
    Rmapbt,
    Refcountbt,
}

impl ScrubType {
    pub const ALL: [Self; 11] = [
        Self::Probe,
        Self::Superblock,
        Self::Agf,
        Self::Agfl,
        Self::Agi,
        Self::Bnobt,
        Self::Cntbt,
        Self::Inobt,
        Self::Finobt,
        Self::Rmapbt,
        Self::Refcountbt,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Superblock => "sb",
            Self::Agf => "agf",
            Self::Agfl => "agfl",
            Self::Agi => "agi",
            Self::Bnobt => "bnobt",
            Self::Cntbt => "cntbt",
            Self::Inobt => "inobt",
            Self::Finobt => "finobt",
            Self::Rmapbt => "rmapbt",
            Self::Refcountbt => "refcountbt",
        }
    }
}

impl fmt::Display for ScrubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScrubType {
    type Err = ScrubError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| ScrubError::NotFound(format!("unknown scrub type {s:?}")))
    }
}

/// One scrub invocation's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubRequest {
    pub scrub_type: ScrubType,
    #[serde(default)]
    pub agno: u32,
    #[serde(default)]
    pub ino: u64,
    #[serde(default)]
    pub r#gen: u32,
    #[serde(default)]
    pub flags: ScrubFlags,
}

impl ScrubRequest {
    #[must_use]
    pub fn new(scrub_type: ScrubType) -> Self {
        Self {
            scrub_type,
            agno: 0,
            ino: 0,
            r#gen: 0,
            flags: ScrubFlags::default(),
        }
    }

    #[must_use]
    pub fn for_ag(scrub_type: ScrubType, agno: u32) -> Self {
        Self {
            agno,
            ..Self::new(scrub_type)
        }
    }
}

// ── Invocation context ──────────────────────────────────────────────────────

/// Everything one scrub invocation owns.
pub struct ScrubContext<'m> {
    pub mount: &'m ScrubMount,
    pub request: ScrubRequest,
    pub outcome: ScrubOutcome,
    /// The AG being scrubbed, once set up.
    pub sa: AgContext,
    pub locks: AgLockSet<'m>,
    /// Conservative mode: every AG was locked before setup.
    pub try_harder: bool,
}

impl<'m> ScrubContext<'m> {
    pub fn new(mount: &'m ScrubMount, request: ScrubRequest, try_harder: bool) -> Result<Self> {
        let mut locks = AgLockSet::new(mount);
        if try_harder {
            locks.lock_all()?;
        }
        Ok(Self {
            mount,
            request,
            outcome: ScrubOutcome::new(),
            sa: AgContext::empty(),
            locks,
            try_harder,
        })
    }

    /// Release the AG context and every lock. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        self.sa.release(&mut self.locks);
        self.locks.release_all();
    }
}

impl Drop for ScrubContext<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fscrub_block::MemBlockDevice;
    use fscrub_ondisk::sb::{Features2, IncompatFeatures, RoCompatFeatures, SB_VERSION_5};

    fn mount(agcount: u32) -> ScrubMount {
        let cx = Cx::for_testing();
        let dev = MemBlockDevice::new(512, u64::from(agcount) * 64).expect("dev");
        let sb = Superblock {
            block_size: 512,
            dblocks: u64::from(agcount) * 64,
            agblocks: 64,
            agcount,
            uuid: [1; 16],
            versionnum: SB_VERSION_5,
            sectsize: 512,
            inodesize: 256,
            inopblock: 2,
            features_compat: 0,
            features_ro_compat: RoCompatFeatures(0),
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
        };
        dev.write_block(&cx, fscrub_types::BlockNumber(0), &sb.to_block(512).expect("sb"))
            .expect("write");
        ScrubMount::open(&cx, Arc::new(dev)).expect("open")
    }

    #[test]
    fn lock_order_is_enforced() {
        let mount = mount(3);
        let mut locks = AgLockSet::new(&mount);
        locks.lock(AgNumber(1)).expect("first");
        locks.lock(AgNumber(2)).expect("higher");
        locks.lock(AgNumber(1)).expect("re-entry");
        let err = locks.lock(AgNumber(0)).expect_err("lower");
        assert!(matches!(err, ScrubError::Deadlock { wanted: 0, held: 2 }));
        assert!(err.is_retryable());

        locks.unlock(AgNumber(1));
        assert!(locks.is_held(AgNumber(1)), "still referenced once");
        locks.unlock(AgNumber(1));
        assert!(!locks.is_held(AgNumber(1)));
        locks.release_all();
        assert_eq!(locks.held_count(), 0);
    }

    #[test]
    fn conservative_mode_never_deadlocks() {
        let mount = mount(3);
        let mut sc = ScrubContext::new(&mount, ScrubRequest::new(ScrubType::Probe), true)
            .expect("context");
        assert_eq!(sc.locks.held_count(), 3);
        sc.locks.lock(AgNumber(2)).expect("lock 2");
        sc.locks.lock(AgNumber(0)).expect("lock 0 after 2");
        sc.teardown();
        assert_eq!(sc.locks.held_count(), 0);
    }

    #[test]
    fn out_of_range_ag_is_invalid() {
        let mount = mount(1);
        let mut locks = AgLockSet::new(&mount);
        assert!(matches!(
            locks.lock(AgNumber(5)),
            Err(ScrubError::InvalidArgument(_))
        ));
    }

    #[test]
    fn open_rejects_foreign_block_size() {
        let cx = Cx::for_testing();
        let m = mount(1);
        let sb_block = m
            .device()
            .read_block(&cx, fscrub_types::BlockNumber(0))
            .expect("read");
        let dev = MemBlockDevice::new(1024, 64).expect("dev");
        let mut padded = sb_block.into_inner();
        padded.resize(1024, 0);
        dev.write_block(&cx, fscrub_types::BlockNumber(0), &padded)
            .expect("write");
        assert!(matches!(
            ScrubMount::open(&cx, Arc::new(dev)),
            Err(ScrubError::Format(_)) | Err(ScrubError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn request_round_trips_through_json() {
        let req = ScrubRequest::for_ag(ScrubType::Rmapbt, 2);
        let json = serde_json::to_string(&req).expect("json");
        assert!(json.contains("\"rmapbt\""));
        let back: ScrubRequest = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, req);
        let minimal: ScrubRequest =
            serde_json::from_str(r#"{"scrub_type":"agf"}"#).expect("defaults");
        assert_eq!(minimal, ScrubRequest::new(ScrubType::Agf));
        assert_eq!("cntbt".parse::<ScrubType>().expect("parse"), ScrubType::Cntbt);
        assert!("bogus".parse::<ScrubType>().is_err());
    }
}
