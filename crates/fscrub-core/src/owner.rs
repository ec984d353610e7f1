//! Block ownership cross-checks and the deferred owner-check queue.
//!
//! Checking that a block of the free-space-by-block tree is not free space
//! would need a second cursor into the tree being walked. Those checks are
//! queued during the walk and replayed afterwards, one short-lived AG
//! context per group.

use crate::ag::AgContext;
use crate::check::{Axis, Location, ScrubOutcome};
use crate::context::ScrubContext;
use asupersync::Cx;
use fscrub_btree::WalkControl;
use fscrub_error::Result;
use fscrub_ondisk::BtreeId;
use fscrub_ondisk::records::{AllocRec, RmapKey};
use fscrub_types::{AgBlock, AgNumber, BlockNumber};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Cross-check that `agbno` is in use and, if reverse mappings exist, that
/// one of them assigns it to `owner`.
pub(crate) fn xref_block_owner(
    cx: &Cx,
    outcome: &mut ScrubOutcome,
    sa: &mut AgContext,
    agbno: AgBlock,
    owner: u64,
    location: &Location,
) -> Result<()> {
    if let Some(cur) = sa.bno_cur.as_ref() {
        let key = AllocRec {
            startblock: agbno.0,
            blockcount: 1,
        };
        let free = cur.has_record(cx, &key, &key);
        if let Some(free) = outcome.xref_result(free, &mut sa.bno_cur, location)? {
            outcome.check(
                !free,
                Axis::XrefCorrupt,
                location,
                "block is recorded as free space",
            );
        }
    }
    if let Some(cur) = sa.rmap_cur.as_ref() {
        let mut owned = false;
        let found = cur.query_range(cx, &RmapKey::low(agbno.0), &RmapKey::high(agbno.0), |rec| {
            if rec.covers(agbno.0) && rec.owner == owner {
                owned = true;
                return Ok(WalkControl::Stop);
            }
            Ok(WalkControl::Continue)
        });
        if outcome.xref_result(found, &mut sa.rmap_cur, location)?.is_some() {
            outcome.check(
                owned,
                Axis::XrefCorrupt,
                location,
                &format!("no reverse mapping to owner {owner:#x}"),
            );
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deferred {
    fsb: BlockNumber,
    level: usize,
}

/// Owner checks postponed until a walk has finished.
#[derive(Debug, Default)]
pub struct OwnerCheckQueue {
    entries: Vec<Deferred>,
}

impl OwnerCheckQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&mut self, fsb: BlockNumber, level: usize) {
        trace!(block = fsb.0, level, "owner_check_deferred");
        self.entries.push(Deferred { fsb, level });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replay every queued check, then empty the queue.
    ///
    /// `pending` is the walk's own result. Entries are only evaluated while
    /// no error is pending and the walk ran to completion; whatever is left
    /// is discarded and the first error is returned.
    pub fn drain(
        &mut self,
        cx: &Cx,
        sc: &mut ScrubContext<'_>,
        btree: BtreeId,
        owner: u64,
        pending: Result<()>,
        cancelled: bool,
    ) -> Result<()> {
        let entries = std::mem::take(&mut self.entries);
        if entries.is_empty() {
            return pending;
        }
        if cancelled || pending.is_err() {
            debug!(btree = %btree, discarded = entries.len(), "owner_check_discarded");
            return pending;
        }

        let geo = *sc.mount.geometry();
        let mut groups: BTreeMap<AgNumber, Vec<Deferred>> = BTreeMap::new();
        for entry in entries {
            groups
                .entry(geo.fsb_to_agno(entry.fsb))
                .or_default()
                .push(entry);
        }

        for (agno, group) in groups {
            let mut xsa = AgContext::acquire_xref(cx, sc.mount, &mut sc.locks, agno)?;
            let mut result = Ok(());
            for entry in &group {
                let location = Location::Btree {
                    btree,
                    level: entry.level,
                    block: entry.fsb.0,
                    index: 0,
                };
                result = xref_block_owner(
                    cx,
                    &mut sc.outcome,
                    &mut xsa,
                    geo.fsb_to_agbno(entry.fsb),
                    owner,
                    &location,
                );
                if result.is_err() {
                    break;
                }
            }
            xsa.release(&mut sc.locks);
            trace!(btree = %btree, agno = agno.0, checked = group.len(), "owner_check_drained");
            result?;
        }
        Ok(())
    }
}
