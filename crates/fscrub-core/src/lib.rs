#![forbid(unsafe_code)]
//! Online scrub engine.
//!
//! A scrub invocation checks one piece of metadata (an AG header or one of
//! an AG's btrees) on a mounted filesystem without modifying it. Findings
//! accumulate in a [`ScrubOutcome`]; only operational failures come back as
//! errors.
//!
//! ```text
//! scrub_metadata ─► ScrubOps::setup ─► AgContext::acquire (AGI, AGF, AGFL, cursors)
//!                └► ScrubOps::scrub ─► scrub_btree / scrub_da_btree / header checks
//!                                        └► ScrubOutcome (CORRUPT, PREEN, XFAIL, ...)
//! ```
//!
//! Locking follows AG number order. A check that would take a lower AG than
//! one it already holds gets [`fscrub_error::ScrubError::Deadlock`], and the
//! dispatcher re-runs the whole invocation once with every AG locked.

pub mod ag;
pub mod agheader;
pub mod alloc;
pub mod btree_scrub;
pub mod check;
pub mod config;
pub mod context;
pub mod dabtree;
pub mod dispatch;
pub mod owner;

#[cfg(test)]
mod testutil;

pub use ag::{AgContext, AgTarget};
pub use btree_scrub::{RecordSite, scrub_btree};
pub use check::{Axis, Finding, Fork, HeaderKind, Location, ScrubFlags, ScrubOutcome};
pub use config::{RetryPolicy, ScrubOptions};
pub use context::{AgLockSet, ScrubContext, ScrubMount, ScrubRequest, ScrubType};
pub use dabtree::{DaBlockMap, DaRecord, DaTarget, ForkFormat, scrub_da_btree};
pub use dispatch::{ScrubOps, run_scrub, scrub_metadata};
pub use owner::OwnerCheckQueue;

use asupersync::Cx;
use fscrub_error::{Result, ScrubError};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| ScrubError::Cancelled)
}
