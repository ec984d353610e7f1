//! Severity classification.
//!
//! Every structural check funnels through [`ScrubOutcome`]: a failed check
//! sets one output flag, appends a [`Finding`] and emits a tracing event.
//! Operation results are sorted into "absorb as corruption" versus
//! "propagate" by [`ScrubOutcome::op_result`] and
//! [`ScrubOutcome::xref_result`].

use fscrub_error::{ErrorClass, Result, ScrubError};
use fscrub_ondisk::BtreeId;
use fscrub_types::{describe_flags, format_flags};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

// ── Flags ───────────────────────────────────────────────────────────────────

/// Request and outcome bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScrubFlags(pub u32);

impl ScrubFlags {
    /// Input: repair whatever is found. Never supported.
    pub const REPAIR: Self = Self(1 << 0);
    pub const CORRUPT: Self = Self(1 << 1);
    /// Could be optimised, nothing is wrong.
    pub const PREEN: Self = Self(1 << 2);
    /// A cross-referencing query failed.
    pub const XFAIL: Self = Self(1 << 3);
    /// Disagrees with another structure.
    pub const XCORRUPT: Self = Self(1 << 4);
    /// Check stopped before covering everything.
    pub const INCOMPLETE: Self = Self(1 << 5);
    pub const WARNING: Self = Self(1 << 6);

    pub const INPUT_MASK: Self = Self::REPAIR;
    pub const OUTPUT_MASK: Self = Self(0x7E);

    const KNOWN: &[(u32, &'static str)] = &[
        (1 << 0, "REPAIR"),
        (1 << 1, "CORRUPT"),
        (1 << 2, "PREEN"),
        (1 << 3, "XFAIL"),
        (1 << 4, "XCORRUPT"),
        (1 << 5, "INCOMPLETE"),
        (1 << 6, "WARNING"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn intersects(self, mask: Self) -> bool {
        (self.0 & mask.0) != 0
    }

    pub fn insert(&mut self, flag: Self) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: Self) {
        self.0 &= !flag.0;
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }
}

impl fmt::Display for ScrubFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

// ── Findings ────────────────────────────────────────────────────────────────

/// Which outcome bit a failed check sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Corrupt,
    Preen,
    XrefCorrupt,
    XrefFailed,
    Warning,
    Incomplete,
}

impl Axis {
    #[must_use]
    pub fn flag(self) -> ScrubFlags {
        match self {
            Self::Corrupt => ScrubFlags::CORRUPT,
            Self::Preen => ScrubFlags::PREEN,
            Self::XrefCorrupt => ScrubFlags::XCORRUPT,
            Self::XrefFailed => ScrubFlags::XFAIL,
            Self::Warning => ScrubFlags::WARNING,
            Self::Incomplete => ScrubFlags::INCOMPLETE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderKind {
    Superblock,
    Agf,
    Agfl,
    Agi,
}

impl HeaderKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Superblock => "sb",
            Self::Agf => "agf",
            Self::Agfl => "agfl",
            Self::Agi => "agi",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fork {
    Data,
    Attr,
}

/// Where a finding was made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    Fs,
    Header {
        agno: u32,
        header: HeaderKind,
    },
    Btree {
        btree: BtreeId,
        level: usize,
        block: u64,
        index: usize,
    },
    DaTree {
        ino: u64,
        fork: Fork,
        level: usize,
        dablk: u32,
    },
    Inode {
        ino: u64,
    },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fs => f.write_str("fs"),
            Self::Header { agno, header } => write!(f, "ag {agno} {}", header.name()),
            Self::Btree {
                btree,
                level,
                block,
                index,
            } => write!(f, "{btree} level {level} block {block} slot {index}"),
            Self::DaTree {
                ino,
                fork,
                level,
                dablk,
            } => write!(f, "ino {ino} {fork:?} fork level {level} dablk {dablk}"),
            Self::Inode { ino } => write!(f, "ino {ino}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub axis: Axis,
    pub location: Location,
    pub detail: String,
}

// ── Outcome ─────────────────────────────────────────────────────────────────

/// Accumulated result of one scrub invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubOutcome {
    pub flags: ScrubFlags,
    pub findings: Vec<Finding>,
}

impl ScrubOutcome {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed check.
    pub fn set(&mut self, axis: Axis, location: &Location, detail: impl Into<String>) {
        let detail = detail.into();
        match axis {
            Axis::Corrupt | Axis::XrefCorrupt | Axis::XrefFailed => warn!(
                target: "fscrub::check",
                axis = ?axis,
                location = %location,
                detail = %detail,
                "scrub_corruption"
            ),
            Axis::Preen | Axis::Warning | Axis::Incomplete => debug!(
                target: "fscrub::check",
                axis = ?axis,
                location = %location,
                detail = %detail,
                "scrub_notice"
            ),
        }
        self.flags.insert(axis.flag());
        self.findings.push(Finding {
            axis,
            location: location.clone(),
            detail,
        });
    }

    /// Record a finding on `axis` unless `ok`; returns `ok` so checks can
    /// guard further work.
    pub fn check(&mut self, ok: bool, axis: Axis, location: &Location, detail: &str) -> bool {
        if !ok {
            self.set(axis, location, detail);
        }
        ok
    }

    /// Sort an operation result.
    ///
    /// Corruption is absorbed into CORRUPT and yields `Ok(None)`; a retryable
    /// deadlock and every other error propagate.
    pub fn op_result<T>(&mut self, result: Result<T>, location: &Location) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.class() == ErrorClass::Corruption => {
                self.set(Axis::Corrupt, location, err.to_string());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Sort the result of a cross-reference query against `oracle`.
    ///
    /// Any failure drops the oracle cursor. Corruption in the oracle sets
    /// XFAIL and yields `Ok(None)`; other errors propagate.
    pub fn xref_result<T, C>(
        &mut self,
        result: Result<T>,
        oracle: &mut Option<C>,
        location: &Location,
    ) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                *oracle = None;
                if err.is_corruption() {
                    self.set(Axis::XrefFailed, location, err.to_string());
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    #[must_use]
    pub fn has(&self, flag: ScrubFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Direct or cross-referenced corruption was found.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.flags
            .intersects(ScrubFlags(ScrubFlags::CORRUPT.0 | ScrubFlags::XCORRUPT.0))
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.flags.is_empty()
    }

    /// Count of findings on one axis.
    #[must_use]
    pub fn count(&self, axis: Axis) -> usize {
        self.findings.iter().filter(|f| f.axis == axis).count()
    }
}

/// Turn a cancelled operation into INCOMPLETE.
///
/// Returns `Ok(None)` when the error was a cancellation.
pub(crate) fn absorb_cancel<T>(
    outcome: &mut ScrubOutcome,
    result: Result<T>,
    location: &Location,
) -> Result<Option<T>> {
    match result {
        Err(ScrubError::Cancelled) => {
            outcome.set(Axis::Incomplete, location, "scrub cancelled");
            Ok(None)
        }
        other => other.map(Some),
    }
}
