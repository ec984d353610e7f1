#![forbid(unsafe_code)]
//! Image builders and whole-filesystem scrub reports.

pub mod image;

pub use image::{AgLayout, Image, ImageSpec, TreeInfo, open_image, tree_blocks};

use asupersync::Cx;
use fscrub_core::{ScrubMount, ScrubOptions, ScrubOutcome, ScrubRequest, ScrubType, scrub_metadata};
use fscrub_error::ScrubError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result of one scrub invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub scrub_type: ScrubType,
    pub agno: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ScrubOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReportEntry {
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.outcome.as_ref().is_some_and(ScrubOutcome::is_corrupt)
    }
}

/// Every scrub run against one filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubReport {
    pub entries: Vec<ReportEntry>,
    pub clean: usize,
    pub corrupt: usize,
    pub errors: usize,
}

impl ScrubReport {
    pub fn record(&mut self, entry: ReportEntry) {
        if entry.error.is_some() {
            self.errors += 1;
        } else if entry.is_corrupt() {
            self.corrupt += 1;
        } else if entry.outcome.as_ref().is_some_and(ScrubOutcome::is_clean) {
            self.clean += 1;
        }
        self.entries.push(entry);
    }

    #[must_use]
    pub fn has_problems(&self) -> bool {
        self.corrupt > 0 || self.errors > 0
    }
}

/// Run one scrub type against one AG.
pub fn scrub_one(
    cx: &Cx,
    mount: &ScrubMount,
    scrub_type: ScrubType,
    agno: u32,
    options: &ScrubOptions,
) -> ReportEntry {
    let request = ScrubRequest::for_ag(scrub_type, agno);
    let (outcome, error) = match scrub_metadata(cx, mount, request, options) {
        Ok(outcome) => (Some(outcome), None),
        Err(err) => (None, Some(err.to_string())),
    };
    ReportEntry {
        scrub_type,
        agno,
        outcome,
        error,
    }
}

/// Run every scrub type the filesystem has, across all AGs.
///
/// Types whose feature is absent are skipped rather than reported.
pub fn scrub_all(cx: &Cx, mount: &ScrubMount, options: &ScrubOptions) -> ScrubReport {
    let mut report = ScrubReport::default();
    for scrub_type in ScrubType::ALL {
        let agnos = if scrub_type == ScrubType::Probe {
            0..1
        } else {
            0..mount.geometry().agcount
        };
        for agno in agnos {
            let request = ScrubRequest::for_ag(scrub_type, agno);
            match scrub_metadata(cx, mount, request, options) {
                Err(ScrubError::NotFound(why)) => {
                    debug!(scrub_type = %scrub_type, why = %why, "scrub_type_skipped");
                    break;
                }
                Ok(outcome) => report.record(ReportEntry {
                    scrub_type,
                    agno,
                    outcome: Some(outcome),
                    error: None,
                }),
                Err(err) => report.record(ReportEntry {
                    scrub_type,
                    agno,
                    outcome: None,
                    error: Some(err.to_string()),
                }),
            }
        }
    }
    report
}
