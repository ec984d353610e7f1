//! Dispatcher options.

use serde::{Deserialize, Serialize};

/// What to do when a scrub reports a lock-order hazard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Return the deadlock to the caller.
    Never,
    /// Tear down, lock every AG up front and run once more.
    #[default]
    OnceConservative,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrubOptions {
    pub retry: RetryPolicy,
    /// Lock every AG before the first attempt.
    pub start_conservative: bool,
}
