#![forbid(unsafe_code)]
//! Error types for FrankenScrub.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `fscrub-types` | Byte-level format violations |
//! | Runtime | `ScrubError` | `fscrub-error` (this crate) | Everything a scrub invocation can return |
//!
//! `ParseError` becomes `ScrubError::Corruption` at the `fscrub-ondisk`
//! boundary, where the block number is known.
//!
//! ## Classification
//!
//! The scrub engine never inspects variants directly; it asks for an
//! [`ErrorClass`]:
//!
//! | Class | Variants | Engine behaviour |
//! |-------|----------|------------------|
//! | `Corruption` | `Corruption`, `ChecksumMismatch` | recorded as a finding, scan continues |
//! | `Retryable` | `Deadlock` | whole invocation unwinds and is retried once with every AG locked |
//! | `Fatal` | everything else | walk aborts and the error propagates |
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EUCLEAN` |
//! | `ChecksumMismatch` | `EBADMSG` |
//! | `Format` / `Parse` / `InvalidArgument` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `Unsupported` | `EOPNOTSUPP` |
//! | `Deadlock` | `EDEADLK` |
//! | `Cancelled` | `EINTR` |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata at `block` failed a structural check while being loaded.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Stored crc32c does not match the block contents.
    #[error("checksum mismatch at block {block}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        block: u64,
        stored: u32,
        computed: u32,
    },

    /// The device or image is not something we can scrub at all.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("parse error: {0}")]
    Parse(String),

    /// Malformed scrub request (bad AG number, unknown flag bits).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Scrub type unknown or its feature is absent on this filesystem.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Taking AG `wanted` while holding a higher-numbered AG would invert the
    /// global lock order.
    #[error("lock order violation: wanted AG {wanted} while holding AG {held}")]
    Deadlock { wanted: u32, held: u32 },

    /// Operation cancelled via `Cx`.
    #[error("operation cancelled")]
    Cancelled,
}

/// How the scrub engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Corruption,
    Retryable,
    Fatal,
}

impl ScrubError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Corruption { .. } | Self::ChecksumMismatch { .. } => ErrorClass::Corruption,
            Self::Deadlock { .. } => ErrorClass::Retryable,
            Self::Io(_)
            | Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidArgument(_)
            | Self::NotFound(_)
            | Self::Unsupported(_)
            | Self::Cancelled => ErrorClass::Fatal,
        }
    }

    #[must_use]
    pub fn is_corruption(&self) -> bool {
        self.class() == ErrorClass::Corruption
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Block number carried by corruption variants.
    #[must_use]
    pub fn block(&self) -> Option<u64> {
        match self {
            Self::Corruption { block, .. } | Self::ChecksumMismatch { block, .. } => Some(*block),
            _ => None,
        }
    }

    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EUCLEAN,
            Self::ChecksumMismatch { .. } => libc::EBADMSG,
            Self::Format(_) | Self::Parse(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::Deadlock { .. } => libc::EDEADLK,
            Self::Cancelled => libc::EINTR,
        }
    }
}

/// Result alias using `ScrubError`.
pub type Result<T> = std::result::Result<T, ScrubError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn corrupt() -> ScrubError {
        ScrubError::Corruption {
            block: 7,
            detail: "bad level".into(),
        }
    }

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(ScrubError, libc::c_int)> = vec![
            (ScrubError::Io(std::io::Error::other("test")), libc::EIO),
            (corrupt(), libc::EUCLEAN),
            (
                ScrubError::ChecksumMismatch {
                    block: 1,
                    stored: 0,
                    computed: 1,
                },
                libc::EBADMSG,
            ),
            (ScrubError::Format("test".into()), libc::EINVAL),
            (ScrubError::Parse("test".into()), libc::EINVAL),
            (ScrubError::InvalidArgument("agno".into()), libc::EINVAL),
            (ScrubError::NotFound("rmapbt".into()), libc::ENOENT),
            (ScrubError::Unsupported("repair".into()), libc::EOPNOTSUPP),
            (ScrubError::Deadlock { wanted: 0, held: 1 }, libc::EDEADLK),
            (ScrubError::Cancelled, libc::EINTR),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(ScrubError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn classification() {
        assert_eq!(corrupt().class(), ErrorClass::Corruption);
        assert!(
            ScrubError::ChecksumMismatch {
                block: 3,
                stored: 1,
                computed: 2
            }
            .is_corruption()
        );
        assert!(ScrubError::Deadlock { wanted: 1, held: 2 }.is_retryable());
        assert_eq!(ScrubError::Cancelled.class(), ErrorClass::Fatal);
        assert_eq!(
            ScrubError::Io(std::io::Error::other("eio")).class(),
            ErrorClass::Fatal
        );
        assert_eq!(corrupt().block(), Some(7));
        assert_eq!(ScrubError::Cancelled.block(), None);
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            corrupt().to_string(),
            "corrupt metadata at block 7: bad level"
        );
        assert_eq!(
            ScrubError::ChecksumMismatch {
                block: 9,
                stored: 0xAB,
                computed: 0xCD
            }
            .to_string(),
            "checksum mismatch at block 9: stored 0x000000ab, computed 0x000000cd"
        );
        assert_eq!(
            ScrubError::Deadlock { wanted: 0, held: 2 }.to_string(),
            "lock order violation: wanted AG 0 while holding AG 2"
        );
    }
}
