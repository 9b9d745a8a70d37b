//! # Error Taxonomy
//!
//! All fallible operations in coremap return `eyre::Result` with rich context,
//! and every failure that callers are expected to branch on carries a
//! [`StoreError`] at the root of the report chain. Match on the kind with
//! `report.downcast_ref::<StoreError>()`.
//!
//! ## Kinds
//!
//! - `CorruptFormat`: header magic or a sanity check failed on open.
//! - `IncompatibleVersion`: format version outside the supported range.
//! - `CapacityExhausted`: an insert would push a segment past its bloat limit.
//! - `ChecksumMismatch`: surfaced only by recovery or explicit verification,
//!   never on the normal read path.
//! - `Poisoned`: the segment was flagged inconsistent (a lock holder died);
//!   the caller must run recovery before trusting its contents.
//! - `Deadlock`: an illegal re-entrant lock upgrade inside one query context.
//! - `RecoveryFailed`: self-describing recovery could not trust the header.
//! - `Io`: the underlying mmap, flush, or file extension failed. Transient
//!   flush failures are reported but do not mark the region corrupt.

use thiserror::Error;

/// Failure kinds surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupt region format: {0}")]
    CorruptFormat(String),

    #[error("incompatible format version {found} (supported {min}..={max})")]
    IncompatibleVersion { found: u32, min: u32, max: u32 },

    #[error("segment {segment} is out of space (bloat limit {max_bloat_factor} reached)")]
    CapacityExhausted { segment: u32, max_bloat_factor: f64 },

    #[error("entry checksum mismatch in segment {segment}")]
    ChecksumMismatch { segment: u32 },

    #[error("segment {segment} is flagged inconsistent; run recovery before reuse")]
    Poisoned { segment: u32 },

    #[error("illegal re-entrant lock upgrade on segment {segment}")]
    Deadlock { segment: u32 },

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True when the report chain bottoms out in this error kind.
    ///
    /// Convenience for tests and retry loops that only care about one kind.
    pub fn is_kind(report: &eyre::Report, f: impl Fn(&StoreError) -> bool) -> bool {
        report.downcast_ref::<StoreError>().map(f).unwrap_or(false)
    }
}
