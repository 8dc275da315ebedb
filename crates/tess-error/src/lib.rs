#![forbid(unsafe_code)]
//! Error types for the TessFS allocation engine.
//!
//! # Error Taxonomy
//!
//! | Variant | Meaning | Containment |
//! |---------|---------|-------------|
//! | `NoSpace` | every criteria tier exhausted, reclaimable preallocations already discarded | terminal for the request |
//! | `Corrupt` | bitmap/free-count mismatch or double-free in one group | contained per group; the group refuses further allocation, the filesystem keeps running |
//! | `QuotaExceeded` | quota callback refused the charge | terminal, never retried |
//! | `Device` | discard/bitmap I/O failure surfaced to the caller | propagated only where the caller asked for the device work (trim); best-effort discards log instead |
//! | `Cancelled` | `Cx` checkpoint tripped mid-operation | no partial mutation left visible |
//! | `InvalidRequest` | caller-supplied range/length is malformed | terminal |
//!
//! Corruption is never escalated to a whole-filesystem abort: the flagged
//! group is withdrawn from the selector's candidate indices and every other
//! group stays allocatable.

use thiserror::Error;

/// Unified error type for allocator operations.
#[derive(Debug, Error)]
pub enum AllocError {
    /// Operating system I/O error from the bitmap accessor.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No extent found after exhausting all criteria tiers and discarding
    /// reclaimable preallocations.
    #[error("no space left on device")]
    NoSpace,

    /// Per-group accounting no longer reconciles with the live bitmap
    /// (free-count mismatch, double-free, double-allocate). The group is
    /// flagged and refuses further allocation.
    #[error("group {group} corrupt: {detail}")]
    Corrupt { group: u32, detail: String },

    /// The quota callback refused to charge the requested clusters.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// Device-level failure (discard issuance during an explicit trim).
    #[error("device error: {0}")]
    Device(String),

    /// Cooperative cancellation via `Cx` checkpoint.
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed caller request (zero length, range crossing a group
    /// boundary, out-of-range cluster).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl AllocError {
    /// Convert into a POSIX errno for VFS-facing callers.
    ///
    /// The mapping is exhaustive — adding a variant without an arm here is
    /// a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoSpace => libc::ENOSPC,
            Self::Corrupt { .. } => libc::EIO,
            Self::QuotaExceeded => libc::EDQUOT,
            Self::Device(_) => libc::EIO,
            Self::Cancelled => libc::EINTR,
            Self::InvalidRequest(_) => libc::EINVAL,
        }
    }

    /// Whether the error is contained to a single group (the filesystem as
    /// a whole keeps operating).
    #[must_use]
    pub fn is_contained(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

impl From<tess_types::Cancelled> for AllocError {
    fn from(_: tess_types::Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Result alias using `AllocError`.
pub type Result<T> = std::result::Result<T, AllocError>;
