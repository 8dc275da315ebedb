#![forbid(unsafe_code)]
//! Core types shared across the TessFS allocation engine.
//!
//! Everything here is a unit-carrying wrapper or pure arithmetic: no locks,
//! no I/O. The newtypes exist so that cluster numbers, group numbers, and
//! logical (file-relative) block numbers cannot be mixed up silently.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Absolute physical cluster number on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterNumber(pub u64);

/// File-relative logical block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlock(pub u32);

/// Allocation-group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Inode number, used only as an opaque key for per-file preallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Journal transaction id. Frees deferred under a transaction become
/// visible only once the owning transaction is durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl ClusterNumber {
    /// Add a cluster count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, clusters: u64) -> Option<Self> {
        self.0.checked_add(clusters).map(Self)
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Fixed allocation geometry, derived once at mount time.
///
/// Groups tile the cluster space: group `g` covers absolute clusters
/// `[first_cluster + g * clusters_per_group, ...)`. The last group may be
/// shorter than `clusters_per_group`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocGeometry {
    /// Cluster size in bytes (power of two).
    pub cluster_size: u32,
    /// Clusters per full group (power of two).
    pub clusters_per_group: u32,
    /// Number of groups.
    pub group_count: u32,
    /// Total clusters on the device.
    pub total_clusters: u64,
    /// Absolute cluster number where group 0 starts.
    pub first_cluster: u32,
}

/// Geometry validation failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid geometry: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

impl AllocGeometry {
    /// Validate and construct. `clusters_per_group` and `cluster_size` must
    /// be powers of two, and the group count must cover `total_clusters`.
    pub fn new(
        cluster_size: u32,
        clusters_per_group: u32,
        total_clusters: u64,
        first_cluster: u32,
    ) -> Result<Self, GeometryError> {
        if !cluster_size.is_power_of_two() {
            return Err(GeometryError::InvalidField {
                field: "cluster_size",
                reason: "must be a power of two",
            });
        }
        if !clusters_per_group.is_power_of_two() {
            return Err(GeometryError::InvalidField {
                field: "clusters_per_group",
                reason: "must be a power of two",
            });
        }
        let usable = total_clusters.saturating_sub(u64::from(first_cluster));
        if usable == 0 {
            return Err(GeometryError::InvalidField {
                field: "total_clusters",
                reason: "no clusters past first_cluster",
            });
        }
        let group_count = usable.div_ceil(u64::from(clusters_per_group));
        let group_count = u32::try_from(group_count).map_err(|_| GeometryError::InvalidField {
            field: "group_count",
            reason: "overflows u32",
        })?;
        Ok(Self {
            cluster_size,
            clusters_per_group,
            group_count,
            total_clusters,
            first_cluster,
        })
    }

    /// Number of buddy orders: order 0 (single cluster) up to and including
    /// a chunk spanning the whole group.
    #[must_use]
    pub fn order_count(&self) -> u32 {
        self.clusters_per_group.ilog2() + 1
    }

    /// Clusters in `group` (the last group may be short).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn clusters_in_group(&self, group: GroupNumber) -> u32 {
        let start = u64::from(self.first_cluster)
            + u64::from(group.0) * u64::from(self.clusters_per_group);
        let remaining = self.total_clusters.saturating_sub(start);
        if remaining >= u64::from(self.clusters_per_group) {
            self.clusters_per_group
        } else {
            remaining as u32
        }
    }

    /// Absolute cluster number for a group-relative offset.
    #[must_use]
    pub fn group_to_cluster(&self, group: GroupNumber, rel: u32) -> ClusterNumber {
        ClusterNumber(
            u64::from(self.first_cluster)
                + u64::from(group.0) * u64::from(self.clusters_per_group)
                + u64::from(rel),
        )
    }

    /// Convert an absolute cluster to `(group, group-relative offset)`.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn cluster_to_group(&self, cluster: ClusterNumber) -> (GroupNumber, u32) {
        let rel = cluster.0.saturating_sub(u64::from(self.first_cluster));
        let group = (rel / u64::from(self.clusters_per_group)) as u32;
        let offset = (rel % u64::from(self.clusters_per_group)) as u32;
        (GroupNumber(group), offset)
    }

    /// Whether `[start, start + count)` stays within one group.
    #[must_use]
    pub fn within_one_group(&self, start: ClusterNumber, count: u32) -> bool {
        if count == 0 {
            return true;
        }
        let (group, rel) = self.cluster_to_group(start);
        group.0 < self.group_count
            && u64::from(rel) + u64::from(count) <= u64::from(self.clusters_in_group(group))
    }
}

// ── Cancellation context ────────────────────────────────────────────────────

/// Cancellation raised by [`Cx::checkpoint`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Cooperative cancellation context.
///
/// Long-running allocator operations (whole-filesystem scans, bulk frees,
/// trims) call [`checkpoint`](Self::checkpoint) at loop boundaries and at
/// points where a group lock can safely be dropped. A `Cx` carries an
/// explicit cancel flag and an optional deadline; both make `checkpoint`
/// fail once tripped.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cx {
    /// A context that never cancels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context for tests; identical to [`new`](Self::new), named to match
    /// call sites that want to signal intent.
    #[must_use]
    pub fn for_testing() -> Self {
        Self::new()
    }

    /// A context that cancels once `deadline` passes.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Handle that cancels this context (and all its clones) when invoked.
    #[must_use]
    pub fn canceller(&self) -> CancelHandle {
        CancelHandle {
            cancel: Arc::clone(&self.cancel),
        }
    }

    /// Fail if the context has been cancelled or its deadline has passed.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Cancelled);
        }
        Ok(())
    }

    /// Whether cancellation has been requested (deadline not consulted).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Owner side of a [`Cx`]: trips the cancel flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancel: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for ClusterNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
