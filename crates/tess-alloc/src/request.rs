//! Allocation request, per-call context, and request normalization.
//!
//! The context carries the small status machine every allocation walks:
//! `Continue` while scanning, `Found` once a candidate is committed to the
//! buddy, `Break` when the scan budget expires and the best candidate seen
//! so far is taken instead.

use crate::config::AllocConfig;
use crate::prealloc::FilePaIndex;
use serde::{Deserialize, Serialize};
use tess_types::{AllocGeometry, ClusterNumber, GroupNumber, InodeNumber, LogicalBlock};
use tracing::debug;

// Caller-visible request flags.
/// Metadata request: no normalization, no preallocation.
pub const HINT_METADATA: u32 = 0x0001;
/// Allocate exactly at the goal or fail; goal window is not grown.
pub const HINT_GOAL_ONLY: u32 = 0x0002;
/// Do not create a new preallocation from surplus space.
pub const HINT_NO_PREALLOC: u32 = 0x0004;
/// Accept a shorter-than-goal extent at the goal position (the caller is
/// merging into an adjacent extent).
pub const HINT_MERGE: u32 = 0x0008;

// Internal flags, continuing the same bit space.
/// Goal position is worth probing before the criteria walk.
pub(crate) const HINT_TRY_GOAL: u32 = 0x0100;
/// Take the first usable extent; set when a found best was lost to a race.
pub(crate) const HINT_FIRST: u32 = 0x0200;
/// Stream allocation: goal follows the allocator-wide last allocation.
pub(crate) const HINT_STREAM: u32 = 0x0400;
/// Locality-group allocation for small data requests.
pub(crate) const HINT_GROUP_ALLOC: u32 = 0x0800;

const CALLER_FLAGS: u32 = HINT_METADATA | HINT_GOAL_ONLY | HINT_NO_PREALLOC | HINT_MERGE;

/// One allocation request.
#[derive(Debug, Clone)]
pub struct AllocRequest {
    /// Owning file; keys the per-file preallocation index.
    pub inode: InodeNumber,
    /// File-relative block the caller is allocating for.
    pub logical: LogicalBlock,
    /// Physical placement goal, usually adjacent to the file's last extent.
    pub goal: Option<ClusterNumber>,
    /// Requested length in clusters.
    pub len: u32,
    /// `HINT_*` flags.
    pub flags: u32,
    /// Locality-group shard for small-file placement; wrapped modulo the
    /// configured shard count.
    pub shard: u32,
}

/// A candidate or committed extent, group-relative, never crossing a group
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeExtent {
    pub group: GroupNumber,
    /// Group-relative start cluster.
    pub start: u32,
    pub len: u32,
    /// Logical (file-relative) block this extent maps to.
    pub logical: u32,
}

impl FreeExtent {
    pub(crate) const EMPTY: Self = Self {
        group: GroupNumber(0),
        start: 0,
        len: 0,
        logical: 0,
    };

    /// Absolute cluster number of the first cluster.
    #[must_use]
    pub fn first_cluster(&self, geometry: &AllocGeometry) -> ClusterNumber {
        geometry.group_to_cluster(self.group, self.start)
    }
}

/// Allocation status machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocStatus {
    Continue,
    Found,
    Break,
}

/// The five escalating group-selection tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Criteria {
    PowerTwoAligned = 0,
    GoalLengthFast = 1,
    BestAvailLength = 2,
    GoalLengthSlow = 3,
    AnyFree = 4,
}

impl Criteria {
    pub(crate) fn next(self) -> Option<Self> {
        match self {
            Self::PowerTwoAligned => Some(Self::GoalLengthFast),
            Self::GoalLengthFast => Some(Self::BestAvailLength),
            Self::BestAvailLength => Some(Self::GoalLengthSlow),
            Self::GoalLengthSlow => Some(Self::AnyFree),
            Self::AnyFree => None,
        }
    }

    /// Expensive tiers scan raw bitmaps and accept the cost of loading
    /// cold groups; the cheap tiers trust the secondary indices.
    pub(crate) fn is_expensive(self) -> bool {
        self >= Self::GoalLengthSlow
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Per-call allocation context.
#[derive(Debug)]
pub(crate) struct AllocContext {
    pub inode: InodeNumber,
    pub shard: u32,
    pub flags: u32,
    /// Original request, mapped onto the goal group.
    pub orig: FreeExtent,
    /// Normalized goal; may be trimmed by the best-available tier.
    pub goal: FreeExtent,
    /// Goal length before any best-available trimming.
    pub orig_goal_len: u32,
    /// Best candidate seen so far (`len == 0` means none).
    pub best: FreeExtent,
    pub status: AllocStatus,
    pub criteria: Criteria,
    /// Buddy order for the power-of-two tier; 0 disables the tier.
    pub order2: u32,
    /// Extents examined so far.
    pub found: u32,
    pub groups_scanned: u32,
    pub linear_remaining: u32,
    /// Preallocation serving (or created for) this allocation.
    pub pa: Option<std::sync::Arc<crate::prealloc::PaShared>>,
    /// First contained per-group error seen while walking groups.
    pub first_err: Option<tess_error::AllocError>,
    /// Request normalization already ran (it runs once per allocation,
    /// surviving ENOSPC retries).
    pub normalized: bool,
}

impl AllocContext {
    pub(crate) fn new(req: &AllocRequest, geometry: &AllocGeometry, config: &AllocConfig) -> Self {
        let mut flags = req.flags & CALLER_FLAGS;

        // Route data requests to a preallocation strategy: small requests
        // share locality-group pools, larger ones stream from the global
        // last-allocation goal.
        if flags & (HINT_METADATA | HINT_GOAL_ONLY) == 0 {
            if req.len < config.stream_threshold && config.group_prealloc > 0 {
                flags |= HINT_GROUP_ALLOC;
            } else {
                flags |= HINT_STREAM;
            }
        }

        let (group, start) = match req.goal {
            Some(goal) => {
                flags |= HINT_TRY_GOAL;
                geometry.cluster_to_group(goal)
            }
            // No goal: spread files across groups by inode.
            #[expect(clippy::cast_possible_truncation)]
            None => (
                GroupNumber((req.inode.0 % u64::from(geometry.group_count)) as u32),
                0,
            ),
        };

        let orig = FreeExtent {
            group,
            start,
            len: req.len,
            logical: req.logical.0,
        };
        Self {
            inode: req.inode,
            shard: req.shard % config.locality_shards,
            flags,
            orig,
            goal: orig,
            orig_goal_len: req.len,
            best: FreeExtent::EMPTY,
            status: AllocStatus::Continue,
            criteria: Criteria::GoalLengthFast,
            order2: 0,
            found: 0,
            groups_scanned: 0,
            linear_remaining: 0,
            pa: None,
            first_err: None,
            normalized: false,
        }
    }

    pub(crate) fn is_data(&self) -> bool {
        self.flags & HINT_METADATA == 0
    }

    /// Reset scan state for an ENOSPC retry after a discard sweep.
    pub(crate) fn reset_for_retry(&mut self) {
        self.best = FreeExtent::EMPTY;
        self.status = AllocStatus::Continue;
        self.found = 0;
        self.groups_scanned = 0;
        self.goal.len = self.orig_goal_len;
        self.pa = None;
    }
}

// ── Request normalization ───────────────────────────────────────────────────

/// File-size-keyed window table: `(file end <= bytes, window bytes, aligned)`.
/// Windows up to 1 MiB anchor at logical zero; larger ones align to their
/// own size.
const WINDOW_TABLE: [(u64, u64, bool); 10] = [
    (16 << 10, 16 << 10, false),
    (32 << 10, 32 << 10, false),
    (64 << 10, 64 << 10, false),
    (128 << 10, 128 << 10, false),
    (256 << 10, 256 << 10, false),
    (512 << 10, 512 << 10, false),
    (1 << 20, 1 << 20, false),
    (4 << 20, 2 << 20, true),
    (8 << 20, 4 << 20, true),
    (u64::MAX, 8 << 20, true),
];

/// Pick the raw preallocation window for a request, in clusters.
///
/// Returns `(window_start, window_len)` with the original request contained
/// in the window.
#[must_use]
pub(crate) fn normalize_window(
    logical: u32,
    len: u32,
    cluster_size: u32,
    clusters_per_group: u32,
) -> (u32, u32) {
    let csbits = cluster_size.ilog2();
    let end_bytes = (u64::from(logical) + u64::from(len)) << csbits;
    let len_bytes = u64::from(len) << csbits;

    let mut start = logical;
    let mut wlen = len;
    for (limit, window, aligned) in WINDOW_TABLE {
        // The largest window applies only to requests it can actually hold.
        if end_bytes <= limit && (limit != u64::MAX || len_bytes <= window) {
            #[expect(clippy::cast_possible_truncation)]
            let window_clusters = (window >> csbits).max(u64::from(len)) as u32;
            wlen = window_clusters;
            start = if aligned {
                logical - logical % window_clusters.max(1)
            } else {
                0
            };
            break;
        }
    }

    // Alignment must not move the window into an earlier group.
    start = start.max(logical - logical % clusters_per_group);
    wlen = wlen.min(clusters_per_group);
    (start, wlen)
}

/// Normalize a data request into an over-allocation-friendly goal window.
///
/// Skipped for metadata and `GOAL_ONLY`/`NO_PREALLOC` requests; locality
/// group requests normalize to the fixed group-prealloc length instead of
/// the file-size table. The window is clipped against the file's existing
/// preallocations so per-file reservations stay disjoint by construction.
pub(crate) fn normalize_request(
    ctx: &mut AllocContext,
    geometry: &AllocGeometry,
    config: &AllocConfig,
    file_pas: Option<&FilePaIndex>,
) {
    if !ctx.is_data()
        || ctx.flags & (HINT_GOAL_ONLY | HINT_NO_PREALLOC) != 0
    {
        return;
    }

    if ctx.flags & HINT_GROUP_ALLOC != 0 {
        // Locality-group windows have no per-file logical identity; they
        // are consumed front to back by whichever file asks next.
        ctx.goal.len = config.group_prealloc.min(geometry.clusters_per_group);
        ctx.orig_goal_len = ctx.goal.len;
        debug!(
            target: "tess::alloc::request",
            len = ctx.goal.len,
            "normalized locality-group request"
        );
        return;
    }

    let (mut wstart, mut wlen) = normalize_window(
        ctx.orig.logical,
        ctx.orig.len,
        geometry.cluster_size,
        geometry.clusters_per_group,
    );
    let mut wend = u64::from(wstart) + u64::from(wlen);

    // Clip against neighbouring reservations of the same file.
    if let Some(index) = file_pas {
        let map = index.read();
        let logical = ctx.orig.logical;
        // Closest reservation at or left of the request.
        for (_, pa) in map.range(..=logical).rev() {
            let acct = pa.accounting.lock();
            if acct.is_deleted() {
                continue;
            }
            let pa_end = u64::from(pa.lstart) + u64::from(pa.len);
            if pa_end > u64::from(wstart) {
                #[expect(clippy::cast_possible_truncation)]
                {
                    wstart = pa_end.min(u64::from(logical)) as u32;
                }
            }
            break;
        }
        // Closest reservation right of the request. Clipping may cut the
        // request's tail; the neighbouring window serves it next time.
        for (_, pa) in map.range(logical + 1..) {
            let acct = pa.accounting.lock();
            if acct.is_deleted() {
                continue;
            }
            if u64::from(pa.lstart) < wend {
                wend = u64::from(pa.lstart);
            }
            break;
        }
    }

    // The window must contain the request's start; the tail may be cut
    // short, in which case the caller gets a shorter extent and re-requests
    // the remainder.
    if u64::from(wstart) > u64::from(ctx.orig.logical) || wend <= u64::from(ctx.orig.logical) {
        wstart = ctx.orig.logical;
        wend = u64::from(ctx.orig.logical) + u64::from(ctx.orig.len);
    }

    #[expect(clippy::cast_possible_truncation)]
    let wlen_final = (wend - u64::from(wstart)).min(u64::from(geometry.clusters_per_group)) as u32;
    wlen = wlen_final;

    ctx.goal.logical = wstart;
    ctx.goal.len = wlen;
    ctx.orig_goal_len = wlen;
    debug!(
        target: "tess::alloc::request",
        logical = ctx.orig.logical,
        len = ctx.orig.len,
        window_start = wstart,
        window_len = wlen,
        "normalized request"
    );
}
