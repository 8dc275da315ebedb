//! In-memory allocation counters.
//!
//! Counters only; there is deliberately no reporting surface here. Embedding
//! filesystems read a [`StatsSnapshot`] and expose it however they like.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) const TIER_COUNT: usize = 5;

/// Atomic counters updated on the allocation hot path.
#[derive(Debug, Default)]
pub struct AllocStats {
    pub(crate) requests: AtomicU64,
    pub(crate) found_by_goal: AtomicU64,
    pub(crate) tier_hits: [AtomicU64; TIER_COUNT],
    pub(crate) tier_groups_considered: [AtomicU64; TIER_COUNT],
    pub(crate) extents_scanned: AtomicU64,
    pub(crate) budget_breaks: AtomicU64,
    pub(crate) lost_chunks: AtomicU64,
    pub(crate) pa_inode_hits: AtomicU64,
    pub(crate) pa_locality_hits: AtomicU64,
    pub(crate) pa_created: AtomicU64,
    pub(crate) pa_discarded: AtomicU64,
    pub(crate) discards_issued: AtomicU64,
    pub(crate) enospc_retries: AtomicU64,
}

/// Point-in-time copy of [`AllocStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub found_by_goal: u64,
    pub tier_hits: [u64; TIER_COUNT],
    pub tier_groups_considered: [u64; TIER_COUNT],
    pub extents_scanned: u64,
    pub budget_breaks: u64,
    pub lost_chunks: u64,
    pub pa_inode_hits: u64,
    pub pa_locality_hits: u64,
    pub pa_created: u64,
    pub pa_discarded: u64,
    pub discards_issued: u64,
    pub enospc_retries: u64,
}

impl AllocStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            requests: load(&self.requests),
            found_by_goal: load(&self.found_by_goal),
            tier_hits: self.tier_hits.each_ref().map(|c| load(c)),
            tier_groups_considered: self.tier_groups_considered.each_ref().map(|c| load(c)),
            extents_scanned: load(&self.extents_scanned),
            budget_breaks: load(&self.budget_breaks),
            lost_chunks: load(&self.lost_chunks),
            pa_inode_hits: load(&self.pa_inode_hits),
            pa_locality_hits: load(&self.pa_locality_hits),
            pa_created: load(&self.pa_created),
            pa_discarded: load(&self.pa_discarded),
            discards_issued: load(&self.discards_issued),
            enospc_retries: load(&self.enospc_retries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let stats = AllocStats::default();
        AllocStats::bump(&stats.requests);
        AllocStats::bump(&stats.requests);
        AllocStats::bump(&stats.tier_hits[1]);
        let snap = stats.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.tier_hits, [0, 1, 0, 0, 0]);
        assert_eq!(snap.extents_scanned, 0);
    }
}
