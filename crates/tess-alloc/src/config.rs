//! Allocator tuning knobs.

use serde::{Deserialize, Serialize};

/// Construction-time configuration for the allocation engine.
///
/// The scan-budget fields bound how much work the group selector may do per
/// request; the preallocation fields shape the speculative reservations.
/// All values are fixed once the allocator is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocConfig {
    /// Upper bound on extents examined per request before the search stops
    /// and takes the best candidate seen so far.
    pub max_to_scan: u32,
    /// Minimum extents examined before an inexact candidate is accepted.
    pub min_to_scan: u32,
    /// Minimum request order for the power-of-two buddy tier; requests
    /// below `2^(order2_req - 1)` clusters skip it.
    pub order2_req: u32,
    /// Data requests shorter than this (in clusters) are routed to the
    /// locality-group preallocation pools.
    pub stream_threshold: u32,
    /// Normalized length of a locality-group allocation window, clusters.
    pub group_prealloc: u32,
    /// Groups advanced linearly from the goal before the secondary indices
    /// take over candidate selection.
    pub linear_scan_limit: u32,
    /// How many orders the best-available tier may trim off the goal
    /// length before giving up and falling to the full scan.
    pub best_avail_trim_order: u32,
    /// Maximum entries per locality-group bucket; overflow evicts the
    /// least-free reservations.
    pub lg_bucket_cap: usize,
    /// Bounded retries of the whole search after an ENOSPC-triggered
    /// preallocation discard sweep.
    pub enospc_retries: u32,
    /// Use the by-order / by-fragment secondary indices for candidate
    /// lookup. Off means pure linear traversal from the goal group.
    pub optimize_scan: bool,
    /// Hand extents freed at commit to the background discard worker.
    pub discard_on_free: bool,
    /// RAID stripe width in clusters; enables the stripe-aligned scan.
    pub stripe: Option<u32>,
    /// Number of locality-group shards (callers pass a shard index in the
    /// request). Must be at least 1.
    pub locality_shards: u32,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            max_to_scan: 200,
            min_to_scan: 10,
            order2_req: 2,
            stream_threshold: 16,
            group_prealloc: 512,
            linear_scan_limit: 4,
            best_avail_trim_order: 3,
            lg_bucket_cap: 8,
            enospc_retries: 3,
            optimize_scan: true,
            discard_on_free: false,
            stripe: None,
            locality_shards: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AllocConfig::default();
        assert_eq!(cfg.max_to_scan, 200);
        assert_eq!(cfg.min_to_scan, 10);
        assert_eq!(cfg.order2_req, 2);
        assert_eq!(cfg.stream_threshold, 16);
        assert_eq!(cfg.group_prealloc, 512);
        assert_eq!(cfg.best_avail_trim_order, 3);
        assert_eq!(cfg.lg_bucket_cap, 8);
        assert_eq!(cfg.enospc_retries, 3);
        assert!(cfg.optimize_scan);
        assert!(cfg.stripe.is_none());
    }
}
