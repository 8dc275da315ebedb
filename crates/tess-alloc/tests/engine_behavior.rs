//! End-to-end behavior of the allocation engine over the in-memory
//! collaborators: tier selection, preallocation reuse, deferred frees,
//! trim, and corruption containment.

use std::sync::Arc;
use std::time::Duration;
use tess_alloc::mem::{MemBitmapStore, NoQuota, RecordingDiscard};
use tess_alloc::{
    AllocConfig, AllocError, AllocRequest, Allocator, BitmapStore, FreeExtent, HINT_GOAL_ONLY,
    HINT_METADATA, HINT_NO_PREALLOC,
};
use tess_types::{AllocGeometry, ClusterNumber, Cx, GroupNumber, InodeNumber, LogicalBlock, TxnId};

struct Harness {
    alloc: Allocator,
    store: Arc<MemBitmapStore>,
    device: Arc<RecordingDiscard>,
}

fn harness(geometry: AllocGeometry, config: AllocConfig) -> Harness {
    let store = Arc::new(MemBitmapStore::new(&geometry));
    let device = Arc::new(RecordingDiscard::default());
    let alloc = Allocator::new(
        geometry,
        config,
        Arc::clone(&store) as Arc<dyn tess_alloc::BitmapStore>,
        Arc::new(NoQuota),
        Arc::clone(&device) as Arc<dyn tess_alloc::DiscardDevice>,
    )
    .unwrap();
    Harness {
        alloc,
        store,
        device,
    }
}

fn one_group_1024() -> AllocGeometry {
    AllocGeometry::new(4096, 1024, 1024, 0).unwrap()
}

fn req(inode: u64, logical: u32, len: u32, flags: u32) -> AllocRequest {
    AllocRequest {
        inode: InodeNumber(inode),
        logical: LogicalBlock(logical),
        goal: None,
        len,
        flags,
        shard: 0,
    }
}

fn abs(alloc: &Allocator, ex: &FreeExtent) -> u64 {
    ex.first_cluster(alloc.geometry()).0
}

// ── Scenario: power-of-two tier ─────────────────────────────────────────────

#[test]
fn power_of_two_request_served_aligned_from_buddy_index() {
    let cx = Cx::for_testing();
    let h = harness(one_group_1024(), AllocConfig::default());
    h.alloc.load_group(&cx, GroupNumber(0)).unwrap();

    let ex = h
        .alloc
        .allocate(&cx, &req(0, 0, 8, HINT_NO_PREALLOC))
        .unwrap();
    assert_eq!(ex.len, 8);
    assert_eq!(ex.start % 8, 0, "power-of-two tier returns aligned chunks");

    let info = h.alloc.group_info(GroupNumber(0));
    assert_eq!(info.free, 1016);
    // Splitting the single 1024-chunk leaves a largest order of 9.
    assert_eq!(info.largest_order, Some(9));

    let stats = h.alloc.stats();
    assert_eq!(stats.tier_hits[0], 1, "served by PowerTwoAligned");
    assert_eq!(stats.tier_hits[1..].iter().sum::<u64>(), 0);
}

// ── Scenario: average-fragment-size tier picks the right group ──────────────

#[test]
fn goal_length_fast_selects_group_by_fragment_bucket() {
    let cx = Cx::for_testing();
    let geometry = AllocGeometry::new(4096, 1024, 2048, 0).unwrap();
    let config = AllocConfig {
        // Force index lookups instead of linear traversal from the goal.
        linear_scan_limit: 0,
        ..AllocConfig::default()
    };
    let h = harness(geometry, config);

    // Group 0: eight fragments of 4 (average 4, bucket 2).
    let runs_a: Vec<(u32, u32)> = (0..8).map(|i| (i * 8, 4)).collect();
    h.store.fill_group(GroupNumber(0), &runs_a);
    // Group 1: four fragments of 64 (average 64, bucket 6).
    let runs_b: Vec<(u32, u32)> = (0..4).map(|i| (i * 128, 64)).collect();
    h.store.fill_group(GroupNumber(1), &runs_b);
    h.alloc.load_group(&cx, GroupNumber(0)).unwrap();
    h.alloc.load_group(&cx, GroupNumber(1)).unwrap();

    // Goal group is 0, but its average fragment cannot host 24 clusters.
    let ex = h
        .alloc
        .allocate(&cx, &req(0, 0, 24, HINT_NO_PREALLOC))
        .unwrap();
    assert_eq!(ex.group, GroupNumber(1));
    assert_eq!(ex.len, 24);

    let stats = h.alloc.stats();
    assert_eq!(stats.tier_hits[1], 1, "served by GoalLengthFast");
    assert_eq!(stats.tier_hits[3], 0, "no full scan happened");
}

// ── Scenario: per-file preallocation reuse ──────────────────────────────────

#[test]
fn nearby_request_served_from_inode_reservation() {
    let cx = Cx::for_testing();
    let h = harness(one_group_1024(), AllocConfig::default());

    // 24 clusters normalize to a 32-cluster window; 8 stay reserved.
    let first = h.alloc.allocate(&cx, &req(7, 0, 24, 0)).unwrap();
    assert_eq!(first.len, 24);
    let free_after_first = h.alloc.group_info(first.group).free;
    assert_eq!(free_after_first, 1024 - 32, "whole window is reserved");

    // The next logical blocks come straight out of the reservation,
    // physically contiguous with the first extent.
    let second = h.alloc.allocate(&cx, &req(7, 24, 4, 0)).unwrap();
    assert_eq!(second.len, 4);
    assert_eq!(second.start, first.start + 24);
    assert_eq!(h.alloc.stats().pa_inode_hits, 1);
    assert_eq!(
        h.alloc.group_info(first.group).free,
        free_after_first,
        "reservation consumption does not change group accounting"
    );

    // Draining the window unlinks the reservation; later requests miss.
    let third = h.alloc.allocate(&cx, &req(7, 28, 4, 0)).unwrap();
    assert_eq!(third.start, first.start + 28);
    assert_eq!(h.alloc.stats().pa_inode_hits, 2);

    let fourth = h.alloc.allocate(&cx, &req(7, 40, 4, 0)).unwrap();
    assert_eq!(
        h.alloc.stats().pa_inode_hits,
        2,
        "a depleted reservation is never found again"
    );
    assert_ne!(fourth.start, 0);
}

// ── Scenario: locality-group pools ──────────────────────────────────────────

#[test]
fn small_files_share_a_locality_window() {
    let cx = Cx::for_testing();
    let h = harness(one_group_1024(), AllocConfig::default());

    let first = h.alloc.allocate(&cx, &req(1, 0, 4, 0)).unwrap();
    let second = h.alloc.allocate(&cx, &req(2, 0, 4, 0)).unwrap();
    assert_eq!(
        second.start,
        first.start + 4,
        "second small file continues the shared window"
    );
    assert_eq!(h.alloc.stats().pa_locality_hits, 1);
    assert_eq!(h.alloc.stats().pa_created, 1, "one shared window");

    // A different shard gets its own window.
    let other_shard = AllocRequest {
        shard: 1,
        ..req(3, 0, 4, 0)
    };
    h.alloc.allocate(&cx, &other_shard).unwrap();
    assert_eq!(h.alloc.stats().pa_created, 2);
}

// ── Scenario: deferred free becomes visible at commit ───────────────────────

#[test]
fn deferred_free_applies_on_commit_notification() {
    let cx = Cx::for_testing();
    let geometry = AllocGeometry::new(4096, 64, 64, 0).unwrap();
    let h = harness(geometry, AllocConfig::default());

    let ex = h
        .alloc
        .allocate(&cx, &req(0, 0, 50, HINT_METADATA | HINT_NO_PREALLOC))
        .unwrap();
    assert_eq!(ex.len, 50);
    let tail = h
        .alloc
        .allocate(&cx, &req(0, 0, 14, HINT_METADATA | HINT_NO_PREALLOC))
        .unwrap();
    assert_eq!(tail.len, 14);
    assert_eq!(h.alloc.group_info(GroupNumber(0)).free, 0);

    // Free everything under transaction 7: nothing reusable yet.
    h.alloc
        .free(&cx, ClusterNumber(abs(&h.alloc, &ex)), 50, Some(TxnId(7)))
        .unwrap();
    h.alloc
        .free(&cx, ClusterNumber(abs(&h.alloc, &tail)), 14, Some(TxnId(7)))
        .unwrap();
    assert_eq!(h.alloc.group_info(GroupNumber(0)).free, 0);
    assert_eq!(h.alloc.deferred_clusters(GroupNumber(0)), 64);
    let err = h
        .alloc
        .allocate(&cx, &req(0, 0, 40, HINT_METADATA | HINT_NO_PREALLOC))
        .unwrap_err();
    assert!(matches!(err, AllocError::NoSpace));

    // Commit makes the clusters allocatable again, in the same group.
    h.alloc.on_transaction_commit(&cx, TxnId(7)).unwrap();
    assert_eq!(h.alloc.group_info(GroupNumber(0)).free, 64);
    assert_eq!(h.alloc.deferred_clusters(GroupNumber(0)), 0);
    assert_eq!(h.store.declared_free(GroupNumber(0)), 64);
    let again = h
        .alloc
        .allocate(&cx, &req(0, 0, 40, HINT_METADATA | HINT_NO_PREALLOC))
        .unwrap();
    assert_eq!(again.len, 40);
    assert_eq!(again.group, GroupNumber(0));
}

#[test]
fn adjacent_deferred_frees_merge_per_transaction() {
    let cx = Cx::for_testing();
    let config = AllocConfig {
        discard_on_free: true,
        ..AllocConfig::default()
    };
    let h = harness(one_group_1024(), config);

    let ex = h
        .alloc
        .allocate(&cx, &req(0, 0, 32, HINT_METADATA | HINT_NO_PREALLOC))
        .unwrap();
    let base = abs(&h.alloc, &ex);

    // Two adjacent ranges and one separate range, same transaction.
    h.alloc
        .free(&cx, ClusterNumber(base), 8, Some(TxnId(5)))
        .unwrap();
    h.alloc
        .free(&cx, ClusterNumber(base + 8), 8, Some(TxnId(5)))
        .unwrap();
    h.alloc
        .free(&cx, ClusterNumber(base + 24), 8, Some(TxnId(5)))
        .unwrap();
    h.alloc.on_transaction_commit(&cx, TxnId(5)).unwrap();

    // The background worker receives the merged extents.
    let mut issued = Vec::new();
    for _ in 0..100 {
        issued = h.device.issued();
        if issued.len() >= 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(
        issued,
        vec![(base, 16), (base + 24, 8)],
        "adjacent same-transaction frees merged into one discard"
    );
}

#[test]
fn deferred_free_overlap_is_double_free() {
    let cx = Cx::for_testing();
    let h = harness(one_group_1024(), AllocConfig::default());
    let ex = h
        .alloc
        .allocate(&cx, &req(0, 0, 16, HINT_METADATA | HINT_NO_PREALLOC))
        .unwrap();
    let base = abs(&h.alloc, &ex);

    h.alloc
        .free(&cx, ClusterNumber(base), 16, Some(TxnId(1)))
        .unwrap();
    let err = h
        .alloc
        .free(&cx, ClusterNumber(base + 4), 4, Some(TxnId(2)))
        .unwrap_err();
    assert!(matches!(err, AllocError::Corrupt { .. }));
}

// ── Scenario: corruption is contained per group ─────────────────────────────

#[test]
fn corrupt_group_refused_others_keep_allocating() {
    let cx = Cx::for_testing();
    let geometry = AllocGeometry::new(4096, 1024, 2048, 0).unwrap();
    let h = harness(geometry, AllocConfig::default());

    // Group 0 declares a free count that disagrees with its bitmap.
    h.store.set_declared_free(GroupNumber(0), 123);

    let goal_in_bad_group = AllocRequest {
        goal: Some(ClusterNumber(10)),
        ..req(0, 0, 8, HINT_NO_PREALLOC)
    };
    let ex = h.alloc.allocate(&cx, &goal_in_bad_group).unwrap();
    assert_eq!(ex.group, GroupNumber(1), "allocation moved off the bad group");
    assert!(h.alloc.group_info(GroupNumber(0)).corrupt);
    assert!(!h.alloc.group_info(GroupNumber(1)).corrupt);
}

#[test]
fn corrupt_only_group_surfaces_corrupt_error() {
    let cx = Cx::for_testing();
    let h = harness(one_group_1024(), AllocConfig::default());
    h.store.set_declared_free(GroupNumber(0), 123);

    let err = h
        .alloc
        .allocate(&cx, &req(0, 0, 8, HINT_NO_PREALLOC))
        .unwrap_err();
    assert!(
        matches!(err, AllocError::Corrupt { group: 0, .. }),
        "got {err:?}"
    );
}

// ── Scenario: goal-only requests ────────────────────────────────────────────

#[test]
fn goal_only_takes_exact_position_or_fails() {
    let cx = Cx::for_testing();
    let h = harness(one_group_1024(), AllocConfig::default());

    let occupy = AllocRequest {
        goal: Some(ClusterNumber(0)),
        ..req(0, 0, 8, HINT_METADATA | HINT_NO_PREALLOC)
    };
    h.alloc.allocate(&cx, &occupy).unwrap();

    let blocked = AllocRequest {
        goal: Some(ClusterNumber(0)),
        ..req(1, 0, 8, HINT_GOAL_ONLY)
    };
    assert!(matches!(
        h.alloc.allocate(&cx, &blocked).unwrap_err(),
        AllocError::NoSpace
    ));

    let open = AllocRequest {
        goal: Some(ClusterNumber(8)),
        ..req(1, 0, 8, HINT_GOAL_ONLY)
    };
    let ex = h.alloc.allocate(&cx, &open).unwrap();
    assert_eq!((ex.group, ex.start, ex.len), (GroupNumber(0), 8, 8));
}

// ── Scenario: best-available tier trims the goal ────────────────────────────

#[test]
fn best_avail_trims_goal_instead_of_full_scan() {
    let cx = Cx::for_testing();
    let config = AllocConfig {
        linear_scan_limit: 0,
        stream_threshold: 4,
        ..AllocConfig::default()
    };
    let h = harness(one_group_1024(), config);

    // Four unaligned 12-cluster runs: largest buddy order 3, average
    // fragment 12 (bucket 3). A 32-cluster normalized goal fails the
    // power-of-two and fragment tiers, but trimming to 8 succeeds.
    h.store
        .fill_group(GroupNumber(0), &[(1, 12), (20, 12), (40, 12), (60, 12)]);
    h.alloc.load_group(&cx, GroupNumber(0)).unwrap();

    let ex = h.alloc.allocate(&cx, &req(0, 20, 5, 0)).unwrap();
    assert_eq!(ex.len, 5);
    let stats = h.alloc.stats();
    assert_eq!(stats.tier_hits[2], 1, "served by BestAvailLength");
    assert_eq!(stats.tier_hits[3], 0, "no exhaustive scan");
}

// ── Scenario: stripe-aligned search ─────────────────────────────────────────

#[test]
fn stripe_goal_lands_on_stripe_boundary() {
    let cx = Cx::for_testing();
    let config = AllocConfig {
        stripe: Some(8),
        ..AllocConfig::default()
    };
    let h = harness(one_group_1024(), config);

    // First clusters used, so the first stripe boundary with space is 8.
    h.store.fill_group(GroupNumber(0), &[(3, 1021)]);
    h.alloc.load_group(&cx, GroupNumber(0)).unwrap();

    let ex = h
        .alloc
        .allocate(&cx, &req(0, 0, 24, HINT_NO_PREALLOC))
        .unwrap();
    assert_eq!(ex.len, 24);
    assert_eq!(ex.start % 8, 0);
    assert_eq!(ex.start, 8);
}

// ── Trim ────────────────────────────────────────────────────────────────────

#[test]
fn trim_discards_long_runs_and_remembers() {
    let cx = Cx::for_testing();
    let h = harness(one_group_1024(), AllocConfig::default());
    h.store
        .fill_group(GroupNumber(0), &[(0, 100), (200, 4), (300, 50)]);

    let total_bytes = 1024 * 4096;
    let trimmed = h.alloc.trim(&cx, 0, total_bytes, 10 * 4096).unwrap();
    assert_eq!(trimmed, (100 + 50) * 4096, "runs under the minimum skipped");
    assert_eq!(h.device.issued(), vec![(0, 100), (300, 50)]);

    // A repeat trim of a trimmed group short-circuits.
    let again = h.alloc.trim(&cx, 0, total_bytes, 10 * 4096).unwrap();
    assert_eq!(again, 0);

    // Freeing in the group re-arms trimming.
    let ex = h
        .alloc
        .allocate(&cx, &req(0, 0, 16, HINT_METADATA | HINT_NO_PREALLOC))
        .unwrap();
    h.alloc
        .free(&cx, ClusterNumber(abs(&h.alloc, &ex)), 16, None)
        .unwrap();
    let rearmed = h.alloc.trim(&cx, 0, total_bytes, 10 * 4096).unwrap();
    assert!(rearmed > 0);
}

#[test]
fn trim_propagates_device_errors() {
    let cx = Cx::for_testing();
    let h = harness(one_group_1024(), AllocConfig::default());
    h.device.set_fail(true);
    let err = h.alloc.trim(&cx, 0, 1024 * 4096, 4096).unwrap_err();
    assert!(matches!(err, AllocError::Device(_)));
    // The reserved run was returned to the buddy before the error.
    assert_eq!(h.alloc.group_info(GroupNumber(0)).free, 1024);
}

// ── Invariants ──────────────────────────────────────────────────────────────

#[test]
fn allocations_never_overlap() {
    let cx = Cx::for_testing();
    let geometry = AllocGeometry::new(4096, 1024, 4096, 0).unwrap();
    let h = harness(geometry, AllocConfig::default());

    let mut extents: Vec<(u64, u64)> = Vec::new();
    for inode in 0..24_u64 {
        let len = 1 + (inode as u32 * 7) % 40;
        let ex = h
            .alloc
            .allocate(&cx, &req(inode, 0, len, 0))
            .unwrap();
        extents.push((abs(&h.alloc, &ex), u64::from(ex.len)));
    }
    extents.sort_unstable();
    for pair in extents.windows(2) {
        assert!(
            pair[0].0 + pair[0].1 <= pair[1].0,
            "extents overlap: {pair:?}"
        );
    }
}

#[test]
fn rebuild_from_bitmap_is_idempotent() {
    let cx = Cx::for_testing();
    let h = harness(one_group_1024(), AllocConfig::default());

    // Mixed traffic: windows, metadata, a free, a deferred free.
    h.alloc.allocate(&cx, &req(1, 0, 24, 0)).unwrap();
    h.alloc.allocate(&cx, &req(2, 0, 4, 0)).unwrap();
    let meta = h
        .alloc
        .allocate(&cx, &req(3, 0, 16, HINT_METADATA | HINT_NO_PREALLOC))
        .unwrap();
    h.alloc
        .free(
            &cx,
            ClusterNumber(abs(&h.alloc, &meta)),
            8,
            Some(TxnId(1)),
        )
        .unwrap();

    let before = h.alloc.group_info(GroupNumber(0));
    h.alloc.reload_group(&cx, GroupNumber(0)).unwrap();
    let after_first = h.alloc.group_info(GroupNumber(0));
    h.alloc.reload_group(&cx, GroupNumber(0)).unwrap();
    let after_second = h.alloc.group_info(GroupNumber(0));

    assert_eq!(before, after_first, "rebuild reproduces live accounting");
    assert_eq!(after_first, after_second, "rebuild is idempotent");
}

#[test]
fn truncate_releases_reservation_windows() {
    let cx = Cx::for_testing();
    let h = harness(one_group_1024(), AllocConfig::default());

    let ex = h.alloc.allocate(&cx, &req(9, 0, 24, 0)).unwrap();
    assert_eq!(h.alloc.group_info(ex.group).free, 1024 - 32);

    h.alloc.discard_inode_preallocations(&cx, InodeNumber(9));
    // The 8 unconsumed clusters of the window come back.
    assert_eq!(h.alloc.group_info(ex.group).free, 1024 - 24);
    assert!(h.alloc.stats().pa_discarded >= 1);

    // The consumed clusters survive on disk.
    let raw = h.store.read_group_bitmap(&cx, ex.group).unwrap();
    assert_eq!(tess_alloc::bitmap::count_free(&raw, 1024), 1000);
}

#[test]
fn free_crossing_group_boundary_is_rejected() {
    let cx = Cx::for_testing();
    let geometry = AllocGeometry::new(4096, 64, 128, 0).unwrap();
    let h = harness(geometry, AllocConfig::default());
    let err = h
        .alloc
        .free(&cx, ClusterNumber(60), 8, None)
        .unwrap_err();
    assert!(matches!(err, AllocError::InvalidRequest(_)));
}
