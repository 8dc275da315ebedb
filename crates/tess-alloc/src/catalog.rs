//! Per-group metadata cards and the two global secondary indices.
//!
//! Every group has a [`GroupCard`] of atomics so the selector can prefilter
//! candidates without taking any lock. Loaded groups are additionally
//! bucketed into two index families used for O(1) candidate lookup:
//!
//! - **by largest free order**: bucket `k` holds groups whose largest free
//!   buddy chunk has order `k`;
//! - **by average fragment size**: bucket `i` holds groups whose
//!   `free / fragments` lies in `[2^i, 2^(i+1))`.
//!
//! Each bucket list has its own reader/writer lock: selector lookups take
//! read locks, catalog repositioning on mutation takes write locks.

use crate::buddy::BuddyIndex;
use crate::request::{AllocContext, Criteria};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use tess_types::GroupNumber;
use tracing::debug;

/// Lock-free view of one group's allocation state.
#[derive(Debug)]
pub struct GroupCard {
    free: AtomicU32,
    fragments: AtomicU32,
    /// Bucket in the by-largest-order index; -1 = not listed.
    largest_order: AtomicI32,
    /// Bucket in the by-average-fragment index; -1 = not listed.
    avg_order: AtomicI32,
    corrupt: AtomicBool,
    loaded: AtomicBool,
}

impl GroupCard {
    fn new(declared_free: u32) -> Self {
        Self {
            free: AtomicU32::new(declared_free),
            fragments: AtomicU32::new(0),
            largest_order: AtomicI32::new(-1),
            avg_order: AtomicI32::new(-1),
            corrupt: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn free(&self) -> u32 {
        self.free.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn fragments(&self) -> u32 {
        self.fragments.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn largest_order(&self) -> i32 {
        self.largest_order.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.corrupt.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Relaxed)
    }

    /// Cheap pre-filter: can this group plausibly satisfy the request at
    /// the given tier? Atomic reads only; the authoritative check repeats
    /// under the group lock once the buddy is loaded.
    #[must_use]
    pub(crate) fn good_group(&self, tier: Criteria, ctx: &AllocContext, order_count: u32) -> bool {
        if self.is_corrupt() {
            return false;
        }
        let free = self.free();
        if free == 0 {
            return false;
        }
        let fragments = self.fragments();
        if fragments == 0 {
            return false;
        }
        match tier {
            Criteria::PowerTwoAligned => {
                if free < ctx.goal.len {
                    return false;
                }
                if ctx.order2 >= order_count {
                    return true;
                }
                self.largest_order() >= ctx.order2 as i32
            }
            Criteria::GoalLengthFast | Criteria::BestAvailLength => {
                free / fragments >= ctx.goal.len
            }
            Criteria::GoalLengthSlow => free >= ctx.goal.len,
            Criteria::AnyFree => true,
        }
    }
}

/// Bucket of the average fragment size for a given length.
#[must_use]
pub(crate) fn avg_order_for_len(len: u32, order_count: u32) -> u32 {
    len.max(1).ilog2().min(order_count - 1)
}

/// The catalog: one card per group plus the two bucketed indices.
#[derive(Debug)]
pub struct GroupCatalog {
    order_count: u32,
    cards: Vec<GroupCard>,
    by_largest: Vec<RwLock<BTreeSet<u32>>>,
    by_avg: Vec<RwLock<BTreeSet<u32>>>,
}

impl GroupCatalog {
    pub(crate) fn new(group_count: u32, order_count: u32, declared: impl Fn(u32) -> u32) -> Self {
        let buckets = order_count as usize;
        Self {
            order_count,
            cards: (0..group_count).map(|g| GroupCard::new(declared(g))).collect(),
            by_largest: (0..buckets).map(|_| RwLock::new(BTreeSet::new())).collect(),
            by_avg: (0..buckets).map(|_| RwLock::new(BTreeSet::new())).collect(),
        }
    }

    #[must_use]
    pub fn card(&self, group: GroupNumber) -> &GroupCard {
        &self.cards[group.0 as usize]
    }

    #[must_use]
    pub(crate) fn order_count(&self) -> u32 {
        self.order_count
    }

    /// Refresh a group's card and bucket membership after a buddy mutation
    /// (or initial load). Called with the group lock held.
    pub(crate) fn update(&self, group: GroupNumber, buddy: &BuddyIndex) {
        let card = self.card(group);
        card.free.store(buddy.free(), Ordering::Relaxed);
        card.fragments.store(buddy.fragments(), Ordering::Relaxed);
        card.loaded.store(true, Ordering::Relaxed);

        let largest = buddy
            .largest_order()
            .map_or(-1, |o| i32::try_from(o).unwrap_or(-1));
        self.reposition(group.0, &card.largest_order, largest, &self.by_largest);

        let avg = buddy
            .avg_fragment_order()
            .map_or(-1, |o| i32::try_from(o).unwrap_or(-1));
        self.reposition(group.0, &card.avg_order, avg, &self.by_avg);
    }

    fn reposition(
        &self,
        group: u32,
        slot: &AtomicI32,
        new_bucket: i32,
        lists: &[RwLock<BTreeSet<u32>>],
    ) {
        let old = slot.swap(new_bucket, Ordering::Relaxed);
        if old == new_bucket {
            return;
        }
        if old >= 0 {
            lists[old as usize].write().remove(&group);
        }
        if new_bucket >= 0 {
            lists[new_bucket as usize].write().insert(group);
        }
    }

    /// Withdraw a corrupt group from both indices; the card keeps refusing
    /// the prefilter from now on.
    pub(crate) fn mark_corrupt(&self, group: GroupNumber) {
        let card = self.card(group);
        card.corrupt.store(true, Ordering::Relaxed);
        self.reposition(group.0, &card.largest_order, -1, &self.by_largest);
        self.reposition(group.0, &card.avg_order, -1, &self.by_avg);
        debug!(target: "tess::alloc::catalog", group = group.0, "group withdrawn as corrupt");
    }

    /// Re-admit a group after its persistent state was repaired and
    /// reconciliation passed again; `update` restores bucket membership.
    pub(crate) fn clear_corrupt(&self, group: GroupNumber) {
        self.card(group).corrupt.store(false, Ordering::Relaxed);
    }

    /// First group in the by-largest-order buckets `from_order..` passing
    /// `pred`, in bucket-then-group order.
    pub(crate) fn pick_largest(
        &self,
        from_order: u32,
        mut pred: impl FnMut(u32) -> bool,
    ) -> Option<u32> {
        for bucket in from_order..self.order_count {
            let list = self.by_largest[bucket as usize].read();
            for &group in list.iter() {
                if pred(group) {
                    return Some(group);
                }
            }
        }
        None
    }

    /// First group in one by-average-fragment bucket passing `pred`.
    pub(crate) fn pick_avg(&self, bucket: u32, mut pred: impl FnMut(u32) -> bool) -> Option<u32> {
        let list = self.by_avg[bucket as usize].read();
        list.iter().copied().find(|&group| pred(group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap;

    fn buddy_with_runs(runs: &[(u32, u32)]) -> BuddyIndex {
        let mut raw = vec![0xFF_u8; 128];
        for &(start, len) in runs {
            bitmap::clear_range(&mut raw, start, len);
        }
        BuddyIndex::build(&raw, 1024, 1024)
    }

    #[test]
    fn update_places_group_in_both_indices() {
        let catalog = GroupCatalog::new(4, 11, |_| 0);
        // One 64-cluster run: largest order 6, avg 64 -> bucket 6.
        let buddy = buddy_with_runs(&[(0, 64)]);
        catalog.update(GroupNumber(2), &buddy);

        assert_eq!(catalog.card(GroupNumber(2)).free(), 64);
        assert_eq!(catalog.card(GroupNumber(2)).largest_order(), 6);
        assert_eq!(catalog.pick_largest(6, |_| true), Some(2));
        assert_eq!(catalog.pick_avg(6, |_| true), Some(2));
        assert_eq!(catalog.pick_avg(5, |_| true), None);
    }

    #[test]
    fn update_moves_group_between_buckets() {
        let catalog = GroupCatalog::new(1, 11, |_| 0);
        catalog.update(GroupNumber(0), &buddy_with_runs(&[(0, 64)]));
        assert_eq!(catalog.pick_largest(6, |_| true), Some(0));

        // Fragmenting the space moves the group to lower buckets.
        catalog.update(GroupNumber(0), &buddy_with_runs(&[(0, 4), (8, 4)]));
        assert_eq!(catalog.pick_largest(6, |_| true), None);
        assert_eq!(catalog.pick_largest(2, |_| true), Some(0));
        assert_eq!(catalog.pick_avg(2, |_| true), Some(0));
    }

    #[test]
    fn mark_corrupt_withdraws_group() {
        let catalog = GroupCatalog::new(2, 11, |_| 100);
        catalog.update(GroupNumber(0), &buddy_with_runs(&[(0, 64)]));
        catalog.mark_corrupt(GroupNumber(0));
        assert!(catalog.card(GroupNumber(0)).is_corrupt());
        assert_eq!(catalog.pick_largest(0, |_| true), None);
        assert_eq!(catalog.pick_avg(6, |_| true), None);
    }

    #[test]
    fn avg_order_buckets() {
        assert_eq!(avg_order_for_len(1, 11), 0);
        assert_eq!(avg_order_for_len(4, 11), 2);
        assert_eq!(avg_order_for_len(24, 11), 4);
        assert_eq!(avg_order_for_len(32, 11), 5);
        assert_eq!(avg_order_for_len(64, 11), 6);
        assert_eq!(avg_order_for_len(1 << 20, 11), 10);
    }

    #[test]
    fn unloaded_card_uses_declared_free() {
        let catalog = GroupCatalog::new(3, 11, |g| g * 10);
        assert_eq!(catalog.card(GroupNumber(2)).free(), 20);
        assert!(!catalog.card(GroupNumber(2)).is_loaded());
    }
}
