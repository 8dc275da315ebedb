//! Per-group binary buddy index over the cluster bitmap.
//!
//! The order-0 layer is the group bitmap itself (bit set = cluster used).
//! Each higher order `k` keeps one bit per 2^k-aligned chunk; a *clear* bit
//! means the chunk is entirely free and represented at that order. A free
//! region is always represented by its maximal buddy decomposition, so the
//! per-order free-chunk counters, the fragment count, and the largest free
//! order can be maintained incrementally on every mutation.
//!
//! Corruption (double-free, double-allocate) is detected here and reported
//! as a [`BuddyError`]; the caller flags the owning group and refuses
//! further allocation from it without tearing down the filesystem.

use crate::bitmap;
use tracing::trace;

/// A free run found inside a group, group-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRun {
    pub start: u32,
    pub len: u32,
}

/// Token describing the split performed by a `mark_used` that did not
/// consume whole chunks: the order that had to be split and the length that
/// remained to be carved when the first split happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitRemainder {
    pub order: u32,
    pub remaining: u32,
}

/// Buddy-level accounting violation. The caller maps this to a per-group
/// corrupt flag; no mutation is applied when an error is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuddyError {
    /// `mark_used` hit a cluster that is already used.
    NotFree { at: u32 },
    /// `mark_free` hit a cluster that is already free (double-free).
    NotUsed { at: u32 },
    /// A range fell outside the group.
    OutOfRange { start: u32, len: u32 },
}

/// Binary buddy index for one group.
#[derive(Debug, Clone)]
pub struct BuddyIndex {
    /// Valid clusters in this group (the last group of a filesystem may be
    /// shorter than the bitmap capacity).
    clusters: u32,
    /// Bitmap capacity in bits; a power of two.
    capacity: u32,
    /// Number of orders: 0..orders, where order `orders - 1` spans the
    /// whole capacity.
    orders: u32,
    /// Order-0 layer: 1 = used. Tail bits past `clusters` are kept set.
    bitmap: Vec<u8>,
    /// Orders 1.. stored at `layers[k - 1]`; bit set = chunk NOT free.
    layers: Vec<Vec<u8>>,
    /// Free chunks per order.
    counters: Vec<u32>,
    free: u32,
    fragments: u32,
    /// Hint: no free cluster exists below this offset.
    first_free: u32,
    largest_order: Option<u32>,
}

impl BuddyIndex {
    /// Build the buddy structure from a raw group bitmap.
    ///
    /// `raw` is the on-disk bitmap (possibly longer than needed); only the
    /// first `clusters` bits are meaningful. `capacity` is the full group
    /// size in clusters and must be a power of two `>= clusters`.
    #[must_use]
    pub fn build(raw: &[u8], clusters: u32, capacity: u32) -> Self {
        debug_assert!(capacity.is_power_of_two());
        debug_assert!(clusters >= 1 && clusters <= capacity);
        let orders = capacity.ilog2() + 1;

        let mut bm = raw.to_vec();
        bm.resize((capacity as usize).div_ceil(8), 0xFF);
        // The tail past the group end is never allocatable.
        bitmap::set_range(&mut bm, clusters, capacity - clusters);

        let mut layers = Vec::with_capacity(orders as usize - 1);
        for k in 1..orders {
            let chunks = (capacity >> k) as usize;
            layers.push(vec![0xFF_u8; chunks.div_ceil(8)]);
        }

        let mut this = Self {
            clusters,
            capacity,
            orders,
            bitmap: bm,
            layers,
            counters: vec![0; orders as usize],
            free: 0,
            fragments: 0,
            first_free: clusters,
            largest_order: None,
        };

        let runs: Vec<(u32, u32)> = bitmap::zero_runs(&this.bitmap, 0, clusters).collect();
        this.fragments = u32::try_from(runs.len()).unwrap_or(u32::MAX);
        for (start, len) in runs {
            this.free += len;
            this.first_free = this.first_free.min(start);
            this.insert_decomposed(start, len);
        }
        this.recompute_largest_order();
        this
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn free(&self) -> u32 {
        self.free
    }

    #[must_use]
    pub fn fragments(&self) -> u32 {
        self.fragments
    }

    #[must_use]
    pub fn clusters(&self) -> u32 {
        self.clusters
    }

    /// Highest order with at least one free chunk, `None` when full.
    #[must_use]
    pub fn largest_order(&self) -> Option<u32> {
        self.largest_order
    }

    /// Bucket of the average fragment size: `floor(log2(free / fragments))`,
    /// `None` when the group has no free space.
    #[must_use]
    pub fn avg_fragment_order(&self) -> Option<u32> {
        if self.free == 0 || self.fragments == 0 {
            return None;
        }
        Some((self.free / self.fragments).max(1).ilog2())
    }

    #[must_use]
    pub fn order_count(&self) -> u32 {
        self.orders
    }

    /// Per-order free chunk counters (tests and diagnostics).
    #[must_use]
    pub fn counters(&self) -> &[u32] {
        &self.counters
    }

    /// Borrow the order-0 bitmap (1 = used).
    #[must_use]
    pub fn raw_bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    #[must_use]
    pub fn is_free(&self, cluster: u32) -> bool {
        cluster < self.clusters && !bitmap::get(&self.bitmap, cluster)
    }

    /// Hint: no free cluster exists below this offset.
    #[must_use]
    pub fn first_free_hint(&self) -> u32 {
        self.first_free
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Free extent around `start_hint`, grown greedily to the right across
    /// adjacent free chunks until it reaches `needed` clusters or a used
    /// cluster. Returns `None` when `start_hint` itself is used.
    #[must_use]
    pub fn find_extent(&self, start_hint: u32, needed: u32) -> Option<FreeRun> {
        if start_hint >= self.clusters || bitmap::get(&self.bitmap, start_hint) {
            return None;
        }

        let ord = self.order_for(start_hint);
        let chunk_start = (start_hint >> ord) << ord;
        let mut run = FreeRun {
            start: start_hint,
            len: (1 << ord) - (start_hint - chunk_start),
        };

        while run.len < needed {
            let next = run.start + run.len;
            if next >= self.clusters || bitmap::get(&self.bitmap, next) {
                break;
            }
            run.len += 1 << self.order_for(next);
        }
        run.len = run.len.min(self.clusters - run.start);
        Some(run)
    }

    /// First free chunk at `min_order` or above, in increasing order of
    /// orders. Returns the chunk's start cluster and its order.
    #[must_use]
    pub fn first_free_chunk(&self, min_order: u32) -> Option<(u32, u32)> {
        for ord in min_order..self.orders {
            if self.counters[ord as usize] == 0 {
                continue;
            }
            let chunks = self.capacity >> ord;
            if ord == 0 {
                if let Some(idx) = bitmap::next_zero(&self.bitmap, chunks, self.first_free) {
                    return Some((idx, 0));
                }
            } else {
                let layer = &self.layers[ord as usize - 1];
                if let Some(idx) = bitmap::next_zero(layer, chunks, 0) {
                    return Some((idx << ord, ord));
                }
            }
        }
        None
    }

    // ── Mutation ────────────────────────────────────────────────────────

    /// Mark `[start, start + len)` used, splitting larger chunks as needed.
    ///
    /// The whole range must currently be free; on violation nothing is
    /// mutated and `BuddyError::NotFree` reports the offending cluster.
    pub fn mark_used(
        &mut self,
        start: u32,
        len: u32,
    ) -> Result<Option<SplitRemainder>, BuddyError> {
        self.check_range(start, len)?;
        for idx in start..start + len {
            if bitmap::get(&self.bitmap, idx) {
                return Err(BuddyError::NotFree { at: idx });
            }
        }

        self.free -= len;
        if self.first_free == start {
            self.first_free = start + len;
        }

        // Fragment delta from the neighbors of the carved range.
        let left_free = start > 0 && !bitmap::get(&self.bitmap, start - 1);
        let right_free = start + len < self.clusters && !bitmap::get(&self.bitmap, start + len);
        if left_free && right_free {
            self.fragments += 1;
        } else if !left_free && !right_free {
            self.fragments -= 1;
        }

        let mut token = None;
        let mut cur = start;
        let mut remaining = len;
        while remaining > 0 {
            let ord = self.order_for(cur);
            if (cur >> ord) << ord == cur && remaining >= (1 << ord) {
                // The whole chunk is consumed at once.
                self.take_chunk(ord, cur >> ord);
                cur += 1 << ord;
                remaining -= 1 << ord;
                continue;
            }
            // Split one level and retry.
            if token.is_none() {
                token = Some(SplitRemainder {
                    order: ord,
                    remaining,
                });
            }
            debug_assert!(ord > 0);
            self.take_chunk(ord, cur >> ord);
            let child = ord - 1;
            let pair = (cur >> child) & !1_u32;
            self.put_chunk(child, pair);
            self.put_chunk(child, pair + 1);
        }

        bitmap::set_range(&mut self.bitmap, start, len);
        self.recompute_largest_order();
        trace!(
            target: "tess::alloc::buddy",
            start,
            len,
            free = self.free,
            "mark_used"
        );
        Ok(token)
    }

    /// Mark `[start, start + len)` free, coalescing buddies upward.
    ///
    /// The whole range must currently be used; a double-free leaves the
    /// structure untouched and reports the offending cluster.
    pub fn mark_free(&mut self, start: u32, len: u32) -> Result<(), BuddyError> {
        self.check_range(start, len)?;
        for idx in start..start + len {
            if !bitmap::get(&self.bitmap, idx) {
                return Err(BuddyError::NotUsed { at: idx });
            }
        }

        bitmap::clear_range(&mut self.bitmap, start, len);
        self.free += len;
        self.first_free = self.first_free.min(start);

        let left_free = start > 0 && !bitmap::get(&self.bitmap, start - 1);
        let right_free = start + len < self.clusters && !bitmap::get(&self.bitmap, start + len);
        if left_free && right_free {
            self.fragments -= 1;
        } else if !left_free && !right_free {
            self.fragments += 1;
        }

        self.insert_decomposed(start, len);
        self.recompute_largest_order();
        trace!(
            target: "tess::alloc::buddy",
            start,
            len,
            free = self.free,
            "mark_free"
        );
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn check_range(&self, start: u32, len: u32) -> Result<(), BuddyError> {
        if len == 0 || u64::from(start) + u64::from(len) > u64::from(self.clusters) {
            return Err(BuddyError::OutOfRange { start, len });
        }
        Ok(())
    }

    /// Order at which the free cluster `cluster` is represented.
    fn order_for(&self, cluster: u32) -> u32 {
        for ord in 1..self.orders {
            let layer = &self.layers[ord as usize - 1];
            if !bitmap::get(layer, cluster >> ord) {
                return ord;
            }
        }
        0
    }

    fn chunk_free(&self, ord: u32, idx: u32) -> bool {
        if ord == 0 {
            !bitmap::get(&self.bitmap, idx)
        } else {
            !bitmap::get(&self.layers[ord as usize - 1], idx)
        }
    }

    /// Remove a free chunk's representation at `ord`. The order-0 layer is
    /// the bitmap itself, whose bit is owned by the caller (set on use,
    /// left clear on merge), so only the counter moves there.
    fn take_chunk(&mut self, ord: u32, idx: u32) {
        if ord > 0 {
            bitmap::set(&mut self.layers[ord as usize - 1], idx);
        }
        self.counters[ord as usize] -= 1;
    }

    fn put_chunk(&mut self, ord: u32, idx: u32) {
        if ord > 0 {
            bitmap::clear(&mut self.layers[ord as usize - 1], idx);
        }
        self.counters[ord as usize] += 1;
    }

    /// Decompose a free run into maximal aligned chunks and insert each,
    /// merging with free buddies upward.
    fn insert_decomposed(&mut self, start: u32, len: u32) {
        let mut cur = start;
        let end = start + len;
        while cur < end {
            let align = if cur == 0 {
                self.orders - 1
            } else {
                cur.trailing_zeros().min(self.orders - 1)
            };
            let fit = (end - cur).ilog2();
            let ord = align.min(fit);
            self.insert_free_chunk(ord, cur >> ord);
            cur += 1 << ord;
        }
    }

    fn insert_free_chunk(&mut self, mut ord: u32, mut idx: u32) {
        while ord + 1 < self.orders {
            let buddy = idx ^ 1;
            if !self.chunk_free(ord, buddy) {
                break;
            }
            self.take_chunk(ord, buddy);
            idx >>= 1;
            ord += 1;
        }
        self.put_chunk(ord, idx);
    }

    fn recompute_largest_order(&mut self) {
        self.largest_order = (0..self.orders).rev().find(|&ord| self.counters[ord as usize] > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn empty(capacity: u32) -> BuddyIndex {
        let raw = vec![0_u8; (capacity as usize).div_ceil(8)];
        BuddyIndex::build(&raw, capacity, capacity)
    }

    #[test]
    fn build_all_free_is_one_top_chunk() {
        let b = empty(1024);
        assert_eq!(b.free(), 1024);
        assert_eq!(b.fragments(), 1);
        assert_eq!(b.largest_order(), Some(10));
        assert_eq!(b.counters()[10], 1);
        assert!(b.counters()[..10].iter().all(|&c| c == 0));
    }

    #[test]
    fn build_short_group_pads_tail_used() {
        let raw = vec![0_u8; 128];
        let b = BuddyIndex::build(&raw, 1000, 1024);
        assert_eq!(b.free(), 1000);
        // Tail clusters are not allocatable.
        assert!(!b.is_free(1000));
        assert!(b.find_extent(999, 4).is_some_and(|r| r.len == 1));
    }

    #[test]
    fn build_from_fragmented_bitmap() {
        // Used: [8, 16), free: [0, 8) and [16, 32).
        let mut raw = vec![0_u8; 4];
        crate::bitmap::set_range(&mut raw, 8, 8);
        let b = BuddyIndex::build(&raw, 32, 32);
        assert_eq!(b.free(), 24);
        assert_eq!(b.fragments(), 2);
        assert_eq!(b.counters()[3], 1); // [0, 8)
        assert_eq!(b.counters()[4], 1); // [16, 32)
        assert_eq!(b.largest_order(), Some(4));
    }

    #[test]
    fn mark_used_aligned_consumes_whole_chunk() {
        let mut b = empty(1024);
        let token = b.mark_used(0, 8).unwrap();
        // The top chunk had to be split down to order 3.
        assert_eq!(
            token,
            Some(SplitRemainder {
                order: 10,
                remaining: 8
            })
        );
        assert_eq!(b.free(), 1016);
        assert_eq!(b.fragments(), 1);
        // 1016 free = 8 + 16 + ... + 512 as buddies of the split path.
        for ord in 3..10 {
            assert_eq!(b.counters()[ord as usize], 1, "order {ord}");
        }
        assert_eq!(b.largest_order(), Some(9));
    }

    #[test]
    fn mark_used_middle_splits_run() {
        let mut b = empty(64);
        b.mark_used(20, 8).unwrap();
        assert_eq!(b.free(), 56);
        assert_eq!(b.fragments(), 2);
        assert!(b.is_free(19));
        assert!(!b.is_free(20));
        assert!(!b.is_free(27));
        assert!(b.is_free(28));
    }

    #[test]
    fn mark_free_coalesces_buddies() {
        let mut b = empty(64);
        b.mark_used(0, 64).unwrap();
        assert_eq!(b.free(), 0);
        assert_eq!(b.largest_order(), None);

        b.mark_free(0, 32).unwrap();
        b.mark_free(32, 32).unwrap();
        assert_eq!(b.free(), 64);
        assert_eq!(b.fragments(), 1);
        assert_eq!(b.largest_order(), Some(6));
        assert_eq!(b.counters()[6], 1);
        assert!(b.counters()[..6].iter().all(|&c| c == 0));
    }

    #[test]
    fn mark_free_detects_double_free() {
        let mut b = empty(64);
        b.mark_used(0, 8).unwrap();
        b.mark_free(0, 8).unwrap();
        let err = b.mark_free(0, 8).unwrap_err();
        assert_eq!(err, BuddyError::NotUsed { at: 0 });
        // Nothing was mutated by the failed call.
        assert_eq!(b.free(), 64);
    }

    #[test]
    fn mark_used_detects_double_alloc() {
        let mut b = empty(64);
        b.mark_used(4, 4).unwrap();
        let err = b.mark_used(2, 4).unwrap_err();
        assert_eq!(err, BuddyError::NotFree { at: 4 });
        assert_eq!(b.free(), 60);
    }

    #[test]
    fn roundtrip_restores_counts() {
        let mut b = empty(1024);
        let before = (b.free(), b.fragments(), b.counters().to_vec());
        b.mark_used(100, 37).unwrap();
        b.mark_free(100, 37).unwrap();
        assert_eq!(
            (b.free(), b.fragments(), b.counters().to_vec()),
            before
        );
    }

    #[test]
    fn find_extent_grows_across_chunks() {
        let mut b = empty(64);
        b.mark_used(0, 64).unwrap();
        b.mark_free(3, 10).unwrap();
        let run = b.find_extent(3, 32).unwrap();
        assert_eq!(run, FreeRun { start: 3, len: 10 });
        let run = b.find_extent(5, 4).unwrap();
        assert_eq!(run.start, 5);
        assert!(run.len >= 4);
        assert!(b.find_extent(0, 1).is_none());
    }

    #[test]
    fn find_extent_used_start_is_none() {
        let mut b = empty(64);
        b.mark_used(10, 4).unwrap();
        assert!(b.find_extent(10, 1).is_none());
    }

    #[test]
    fn first_free_chunk_scans_orders_upward() {
        let mut b = empty(64);
        b.mark_used(0, 64).unwrap();
        b.mark_free(8, 8).unwrap(); // order-3 chunk at 8
        b.mark_free(32, 32).unwrap(); // order-5 chunk at 32
        assert_eq!(b.first_free_chunk(3), Some((8, 3)));
        assert_eq!(b.first_free_chunk(4), Some((32, 5)));
        assert_eq!(b.first_free_chunk(6), None);
    }

    #[test]
    fn avg_fragment_order_buckets() {
        let mut b = empty(1024);
        b.mark_used(0, 1024).unwrap();
        // Two fragments of 4: avg 4 -> bucket 2.
        b.mark_free(0, 4).unwrap();
        b.mark_free(8, 4).unwrap();
        assert_eq!(b.avg_fragment_order(), Some(2));
        // One more of 120: avg (4+4+120)/3 = 42 -> bucket 5.
        b.mark_free(128, 120).unwrap();
        assert_eq!(b.avg_fragment_order(), Some(5));
    }

    proptest! {
        /// Random mark_used/mark_free sequences keep the derived counters
        /// consistent with a freshly built index over the same bitmap.
        #[test]
        fn rebuild_matches_incremental(ops in proptest::collection::vec((0_u32..256, 1_u32..32, any::<bool>()), 1..40)) {
            let mut b = empty(256);
            for (start, len, used) in ops {
                let len = len.min(256 - start);
                if len == 0 {
                    continue;
                }
                if used {
                    let _ = b.mark_used(start, len);
                } else {
                    let _ = b.mark_free(start, len);
                }
            }
            let rebuilt = BuddyIndex::build(b.raw_bitmap(), 256, 256);
            prop_assert_eq!(rebuilt.free(), b.free());
            prop_assert_eq!(rebuilt.fragments(), b.fragments());
            prop_assert_eq!(rebuilt.counters(), b.counters());
            prop_assert_eq!(rebuilt.largest_order(), b.largest_order());
            prop_assert_eq!(
                crate::bitmap::count_free(b.raw_bitmap(), 256),
                b.free()
            );
        }
    }
}
