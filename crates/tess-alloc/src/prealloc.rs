//! Preallocation store: per-file reservations and locality-group pools.
//!
//! A reservation (`PaShared`) is a window of clusters already marked used
//! in its group's buddy so that nobody else can take them, while the
//! on-disk bitmap only fills in as the window is actually consumed.
//!
//! Two owners exist:
//!
//! - **per-file index**: ordered by logical start, non-overlapping by
//!   construction (request normalization clips against neighbours). A
//!   lookup serves any logical block inside the window.
//! - **locality-group pools**: per-shard bucket arrays keyed by
//!   `floor(log2(free))`, consumed front to back by whichever small file
//!   allocates next. Buckets are capped; overflow evicts the least-free
//!   reservations.
//!
//! Lifecycle: `Active(free > 0)` → `Depleted(free == 0, unlinked)` or
//! `Deleted` (discard, truncate, ENOSPC sweep). A deleted reservation that
//! still has concurrent users parks on a generation-stamped graveyard and
//! is physically released once the last user drops.
//!
//! Lock order: owner (file index / pool bucket) → group → reservation.

use crate::request::{AllocContext, AllocStatus, FreeExtent, HINT_GOAL_ONLY, HINT_GROUP_ALLOC};
use crate::stats::AllocStats;
use crate::{Inner, bitmap};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tess_types::{Cx, GroupNumber, InodeNumber};
use tracing::{debug, error, trace, warn};

/// Bucket count of the locality pools (`floor(log2(free))`, clamped).
pub(crate) const PREALLOC_BUCKETS: usize = 10;

/// Ordered per-file reservation index, keyed by logical window start.
pub(crate) type FilePaIndex = RwLock<BTreeMap<u32, Arc<PaShared>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PaKind {
    Inode,
    Locality,
}

/// Mutable accounting of one reservation, behind its own small mutex.
#[derive(Debug)]
pub(crate) struct PaAccounting {
    /// Next unconsumed cluster (group-relative); locality windows consume
    /// from the front, so `[cursor, start + len)` is the live remainder.
    pub cursor: u32,
    /// Unconsumed clusters left in the window.
    pub free: u32,
    deleted: bool,
}

impl PaAccounting {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }
}

/// One preallocated window. Immutable placement, mutable accounting.
#[derive(Debug)]
pub(crate) struct PaShared {
    pub kind: PaKind,
    pub inode: InodeNumber,
    pub shard: u32,
    pub group: GroupNumber,
    /// Group-relative window start.
    pub start: u32,
    /// Window length in clusters.
    pub len: u32,
    /// Logical window start (inode reservations).
    pub lstart: u32,
    pub accounting: Mutex<PaAccounting>,
    /// Concurrent allocations currently consuming from this window. A
    /// deleted reservation is physically released only at zero.
    pub users: AtomicU32,
}

impl PaShared {
    fn new_inode(
        inode: InodeNumber,
        group: GroupNumber,
        start: u32,
        len: u32,
        lstart: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind: PaKind::Inode,
            inode,
            shard: 0,
            group,
            start,
            len,
            lstart,
            accounting: Mutex::new(PaAccounting {
                cursor: start,
                free: len,
                deleted: false,
            }),
            users: AtomicU32::new(0),
        })
    }

    fn new_locality(shard: u32, group: GroupNumber, start: u32, len: u32) -> Arc<Self> {
        Arc::new(Self {
            kind: PaKind::Locality,
            inode: InodeNumber(0),
            shard,
            group,
            start,
            len,
            lstart: 0,
            accounting: Mutex::new(PaAccounting {
                cursor: start,
                free: len,
                deleted: false,
            }),
            users: AtomicU32::new(0),
        })
    }

    /// End of the logical window (inode reservations).
    #[must_use]
    pub fn logical_end(&self) -> u64 {
        u64::from(self.lstart) + u64::from(self.len)
    }
}

struct GraveyardEntry {
    generation: u64,
    pa: Arc<PaShared>,
}

/// The store: file indices, locality pools, and the graveyard.
pub(crate) struct PaStore {
    files: RwLock<HashMap<InodeNumber, Arc<FilePaIndex>>>,
    /// `[shard][bucket]` lists, each sorted by descending `free`.
    pools: Vec<Vec<Mutex<Vec<Arc<PaShared>>>>>,
    graveyard: Mutex<Vec<GraveyardEntry>>,
}

impl PaStore {
    pub fn new(shards: u32) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            pools: (0..shards.max(1))
                .map(|_| (0..PREALLOC_BUCKETS).map(|_| Mutex::new(Vec::new())).collect())
                .collect(),
            graveyard: Mutex::new(Vec::new()),
        }
    }

    pub fn file_index(&self, inode: InodeNumber) -> Arc<FilePaIndex> {
        if let Some(index) = self.files.read().get(&inode) {
            return Arc::clone(index);
        }
        Arc::clone(
            self.files
                .write()
                .entry(inode)
                .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new()))),
        )
    }

    pub fn existing_file_index(&self, inode: InodeNumber) -> Option<Arc<FilePaIndex>> {
        self.files.read().get(&inode).map(Arc::clone)
    }

    fn bucket_for_free(free: u32) -> usize {
        (free.max(1).ilog2() as usize).min(PREALLOC_BUCKETS - 1)
    }

    /// Insert into the shard's bucket sorted by descending `free`; evict
    /// non-busy tail entries beyond `cap` (marked deleted, returned for
    /// physical release by the caller).
    pub fn add_locality_pa(&self, pa: &Arc<PaShared>, cap: usize) -> Vec<Arc<PaShared>> {
        let free = pa.accounting.lock().free;
        let bucket = &self.pools[pa.shard as usize][Self::bucket_for_free(free)];
        let mut list = bucket.lock();

        let pos = list
            .iter()
            .position(|other| other.accounting.lock().free < free)
            .unwrap_or(list.len());
        list.insert(pos, Arc::clone(pa));

        let mut evicted = Vec::new();
        let mut idx = list.len();
        while list.len() - evicted.len() > cap && idx > 0 {
            idx -= 1;
            if Arc::ptr_eq(&list[idx], pa) {
                continue;
            }
            let victim = &list[idx];
            let mut acct = victim.accounting.lock();
            if acct.is_deleted() || victim.users.load(Ordering::Acquire) > 0 {
                continue;
            }
            acct.mark_deleted();
            drop(acct);
            evicted.push(Arc::clone(victim));
        }
        list.retain(|p| !evicted.iter().any(|v| Arc::ptr_eq(v, p)));
        evicted
    }

    /// Remove a reservation from whichever bucket of its shard holds it.
    pub fn remove_locality_pa(&self, pa: &Arc<PaShared>) {
        for bucket in &self.pools[pa.shard as usize] {
            let mut list = bucket.lock();
            let before = list.len();
            list.retain(|p| !Arc::ptr_eq(p, pa));
            if list.len() != before {
                return;
            }
        }
    }

    pub fn push_graveyard(&self, generation: u64, pa: Arc<PaShared>) {
        trace!(
            target: "tess::alloc::prealloc",
            group = pa.group.0,
            start = pa.start,
            generation,
            "reservation parked on graveyard"
        );
        self.graveyard.lock().push(GraveyardEntry { generation, pa });
    }

    /// Take every graveyard entry whose last user is gone.
    pub fn drain_graveyard_ready(&self) -> Vec<Arc<PaShared>> {
        let mut parked = self.graveyard.lock();
        let mut ready = Vec::new();
        parked.retain(|entry| {
            if entry.pa.users.load(Ordering::Acquire) == 0 {
                ready.push(Arc::clone(&entry.pa));
                false
            } else {
                true
            }
        });
        ready
    }
}

// ── Allocation-path entry points ────────────────────────────────────────────

impl Inner {
    /// Serve the request from an existing reservation if possible.
    ///
    /// Per-file windows are consulted first (keyed by logical position),
    /// then the request's locality pool (closest physical distance wins).
    /// Neither path touches any group lock.
    pub(crate) fn use_preallocated(&self, ctx: &mut AllocContext) -> bool {
        if !ctx.is_data() {
            return false;
        }
        if self.use_inode_pa(ctx) {
            AllocStats::bump(&self.stats.pa_inode_hits);
            return true;
        }
        if ctx.flags & HINT_GROUP_ALLOC != 0 && self.use_locality_pa(ctx) {
            AllocStats::bump(&self.stats.pa_locality_hits);
            return true;
        }
        false
    }

    fn use_inode_pa(&self, ctx: &mut AllocContext) -> bool {
        let Some(index) = self.pas.existing_file_index(ctx.inode) else {
            return false;
        };
        let map = index.read();
        let logical = ctx.orig.logical;

        // Nearest window at or left of the request, skipping entries that
        // are mid-deletion.
        for (_, pa) in map.range(..=logical).rev() {
            let mut acct = pa.accounting.lock();
            if acct.is_deleted() {
                continue;
            }
            if u64::from(logical) >= pa.logical_end() || acct.free == 0 {
                // The nearest live window does not cover the request; no
                // other window can (they are disjoint).
                return false;
            }
            if !self.pa_goal_check(ctx, pa) {
                return false;
            }

            let offset = logical - pa.lstart;
            let len = ctx.orig.len.min(pa.len - offset).min(acct.free);
            if len == 0 {
                return false;
            }
            acct.free -= len;
            pa.users.fetch_add(1, Ordering::AcqRel);
            drop(acct);

            ctx.best = FreeExtent {
                group: pa.group,
                start: pa.start + offset,
                len,
                logical,
            };
            ctx.status = AllocStatus::Found;
            ctx.pa = Some(Arc::clone(pa));
            debug!(
                target: "tess::alloc::prealloc",
                inode = ctx.inode.0,
                group = pa.group.0,
                start = ctx.best.start,
                len,
                "served from inode reservation"
            );
            return true;
        }
        false
    }

    /// `GOAL_ONLY` requests may only use a reservation whose physical
    /// mapping lands exactly on the requested goal.
    fn pa_goal_check(&self, ctx: &AllocContext, pa: &PaShared) -> bool {
        if ctx.flags & HINT_GOAL_ONLY == 0 {
            return true;
        }
        if pa.group != ctx.goal.group {
            return false;
        }
        let mapped = u64::from(pa.start) + u64::from(ctx.goal.logical - pa.lstart);
        mapped == u64::from(ctx.goal.start)
            && ctx.goal.len <= pa.len - (ctx.goal.logical - pa.lstart)
    }

    fn use_locality_pa(&self, ctx: &mut AllocContext) -> bool {
        let needed = ctx.orig.len;
        let goal_abs = self
            .geometry
            .group_to_cluster(ctx.goal.group, ctx.goal.start)
            .0;
        let from_bucket = PaStore::bucket_for_free(needed);

        // Two passes cover the race where the closest candidate is consumed
        // between selection and use.
        for _ in 0..2 {
            let mut best: Option<(u64, Arc<PaShared>)> = None;
            for bucket in &self.pas.pools[ctx.shard as usize][from_bucket..] {
                for pa in bucket.lock().iter() {
                    let acct = pa.accounting.lock();
                    if acct.is_deleted() || acct.free < needed {
                        continue;
                    }
                    let pa_abs = self.geometry.group_to_cluster(pa.group, acct.cursor).0;
                    let distance = pa_abs.abs_diff(goal_abs);
                    if best.as_ref().is_none_or(|(d, _)| distance < *d) {
                        best = Some((distance, Arc::clone(pa)));
                    }
                }
            }
            let Some((_, pa)) = best else {
                return false;
            };

            let mut acct = pa.accounting.lock();
            if acct.is_deleted() || acct.free < needed {
                continue;
            }
            let start = acct.cursor;
            acct.cursor += needed;
            acct.free -= needed;
            pa.users.fetch_add(1, Ordering::AcqRel);
            drop(acct);

            ctx.best = FreeExtent {
                group: pa.group,
                start,
                len: needed,
                logical: ctx.orig.logical,
            };
            ctx.status = AllocStatus::Found;
            ctx.pa = Some(pa);
            return true;
        }
        false
    }

    /// Turn the surplus of a found extent into a new reservation.
    ///
    /// The whole best extent is already marked used in the buddy; this
    /// records the window, registers it with its owner and group, and
    /// consumes the originally requested slice out of it.
    pub(crate) fn new_preallocation(&self, ctx: &mut AllocContext) {
        debug_assert!(ctx.status == AllocStatus::Found);
        debug_assert!(ctx.best.len > ctx.orig.len);

        let window = ctx.best;
        let pa = if ctx.flags & HINT_GROUP_ALLOC != 0 {
            let pa = PaShared::new_locality(ctx.shard, window.group, window.start, window.len);
            {
                let mut acct = pa.accounting.lock();
                acct.cursor = window.start + ctx.orig.len;
                acct.free = window.len - ctx.orig.len;
            }
            ctx.best = FreeExtent {
                group: window.group,
                start: window.start,
                len: ctx.orig.len,
                logical: ctx.orig.logical,
            };
            pa
        } else {
            // If the window came back shorter than the normalized goal, pick
            // a logical start that still covers the original request:
            // prefer the end of the goal window, then its start, then the
            // request itself.
            let lstart = if window.len < ctx.orig_goal_len {
                let goal_end = u64::from(ctx.goal.logical) + u64::from(ctx.orig_goal_len);
                let tail_start = goal_end - u64::from(window.len);
                if u64::from(ctx.orig.logical) >= tail_start {
                    #[expect(clippy::cast_possible_truncation)]
                    {
                        tail_start as u32
                    }
                } else if u64::from(ctx.orig.logical)
                    < u64::from(ctx.goal.logical) + u64::from(window.len)
                {
                    ctx.goal.logical
                } else {
                    ctx.orig.logical
                }
            } else {
                ctx.goal.logical
            };

            let pa = PaShared::new_inode(ctx.inode, window.group, window.start, window.len, lstart);
            let offset = ctx.orig.logical - lstart;
            let len = ctx.orig.len.min(window.len - offset);
            {
                let mut acct = pa.accounting.lock();
                acct.free = window.len - len;
            }
            ctx.best = FreeExtent {
                group: window.group,
                start: window.start + offset,
                len,
                logical: ctx.orig.logical,
            };

            // Register in the per-file index (owner lock before group lock).
            let index = self.pas.file_index(ctx.inode);
            index.write().insert(lstart, Arc::clone(&pa));
            pa
        };

        pa.users.fetch_add(1, Ordering::AcqRel);
        self.groups[window.group.0 as usize]
            .state
            .lock()
            .pas
            .push(Arc::clone(&pa));
        AllocStats::bump(&self.stats.pa_created);
        debug!(
            target: "tess::alloc::prealloc",
            group = window.group.0,
            start = window.start,
            len = window.len,
            kind = ?pa.kind,
            "new reservation"
        );
        ctx.pa = Some(pa);
    }

    /// Post-allocation bookkeeping for the reservation used by `ctx`:
    /// re-bucket locality windows by their new free count, unlink depleted
    /// windows, and drop the user reference.
    pub(crate) fn release_context(&self, cx: &Cx, ctx: &mut AllocContext) {
        let Some(pa) = ctx.pa.take() else {
            return;
        };
        match pa.kind {
            PaKind::Locality => {
                let (free, deleted) = {
                    let acct = pa.accounting.lock();
                    (acct.free, acct.is_deleted())
                };
                if !deleted {
                    self.pas.remove_locality_pa(&pa);
                    if free > 0 {
                        let evicted = self.pas.add_locality_pa(&pa, self.config.lg_bucket_cap);
                        for victim in evicted {
                            self.finish_pa_release(cx, &victim);
                        }
                    } else {
                        pa.accounting.lock().mark_deleted();
                        self.groups[pa.group.0 as usize].state.lock().remove_pa(&pa);
                    }
                }
            }
            PaKind::Inode => {
                let depleted = {
                    let mut acct = pa.accounting.lock();
                    if acct.free == 0 && !acct.is_deleted() {
                        acct.mark_deleted();
                        true
                    } else {
                        false
                    }
                };
                if depleted {
                    if let Some(index) = self.pas.existing_file_index(pa.inode) {
                        index.write().remove(&pa.lstart);
                    }
                    self.groups[pa.group.0 as usize].state.lock().remove_pa(&pa);
                }
            }
        }
        pa.users.fetch_sub(1, Ordering::AcqRel);
        self.sweep_graveyard(cx);
    }

    // ── Discard / release ───────────────────────────────────────────────

    /// Return the unconsumed clusters of a deleted, unlinked reservation
    /// to its group's buddy. Parks on the graveyard instead if a
    /// concurrent user still holds the window.
    pub(crate) fn finish_pa_release(&self, cx: &Cx, pa: &Arc<PaShared>) {
        if pa.users.load(Ordering::Acquire) > 0 {
            let generation = self.discard_generation();
            self.pas.push_graveyard(generation, Arc::clone(pa));
            return;
        }
        let cell = &self.groups[pa.group.0 as usize];
        let mut state = cell.state.lock();
        state.remove_pa(pa);
        self.release_pa_blocks(cx, &mut state, pa);
        if let Some(buddy) = state.buddy.as_ref() {
            self.catalog.update(pa.group, buddy);
        }
        drop(state);
        self.bump_discard_generation();
        AllocStats::bump(&self.stats.pa_discarded);
    }

    /// Free the unconsumed part of `pa` in the buddy. Group lock held by
    /// the caller; the reservation must already be deleted and unlinked.
    pub(crate) fn release_pa_blocks(&self, cx: &Cx, state: &mut crate::group::GroupState, pa: &PaShared) -> u32 {
        let Some(buddy) = state.buddy.as_mut() else {
            return 0;
        };
        let acct = pa.accounting.lock();
        let expected = acct.free;
        let mut freed = 0_u32;

        match pa.kind {
            PaKind::Locality => {
                if expected > 0
                    && let Err(err) = buddy.mark_free(acct.cursor, expected)
                {
                    warn!(
                        target: "tess::alloc::prealloc",
                        group = pa.group.0,
                        ?err,
                        "locality reservation release failed"
                    );
                    state.corrupt = true;
                    self.catalog.mark_corrupt(pa.group);
                    return 0;
                }
                freed = expected;
            }
            PaKind::Inode => {
                // Only the window's clusters that never reached the disk
                // bitmap are still reserved; walk the persistent bitmap to
                // find them.
                let mut raw = match self.store.read_group_bitmap(cx, pa.group) {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(
                            target: "tess::alloc::prealloc",
                            group = pa.group.0,
                            ?err,
                            "bitmap read failed during reservation release; clusters leak until rebuild"
                        );
                        return 0;
                    }
                };
                // A short buffer must not read as free space.
                raw.resize(
                    (self.geometry.clusters_per_group as usize).div_ceil(8),
                    0xFF,
                );
                for (start, len) in bitmap::zero_runs(&raw, pa.start, pa.start + pa.len) {
                    if buddy.mark_free(start, len).is_err() {
                        state.corrupt = true;
                        self.catalog.mark_corrupt(pa.group);
                        return freed;
                    }
                    freed += len;
                }
                if freed != expected {
                    error!(
                        target: "tess::alloc::prealloc",
                        group = pa.group.0,
                        freed,
                        expected,
                        "reservation free-count mismatch"
                    );
                    state.corrupt = true;
                    self.catalog.mark_corrupt(pa.group);
                }
            }
        }
        trace!(
            target: "tess::alloc::prealloc",
            group = pa.group.0,
            freed,
            "reservation released"
        );
        freed
    }

    /// Discard every idle reservation of one group. Returns clusters made
    /// free; sets `busy` when an in-use reservation had to be skipped.
    pub(crate) fn discard_group_preallocations(
        &self,
        cx: &Cx,
        group: GroupNumber,
        busy: &mut bool,
    ) -> u32 {
        let cell = &self.groups[group.0 as usize];

        // Phase 1 (group lock): mark idle reservations deleted and pull
        // them off the group list.
        let victims: Vec<Arc<PaShared>> = {
            let mut state = cell.state.lock();
            let mut victims = Vec::new();
            state.pas.retain(|pa| {
                let mut acct = pa.accounting.lock();
                if acct.is_deleted() {
                    return true;
                }
                if pa.users.load(Ordering::Acquire) > 0 {
                    *busy = true;
                    return true;
                }
                acct.mark_deleted();
                victims.push(Arc::clone(pa));
                false
            });
            victims
        };
        if victims.is_empty() {
            return 0;
        }

        // Phase 2 (owner locks only): unlink from the owning index.
        for pa in &victims {
            match pa.kind {
                PaKind::Inode => {
                    if let Some(index) = self.pas.existing_file_index(pa.inode) {
                        index.write().remove(&pa.lstart);
                    }
                }
                PaKind::Locality => self.pas.remove_locality_pa(pa),
            }
        }

        // Phase 3 (group lock): give the unconsumed clusters back.
        let mut freed = 0;
        {
            let mut state = cell.state.lock();
            for pa in &victims {
                freed += self.release_pa_blocks(cx, &mut state, pa);
            }
            if let Some(buddy) = state.buddy.as_ref() {
                self.catalog.update(group, buddy);
            }
        }
        self.bump_discard_generation();
        self.stats
            .pa_discarded
            .fetch_add(victims.len() as u64, Ordering::Relaxed);
        debug!(
            target: "tess::alloc::prealloc",
            group = group.0,
            freed,
            discarded = victims.len(),
            "group preallocations discarded"
        );
        freed
    }

    /// ENOSPC path: sweep reservations filesystem-wide until `needed`
    /// clusters came free. Busy reservations are retried a few times.
    pub(crate) fn discard_all_preallocations(&self, cx: &Cx, needed: u32) -> u32 {
        let needed = if needed == 0 {
            self.geometry.clusters_per_group + 1
        } else {
            needed
        };
        let mut freed = 0_u32;
        for round in 0..3 {
            let mut busy = false;
            for g in 0..self.geometry.group_count {
                if freed >= needed {
                    break;
                }
                if cx.checkpoint().is_err() {
                    return freed;
                }
                freed += self.discard_group_preallocations(cx, GroupNumber(g), &mut busy);
            }
            self.sweep_graveyard(cx);
            if freed >= needed || !busy {
                break;
            }
            trace!(
                target: "tess::alloc::prealloc",
                round,
                freed,
                "busy reservations, retrying discard sweep"
            );
        }
        freed
    }

    /// Drop every reservation of one file (close/truncate path).
    pub(crate) fn discard_inode_pas(&self, cx: &Cx, inode: InodeNumber) {
        let Some(index) = self.pas.existing_file_index(inode) else {
            return;
        };
        let drained: Vec<Arc<PaShared>> = {
            let mut map = index.write();
            let drained = map.values().map(Arc::clone).collect();
            map.clear();
            drained
        };
        for pa in drained {
            pa.accounting.lock().mark_deleted();
            self.finish_pa_release(cx, &pa);
        }
    }

    /// Physically release deleted reservations whose last user is gone.
    pub(crate) fn sweep_graveyard(&self, cx: &Cx) {
        for pa in self.pas.drain_graveyard_ready() {
            let cell = &self.groups[pa.group.0 as usize];
            let mut state = cell.state.lock();
            state.remove_pa(&pa);
            self.release_pa_blocks(cx, &mut state, &pa);
            if let Some(buddy) = state.buddy.as_ref() {
                self.catalog.update(pa.group, buddy);
            }
        }
    }
}
