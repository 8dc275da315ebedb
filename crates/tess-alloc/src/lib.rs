#![forbid(unsafe_code)]
//! Free-space allocation engine for TessFS.
//!
//! Multi-cluster allocator in the mballoc tradition: a per-group binary
//! buddy index over the persistent bitmaps, five escalating group-selection
//! tiers, per-file and per-locality-group preallocation, and deferred
//! reclamation tied to journal commit.
//!
//! ## Design
//!
//! The engine is layered:
//!
//! 1. **bitmap** — raw bit manipulation on group bitmaps.
//! 2. **[`buddy`]** — per-group buddy index: split on use, coalesce on free.
//! 3. **[`catalog`]** — per-group cards plus the by-largest-order and
//!    by-average-fragment secondary indices.
//! 4. **selector / search** — the five-tier criteria walk and the
//!    within-group scan strategies.
//! 5. **prealloc** — speculative reservations consumed by later nearby
//!    requests.
//! 6. **reclaim** — commit-gated frees, background discard, trim.
//!
//! The persistent group bitmaps are the ground truth: everything in memory
//! is cache, rebuilt from [`BitmapStore`] on first touch of each group.
//! Preallocated windows and frees still pending a transaction commit are
//! overlaid during the rebuild, so
//! `on-disk state ∪ reservations ∪ pending frees` always reconciles with
//! the in-memory free accounting. A group that fails that reconciliation
//! is flagged corrupt and withdrawn; the rest of the filesystem keeps
//! allocating.

pub mod bitmap;
pub mod buddy;
pub mod catalog;
mod config;
mod group;
pub mod mem;
mod prealloc;
mod reclaim;
mod request;
mod search;
mod selector;
mod stats;

pub use config::AllocConfig;
pub use request::{
    AllocRequest, FreeExtent, HINT_GOAL_ONLY, HINT_MERGE, HINT_METADATA, HINT_NO_PREALLOC,
};
pub use stats::{AllocStats, StatsSnapshot};
pub use tess_error::{AllocError, Result};

use crate::catalog::GroupCatalog;
use crate::group::GroupCell;
use crate::prealloc::PaStore;
use crate::reclaim::{DiscardBatch, ReclaimIndex};
use crate::request::{AllocContext, AllocStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use tess_types::{AllocGeometry, ClusterNumber, Cx, GroupNumber, InodeNumber, TxnId};
use tracing::{debug, info, warn};

// ── Consumed collaborator interfaces ────────────────────────────────────────

/// Accessor for the persistent group bitmaps and their declared free
/// counts. Backed by the filesystem's page/block cache; the engine only
/// ever reads and writes whole group bitmaps through it.
pub trait BitmapStore: Send + Sync {
    /// Read the raw bitmap of `group` (1 = cluster used). The buffer must
    /// cover the whole group; extra bits past the group end are ignored.
    fn read_group_bitmap(&self, cx: &Cx, group: GroupNumber) -> Result<Vec<u8>>;

    /// Write back a modified group bitmap.
    fn write_group_bitmap(&self, cx: &Cx, group: GroupNumber, bitmap: &[u8]) -> Result<()>;

    /// Free-cluster count recorded in the group's persistent descriptor.
    fn declared_free(&self, group: GroupNumber) -> u32;

    /// Update the persistent free-cluster count.
    fn set_declared_free(&self, group: GroupNumber, free: u32);
}

/// Quota accounting callback.
pub trait QuotaSink: Send + Sync {
    /// Charge `clusters` against the caller's quota; `false` refuses.
    fn charge(&self, clusters: u32) -> bool;

    /// Return previously charged clusters.
    fn release(&self, clusters: u32);
}

/// Device discard (TRIM) primitive.
pub trait DiscardDevice: Send + Sync {
    fn issue_discard(&self, start: ClusterNumber, count: u32) -> Result<()>;
}

// ── Shared allocator state ──────────────────────────────────────────────────

pub(crate) struct Inner {
    pub(crate) geometry: AllocGeometry,
    pub(crate) config: AllocConfig,
    pub(crate) store: Arc<dyn BitmapStore>,
    pub(crate) quota: Arc<dyn QuotaSink>,
    pub(crate) device: Arc<dyn DiscardDevice>,
    pub(crate) groups: Vec<GroupCell>,
    pub(crate) catalog: GroupCatalog,
    pub(crate) pas: PaStore,
    pub(crate) reclaim: ReclaimIndex,
    pub(crate) stats: Arc<AllocStats>,
    /// Last stream allocation `(group, next start)`; large data requests
    /// chase it to stay sequential on disk.
    pub(crate) last_stream: Mutex<(u32, u32)>,
    /// Minimum extent length of the last completed trim, clusters.
    pub(crate) last_trim_min: AtomicU32,
    /// Bumped on every event that frees or discards space; the ENOSPC
    /// retry loop compares it to decide whether retrying is worthwhile.
    discard_gen: AtomicU64,
    pub(crate) discard_tx: Mutex<Option<mpsc::Sender<DiscardBatch>>>,
}

impl Inner {
    pub(crate) fn discard_generation(&self) -> u64 {
        self.discard_gen.load(Ordering::Acquire)
    }

    pub(crate) fn bump_discard_generation(&self) {
        self.discard_gen.fetch_add(1, Ordering::AcqRel);
    }

    /// Build a group's buddy from the persistent bitmap, overlaying the
    /// group's active preallocation windows. Caller holds the group lock.
    ///
    /// Frees still pending a commit need no overlay: their bits are still
    /// set in the persistent bitmap.
    pub(crate) fn load_group_locked(
        &self,
        cx: &Cx,
        group: GroupNumber,
        state: &mut group::GroupState,
    ) -> Result<()> {
        let clusters = self.geometry.clusters_in_group(group);
        let raw = self.store.read_group_bitmap(cx, group)?;

        let counted = bitmap::count_free(&raw, clusters);
        let declared = self.store.declared_free(group);
        if counted != declared {
            state.corrupt = true;
            self.catalog.mark_corrupt(group);
            return Err(AllocError::Corrupt {
                group: group.0,
                detail: format!("descriptor declares {declared} free, bitmap has {counted}"),
            });
        }

        let mut overlay = raw;
        overlay.resize((self.geometry.clusters_per_group as usize).div_ceil(8), 0xFF);
        for pa in &state.pas {
            bitmap::set_range(&mut overlay, pa.start, pa.len);
        }

        let buddy =
            buddy::BuddyIndex::build(&overlay, clusters, self.geometry.clusters_per_group);
        self.catalog.update(group, &buddy);
        state.buddy = Some(buddy);
        debug!(
            target: "tess::alloc",
            group = group.0,
            free = counted,
            "group buddy built"
        );
        Ok(())
    }

    /// Persist a committed allocation: set its bits in the on-disk bitmap
    /// and decrement the declared free count. A bit already set on disk
    /// means the in-memory and persistent views diverged.
    fn mark_diskspace_used(&self, cx: &Cx, ctx: &AllocContext) -> Result<()> {
        let ex = ctx.best;
        let cell = &self.groups[ex.group.0 as usize];
        let _guard = cell.state.lock();

        let mut raw = self.store.read_group_bitmap(cx, ex.group)?;
        for idx in ex.start..ex.start + ex.len {
            if bitmap::get(&raw, idx) {
                self.catalog.mark_corrupt(ex.group);
                return Err(AllocError::Corrupt {
                    group: ex.group.0,
                    detail: format!("cluster {idx} already allocated on disk"),
                });
            }
        }
        bitmap::set_range(&mut raw, ex.start, ex.len);
        self.store.write_group_bitmap(cx, ex.group, &raw)?;
        self.store.set_declared_free(
            ex.group,
            self.store.declared_free(ex.group).saturating_sub(ex.len),
        );
        Ok(())
    }

    /// Undo the in-memory side of a chosen extent after a persistence
    /// failure: re-credit the reservation it came from, or give the
    /// clusters straight back to the buddy.
    fn discard_allocated(&self, ctx: &mut AllocContext) {
        let ex = ctx.best;
        if ex.len == 0 {
            return;
        }
        if let Some(pa) = &ctx.pa {
            let mut acct = pa.accounting.lock();
            acct.free += ex.len;
            if pa.kind == prealloc::PaKind::Locality {
                acct.cursor -= ex.len;
            }
        } else {
            let cell = &self.groups[ex.group.0 as usize];
            let mut state = cell.state.lock();
            if let Some(buddy) = state.buddy.as_mut() {
                if let Err(err) = buddy.mark_free(ex.start, ex.len) {
                    warn!(target: "tess::alloc", group = ex.group.0, ?err, "rollback failed");
                    state.corrupt = true;
                    self.catalog.mark_corrupt(ex.group);
                } else {
                    self.catalog.update(ex.group, buddy);
                }
            }
        }
        ctx.best = request::FreeExtent::EMPTY;
    }

    /// One full allocation attempt: preallocation lookup, then the
    /// criteria walk, then persistence.
    fn attempt(&self, cx: &Cx, ctx: &mut AllocContext) -> Result<FreeExtent> {
        if !self.use_preallocated(ctx) {
            if !ctx.normalized {
                let file_pas = self.pas.existing_file_index(ctx.inode);
                request::normalize_request(ctx, &self.geometry, &self.config, file_pas.as_deref());
                ctx.normalized = true;
            }
            self.regular_allocator(cx, ctx)?;
            if ctx.status != AllocStatus::Found {
                return Err(AllocError::NoSpace);
            }
            if ctx.is_data()
                && ctx.flags & (request::HINT_NO_PREALLOC | request::HINT_GOAL_ONLY) == 0
                && ctx.best.len > ctx.orig.len
            {
                self.new_preallocation(ctx);
            }
        }

        match self.mark_diskspace_used(cx, ctx) {
            Ok(()) => {
                let ex = ctx.best;
                self.release_context(cx, ctx);
                Ok(ex)
            }
            Err(err) => {
                self.discard_allocated(ctx);
                self.release_context(cx, ctx);
                Err(err)
            }
        }
    }

    /// The allocation pipeline with the bounded ENOSPC retry loop: a
    /// failed search discards reclaimable preallocations filesystem-wide
    /// and retries while the discard generation shows progress.
    fn allocate_ctx(&self, cx: &Cx, ctx: &mut AllocContext) -> Result<FreeExtent> {
        let mut seq = self.discard_generation();
        let mut retries = 0_u32;
        loop {
            match self.attempt(cx, ctx) {
                Err(AllocError::NoSpace) => {
                    let freed = self.discard_all_preallocations(cx, ctx.orig.len);
                    let now = self.discard_generation();
                    retries += 1;
                    if (freed == 0 && now == seq) || retries > self.config.enospc_retries {
                        if let Some(err) = ctx.first_err.take() {
                            return Err(err);
                        }
                        return Err(AllocError::NoSpace);
                    }
                    AllocStats::bump(&self.stats.enospc_retries);
                    seq = now;
                    ctx.reset_for_retry();
                }
                other => return other,
            }
        }
    }
}

// ── Public facade ───────────────────────────────────────────────────────────

/// Read-only view of one group's allocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub free: u32,
    pub fragments: u32,
    pub largest_order: Option<u32>,
    pub loaded: bool,
    pub corrupt: bool,
}

/// The allocation engine.
///
/// One instance per mounted filesystem. All methods take `&self` and are
/// safe to call from parallel worker threads; see the module docs for the
/// locking model.
pub struct Allocator {
    inner: Arc<Inner>,
    discard_worker: Option<JoinHandle<()>>,
}

impl Allocator {
    /// Build an allocator over `geometry`, consuming the collaborator
    /// interfaces. Group buddies are built lazily on first touch.
    pub fn new(
        geometry: AllocGeometry,
        config: AllocConfig,
        store: Arc<dyn BitmapStore>,
        quota: Arc<dyn QuotaSink>,
        device: Arc<dyn DiscardDevice>,
    ) -> Result<Self> {
        if config.locality_shards == 0 {
            return Err(AllocError::InvalidRequest(
                "locality_shards must be at least 1".into(),
            ));
        }

        let stats = Arc::new(AllocStats::default());
        let catalog = GroupCatalog::new(geometry.group_count, geometry.order_count(), |g| {
            store.declared_free(GroupNumber(g))
        });

        let (discard_tx, discard_worker) = if config.discard_on_free {
            let (tx, handle) = reclaim::spawn_discard_worker(Arc::clone(&device), Arc::clone(&stats))?;
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        let inner = Arc::new(Inner {
            groups: (0..geometry.group_count).map(|_| GroupCell::default()).collect(),
            catalog,
            pas: PaStore::new(config.locality_shards),
            reclaim: ReclaimIndex::default(),
            stats,
            last_stream: Mutex::new((0, 0)),
            last_trim_min: AtomicU32::new(0),
            discard_gen: AtomicU64::new(0),
            discard_tx: Mutex::new(discard_tx),
            geometry,
            config,
            store,
            quota,
            device,
        });
        info!(
            target: "tess::alloc",
            groups = inner.geometry.group_count,
            clusters_per_group = inner.geometry.clusters_per_group,
            "allocator ready"
        );
        Ok(Self {
            inner,
            discard_worker,
        })
    }

    /// Find and reserve `req.len` contiguous clusters near the request's
    /// goal.
    ///
    /// Returns the exact reserved extent, which may be shorter than
    /// requested when only smaller runs exist; the caller re-requests the
    /// remainder. No partial state is left behind on error.
    pub fn allocate(&self, cx: &Cx, req: &AllocRequest) -> Result<FreeExtent> {
        cx.checkpoint()?;
        let inner = &self.inner;
        if req.len == 0 {
            return Err(AllocError::InvalidRequest("zero-length allocation".into()));
        }
        if req.len > inner.geometry.clusters_per_group {
            return Err(AllocError::InvalidRequest(format!(
                "request of {} clusters exceeds group size {}",
                req.len, inner.geometry.clusters_per_group
            )));
        }
        if let Some(goal) = req.goal
            && goal.0 >= inner.geometry.total_clusters
        {
            return Err(AllocError::InvalidRequest(format!(
                "goal cluster {goal} beyond device end"
            )));
        }

        AllocStats::bump(&inner.stats.requests);
        if !inner.quota.charge(req.len) {
            return Err(AllocError::QuotaExceeded);
        }

        let mut ctx = AllocContext::new(req, &inner.geometry, &inner.config);
        let result = inner.allocate_ctx(cx, &mut ctx);
        match &result {
            Ok(ex) => {
                if ex.len < req.len {
                    inner.quota.release(req.len - ex.len);
                }
            }
            Err(_) => inner.quota.release(req.len),
        }
        result
    }

    /// Free `count` clusters starting at `start`.
    ///
    /// With `txn` set the free is deferred: the clusters stay unavailable
    /// until [`on_transaction_commit`](Self::on_transaction_commit) runs
    /// for that transaction. Without it the free is applied immediately
    /// (for data whose crash consistency is not required).
    ///
    /// Freeing clusters inside a file's active preallocation window is a
    /// caller error; discard the file's reservations first
    /// ([`discard_inode_preallocations`](Self::discard_inode_preallocations)).
    pub fn free(&self, cx: &Cx, start: ClusterNumber, count: u32, txn: Option<TxnId>) -> Result<()> {
        cx.checkpoint()?;
        let inner = &self.inner;
        if count == 0 {
            return Err(AllocError::InvalidRequest("zero-length free".into()));
        }
        if !inner.geometry.within_one_group(start, count) {
            return Err(AllocError::InvalidRequest(format!(
                "free of [{start}, +{count}) crosses a group boundary"
            )));
        }

        let (group, rel) = inner.geometry.cluster_to_group(start);
        let cell = &inner.groups[group.0 as usize];
        let mut state = cell.state.lock();
        if state.buddy.is_none() {
            inner.load_group_locked(cx, group, &mut state)?;
        }
        if state.corrupt {
            return Err(AllocError::Corrupt {
                group: group.0,
                detail: "group withdrawn from allocation".into(),
            });
        }

        match txn {
            Some(txn) => inner.defer_free_locked(&mut state, group, rel, count, txn),
            None => {
                inner.free_in_group_locked(cx, group, &mut state, rel, count)?;
                drop(state);
                inner.bump_discard_generation();
                Ok(())
            }
        }
    }

    /// Commit notification from the journal: apply every free deferred
    /// under `txn` and queue the merged extents for background discard.
    pub fn on_transaction_commit(&self, cx: &Cx, txn: TxnId) -> Result<()> {
        self.inner.process_commit(cx, txn)
    }

    /// Discard unused free space in a byte range, issuing synchronous
    /// device discards for free runs of at least `min_extent_bytes`.
    /// Returns the number of bytes trimmed.
    pub fn trim(&self, cx: &Cx, start_byte: u64, len_bytes: u64, min_extent_bytes: u64) -> Result<u64> {
        self.inner.trim_fs(cx, start_byte, len_bytes, min_extent_bytes)
    }

    /// Drop every preallocation of one file (close/truncate path).
    pub fn discard_inode_preallocations(&self, cx: &Cx, inode: InodeNumber) {
        self.inner.discard_inode_pas(cx, inode);
    }

    /// Build the buddy structure of `group` now instead of on first touch.
    pub fn load_group(&self, cx: &Cx, group: GroupNumber) -> Result<()> {
        let inner = &self.inner;
        let cell = &inner.groups[group.0 as usize];
        let mut state = cell.state.lock();
        if state.buddy.is_some() {
            return Ok(());
        }
        inner.load_group_locked(cx, group, &mut state)
    }

    /// Rebuild a group's in-memory state from the persistent bitmap.
    ///
    /// The in-memory buddy is pure cache; this drops and re-derives it,
    /// re-running the free-count reconciliation (which can newly flag, or
    /// clear, the corrupt state).
    pub fn reload_group(&self, cx: &Cx, group: GroupNumber) -> Result<()> {
        let inner = &self.inner;
        let cell = &inner.groups[group.0 as usize];
        let mut state = cell.state.lock();
        state.buddy = None;
        state.corrupt = false;
        inner.catalog.clear_corrupt(group);
        inner.load_group_locked(cx, group, &mut state)
    }

    /// Read-only snapshot of one group's card.
    #[must_use]
    pub fn group_info(&self, group: GroupNumber) -> GroupInfo {
        let card = self.inner.catalog.card(group);
        GroupInfo {
            free: card.free(),
            fragments: card.fragments(),
            largest_order: u32::try_from(card.largest_order()).ok(),
            loaded: card.is_loaded(),
            corrupt: card.is_corrupt(),
        }
    }

    /// Clusters currently queued as deferred frees in `group`.
    #[must_use]
    pub fn deferred_clusters(&self, group: GroupNumber) -> u32 {
        let state = self.inner.groups[group.0 as usize].state.lock();
        state.pending.values().map(|e| e.count).sum()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    #[must_use]
    pub fn geometry(&self) -> &AllocGeometry {
        &self.inner.geometry
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        // Closing the channel stops the worker.
        self.inner.discard_tx.lock().take();
        if let Some(handle) = self.discard_worker.take() {
            let _ = handle.join();
        }
    }
}
