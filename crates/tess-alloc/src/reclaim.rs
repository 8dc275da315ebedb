//! Deferred reclamation: transaction-gated frees, background discard, and
//! explicit trim.
//!
//! A deferred free parks in its group's ordered pending map (merged with
//! adjacent entries of the same transaction) and only reaches the live
//! bitmap once the journal reports the transaction durable. Freed extents
//! can then be handed to a background worker that issues device discards
//! best-effort: discard failures are logged, never propagated to the
//! logical free.
//!
//! Explicit trim walks a caller-specified range synchronously, discarding
//! free runs of at least the requested length. Groups remember a completed
//! trim and short-circuit repeats until something is freed in them again.

use crate::group::GroupState;
use crate::stats::AllocStats;
use crate::{DiscardDevice, Inner, bitmap};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tess_error::{AllocError, Result};
use tess_types::{ClusterNumber, Cx, GroupNumber, TxnId};
use tracing::{debug, info, trace, warn};

/// One deferred free, group-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeferredFree {
    pub start: u32,
    pub count: u32,
    pub txn: TxnId,
}

/// Global index locating groups with pending entries per transaction.
#[derive(Debug, Default)]
pub(crate) struct ReclaimIndex {
    by_txn: parking_lot::Mutex<BTreeMap<TxnId, BTreeSet<u32>>>,
}

impl ReclaimIndex {
    pub fn note(&self, txn: TxnId, group: GroupNumber) {
        self.by_txn.lock().entry(txn).or_default().insert(group.0);
    }

    pub fn take(&self, txn: TxnId) -> BTreeSet<u32> {
        self.by_txn.lock().remove(&txn).unwrap_or_default()
    }
}

/// Extents queued for the background discard worker, absolute clusters.
pub(crate) type DiscardBatch = Vec<(ClusterNumber, u32)>;

/// Spawn the best-effort discard worker. The channel closing stops it.
pub(crate) fn spawn_discard_worker(
    device: Arc<dyn DiscardDevice>,
    stats: Arc<AllocStats>,
) -> Result<(mpsc::Sender<DiscardBatch>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel::<DiscardBatch>();
    let handle = std::thread::Builder::new()
        .name("tess-alloc-discard".into())
        .spawn(move || {
            for batch in rx {
                for (start, count) in batch {
                    match device.issue_discard(start, count) {
                        Ok(()) => {
                            AllocStats::bump(&stats.discards_issued);
                            trace!(
                                target: "tess::alloc::reclaim",
                                start = start.0,
                                count,
                                "discard issued"
                            );
                        }
                        Err(err) => warn!(
                            target: "tess::alloc::reclaim",
                            start = start.0,
                            count,
                            ?err,
                            "device discard failed; continuing"
                        ),
                    }
                }
            }
            debug!(target: "tess::alloc::reclaim", "discard worker stopped");
        })?;
    Ok((tx, handle))
}

impl Inner {
    /// Queue a free under `txn`; the clusters stay allocated until commit.
    /// Adjacent pending entries of the same transaction merge in place.
    pub(crate) fn defer_free_locked(
        &self,
        state: &mut GroupState,
        group: GroupNumber,
        start: u32,
        count: u32,
        txn: TxnId,
    ) -> Result<()> {
        let corrupt = |detail: String| {
            self.catalog.mark_corrupt(group);
            AllocError::Corrupt {
                group: group.0,
                detail,
            }
        };

        if let Some(buddy) = state.buddy.as_ref() {
            for idx in start..start + count {
                if buddy.is_free(idx) {
                    state.corrupt = true;
                    return Err(corrupt(format!("deferred free of already-free cluster {idx}")));
                }
            }
        }

        // Overlap with an already-pending free is a double free regardless
        // of transaction.
        if let Some((_, prev)) = state.pending.range(..=start).next_back()
            && prev.start + prev.count > start
        {
            state.corrupt = true;
            return Err(corrupt(format!(
                "deferred free [{start}, +{count}) overlaps pending [{}, +{})",
                prev.start, prev.count
            )));
        }
        if let Some((_, next)) = state.pending.range(start..).next()
            && start + count > next.start
        {
            state.corrupt = true;
            return Err(corrupt(format!(
                "deferred free [{start}, +{count}) overlaps pending [{}, +{})",
                next.start, next.count
            )));
        }

        let mut entry = DeferredFree { start, count, txn };
        // Merge left, then right, when contiguous within one transaction.
        if let Some((&key, prev)) = state.pending.range(..start).next_back()
            && prev.txn == txn
            && prev.start + prev.count == entry.start
        {
            entry.start = prev.start;
            entry.count += prev.count;
            state.pending.remove(&key);
        }
        if let Some((&key, next)) = state.pending.range(entry.start..).next()
            && next.txn == txn
            && entry.start + entry.count == next.start
        {
            entry.count += next.count;
            state.pending.remove(&key);
        }
        state.pending.insert(entry.start, entry);
        self.reclaim.note(txn, group);
        trace!(
            target: "tess::alloc::reclaim",
            group = group.0,
            start,
            count,
            txn = txn.0,
            "free deferred"
        );
        Ok(())
    }

    /// Move one range from used to free: buddy first, then the persistent
    /// bitmap and the declared free count. Group lock held by the caller.
    pub(crate) fn free_in_group_locked(
        &self,
        cx: &Cx,
        group: GroupNumber,
        state: &mut GroupState,
        start: u32,
        count: u32,
    ) -> Result<()> {
        let Some(buddy) = state.buddy.as_mut() else {
            return Err(AllocError::InvalidRequest("group not loaded".into()));
        };
        if let Err(err) = buddy.mark_free(start, count) {
            state.corrupt = true;
            self.catalog.mark_corrupt(group);
            return Err(AllocError::Corrupt {
                group: group.0,
                detail: format!("free of [{start}, +{count}): {err:?}"),
            });
        }

        let mut raw = self.store.read_group_bitmap(cx, group)?;
        let were_set = bitmap::test_and_clear_range(&mut raw, start, count);
        if were_set != count {
            state.corrupt = true;
            self.catalog.mark_corrupt(group);
            return Err(AllocError::Corrupt {
                group: group.0,
                detail: format!(
                    "persistent bitmap disagrees on free: {were_set} of {count} bits were set"
                ),
            });
        }
        self.store.write_group_bitmap(cx, group, &raw)?;
        self.store
            .set_declared_free(group, self.store.declared_free(group) + count);

        state.was_trimmed = false;
        if let Some(buddy) = state.buddy.as_ref() {
            self.catalog.update(group, buddy);
        }
        Ok(())
    }

    /// Commit notification: every free deferred under `txn` becomes
    /// visible, and the merged extents are queued for background discard.
    pub(crate) fn process_commit(&self, cx: &Cx, txn: TxnId) -> Result<()> {
        let groups = self.reclaim.take(txn);
        if groups.is_empty() {
            return Ok(());
        }
        let mut batch: DiscardBatch = Vec::new();
        let mut freed_total = 0_u64;

        for g in groups {
            cx.checkpoint()?;
            let group = GroupNumber(g);
            let cell = &self.groups[g as usize];
            let mut state = cell.state.lock();
            if state.buddy.is_none()
                && let Err(err) = self.load_group_locked(cx, group, &mut state)
            {
                warn!(
                    target: "tess::alloc::reclaim",
                    group = g,
                    ?err,
                    "cannot load group for committed frees"
                );
                continue;
            }

            let ready: Vec<DeferredFree> = {
                let keys: Vec<u32> = state
                    .pending
                    .iter()
                    .filter(|(_, e)| e.txn == txn)
                    .map(|(&k, _)| k)
                    .collect();
                keys.iter()
                    .filter_map(|k| state.pending.remove(k))
                    .collect()
            };

            for entry in ready {
                match self.free_in_group_locked(cx, group, &mut state, entry.start, entry.count) {
                    Ok(()) => {
                        freed_total += u64::from(entry.count);
                        batch.push((
                            self.geometry.group_to_cluster(group, entry.start),
                            entry.count,
                        ));
                    }
                    Err(err) => warn!(
                        target: "tess::alloc::reclaim",
                        group = g,
                        start = entry.start,
                        count = entry.count,
                        ?err,
                        "committed free failed; group withdrawn"
                    ),
                }
            }
        }

        self.bump_discard_generation();
        self.sweep_graveyard(cx);
        info!(
            target: "tess::alloc::reclaim",
            txn = txn.0,
            clusters = freed_total,
            "transaction frees applied"
        );

        if self.config.discard_on_free
            && !batch.is_empty()
            && let Some(tx) = self.discard_tx.lock().as_ref()
            && tx.send(batch).is_err()
        {
            warn!(target: "tess::alloc::reclaim", "discard worker gone; extents not discarded");
        }
        Ok(())
    }

    /// Synchronous trim of a byte range. Returns trimmed bytes.
    pub(crate) fn trim_fs(
        &self,
        cx: &Cx,
        start_byte: u64,
        len_bytes: u64,
        min_extent_bytes: u64,
    ) -> Result<u64> {
        let csbits = self.geometry.cluster_size.ilog2();
        if len_bytes < u64::from(self.geometry.cluster_size) {
            return Err(AllocError::InvalidRequest(
                "trim range shorter than one cluster".into(),
            ));
        }
        #[expect(clippy::cast_possible_truncation)]
        let min_len = ((min_extent_bytes >> csbits).max(1))
            .min(u64::from(self.geometry.clusters_per_group)) as u32;

        let first = ClusterNumber((start_byte >> csbits).max(u64::from(self.geometry.first_cluster)));
        let last_cluster = ((start_byte + len_bytes) >> csbits)
            .saturating_sub(1)
            .min(self.geometry.total_clusters - 1);
        if first.0 > last_cluster {
            return Ok(0);
        }
        let (first_group, mut from) = self.geometry.cluster_to_group(first);
        let (last_group, last_off) = self.geometry.cluster_to_group(ClusterNumber(last_cluster));

        let mut trimmed = 0_u64;
        for g in first_group.0..=last_group.0 {
            cx.checkpoint()?;
            let group = GroupNumber(g);
            let to = if g == last_group.0 {
                last_off
            } else {
                self.geometry.clusters_in_group(group) - 1
            };
            let whole_group = from == 0 && to + 1 == self.geometry.clusters_in_group(group);
            trimmed += u64::from(self.trim_group(cx, group, from, to, min_len, whole_group)?);
            from = 0;
        }
        self.last_trim_min.store(min_len, Ordering::Relaxed);
        Ok(trimmed << csbits)
    }

    /// Trim free runs of one group inside `[from, to]`, periodically
    /// releasing the group lock at checkpoint boundaries.
    fn trim_group(
        &self,
        cx: &Cx,
        group: GroupNumber,
        from: u32,
        to: u32,
        min_len: u32,
        whole_group: bool,
    ) -> Result<u32> {
        // Clusters processed per lock hold; long walks yield in between.
        const TRIM_CHUNK: u32 = 4096;

        let cell = &self.groups[group.0 as usize];
        let mut cursor = from;
        let mut trimmed = 0_u32;

        loop {
            let mut state = cell.state.lock();
            if state.buddy.is_none()
                && let Err(err) = self.load_group_locked(cx, group, &mut state)
            {
                warn!(target: "tess::alloc::reclaim", group = group.0, ?err, "trim skips group");
                return Ok(trimmed);
            }
            if state.corrupt {
                return Ok(trimmed);
            }
            if state.was_trimmed && min_len >= self.last_trim_min.load(Ordering::Relaxed) {
                return Ok(trimmed);
            }

            let mut processed = 0_u32;
            while cursor <= to && processed < TRIM_CHUNK {
                let run = {
                    let Some(buddy) = state.buddy.as_ref() else {
                        return Ok(trimmed);
                    };
                    let bm = buddy.raw_bitmap();
                    match bitmap::next_zero(bm, to + 1, cursor) {
                        None => None,
                        Some(start) => {
                            let end = bitmap::next_set(bm, to + 1, start).unwrap_or(to + 1);
                            Some((start, end - start))
                        }
                    }
                };
                let Some((start, len)) = run else {
                    cursor = to + 1;
                    break;
                };
                processed += len;
                cursor = start + len;

                if len < min_len {
                    continue;
                }
                // Reserve the run while the device works on it, then give
                // it back.
                let Some(buddy) = state.buddy.as_mut() else {
                    return Ok(trimmed);
                };
                if buddy.mark_used(start, len).is_err() {
                    state.corrupt = true;
                    self.catalog.mark_corrupt(group);
                    return Ok(trimmed);
                }
                let abs = self.geometry.group_to_cluster(group, start);
                let result = self.device.issue_discard(abs, len);
                let Some(buddy) = state.buddy.as_mut() else {
                    return Ok(trimmed);
                };
                if buddy.mark_free(start, len).is_err() {
                    state.corrupt = true;
                    self.catalog.mark_corrupt(group);
                    return Ok(trimmed);
                }
                if let Err(err) = result {
                    // Explicit trim is a maintenance command; surface the
                    // device failure to its caller.
                    return Err(AllocError::Device(format!(
                        "discard of {len} clusters at {abs} failed: {err}"
                    )));
                }
                AllocStats::bump(&self.stats.discards_issued);
                trimmed += len;
            }

            if cursor > to {
                if whole_group {
                    state.was_trimmed = true;
                }
                debug!(
                    target: "tess::alloc::reclaim",
                    group = group.0,
                    trimmed,
                    "group trim complete"
                );
                return Ok(trimmed);
            }
            drop(state);
            cx.checkpoint()?;
        }
    }
}
