//! Within-group extent search.
//!
//! Three scan strategies, picked by the selector tier:
//!
//! - power-of-two buddy scan: O(orders) walk of the buddy layers;
//! - complex scan: raw bitmap walk measuring every free run (skipping runs
//!   shorter than the goal while the tier still trusts the indices);
//! - stripe-aligned scan: only stripe-aligned offsets are probed.
//!
//! The best-so-far policy is the classic one: an exact goal-length hit is
//! taken immediately; while the request is unsatisfied any longer run
//! wins; once satisfied a tighter (smaller but sufficient) run wins; and
//! the scan-budget counters cut the search short either way.

use crate::buddy::FreeRun;
use crate::group::GroupState;
use crate::request::{AllocContext, AllocStatus, Criteria, FreeExtent, HINT_FIRST, HINT_STREAM};
use crate::stats::AllocStats;
use crate::{Inner, bitmap};
use tess_types::GroupNumber;
use tracing::{debug, warn};

impl Inner {
    /// Commit the context's best extent: clamp to the goal length, mark it
    /// used in the buddy, and flip the status machine to `Found`.
    pub(crate) fn use_best_found(
        &self,
        ctx: &mut AllocContext,
        state: &mut GroupState,
        group: GroupNumber,
    ) {
        debug_assert!(ctx.status != AllocStatus::Found);
        let Some(buddy) = state.buddy.as_mut() else {
            return;
        };
        ctx.best.len = ctx.best.len.min(ctx.goal.len);
        ctx.best.logical = ctx.goal.logical;
        ctx.best.group = group;

        if let Err(err) = buddy.mark_used(ctx.best.start, ctx.best.len) {
            // The extent was computed from this same buddy under the group
            // lock, so a refusal means the structure is inconsistent.
            warn!(
                target: "tess::alloc::search",
                group = group.0,
                ?err,
                "marking best extent failed"
            );
            state.corrupt = true;
            self.catalog.mark_corrupt(group);
            ctx.best = FreeExtent::EMPTY;
            return;
        }
        self.catalog.update(group, buddy);
        self.bump_discard_generation();
        ctx.status = AllocStatus::Found;

        if ctx.flags & HINT_STREAM != 0 {
            *self.last_stream.lock() = (group.0, ctx.best.start + ctx.best.len);
        }
        debug!(
            target: "tess::alloc::search",
            group = group.0,
            start = ctx.best.start,
            len = ctx.best.len,
            criteria = ?ctx.criteria,
            "best extent committed"
        );
    }

    /// Compare a found run against the goal and the best so far.
    fn measure_extent(
        &self,
        ctx: &mut AllocContext,
        run: FreeRun,
        state: &mut GroupState,
        group: GroupNumber,
    ) {
        debug_assert!(run.len > 0);
        ctx.found += 1;
        AllocStats::bump(&self.stats.extents_scanned);
        let ex = FreeExtent {
            group,
            start: run.start,
            len: run.len,
            logical: ctx.goal.logical,
        };

        // Take what you catch first.
        if ctx.flags & HINT_FIRST != 0 {
            ctx.best = ex;
            self.use_best_found(ctx, state, group);
            return;
        }

        if ex.len == ctx.goal.len {
            ctx.best = ex;
            self.use_best_found(ctx, state, group);
            return;
        }

        if ctx.best.len == 0 {
            ctx.best = ex;
        } else if ctx.best.len < ctx.goal.len {
            // Unsatisfied: a longer run is always better.
            if ex.len > ctx.best.len {
                ctx.best = ex;
            }
        } else if ex.len > ctx.goal.len && ex.len < ctx.best.len {
            // Satisfied: prefer the tighter sufficient run.
            ctx.best = ex;
        }

        self.check_limits(ctx, state, group, false);
    }

    /// Enforce the scan budget and accept the best candidate when the
    /// search has gone on long enough.
    pub(crate) fn check_limits(
        &self,
        ctx: &mut AllocContext,
        state: &mut GroupState,
        group: GroupNumber,
        finish_group: bool,
    ) {
        if ctx.status == AllocStatus::Found {
            return;
        }
        if ctx.found > self.config.max_to_scan && ctx.flags & HINT_FIRST == 0 {
            ctx.status = AllocStatus::Break;
            AllocStats::bump(&self.stats.budget_breaks);
            return;
        }
        if ctx.best.len < ctx.goal.len {
            return;
        }
        if finish_group || ctx.found > self.config.min_to_scan {
            self.use_best_found(ctx, state, group);
        }
    }

    /// Dispatch the per-group scan for the current tier.
    pub(crate) fn scan_group_extents(
        &self,
        ctx: &mut AllocContext,
        state: &mut GroupState,
        group: GroupNumber,
    ) {
        let stripe_fits = self
            .config
            .stripe
            .is_some_and(|s| s > 0 && ctx.goal.len % s == 0);
        match ctx.criteria {
            Criteria::PowerTwoAligned => self.simple_scan_group(ctx, state, group),
            Criteria::GoalLengthFast | Criteria::BestAvailLength if stripe_fits => {
                self.aligned_scan_group(ctx, state, group);
            }
            _ => self.complex_scan_group(ctx, state, group),
        }
    }

    /// Buddy-layer scan for power-of-two requests: first free chunk at the
    /// request's order or above.
    fn simple_scan_group(&self, ctx: &mut AllocContext, state: &mut GroupState, group: GroupNumber) {
        debug_assert!(ctx.order2 > 0);
        let Some(buddy) = state.buddy.as_ref() else {
            return;
        };
        let Some((start, _order)) = buddy.first_free_chunk(ctx.order2) else {
            return;
        };
        ctx.found += 1;
        AllocStats::bump(&self.stats.extents_scanned);
        ctx.best = FreeExtent {
            group,
            start,
            len: ctx.goal.len,
            logical: ctx.goal.logical,
        };
        self.use_best_found(ctx, state, group);
    }

    /// Raw bitmap walk measuring free runs against the goal.
    fn complex_scan_group(
        &self,
        ctx: &mut AllocContext,
        state: &mut GroupState,
        group: GroupNumber,
    ) {
        enum Step {
            Corrupt(&'static str),
            Skip { next: u32, run: u32 },
            Candidate(FreeRun),
            Done,
        }

        let (mut free, clusters, mut cursor) = match state.buddy.as_ref() {
            Some(b) => (b.free(), b.clusters(), b.first_free_hint()),
            None => return,
        };

        while free > 0 && ctx.status == AllocStatus::Continue {
            let step = {
                let Some(buddy) = state.buddy.as_ref() else {
                    return;
                };
                match bitmap::next_zero(buddy.raw_bitmap(), clusters, cursor) {
                    None => Step::Corrupt("free count says clusters remain, bitmap says none"),
                    Some(i) => {
                        let mut step = Step::Done;
                        if !ctx.criteria.is_expensive() {
                            // The fast tiers trust the group to hold a big
                            // enough run; skip over the short ones.
                            let j = bitmap::next_set(buddy.raw_bitmap(), clusters, i)
                                .unwrap_or(clusters);
                            if j - i < ctx.goal.len {
                                step = Step::Skip { next: j, run: j - i };
                            }
                        }
                        if matches!(step, Step::Done) {
                            step = match buddy.find_extent(i, ctx.goal.len) {
                                Some(run) if run.len <= free => Step::Candidate(run),
                                Some(_) => Step::Corrupt("run exceeds tracked free count"),
                                None => Step::Corrupt("cursor landed on a used cluster"),
                            };
                        }
                        step
                    }
                }
            };

            match step {
                Step::Corrupt(detail) => {
                    warn!(
                        target: "tess::alloc::search",
                        group = group.0,
                        detail,
                        "bitmap/accounting mismatch during scan"
                    );
                    state.corrupt = true;
                    self.catalog.mark_corrupt(group);
                    // A best candidate from an earlier, healthy group
                    // survives; one from this group fails revalidation.
                    return;
                }
                Step::Skip { next, run } => {
                    free = free.saturating_sub(run);
                    cursor = next;
                }
                Step::Candidate(run) => {
                    free = free.saturating_sub(run.len);
                    cursor = run.start + run.len;
                    self.measure_extent(ctx, run, state, group);
                }
                Step::Done => break,
            }
        }

        self.check_limits(ctx, state, group, true);
    }

    /// Probe only stripe-aligned offsets; used on RAID-style layouts for
    /// stripe-multiple goals.
    fn aligned_scan_group(
        &self,
        ctx: &mut AllocContext,
        state: &mut GroupState,
        group: GroupNumber,
    ) {
        let Some(stripe) = self.config.stripe.filter(|&s| s > 0) else {
            return;
        };
        let clusters = match state.buddy.as_ref() {
            Some(b) => b.clusters(),
            None => return,
        };

        // First stripe-aligned cluster of this group, in absolute terms.
        let group_first = self.geometry.group_to_cluster(group, 0).0;
        let aligned = group_first.div_ceil(u64::from(stripe)) * u64::from(stripe);
        #[expect(clippy::cast_possible_truncation)]
        let mut i = (aligned - group_first) as u32;

        while i < clusters && ctx.status == AllocStatus::Continue {
            let candidate = {
                let Some(buddy) = state.buddy.as_ref() else {
                    return;
                };
                if buddy.is_free(i) {
                    buddy.find_extent(i, stripe).filter(|run| run.len >= stripe)
                } else {
                    None
                }
            };
            if let Some(run) = candidate {
                ctx.found += 1;
                AllocStats::bump(&self.stats.extents_scanned);
                ctx.best = FreeExtent {
                    group,
                    start: run.start,
                    len: run.len,
                    logical: ctx.goal.logical,
                };
                self.use_best_found(ctx, state, group);
                return;
            }
            i += stripe;
        }
    }
}
