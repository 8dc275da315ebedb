//! Group selection: the five-tier criteria state machine.
//!
//! Tiers escalate strictly: `PowerTwoAligned` (buddy-order index lookup,
//! power-of-two goals only) → `GoalLengthFast` (average-fragment index) →
//! `BestAvailLength` (trim the goal and retry the fragment index, data
//! only) → `GoalLengthSlow` (exhaustive complex scan of all groups) →
//! `AnyFree` (first group with any free space). Candidates come from the
//! secondary indices in index order, or linearly from the goal group when
//! the indices are disabled or still warming up.

use crate::catalog::avg_order_for_len;
use crate::request::{
    AllocContext, AllocStatus, Criteria, FreeExtent, HINT_FIRST, HINT_GOAL_ONLY, HINT_MERGE,
    HINT_STREAM, HINT_TRY_GOAL,
};
use crate::stats::AllocStats;
use crate::Inner;
use tess_error::{AllocError, Result};
use tess_types::{Cx, GroupNumber};
use tracing::{debug, trace};

enum NextGroup {
    Group(u32),
    Escalate(Criteria),
}

impl Inner {
    /// The regular allocator: goal probe, then the criteria walk, then a
    /// last-chance commit of the best candidate seen.
    pub(crate) fn regular_allocator(&self, cx: &Cx, ctx: &mut AllocContext) -> Result<()> {
        self.find_by_goal(cx, ctx)?;
        if ctx.status == AllocStatus::Found || ctx.flags & HINT_GOAL_ONLY != 0 {
            return Ok(());
        }

        // The power-of-two tier applies only to sufficiently large
        // power-of-two goals.
        let orders = self.catalog.order_count();
        ctx.order2 = 0;
        let fls = 32 - ctx.goal.len.leading_zeros();
        if fls >= self.config.order2_req && fls <= orders && ctx.goal.len.is_power_of_two() {
            ctx.order2 = fls - 1;
        }

        // Stream allocations chase the allocator-wide last allocation.
        if ctx.flags & HINT_STREAM != 0 {
            let (group, start) = *self.last_stream.lock();
            if group < self.geometry.group_count {
                ctx.goal.group = GroupNumber(group);
                ctx.goal.start =
                    start.min(self.geometry.clusters_in_group(GroupNumber(group)).saturating_sub(1));
            }
        }

        let ngroups = self.geometry.group_count;
        let mut start_tier = if ctx.order2 > 0 {
            Criteria::PowerTwoAligned
        } else {
            Criteria::GoalLengthFast
        };

        'search: loop {
            let mut tier = Some(start_tier);
            'criteria: while let Some(t) = tier {
                if ctx.status != AllocStatus::Continue {
                    break;
                }
                ctx.criteria = t;
                let mut group = ctx.goal.group.0;
                ctx.linear_remaining = if self.config.optimize_scan {
                    self.config.linear_scan_limit
                } else {
                    0
                };

                let mut visited = 0;
                while visited < ngroups && ctx.status == AllocStatus::Continue {
                    cx.checkpoint()?;
                    AllocStats::bump(&self.stats.tier_groups_considered[t.index()]);
                    if self.prefilter(GroupNumber(group), t, ctx) {
                        self.scan_one_group(cx, ctx, GroupNumber(group));
                    }
                    if ctx.status != AllocStatus::Continue {
                        break;
                    }
                    visited += 1;
                    match self.choose_next_group(ctx, t, group, ngroups) {
                        NextGroup::Group(g) => group = g,
                        NextGroup::Escalate(new_tier) => {
                            trace!(
                                target: "tess::alloc::selector",
                                from = ?t,
                                to = ?new_tier,
                                "criteria escalation"
                            );
                            tier = Some(new_tier);
                            continue 'criteria;
                        }
                    }
                }
                if visited == ngroups && t == Criteria::BestAvailLength {
                    // Undo best-avail trimming before the full scan.
                    ctx.goal.len = ctx.orig_goal_len;
                }
                tier = t.next();
            }

            if ctx.best.len > 0
                && ctx.status != AllocStatus::Found
                && ctx.flags & HINT_FIRST == 0
            {
                // Scan budget expired with a usable candidate in hand.
                self.try_best_found(cx, ctx)?;
                if ctx.status != AllocStatus::Found {
                    // Somebody else took it; fall back to first-fit.
                    AllocStats::bump(&self.stats.lost_chunks);
                    debug!(
                        target: "tess::alloc::selector",
                        group = ctx.best.group.0,
                        start = ctx.best.start,
                        len = ctx.best.len,
                        "best candidate lost to a concurrent allocation"
                    );
                    ctx.best = FreeExtent::EMPTY;
                    ctx.status = AllocStatus::Continue;
                    ctx.flags |= HINT_FIRST;
                    start_tier = Criteria::AnyFree;
                    continue 'search;
                }
            }
            break;
        }

        if ctx.status == AllocStatus::Found {
            AllocStats::bump(&self.stats.tier_hits[ctx.criteria.index()]);
        }
        Ok(())
    }

    /// Probe the exact goal position before any group walk.
    fn find_by_goal(&self, cx: &Cx, ctx: &mut AllocContext) -> Result<()> {
        if ctx.flags & (HINT_TRY_GOAL | HINT_GOAL_ONLY) == 0 {
            return Ok(());
        }
        let group = ctx.goal.group;
        if group.0 >= self.geometry.group_count || self.catalog.card(group).free() == 0 {
            return Ok(());
        }

        let cell = &self.groups[group.0 as usize];
        let mut state = cell.state.lock();
        if self.ensure_loaded(cx, group, &mut state, ctx).is_err() || state.corrupt {
            return Ok(());
        }
        let Some(run) = state
            .buddy
            .as_ref()
            .and_then(|b| b.find_extent(ctx.goal.start, ctx.goal.len))
        else {
            return Ok(());
        };

        let stripe_goal = self
            .config
            .stripe
            .is_some_and(|s| s > 0 && ctx.goal.len == s);
        let take = if run.len >= ctx.goal.len {
            if stripe_goal {
                // Only accept a stripe-aligned position for stripe goals.
                let abs = self.geometry.group_to_cluster(group, run.start).0;
                abs % u64::from(ctx.goal.len) == 0
            } else {
                true
            }
        } else {
            // The caller may want even a short extent at the goal to merge
            // with an adjacent one.
            run.len > 0 && ctx.flags & HINT_MERGE != 0
        };

        if take {
            ctx.found += 1;
            ctx.best = FreeExtent {
                group,
                start: run.start,
                len: run.len,
                logical: ctx.goal.logical,
            };
            self.use_best_found(ctx, &mut state, group);
            if ctx.status == AllocStatus::Found {
                AllocStats::bump(&self.stats.found_by_goal);
            }
        }
        Ok(())
    }

    /// Re-validate and commit a best candidate found earlier; the extent
    /// may have been taken (or grown) since the group lock was dropped.
    fn try_best_found(&self, cx: &Cx, ctx: &mut AllocContext) -> Result<()> {
        debug_assert!(ctx.best.len > 0);
        let group = ctx.best.group;
        let cell = &self.groups[group.0 as usize];
        let mut state = cell.state.lock();
        if self.ensure_loaded(cx, group, &mut state, ctx).is_err() || state.corrupt {
            return Ok(());
        }
        let Some(run) = state
            .buddy
            .as_ref()
            .and_then(|b| b.find_extent(ctx.best.start, ctx.best.len))
        else {
            return Ok(());
        };
        if run.len > 0 {
            ctx.best = FreeExtent {
                group,
                start: run.start,
                len: run.len,
                logical: ctx.goal.logical,
            };
            self.use_best_found(ctx, &mut state, group);
        }
        Ok(())
    }

    /// Lock-free candidate prefilter. Cold groups pass only for the
    /// expensive tiers, which are willing to pay the load.
    fn prefilter(&self, group: GroupNumber, tier: Criteria, ctx: &AllocContext) -> bool {
        let card = self.catalog.card(group);
        if card.is_corrupt() {
            return false;
        }
        let free = card.free();
        if free == 0 {
            return false;
        }
        if tier < Criteria::AnyFree && free < ctx.goal.len {
            return false;
        }
        if !card.is_loaded() {
            return tier.is_expensive();
        }
        card.good_group(tier, ctx, self.catalog.order_count())
    }

    /// Lock, load if needed, re-check, and scan one group.
    fn scan_one_group(&self, cx: &Cx, ctx: &mut AllocContext, group: GroupNumber) {
        let cell = &self.groups[group.0 as usize];
        let mut state = cell.state.lock();
        if self.ensure_loaded(cx, group, &mut state, ctx).is_err() || state.corrupt {
            return;
        }
        // The prefilter ran without the lock; check again now that the
        // card cannot move under us.
        if !self
            .catalog
            .card(group)
            .good_group(ctx.criteria, ctx, self.catalog.order_count())
        {
            return;
        }
        ctx.groups_scanned += 1;
        self.scan_group_extents(ctx, &mut state, group);
    }

    /// Load a group's buddy under its lock, recording the first contained
    /// error on the context.
    fn ensure_loaded(
        &self,
        cx: &Cx,
        group: GroupNumber,
        state: &mut crate::group::GroupState,
        ctx: &mut AllocContext,
    ) -> Result<()> {
        if state.buddy.is_some() {
            return Ok(());
        }
        match self.load_group_locked(cx, group, state) {
            Ok(()) => Ok(()),
            Err(err) => {
                if ctx.first_err.is_none() {
                    ctx.first_err = Some(clone_contained(&err));
                }
                Err(err)
            }
        }
    }

    /// Pick the next candidate group, either linearly or from the tier's
    /// secondary index; an empty index escalates the criteria.
    fn choose_next_group(
        &self,
        ctx: &mut AllocContext,
        tier: Criteria,
        current: u32,
        ngroups: u32,
    ) -> NextGroup {
        let linear = |group: u32| NextGroup::Group(if group + 1 >= ngroups { 0 } else { group + 1 });

        if !self.config.optimize_scan || tier.is_expensive() {
            return linear(current);
        }
        if ctx.linear_remaining > 0 {
            ctx.linear_remaining -= 1;
            return linear(current);
        }

        let orders = self.catalog.order_count();
        match tier {
            Criteria::PowerTwoAligned => self
                .catalog
                .pick_largest(ctx.order2, |g| {
                    self.catalog
                        .card(GroupNumber(g))
                        .good_group(tier, ctx, orders)
                })
                .map_or(NextGroup::Escalate(Criteria::GoalLengthFast), NextGroup::Group),
            Criteria::GoalLengthFast => {
                for bucket in avg_order_for_len(ctx.goal.len, orders)..orders {
                    if let Some(g) = self.catalog.pick_avg(bucket, |g| {
                        self.catalog
                            .card(GroupNumber(g))
                            .good_group(tier, ctx, orders)
                    }) {
                        return NextGroup::Group(g);
                    }
                }
                NextGroup::Escalate(if ctx.is_data() {
                    Criteria::BestAvailLength
                } else {
                    Criteria::GoalLengthSlow
                })
            }
            Criteria::BestAvailLength => self.choose_next_best_avail(ctx, orders),
            Criteria::GoalLengthSlow | Criteria::AnyFree => linear(current),
        }
    }

    /// Trim the goal length order by order, looking for a fragment bucket
    /// that can host the reduced request.
    fn choose_next_best_avail(&self, ctx: &mut AllocContext, orders: u32) -> NextGroup {
        let order = ctx.goal.len.max(1).ilog2();
        let mut min_order = order.saturating_sub(self.config.best_avail_trim_order);
        if let Some(stripe) = self.config.stripe
            && stripe > 0
            && (1_u32 << min_order) < stripe
        {
            min_order = stripe.ilog2();
        }
        if (1_u32 << min_order) < ctx.orig.len {
            // Never trim below the original request.
            min_order = 32 - ctx.orig.len.leading_zeros();
        }

        let mut i = order;
        while i >= min_order {
            let mut trimmed = 1_u32 << i;
            if let Some(stripe) = self.config.stripe
                && stripe > 0
            {
                trimmed = trimmed.div_ceil(stripe) * stripe;
            }
            ctx.goal.len = trimmed;
            let bucket = avg_order_for_len(trimmed, orders);
            if let Some(g) = self.catalog.pick_avg(bucket, |g| {
                self.catalog
                    .card(GroupNumber(g))
                    .good_group(Criteria::BestAvailLength, ctx, orders)
            }) {
                return NextGroup::Group(g);
            }
            if i == 0 {
                break;
            }
            i -= 1;
        }

        ctx.goal.len = ctx.orig_goal_len;
        NextGroup::Escalate(Criteria::GoalLengthSlow)
    }
}

/// Duplicate a contained (per-group) error for `first_err` capture.
fn clone_contained(err: &AllocError) -> AllocError {
    match err {
        AllocError::Corrupt { group, detail } => AllocError::Corrupt {
            group: *group,
            detail: detail.clone(),
        },
        other => AllocError::Device(other.to_string()),
    }
}
