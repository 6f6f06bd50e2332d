//! Release path: priority lane first, then the batch pages.
//!
//! The page state machine is driven by `(more_ready, active_page)`:
//!
//! 1. If the in-flight predicted latency is below `refill_below_ratio`% of
//!    the window and the inactive page is not already filled, fill it ahead
//!    of time.
//! 2. Pop from the active page in category order.
//! 3. If the active page is empty and the other page is ready, flip and retry.
//! 4. Otherwise, if no fill was attempted in this call, fill once, flip if
//!    anything was admitted, and retry. Then give up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::{BatchPlanner, FillLimits, FillReport};
use crate::category::{OpCategory, PerCategory};
use crate::deadline::DeadlineIndex;
use crate::latency_model::LatencyModel;
use crate::operation::{MetadataTable, OperationId};

/// Head-of-line lane that bypasses deadline scheduling.
#[derive(Debug, Default)]
pub struct PriorityLane {
    queue: VecDeque<OperationId>,
}

impl PriorityLane {
    /// Inserts at the head; the most recent head insertion is released first.
    pub fn push_head(&mut self, id: OperationId) {
        self.queue.push_front(id);
    }

    /// Takes the operation at the head.
    pub fn pop(&mut self) -> Option<OperationId> {
        self.queue.pop_front()
    }

    /// Removes `id` if present.
    pub fn remove(&mut self, id: OperationId) -> bool {
        match self.queue.iter().position(|queued| *queued == id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of waiting operations.
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if the lane is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Where a dispatched operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchSource {
    /// The head-of-line priority lane.
    PriorityLane,
    /// A batch page.
    BatchPage(usize),
}

/// Everything a dispatch call needs besides the dispatcher itself.
pub struct DispatchContext<'a> {
    /// Deadline index drained by fills.
    pub index: &'a mut DeadlineIndex,
    /// Per-operation metadata.
    pub metas: &'a mut MetadataTable,
    /// Per-category latency models.
    pub models: &'a PerCategory<LatencyModel>,
    /// Fill limits in effect.
    pub limits: FillLimits,
    /// Percentage of the window below which pages are refilled early.
    pub refill_below_ratio: u32,
    /// Global in-flight predicted latency counter.
    pub total_predicted_latency: &'a AtomicU64,
}

/// Returns `ratio`% of `window_ns`.
#[inline]
pub fn refill_threshold(window_ns: u64, ratio: u32) -> u64 {
    (window_ns as u128 * ratio as u128 / 100) as u64
}

/// Owns the priority lane and the batch pages.
#[derive(Debug, Default)]
pub struct Dispatcher {
    lane: PriorityLane,
    planner: BatchPlanner,
    batch_size_actual_highest: PerCategory<u32>,
}

impl Dispatcher {
    /// Creates an idle dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next operation to release, if any.
    pub fn dispatch(&mut self, ctx: &mut DispatchContext<'_>) -> Option<(OperationId, DispatchSource)> {
        if let Some(id) = self.lane.pop() {
            debug!("Dispatching {} from priority lane", id);
            return Some((id, DispatchSource::PriorityLane));
        }

        self.dispatch_from_batches(ctx)
            .map(|(id, page)| (id, DispatchSource::BatchPage(page)))
    }

    fn dispatch_from_batches(&mut self, ctx: &mut DispatchContext<'_>) -> Option<(OperationId, usize)> {
        let mut fill_tried = false;
        let observed = ctx.total_predicted_latency.load(Ordering::Relaxed);

        if !self.planner.more_ready()
            && observed < refill_threshold(ctx.limits.global_latency_window_ns, ctx.refill_below_ratio)
        {
            self.fill(ctx, Some(observed));
            fill_tried = true;
        }

        loop {
            if let Some(id) = self.planner.pop_active() {
                return Some((id, self.planner.active_page()));
            }

            if self.planner.more_ready() {
                self.planner.flip();
                continue;
            }

            if fill_tried {
                return None;
            }

            if self.fill(ctx, None).filled() {
                self.planner.flip();
            }
            fill_tried = true;
        }
    }

    /// Fills the inactive page and records the per-category batch highs.
    pub fn fill(&mut self, ctx: &mut DispatchContext<'_>, observed_total: Option<u64>) -> FillReport {
        let report = self.planner.fill(
            ctx.index,
            ctx.metas,
            ctx.models,
            &ctx.limits,
            ctx.total_predicted_latency,
            observed_total,
        );
        if report.filled() {
            for category in OpCategory::ALL {
                let highest = &mut self.batch_size_actual_highest[category];
                *highest = (*highest).max(report.per_category[category]);
            }
        }
        report
    }

    /// Pushes `id` onto the priority lane.
    pub fn push_priority(&mut self, id: OperationId) {
        self.lane.push_head(id);
    }

    /// Removes `id` from the priority lane.
    pub fn remove_priority(&mut self, id: OperationId) -> bool {
        self.lane.remove(id)
    }

    /// Removes `id` from a batch page.
    pub fn remove_batched(&mut self, page: usize, category: OpCategory, id: OperationId) -> bool {
        self.planner.remove(page, category, id)
    }

    /// Borrows the batch planner.
    pub fn planner(&self) -> &BatchPlanner {
        &self.planner
    }

    /// Borrows the priority lane.
    pub fn lane(&self) -> &PriorityLane {
        &self.lane
    }

    /// Largest per-category batch admitted by a single fill.
    pub fn batch_size_actual_highest(&self) -> PerCategory<u32> {
        self.batch_size_actual_highest
    }

    /// Clears the per-category batch highs.
    pub fn reset_batch_stats(&mut self) {
        self.batch_size_actual_highest = PerCategory::default();
    }

    /// True if the lane or either page holds an operation.
    pub fn has_work(&self) -> bool {
        !self.lane.is_empty() || self.planner.has_work()
    }
}
