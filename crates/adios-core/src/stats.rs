//! Scheduler statistics and the parameter/statistics snapshot.

use serde::{Deserialize, Serialize};

use crate::category::PerCategory;
use crate::latency_model::LatencyModelParams;

/// Counters kept under the scheduler lock. Wrapping is fine; only
/// differences between counters are meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedStats {
    /// Operations admitted.
    pub inserted: u64,
    /// Operations absorbed by a merge.
    pub merged: u64,
    /// Operations removed by the host before dispatch.
    pub removed: u64,
    /// Operations released to the device.
    pub dispatched: u64,
    /// Operations whose completion was acknowledged.
    pub completed: u64,
    /// Operations admitted without scheduling metadata.
    pub untracked: u64,
}

impl SchedStats {
    /// Number of admitted operations that have not yet finished.
    pub fn queued(&self) -> u64 {
        self.inserted
            .wrapping_sub(self.completed)
            .wrapping_sub(self.merged)
            .wrapping_sub(self.removed)
    }
}

/// Every logical parameter and statistic the scheduler exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    /// Scheduler version string.
    pub version: String,
    /// Target latency per category, in ns.
    pub latency_target_ns: PerCategory<u64>,
    /// Batch-size limit per category.
    pub batch_size_limit: PerCategory<u32>,
    /// Fitted model parameters per category.
    pub latency_models: PerCategory<LatencyModelParams>,
    /// Global latency window, in ns.
    pub global_latency_window_ns: u64,
    /// Early-refill threshold percentage.
    pub bq_refill_below_ratio: u32,
    /// Largest per-category batch admitted by a single fill.
    pub batch_size_actual_highest: PerCategory<u32>,
    /// Current in-flight predicted latency, in ns.
    pub total_predicted_latency_ns: u64,
    /// Operations waiting in the deadline index.
    pub deadline_queue_len: usize,
    /// Operations waiting in batch pages.
    pub batch_queue_len: usize,
    /// Operations waiting in the priority lane.
    pub priority_queue_len: usize,
    /// Counters.
    pub stats: SchedStats,
}
