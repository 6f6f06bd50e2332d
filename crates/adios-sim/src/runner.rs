//! Virtual-time driver connecting workload, scheduler and device.
//!
//! The loop jumps between three kinds of events: the next arrival, the next
//! device completion, and the scheduler's model-refresh deadline. After each
//! jump it retires finished operations, admits new ones, runs a due refresh,
//! and dispatches until the device queue is full or the scheduler is empty.

use std::collections::{BTreeMap, HashMap};
use std::iter::Peekable;

use adios_core::{
    Attribute, OpCategory, OperationId, PerCategory, SchedError, Scheduler, SchedulerSnapshot,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SimConfig;
use crate::device::SimDevice;
use crate::workload::{GeneratedOp, WorkloadGenerator};

#[derive(Debug, Clone, Copy)]
struct HostOp {
    category: OpCategory,
    size: u64,
    arrival_ns: u64,
    dispatched: bool,
}

/// Latency summary of one category, measured from arrival to completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryReport {
    /// Completed operations.
    pub completed: u64,
    /// Mean latency, in ns.
    pub mean_latency_ns: u64,
    /// Median latency, in ns.
    pub p50_latency_ns: u64,
    /// 99th-percentile latency, in ns.
    pub p99_latency_ns: u64,
    /// Worst latency, in ns.
    pub max_latency_ns: u64,
}

impl CategoryReport {
    fn from_samples(samples: &mut [u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        let n = samples.len();
        let percentile = |p: usize| samples[(n * p).div_ceil(100).clamp(1, n) - 1];
        let total: u128 = samples.iter().map(|&s| s as u128).sum();
        Self {
            completed: n as u64,
            mean_latency_ns: (total / n as u128) as u64,
            p50_latency_ns: percentile(50),
            p99_latency_ns: percentile(99),
            max_latency_ns: samples[n - 1],
        }
    }
}

/// Result of a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimReport {
    /// Operations generated.
    pub operations: u64,
    /// Operations absorbed by host merges.
    pub merged: u64,
    /// Model refreshes performed.
    pub refreshes: u64,
    /// Virtual time at the last event, in ns.
    pub elapsed_ns: u64,
    /// Latency per category.
    pub categories: PerCategory<CategoryReport>,
    /// Final scheduler state.
    pub scheduler: SchedulerSnapshot,
    /// Rendered value of every readable attribute.
    pub attributes: BTreeMap<String, String>,
}

/// A single simulation run.
pub struct Simulation {
    scheduler: Scheduler,
    device: SimDevice,
    workload: Peekable<WorkloadGenerator>,
    pending: HashMap<OperationId, HostOp>,
    merge_candidate: PerCategory<Option<OperationId>>,
    latencies: PerCategory<Vec<u64>>,
    operations: u64,
    merged: u64,
    refreshes: u64,
    now_ns: u64,
}

impl Simulation {
    /// Builds the scheduler, device and workload described by `config`.
    pub fn new(config: SimConfig) -> anyhow::Result<Self> {
        let scheduler = Scheduler::new(config.scheduler)?;
        Ok(Self {
            scheduler,
            device: SimDevice::new(config.device),
            workload: WorkloadGenerator::new(config.workload).peekable(),
            pending: HashMap::new(),
            merge_candidate: PerCategory::default(),
            latencies: PerCategory::default(),
            operations: 0,
            merged: 0,
            refreshes: 0,
            now_ns: 0,
        })
    }

    /// The scheduler under test.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Runs until the workload is exhausted and every operation completed.
    pub fn run(mut self) -> anyhow::Result<SimReport> {
        info!("Simulation starting");

        while let Some(next) = self.next_event_ns() {
            self.now_ns = self.now_ns.max(next);
            self.retire_completions();
            self.admit_arrivals()?;

            if self.scheduler.refresh_due(self.now_ns) {
                let updates = self.scheduler.refresh(self.now_ns);
                self.refreshes += 1;
                debug!("Refresh at {}ns: {:?}", self.now_ns, updates);
            }

            self.fill_device();
        }

        if self.scheduler.has_work() || !self.pending.is_empty() {
            anyhow::bail!(
                "simulation stalled with {} operations pending",
                self.pending.len()
            );
        }
        self.scheduler.shutdown();

        let mut attributes = BTreeMap::new();
        for attr in Attribute::ALL.into_iter().filter(Attribute::is_readable) {
            attributes.insert(attr.name().to_string(), self.scheduler.show_attr(attr.name())?);
        }

        let Simulation {
            scheduler,
            mut latencies,
            operations,
            merged,
            refreshes,
            now_ns,
            ..
        } = self;
        let categories = PerCategory::from_fn(|c| CategoryReport::from_samples(&mut latencies[c]));

        info!(
            "Simulation finished: {} operations, {} merged, {} refreshes, {}ns",
            operations, merged, refreshes, now_ns
        );
        Ok(SimReport {
            operations,
            merged,
            refreshes,
            elapsed_ns: now_ns,
            categories,
            scheduler: scheduler.snapshot(),
            attributes,
        })
    }

    fn next_event_ns(&mut self) -> Option<u64> {
        let arrival = self.workload.peek().map(|op| op.request.arrival_ns);
        [
            arrival,
            self.device.next_completion_ns(),
            self.scheduler.refresh_timer().deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn retire_completions(&mut self) {
        while let Some(done) = self.device.pop_completed(self.now_ns) {
            self.scheduler
                .complete(done.id, Some(done.start_ns), done.finish_ns);

            let Some(op) = self.pending.remove(&done.id) else {
                warn!("Device completed unknown operation {}", done.id);
                continue;
            };
            self.latencies[op.category].push(done.finish_ns.saturating_sub(op.arrival_ns));
        }
    }

    fn admit_arrivals(&mut self) -> anyhow::Result<()> {
        while let Some(op) = self.workload.next_if(|op| op.request.arrival_ns <= self.now_ns) {
            self.admit(op)?;
        }
        Ok(())
    }

    fn admit(&mut self, op: GeneratedOp) -> anyhow::Result<()> {
        let req = op.request;
        self.operations += 1;
        self.scheduler.insert(req, op.at_head)?;

        if op.try_merge {
            if let Some(survivor) = self.mergeable(req.category) {
                self.merge(survivor, req.id, req.size)?;
                return Ok(());
            }
        }

        self.pending.insert(
            req.id,
            HostOp {
                category: req.category,
                size: req.size,
                arrival_ns: req.arrival_ns,
                dispatched: false,
            },
        );
        if !op.at_head {
            self.merge_candidate[req.category] = Some(req.id);
        }
        Ok(())
    }

    fn mergeable(&self, category: OpCategory) -> Option<OperationId> {
        let id = self.merge_candidate[category]?;
        let op = self.pending.get(&id)?;
        (!op.dispatched).then_some(id)
    }

    fn merge(&mut self, survivor: OperationId, absorbed: OperationId, size: u64) -> anyhow::Result<()> {
        self.scheduler.merge(survivor, absorbed)?;
        self.merged += 1;

        let Some(host) = self.pending.get_mut(&survivor) else {
            return Ok(());
        };
        host.size = host.size.saturating_add(size);
        match self.scheduler.reposition(survivor, host.size) {
            Ok(()) => Ok(()),
            // Untracked survivors have no deadline to move.
            Err(SchedError::UnknownOperation { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn fill_device(&mut self) {
        while self.device.has_capacity() {
            let Some(op) = self.scheduler.dispatch() else {
                break;
            };
            let Some(host) = self.pending.get_mut(&op.id) else {
                warn!("Scheduler dispatched unknown operation {}", op.id);
                continue;
            };
            host.dispatched = true;
            self.device.submit(op.id, host.category, host.size, self.now_ns);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{SizeRange, WorkloadConfig};

    fn small(operations: u64) -> SimConfig {
        SimConfig {
            workload: WorkloadConfig {
                operations,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_category_report_percentiles() {
        let mut samples: Vec<u64> = (1..=100).rev().collect();
        let report = CategoryReport::from_samples(&mut samples);
        assert_eq!(report.completed, 100);
        assert_eq!(report.p50_latency_ns, 50);
        assert_eq!(report.p99_latency_ns, 99);
        assert_eq!(report.max_latency_ns, 100);
        assert_eq!(report.mean_latency_ns, 50);

        assert_eq!(CategoryReport::from_samples(&mut []), CategoryReport::default());
    }

    #[test]
    fn test_run_completes_every_operation() {
        let report = Simulation::new(small(2_000)).unwrap().run().unwrap();
        assert_eq!(report.operations, 2_000);

        let completed: u64 = report.categories.iter().map(|(_, c)| c.completed).sum();
        assert_eq!(completed + report.merged, 2_000);

        let stats = report.scheduler.stats;
        assert_eq!(stats.inserted, 2_000);
        assert_eq!(stats.merged, report.merged);
        assert_eq!(stats.queued(), 0);
        assert_eq!(report.scheduler.total_predicted_latency_ns, 0);
    }

    #[test]
    fn test_run_learns_latency_models() {
        let mut config = small(3_000);
        config.workload.sizes.read = SizeRange { min: 512, max: 4096 };
        let report = Simulation::new(config).unwrap().run().unwrap();
        let read = report.scheduler.latency_models.read;
        // Device read overhead is 80us plus up to 4 KiB at 300ns/KiB, +-5%.
        assert!(read.base > 70_000, "read base {}", read.base);
        assert!(read.base < 95_000, "read base {}", read.base);
        assert!(report.refreshes > 0);
    }

    #[test]
    fn test_reads_beat_writes() {
        let report = Simulation::new(small(3_000)).unwrap().run().unwrap();
        let read = report.categories.read;
        let write = report.categories.write;
        assert!(read.completed > 0 && write.completed > 0);
        assert!(read.p50_latency_ns <= write.p99_latency_ns);
    }

    #[test]
    fn test_report_lists_readable_attributes() {
        let report = Simulation::new(small(100)).unwrap().run().unwrap();
        assert_eq!(report.attributes["adios_version"], "0.7.1\n");
        assert!(report.attributes.contains_key("lat_model_write"));
        assert!(!report.attributes.contains_key("reset_bq_stats"));
    }

    #[test]
    fn test_same_seed_same_report() {
        let a = Simulation::new(small(500)).unwrap().run().unwrap();
        let b = Simulation::new(small(500)).unwrap().run().unwrap();
        assert_eq!(a.categories, b.categories);
        assert_eq!(a.elapsed_ns, b.elapsed_ns);
    }

    #[test]
    fn test_tiny_metadata_table_degrades() {
        let mut config = small(500);
        config.scheduler.metadata_prealloc = Some(2);
        config.scheduler.max_tracked_operations = 2;
        let report = Simulation::new(config).unwrap().run().unwrap();
        assert!(report.scheduler.stats.untracked > 0);
        assert_eq!(report.scheduler.stats.queued(), 0);
    }
}
