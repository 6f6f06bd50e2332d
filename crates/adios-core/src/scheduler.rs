//! Top-level adaptive deadline scheduler.
//!
//! [`Scheduler`] owns the deadline index, the dispatcher (priority lane and
//! batch pages), the per-operation metadata table and the per-category
//! latency models, and exposes the operations consumed by the host I/O
//! stack: admission, dispatch, completion, merge/reposition/removal, and the
//! tunable/statistics accessors.
//!
//! Two lock domains are kept apart. The scheduler lock guards all queueing
//! state and tunables. Each latency model carries its own locks, so
//! completions recording samples never take the scheduler lock while a
//! model is being updated.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::category::{OpCategory, PerCategory};
use crate::config::{validate_batch_size_limit, validate_refill_ratio, SchedulerConfig, Tunables};
use crate::deadline::DeadlineIndex;
use crate::dispatcher::{DispatchContext, DispatchSource, Dispatcher};
use crate::error::{SchedError, SchedResult};
use crate::latency_model::{LatencyModel, LatencyModelParams, ModelUpdate};
use crate::operation::{MetadataTable, OpMeta, OpRequest, OperationId, Placement};
use crate::refresh::RefreshTimer;
use crate::stats::{SchedStats, SchedulerSnapshot};

/// Scheduler version string.
pub const ADIOS_VERSION: &str = "0.7.1";

const NSEC_PER_MSEC: u64 = 1_000_000;

/// How an operation was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Admission {
    /// Placed in the deadline index.
    Scheduled {
        /// Computed deadline in ns.
        deadline_ns: u64,
        /// Predicted latency in ns.
        predicted_latency_ns: u64,
    },
    /// Placed at the head of the priority lane.
    PriorityLane,
    /// Metadata could not be allocated; released through the priority lane
    /// without scheduling bookkeeping.
    Untracked,
}

/// An operation released by [`Scheduler::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedOp {
    /// Host identity.
    pub id: OperationId,
    /// Category, if the operation is tracked.
    pub category: Option<OpCategory>,
    /// Predicted latency committed for the operation, in ns.
    pub predicted_latency_ns: u64,
    /// Queue the operation was taken from.
    pub source: DispatchSource,
}

struct SchedState {
    index: DeadlineIndex,
    dispatcher: Dispatcher,
    metas: MetadataTable,
    /// Untracked operations still waiting in the priority lane.
    untracked: HashSet<OperationId>,
    /// Untracked operations released to the device and not yet completed.
    untracked_in_flight: HashSet<OperationId>,
    tunables: Tunables,
    stats: SchedStats,
}

impl SchedState {
    fn admit(
        &mut self,
        req: OpRequest,
        at_head: bool,
        models: &PerCategory<LatencyModel>,
    ) -> SchedResult<Admission> {
        if self.untracked.contains(&req.id) || self.untracked_in_flight.contains(&req.id) {
            return Err(SchedError::DuplicateOperation { id: req.id });
        }

        let mut meta = OpMeta::from_request(&req);
        if at_head {
            // Bypassed operations carry no size and are never sampled.
            meta.block_size = 0;
            meta.placement = Placement::PriorityLane;
        }
        let target = self.tunables.latency_target_ns[req.category];

        let Some(meta) = self.metas.allocate(req.id, meta)? else {
            warn!(
                "Metadata table full ({} entries), admitting {} untracked",
                self.metas.max_entries(),
                req.id
            );
            self.untracked.insert(req.id);
            self.stats.inserted += 1;
            self.stats.untracked += 1;
            self.dispatcher.push_priority(req.id);
            return Ok(Admission::Untracked);
        };
        self.stats.inserted += 1;

        if at_head {
            self.dispatcher.push_priority(req.id);
            debug!("Inserted {} at head of priority lane", req.id);
            return Ok(Admission::PriorityLane);
        }

        let key = self.index.admit(req.id, meta, &models[req.category], target);
        debug!(
            "Inserted {}: category={}, size={}, predicted={}, deadline={}",
            req.id, req.category, meta.block_size, meta.predicted_latency_ns, key.deadline_ns
        );
        Ok(Admission::Scheduled {
            deadline_ns: key.deadline_ns,
            predicted_latency_ns: meta.predicted_latency_ns,
        })
    }

    /// Unlinks `id` from whichever queue holds it and returns the predicted
    /// latency it had committed to the in-flight budget.
    fn detach(&mut self, id: OperationId, meta: &OpMeta) -> u64 {
        match meta.placement {
            Placement::DeadlineIndex(key) => {
                self.index.remove(&key);
                0
            }
            Placement::BatchPage(page) => {
                self.dispatcher.remove_batched(page, meta.category, id);
                meta.predicted_latency_ns
            }
            Placement::PriorityLane => {
                self.dispatcher.remove_priority(id);
                0
            }
            Placement::Dispatched => meta.predicted_latency_ns,
            Placement::Unscheduled => 0,
        }
    }
}

/// Adaptive deadline I/O scheduler.
pub struct Scheduler {
    state: Mutex<SchedState>,
    models: PerCategory<LatencyModel>,
    total_predicted_latency: AtomicU64,
    refresh: RefreshTimer,
    refresh_debounce_ns: u64,
    epoch: Instant,
}

impl Scheduler {
    /// Creates a scheduler.
    ///
    /// Fails if the configuration is invalid or the metadata pool cannot be
    /// pre-allocated.
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        config.validate()?;
        let metas = MetadataTable::new(
            config.metadata_prealloc_entries(),
            config.max_tracked_operations,
        )?;

        info!(
            "Adaptive Deadline I/O Scheduler {}: window={}ns, refill_below={}%",
            ADIOS_VERSION, config.global_latency_window_ns, config.bq_refill_below_ratio
        );

        Ok(Self {
            state: Mutex::new(SchedState {
                index: DeadlineIndex::new(),
                dispatcher: Dispatcher::new(),
                metas,
                untracked: HashSet::new(),
                untracked_in_flight: HashSet::new(),
                tunables: Tunables::from(&config),
                stats: SchedStats::default(),
            }),
            models: PerCategory::from_fn(|_| LatencyModel::new(0)),
            total_predicted_latency: AtomicU64::new(0),
            refresh: RefreshTimer::new(),
            refresh_debounce_ns: config.refresh_debounce_ms.saturating_mul(NSEC_PER_MSEC),
            epoch: Instant::now(),
        })
    }

    /// Monotonic nanoseconds since the scheduler was created.
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Admits one operation. `at_head` places it in the priority lane.
    pub fn insert(&self, req: OpRequest, at_head: bool) -> SchedResult<Admission> {
        self.state.lock().admit(req, at_head, &self.models)
    }

    /// Admits a list of operations under one lock hold.
    pub fn insert_batch<I>(&self, reqs: I, at_head: bool) -> Vec<SchedResult<Admission>>
    where
        I: IntoIterator<Item = OpRequest>,
    {
        let mut state = self.state.lock();
        reqs.into_iter()
            .map(|req| state.admit(req, at_head, &self.models))
            .collect()
    }

    /// Returns the next operation to release to the device.
    pub fn dispatch(&self) -> Option<DispatchedOp> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut ctx = DispatchContext {
            index: &mut state.index,
            metas: &mut state.metas,
            models: &self.models,
            limits: state.tunables.fill_limits(),
            refill_below_ratio: state.tunables.bq_refill_below_ratio,
            total_predicted_latency: &self.total_predicted_latency,
        };
        let (id, source) = state.dispatcher.dispatch(&mut ctx)?;
        state.stats.dispatched += 1;

        let dispatched = match state.metas.get_mut(id) {
            Some(meta) => {
                meta.placement = Placement::Dispatched;
                DispatchedOp {
                    id,
                    category: Some(meta.category),
                    predicted_latency_ns: meta.predicted_latency_ns,
                    source,
                }
            }
            None => {
                if state.untracked.remove(&id) {
                    state.untracked_in_flight.insert(id);
                }
                DispatchedOp {
                    id,
                    category: None,
                    predicted_latency_ns: 0,
                    source,
                }
            }
        };
        debug!("Dispatched {} from {:?}", id, source);
        Some(dispatched)
    }

    /// Acknowledges completion of `id` at `now_ns`.
    ///
    /// The operation's committed prediction is retired from the in-flight
    /// budget. If it was started (`start_ns`) and has a size, the observed
    /// latency is fed to its category's model and a refresh is scheduled.
    /// Returns false if the operation was not known.
    pub fn complete(&self, id: OperationId, start_ns: Option<u64>, now_ns: u64) -> bool {
        let meta = {
            let mut state = self.state.lock();
            if state.untracked_in_flight.remove(&id) || state.untracked.remove(&id) {
                state.dispatcher.remove_priority(id);
                state.stats.completed += 1;
                return true;
            }
            let Some(meta) = state.metas.release(id) else {
                warn!("Attempted to complete unknown operation {}", id);
                return false;
            };
            let committed = state.detach(id, &meta);
            state.stats.completed += 1;
            self.retire(committed);
            meta
        };

        let Some(start_ns) = start_ns else {
            return true;
        };
        if meta.block_size == 0 {
            return true;
        }

        let latency = now_ns.saturating_sub(start_ns);
        self.models[meta.category].observe(
            meta.block_size,
            latency,
            meta.predicted_latency_ns,
            now_ns,
        );
        self.refresh
            .arm_at_or_before(now_ns.saturating_add(self.refresh_debounce_ns));
        true
    }

    /// Drops `absorbed` after the host merged it into `surviving`.
    ///
    /// The absorbed size is added to the survivor's recorded size; the
    /// survivor's deadline is left alone until [`Scheduler::reposition`].
    /// Merging an operation into itself is rejected.
    pub fn merge(&self, surviving: OperationId, absorbed: OperationId) -> SchedResult<()> {
        if surviving == absorbed {
            return Err(SchedError::InvalidMerge { id: surviving });
        }
        let mut state = self.state.lock();
        if state.metas.get(surviving).is_none()
            && !state.untracked.contains(&surviving)
            && !state.untracked_in_flight.contains(&surviving)
        {
            return Err(SchedError::UnknownOperation { id: surviving });
        }

        let absorbed_size = if state.untracked.remove(&absorbed) {
            state.dispatcher.remove_priority(absorbed);
            0
        } else {
            let meta = state
                .metas
                .release(absorbed)
                .ok_or(SchedError::UnknownOperation { id: absorbed })?;
            let committed = state.detach(absorbed, &meta);
            self.retire(committed);
            meta.block_size
        };

        if let Some(meta) = state.metas.get_mut(surviving) {
            if meta.placement != Placement::PriorityLane {
                meta.block_size = meta.block_size.saturating_add(absorbed_size);
            }
        }
        state.stats.merged += 1;
        debug!("Merged {} into {}", absorbed, surviving);
        Ok(())
    }

    /// Records a new size for `id` and, if it is still in the deadline
    /// index, re-admits it with a fresh prediction (front-merge path).
    pub fn reposition(&self, id: OperationId, new_size: u64) -> SchedResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let meta = state
            .metas
            .get_mut(id)
            .ok_or(SchedError::UnknownOperation { id })?;

        if meta.placement == Placement::PriorityLane {
            return Ok(());
        }
        meta.block_size = new_size;

        if let Placement::DeadlineIndex(_) = meta.placement {
            let category = meta.category;
            let target = state.tunables.latency_target_ns[category];
            let key = state
                .index
                .reposition(id, meta, &self.models[category], target);
            debug!("Repositioned {}: deadline={}", id, key.deadline_ns);
        }
        Ok(())
    }

    /// Removes a not-yet-dispatched operation. Returns false if it was
    /// unknown or already dispatched.
    pub fn remove(&self, id: OperationId) -> bool {
        let mut state = self.state.lock();
        if state.untracked.remove(&id) {
            state.dispatcher.remove_priority(id);
            state.stats.removed += 1;
            return true;
        }
        match state.metas.get(id).map(|m| m.placement) {
            None | Some(Placement::Dispatched) => return false,
            Some(_) => {}
        }
        let Some(meta) = state.metas.release(id) else {
            return false;
        };
        let committed = state.detach(id, &meta);
        self.retire(committed);
        state.stats.removed += 1;
        debug!("Removed {}", id);
        true
    }

    fn retire(&self, committed: u64) {
        if committed == 0 {
            return;
        }
        let _ = self
            .total_predicted_latency
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(committed))
            });
    }

    /// True iff a batch page, the deadline index, or the priority lane is non-empty.
    pub fn has_work(&self) -> bool {
        let state = self.state.lock();
        state.dispatcher.has_work() || !state.index.is_empty()
    }

    /// Admitted operations that have not finished.
    pub fn queued(&self) -> u64 {
        self.state.lock().stats.queued()
    }

    /// Returns a copy of the counters.
    pub fn stats(&self) -> SchedStats {
        self.state.lock().stats
    }

    /// Current in-flight predicted latency, in ns.
    pub fn total_predicted_latency(&self) -> u64 {
        self.total_predicted_latency.load(Ordering::Relaxed)
    }

    /// Predicted latency for an operation of `size` bytes in `category`.
    pub fn predict(&self, category: OpCategory, size: u64) -> u64 {
        self.models[category].predict(size)
    }

    /// Target latency for `category`, in ns.
    pub fn latency_target(&self, category: OpCategory) -> u64 {
        self.state.lock().tunables.latency_target_ns[category]
    }

    /// Sets the target latency for `category` and clears its fitted base so
    /// the model re-bootstraps under the new target.
    pub fn set_latency_target(&self, category: OpCategory, target_ns: u64) {
        self.state.lock().tunables.latency_target_ns[category] = target_ns;
        self.models[category].clear_base();
        info!("Set {} latency target to {}ns", category, target_ns);
    }

    /// Batch-size limit for `category`.
    pub fn batch_size_limit(&self, category: OpCategory) -> u32 {
        self.state.lock().tunables.batch_size_limit[category]
    }

    /// Sets the batch-size limit for `category`. Zero is rejected.
    pub fn set_batch_size_limit(&self, category: OpCategory, limit: u32) -> SchedResult<()> {
        validate_batch_size_limit(category, limit)?;
        self.state.lock().tunables.batch_size_limit[category] = limit;
        Ok(())
    }

    /// Global latency window, in ns.
    pub fn global_latency_window(&self) -> u64 {
        self.state.lock().tunables.global_latency_window_ns
    }

    /// Sets the global latency window, in ns.
    pub fn set_global_latency_window(&self, window_ns: u64) {
        self.state.lock().tunables.global_latency_window_ns = window_ns;
    }

    /// Early-refill threshold percentage.
    pub fn refill_below_ratio(&self) -> u32 {
        self.state.lock().tunables.bq_refill_below_ratio
    }

    /// Sets the early-refill threshold. Values outside 0..=100 are rejected.
    pub fn set_refill_below_ratio(&self, ratio: i64) -> SchedResult<()> {
        validate_refill_ratio(ratio)?;
        self.state.lock().tunables.bq_refill_below_ratio = ratio as u32;
        Ok(())
    }

    /// Fitted parameters of the model for `category`.
    pub fn model_params(&self, category: OpCategory) -> LatencyModelParams {
        self.models[category].params()
    }

    /// Largest per-category batch admitted by a single fill.
    pub fn batch_size_actual_highest(&self) -> PerCategory<u32> {
        self.state.lock().dispatcher.batch_size_actual_highest()
    }

    /// Clears the per-category batch highs.
    pub fn reset_batch_stats(&self) {
        self.state.lock().dispatcher.reset_batch_stats();
    }

    /// Returns every latency model to its pre-learning state.
    pub fn reset_latency_models(&self) {
        for category in OpCategory::ALL {
            self.models[category].reset();
        }
        info!("Latency models reset");
    }

    /// Version string.
    pub fn version(&self) -> &'static str {
        ADIOS_VERSION
    }

    /// The debounced refresh timer.
    pub fn refresh_timer(&self) -> &RefreshTimer {
        &self.refresh
    }

    /// True if a model refresh is due at `now_ns`.
    pub fn refresh_due(&self, now_ns: u64) -> bool {
        self.refresh.due(now_ns)
    }

    /// Refreshes every latency model and disarms the timer.
    pub fn refresh(&self, now_ns: u64) -> PerCategory<ModelUpdate> {
        self.refresh.disarm();
        PerCategory::from_fn(|category| self.models[category].update(now_ns))
    }

    /// Returns every exposed parameter and statistic.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.lock();
        SchedulerSnapshot {
            version: ADIOS_VERSION.to_string(),
            latency_target_ns: state.tunables.latency_target_ns,
            batch_size_limit: state.tunables.batch_size_limit,
            latency_models: PerCategory::from_fn(|c| self.models[c].params()),
            global_latency_window_ns: state.tunables.global_latency_window_ns,
            bq_refill_below_ratio: state.tunables.bq_refill_below_ratio,
            batch_size_actual_highest: state.dispatcher.batch_size_actual_highest(),
            total_predicted_latency_ns: self.total_predicted_latency.load(Ordering::Relaxed),
            deadline_queue_len: state.index.len(),
            batch_queue_len: state.dispatcher.planner().len(),
            priority_queue_len: state.dispatcher.lane().len(),
            stats: state.stats,
        }
    }

    /// Stops the refresh timer and reports any work left behind.
    pub fn shutdown(&self) {
        self.refresh.disarm();
        let state = self.state.lock();
        let queued = state.stats.queued();
        if queued != 0 {
            warn!(
                "Scheduler shut down with {} queued: inserted {} merged {} removed {} dispatched {} completed {}",
                queued,
                state.stats.inserted,
                state.stats.merged,
                state.stats.removed,
                state.stats.dispatched,
                state.stats.completed
            );
        }
    }
}
