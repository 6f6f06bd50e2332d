//! Operation identities and per-operation scheduling metadata.
//!
//! Operation payloads are owned by the host issue path. The scheduler only
//! holds [`OperationId`] handles plus the small [`OpMeta`] record it needs
//! for ordering and budget accounting, kept in a bounded [`MetadataTable`].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::category::OpCategory;
use crate::deadline::DeadlineKey;
use crate::error::{SchedError, SchedResult};

/// Host-assigned identity of a pending I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Admission request handed to the scheduler by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpRequest {
    /// Host identity of the operation.
    pub id: OperationId,
    /// Operation category.
    pub category: OpCategory,
    /// Transfer size in bytes.
    pub size: u64,
    /// Arrival timestamp in nanoseconds on the scheduler clock.
    pub arrival_ns: u64,
}

impl OpRequest {
    /// Creates a new admission request.
    pub fn new(id: OperationId, category: OpCategory, size: u64, arrival_ns: u64) -> Self {
        Self {
            id,
            category,
            size,
            arrival_ns,
        }
    }
}

/// Where an operation currently lives inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Tracked but not yet placed anywhere.
    Unscheduled,
    /// Waiting in the deadline index under the given key.
    DeadlineIndex(DeadlineKey),
    /// Sitting in batch page 0 or 1.
    BatchPage(usize),
    /// Waiting in the head-of-line priority lane.
    PriorityLane,
    /// Released to the device, awaiting completion.
    Dispatched,
}

/// Scheduling metadata for one tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpMeta {
    /// Operation category.
    pub category: OpCategory,
    /// Size in bytes used for prediction and learning. Zero for bypassed operations.
    pub block_size: u64,
    /// Arrival timestamp in nanoseconds.
    pub arrival_ns: u64,
    /// Predicted latency committed at admission into the deadline index.
    pub predicted_latency_ns: u64,
    /// Deadline computed at admission into the deadline index.
    pub deadline_ns: u64,
    /// Current placement.
    pub placement: Placement,
}

impl OpMeta {
    /// Creates unscheduled metadata for an admission request.
    pub fn from_request(req: &OpRequest) -> Self {
        Self {
            category: req.category,
            block_size: req.size,
            arrival_ns: req.arrival_ns,
            predicted_latency_ns: 0,
            deadline_ns: 0,
            placement: Placement::Unscheduled,
        }
    }
}

/// Bounded table of per-operation scheduling metadata.
pub struct MetadataTable {
    entries: HashMap<OperationId, OpMeta>,
    max_entries: usize,
}

impl MetadataTable {
    /// Creates a table, reserving `prealloc` entries up front.
    ///
    /// Fails with [`SchedError::MetadataPool`] if the reservation cannot be
    /// satisfied, or if `prealloc` exceeds `max_entries`.
    pub fn new(prealloc: usize, max_entries: usize) -> SchedResult<Self> {
        if prealloc > max_entries {
            return Err(SchedError::MetadataPool { entries: prealloc });
        }
        let mut entries = HashMap::new();
        entries
            .try_reserve(prealloc)
            .map_err(|_| SchedError::MetadataPool { entries: prealloc })?;
        debug!(
            "Created metadata table: prealloc={}, max_entries={}",
            prealloc, max_entries
        );
        Ok(Self {
            entries,
            max_entries,
        })
    }

    /// Stores metadata for `id` and returns it.
    ///
    /// Returns `Ok(None)` when the table is at capacity; the caller is
    /// expected to let the operation proceed untracked.
    pub fn allocate(&mut self, id: OperationId, meta: OpMeta) -> SchedResult<Option<&mut OpMeta>> {
        if self.entries.contains_key(&id) {
            return Err(SchedError::DuplicateOperation { id });
        }
        if self.entries.len() >= self.max_entries || self.entries.try_reserve(1).is_err() {
            return Ok(None);
        }
        Ok(Some(self.entries.entry(id).or_insert(meta)))
    }

    /// Returns metadata for `id`.
    #[inline]
    pub fn get(&self, id: OperationId) -> Option<&OpMeta> {
        self.entries.get(&id)
    }

    /// Returns mutable metadata for `id`.
    #[inline]
    pub fn get_mut(&mut self, id: OperationId) -> Option<&mut OpMeta> {
        self.entries.get_mut(&id)
    }

    /// Releases metadata for `id`.
    pub fn release(&mut self, id: OperationId) -> Option<OpMeta> {
        self.entries.remove(&id)
    }

    /// Number of tracked operations.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is tracked.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of tracked operations.
    #[inline]
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}
