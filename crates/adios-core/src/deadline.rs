//! Deadline-ordered index of unscheduled operations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::latency_model::LatencyModel;
use crate::operation::{OpMeta, OperationId, Placement};

/// Ordering key in the deadline index.
///
/// Ties on `deadline_ns` are broken by admission sequence, so equal
/// deadlines leave the index in FIFO order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeadlineKey {
    /// Absolute deadline in nanoseconds.
    pub deadline_ns: u64,
    /// Admission sequence number.
    pub seq: u64,
}

/// Earliest-deadline-first index over operation handles.
#[derive(Debug, Default)]
pub struct DeadlineIndex {
    tree: BTreeMap<DeadlineKey, OperationId>,
    next_seq: u64,
}

impl DeadlineIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Predicts latency and deadline for `meta` and inserts `id`.
    ///
    /// `predicted = model.predict(size)` and
    /// `deadline = arrival + target_latency + predicted`. Both are written
    /// back into `meta` along with the new placement.
    pub fn admit(
        &mut self,
        id: OperationId,
        meta: &mut OpMeta,
        model: &LatencyModel,
        target_latency_ns: u64,
    ) -> DeadlineKey {
        meta.predicted_latency_ns = model.predict(meta.block_size);
        meta.deadline_ns = meta
            .arrival_ns
            .saturating_add(target_latency_ns)
            .saturating_add(meta.predicted_latency_ns);

        let key = DeadlineKey {
            deadline_ns: meta.deadline_ns,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.tree.insert(key, id);
        meta.placement = Placement::DeadlineIndex(key);
        key
    }

    /// Removes the entry stored under `key`.
    pub fn remove(&mut self, key: &DeadlineKey) -> Option<OperationId> {
        self.tree.remove(key)
    }

    /// Returns the earliest-deadline entry without removing it.
    pub fn peek_min(&self) -> Option<(DeadlineKey, OperationId)> {
        self.tree.first_key_value().map(|(k, id)| (*k, *id))
    }

    /// Removes `id` and admits it again with a fresh prediction.
    pub fn reposition(
        &mut self,
        id: OperationId,
        meta: &mut OpMeta,
        model: &LatencyModel,
        target_latency_ns: u64,
    ) -> DeadlineKey {
        if let Placement::DeadlineIndex(key) = meta.placement {
            self.tree.remove(&key);
        }
        self.admit(id, meta, model, target_latency_ns)
    }

    /// Number of indexed operations.
    #[inline]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// True if nothing is indexed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::OpCategory;
    use crate::operation::OpRequest;

    fn meta(size: u64, arrival_ns: u64) -> OpMeta {
        OpMeta::from_request(&OpRequest::new(
            OperationId(0),
            OpCategory::Read,
            size,
            arrival_ns,
        ))
    }

    #[test]
    fn test_empty_index() {
        let index = DeadlineIndex::new();
        assert!(index.is_empty());
        assert!(index.peek_min().is_none());
    }

    #[test]
    fn test_admit_computes_deadline() {
        let model = LatencyModel::new(0);
        model.observe(0, 50_000, 0, 0);

        let mut index = DeadlineIndex::new();
        let mut m = meta(0, 1_000);
        let key = index.admit(OperationId(1), &mut m, &model, 2_000_000);

        assert_eq!(m.predicted_latency_ns, 50_000);
        assert_eq!(m.deadline_ns, 1_000 + 2_000_000 + 50_000);
        assert_eq!(key.deadline_ns, m.deadline_ns);
        assert_eq!(m.placement, Placement::DeadlineIndex(key));
    }

    #[test]
    fn test_earliest_deadline_first() {
        let model = LatencyModel::new(0);
        let mut index = DeadlineIndex::new();

        let mut late = meta(0, 0);
        index.admit(OperationId(1), &mut late, &model, 750_000_000);
        let mut early = meta(0, 0);
        index.admit(OperationId(2), &mut early, &model, 2_000_000);

        let (_, id) = index.peek_min().unwrap();
        assert_eq!(id, OperationId(2));
    }

    #[test]
    fn test_ties_are_fifo() {
        let model = LatencyModel::new(0);
        let mut index = DeadlineIndex::new();
        for id in 0..3 {
            let mut m = meta(0, 10);
            index.admit(OperationId(id), &mut m, &model, 5);
        }

        let mut order = Vec::new();
        while let Some((key, id)) = index.peek_min() {
            index.remove(&key);
            order.push(id.0);
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_reposition_repredicts() {
        let model = LatencyModel::new(0);
        model.observe(0, 10_000, 0, 0);
        {
            // Give the model a slope so a size change moves the deadline.
            let size = 4096 + 1024;
            model.observe(size, 30_000, 10_000, 1);
            model.update(2);
        }
        assert!(model.params().slope > 0);

        let mut index = DeadlineIndex::new();
        let mut m = meta(0, 0);
        let first = index.admit(OperationId(7), &mut m, &model, 0);

        m.block_size = 1 << 20;
        let second = index.reposition(OperationId(7), &mut m, &model, 0);

        assert_eq!(index.len(), 1);
        assert!(second.deadline_ns > first.deadline_ns);
        assert_eq!(index.peek_min().unwrap(), (second, OperationId(7)));
    }
}
