//! Simulated block device with a fixed queue depth.
//!
//! Service time of an operation is `overhead + per_kib * ceil(size / 1024)`,
//! scaled by a uniform jitter. Operations in flight are serviced in
//! parallel up to the queue depth.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use adios_core::{OpCategory, OperationId, PerCategory};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Cost model of one operation category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCost {
    /// Fixed per-operation cost, in ns.
    pub overhead_ns: u64,
    /// Cost per KiB transferred, in ns.
    pub per_kib_ns: u64,
}

/// Device parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Maximum operations in flight.
    pub queue_depth: usize,
    /// Cost model per category.
    pub cost: PerCategory<ServiceCost>,
    /// Jitter as a fraction of the service time, e.g. 0.1 for +-10%.
    pub jitter: f64,
    /// Seed for the jitter RNG.
    pub seed: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            cost: PerCategory {
                read: ServiceCost {
                    overhead_ns: 80_000,
                    per_kib_ns: 300,
                },
                write: ServiceCost {
                    overhead_ns: 25_000,
                    per_kib_ns: 900,
                },
                discard: ServiceCost {
                    overhead_ns: 500_000,
                    per_kib_ns: 10,
                },
                other: ServiceCost {
                    overhead_ns: 1_000_000,
                    per_kib_ns: 0,
                },
            },
            jitter: 0.05,
            seed: 7,
        }
    }
}

/// An operation the device finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCompletion {
    /// Operation identity.
    pub id: OperationId,
    /// When service started, in ns.
    pub start_ns: u64,
    /// When service finished, in ns.
    pub finish_ns: u64,
}

/// Simulated device.
pub struct SimDevice {
    config: DeviceConfig,
    rng: StdRng,
    in_flight: BinaryHeap<Reverse<(u64, u64, OperationId)>>,
}

impl SimDevice {
    /// Creates an idle device.
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            in_flight: BinaryHeap::new(),
        }
    }

    /// Noise-free service time of an operation.
    pub fn nominal_service_ns(&self, category: OpCategory, size: u64) -> u64 {
        let cost = self.config.cost[category];
        cost.overhead_ns
            .saturating_add(cost.per_kib_ns.saturating_mul(size.div_ceil(1024)))
    }

    /// True if another operation can be submitted.
    pub fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.config.queue_depth
    }

    /// Operations in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Starts servicing `id` at `now_ns` and returns its finish time.
    pub fn submit(&mut self, id: OperationId, category: OpCategory, size: u64, now_ns: u64) -> u64 {
        let nominal = self.nominal_service_ns(category, size);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let scale = if jitter > 0.0 {
            self.rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let service = ((nominal as f64) * scale).max(1.0) as u64;
        let finish = now_ns.saturating_add(service);
        self.in_flight.push(Reverse((finish, now_ns, id)));
        finish
    }

    /// Earliest pending finish time.
    pub fn next_completion_ns(&self) -> Option<u64> {
        self.in_flight.peek().map(|Reverse((finish, _, _))| *finish)
    }

    /// Removes and returns the next operation finished by `now_ns`.
    pub fn pop_completed(&mut self, now_ns: u64) -> Option<DeviceCompletion> {
        match self.in_flight.peek() {
            Some(Reverse((finish, _, _))) if *finish <= now_ns => {}
            _ => return None,
        }
        self.in_flight.pop().map(|Reverse((finish_ns, start_ns, id))| DeviceCompletion {
            id,
            start_ns,
            finish_ns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> DeviceConfig {
        DeviceConfig {
            jitter: 0.0,
            queue_depth: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_nominal_service_time() {
        let device = SimDevice::new(quiet());
        assert_eq!(device.nominal_service_ns(OpCategory::Read, 0), 80_000);
        assert_eq!(device.nominal_service_ns(OpCategory::Read, 4096), 81_200);
        assert_eq!(device.nominal_service_ns(OpCategory::Read, 4097), 81_500);
    }

    #[test]
    fn test_queue_depth_limits_submission() {
        let mut device = SimDevice::new(quiet());
        device.submit(OperationId(1), OpCategory::Read, 0, 0);
        assert!(device.has_capacity());
        device.submit(OperationId(2), OpCategory::Write, 0, 0);
        assert!(!device.has_capacity());
        assert_eq!(device.in_flight(), 2);
    }

    #[test]
    fn test_completions_in_finish_order() {
        let mut device = SimDevice::new(quiet());
        device.submit(OperationId(1), OpCategory::Read, 0, 0);
        device.submit(OperationId(2), OpCategory::Write, 0, 10);
        assert_eq!(device.next_completion_ns(), Some(25_010));

        assert!(device.pop_completed(25_009).is_none());
        let first = device.pop_completed(100_000).unwrap();
        assert_eq!(first.id, OperationId(2));
        assert_eq!(first.start_ns, 10);
        let second = device.pop_completed(100_000).unwrap();
        assert_eq!(second.id, OperationId(1));
        assert_eq!(second.finish_ns, 80_000);
        assert!(device.pop_completed(u64::MAX).is_none());
    }

    #[test]
    fn test_jitter_bounded() {
        let mut device = SimDevice::new(DeviceConfig {
            jitter: 0.1,
            queue_depth: 10_000,
            ..Default::default()
        });
        for i in 0..1_000 {
            let finish = device.submit(OperationId(i), OpCategory::Read, 0, 0);
            assert!((71_999..=88_001).contains(&finish));
        }
    }
}
