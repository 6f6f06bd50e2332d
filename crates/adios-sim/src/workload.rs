//! Seeded synthetic workload generation.

use adios_core::{OpCategory, OpRequest, OperationId, PerCategory};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Inclusive byte-size range for generated operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRange {
    /// Smallest size in bytes.
    pub min: u64,
    /// Largest size in bytes.
    pub max: u64,
}

impl SizeRange {
    /// A range covering exactly `size`.
    pub const fn fixed(size: u64) -> Self {
        Self {
            min: size,
            max: size,
        }
    }
}

/// Shape of the generated workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Number of operations to generate.
    pub operations: u64,
    /// RNG seed; the same seed always yields the same workload.
    pub seed: u64,
    /// Mean gap between arrivals, in ns. Gaps are uniform in `0..=2*mean`.
    pub mean_interarrival_ns: u64,
    /// Relative weight of each category in the mix.
    pub mix: PerCategory<u32>,
    /// Size range of each category, rounded to 512-byte sectors.
    pub sizes: PerCategory<SizeRange>,
    /// Fraction of operations submitted at the head of the queue.
    pub head_insert_fraction: f64,
    /// Fraction of operations the host tries to merge into the previous
    /// pending operation of the same category.
    pub merge_fraction: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            seed: 1050,
            mean_interarrival_ns: 20_000,
            mix: PerCategory {
                read: 60,
                write: 35,
                discard: 3,
                other: 2,
            },
            sizes: PerCategory {
                read: SizeRange {
                    min: 4096,
                    max: 128 * 1024,
                },
                write: SizeRange {
                    min: 4096,
                    max: 512 * 1024,
                },
                discard: SizeRange {
                    min: 1 << 20,
                    max: 16 << 20,
                },
                other: SizeRange::fixed(0),
            },
            head_insert_fraction: 0.01,
            merge_fraction: 0.05,
        }
    }
}

/// One generated host event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratedOp {
    /// The admission request.
    pub request: OpRequest,
    /// Submit at the head of the queue.
    pub at_head: bool,
    /// Attempt a merge into the previous pending operation of the category.
    pub try_merge: bool,
}

/// Deterministic generator of [`GeneratedOp`]s in arrival order.
pub struct WorkloadGenerator {
    config: WorkloadConfig,
    rng: StdRng,
    next_id: u64,
    clock_ns: u64,
    total_weight: u32,
}

impl WorkloadGenerator {
    /// Creates a generator seeded from `config.seed`.
    pub fn new(config: WorkloadConfig) -> Self {
        let total_weight = config.mix.iter().map(|(_, w)| *w).sum();
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            next_id: 0,
            clock_ns: 0,
            total_weight,
        }
    }

    fn pick_category(&mut self) -> OpCategory {
        if self.total_weight == 0 {
            return OpCategory::Read;
        }
        let mut roll = self.rng.gen_range(0..self.total_weight);
        for (category, weight) in self.config.mix.iter() {
            if roll < *weight {
                return category;
            }
            roll -= *weight;
        }
        OpCategory::Other
    }

    fn pick_size(&mut self, category: OpCategory) -> u64 {
        let range = self.config.sizes[category];
        let (lo, hi) = (range.min.min(range.max), range.max.max(range.min));
        let size = self.rng.gen_range(lo..=hi);
        size / 512 * 512
    }
}

impl Iterator for WorkloadGenerator {
    type Item = GeneratedOp;

    fn next(&mut self) -> Option<GeneratedOp> {
        if self.next_id >= self.config.operations {
            return None;
        }

        let gap = self
            .rng
            .gen_range(0..=self.config.mean_interarrival_ns.saturating_mul(2));
        self.clock_ns = self.clock_ns.saturating_add(gap);

        let category = self.pick_category();
        let size = self.pick_size(category);
        let at_head = self.rng.gen_bool(self.config.head_insert_fraction.clamp(0.0, 1.0));
        let try_merge = !at_head && self.rng.gen_bool(self.config.merge_fraction.clamp(0.0, 1.0));

        let id = OperationId(self.next_id);
        self.next_id += 1;

        Some(GeneratedOp {
            request: OpRequest::new(id, category, size, self.clock_ns),
            at_head,
            try_merge,
        })
    }
}
