//! Scheduler configuration and runtime tunables.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::batch::FillLimits;
use crate::category::{OpCategory, PerCategory};
use crate::error::{SchedError, SchedResult};

const NSEC_PER_MSEC: u64 = 1_000_000;

/// Construction-time configuration of a [`crate::Scheduler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Target latency added to every deadline, per category, in ns.
    pub latency_target_ns: PerCategory<u64>,
    /// Maximum operations per category per batch page.
    pub batch_size_limit: PerCategory<u32>,
    /// Budget on total predicted in-flight latency, in ns.
    pub global_latency_window_ns: u64,
    /// Refill the spare page early while in-flight latency is below this
    /// percentage of the window.
    pub bq_refill_below_ratio: u32,
    /// Metadata entries reserved at construction. `None` reserves two
    /// pages' worth (twice the sum of the batch limits).
    pub metadata_prealloc: Option<usize>,
    /// Hard cap on tracked operations. Beyond it admissions bypass scheduling.
    pub max_tracked_operations: usize,
    /// Delay before a model refresh after a completion, in ms.
    pub refresh_debounce_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            latency_target_ns: PerCategory {
                read: 2 * NSEC_PER_MSEC,
                write: 750 * NSEC_PER_MSEC,
                discard: 5000 * NSEC_PER_MSEC,
                other: 0,
            },
            batch_size_limit: PerCategory {
                read: 64,
                write: 32,
                discard: 1,
                other: 1,
            },
            global_latency_window_ns: 16 * NSEC_PER_MSEC,
            bq_refill_below_ratio: 15,
            metadata_prealloc: None,
            max_tracked_operations: 65536,
            refresh_debounce_ms: 100,
        }
    }
}

impl SchedulerConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> SchedResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SchedulerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| SchedError::Config {
                reason: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| SchedError::Config {
                reason: e.to_string(),
            })?,
            _ => {
                return Err(SchedError::Config {
                    reason: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Applies the same rules as the runtime setters.
    pub fn validate(&self) -> SchedResult<()> {
        for (category, limit) in self.batch_size_limit.iter() {
            validate_batch_size_limit(category, *limit)?;
        }
        validate_refill_ratio(self.bq_refill_below_ratio as i64)?;
        Ok(())
    }

    /// Number of metadata entries to reserve at construction.
    pub fn metadata_prealloc_entries(&self) -> usize {
        self.metadata_prealloc.unwrap_or_else(|| {
            let per_page: usize = self
                .batch_size_limit
                .iter()
                .map(|(_, limit)| *limit as usize)
                .sum();
            per_page * crate::batch::NUM_BQ_PAGES
        })
    }
}

pub(crate) fn validate_batch_size_limit(category: OpCategory, limit: u32) -> SchedResult<()> {
    if limit == 0 {
        return Err(SchedError::InvalidBatchSizeLimit { category });
    }
    Ok(())
}

pub(crate) fn validate_refill_ratio(ratio: i64) -> SchedResult<()> {
    if !(0..=100).contains(&ratio) {
        return Err(SchedError::InvalidRefillRatio { ratio });
    }
    Ok(())
}

/// Runtime-adjustable tunables, guarded by the scheduler lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunables {
    /// Target latency per category, in ns.
    pub latency_target_ns: PerCategory<u64>,
    /// Batch-size limit per category.
    pub batch_size_limit: PerCategory<u32>,
    /// Global latency window, in ns.
    pub global_latency_window_ns: u64,
    /// Early-refill threshold as a percentage of the window.
    pub bq_refill_below_ratio: u32,
}

impl Tunables {
    /// Fill limits derived from the current tunables.
    pub fn fill_limits(&self) -> FillLimits {
        FillLimits {
            batch_size_limit: self.batch_size_limit,
            global_latency_window_ns: self.global_latency_window_ns,
        }
    }
}

impl From<&SchedulerConfig> for Tunables {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            latency_target_ns: config.latency_target_ns,
            batch_size_limit: config.batch_size_limit,
            global_latency_window_ns: config.global_latency_window_ns,
            bq_refill_below_ratio: config.bq_refill_below_ratio,
        }
    }
}
