//! Online latency model, one instance per operation category.
//!
//! The model fits `latency(size) = base + slope * ceil(max(0, size - 4096) / 1024)`
//! from completed-operation samples. Small operations (at or below the size
//! threshold) estimate `base`; large operations estimate the marginal `slope`.
//! Samples are binned by the ratio of observed to expected latency so that the
//! top percentile can be trimmed as outliers before folding into running sums.
//!
//! Two locks are used: an [`RwLock`] over the fitted parameters, read on every
//! prediction, and a [`Mutex`] over the raw histograms, taken on every sample.
//! A refresh only holds the histogram lock long enough to swap the histograms
//! out, and only takes the parameter write lock for the final fold.

use std::fmt;

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Operations at or below this size in bytes feed the `base` estimate.
pub const LM_BLOCK_SIZE_THRESHOLD: u64 = 4096;
/// A histogram holding at least this many samples is folded without waiting for the interval.
pub const LM_SAMPLES_THRESHOLD: u64 = 1024;
/// Minimum interval between time-triggered refreshes, in nanoseconds.
pub const LM_INTERVAL_THRESHOLD_NS: u64 = 1_500_000_000;
/// Percentile of samples kept when trimming outliers.
pub const LM_OUTLIER_PERCENTILE: u64 = 99;
/// Number of latency-ratio bins per histogram.
pub const LM_NUM_BUCKETS: usize = 64;
/// Size unit, in bytes, that `slope` is expressed per.
pub const LM_SLOPE_UNIT: u64 = 1024;

/// Maps an observed latency to a histogram bin by its ratio to `reference`.
///
/// Ratios below 2x get 20 bins per unit, 2x-5x get 10 per unit offset by 20,
/// and anything beyond 5x gets 3 per unit offset by 40. The result is clamped
/// to the last bin. A zero reference is treated as 1.
pub fn bucket_index(measured: u64, reference: u64) -> usize {
    let reference = reference.max(1);
    let index = if measured < reference.saturating_mul(2) {
        measured.saturating_mul(20) / reference
    } else if measured < reference.saturating_mul(5) {
        measured.saturating_mul(10) / reference + 20
    } else {
        (measured.saturating_mul(3) / reference).saturating_add(40)
    };
    index.min(LM_NUM_BUCKETS as u64 - 1) as usize
}

#[inline]
fn mul_div(value: u64, numerator: u64, denominator: u64) -> u64 {
    ((value as u128 * numerator as u128) / denominator as u128) as u64
}

#[derive(Debug, Clone, Copy, Default)]
struct LatencyBucket {
    count: u64,
    sum_latency: u64,
    sum_block_size: u64,
}

/// Sums over the retained (non-outlier) part of a histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TrimmedSums {
    count: u64,
    sum_latency: u64,
    sum_block_size: u64,
}

#[derive(Debug, Clone)]
struct LatencyHistogram {
    buckets: [LatencyBucket; LM_NUM_BUCKETS],
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: [LatencyBucket::default(); LM_NUM_BUCKETS],
        }
    }
}

impl LatencyHistogram {
    fn record(&mut self, index: usize, latency: u64, block_size: u64) {
        let bucket = &mut self.buckets[index];
        bucket.count += 1;
        bucket.sum_latency = bucket.sum_latency.saturating_add(latency);
        bucket.sum_block_size = bucket.sum_block_size.saturating_add(block_size);
    }

    fn total_count(&self) -> u64 {
        self.buckets.iter().map(|b| b.count).sum()
    }

    /// Sums the lowest `percentile`% of samples in bin order. The bin holding
    /// the cutoff contributes proportionally to how many of its samples fall
    /// below it.
    fn trimmed(&self, total_count: u64, percentile: u64) -> TrimmedSums {
        let threshold_count = total_count.saturating_mul(percentile) / 100;
        let mut cumulative = 0u64;
        let mut sums = TrimmedSums::default();

        for bucket in &self.buckets {
            let before = cumulative;
            cumulative = cumulative.saturating_add(bucket.count);
            if cumulative >= threshold_count {
                let remaining = threshold_count.saturating_sub(before);
                if bucket.count > 0 {
                    sums.sum_latency = sums
                        .sum_latency
                        .saturating_add(mul_div(bucket.sum_latency, remaining, bucket.count));
                    sums.sum_block_size = sums
                        .sum_block_size
                        .saturating_add(mul_div(bucket.sum_block_size, remaining, bucket.count));
                }
                sums.count = sums.count.saturating_add(remaining);
                break;
            }
            sums.sum_latency = sums.sum_latency.saturating_add(bucket.sum_latency);
            sums.sum_block_size = sums.sum_block_size.saturating_add(bucket.sum_block_size);
            sums.count = sums.count.saturating_add(bucket.count);
        }

        sums
    }
}

#[derive(Debug, Default)]
struct Histograms {
    small: LatencyHistogram,
    large: LatencyHistogram,
}

/// Fitted parameters and running sums of a latency model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyModelParams {
    /// Typical latency of an operation at or below the size threshold, in ns.
    pub base: u64,
    /// Marginal latency per KiB above the size threshold, in ns.
    pub slope: u64,
    /// Accumulated trimmed latency of small samples.
    pub small_sum_delay: u64,
    /// Accumulated trimmed count of small samples.
    pub small_count: u64,
    /// Accumulated trimmed latency of large samples, net of `base`.
    pub large_sum_delay: u64,
    /// Accumulated trimmed size of large samples, in bytes.
    pub large_sum_block_size: u64,
}

impl fmt::Display for LatencyModelParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "base : {} ns", self.base)?;
        writeln!(f, "slope: {} ns / kB", self.slope)?;
        writeln!(f, "small: {} ns / {} rq", self.small_sum_delay, self.small_count)?;
        writeln!(
            f,
            "large: {} ns / {} B",
            self.large_sum_delay, self.large_sum_block_size
        )
    }
}

#[derive(Debug)]
struct ModelState {
    params: LatencyModelParams,
    last_updated_ns: u64,
}

/// How a sample was handled by [`LatencyModel::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDisposition {
    /// Recorded into the small histogram.
    Small,
    /// Recorded into the small histogram and folded immediately (cold start).
    Bootstrapped,
    /// Recorded into the large histogram.
    Large,
    /// Dropped: a large sample arrived before `base` was known.
    Discarded,
}

/// What a call to [`LatencyModel::update`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelUpdate {
    /// The small histogram was folded into `base`.
    pub small_processed: bool,
    /// The large histogram was folded into `slope`.
    pub large_processed: bool,
    /// The refresh interval had elapsed (or the model was cold).
    pub time_elapsed: bool,
}

/// Online latency model for one operation category.
#[derive(Debug)]
pub struct LatencyModel {
    state: RwLock<ModelState>,
    histograms: Mutex<Histograms>,
}

impl LatencyModel {
    /// Creates an empty model whose refresh interval starts at `now_ns`.
    pub fn new(now_ns: u64) -> Self {
        Self {
            state: RwLock::new(ModelState {
                params: LatencyModelParams::default(),
                last_updated_ns: now_ns,
            }),
            histograms: Mutex::new(Histograms::default()),
        }
    }

    /// Predicts the latency in nanoseconds of an operation of `block_size` bytes.
    pub fn predict(&self, block_size: u64) -> u64 {
        let state = self.state.read();
        let mut result = state.params.base;
        if block_size > LM_BLOCK_SIZE_THRESHOLD {
            let units = (block_size - LM_BLOCK_SIZE_THRESHOLD).div_ceil(LM_SLOPE_UNIT);
            result = result.saturating_add(state.params.slope.saturating_mul(units));
        }
        result
    }

    /// True once `base` has been fitted.
    #[inline]
    pub fn has_base(&self) -> bool {
        self.state.read().params.base != 0
    }

    /// Returns a copy of the fitted parameters and running sums.
    pub fn params(&self) -> LatencyModelParams {
        self.state.read().params
    }

    /// Records one completed-operation sample.
    ///
    /// `predicted_latency` is the prediction committed for the operation when
    /// it was admitted; it is the reference ratio for large samples.
    pub fn observe(
        &self,
        block_size: u64,
        latency: u64,
        predicted_latency: u64,
        now_ns: u64,
    ) -> SampleDisposition {
        let base = self.state.read().params.base;

        if block_size <= LM_BLOCK_SIZE_THRESHOLD {
            let index = bucket_index(latency, base);
            self.histograms.lock().small.record(index, latency, block_size);

            if base == 0 {
                self.update(now_ns);
                return SampleDisposition::Bootstrapped;
            }
            return SampleDisposition::Small;
        }

        if base == 0 {
            return SampleDisposition::Discarded;
        }

        let index = bucket_index(latency, predicted_latency);
        self.histograms
            .lock()
            .large
            .record(index, latency, block_size);
        SampleDisposition::Large
    }

    /// Folds pending samples into the fitted parameters.
    ///
    /// A histogram is folded when it is non-empty and either the refresh
    /// interval has elapsed, it holds at least [`LM_SAMPLES_THRESHOLD`]
    /// samples, or its parameter is still unset. Unset parameters fold all
    /// samples; fitted ones drop the top `100 - LM_OUTLIER_PERCENTILE`%.
    pub fn update(&self, now_ns: u64) -> ModelUpdate {
        let state = self.state.upgradable_read();
        let base = state.params.base;
        let slope = state.params.slope;
        let time_elapsed =
            base == 0 || state.last_updated_ns.saturating_add(LM_INTERVAL_THRESHOLD_NS) <= now_ns;

        let (small, large) = {
            let mut histograms = self.histograms.lock();
            let small_count = histograms.small.total_count();
            let large_count = histograms.large.total_count();

            let small = (small_count > 0
                && (time_elapsed || small_count >= LM_SAMPLES_THRESHOLD || base == 0))
                .then(|| (std::mem::take(&mut histograms.small), small_count));
            let large = (large_count > 0
                && (time_elapsed || large_count >= LM_SAMPLES_THRESHOLD || slope == 0))
                .then(|| (std::mem::take(&mut histograms.large), large_count));
            (small, large)
        };

        let percentile = |unset: bool| if unset { 100 } else { LM_OUTLIER_PERCENTILE };
        let small_sums = small.map(|(hist, count)| hist.trimmed(count, percentile(base == 0)));
        let large_sums = large.map(|(hist, count)| hist.trimmed(count, percentile(slope == 0)));

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        let params = &mut state.params;

        if let Some(sums) = small_sums {
            params.small_sum_delay = params.small_sum_delay.saturating_add(sums.sum_latency);
            params.small_count += sums.count;
            if params.small_count > 0 {
                params.base = params.small_sum_delay / params.small_count;
            }
        }

        if let Some(sums) = large_sums {
            // Intercept uses the base in effect before this refresh.
            let intercept = base.saturating_mul(sums.count);
            if sums.sum_latency > intercept {
                params.large_sum_delay = params
                    .large_sum_delay
                    .saturating_add(sums.sum_latency - intercept);
            }
            params.large_sum_block_size = params
                .large_sum_block_size
                .saturating_add(sums.sum_block_size);
            if params.large_sum_block_size > 0 {
                params.slope =
                    params.large_sum_delay / params.large_sum_block_size.div_ceil(LM_SLOPE_UNIT);
            }
        }

        if time_elapsed {
            state.last_updated_ns = now_ns;
        }

        let outcome = ModelUpdate {
            small_processed: small_sums.is_some(),
            large_processed: large_sums.is_some(),
            time_elapsed,
        };
        if outcome.small_processed || outcome.large_processed {
            debug!(
                "Latency model refreshed: base={}, slope={}, small={}, large={}",
                state.params.base, state.params.slope, outcome.small_processed, outcome.large_processed
            );
        }
        outcome
    }

    /// Discards all learned state and pending samples.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.params = LatencyModelParams::default();
        *self.histograms.lock() = Histograms::default();
    }

    /// Clears only the fitted `base`, forcing the model back into bootstrap.
    pub fn clear_base(&self) {
        self.state.write().params.base = 0;
    }

    /// Number of samples waiting in the (small, large) histograms.
    pub fn pending_samples(&self) -> (u64, u64) {
        let histograms = self.histograms.lock();
        (histograms.small.total_count(), histograms.large.total_count())
    }
}
