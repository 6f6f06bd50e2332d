//! Named text attributes for inspecting and tuning a running scheduler.
//!
//! Each attribute has a fixed name and renders as newline-terminated text.
//! Writable attributes accept a base-10 integer; surrounding whitespace is
//! ignored.

use std::fmt;
use std::str::FromStr;

use crate::category::OpCategory;
use crate::error::{SchedError, SchedResult};
use crate::scheduler::{Scheduler, ADIOS_VERSION};

/// A scheduler attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Version string. Read-only.
    AdiosVersion,
    /// Per-category batch highs. Read-only.
    BatchSizeActualHighest,
    /// Early-refill threshold percentage.
    BqRefillBelowRatio,
    /// Global latency window in ns.
    GlobalLatencyWindow,
    /// Batch-size limit of a category.
    BatchSizeLimit(OpCategory),
    /// Fitted latency model of a category. Read-only.
    LatModel(OpCategory),
    /// Target latency of a category in ns.
    LatTarget(OpCategory),
    /// Writing `1` clears the batch highs. Write-only.
    ResetBqStats,
    /// Writing `1` resets every latency model. Write-only.
    ResetLatencyModel,
}

impl Attribute {
    /// Every attribute, in listing order.
    pub const ALL: [Attribute; 18] = [
        Attribute::AdiosVersion,
        Attribute::BatchSizeActualHighest,
        Attribute::BqRefillBelowRatio,
        Attribute::GlobalLatencyWindow,
        Attribute::BatchSizeLimit(OpCategory::Read),
        Attribute::BatchSizeLimit(OpCategory::Write),
        Attribute::BatchSizeLimit(OpCategory::Discard),
        Attribute::BatchSizeLimit(OpCategory::Other),
        Attribute::LatModel(OpCategory::Read),
        Attribute::LatModel(OpCategory::Write),
        Attribute::LatModel(OpCategory::Discard),
        Attribute::LatModel(OpCategory::Other),
        Attribute::LatTarget(OpCategory::Read),
        Attribute::LatTarget(OpCategory::Write),
        Attribute::LatTarget(OpCategory::Discard),
        Attribute::LatTarget(OpCategory::Other),
        Attribute::ResetBqStats,
        Attribute::ResetLatencyModel,
    ];

    /// Attribute name.
    pub fn name(&self) -> &'static str {
        use OpCategory::*;
        match self {
            Attribute::AdiosVersion => "adios_version",
            Attribute::BatchSizeActualHighest => "batch_size_actual_highest",
            Attribute::BqRefillBelowRatio => "bq_refill_below_ratio",
            Attribute::GlobalLatencyWindow => "global_latency_window",
            Attribute::BatchSizeLimit(Read) => "batch_size_limit_read",
            Attribute::BatchSizeLimit(Write) => "batch_size_limit_write",
            Attribute::BatchSizeLimit(Discard) => "batch_size_limit_discard",
            Attribute::BatchSizeLimit(Other) => "batch_size_limit_other",
            Attribute::LatModel(Read) => "lat_model_read",
            Attribute::LatModel(Write) => "lat_model_write",
            Attribute::LatModel(Discard) => "lat_model_discard",
            Attribute::LatModel(Other) => "lat_model_other",
            Attribute::LatTarget(Read) => "lat_target_read",
            Attribute::LatTarget(Write) => "lat_target_write",
            Attribute::LatTarget(Discard) => "lat_target_discard",
            Attribute::LatTarget(Other) => "lat_target_other",
            Attribute::ResetBqStats => "reset_bq_stats",
            Attribute::ResetLatencyModel => "reset_latency_model",
        }
    }

    /// True unless the attribute is write-only.
    pub fn is_readable(&self) -> bool {
        !matches!(self, Attribute::ResetBqStats | Attribute::ResetLatencyModel)
    }

    /// True unless the attribute is read-only.
    pub fn is_writable(&self) -> bool {
        !matches!(
            self,
            Attribute::AdiosVersion | Attribute::BatchSizeActualHighest | Attribute::LatModel(_)
        )
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Attribute {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Attribute::ALL
            .into_iter()
            .find(|attr| attr.name() == s)
            .ok_or_else(|| SchedError::UnknownAttribute {
                name: s.to_string(),
            })
    }
}

fn parse_value<T: FromStr>(attr: Attribute, value: &str) -> SchedResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SchedError::InvalidAttributeValue {
            name: attr.name(),
            value: value.to_string(),
        })
}

fn parse_trigger(attr: Attribute, value: &str) -> SchedResult<()> {
    match parse_value::<u64>(attr, value)? {
        1 => Ok(()),
        _ => Err(SchedError::InvalidAttributeValue {
            name: attr.name(),
            value: value.to_string(),
        }),
    }
}

/// Renders the current value of `attr`.
pub fn show(scheduler: &Scheduler, attr: Attribute) -> SchedResult<String> {
    let text = match attr {
        Attribute::AdiosVersion => format!("{}\n", ADIOS_VERSION),
        Attribute::BatchSizeActualHighest => {
            let highest = scheduler.batch_size_actual_highest();
            format!(
                "Read   : {}\nWrite  : {}\nDiscard: {}\nOther  : {}\n",
                highest.read, highest.write, highest.discard, highest.other
            )
        }
        Attribute::BqRefillBelowRatio => format!("{}\n", scheduler.refill_below_ratio()),
        Attribute::GlobalLatencyWindow => format!("{}\n", scheduler.global_latency_window()),
        Attribute::BatchSizeLimit(category) => {
            format!("{}\n", scheduler.batch_size_limit(category))
        }
        Attribute::LatModel(category) => scheduler.model_params(category).to_string(),
        Attribute::LatTarget(category) => format!("{}\n", scheduler.latency_target(category)),
        Attribute::ResetBqStats | Attribute::ResetLatencyModel => {
            return Err(SchedError::AttributeNotReadable { name: attr.name() })
        }
    };
    Ok(text)
}

/// Parses `value` and applies it to `attr`.
pub fn store(scheduler: &Scheduler, attr: Attribute, value: &str) -> SchedResult<()> {
    match attr {
        Attribute::BqRefillBelowRatio => {
            scheduler.set_refill_below_ratio(parse_value(attr, value)?)
        }
        Attribute::GlobalLatencyWindow => {
            scheduler.set_global_latency_window(parse_value(attr, value)?);
            Ok(())
        }
        Attribute::BatchSizeLimit(category) => {
            scheduler.set_batch_size_limit(category, parse_value(attr, value)?)
        }
        Attribute::LatTarget(category) => {
            scheduler.set_latency_target(category, parse_value(attr, value)?);
            Ok(())
        }
        Attribute::ResetBqStats => {
            parse_trigger(attr, value)?;
            scheduler.reset_batch_stats();
            Ok(())
        }
        Attribute::ResetLatencyModel => {
            parse_trigger(attr, value)?;
            scheduler.reset_latency_models();
            Ok(())
        }
        Attribute::AdiosVersion | Attribute::BatchSizeActualHighest | Attribute::LatModel(_) => {
            Err(SchedError::AttributeNotWritable { name: attr.name() })
        }
    }
}

impl Scheduler {
    /// Renders the attribute called `name`.
    pub fn show_attr(&self, name: &str) -> SchedResult<String> {
        show(self, name.parse()?)
    }

    /// Writes `value` to the attribute called `name`.
    pub fn store_attr(&self, name: &str, value: &str) -> SchedResult<()> {
        store(self, name.parse()?, value)
    }
}
