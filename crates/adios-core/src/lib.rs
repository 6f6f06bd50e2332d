#![warn(missing_docs)]

//! ADIOS core: adaptive deadline I/O scheduling
//!
//! This crate orders pending block I/O operations by deadline, learns a
//! per-category latency model online from completions, and releases work in
//! double-buffered batches bounded by a global budget on predicted in-flight
//! latency. A head-of-line priority lane bypasses all of it.

pub mod attrs;
pub mod batch;
pub mod category;
pub mod config;
pub mod deadline;
pub mod dispatcher;
pub mod error;
pub mod latency_model;
pub mod operation;
pub mod refresh;
pub mod scheduler;
pub mod stats;

pub use attrs::Attribute;
pub use batch::{BatchPage, BatchPlanner, FillLimits, FillReport, NUM_BQ_PAGES};
pub use category::{OpCategory, PerCategory, NUM_CATEGORIES};
pub use config::{SchedulerConfig, Tunables};
pub use deadline::{DeadlineIndex, DeadlineKey};
pub use dispatcher::{DispatchContext, DispatchSource, Dispatcher, PriorityLane};
pub use error::{SchedError, SchedResult};
pub use latency_model::{LatencyModel, LatencyModelParams, ModelUpdate, SampleDisposition};
pub use operation::{MetadataTable, OpMeta, OpRequest, OperationId, Placement};
pub use refresh::{RefreshTimer, RefreshWorker};
pub use scheduler::{Admission, DispatchedOp, Scheduler, ADIOS_VERSION};
pub use stats::{SchedStats, SchedulerSnapshot};
