#![warn(missing_docs)]

//! ADIOS simulator: drives the scheduler with a seeded synthetic workload
//! against a modeled block device in virtual time.

pub mod cli;
pub mod config;
pub mod device;
pub mod runner;
pub mod workload;

pub use config::SimConfig;
pub use device::{DeviceCompletion, DeviceConfig, ServiceCost, SimDevice};
pub use runner::{CategoryReport, SimReport, Simulation};
pub use workload::{GeneratedOp, SizeRange, WorkloadConfig, WorkloadGenerator};
