//! Simulator configuration file.

use std::path::Path;

use adios_core::SchedulerConfig;
use serde::{Deserialize, Serialize};

use crate::device::DeviceConfig;
use crate::workload::WorkloadConfig;

/// Full simulator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Scheduler construction parameters.
    pub scheduler: SchedulerConfig,
    /// Synthetic workload shape.
    pub workload: WorkloadConfig,
    /// Simulated device.
    pub device: DeviceConfig,
}

impl SimConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SimConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.scheduler.validate()?;
        Ok(config)
    }
}
