//! Command-line interface.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;

use crate::config::SimConfig;

/// Command-line arguments of `adios-sim`.
#[derive(Parser, Debug)]
#[command(name = "adios-sim")]
#[command(about = "Replay a synthetic workload through the ADIOS scheduler", long_about = None)]
pub struct Cli {
    /// Simulator configuration file (.toml or .json).
    #[arg(short, long, env = "ADIOS_SIM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of operations to generate.
    #[arg(short = 'n', long)]
    pub operations: Option<u64>,

    /// Workload seed.
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Scheduler attribute to write before the run, as NAME=VALUE.
    #[arg(long = "set", value_name = "NAME=VALUE")]
    pub set: Vec<String>,

    /// Pretty-print the JSON report.
    #[arg(long)]
    pub pretty: bool,
}

impl Cli {
    /// Loads the configuration file, if any, and applies overrides.
    pub fn load_config(&self) -> Result<SimConfig> {
        let mut config = match &self.config {
            Some(path) if path.exists() => SimConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            Some(path) => {
                warn!("Config file not found, using defaults: {}", path.display());
                SimConfig::default()
            }
            None => SimConfig::default(),
        };
        if let Some(operations) = self.operations {
            config.workload.operations = operations;
        }
        if let Some(seed) = self.seed {
            config.workload.seed = seed;
        }
        Ok(config)
    }

    /// Parses the `--set` arguments into name/value pairs.
    pub fn attribute_writes(&self) -> Result<Vec<(&str, &str)>> {
        self.set
            .iter()
            .map(|arg| {
                arg.split_once('=')
                    .with_context(|| format!("expected NAME=VALUE, got {:?}", arg))
            })
            .collect()
    }
}
