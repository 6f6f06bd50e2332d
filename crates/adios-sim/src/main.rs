#![warn(missing_docs)]

//! `adios-sim` binary.

use adios_sim::cli::Cli;
use adios_sim::Simulation;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    let writes: Vec<(String, String)> = cli
        .attribute_writes()?
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();

    tracing::info!(
        "Running {} operations with seed {}",
        config.workload.operations,
        config.workload.seed
    );

    let report = tokio::task::spawn_blocking(move || -> Result<_> {
        let simulation = Simulation::new(config)?;
        for (name, value) in &writes {
            simulation.scheduler().store_attr(name, value)?;
        }
        simulation.run()
    })
    .await??;

    let json = if cli.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", json);
    Ok(())
}
