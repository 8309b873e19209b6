//! CLI entry point for rt-correlator
//!
//! # Usage
//!
//! Run the pipeline on a synthetic feed:
//! ```bash
//! rt-correlator simulate --config config/correlator.toml --cycles 8 --delay-samples 2
//! ```
//!
//! Validate a configuration file:
//! ```bash
//! rt-correlator check-config --config config/correlator.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rt_correlator::config::CorrelatorConfig;
use rt_correlator::logging;
use rt_correlator::simulate::{self, SimulationOptions};
use rt_correlator::sink::{NullSink, ZeroGeometry};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "rt-correlator")]
#[command(about = "Real-time correlator core for a small interferometric array", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline on a synthetic common-noise feed
    Simulate {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Integration cycles per beam
        #[arg(long, default_value = "4")]
        cycles: usize,

        /// Integer sample lag added per antenna index
        #[arg(long, default_value = "0")]
        delay_samples: i64,

        /// Residual delay in seconds added per antenna index
        #[arg(long, default_value = "0.0")]
        residual_delay: f64,

        /// Seed of the noise source
        #[arg(long, default_value = "24301")]
        seed: u64,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file (TOML)
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            cycles,
            delay_samples,
            residual_delay,
            seed,
        } => run_simulation(
            config.as_deref(),
            SimulationOptions {
                cycles,
                delay_samples,
                residual_delay_s: residual_delay,
                seed,
            },
        ),
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn load(path: Option<&Path>) -> Result<CorrelatorConfig> {
    let config = match path {
        Some(path) => CorrelatorConfig::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => CorrelatorConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn run_simulation(path: Option<&Path>, options: SimulationOptions) -> Result<()> {
    let config = load(path)?;
    logging::init_from_config(&config)?;
    info!(config = ?path, "Configuration loaded");

    let history_path = config.history_path();
    let report = simulate::run(config, options, Box::new(NullSink), Box::new(ZeroGeometry))?;

    println!("frames delivered:   {}", report.delivered);
    println!("exhausted retries:  {}", report.exhausted);
    println!("sets correlated:    {}", report.pipeline.correlator.sets_correlated);
    println!("records written:    {}", report.pipeline.writer.written);
    println!("quarantined:        {}", report.pipeline.faults.len());
    println!("history table:      {}", history_path.display());
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = load(Some(path))?;
    let dims = config.pool_dimensions();
    println!("{} is valid", path.display());
    println!(
        "  {} antennas, {} channels, {} beams, {} baselines",
        dims.antennas,
        dims.channels,
        dims.beams,
        config.baseline_count()
    );
    println!("  pool capacity {} × {} samples", dims.capacity(), dims.samples_per_buffer);
    println!("  delay mode {:?}", config.delay.mode);
    Ok(())
}
