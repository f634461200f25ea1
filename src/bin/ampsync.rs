//! Acquisition demo against the simulated amplifier bank
//!
//! Starts acquisition, drains the window buffer in fixed-size slices, optionally writes
//! the samples as raw native-endian f32 and prints the final engine statistics as JSON.
//!
//! ```bash
//! ampsync --serial UB-2008.07.01 --serial UB-2008.07.02 --seconds 5 --output data.bin
//! ```

use ampsync_core::acquisition::AcquisitionEngine;
use ampsync_core::config::{ConfigLoader, DeviceConfigSet, SystemConfig};
use ampsync_core::hal::AmplifierSimulator;
use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_SERIAL: &str = "UB-SIM-0001";
const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Parser)]
#[command(name = "ampsync")]
#[command(about = "Synchronized multi-amplifier acquisition demo", long_about = None)]
struct Cli {
    /// TOML configuration file (defaults to the standard locations)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device serial; repeat for several devices, the first one is the master
    #[arg(long = "serial")]
    serials: Vec<String>,

    /// Acquisition duration in seconds
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// Write samples to this file as raw native-endian f32
    #[arg(long)]
    output: Option<PathBuf>,

    /// Scans drained from the buffer per read
    #[arg(long, default_value_t = 512)]
    scans_per_read: usize,

    /// Deliver simulated transfers in real time
    #[arg(long, conflicts_with = "unpaced")]
    paced: bool,

    /// Deliver simulated transfers as fast as possible
    #[arg(long)]
    unpaced: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let summary = config.summary();
    info!(
        devices = summary.device_count,
        channels = summary.total_channels,
        queue_depth = summary.queue_depth,
        "configuration ready"
    );

    let mut simulator = config.simulator.clone().unwrap_or_default();
    if cli.paced {
        simulator.paced = true;
    } else if cli.unpaced {
        simulator.paced = false;
    }

    let driver = Arc::new(AmplifierSimulator::new(simulator));
    let engine = AcquisitionEngine::new(driver, config.acquisition.clone());
    engine
        .start_acquisition(&config.devices)
        .context("failed to start acquisition")?;

    let mut output = match &cli.output {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => None,
    };

    let slice = cli.scans_per_read.max(1) * engine.total_channels();
    let deadline = Instant::now() + Duration::from_secs(cli.seconds);
    let mut samples_written = 0usize;

    while Instant::now() < deadline && engine.is_running() {
        if engine.buffered_len() < slice {
            thread::sleep(IDLE_POLL);
            continue;
        }

        let data = engine.read_data(slice);
        if let Some(writer) = output.as_mut() {
            for value in &data {
                writer.write_all(&value.to_ne_bytes())?;
            }
        }
        samples_written += data.len();
    }

    if let Some(mut writer) = output {
        writer.flush()?;
    }

    let failure = engine.last_error();
    engine.stop_acquisition();

    let stats = engine.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    info!(samples_written, "acquisition finished");

    match failure {
        Some(e) => {
            warn!(error = %e, "acquisition ended with an error");
            Err(e.into())
        }
        None => Ok(()),
    }
}

fn load_config(cli: &Cli) -> Result<SystemConfig> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_paths(vec![path.clone()]),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load_system_config().context("failed to load configuration")?;

    if !cli.serials.is_empty() {
        config.devices = DeviceConfigSet::with_defaults(&cli.serials);
    } else if config.devices.is_empty() {
        config.devices = DeviceConfigSet::with_defaults(&[DEFAULT_SERIAL]);
    }
    Ok(config)
}
