//! CLI entry point for lab_devices
//!
//! Drives configured workers outside the experiment-control host, mainly for
//! bench checks and trying configurations against simulated hardware.
//!
//! # Usage
//!
//! ```bash
//! lab_devices --config config/default.toml list
//! LABDEV_APPLICATION__LOG_LEVEL=debug lab_devices config
//! lab_devices read rotators
//! lab_devices program synth '{"dds 0": {"freq": 2.5e9, "amp": -3.0, "gate": true}}'
//! lab_devices snap camera --output frame.json
//! lab_devices shot shots/0001.json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lab_devices::config::Settings;
use lab_devices::registry::{build_all, build_camera_worker, build_worker};
use lab_devices::shot::{JsonShotFile, ShotFile};
use lab_devices::worker::{ChannelValues, DeviceWorker};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "lab_devices")]
#[command(about = "Device workers for experiment control", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured devices
    List,

    /// Print the effective configuration, environment overrides included
    Config,

    /// Initialise a device and print its current values
    Read {
        /// Device name
        device: String,
    },

    /// Initialise a device and apply front-panel values given as JSON
    Program {
        /// Device name
        device: String,
        /// Values, e.g. '{"0": 1200}'
        values: String,
    },

    /// Take a single camera image
    Snap {
        /// Camera device name
        device: String,
        /// Write the frame as JSON here
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run every configured device through one buffered shot
    Shot {
        /// JSON shot file
        shot: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    lab_devices::logging::init_from_config(&settings.application)?;

    match cli.command {
        Commands::List => list(&settings),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
        Commands::Read { device } => read(&settings, &device).await,
        Commands::Program { device, values } => program(&settings, &device, &values).await,
        Commands::Snap { device, output } => snap(&settings, &device, output).await,
        Commands::Shot { shot } => run_shot(&settings, shot).await,
    }
}

fn list(settings: &Settings) -> Result<()> {
    for device in &settings.devices {
        println!(
            "{:<20} {:<16} {}",
            device.name,
            device.r#type.config_key(),
            if device.mock { "mock" } else { "hardware" }
        );
    }
    Ok(())
}

async fn open(settings: &Settings, name: &str) -> Result<Box<dyn DeviceWorker>> {
    let definition = settings.device(name)?;
    let mut worker = build_worker(definition, &settings.application.retry_policy())?;
    worker.init().await?;
    Ok(worker)
}

fn print_values(values: &ChannelValues) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(values)?);
    Ok(())
}

async fn read(settings: &Settings, name: &str) -> Result<()> {
    let mut worker = open(settings, name).await?;
    let result = worker.check_remote_values().await;
    worker.shutdown().await?;
    print_values(&result?)
}

async fn program(settings: &Settings, name: &str, values: &str) -> Result<()> {
    let values: ChannelValues =
        serde_json::from_str(values).context("values must be a JSON object")?;
    let mut worker = open(settings, name).await?;
    let result = worker.program_manual(&values).await;
    worker.shutdown().await?;
    print_values(&result?)
}

async fn snap(settings: &Settings, name: &str, output: Option<PathBuf>) -> Result<()> {
    let mut worker = build_camera_worker(settings.device(name)?)?;
    worker.init().await?;
    let frame = worker.snap().await;
    worker.shutdown().await?;
    let frame = frame?;

    let max = frame.data().iter().copied().max().unwrap_or(0);
    println!("{}x{} frame, max pixel value {}", frame.width(), frame.height(), max);
    if let Some(path) = output {
        tokio::fs::write(&path, serde_json::to_vec(&frame)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "Frame written");
    }
    Ok(())
}

async fn run_shot(settings: &Settings, path: PathBuf) -> Result<()> {
    let shot: Arc<dyn ShotFile> = Arc::new(JsonShotFile::open(&path)?);
    let mut workers = build_all(settings)?;
    for worker in workers.iter_mut() {
        worker.init().await?;
    }

    let mut failures = 0;
    for worker in workers.iter_mut() {
        let name = worker.name().to_string();
        if let Err(e) = worker
            .transition_to_buffered(&name, Arc::clone(&shot), &ChannelValues::new(), true)
            .await
        {
            error!(device = %name, error = %e, "transition_to_buffered failed");
            failures += 1;
            worker.abort_transition_to_buffered().await?;
        }
    }
    for worker in workers.iter_mut() {
        match worker.transition_to_manual().await {
            Ok(true) => {}
            Ok(false) => failures += 1,
            Err(e) => {
                error!(device = %worker.name(), error = %e, "transition_to_manual failed");
                failures += 1;
            }
        }
    }
    for worker in workers.iter_mut() {
        worker.shutdown().await?;
    }

    if failures > 0 {
        anyhow::bail!("{} device(s) failed during the shot", failures);
    }
    println!("Shot {} complete", path.display());
    Ok(())
}
