//! CLI entry point for labstation.
//!
//! Brings up the supervisory station from a TOML configuration: one tab per
//! enabled device, each with its own worker and scheduler, then runs until
//! interrupted. `validate` checks a configuration without touching any
//! hardware.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;

use labstation::config::Settings;
use labstation::drivers::DriverRegistry;
use labstation::logging;
use labstation::messages::StationCommand;
use labstation::station::Station;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "labstation")]
#[command(about = "Supervisory laboratory instrument-control station", long_about = None)]
struct Cli {
    /// Path to the configuration file (default: labstation.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring up all enabled devices and run until interrupted
    Run,

    /// Load and validate the configuration, then list the devices
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        settings.application.log_level = level;
    }

    match cli.command {
        Commands::Run => run(settings).await,
        Commands::Validate => validate(settings),
    }
}

async fn run(settings: Settings) -> Result<()> {
    logging::init(&settings.application)?;
    info!(name = %settings.application.name, "starting station");

    let registry = Arc::new(DriverRegistry::with_builtin());
    let (command_tx, command_rx) = mpsc::channel(32);
    let station = Station::new(settings, registry);
    let station_task = tokio::spawn(station.run(command_rx));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    let (cmd, done) = StationCommand::shutdown();
    if command_tx.send(cmd).await.is_ok() {
        let _ = done.await;
    }
    let _ = station_task.await;
    Ok(())
}

fn validate(settings: Settings) -> Result<()> {
    let registry = DriverRegistry::with_builtin();
    let mut problems = 0usize;

    println!("devices:");
    for device in &settings.devices {
        let status = match registry.build(device) {
            Ok(_) => if device.enabled { "ok" } else { "disabled" },
            Err(e) => {
                problems += 1;
                println!("  {} ({}): ERROR {}", device.name, device.r#type, e);
                continue;
            }
        };
        println!("  {} ({}): {}", device.name, device.r#type, status);
    }

    if problems > 0 {
        anyhow::bail!("{} device definition(s) failed to validate", problems);
    }
    println!(
        "liveness: poll {:?}, threshold {:?}",
        settings.liveness.poll_interval, settings.liveness.threshold
    );
    Ok(())
}
