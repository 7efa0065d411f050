//! CLI Entry Point for the gantry
//!
//! Provides command-line access to the motion core:
//! - Listing serial ports and converting cell ids offline
//! - Homing, moving to cells and emergency stop against real hardware
//! - The same against an in-process simulated controller (`--simulate`)
//!
//! # Usage
//!
//! ```bash
//! gantry cell H8
//! gantry --port /dev/ttyUSB0 move A1 H8 E4
//! gantry --simulate monitor --seconds 5
//! ```
//!
//! Ctrl+C during `home` or `move` triggers an emergency stop.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gantry_motion::config::{GantryConfig, DEFAULT_CONFIG_PATH};
use gantry_motion::hardware::{self, MockGrbl, PortOpener, SerialPortOpener};
use gantry_motion::logging::{self, OutputFormat, TracingConfig};
use gantry_motion::{MotionOrchestrator, StatusPoller};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "Move a GRBL gantry to board cells", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port, overriding the configuration
    #[arg(long, global = true)]
    port: Option<String>,

    /// Use the simulated controller instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports on this host
    Ports,

    /// Show the physical center of a cell (no hardware)
    Cell {
        /// Cell id, e.g. A1
        id: String,
    },

    /// Connect and print the controller status
    Status {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Connect and run the homing cycle
    Home,

    /// Home, then visit each cell in order
    Move {
        /// Cell ids, e.g. A1 H8
        #[arg(required = true)]
        cells: Vec<String>,
    },

    /// Connect and send a feed hold
    Estop,

    /// Connect and print state changes while polling status
    Monitor {
        /// How long to watch
        #[arg(long, default_value = "10")]
        seconds: u64,

        /// Poll interval in milliseconds, overriding `motion.poll_interval`
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = GantryConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(port) = &cli.port {
        config.serial.port = port.clone();
    }
    config.validate().map_err(anyhow::Error::msg)?;

    let level = logging::parse_log_level(&config.application.log_level).map_err(anyhow::Error::msg)?;
    logging::init(TracingConfig::new(level).with_format(cli.log_format)).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Cell { id } => show_cell(&config, &id),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Status { json } => {
            let gantry = connect(&config, cli.simulate).await?;
            let snapshot = gantry.refresh_status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("{}", snapshot);
            }
            gantry.disconnect().await;
            Ok(())
        }
        Commands::Home => {
            let gantry = connect(&config, cli.simulate).await?;
            until_ctrl_c(&gantry, async {
                let home = gantry.home().await?;
                println!("Homed at {}", home);
                Ok(())
            })
            .await?;
            gantry.disconnect().await;
            Ok(())
        }
        Commands::Move { cells } => {
            let gantry = connect(&config, cli.simulate).await?;
            until_ctrl_c(&gantry, async {
                gantry.home().await?;
                for cell in &cells {
                    let position = gantry.move_to_cell(cell).await?;
                    println!("{} -> {}", cell.to_uppercase(), position);
                }
                Ok(())
            })
            .await?;
            println!("{}", gantry.get_status());
            gantry.disconnect().await;
            Ok(())
        }
        Commands::Estop => {
            let gantry = connect(&config, cli.simulate).await?;
            gantry.emergency_stop().await?;
            println!("{}", gantry.get_status());
            Ok(())
        }
        Commands::Monitor {
            seconds,
            interval_ms,
        } => {
            let interval = interval_ms
                .map(Duration::from_millis)
                .or(config.motion.poll_interval)
                .unwrap_or(DEFAULT_MONITOR_INTERVAL);
            let gantry = Arc::new(connect(&config, cli.simulate).await?);
            monitor(gantry, Duration::from_secs(seconds), interval).await
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = hardware::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

fn show_cell(config: &GantryConfig, id: &str) -> Result<()> {
    let transformer = gantry_motion::CoordinateTransformer::new(config.coordinate_frame()?);
    let cell = transformer.parse_cell_id(id)?;
    let position = transformer.to_physical(cell);
    let envelope = gantry_motion::TravelEnvelope::new(
        config.envelope.x_min,
        config.envelope.x_max,
        config.envelope.y_min,
        config.envelope.y_max,
    )?;
    let reachable = if envelope.contains(position) {
        "inside envelope"
    } else {
        "OUTSIDE envelope"
    };
    println!("{} -> {} ({})", cell, position, reachable);
    Ok(())
}

async fn connect(config: &GantryConfig, simulate: bool) -> Result<MotionOrchestrator> {
    let opener: Arc<dyn PortOpener> = if simulate {
        Arc::new(MockGrbl::new().with_motion_time(Duration::from_millis(200)))
    } else {
        Arc::new(SerialPortOpener)
    };
    let gantry = config.build_orchestrator(opener)?;
    gantry
        .connect(&config.serial.port, config.serial.baud_rate)
        .await
        .with_context(|| format!("Could not connect to {}", config.serial.port))?;
    Ok(gantry)
}

/// Run `work`, sending an emergency stop if Ctrl+C arrives first.
async fn until_ctrl_c<F>(gantry: &MotionOrchestrator, work: F) -> Result<()>
where
    F: std::future::Future<Output = gantry_motion::AppResult<()>>,
{
    tokio::select! {
        result = work => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            gantry.emergency_stop().await?;
            anyhow::bail!("Interrupted by Ctrl+C; machine in {}", gantry.get_status().status)
        }
    }
}

async fn monitor(gantry: Arc<MotionOrchestrator>, duration: Duration, interval: Duration) -> Result<()> {
    let mut updates = gantry.subscribe();
    let _poller = StatusPoller::spawn(gantry.clone(), interval);
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    println!("{}", gantry.get_status());
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", *updates.borrow_and_update());
            }
        }
    }
    gantry.disconnect().await;
    Ok(())
}
