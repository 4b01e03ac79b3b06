// src/main.rs - roof-host command line
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use rolloff_rs::config::{self, Config};
use rolloff_rs::{
    ByteChannel, DomeCapability, MoveOutcome, ParkState, RoofStatus, SerialChannel, Session,
    SimulatedController,
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const DEFAULT_CONFIG: &str = "roof.toml";

/// Roll-off roof controller host
#[derive(Parser, Debug)]
#[command(name = "roof-host", about = "Drive a roll-off roof controller over a serial line.")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Talk to the built-in simulated controller instead of the serial port
    #[arg(long)]
    simulate: bool,

    /// Log every frame exchanged with the controller
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the roof until interrupted
    Monitor,
    /// Print the current roof status as JSON
    Status,
    /// Open the roof and wait for the opened limit switch
    Open,
    /// Close the roof and wait for the closed limit switch
    Close,
    /// Stop any roof motion
    Abort,
    /// Engage or release the roof lock
    Lock { state: Switch },
    /// Switch the auxiliary output
    Aux { state: Switch },
    /// Switch one of the controller's action slots (numbered from 1)
    Action { slot: usize, state: Switch },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn is_on(self) -> bool {
        matches!(self, Switch::On)
    }
}

#[derive(Serialize)]
struct StatusReport {
    #[serde(flatten)]
    roof: RoofStatus,
    park: ParkState,
    actions: Vec<ActionReport>,
}

#[derive(Serialize)]
struct ActionReport {
    slot: usize,
    label: String,
    enabled: bool,
    active: bool,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    let config = load(&cli)?;

    if cli.simulate || config.simulation {
        tracing::info!("Running against the simulated roof controller");
        let sim = &config.simulator;
        let channel = SimulatedController::new(
            sim.version.clone(),
            sim.action_count,
            Duration::from_secs(sim.travel_secs),
        );
        execute(&config, channel, cli.command).await
    } else {
        let channel = SerialChannel::open(&config.serial.port, config.serial.baud).map_err(|e| {
            tracing::error!("Failed to open serial port '{}': {}", config.serial.port, e);
            Box::new(e) as BoxError
        })?;
        execute(&config, channel, cli.command).await
    }
}

fn load(cli: &Cli) -> Result<Config, BoxError> {
    match &cli.config {
        Some(path) => {
            let path = path.to_string_lossy();
            tracing::info!("Loading configuration from: {}", path);
            Ok(config::load_config(&path)?)
        }
        None if std::path::Path::new(DEFAULT_CONFIG).exists() => {
            tracing::info!("Loading configuration from: {}", DEFAULT_CONFIG);
            Ok(config::load_config(DEFAULT_CONFIG)?)
        }
        None => {
            tracing::info!("No {} found, using default configuration", DEFAULT_CONFIG);
            Ok(Config::default())
        }
    }
}

async fn execute<C: ByteChannel>(config: &Config, channel: C, command: Command) -> Result<(), BoxError> {
    let mut session = Session::new(config, channel)?;
    session.connect().await?;

    match command {
        Command::Monitor => {
            session
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Unable to listen for shutdown signal: {}", e);
                    }
                })
                .await?;
        }
        Command::Status => {
            let roof = session.poll(tokio::time::Instant::now()).await.status;
            let report = StatusReport {
                roof,
                park: session.park_state(),
                actions: session
                    .actions()
                    .slots()
                    .iter()
                    .take(session.actions().available())
                    .map(|slot| ActionReport {
                        slot: slot.index() + 1,
                        label: slot.label().to_string(),
                        enabled: slot.enabled(),
                        active: slot.active(),
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Open => {
            if session.unpark().await? == MoveOutcome::Started {
                if let Some(event) = session.wait_for_motion().await? {
                    tracing::info!("Roof motion finished: {:?}", event);
                }
            }
        }
        Command::Close => {
            if session.park().await? == MoveOutcome::Started {
                if let Some(event) = session.wait_for_motion().await? {
                    tracing::info!("Roof motion finished: {:?}", event);
                }
            }
        }
        Command::Abort => {
            let outcome = DomeCapability::abort(&mut session).await?;
            tracing::info!("Abort: {:?}", outcome);
        }
        Command::Lock { state } => {
            session.set_lock(state.is_on()).await?;
        }
        Command::Aux { state } => {
            session.set_aux(state.is_on()).await?;
        }
        Command::Action { slot, state } => {
            if slot == 0 {
                return Err("Action slots are numbered from 1".into());
            }
            session.set_action(slot - 1, state.is_on()).await?;
        }
    }
    Ok(())
}
