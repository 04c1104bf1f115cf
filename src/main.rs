//! seano-ingest service entry point

use clap::{Parser, Subcommand};
use seano_ingest::config::PipelineConfig;
use seano_ingest::observability::init_default_logging;
use seano_ingest::store::{EntityStore, InMemoryStore, PostgresStore, TelemetryStore};
use seano_ingest::{MqttSubscriber, Pipeline};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["seano-ingest.toml", "config/seano-ingest.toml"];

/// Telemetry ingestion pipeline
#[derive(Parser)]
#[command(name = "seano-ingest")]
#[command(about = "MQTT telemetry ingestion with live websocket broadcast")]
#[command(version)]
struct Cli {
    /// Configuration file path. Without one, default locations are tried and
    /// then the MQTT_* environment variables.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until SIGINT or SIGTERM
    Run {
        /// Keep everything in memory instead of connecting to Postgres
        #[arg(long)]
        in_memory: bool,

        /// Vehicle codes to register in the in-memory store, ids assigned from 1
        #[arg(long = "vehicle", value_name = "CODE", requires = "in_memory")]
        vehicles: Vec<String>,
    },
    /// Validate configuration
    Config {
        /// Print the effective configuration as TOML
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env: {e}");
        }
    }

    let cli = Cli::parse();
    init_default_logging();

    info!("Starting seano-ingest v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            in_memory,
            vehicles,
        } => run_pipeline(config, in_memory, vehicles).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(path: Option<&Path>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(PipelineConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(PipelineConfig::load_from_file(path)?);
        }
    }

    info!("No configuration file found, using environment variables");
    Ok(PipelineConfig::from_env()?)
}

type Stores = (Arc<dyn EntityStore>, Arc<dyn TelemetryStore>);

async fn build_stores(
    config: &PipelineConfig,
    in_memory: bool,
    vehicles: &[String],
) -> Result<Stores, Box<dyn std::error::Error>> {
    if in_memory {
        warn!("Using in-memory store; nothing will be persisted");
        let store = InMemoryStore::new();
        for (index, code) in vehicles.iter().enumerate() {
            store.add_vehicle(index as i64 + 1, code);
        }
        return Ok((Arc::new(store.clone()), Arc::new(store)));
    }

    let url = config.database.url()?;
    let store = PostgresStore::connect(&url, config.database.max_pool_size)?;
    store.ping().await?;
    info!("Database connection verified");
    Ok((Arc::new(store.clone()), Arc::new(store)))
}

async fn run_pipeline(
    config: PipelineConfig,
    in_memory: bool,
    vehicles: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (entities, store) = build_stores(&config, in_memory, &vehicles).await?;
    let transport = MqttSubscriber::new(config.mqtt.clone());

    let pipeline = Pipeline::start(&config, transport, entities, store)?;
    if let Some(addr) = pipeline.local_addr() {
        info!(%addr, "Observers can connect at ws://{}/ws", addr);
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Pipeline is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    pipeline.shutdown().await;
    Ok(())
}

fn handle_config_command(
    config: &PipelineConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        println!("{}", config.to_toml()?);
    }
    Ok(())
}
