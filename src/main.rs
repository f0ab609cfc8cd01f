//! hapd - HomeKit accessory server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hap_core::{Config, PairingEvent};
use hap_pairing::{FileStorage, IdentityStore};
use hap_server::{AccessoryDatabase, MemoryAccessories, Server};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments. Values given here override the config file.
#[derive(Parser, Debug)]
#[command(name = "hapd", version, about = "HomeKit accessory server")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Setup code, `XXXXXXXX` or `XXX-XX-XXX`
    #[arg(long)]
    pin: Option<String>,

    /// TCP port (0 picks a free one)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory for the accessory identity and pairings
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(pin) = &cli.pin {
        config.accessory.setup_code = pin.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(storage) = &cli.storage {
        config.accessory.storage_path = Some(storage.clone());
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn setup_logging(config: &Config) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));

    let Some(path) = &config.logging.file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
        return Ok(None);
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .init();
    Ok(Some(guard))
}

fn load_database(config: &Config) -> Result<Arc<dyn AccessoryDatabase>> {
    match &config.accessory.accessories_file {
        Some(path) => {
            let db = MemoryAccessories::from_file(path)
                .with_context(|| format!("failed to load accessories {}", path.display()))?;
            Ok(Arc::new(db))
        }
        None => Ok(Arc::new(MemoryAccessories::lightbulb(&config.accessory.name))),
    }
}

/// Log pairing changes; the paired flag is what an advertiser publishes.
async fn watch_pairings(store: Arc<IdentityStore>) {
    let mut events = store.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let paired = store.is_paired();
                match &event {
                    PairingEvent::DevicePaired { controller_id } => {
                        info!(controller = %controller_id, paired, "controller paired");
                    }
                    PairingEvent::DeviceUnpaired { controller_id } => {
                        info!(controller = %controller_id, paired, "controller unpaired");
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "pairing events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let _guard = setup_logging(&config)?;

    let storage_path = config.storage_path();
    let storage = FileStorage::open(&storage_path)
        .with_context(|| format!("failed to open storage {}", storage_path.display()))?;
    let store = Arc::new(
        IdentityStore::load_or_create(Arc::new(storage))
            .context("failed to load accessory identity")?,
    );
    info!(
        name = %config.accessory.name,
        identifier = %store.identifier(),
        category = config.accessory.category,
        paired = store.is_paired(),
        "starting accessory"
    );

    let database = load_database(&config)?;
    let server = Server::bind(&config, store.clone(), database)
        .await
        .context("failed to start server")?;
    info!(addr = %server.local_addr()?, "ready for controllers");

    tokio::spawn(watch_pairings(store));

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        })
        .await?;
    Ok(())
}
