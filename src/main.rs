//! Elohim Connect CLI
//!
//! Diagnostics and manual sync against a conductor, using the same
//! connection stack as the clients.
//!
//! ## Usage
//!
//! ```bash
//! # Connection status (connects, prints diagnostics, disconnects)
//! elohim-connect status
//!
//! # Through a doorway
//! elohim-connect --mode doorway --doorway-url https://doorway.elohim.host --api-key $KEY status
//!
//! # One zome call
//! elohim-connect call lamad content_store get_content '{"id":"manifesto"}'
//!
//! # Cache-friendly read (HTTP in doorway mode)
//! elohim-connect call --read lamad content_store get_content '{"id":"manifesto"}'
//!
//! # Inspect / drain queued offline operations and persisted writes
//! elohim-connect queue
//! elohim-connect sync
//!
//! # Is the doorway up?
//! elohim-connect --mode doorway --doorway-url https://doorway.elohim.host probe
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use elohim_connect::conductor::{strategy_for, ConnectionManager, HttpReader};
use elohim_connect::{
    BufferedWriter, Config, ConnectionMode, KeyValueStore, OfflineQueue, SledStore, ZomeCaller,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "elohim-connect")]
#[command(about = "Conductor connection diagnostics and offline sync for Elohim clients")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "ELOHIM_CONFIG")]
    config: Option<PathBuf>,

    /// Connection mode: direct or doorway
    #[arg(long, env = "ELOHIM_MODE")]
    mode: Option<String>,

    /// Conductor admin WebSocket URL (direct mode)
    #[arg(long, env = "ELOHIM_ADMIN_URL")]
    admin_url: Option<String>,

    /// Doorway base URL (doorway mode)
    #[arg(long, env = "ELOHIM_DOORWAY_URL")]
    doorway_url: Option<String>,

    /// Doorway API key
    #[arg(long, env = "ELOHIM_API_KEY")]
    api_key: Option<String>,

    /// Installed app ID
    #[arg(long, env = "ELOHIM_APP_ID")]
    app_id: Option<String>,

    /// Directory for credentials and queued writes
    #[arg(long, env = "ELOHIM_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print connection diagnostics
    Status,

    /// Make one zome call and print the result as JSON
    Call {
        role: String,
        zome: String,
        function: String,
        /// JSON payload
        #[arg(default_value = "null")]
        payload: String,
        /// Side-effect-free call; uses the HTTP cache path when available
        #[arg(long)]
        read: bool,
    },

    /// List queued offline operations and persisted writes
    Queue,

    /// Connect and replay queued offline operations and persisted writes
    Sync,

    /// Check that the doorway answers its health endpoint
    Probe,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("elohim_connect=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Command::Status => status(&config).await,
        Command::Call {
            role,
            zome,
            function,
            payload,
            read,
        } => call(&config, &role, &zome, &function, &payload, read).await,
        Command::Queue => queue(&config).await,
        Command::Sync => sync(&config).await,
        Command::Probe => probe(&config).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(mode) = &args.mode {
        config.connection.mode = match mode.as_str() {
            "direct" => ConnectionMode::Direct,
            "doorway" => ConnectionMode::Doorway,
            other => bail!("Unknown mode '{}', expected direct or doorway", other),
        };
    }
    if let Some(url) = &args.admin_url {
        config.connection.admin_url = url.clone();
    }
    if let Some(url) = &args.doorway_url {
        config.connection.doorway_url = Some(url.clone());
    }
    if let Some(key) = &args.api_key {
        config.connection.doorway_api_key = Some(key.clone());
    }
    if let Some(app_id) = &args.app_id {
        config.connection.app_id = app_id.clone();
    }
    if let Some(dir) = &args.storage_dir {
        config.storage.dir = dir.clone();
    }

    Ok(config)
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    std::fs::create_dir_all(&config.storage.dir).with_context(|| {
        format!("Failed to create storage directory {}", config.storage.dir.display())
    })?;
    Ok(Arc::new(SledStore::open(config.storage.db_path())?))
}

async fn connect(config: &Config, store: Arc<dyn KeyValueStore>) -> anyhow::Result<Arc<ConnectionManager>> {
    let manager = ConnectionManager::from_config(config, store)?;
    manager.connect().await.context("Failed to connect to conductor")?;
    Ok(manager)
}

async fn status(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let manager = ConnectionManager::from_config(config, store)?;

    if let Err(e) = manager.connect().await {
        warn!(error = %e, "Connect failed");
    }
    println!("{}", serde_json::to_string_pretty(&manager.display_info())?);
    manager.disconnect().await;
    Ok(())
}

async fn call(
    config: &Config,
    role: &str,
    zome: &str,
    function: &str,
    payload: &str,
    read: bool,
) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let manager = connect(config, open_store(config)?).await?;
    let result = if read {
        manager.call_read(role, zome, function, &payload).await
    } else {
        manager.call(role, zome, function, &payload).await
    };
    manager.disconnect().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn queue(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let manager = ConnectionManager::from_config(config, Arc::clone(&store))?;
    let caller: Arc<dyn ZomeCaller> = manager;

    let offline = OfflineQueue::new(Arc::clone(&caller), Arc::clone(&store), config.offline_queue.clone());
    let writer = BufferedWriter::from_section(caller, store, &config.write_buffer);
    let restored = writer.restore_persisted().await?;

    println!("{}", serde_json::to_string_pretty(&offline.get_stats())?);
    for op in offline.operations() {
        println!(
            "{}  {:?}  {}.{}.{}  retries {}/{}  {}",
            op.id,
            op.kind,
            op.target.role_name,
            op.target.zome_name,
            op.target.fn_name,
            op.retry_count,
            op.max_retries,
            op.description.as_deref().unwrap_or("")
        );
    }
    println!("persisted writes: {}", restored);

    // Listing must not consume the persisted writes
    writer.persist_pending().await?;
    Ok(())
}

async fn sync(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let manager = connect(config, Arc::clone(&store)).await?;
    let caller: Arc<dyn ZomeCaller> = Arc::clone(&manager) as Arc<dyn ZomeCaller>;

    let offline = OfflineQueue::new(Arc::clone(&caller), Arc::clone(&store), config.offline_queue.clone());
    let report = offline.sync_all().await;
    info!(succeeded = report.succeeded, failed = report.failed, "Offline queue synced");

    let writer = BufferedWriter::from_section(caller, store, &config.write_buffer);
    writer.restore_persisted().await?;
    let flushed = writer.flush_all().await;
    let remaining = writer.persist_pending().await?;

    manager.disconnect().await;

    println!(
        "offline: {} synced, {} failed, {} queued | writes: {} committed, {} failed, {} queued",
        report.succeeded,
        report.failed,
        offline.len(),
        flushed.committed,
        flushed.failed,
        remaining
    );
    Ok(())
}

async fn probe(config: &Config) -> anyhow::Result<()> {
    let strategy = strategy_for(&config.connection)?;
    let Some(base) = strategy.http_base_url() else {
        bail!("Probe needs doorway mode");
    };

    let reader = HttpReader::new(base.clone(), config.connection.doorway_api_key.clone())?;
    reader.probe().await?;
    println!("{} is healthy", base);
    Ok(())
}
