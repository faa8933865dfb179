//! memvault - Local-first encrypted memory vault
//!
//! Command-line front end: vault lifecycle, memory CRUD, maintenance, sync,
//! and the HTTP server.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use memvault::{
    api::{build_app, AppState},
    config::VaultConfig,
    index::{ListFilter, MemoryId, MemoryPatch},
    ingest::{parse_tags, NewMemory},
    service::VaultService,
    sync::{DirectoryNetwork, SyncEngine},
    vault::{Vault, KEY_FILE},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "memvault")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Local-first encrypted memory vault")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MEMVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Vault passphrase
    #[arg(long, env = "MEMVAULT_PASSPHRASE", hide_env_values = true, global = true)]
    passphrase: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault, or join an existing one from its key file
    Init {
        /// Key file (vault.key) of the vault to join
        #[arg(long)]
        join: Option<PathBuf>,
    },

    /// Serve the HTTP API
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },

    /// Add a memory from a media file
    Add {
        /// Media file
        file: PathBuf,

        /// Title
        #[arg(short, long)]
        title: String,

        /// Comma-separated tags
        #[arg(long, default_value = "")]
        tags: String,

        /// Media type (inferred from the file name when omitted)
        #[arg(long)]
        media_type: Option<String>,
    },

    /// List memories, newest first
    List {
        /// Only memories carrying any of these comma-separated tags
        #[arg(long)]
        tags: Option<String>,
    },

    /// Show a memory, optionally writing its media to a file
    Get {
        id: String,

        /// Write decrypted media here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Edit a memory's title, tags or transcription
    Edit {
        id: String,

        #[arg(long)]
        title: Option<String>,

        /// Replace tags (comma-separated)
        #[arg(long)]
        tags: Option<String>,

        /// Replace the transcription; an empty value removes it
        #[arg(long)]
        transcription: Option<String>,

        /// Drop recorded conflicts
        #[arg(long)]
        clear_conflicts: bool,

        /// Version the edit is based on (defaults to the current one)
        #[arg(long)]
        expected_version: Option<u64>,
    },

    /// Delete a memory
    Delete { id: String },

    /// Reclaim orphaned blob references
    Sweep,

    /// Change the vault passphrase
    Rotate {
        /// New passphrase
        #[arg(long, env = "MEMVAULT_NEW_PASSPHRASE", hide_env_values = true)]
        new_passphrase: String,
    },

    /// Run one sync cycle against the shared network
    Sync {
        /// Shared network directory (overrides configuration)
        #[arg(long)]
        network_dir: Option<PathBuf>,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config = match &cli.config {
        Some(path) => VaultConfig::load(path)?,
        None => VaultConfig::default(),
    };
    let passphrase = cli.passphrase.map(Zeroizing::new);

    match cli.command {
        Commands::Init { join } => {
            let passphrase = require_passphrase(&passphrase)?;
            let vault = match join {
                Some(key_file) => Vault::join(config, &key_file, passphrase)?,
                None => Vault::create(config, passphrase)?,
            };
            println!("Vault ready at {}", vault.root().display());
            println!("Device id: {}", vault.device_id());
            println!("Share {} with your other devices to join.", vault.root().join(KEY_FILE).display());
        }
        Commands::Serve { host, port } => {
            let vault = open_vault(config, &passphrase)?;
            run_server(vault, host, port).await?;
        }
        Commands::Add {
            file,
            title,
            tags,
            media_type,
        } => {
            let service = VaultService::new(open_vault(config, &passphrase)?);
            let media = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let record = service
                .add_memory(NewMemory {
                    title,
                    tags: parse_tags(&tags),
                    media,
                    filename: file_name(&file),
                    media_type: media_type.unwrap_or_default(),
                })
                .await?;
            println!("{}", record.id);
        }
        Commands::List { tags } => {
            let service = VaultService::new(open_vault(config, &passphrase)?);
            let filter = ListFilter::tags(parse_tags(tags.as_deref().unwrap_or_default()));
            for summary in service.list_memories(filter).await? {
                let tags: Vec<&str> = summary.tags.iter().map(String::as_str).collect();
                println!(
                    "{}  {}  {}  [{}]",
                    summary.id,
                    summary.created_at.format("%Y-%m-%d %H:%M:%S"),
                    summary.title,
                    tags.join(", ")
                );
            }
        }
        Commands::Get { id, output } => {
            let service = VaultService::new(open_vault(config, &passphrase)?);
            let detail = service.get_memory_by_id(parse_id(&id)?).await?;
            println!("Title:    {}", detail.title);
            println!("Created:  {}", detail.created_at);
            println!("Tags:     {}", detail.tags.iter().cloned().collect::<Vec<_>>().join(", "));
            println!("File:     {} ({}, {} bytes)", detail.filename, detail.media_type, detail.size_bytes);
            println!("Version:  {}", detail.version);
            if let Some(text) = &detail.transcription {
                println!("Transcript: {}", text);
            }
            for conflict in &detail.conflicts {
                println!("Conflict: \"{}\" (v{})", conflict.title, conflict.version);
            }
            for conflict in &detail.transcription_conflicts {
                let text = conflict.transcription.as_deref().unwrap_or("<none>");
                println!("Conflict: transcript \"{}\" (v{})", text, conflict.version);
            }
            if let Some(output) = output {
                tokio::fs::write(&output, &detail.media)
                    .await
                    .with_context(|| format!("Failed to write {}", output.display()))?;
                println!("Media written to {}", output.display());
            }
        }
        Commands::Edit {
            id,
            title,
            tags,
            transcription,
            clear_conflicts,
            expected_version,
        } => {
            let service = VaultService::new(open_vault(config, &passphrase)?);
            let id = parse_id(&id)?;
            let expected_version = match expected_version {
                Some(version) => version,
                None => service.get_record(id).await?.version,
            };
            let patch = MemoryPatch {
                title,
                tags: tags.as_deref().map(parse_tags),
                transcription,
                clear_conflicts,
            };
            if patch.is_empty() {
                bail!("Nothing to edit: pass --title, --tags, --transcription or --clear-conflicts");
            }
            let record = service.update_memory(id, patch, expected_version).await?;
            println!("Updated {} to version {}", record.id, record.version);
        }
        Commands::Delete { id } => {
            let service = VaultService::new(open_vault(config, &passphrase)?);
            service.delete_memory(parse_id(&id)?).await?;
            println!("Deleted {}", id);
        }
        Commands::Sweep => {
            let service = VaultService::new(open_vault(config, &passphrase)?);
            let report = service.sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Rotate { new_passphrase } => {
            let new_passphrase = Zeroizing::new(new_passphrase);
            if new_passphrase.is_empty() {
                bail!("New passphrase must not be empty");
            }
            let vault = open_vault(config, &passphrase)?;
            let rotated = vault.clone();
            tokio::task::spawn_blocking(move || rotated.rotate_passphrase(new_passphrase.as_bytes())).await??;
            println!("Passphrase changed. Other devices must join again with the new key file.");
        }
        Commands::Sync { network_dir } => {
            let Some(network_dir) = network_dir.or_else(|| config.sync.network_dir.clone()) else {
                bail!("No sync network configured: set sync.network_dir or pass --network-dir");
            };
            let sync_config = config.sync.clone();
            let vault = open_vault(config, &passphrase)?;
            let engine = SyncEngine::new(vault, Arc::new(DirectoryNetwork::new(network_dir)), sync_config)?;
            let report = engine.sync_once(&CancellationToken::new()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config { default } => {
            let config = if default { VaultConfig::default() } else { config };
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("memvault={},tower_http=info", log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn require_passphrase(passphrase: &Option<Zeroizing<String>>) -> Result<&[u8]> {
    match passphrase {
        Some(p) if !p.is_empty() => Ok(p.as_bytes()),
        _ => bail!("A passphrase is required: set MEMVAULT_PASSPHRASE or pass --passphrase"),
    }
}

fn open_vault(config: VaultConfig, passphrase: &Option<Zeroizing<String>>) -> Result<Arc<Vault>> {
    let vault = Vault::open(config, require_passphrase(passphrase)?)?;
    Ok(Arc::new(vault))
}

fn parse_id(id: &str) -> Result<MemoryId> {
    Ok(id.parse()?)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn run_server(vault: Arc<Vault>, host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = vault.config().clone();
    let host = host.unwrap_or(config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    let sync = match (&config.sync.network_dir, config.sync.enabled) {
        (Some(dir), true) => {
            let network = Arc::new(DirectoryNetwork::new(dir.clone()));
            Some(Arc::new(SyncEngine::new(vault.clone(), network, config.sync.clone())?))
        }
        (None, true) => {
            tracing::warn!("Sync enabled but no network_dir configured; sync disabled");
            None
        }
        _ => None,
    };
    let sync_handle = sync.clone().map(SyncEngine::spawn);

    let service = VaultService::new(vault.clone());
    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(run_sweeper(
        service.clone(),
        Duration::from_secs(config.sweep.interval_secs.max(1)),
        shutdown.clone(),
    ));

    let app = build_app(AppState { service, sync }, &config.server.cors_origins);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %addr, vault = %vault.root().display(), "memvault is serving. Press Ctrl+C to stop.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await?;

    tracing::info!("Shutting down...");
    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!("Sweep task ended abnormally: {}", e);
    }
    if let Some(handle) = sync_handle {
        handle.stop().await;
    }
    vault.close();
    Ok(())
}

async fn run_sweeper(service: VaultService, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so startup is not slowed down
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match service.sweep().await {
            Ok(report) if report.is_clean() => tracing::debug!("Sweep found nothing to reclaim"),
            Ok(report) => tracing::info!(
                reclaimed = report.references_reclaimed,
                erased = report.blobs_erased,
                bytes = report.bytes_reclaimed,
                "Sweep reclaimed orphaned references"
            ),
            Err(e) => tracing::warn!("Sweep failed: {}", e),
        }
    }
}
