//! Larder CLI - Command line interface for the offline-first sync layer.
//!
//! Reads and writes go to a local SQLite cache; queued changes are pushed to
//! the HTTP backend by `larder sync`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use larder_common::{Collection, Payload};
use larder_remote::HttpBackend;
use larder_storage::{create_default_registry, CachedRecord, LocalStore};
use larder_sync::{RefreshOutcome, SyncConfig, SyncService};

#[derive(Parser)]
#[command(name = "larder")]
#[command(about = "Larder - Offline-first record sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the local cache (default: platform data dir).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Local store engine ("sqlite" or "memory").
    #[arg(long, global = true, default_value = "sqlite")]
    store: String,

    /// Backend base URL.
    #[arg(long, global = true, default_value = "http://localhost:8080/api/")]
    url: Url,

    /// Bearer token for the backend.
    #[arg(long, global = true)]
    token: Option<String>,

    /// JSON file with sync settings.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connectivity and queue state.
    Status,

    /// List pending operations in queue order.
    Queue,

    /// Show one cached record.
    Get {
        /// Collection name.
        collection: String,

        /// Record id (server or temp id).
        id: String,
    },

    /// List cached records of a collection.
    List {
        /// Collection name.
        collection: String,
    },

    /// Create a record from a JSON object.
    Create {
        /// Collection name.
        collection: String,

        /// Record fields, e.g. '{"name": "Flour"}'.
        json: String,
    },

    /// Change fields of a record.
    Update {
        /// Collection name.
        collection: String,

        /// Record id.
        id: String,

        /// Changed fields, e.g. '{"price": 12}'.
        json: String,
    },

    /// Remove a record.
    Remove {
        /// Collection name.
        collection: String,

        /// Record id.
        id: String,
    },

    /// Push queued changes to the backend now.
    Sync,

    /// Replace the cached collection with the server's copy.
    Refresh {
        /// Collection name.
        collection: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let service = open_service(&cli).await?;

    let result = match cli.command {
        Commands::Status => cmd_status(&service).await,
        Commands::Queue => cmd_queue(&service).await,
        Commands::Get { collection, id } => cmd_get(&service, &collection, &id).await,
        Commands::List { collection } => cmd_list(&service, &collection).await,
        Commands::Create { collection, json } => cmd_create(&service, &collection, &json).await,
        Commands::Update {
            collection,
            id,
            json,
        } => cmd_update(&service, &collection, &id, &json).await,
        Commands::Remove { collection, id } => cmd_remove(&service, &collection, &id).await,
        Commands::Sync => cmd_sync(&service).await,
        Commands::Refresh { collection } => cmd_refresh(&service, &collection).await,
    };

    service.stop().await.context("Failed to stop sync service")?;
    result
}

fn default_db_path() -> Result<PathBuf> {
    let dir = dirs::data_dir().context("No platform data directory; pass --db")?;
    Ok(dir.join("larder").join("larder.db"))
}

async fn open_service(cli: &Cli) -> Result<SyncService> {
    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let db = match &cli.db {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    let store = open_store(&cli.store, &db)?;

    let mut backend = HttpBackend::new(cli.url.clone(), None).context("Invalid backend URL")?;
    if let Some(token) = &cli.token {
        backend = backend.with_token(token.clone());
    }

    SyncService::open(store, Arc::new(backend), config)
        .await
        .context("Failed to open sync service")
}

fn open_store(engine: &str, db: &Path) -> Result<Arc<dyn LocalStore>> {
    if engine == "sqlite" {
        if let Some(parent) = db.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        info!("Using cache at {}", db.display());
    }

    let registry = create_default_registry();
    let config = serde_json::json!({ "path": db.to_string_lossy() });
    registry
        .resolve(engine, config)
        .with_context(|| format!("Failed to open {} store", engine))
}

fn parse_collection(name: &str) -> Result<Collection> {
    Collection::new(name).context("Invalid collection name")
}

fn parse_payload(json: &str) -> Result<Payload> {
    serde_json::from_str(json).context("Expected a JSON object")
}

fn print_record(record: &CachedRecord) -> Result<()> {
    let version = record
        .server_version
        .map(|v| format!("v{}", v))
        .unwrap_or_else(|| "unsynced".to_string());
    let dirty = if record.local_dirty { " *" } else { "" };
    println!("{} ({}){}", record.id, version, dirty);
    println!("  {}", serde_json::to_string(&record.payload)?);
    if let Some(error) = &record.last_error {
        println!("  last error: {}", error);
    }
    Ok(())
}

/// Show connectivity and queue state.
async fn cmd_status(service: &SyncService) -> Result<()> {
    let online = service.network().check_now().await;
    let status = service.status();

    println!("Sync Status:");
    println!("  Online: {}", online);
    println!("  Pending: {}", status.pending_count);
    println!("  Engine: {}", status.engine);
    match status.last_sync_at {
        Some(at) => println!("  Last sync: {}", at),
        None => println!("  Last sync: never"),
    }
    if let Some(error) = status.last_error {
        println!("  Last error: {}", error);
    }

    Ok(())
}

/// List pending operations.
async fn cmd_queue(service: &SyncService) -> Result<()> {
    let ops = service
        .data()
        .pending_ops()
        .await
        .context("Failed to read queue")?;

    if ops.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("Pending operations:");
    for op in ops {
        print!(
            "  #{} {} {}/{}",
            op.created_seq,
            op.kind.as_str(),
            op.collection,
            op.record_id
        );
        if !op.changed_fields.is_empty() {
            print!(" {}", serde_json::to_string(&op.changed_fields)?);
        }
        if op.attempts > 0 {
            print!(" (attempts: {})", op.attempts);
        }
        println!();
    }

    Ok(())
}

/// Show one record.
async fn cmd_get(service: &SyncService, collection: &str, id: &str) -> Result<()> {
    let collection = parse_collection(collection)?;
    match service.data().get(&collection, id).await? {
        Some(record) => print_record(&record),
        None => anyhow::bail!("Record {}/{} not found", collection, id),
    }
}

/// List a collection.
async fn cmd_list(service: &SyncService, collection: &str) -> Result<()> {
    let collection = parse_collection(collection)?;
    service.network().check_now().await;

    let records = service
        .data()
        .list(&collection)
        .await
        .context("Failed to list records")?;

    if records.is_empty() {
        println!("Collection is empty.");
    } else {
        for record in &records {
            print_record(record)?;
        }
    }

    Ok(())
}

/// Create a record.
async fn cmd_create(service: &SyncService, collection: &str, json: &str) -> Result<()> {
    let collection = parse_collection(collection)?;
    let payload = parse_payload(json)?;

    let id = service
        .data()
        .create(&collection, payload)
        .await
        .context("Failed to create record")?;

    println!("Created {}/{} (queued)", collection, id);
    Ok(())
}

/// Update a record.
async fn cmd_update(service: &SyncService, collection: &str, id: &str, json: &str) -> Result<()> {
    let collection = parse_collection(collection)?;
    let fields = parse_payload(json)?;

    let record = service
        .data()
        .update(&collection, id, fields)
        .await
        .context("Failed to update record")?;

    print_record(&record)
}

/// Remove a record.
async fn cmd_remove(service: &SyncService, collection: &str, id: &str) -> Result<()> {
    let collection = parse_collection(collection)?;

    service
        .data()
        .remove(&collection, id)
        .await
        .context("Failed to remove record")?;

    println!("Removed {}/{}", collection, id);
    Ok(())
}

/// Drain the queue.
async fn cmd_sync(service: &SyncService) -> Result<()> {
    service.start().await.context("Failed to start sync service")?;

    let report = service.sync_now().await.context("Sync failed")?;

    println!("Sync complete:");
    println!("  Sent: {}", report.sent);
    println!("  Succeeded: {}", report.succeeded);
    println!("  Conflicts: {}", report.conflicts);
    println!("  Rejected: {}", report.rejected);
    println!("  Failed: {}", report.failed);
    println!("  Remaining: {}", report.remaining);
    if let Some(error) = service.status().last_error {
        println!("  Last error: {}", error);
    }

    Ok(())
}

/// Refresh a collection from the server.
async fn cmd_refresh(service: &SyncService, collection: &str) -> Result<()> {
    let collection = parse_collection(collection)?;
    service.network().check_now().await;

    match service
        .data()
        .refresh(&collection)
        .await
        .context("Failed to refresh")?
    {
        RefreshOutcome::Fresh { records } => {
            println!("Refreshed {}: {} records", collection, records)
        }
        RefreshOutcome::Stale { reason } => {
            println!("Cache for {} left as is: {}", collection, reason)
        }
    }

    Ok(())
}
