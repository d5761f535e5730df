//! fieldsync CLI - record field data offline and synchronize it.
//!
//! This tool drives the sync engine from the command line: record and
//! delete entities locally, run a sync with live progress, and inspect or
//! requeue edits the server refused.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fieldsync_common::{EditId, Entity, EntityId, Geometry};
use fieldsync_sync::{SyncEngine, SyncMode, SyncScheduler, SyncSummary};

use crate::config::{default_config_path, default_data_dir, CliConfig};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "fieldsync - Offline-first field data collection")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: <data dir>/fieldsync/fieldsync.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file.
    Init {
        /// Base URL of the remote service, or "memory:" for an in-process one.
        #[arg(short, long)]
        remote: String,

        /// Storage backend: "local", "sqlite", or "memory".
        #[arg(short, long, default_value = "local")]
        backend: String,

        /// Directory for local data.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Create or update an entity.
    Record {
        /// Entity identifier (a local one is generated when omitted).
        #[arg(short, long)]
        id: Option<String>,

        /// Field as key=value; JSON values are parsed, anything else is text.
        #[arg(short, long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,

        /// Point geometry as "x,y".
        #[arg(short, long)]
        point: Option<String>,
    },

    /// Delete an entity.
    Delete {
        /// Entity identifier.
        id: String,
    },

    /// List entities.
    List,

    /// Upload pending edits, then download remote changes.
    Sync,

    /// Keep syncing in the background until interrupted.
    Watch {
        /// Seconds between syncs; without it, sync after each local change.
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Show engine status.
    Status,

    /// List edits that failed permanently.
    Failed,

    /// Queue a failed edit for another upload.
    Retry {
        /// Edit identifier; all failed edits when omitted.
        edit_id: Option<String>,
    },

    /// Drop an edit without uploading it.
    Discard {
        /// Edit identifier.
        edit_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Init {
            remote,
            backend,
            data_dir,
        } => cmd_init(&config_path, &remote, &backend, data_dir),

        Commands::Record { id, fields, point } => {
            let engine = open_engine(&config_path).await?;
            cmd_record(&engine, id, &fields, point.as_deref()).await
        }

        Commands::Delete { id } => {
            let engine = open_engine(&config_path).await?;
            cmd_delete(&engine, &id).await
        }

        Commands::List => cmd_list(&open_engine(&config_path).await?).await,

        Commands::Sync => cmd_sync(Arc::new(open_engine(&config_path).await?)).await,

        Commands::Watch { interval } => {
            cmd_watch(Arc::new(open_engine(&config_path).await?), interval).await
        }

        Commands::Status => cmd_status(&open_engine(&config_path).await?).await,

        Commands::Failed => cmd_failed(&open_engine(&config_path).await?).await,

        Commands::Retry { edit_id } => {
            cmd_retry(&open_engine(&config_path).await?, edit_id.as_deref()).await
        }

        Commands::Discard { edit_id } => {
            cmd_discard(&open_engine(&config_path).await?, &edit_id).await
        }
    }
}

async fn open_engine(config_path: &PathBuf) -> Result<SyncEngine> {
    let config = CliConfig::load(config_path)?;
    config.open_engine().await
}

/// Parse `key=value`, reading the value as JSON when possible.
fn parse_field(raw: &str) -> Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Field '{}' is not KEY=VALUE", raw))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Field '{}' has an empty key", raw);
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Parse `x,y` into a point geometry.
fn parse_point(raw: &str) -> Result<Geometry> {
    let (x, y) = raw
        .split_once(',')
        .with_context(|| format!("Point '{}' is not x,y", raw))?;
    let x: f64 = x.trim().parse().context("Invalid x coordinate")?;
    let y: f64 = y.trim().parse().context("Invalid y coordinate")?;
    Ok(Geometry::point(x, y))
}

/// Write a configuration file.
fn cmd_init(
    config_path: &PathBuf,
    remote: &str,
    backend: &str,
    data_dir: Option<PathBuf>,
) -> Result<()> {
    let data_dir = data_dir.unwrap_or_else(default_data_dir);
    let config = CliConfig::new(backend, &data_dir, remote)?;
    config.save(config_path)?;

    println!("Configuration written to {}", config_path.display());
    println!("  Backend: {}", config.backend);
    println!("  Remote: {}", config.remote_url);

    Ok(())
}

/// Create or update an entity.
async fn cmd_record(
    engine: &SyncEngine,
    id: Option<String>,
    fields: &[String],
    point: Option<&str>,
) -> Result<()> {
    let mut entity = match id {
        Some(id) => {
            let id = EntityId::new(id).context("Invalid entity id")?;
            // Start from the stored version so unspecified fields are kept.
            engine
                .get_entity(&id)
                .await
                .unwrap_or_else(|_| Entity::with_id(id))
        }
        None => Entity::new(),
    };

    for raw in fields {
        let (key, value) = parse_field(raw)?;
        entity.fields.insert(key, value);
    }
    if let Some(point) = point {
        entity.geometry = Some(parse_point(point)?);
    }

    let saved = engine
        .save_entity(entity)
        .await
        .context("Failed to record entity")?;
    let id = saved.require_id()?;

    println!("Recorded {} ({} fields)", id, saved.fields.len());

    Ok(())
}

/// Delete an entity.
async fn cmd_delete(engine: &SyncEngine, id: &str) -> Result<()> {
    let id = EntityId::new(id).context("Invalid entity id")?;
    engine
        .delete_entity(&id)
        .await
        .context("Failed to delete entity")?;

    println!("Deleted {}", id);

    Ok(())
}

/// List entities.
async fn cmd_list(engine: &SyncEngine) -> Result<()> {
    let entities = engine.list_entities().await;

    if entities.is_empty() {
        println!("No entities.");
        return Ok(());
    }

    for entity in entities {
        let id = entity.id.as_ref().map(|id| id.as_str()).unwrap_or("?");
        let unsynced = match &entity.id {
            Some(id) => engine.edit_log().has_unsynced(id).await,
            None => false,
        };
        println!(
            "  {}{} [{}] {}",
            id,
            if unsynced { " *" } else { "" },
            entity.geometry_type(),
            serde_json::to_string(&entity.fields)?
        );
    }

    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    println!("Sync finished in {:.1?}", summary.duration);
    println!(
        "  Upload: {} confirmed, {} awaiting retry, {} failed",
        summary.upload.confirmed,
        summary.upload.retry_scheduled,
        summary.upload.failures.len()
    );
    if let Some(err) = &summary.upload.transport_error {
        println!("  Upload interrupted: {} ({} edits kept)", err, summary.upload.released);
    }
    for failure in &summary.upload.failures {
        println!("    {} ({}): {}", failure.target, failure.edit_id, failure.reason);
    }
    match (&summary.download, &summary.download_error) {
        (Some(download), _) => println!(
            "  Download: {} new, {} updated, {} kept local",
            download.inserted, download.updated, download.kept_local
        ),
        (None, Some(err)) => println!("  Download failed: {}", err),
        (None, None) => {}
    }
}

/// Run one sync session with live progress. Ctrl-C cancels it.
async fn cmd_sync(engine: Arc<SyncEngine>) -> Result<()> {
    let mut progress = engine.subscribe_progress();
    let printer = tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            match &event.error {
                Some(err) => println!("  [{:>3.0}%] {} ({})", event.fraction * 100.0, event.message, err),
                None => println!("  [{:>3.0}%] {}", event.fraction * 100.0, event.message),
            }
        }
    });

    let mut session = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.request_sync().await })
    };

    let result = tokio::select! {
        result = &mut session => result.context("Sync task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling sync");
            engine.cancel();
            // Let the session finish applying outcomes it already received.
            session.await.context("Sync task panicked")?
        }
    };
    printer.abort();

    match result {
        Ok(summary) => {
            print_summary(&summary);
            if !summary.is_success() {
                anyhow::bail!("Sync did not complete");
            }
            Ok(())
        }
        Err(fieldsync_common::Error::Cancelled) => {
            println!("Sync cancelled; unconfirmed edits will be retried.");
            Ok(())
        }
        Err(err) => Err(err).context("Sync failed"),
    }
}

/// Sync in the background until Ctrl-C.
async fn cmd_watch(engine: Arc<SyncEngine>, interval: Option<u64>) -> Result<()> {
    let (scheduler, handle) = SyncScheduler::new(engine.clone());
    let mode = match interval {
        Some(secs) => SyncMode::Periodic {
            interval: Duration::from_secs(secs.max(1)),
        },
        None => SyncMode::OnDemand,
    };
    scheduler.set_mode(mode.clone()).await;
    let task = tokio::spawn(handle.run());

    info!("Watching with {:?}; press Ctrl-C to stop", mode);
    match scheduler.request_sync().await {
        Ok(summary) => print_summary(&summary),
        Err(err) => warn!("Initial sync failed: {}", err),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    engine.cancel();
    scheduler.shutdown();
    task.await.context("Scheduler task panicked")?;

    Ok(())
}

/// Show engine status.
async fn cmd_status(engine: &SyncEngine) -> Result<()> {
    let status = engine.status().await;

    println!("Sync Status:");
    println!("  Phase: {:?}", status.phase);
    println!("  Entities: {}", status.entities);
    println!("  Pending edits: {}", status.edits.pending);
    println!("  In flight: {}", status.edits.in_flight);
    println!("  Failed: {}", status.edits.failed);

    Ok(())
}

/// List edits that failed permanently.
async fn cmd_failed(engine: &SyncEngine) -> Result<()> {
    let failed = engine.failed_edits().await;

    if failed.is_empty() {
        println!("No failed edits.");
        return Ok(());
    }

    for edit in failed {
        println!(
            "  {} {:?} {} after {} attempts: {}",
            edit.id,
            edit.kind,
            edit.target,
            edit.attempts,
            edit.last_error.as_deref().unwrap_or("unknown error")
        );
    }

    Ok(())
}

/// Requeue one or all failed edits.
async fn cmd_retry(engine: &SyncEngine, edit_id: Option<&str>) -> Result<()> {
    let ids = match edit_id {
        Some(id) => vec![EditId::new(id).context("Invalid edit id")?],
        None => engine.failed_edits().await.into_iter().map(|e| e.id).collect(),
    };

    for id in &ids {
        engine
            .requeue_failed(id)
            .await
            .with_context(|| format!("Failed to requeue {}", id))?;
    }

    println!("Requeued {} edits; run `fieldsync sync` to upload them.", ids.len());

    Ok(())
}

/// Drop an edit.
async fn cmd_discard(engine: &SyncEngine, edit_id: &str) -> Result<()> {
    let id = EditId::new(edit_id).context("Invalid edit id")?;
    engine
        .discard_edit(&id)
        .await
        .context("Failed to discard edit")?;

    println!("Discarded {}", id);

    Ok(())
}
