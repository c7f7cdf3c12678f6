mod connectivity;

use anyhow::{bail, Context, Result};
use clap::Parser;
use shelf_core::kv::SqliteKvStore;
use shelf_core::status::SyncStatusStore;
use shelf_core::{
    Config, HttpBackend, MigrationProgress, NetworkStatus, SqliteStore, State, SyncCoordinator,
    SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::connectivity::ProbeConnectivity;

#[derive(Parser)]
#[command(name = "shelf-syncd", about = "Background sync daemon for shelf")]
struct Args {
    /// Path to configuration file (defaults to SHELF_CONFIG or ~/.config/shelf/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Run a single sync round and exit
    #[arg(long)]
    once: bool,

    /// Discard the sync checkpoint, re-pull everything and exit
    #[arg(long, conflicts_with = "once")]
    force_full: bool,

    /// Print the persisted sync status as JSON and exit
    #[arg(long)]
    status: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => Ok(dirs::home_dir()
            .context("Could not determine home directory")?
            .join(rest)),
        None => Ok(PathBuf::from(raw)),
    }
}

fn log_progress(progress: MigrationProgress) {
    match progress.error {
        Some(ref e) => error!(stage = ?progress.stage, error = %e, "{}", progress.message),
        None => info!(
            stage = ?progress.stage,
            progress = progress.progress,
            "{}",
            progress.message
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = match args.config {
        Some(ref raw) => Config::load_from(&expand_path(raw)?)?,
        None => Config::load()?,
    };
    let db_path = config.database_path()?;
    let kv = Arc::new(SqliteKvStore::open(&db_path)?);

    if args.status {
        let status = SyncStatusStore::new(kv, Arc::new(SystemClock));
        let record = status.get_sync_status_info().await;
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let Some(ref server_url) = config.sync.server_url else {
        bail!("No server configured: set sync.server_url in the config file");
    };
    let state = State::load()?;
    let Some(session) = state.session() else {
        bail!("Not signed in or session expired: no valid credentials in the state file");
    };

    info!(
        server = %server_url,
        database = %db_path.display(),
        "shelf-syncd starting"
    );

    let probe = Arc::new(ProbeConnectivity::new(
        server_url,
        config.sync.api_key.clone(),
    )?);
    let coordinator = SyncCoordinator::new(
        Arc::new(SqliteStore::open(&db_path)?),
        kv,
        Arc::new(HttpBackend::new(server_url, config.sync.api_key.clone())),
        probe.clone(),
        Arc::new(SystemClock),
        &config.sync,
    );

    if let Some(summary) = coordinator.start(session, log_progress).await? {
        info!(
            tables = summary.inserted.len(),
            failed = ?summary.failed_tables,
            "initial import finished"
        );
        let validation = coordinator.validate_migration().await;
        for issue in &validation.issues {
            warn!(%issue, "imported data looks incomplete");
        }
    }

    if args.once || args.force_full {
        let result = if args.force_full {
            coordinator.force_full_resync().await?
        } else {
            coordinator.sync_now().await?
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let events = probe.watch(config.sync.probe_interval());
    let event_loop = coordinator.monitor().spawn_event_loop(events);
    let mut ticker = tokio::time::interval(config.sync.auto_sync_interval());
    // The first tick fires immediately; startup already synced or imported
    ticker.tick().await;

    loop {
        tokio::select! {
            // Periodic sync, throttled like reconnect syncs
            _ = ticker.tick() => {
                if !config.sync.auto_sync {
                    continue;
                }
                if coordinator.network_status() != NetworkStatus::Online {
                    info!("offline, skipping periodic sync");
                    continue;
                }
                if !coordinator
                    .status_store()
                    .should_auto_sync(config.sync.auto_sync_interval())
                    .await
                {
                    continue;
                }
                match coordinator.sync().await {
                    Ok(result) if result.success => {
                        info!(
                            pulled = result.pulled,
                            pushed = result.pushed,
                            "periodic sync finished"
                        );
                    }
                    Ok(result) => warn!(error = ?result.error, "periodic sync failed"),
                    Err(e) => warn!(error = %e, "periodic sync skipped"),
                }
            }

            // Handle shutdown signals
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, stopping shelf-syncd");
                break;
            }
        }
    }

    event_loop.abort();
    Ok(())
}
