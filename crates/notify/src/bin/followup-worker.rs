//! followup-worker: runs the escalation poll loop.
//!
//! Reads `[scheduler]` and `[channels.*]` from one TOML file, builds the job
//! store and channel senders, and dispatches due jobs until SIGINT/SIGTERM.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use followup_escalation::{EscalationConfig, JobStore, MemoryJobStore, PgJobStore, Scheduler};
use followup_notify::ChannelsConfig;

// ── CLI ─────────────────────────────────────────────────────────────

/// Escalation worker that places follow-up calls, SMS, and emails when they fall due.
#[derive(Parser, Debug)]
#[command(name = "followup-worker", version, about)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "FOLLOWUP_CONFIG", default_value = "config/followup.toml")]
    config: String,

    /// PostgreSQL URL for the shared job store. Required unless `--dry-run`
    /// is given.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log contact attempts instead of sending them. Without a database URL
    /// this runs against an empty in-memory store, which only checks that
    /// config and channels load.
    #[arg(long, env = "FOLLOWUP_DRY_RUN")]
    dry_run: bool,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let (config, channels) = if Path::new(&cli.config).exists() {
        info!(path = %cli.config, "loading config");
        (
            EscalationConfig::from_file(&cli.config)?,
            ChannelsConfig::from_file(&cli.config)?,
        )
    } else {
        warn!(path = %cli.config, "config file not found, using defaults");
        (EscalationConfig::from_env()?, ChannelsConfig::default())
    };

    let store: Arc<dyn JobStore> = match store_mode(cli.database_url.as_deref(), cli.dry_run)? {
        StoreMode::Postgres(url) => {
            let store = PgJobStore::connect(url).await?;
            info!("connected to PostgreSQL job store");
            Arc::new(store)
        }
        StoreMode::EmptyMemory => {
            warn!("no DATABASE_URL, dry run against an empty in-memory job store");
            Arc::new(MemoryJobStore::new())
        }
    };

    let registry = channels.build_registry(cli.dry_run)?;
    let scheduler = Scheduler::builder(store)
        .config(&config)
        .channels(registry)
        .build()?;

    scheduler.start().await;
    info!(
        poll_interval_seconds = config.poll_interval_seconds,
        batch_size = config.batch_size,
        dry_run = cli.dry_run,
        "followup-worker running"
    );

    wait_for_shutdown().await?;
    scheduler.stop().await;
    info!("followup-worker exited cleanly");

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum StoreMode<'a> {
    Postgres(&'a str),
    /// Nothing else can write to this store: smoke-test runs only.
    EmptyMemory,
}

fn store_mode(database_url: Option<&str>, dry_run: bool) -> anyhow::Result<StoreMode<'_>> {
    match database_url {
        Some(url) => Ok(StoreMode::Postgres(url)),
        None if dry_run => Ok(StoreMode::EmptyMemory),
        None => anyhow::bail!(
            "DATABASE_URL is required; a worker on a private in-memory store never sees \
             scheduled jobs (pass --dry-run for a config smoke test)"
        ),
    }
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, finishing in-flight batch"),
        _ = sigint.recv() => info!("received SIGINT, finishing in-flight batch"),
    }
    Ok(())
}
