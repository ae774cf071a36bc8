#![forbid(unsafe_code)]

//! `botfoundry` — bot factory orchestration server binary.
//!
//! Bootstraps configuration, persistence, and the process supervisor,
//! then runs the four periodic tasks (health poll, billing sweep,
//! reconciliation loop, cleanup sweep) plus the health event consumer
//! until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use botfoundry::billing::BillingEngine;
use botfoundry::cleanup::CleanupService;
use botfoundry::config::GlobalConfig;
use botfoundry::coordinator::{events, Coordinator};
use botfoundry::locks::InstanceLocks;
use botfoundry::monitor::{HealthMonitor, MonitorState};
use botfoundry::notify::{LogNotifier, SharedNotifier};
use botfoundry::persistence::db;
use botfoundry::persistence::instance_repo::InstanceRepo;
use botfoundry::supervisor::ProcessSupervisor;
use botfoundry::{AppError, Result};

/// Capacity of the monitor→coordinator health event channel.
const HEALTH_EVENT_BUFFER: usize = 256;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "botfoundry", about = "Bot factory orchestration core", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured storage root.
    #[arg(long)]
    storage_root: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("botfoundry server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(root) = args.storage_root {
        config.storage_root = root;
    }
    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Initialize database ─────────────────────────────
    let pool = Arc::new(db::connect(&config.db_path()).await?);
    info!("database connected");

    // ── Build shared components ─────────────────────────
    let notifier: SharedNotifier = Arc::new(LogNotifier);
    let locks = Arc::new(InstanceLocks::default());
    let supervisor = Arc::new(ProcessSupervisor::new(Arc::clone(&config)));
    let monitor_state = Arc::new(MonitorState::default());

    let billing = Arc::new(BillingEngine::new(
        Arc::clone(&pool),
        Arc::clone(&config),
        Arc::clone(&notifier),
        Arc::clone(&locks),
    ));

    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&config),
        Arc::clone(&pool),
        Arc::clone(&supervisor),
        Arc::clone(&billing),
        Arc::clone(&notifier),
        Arc::clone(&locks),
        Arc::clone(&monitor_state),
    ));

    let cleanup = Arc::new(CleanupService::new(
        Arc::clone(&config),
        Arc::clone(&pool),
        Arc::clone(&supervisor),
        Arc::clone(&locks),
    ));

    report_startup_state(&pool).await;

    // ── Start background tasks ──────────────────────────
    let ct = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::channel(HEALTH_EVENT_BUFFER);

    let monitor = HealthMonitor::new(
        Arc::clone(&config),
        Arc::clone(&supervisor),
        InstanceRepo::new(Arc::clone(&pool)),
        Arc::clone(&monitor_state),
        event_tx,
    );

    let monitor_handle = monitor.spawn(ct.clone());
    let consumer_handle =
        events::spawn_health_event_consumer(Arc::clone(&coordinator), event_rx, ct.clone());
    let billing_handle = Arc::clone(&billing).spawn(ct.clone());
    let reconcile_handle = Arc::clone(&coordinator).spawn_reconciler(ct.clone());
    let cleanup_handle = Arc::clone(&cleanup).spawn(ct.clone());
    info!("background tasks started");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    // ── Graceful shutdown: stop all workers ─────────────
    supervisor.stop_all(config.stop_timeout()).await;

    let _ = tokio::join!(
        monitor_handle,
        consumer_handle,
        billing_handle,
        reconcile_handle,
        cleanup_handle
    );
    info!("botfoundry shut down");

    Ok(())
}

/// Log what the store holds on startup. The reconciliation loop picks up
/// every instance from durable state, so a prior crash needs no special
/// recovery beyond reporting.
async fn report_startup_state(pool: &Arc<sqlx::SqlitePool>) {
    use botfoundry::models::instance::LifecycleState;

    let repo = InstanceRepo::new(Arc::clone(pool));
    for state in [
        LifecycleState::Provisioning,
        LifecycleState::Active,
        LifecycleState::PaymentWarned,
        LifecycleState::Suspended,
        LifecycleState::LaunchFailed,
        LifecycleState::ChronicFailure,
    ] {
        match repo.list_by_state(state).await {
            Ok(instances) if instances.is_empty() => {}
            Ok(instances) => info!(state = ?state, count = instances.len(), "instances on startup"),
            Err(err) => error!(%err, state = ?state, "failed to count instances on startup"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
