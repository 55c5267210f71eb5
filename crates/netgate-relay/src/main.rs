//! netgate relay server
//!
//! Event consumer, job runner, reconciler and operational HTTP API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use netgate_core::config::{Config, StoreBackend, load_config};
use netgate_core::tracing_init::init_tracing;
use netgate_core::{Clock, Metrics, SystemClock};

use netgate_relay::actions::ActionHandler;
use netgate_relay::circuit::{CircuitBreaker, CircuitBreakerConfig};
use netgate_relay::consumer::{
    Acknowledger, EventConsumer, EventSource, FileQueueSource, HttpAcknowledger, HttpEventSource,
    spawn_consumer_task,
};
use netgate_relay::driver::{DryRunDriver, RestDriver, RouterDriver};
use netgate_relay::jobs::{
    FileJobBackend, JobBackend, JobStore, RedisJobBackend, SqliteJobBackend, StoreSettings,
};
use netgate_relay::machine::{MachineSettings, StateMachine};
use netgate_relay::overlay::{MemoryOverlay, OverlayDriver, WireGuardOverlay};
use netgate_relay::provision::DeviceManager;
use netgate_relay::reconciler::{Reconciler, ReconcilerSettings, spawn_reconciler_task};
use netgate_relay::runner::{BackoffPolicy, JobRunner, spawn_job_runner_task};
use netgate_relay::server::{ApiAuth, AppState, RateLimiter, build_router};
use netgate_relay::storage::RelayDatabase;

const QUEUE_FILE: &str = "events_queue.json";
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "netgate-relay")]
#[command(
    version,
    about = "netgate relay - event-driven network access orchestration"
)]
struct Args {
    /// Path to a JSON config file.
    #[arg(long, env = "NETGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides relay.listen_addr).
    #[arg(long, env = "NETGATE_ADDR")]
    addr: Option<SocketAddr>,

    /// Directory for the database and queue files.
    #[arg(long, env = "NETGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log router and overlay commands instead of executing them.
    #[arg(long, env = "NETGATE_DRY_RUN")]
    dry_run: bool,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "NETGATE_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("netgate_relay=info,netgate_core=info", args.log_json)?;

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.relay.listen_addr = addr.to_string();
    }
    if let Some(dir) = args.data_dir {
        config.relay.data_dir = Some(dir);
    }
    if args.dry_run {
        config.relay.dry_run = true;
    }
    config.validate().context("invalid configuration")?;

    let addr: SocketAddr = config
        .relay
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.relay.listen_addr))?;
    let data_dir = config
        .data_dir()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine data directory"))?;
    tokio::fs::create_dir_all(&data_dir).await?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        data_dir = %data_dir.display(),
        store = %config.store.backend,
        dry_run = config.relay.dry_run,
        routers = config.routers.len(),
        "Starting netgate-relay"
    );

    let db = RelayDatabase::open_in(&data_dir).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::new());

    let backend = open_backend(&config, &db, &data_dir).await?;
    let store = JobStore::new(
        backend,
        StoreSettings::from(&config.store),
        Arc::clone(&clock),
        Arc::clone(&metrics),
    );

    let driver: Arc<dyn RouterDriver>;
    let overlay: Arc<dyn OverlayDriver>;
    if config.relay.dry_run {
        warn!("Dry-run mode: router and overlay commands are recorded, not executed");
        driver = Arc::new(DryRunDriver::new());
        overlay = Arc::new(MemoryOverlay::new());
    } else {
        driver = Arc::new(RestDriver::new()?);
        overlay = Arc::new(WireGuardOverlay::new(&config.overlay));
    }

    let circuit = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from(
        &config.circuit,
    )));
    let actions = Arc::new(ActionHandler::new(
        driver,
        circuit,
        Arc::clone(&metrics),
        &config.routers,
    ));
    let machine = Arc::new(
        StateMachine::new(
            store.clone(),
            Arc::clone(&actions),
            Arc::clone(&clock),
            Arc::clone(&metrics),
            MachineSettings::from(&config),
        )
        .with_overlay(Arc::clone(&overlay)),
    );
    let runner = Arc::new(JobRunner::new(
        store.clone(),
        Arc::clone(&machine),
        Arc::clone(&actions),
        Arc::clone(&clock),
        Arc::clone(&metrics),
        BackoffPolicy::from(&config.jobs),
    ));
    let reconciler = Arc::new(Reconciler::new(
        db.clone(),
        Arc::clone(&overlay),
        Arc::clone(&clock),
        Arc::clone(&metrics),
        ReconcilerSettings::from(&config.reconciler),
    ));
    let devices = Arc::new(DeviceManager::new(
        db.clone(),
        Arc::clone(&overlay),
        Arc::clone(&actions),
        Arc::clone(&clock),
        Arc::clone(&metrics),
        config.reconciler.handshake_online_secs,
    ));
    let consumer = Arc::new(build_consumer(
        &config,
        &data_dir,
        Arc::clone(&machine),
        Arc::clone(&metrics),
    )?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = vec![
        spawn_consumer_task(
            consumer,
            Duration::from_millis(config.events.poll_ms),
            shutdown_rx.clone(),
        ),
        spawn_job_runner_task(
            runner,
            Duration::from_millis(config.jobs.tick_ms),
            shutdown_rx.clone(),
        ),
        spawn_reconciler_task(
            reconciler,
            Duration::from_millis(config.reconciler.interval_ms),
            shutdown_rx.clone(),
        ),
    ];
    if config.store.processed_ttl_secs > 0 {
        tasks.push(spawn_purge_task(store.clone(), shutdown_rx.clone()));
    }

    let state = AppState {
        actions,
        machine,
        devices,
        store,
        limiter: Arc::new(RateLimiter::new(
            config.relay.rate_limit_per_minute,
            Arc::clone(&clock),
        )),
        metrics,
        clock,
        auth: Arc::new(ApiAuth {
            token: config.relay.token.clone(),
            api_secret: config.relay.api_secret.clone(),
        }),
    };
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // Notify systemd that the relay is ready to serve.
    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "systemd notification failed");
    }

    info!(addr = %addr, "HTTP API ready");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]) {
        warn!(error = %e, "systemd notification failed");
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Relay stopped");
    Ok(())
}

async fn open_backend(
    config: &Config,
    db: &RelayDatabase,
    data_dir: &std::path::Path,
) -> anyhow::Result<Arc<dyn JobBackend>> {
    let backend: Arc<dyn JobBackend> = match config.store.backend {
        StoreBackend::File => Arc::new(FileJobBackend::open(&data_dir.join("jobs")).await?),
        StoreBackend::Sqlite => Arc::new(SqliteJobBackend::new(db.clone())),
        StoreBackend::Redis => {
            let url = config.store.redis_url.as_deref().unwrap_or_default();
            let redis = tokio::time::timeout(
                REDIS_CONNECT_TIMEOUT,
                RedisJobBackend::connect(url, &config.store.namespace),
            )
            .await
            .context("timed out connecting to Redis")??;
            Arc::new(redis)
        }
    };
    info!(backend = backend.name(), "Job store ready");
    Ok(backend)
}

fn build_consumer(
    config: &Config,
    data_dir: &std::path::Path,
    machine: Arc<StateMachine>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<EventConsumer> {
    let timeout = Duration::from_millis(config.events.http_timeout_ms);
    let source: Arc<dyn EventSource> = match &config.events.source_url {
        Some(url) => Arc::new(HttpEventSource::new(
            url.clone(),
            config.events.hmac_secret.clone(),
            config.events.require_hmac,
            timeout,
            Arc::clone(&metrics),
        )?),
        None => Arc::new(FileQueueSource::new(data_dir.join(QUEUE_FILE))),
    };
    let ack: Option<Arc<dyn Acknowledger>> = match &config.events.ack_url {
        Some(url) => Some(Arc::new(HttpAcknowledger::new(
            url.clone(),
            config.events.hmac_secret.clone(),
            config.events.ack_retries,
            Duration::from_millis(config.events.ack_retry_delay_ms),
            timeout,
            Arc::clone(&metrics),
        )?)),
        None => None,
    };
    info!(source = source.name(), ack = ack.is_some(), "Event consumer configured");
    Ok(EventConsumer::new(source, ack, machine, metrics))
}

fn spawn_purge_task(
    store: JobStore,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        interval.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match store.purge_processed().await {
                        Ok(removed) if removed > 0 => {
                            info!(removed, "Processed-event purge completed");
                        }
                        Err(e) => {
                            warn!(error = %e, "Processed-event purge failed");
                        }
                        _ => {}
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        () = sigterm => {
            info!("Received SIGTERM shutdown signal");
        }
    }
}
