//! THub scan core.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the signal snapshot, serves the webhook, and runs the scheduled
//! market scanner and hot-signal monitor until Ctrl+C.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use thub::cache::{MemoryCacheBackend, ResultCache};
use thub::config::AppConfig;
use thub::data::remote::RemoteDataSource;
use thub::engine::scanner::in_regular_session;
use thub::engine::{AnalysisCoordinator, Collaborators, CoordinatorConfig};
use thub::quota::QuotaGovernor;
use thub::storage::{self, InMemorySignalStore};
use thub::strategy::ConvergenceAnalyzer;
use thub::webhook::{self, ServerState};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("THUB_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = AppConfig::load_or_default(&config_path)?;

    init_logging();

    info!(
        config = %config_path,
        minute_limit = cfg.quota.minute_limit,
        daily_limit = cfg.quota.daily_limit,
        safety_buffer = cfg.quota.safety_buffer,
        scan_interval_secs = cfg.scanner.scan_interval_secs,
        "THub starting up"
    );

    // -- Restore signals -------------------------------------------------

    let snapshot_path = cfg.storage.snapshot_path.clone();
    let store = match storage::load_snapshot(&snapshot_path) {
        Ok(Some(signals)) => Arc::new(InMemorySignalStore::from_signals(signals)),
        Ok(None) => Arc::new(InMemorySignalStore::new()),
        Err(e) => {
            warn!(error = %e, "Signal snapshot unreadable, starting empty");
            Arc::new(InMemorySignalStore::new())
        }
    };

    // -- Initialise components -------------------------------------------

    let source = Arc::new(RemoteDataSource::from_config(&cfg.data_source)?);
    if cfg.data_source.api_key().is_none() {
        warn!("No market data API key configured, requests are unauthenticated");
    }
    let [technical, sentiment, liquidity] = source.scorers();

    let governor = Arc::new(QuotaGovernor::new(cfg.quota.clone()));
    let cache = Arc::new(ResultCache::new(
        Arc::new(MemoryCacheBackend::new()),
        cfg.cache.ttl(),
    ));

    let coordinator = Arc::new(AnalysisCoordinator::new(
        governor,
        Collaborators {
            market: source,
            technical,
            sentiment,
            liquidity,
            store: store.clone(),
        },
        cache.clone(),
        ConvergenceAnalyzer::new(cfg.analysis.convergence()),
        CoordinatorConfig::from_app(&cfg),
    ));

    if cfg.server.enabled {
        let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
            .parse()
            .with_context(|| {
                format!("Invalid server address {}:{}", cfg.server.host, cfg.server.port)
            })?;
        webhook::spawn_server(Arc::new(ServerState::new(coordinator.clone())), addr).await?;
    }

    // -- Scheduler -------------------------------------------------------

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let scheduler = tokio::spawn(run_scheduler(
        coordinator,
        store.clone(),
        cache,
        cfg.clone(),
        cancel_rx,
    ));

    info!("Running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received.");

    let _ = cancel_tx.send(true);
    if let Err(e) = scheduler.await {
        error!(error = %e, "Scheduler task failed");
    }

    let signals = store.snapshot().await;
    storage::save_snapshot(&signals, &snapshot_path)?;
    info!(signals = signals.len(), "THub shut down cleanly.");

    Ok(())
}

/// Scheduled market scans during regular hours plus the hot-signal monitor,
/// which also sweeps expired cache entries.
async fn run_scheduler(
    coordinator: Arc<AnalysisCoordinator>,
    store: Arc<InMemorySignalStore>,
    cache: Arc<ResultCache>,
    cfg: AppConfig,
    mut cancel: watch::Receiver<bool>,
) {
    let mut scan_interval =
        tokio::time::interval(Duration::from_secs(cfg.scanner.scan_interval_secs.max(1)));
    scan_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut monitor_interval =
        tokio::time::interval(Duration::from_secs(cfg.scanner.monitor_interval_secs.max(1)));
    monitor_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Handed to batches so they stop launching work on shutdown.
    let batch_cancel = cancel.clone();

    loop {
        tokio::select! {
            _ = scan_interval.tick() => {
                if !cfg.scanner.enabled {
                    continue;
                }
                if !in_regular_session(chrono::Utc::now()) {
                    info!("Market closed, skipping scheduled scan");
                    continue;
                }
                match coordinator.scan_and_analyze(None, Some(batch_cancel.clone())).await {
                    Ok(out) => info!(
                        scan_id = %out.scan.scan_id,
                        candidates = out.scan.candidates.len(),
                        signals = out.analysis.as_ref().map_or(0, |a| a.summary.signals_created),
                        "Scheduled scan complete"
                    ),
                    Err(e) => warn!(error = %e, "Scheduled scan failed"),
                }
            }
            _ = monitor_interval.tick() => {
                match coordinator.refresh_hot_signals(Some(batch_cancel.clone())).await {
                    Ok(Some(batch)) => info!(
                        refreshed = batch.summary.signals_created,
                        failed = batch.summary.failed,
                        "Hot signals refreshed"
                    ),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Signal monitor failed"),
                }

                let pruned = store.prune_expired(chrono::Utc::now()).await;
                if pruned > 0 {
                    info!(pruned, "Expired signals pruned");
                }
                let evicted = cache.evict_expired().await;
                if evicted > 0 {
                    info!(evicted, "Expired cache entries evicted");
                }

                let signals = store.snapshot().await;
                if let Err(e) = storage::save_snapshot(&signals, &cfg.storage.snapshot_path) {
                    error!(error = %e, "Failed to save signal snapshot");
                }
            }
            _ = cancel.changed() => {
                info!("Scheduler stopping");
                break;
            }
        }
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("thub=info"));

    let json_logging = std::env::var("THUB_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
