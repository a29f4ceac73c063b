//! Scheduler binary: dispatcher and cleanup sweep.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use soundry_models::{Clock, SystemClock};
use soundry_queue::{DispatchChannel, JobQueue, QueueConfig, RedisSafeMode};
use soundry_scheduler::{metrics, CleanupSweep, Dispatcher, SchedulerConfig};
use soundry_storage::LocalStorage;
use soundry_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing()?;

    info!("Starting soundry-scheduler");

    let config = SchedulerConfig::from_env();
    info!("Scheduler config: {:?}", config);

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("Invalid METRICS_ADDR {addr}"))?;
        metrics::init_metrics(addr)?;
        info!(%addr, "Metrics exporter listening");
    }

    let db = Database::connect(&config.database_url).await?;
    tokio::fs::create_dir_all(&config.downloads_dir).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let broker = Arc::new(JobQueue::new(QueueConfig {
        redis_url: config.redis_url.clone(),
        ..QueueConfig::from_env()
    })?);
    let safe_mode = Arc::new(RedisSafeMode::new(&config.redis_url)?);
    let channel = DispatchChannel::new(&config.redis_url)?;
    let triggers = match channel.subscribe().await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "Could not subscribe to dispatch triggers, running on interval only");
            None
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Arc::new(Dispatcher::new(
        db.tracks(),
        db.sessions(),
        broker,
        safe_mode,
        config.group_concurrency_cap,
    ));
    let dispatch_task = tokio::spawn(dispatcher.run(
        config.dispatch_interval,
        triggers,
        shutdown_rx.clone(),
    ));

    let cleanup_task = if config.cleanup_enabled {
        let sweep = Arc::new(CleanupSweep::new(
            db.tracks(),
            LocalStorage::new(config.downloads_dir.clone()),
            clock,
            config.max_active_tracks,
        ));
        Some(tokio::spawn(sweep.run(config.cleanup_interval, shutdown_rx)))
    } else {
        info!("Cleanup sweep is disabled");
        None
    };

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    dispatch_task.await?;
    if let Some(task) = cleanup_task {
        task.await?;
    }

    info!("Scheduler shutdown complete");
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,soundry_scheduler=debug"))?;

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
    Ok(())
}
