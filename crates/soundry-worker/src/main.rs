//! Download worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use soundry_media::{
    check_ffmpeg, FfmpegTranscoder, PlatformClient, SpotifyClient, SpotifyConfig, YtDlp,
};
use soundry_models::{Clock, SystemClock};
use soundry_queue::{DispatchChannel, JobQueue, QueueConfig, RedisSafeMode};
use soundry_storage::LocalStorage;
use soundry_store::{Database, TtlCache};
use soundry_worker::{
    metrics, CircuitBreaker, CircuitBreakerConfig, IdentityPool, IdentityPoolConfig, JobExecutor,
    JobPipeline, PipelineDeps, PipelineSettings, RateLimiter, WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing()?;

    info!("Starting soundry-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("Invalid METRICS_ADDR {addr}"))?;
        metrics::init_metrics(addr)?;
        info!(%addr, "Metrics exporter listening");
    }

    let ffmpeg = check_ffmpeg().context("ffmpeg is required")?;
    info!(path = %ffmpeg.display(), "Found ffmpeg");

    let db = Database::connect(&config.database_url).await?;
    tokio::fs::create_dir_all(&config.work_dir).await?;
    tokio::fs::create_dir_all(&config.downloads_dir).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let queue = Arc::new(JobQueue::new(QueueConfig {
        redis_url: config.redis_url.clone(),
        ..QueueConfig::from_env()
    })?);
    let safe_mode = Arc::new(RedisSafeMode::new(&config.redis_url)?);
    let notifier = Arc::new(DispatchChannel::new(&config.redis_url)?);

    let limiter = RateLimiter::new(config.rate_limit_default);
    let identities = IdentityPool::discover(
        &config.cookies_dir,
        config.proxy_urls.clone(),
        IdentityPoolConfig {
            cooldown: config.identity_cooldown,
            max_failures: config.identity_max_failures,
            acquire_timeout: config.identity_acquire_timeout,
        },
    )
    .await;
    let breaker = Arc::new(CircuitBreaker::new(
        CircuitBreakerConfig::default(),
        Arc::new(limiter.clone()),
        safe_mode,
    ));

    let spotify = match SpotifyConfig::from_env() {
        Some(spotify_config) => Some(SpotifyClient::new(spotify_config)?),
        None => {
            warn!("SPOTIFY_CLIENT_ID/SPOTIFY_CLIENT_SECRET not set, Spotify tracks will fail");
            None
        }
    };

    let deps = PipelineDeps {
        tracks: db.tracks(),
        cache: TtlCache::new(db.cache(), clock.clone()),
        storage: LocalStorage::new(config.downloads_dir.clone()),
        platform: Arc::new(PlatformClient::new(YtDlp::default(), spotify)),
        transcoder: Arc::new(FfmpegTranscoder::default()),
        limiter,
        identities,
        breaker,
        clock,
    };
    let pipeline = Arc::new(JobPipeline::new(deps, PipelineSettings::from_config(&config)));
    let executor = Arc::new(JobExecutor::new(config, queue, pipeline, notifier));

    let shutdown_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown_executor.shutdown();
    });

    executor.run().await?;

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,soundry_worker=debug"))?;

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
