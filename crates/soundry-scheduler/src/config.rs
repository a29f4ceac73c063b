//! Scheduler configuration.

use std::path::PathBuf;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period of the reconciliation run
    pub dispatch_interval: Duration,
    /// Processing items allowed per group
    pub group_concurrency_cap: usize,
    pub cleanup_interval: Duration,
    pub cleanup_enabled: bool,
    /// Tracks kept before the oldest are reclaimed
    pub max_active_tracks: u64,
    pub downloads_dir: PathBuf,
    pub database_url: String,
    pub redis_url: String,
    pub metrics_addr: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(5000),
            group_concurrency_cap: 1,
            cleanup_interval: Duration::from_secs(600),
            cleanup_enabled: true,
            max_active_tracks: 500,
            downloads_dir: PathBuf::from("./downloads"),
            database_url: "sqlite://soundry.db".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            metrics_addr: None,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            dispatch_interval: env_parse("DISPATCH_INTERVAL_MS")
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(d.dispatch_interval),
            group_concurrency_cap: env_parse("GROUP_CONCURRENCY_CAP")
                .filter(|cap: &usize| *cap > 0)
                .unwrap_or(d.group_concurrency_cap),
            cleanup_interval: env_parse("CLEANUP_INTERVAL_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.cleanup_interval),
            cleanup_enabled: env_flag("CLEANUP_ENABLED").unwrap_or(d.cleanup_enabled),
            max_active_tracks: env_parse("MAX_ACTIVE_TRACKS").unwrap_or(d.max_active_tracks),
            downloads_dir: std::env::var("DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.downloads_dir),
            database_url: std::env::var("DATABASE_URL").unwrap_or(d.database_url),
            redis_url: std::env::var("REDIS_URL").unwrap_or(d.redis_url),
            metrics_addr: std::env::var("METRICS_ADDR").ok().filter(|s| !s.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.dispatch_interval, Duration::from_secs(5));
        assert_eq!(config.group_concurrency_cap, 1);
        assert_eq!(config.cleanup_interval, Duration::from_secs(600));
        assert_eq!(config.max_active_tracks, 500);
        assert!(config.cleanup_enabled);
    }
}
