//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Per-job timeout
    pub job_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Idle poll interval when the queue is empty
    pub poll_interval: Duration,
    /// Work directory for partial downloads
    pub work_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub database_url: String,
    pub redis_url: String,
    /// Tracks longer than this fail permanently
    pub max_track_duration_secs: u32,
    pub cookies_dir: PathBuf,
    pub proxy_urls: Vec<String>,
    pub identity_cooldown: Duration,
    pub identity_max_failures: u32,
    pub identity_acquire_timeout: Duration,
    /// Default ceiling of every rate limiter category
    pub rate_limit_default: usize,
    pub metrics_addr: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            job_timeout: Duration::from_secs(1800), // 30 minutes
            shutdown_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            work_dir: PathBuf::from("/tmp/soundry"),
            downloads_dir: PathBuf::from("./downloads"),
            database_url: "sqlite://soundry.db".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            max_track_duration_secs: 900,
            cookies_dir: PathBuf::from("./cookies"),
            proxy_urls: Vec::new(),
            identity_cooldown: Duration::from_secs(20 * 60),
            identity_max_failures: 5,
            identity_acquire_timeout: Duration::from_secs(60),
            rate_limit_default: 2,
            metrics_addr: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_concurrent_jobs: env_parse("WORKER_CONCURRENCY").unwrap_or(d.max_concurrent_jobs),
            job_timeout: env_parse("JOB_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.job_timeout),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(d.shutdown_timeout),
            poll_interval: env_parse("WORKER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.poll_interval),
            work_dir: std::env::var("WORK_DIR").map(PathBuf::from).unwrap_or(d.work_dir),
            downloads_dir: std::env::var("DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.downloads_dir),
            database_url: std::env::var("DATABASE_URL").unwrap_or(d.database_url),
            redis_url: std::env::var("REDIS_URL").unwrap_or(d.redis_url),
            max_track_duration_secs: env_parse("MAX_TRACK_DURATION_SECS")
                .unwrap_or(d.max_track_duration_secs),
            cookies_dir: std::env::var("COOKIES_DIR").map(PathBuf::from).unwrap_or(d.cookies_dir),
            proxy_urls: std::env::var("PROXY_URLS")
                .map(|s| parse_list(&s))
                .unwrap_or_default(),
            identity_cooldown: env_parse("IDENTITY_COOLDOWN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.identity_cooldown),
            identity_max_failures: env_parse("IDENTITY_MAX_FAILURES")
                .unwrap_or(d.identity_max_failures),
            identity_acquire_timeout: env_parse("IDENTITY_ACQUIRE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.identity_acquire_timeout),
            rate_limit_default: env_parse("RATE_LIMIT_DEFAULT").unwrap_or(d.rate_limit_default),
            metrics_addr: std::env::var("METRICS_ADDR").ok().filter(|s| !s.is_empty()),
        }
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        assert_eq!(
            parse_list(" http://a:1, ,socks5://b:2 ,"),
            vec!["http://a:1".to_string(), "socks5://b:2".to_string()]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.max_track_duration_secs, 900);
        assert_eq!(config.identity_cooldown, Duration::from_secs(1200));
        assert_eq!(config.rate_limit_default, 2);
    }
}
