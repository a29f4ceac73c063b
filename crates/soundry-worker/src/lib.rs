//! Download worker.
//!
//! This crate provides:
//! - Per-category rate limiter with FIFO hand-off
//! - Exclusive identity pool with cooldown and disable states
//! - Sliding-window circuit breaker driving safe mode
//! - The per-job pipeline and the executor that feeds it
//! - Graceful shutdown

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod executor;
pub mod identity_pool;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{BreakerTransition, CircuitBreaker, CircuitBreakerConfig};
pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use identity_pool::{
    IdentityLease, IdentityPool, IdentityPoolConfig, IdentityResource, IdentityStatus, PoolStats,
    ReleaseOutcome,
};
pub use logging::JobLogger;
pub use pipeline::{JobOutcome, JobPipeline, PipelineDeps, PipelineSettings};
pub use rate_limiter::{LimitControl, RateCategory, RateLimiter, RatePermit};
