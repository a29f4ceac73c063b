//! Sliding-window circuit breaker.
//!
//! Opening sets the shared safe-mode flag and drops every rate limiter
//! ceiling to one. The breaker only pushes into the limiter; the limiter
//! never calls back.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use soundry_queue::SafeModeFlag;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::metrics;
use crate::rate_limiter::LimitControl;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Outcomes kept in the window
    pub window: usize,
    /// No decision below this many samples
    pub min_samples: usize,
    /// Open when the failure rate exceeds this
    pub failure_threshold: f64,
    /// Outcomes examined while open
    pub recovery_window: usize,
    /// Successes within `recovery_window` needed to close
    pub recovery_successes: usize,
    /// Force-close after being open this long
    pub open_timeout: Duration,
    /// Rate limiter ceiling while open
    pub open_limit: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 5,
            failure_threshold: 0.5,
            recovery_window: 5,
            recovery_successes: 4,
            open_timeout: Duration::from_secs(5 * 60),
            open_limit: 1,
        }
    }
}

/// What a recorded outcome changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    None,
    Opened,
    Closed { forced: bool },
}

struct BreakerState {
    window: VecDeque<bool>,
    open: bool,
    changed_at: Instant,
}

pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    limits: Arc<dyn LimitControl>,
    safe_mode: Arc<dyn SafeModeFlag>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(
        config: CircuitBreakerConfig,
        limits: Arc<dyn LimitControl>,
        safe_mode: Arc<dyn SafeModeFlag>,
    ) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                window: VecDeque::with_capacity(config.window),
                open: false,
                changed_at: Instant::now(),
            }),
            limits,
            safe_mode,
            config,
        }
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.open
    }

    /// Record one job attempt.
    pub async fn record(&self, success: bool) -> BreakerTransition {
        let mut state = self.state.lock().await;
        state.window.push_back(success);
        while state.window.len() > self.config.window {
            state.window.pop_front();
        }

        let samples = state.window.len();
        if samples < self.config.min_samples {
            return BreakerTransition::None;
        }

        if !state.open {
            let failures = state.window.iter().filter(|ok| !**ok).count();
            let rate = failures as f64 / samples as f64;
            if rate > self.config.failure_threshold {
                state.open = true;
                state.changed_at = Instant::now();
                warn!(failures, samples, rate, "Circuit breaker opened, entering safe mode");
                self.limits.set_all_limits(self.config.open_limit);
                if let Err(e) = self.safe_mode.set().await {
                    error!(error = %e, "Failed to set safe mode flag");
                }
                metrics::record_breaker_state(true);
                return BreakerTransition::Opened;
            }
            return BreakerTransition::None;
        }

        let recent_successes = state
            .window
            .iter()
            .rev()
            .take(self.config.recovery_window)
            .filter(|ok| **ok)
            .count();
        let forced = if recent_successes >= self.config.recovery_successes {
            false
        } else if state.changed_at.elapsed() > self.config.open_timeout {
            true
        } else {
            return BreakerTransition::None;
        };

        state.open = false;
        state.changed_at = Instant::now();
        state.window.clear();
        info!(forced, recent_successes, "Circuit breaker closed, leaving safe mode");
        self.limits.restore_defaults();
        if let Err(e) = self.safe_mode.clear().await {
            error!(error = %e, "Failed to clear safe mode flag");
        }
        metrics::record_breaker_state(false);
        BreakerTransition::Closed { forced }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::{RateCategory, RateLimiter};
    use soundry_queue::LocalSafeMode;

    fn breaker() -> (CircuitBreaker, RateLimiter, Arc<LocalSafeMode>) {
        let limiter = RateLimiter::new(2);
        let flag = Arc::new(LocalSafeMode::default());
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            Arc::new(limiter.clone()),
            flag.clone(),
        );
        (breaker, limiter, flag)
    }

    fn ceilings(limiter: &RateLimiter) -> Vec<usize> {
        RateCategory::ALL.iter().map(|c| limiter.limit(*c)).collect()
    }

    #[tokio::test]
    async fn test_trip_and_recover() {
        let (breaker, limiter, flag) = breaker();

        for _ in 0..4 {
            assert_eq!(breaker.record(false).await, BreakerTransition::None);
        }
        assert_eq!(breaker.record(false).await, BreakerTransition::Opened);
        assert!(breaker.is_open().await);
        assert!(flag.is_set().await.unwrap());
        assert_eq!(ceilings(&limiter), vec![1, 1, 1]);

        for _ in 0..3 {
            assert_eq!(breaker.record(true).await, BreakerTransition::None);
        }
        assert_eq!(breaker.record(true).await, BreakerTransition::Closed { forced: false });
        assert!(!flag.is_set().await.unwrap());
        assert_eq!(ceilings(&limiter), vec![2, 2, 2]);

        // Window was reset, so one failure cannot re-trip it.
        assert_eq!(breaker.record(false).await, BreakerTransition::None);
    }

    #[tokio::test]
    async fn test_half_failures_do_not_trip() {
        let (breaker, _limiter, flag) = breaker();
        for success in [true, false, true, false, true, false] {
            assert_eq!(breaker.record(success).await, BreakerTransition::None);
        }
        assert!(!flag.is_set().await.unwrap());
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (breaker, _limiter, _flag) = breaker();
        for _ in 0..20 {
            breaker.record(true).await;
        }
        // 10 failures of 20 is exactly half; the 11th crosses it.
        for _ in 0..10 {
            assert_eq!(breaker.record(false).await, BreakerTransition::None);
        }
        assert_eq!(breaker.record(false).await, BreakerTransition::Opened);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_close_after_timeout() {
        let (breaker, limiter, flag) = breaker();
        for _ in 0..5 {
            breaker.record(false).await;
        }
        assert!(breaker.is_open().await);

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert_eq!(breaker.record(false).await, BreakerTransition::None);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.record(false).await, BreakerTransition::Closed { forced: true });
        assert!(!flag.is_set().await.unwrap());
        assert_eq!(ceilings(&limiter), vec![2, 2, 2]);
    }
}
