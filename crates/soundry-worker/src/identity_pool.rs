//! Exclusive pool of outbound identities (cookie jar + proxy).
//!
//! A resource is held by at most one caller. Critical upstream failures put
//! it into cooldown, and enough consecutive ones disable it until a manual
//! [`IdentityPool::reset`]. Waiters are served in arrival order.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use soundry_media::{validate_cookie_file, RequestIdentity};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStatus {
    Available,
    Busy,
    CoolingDown,
    Disabled,
}

/// How the holder's work went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    /// Block, rate-limit or captcha signal.
    CriticalFailure(String),
    TransientFailure,
}

#[derive(Debug, Clone)]
pub struct IdentityResource {
    pub id: String,
    pub cookies_path: Option<PathBuf>,
    pub proxy_url: Option<String>,
    pub status: IdentityStatus,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<Instant>,
    pub last_used: Option<Instant>,
    pub usage_count: u64,
}

impl IdentityResource {
    fn new(id: String, cookies_path: Option<PathBuf>, proxy_url: Option<String>) -> Self {
        Self {
            id,
            cookies_path,
            proxy_url,
            status: IdentityStatus::Available,
            consecutive_failures: 0,
            cooldown_until: None,
            last_used: None,
            usage_count: 0,
        }
    }

    fn request_identity(&self) -> RequestIdentity {
        RequestIdentity {
            label: self.id.clone(),
            proxy_url: self.proxy_url.clone(),
            cookies_path: self.cookies_path.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityPoolConfig {
    pub cooldown: Duration,
    pub max_failures: u32,
    pub acquire_timeout: Duration,
}

impl Default for IdentityPoolConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(20 * 60),
            max_failures: 5,
            acquire_timeout: Duration::from_secs(60),
        }
    }
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    pub cooling_down: usize,
    pub disabled: usize,
}

struct PoolState {
    resources: Vec<IdentityResource>,
    waiters: VecDeque<oneshot::Sender<usize>>,
}

impl PoolState {
    /// Flip expired cooldowns back to available.
    fn refresh(&mut self, now: Instant) {
        for r in &mut self.resources {
            let expired = r.cooldown_until.is_some_and(|until| until <= now);
            if r.status == IdentityStatus::CoolingDown && expired {
                r.status = IdentityStatus::Available;
                r.cooldown_until = None;
                info!(identity = %r.id, "Identity cooldown finished");
            }
        }
    }

    /// Least recently used available resource; never-used ones first.
    fn pick(&self) -> Option<usize> {
        self.resources
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == IdentityStatus::Available)
            .min_by_key(|(_, r)| r.last_used)
            .map(|(i, _)| i)
    }

    fn mark_busy(&mut self, index: usize, now: Instant) {
        let r = &mut self.resources[index];
        r.status = IdentityStatus::Busy;
        r.last_used = Some(now);
        r.usage_count += 1;
    }

    /// Give available resources to waiters in arrival order.
    fn serve_waiters(&mut self, now: Instant) {
        while !self.waiters.is_empty() {
            let Some(index) = self.pick() else {
                return;
            };
            self.mark_busy(index, now);
            let mut delivered = false;
            while let Some(waiter) = self.waiters.pop_front() {
                if waiter.send(index).is_ok() {
                    delivered = true;
                    break;
                }
            }
            if !delivered {
                self.resources[index].status = IdentityStatus::Available;
                return;
            }
        }
    }

    fn next_cooldown_end(&self) -> Option<Instant> {
        self.resources
            .iter()
            .filter(|r| r.status == IdentityStatus::CoolingDown)
            .filter_map(|r| r.cooldown_until)
            .min()
    }

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.resources.len(),
            ..PoolStats::default()
        };
        for r in &self.resources {
            match r.status {
                IdentityStatus::Available => stats.available += 1,
                IdentityStatus::Busy => stats.busy += 1,
                IdentityStatus::CoolingDown => stats.cooling_down += 1,
                IdentityStatus::Disabled => stats.disabled += 1,
            }
        }
        stats
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    config: IdentityPoolConfig,
}

/// Shared pool handle.
#[derive(Clone)]
pub struct IdentityPool {
    inner: Arc<PoolInner>,
}

impl IdentityPool {
    /// Pair each cookie file with a proxy chosen round-robin. Without cookies
    /// there is one resource per proxy, and without either a single direct one.
    pub fn from_sources(
        cookies: Vec<PathBuf>,
        proxies: Vec<String>,
        config: IdentityPoolConfig,
    ) -> Self {
        let resources = if !cookies.is_empty() {
            cookies
                .into_iter()
                .enumerate()
                .map(|(i, path)| {
                    let proxy = (!proxies.is_empty()).then(|| proxies[i % proxies.len()].clone());
                    IdentityResource::new(format!("cookie-{}", i + 1), Some(path), proxy)
                })
                .collect()
        } else if !proxies.is_empty() {
            proxies
                .into_iter()
                .enumerate()
                .map(|(i, proxy)| {
                    IdentityResource::new(format!("proxy-{}", i + 1), None, Some(proxy))
                })
                .collect()
        } else {
            vec![IdentityResource::new("direct".to_string(), None, None)]
        };

        info!(resources = resources.len(), "Identity pool initialized");
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    resources,
                    waiters: VecDeque::new(),
                }),
                config,
            }),
        }
    }

    /// Discover cookie files and build the pool.
    pub async fn discover(
        cookies_dir: &Path,
        proxies: Vec<String>,
        config: IdentityPoolConfig,
    ) -> Self {
        let cookies = discover_cookie_files(cookies_dir).await;
        Self::from_sources(cookies, proxies, config)
    }

    /// Take the least recently used available resource, waiting up to the
    /// configured timeout.
    pub async fn acquire(&self) -> WorkerResult<IdentityLease> {
        let timeout = self.inner.config.acquire_timeout;
        let deadline = Instant::now() + timeout;

        let rx = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            state.refresh(now);
            state.waiters.retain(|w| !w.is_closed());
            if state.waiters.is_empty() {
                if let Some(index) = state.pick() {
                    state.mark_busy(index, now);
                    return Ok(self.lease(&state, index));
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!(queued = state.waiters.len(), "Waiting for an identity");
            state.serve_waiters(now);
            rx
        };

        let mut pending = PendingLease {
            pool: self,
            rx,
            granted: false,
        };
        loop {
            // Nobody releases a cooling resource, so wake up when one expires.
            let wake_at = {
                let state = self.inner.state.lock();
                state.next_cooldown_end().map_or(deadline, |t| t.min(deadline))
            };
            tokio::select! {
                granted = &mut pending.rx => {
                    return match granted {
                        Ok(index) => {
                            pending.granted = true;
                            let state = self.inner.state.lock();
                            Ok(self.lease(&state, index))
                        }
                        Err(_) => Err(WorkerError::job_failed("identity pool closed")),
                    };
                }
                _ = tokio::time::sleep_until(wake_at) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(
                            timeout_secs = timeout.as_secs(),
                            "Timed out waiting for an identity"
                        );
                        metrics::record_identity_timeout();
                        return Err(WorkerError::ResourceTimeout(timeout));
                    }
                    let mut state = self.inner.state.lock();
                    state.refresh(now);
                    state.serve_waiters(now);
                }
            }
        }
    }

    fn lease(&self, state: &PoolState, index: usize) -> IdentityLease {
        let resource = &state.resources[index];
        debug!(identity = %resource.id, uses = resource.usage_count, "Identity acquired");
        IdentityLease {
            pool: self.clone(),
            index,
            identity: resource.request_identity(),
            released: false,
        }
    }

    /// Release by id. Unknown ids and resources that are not held are
    /// reported as errors.
    pub fn release(&self, id: &str, outcome: ReleaseOutcome) -> WorkerResult<()> {
        let index = {
            let state = self.inner.state.lock();
            state.resources.iter().position(|r| r.id == id)
        };
        match index {
            Some(index) => self.release_index(index, outcome),
            None => {
                error!(identity = id, "Release of unknown identity");
                Err(WorkerError::UnknownIdentity(id.to_string()))
            }
        }
    }

    fn release_index(&self, index: usize, outcome: ReleaseOutcome) -> WorkerResult<()> {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock();
        let now = Instant::now();

        let resource = &mut state.resources[index];
        if resource.status != IdentityStatus::Busy {
            error!(
                identity = %resource.id,
                status = ?resource.status,
                "Release of identity that is not held"
            );
            return Err(WorkerError::IdentityNotHeld(resource.id.clone()));
        }

        match &outcome {
            ReleaseOutcome::Success => {
                resource.consecutive_failures = 0;
                resource.status = IdentityStatus::Available;
            }
            ReleaseOutcome::TransientFailure => {
                resource.status = IdentityStatus::Available;
            }
            ReleaseOutcome::CriticalFailure(reason) => {
                resource.consecutive_failures += 1;
                if resource.consecutive_failures >= config.max_failures {
                    resource.status = IdentityStatus::Disabled;
                    resource.cooldown_until = None;
                    error!(
                        identity = %resource.id,
                        failures = resource.consecutive_failures,
                        reason = %reason,
                        "Identity disabled"
                    );
                } else {
                    resource.status = IdentityStatus::CoolingDown;
                    resource.cooldown_until = Some(now + config.cooldown);
                    warn!(
                        identity = %resource.id,
                        failures = resource.consecutive_failures,
                        reason = %reason,
                        cooldown_secs = config.cooldown.as_secs(),
                        "Identity cooling down"
                    );
                }
            }
        }

        state.refresh(now);
        state.serve_waiters(now);
        let stats = state.stats();
        drop(state);

        debug!(?outcome, ?stats, "Identity released");
        metrics::record_identity_stats(&stats);
        Ok(())
    }

    /// Return every disabled or cooling resource to service.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        for r in &mut state.resources {
            if matches!(r.status, IdentityStatus::Disabled | IdentityStatus::CoolingDown) {
                r.status = IdentityStatus::Available;
                r.cooldown_until = None;
                r.consecutive_failures = 0;
            }
        }
        state.serve_waiters(Instant::now());
        info!("Identity pool reset");
    }

    pub fn stats(&self) -> PoolStats {
        let mut state = self.inner.state.lock();
        state.refresh(Instant::now());
        state.stats()
    }

    /// Snapshot of one resource.
    pub fn resource(&self, id: &str) -> Option<IdentityResource> {
        let mut state = self.inner.state.lock();
        state.refresh(Instant::now());
        state.resources.iter().find(|r| r.id == id).cloned()
    }
}

/// An exclusively held identity. Release it with an outcome; dropping it
/// unreleased returns it as a transient failure.
pub struct IdentityLease {
    pool: IdentityPool,
    index: usize,
    identity: RequestIdentity,
    released: bool,
}

impl IdentityLease {
    pub fn id(&self) -> &str {
        &self.identity.label
    }

    pub fn identity(&self) -> &RequestIdentity {
        &self.identity
    }

    pub fn release(mut self, outcome: ReleaseOutcome) -> WorkerResult<()> {
        self.released = true;
        self.pool.release_index(self.index, outcome)
    }
}

impl fmt::Debug for IdentityLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityLease")
            .field("id", &self.identity.label)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for IdentityLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(identity = %self.identity.label, "Identity lease dropped without release");
            let _ = self.pool.release_index(self.index, ReleaseOutcome::TransientFailure);
        }
    }
}

/// A queued acquire; a resource handed to it after it stopped waiting is
/// passed on.
struct PendingLease<'a> {
    pool: &'a IdentityPool,
    rx: oneshot::Receiver<usize>,
    granted: bool,
}

impl Drop for PendingLease<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if let Ok(index) = self.rx.try_recv() {
            let _ = self.pool.release_index(index, ReleaseOutcome::TransientFailure);
        }
    }
}

/// Valid Netscape cookie files (`*.txt`) in `dir`, sorted by name.
pub async fn discover_cookie_files(dir: &Path) -> Vec<PathBuf> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "No cookies directory");
            return Vec::new();
        }
    };

    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.extension().is_some_and(|ext| ext == "txt") {
            continue;
        }
        if validate_cookie_file(&path).await {
            files.push(path);
        } else {
            warn!(path = %path.display(), "Skipping cookie file that is not in Netscape format");
        }
    }
    files.sort();
    files
}
