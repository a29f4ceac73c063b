//! Per-category concurrency limiter with FIFO hand-off.
//!
//! Each [`RateCategory`] has a mutable ceiling. A released slot goes
//! straight to the longest waiter instead of being returned to the pool, so
//! late arrivals cannot overtake queued callers.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Outbound operation kinds with independent ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCategory {
    Resolve,
    Metadata,
    Download,
}

impl RateCategory {
    pub const ALL: [RateCategory; 3] = [
        RateCategory::Resolve,
        RateCategory::Metadata,
        RateCategory::Download,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateCategory::Resolve => "resolve",
            RateCategory::Metadata => "metadata",
            RateCategory::Download => "download",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ceiling control used by the circuit breaker. The limiter never calls back.
pub trait LimitControl: Send + Sync {
    fn set_all_limits(&self, limit: usize);
    fn restore_defaults(&self);
}

#[derive(Default)]
struct Slot {
    limit: usize,
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl Slot {
    /// Hand free capacity to waiters in arrival order.
    fn admit_waiters(&mut self) {
        while self.active < self.limit {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.send(()).is_ok() {
                self.active += 1;
            }
        }
    }

    fn release(&mut self) {
        // Hand over only while the slot still fits under the (possibly lowered) ceiling.
        if self.active <= self.limit {
            while let Some(waiter) = self.waiters.pop_front() {
                if waiter.send(()).is_ok() {
                    return;
                }
            }
        }
        self.active = self.active.saturating_sub(1);
    }
}

struct Inner {
    default_limit: usize,
    slots: [Mutex<Slot>; 3],
}

/// Shared limiter handle.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    pub fn new(default_limit: usize) -> Self {
        let slot = || {
            Mutex::new(Slot {
                limit: default_limit,
                ..Slot::default()
            })
        };
        Self {
            inner: Arc::new(Inner {
                default_limit,
                slots: [slot(), slot(), slot()],
            }),
        }
    }

    fn slot(&self, category: RateCategory) -> &Mutex<Slot> {
        &self.inner.slots[category.index()]
    }

    /// Wait for a slot in `category`. Never times out; callers bound it with
    /// the job timeout.
    pub async fn acquire(&self, category: RateCategory) -> RatePermit {
        loop {
            let rx = {
                let mut slot = self.slot(category).lock();
                if slot.active < slot.limit && slot.waiters.is_empty() {
                    slot.active += 1;
                    return self.permit(category);
                }
                let (tx, rx) = oneshot::channel();
                slot.waiters.push_back(tx);
                debug!(
                    category = %category,
                    queued = slot.waiters.len(),
                    "Waiting for rate limit slot"
                );
                rx
            };

            let mut pending = PendingSlot {
                limiter: self,
                category,
                rx,
                granted: false,
            };
            if (&mut pending.rx).await.is_ok() {
                pending.granted = true;
                return self.permit(category);
            }
        }
    }

    fn permit(&self, category: RateCategory) -> RatePermit {
        RatePermit {
            limiter: self.clone(),
            category,
        }
    }

    fn release(&self, category: RateCategory) {
        self.slot(category).lock().release();
    }

    /// Run `op` while holding a slot. The slot is released on every exit path.
    pub async fn run<F, T>(&self, category: RateCategory, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire(category).await;
        op.await
    }

    /// Change one ceiling. Active holders keep their slots.
    pub fn set_limit(&self, category: RateCategory, limit: usize) {
        let mut slot = self.slot(category).lock();
        slot.limit = limit.max(1);
        slot.admit_waiters();
        info!(category = %category, limit = slot.limit, "Rate limit changed");
    }

    pub fn limit(&self, category: RateCategory) -> usize {
        self.slot(category).lock().limit
    }

    pub fn active(&self, category: RateCategory) -> usize {
        self.slot(category).lock().active
    }

    pub fn waiting(&self, category: RateCategory) -> usize {
        self.slot(category).lock().waiters.len()
    }
}

impl LimitControl for RateLimiter {
    fn set_all_limits(&self, limit: usize) {
        for category in RateCategory::ALL {
            self.set_limit(category, limit);
        }
    }

    fn restore_defaults(&self) {
        self.set_all_limits(self.inner.default_limit);
    }
}

/// A held slot; dropping it releases the slot.
pub struct RatePermit {
    limiter: RateLimiter,
    category: RateCategory,
}

impl fmt::Debug for RatePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatePermit")
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        self.limiter.release(self.category);
    }
}

/// A queued acquire. If it is dropped after a slot was handed to it but
/// before it observed the grant, the slot is passed on.
struct PendingSlot<'a> {
    limiter: &'a RateLimiter,
    category: RateCategory,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.limiter.release(self.category);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_slots_are_handed_over_fifo() {
        let limiter = RateLimiter::new(1);
        let held = limiter.acquire(RateCategory::Download).await;

        let mut first = task::spawn(limiter.acquire(RateCategory::Download));
        let mut second = task::spawn(limiter.acquire(RateCategory::Download));
        assert_pending!(first.poll());
        assert_pending!(second.poll());
        assert_eq!(limiter.waiting(RateCategory::Download), 2);

        drop(held);
        assert!(first.is_woken());
        let first_permit = assert_ready!(first.poll());
        assert_pending!(second.poll());
        assert_eq!(limiter.active(RateCategory::Download), 1);

        drop(first_permit);
        let _second_permit = assert_ready!(second.poll());
        assert_eq!(limiter.active(RateCategory::Download), 1);
    }

    #[tokio::test]
    async fn test_categories_are_independent() {
        let limiter = RateLimiter::new(1);
        let _download = limiter.acquire(RateCategory::Download).await;
        let mut metadata = task::spawn(limiter.acquire(RateCategory::Metadata));
        let permit = assert_ready!(metadata.poll());
        assert!(format!("{permit:?}").contains("Metadata"));
    }

    #[tokio::test]
    async fn test_lowered_limit_keeps_active_holders() {
        let limiter = RateLimiter::new(2);
        let a = limiter.acquire(RateCategory::Resolve).await;
        let b = limiter.acquire(RateCategory::Resolve).await;

        limiter.set_limit(RateCategory::Resolve, 1);
        assert_eq!(limiter.active(RateCategory::Resolve), 2);

        let mut waiter = task::spawn(limiter.acquire(RateCategory::Resolve));
        assert_pending!(waiter.poll());

        // Two holders over a ceiling of one: the first release only shrinks.
        drop(a);
        assert_pending!(waiter.poll());
        assert_eq!(limiter.active(RateCategory::Resolve), 1);

        drop(b);
        let _permit = assert_ready!(waiter.poll());
        assert_eq!(limiter.active(RateCategory::Resolve), 1);
    }

    #[tokio::test]
    async fn test_raising_limit_admits_waiters() {
        let limiter = RateLimiter::new(1);
        let _held = limiter.acquire(RateCategory::Metadata).await;
        let mut waiter = task::spawn(limiter.acquire(RateCategory::Metadata));
        assert_pending!(waiter.poll());

        limiter.set_limit(RateCategory::Metadata, 2);
        let _permit = assert_ready!(waiter.poll());
        assert_eq!(limiter.active(RateCategory::Metadata), 2);
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_leak_slot() {
        let limiter = RateLimiter::new(1);
        let held = limiter.acquire(RateCategory::Download).await;

        let mut abandoned = task::spawn(limiter.acquire(RateCategory::Download));
        assert_pending!(abandoned.poll());
        drop(held);
        // Granted but never polled again.
        drop(abandoned);

        assert_eq!(limiter.active(RateCategory::Download), 0);
        let _permit = limiter.acquire(RateCategory::Download).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_releases_on_error() {
        let limiter = RateLimiter::new(1);
        let result: Result<(), &str> = limiter
            .run(RateCategory::Resolve, async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err("boom")
            })
            .await;
        assert!(result.is_err());
        assert_eq!(limiter.active(RateCategory::Resolve), 0);
    }
}
