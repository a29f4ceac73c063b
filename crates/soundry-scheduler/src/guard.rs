//! Re-entrancy guard shared by the periodic runners.

use std::sync::atomic::{AtomicBool, Ordering};

/// Holds a running flag set; dropping it clears the flag however the run
/// ends, including by panic.
pub(crate) struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    /// Set `flag`, or return `None` if it was already set.
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn test_second_acquire_is_refused() {
        let flag = AtomicBool::new(false);
        let guard = RunGuard::try_acquire(&flag).unwrap();
        assert!(RunGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(!flag.load(Ordering::SeqCst));
        assert!(RunGuard::try_acquire(&flag).is_some());
    }

    #[test]
    fn test_flag_clears_after_panic() {
        let flag = AtomicBool::new(false);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = RunGuard::try_acquire(&flag).unwrap();
            panic!("sweep blew up");
        }));
        assert!(result.is_err());
        assert!(!flag.load(Ordering::SeqCst));
    }
}
