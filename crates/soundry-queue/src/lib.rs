//! Job broker and cross-process signals.
//!
//! This crate provides:
//! - A priority job broker with retry/backoff and dead-lettering
//!   (Redis sorted sets, plus an in-memory backend)
//! - The shared safe-mode flag set by the circuit breaker
//! - The dispatch trigger channel via Redis Pub/Sub

pub mod broker;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod queue;
pub mod safe_mode;

pub use broker::{DeadLetter, Delivery, FailOutcome, JobBroker, JobSource, QueueDepth, QueuedJob};
pub use dispatch::{
    DispatchChannel, DispatchNotifier, DispatchReason, LocalDispatch, DISPATCH_CHANNEL,
};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryQueue;
pub use queue::{JobQueue, QueueConfig};
pub use safe_mode::{LocalSafeMode, RedisSafeMode, SafeModeFlag, SAFE_MODE_KEY};
