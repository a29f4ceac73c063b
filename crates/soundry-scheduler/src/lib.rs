//! Scheduling side of Soundry.
//!
//! This crate provides:
//! - Admission of track and playlist submissions
//! - The group-fair dispatcher feeding the job broker
//! - The cleanup sweep reclaiming expired, cancelled and surplus tracks

pub mod admission;
pub mod cleanup;
pub mod config;
pub mod dispatcher;
pub mod error;
mod guard;
pub mod metrics;

pub use admission::{Admission, Submission};
pub use cleanup::{CleanupReport, CleanupSweep};
pub use config::SchedulerConfig;
pub use dispatcher::{DispatchReport, Dispatcher, TriggerStream};
pub use error::{AdmissionError, AdmissionResult, SchedulerError, SchedulerResult};
