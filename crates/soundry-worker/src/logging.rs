//! Structured job logging.

use soundry_models::{JobId, TrackId};
use tracing::{error, info, warn, Span};

/// Logs job lifecycle events with the job, track and attempt attached.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    track_id: String,
    attempt: u32,
}

impl JobLogger {
    pub fn new(job_id: &JobId, track_id: &TrackId, attempt: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            track_id: track_id.to_string(),
            attempt,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            track_id = %self.track_id,
            attempt = self.attempt,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            track_id = %self.track_id,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            track_id = %self.track_id,
            attempt = self.attempt,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            track_id = %self.track_id,
            attempt = self.attempt,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            track_id = %self.track_id,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Span carrying the job context for everything the pipeline logs.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            track_id = %self.track_id,
            attempt = self.attempt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_creation() {
        let job_id = JobId::from_string("job-1");
        let track_id = TrackId::from_string("track-1");
        let logger = JobLogger::new(&job_id, &track_id, 2);

        assert_eq!(logger.job_id(), "job-1");
        assert_eq!(logger.track_id(), "track-1");
        assert_eq!(logger.attempt, 2);
    }
}
