//! Download job payloads carried by the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::provider::ProviderRef;
use crate::session::GroupId;
use crate::track::{AudioFormat, TrackId};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker priority. Lower values are serviced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum JobPriority {
    /// Ungrouped single-track work.
    Single = 1,
    /// Work expanded from a playlist or album.
    Grouped = 5,
}

impl JobPriority {
    pub fn for_group(grouped: bool) -> Self {
        if grouped {
            JobPriority::Grouped
        } else {
            JobPriority::Single
        }
    }

    pub fn value(self) -> u8 {
        self as u8
    }
}

impl From<JobPriority> for u8 {
    fn from(p: JobPriority) -> Self {
        p.value()
    }
}

impl TryFrom<u8> for JobPriority {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(JobPriority::Single),
            5 => Ok(JobPriority::Grouped),
            other => Err(format!("invalid job priority {other}")),
        }
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { initial_ms: u64 },
}

/// Attempt budget attached to every enqueued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// 5 attempts, exponential backoff starting at 2s.
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Backoff::Exponential { initial_ms: 2_000 },
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempts_made` failed attempts.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { initial_ms } => {
                let exp = attempts_made.saturating_sub(1).min(20);
                Duration::from_millis(initial_ms.saturating_mul(1u64 << exp))
            }
        }
    }

    pub fn is_last_attempt(&self, attempt: u32) -> bool {
        attempt >= self.attempts
    }
}

/// Work handed to a worker executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub job_id: JobId,
    pub track_id: TrackId,
    pub session_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub source: ProviderRef,
    /// Canonical URL derived from `source`.
    pub url: String,
    pub formats: Vec<AudioFormat>,
    pub created_at: DateTime<Utc>,
}

impl DownloadJob {
    pub fn new(
        track_id: TrackId,
        session_token: impl Into<String>,
        group_id: Option<GroupId>,
        source: ProviderRef,
        formats: Vec<AudioFormat>,
    ) -> Self {
        let url = source.canonical_url();
        Self {
            job_id: JobId::new(),
            track_id,
            session_token: session_token.into(),
            group_id,
            source,
            url,
            formats,
            created_at: Utc::now(),
        }
    }

    pub fn priority(&self) -> JobPriority {
        JobPriority::for_group(self.group_id.is_some())
    }
}
