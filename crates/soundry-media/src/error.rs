//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Upstream output fragments that mean the platform is blocking or
/// throttling the identity in use.
const CRITICAL_SIGNALS: &[(&str, &str)] = &[
    ("429", "rate_limited"),
    ("Too Many Requests", "rate_limited"),
    ("rate limit", "rate_limited"),
    ("403", "forbidden"),
    ("Forbidden", "forbidden"),
    ("Sign in to confirm", "bot_check"),
    ("not a bot", "bot_check"),
    ("captcha", "captcha"),
    ("CAPTCHA", "captcha"),
];

/// Find the first critical upstream signal in `text`.
pub fn critical_signal(text: &str) -> Option<&'static str> {
    CRITICAL_SIGNALS
        .iter()
        .find(|(needle, _)| text.contains(needle))
        .map(|(_, reason)| *reason)
}

/// How a failure should be charged to the identity that made the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Block, rate-limit or captcha signal.
    Critical(String),
    /// Timeouts, crashes and everything else.
    Transient,
}

/// Errors that can occur during media processing.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("yt-dlp not found in PATH")]
    YtDlpNotFound,

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("Download failed: {message}")]
    DownloadFailed { message: String },

    #[error("Upstream blocked request ({reason}): {message}")]
    Blocked { reason: String, message: String },

    #[error("Metadata fetch failed: {0}")]
    MetadataFailed(String),

    #[error("Search returned no result for \"{0}\"")]
    NoSearchResult(String),

    #[error("Spotify API error: {0}")]
    Spotify(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Unsupported source: {0}")]
    Unsupported(String),
}

impl MediaError {
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    pub fn download_failed(message: impl Into<String>) -> Self {
        Self::DownloadFailed {
            message: message.into(),
        }
    }

    pub fn metadata_failed(message: impl Into<String>) -> Self {
        Self::MetadataFailed(message.into())
    }

    pub fn spotify(message: impl Into<String>) -> Self {
        Self::Spotify(message.into())
    }

    /// Build an error from a failed tool invocation, promoting it to
    /// [`MediaError::Blocked`] when the output carries a critical signal.
    pub fn from_tool_output(stderr: &str, fallback: impl FnOnce(String) -> MediaError) -> Self {
        let message = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("Unknown error")
            .trim()
            .to_string();
        match critical_signal(stderr) {
            Some(reason) => Self::Blocked {
                reason: reason.to_string(),
                message,
            },
            None => fallback(message),
        }
    }

    pub fn failure_class(&self) -> FailureClass {
        match self {
            MediaError::Blocked { reason, .. } => FailureClass::Critical(reason.clone()),
            MediaError::Http(e) => match e.status().map(|s| s.as_u16()) {
                Some(429) => FailureClass::Critical("rate_limited".into()),
                Some(403) => FailureClass::Critical("forbidden".into()),
                _ => FailureClass::Transient,
            },
            _ => FailureClass::Transient,
        }
    }

    /// Retrying cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            MediaError::Unsupported(_)
                | MediaError::FfmpegNotFound
                | MediaError::YtDlpNotFound
                | MediaError::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_signals_classified() {
        let err = MediaError::from_tool_output(
            "[youtube] abc: Sign in to confirm you're not a bot\n",
            MediaError::download_failed,
        );
        assert_eq!(err.failure_class(), FailureClass::Critical("bot_check".into()));

        let err = MediaError::from_tool_output(
            "ERROR: HTTP Error 429: Too Many Requests",
            MediaError::download_failed,
        );
        assert_eq!(err.failure_class(), FailureClass::Critical("rate_limited".into()));
    }

    #[test]
    fn test_other_failures_are_transient() {
        let err = MediaError::from_tool_output(
            "ERROR: unable to download: timed out\n\n",
            MediaError::download_failed,
        );
        assert!(matches!(
            &err,
            MediaError::DownloadFailed { message } if message.contains("timed out")
        ));
        assert_eq!(err.failure_class(), FailureClass::Transient);
        assert_eq!(MediaError::Timeout(30).failure_class(), FailureClass::Transient);
    }
}
