//! FFmpeg command builder, runner and the audio transcoder.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use soundry_models::AudioFormat;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: PathBuf,
    output: PathBuf,
    /// Arguments placed after `-i`
    output_args: Vec<String>,
    log_level: String,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
            log_level: "error".to_string(),
        }
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Drop any video stream (cover art etc).
    pub fn no_video(self) -> Self {
        self.output_arg("-vn")
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    pub fn audio_bitrate(self, bitrate: impl Into<String>) -> Self {
        self.output_arg("-b:a").output_arg(bitrate)
    }

    /// Encoder settings for a target format.
    pub fn for_format(self, format: AudioFormat) -> Self {
        let cmd = self.no_video();
        match format {
            AudioFormat::Mp3 => cmd.audio_codec("libmp3lame").audio_bitrate("320k"),
            AudioFormat::Flac => cmd.audio_codec("flac"),
            AudioFormat::Wav => cmd.audio_codec("pcm_s16le"),
        }
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-v".to_string(),
            self.log_level.clone(),
            "-i".to_string(),
            self.input.to_string_lossy().to_string(),
        ];
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// Runs FFmpeg with an optional timeout and cancellation signal.
#[derive(Default)]
pub struct FfmpegRunner {
    cancel_rx: Option<watch::Receiver<bool>>,
    timeout: Option<Duration>,
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<()> {
        check_ffmpeg()?;

        let args = cmd.build_args();
        debug!("Running FFmpeg: ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let deadline = async {
            match self.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match self.cancel_rx.clone() {
                Some(mut rx) => {
                    if rx.wait_for(|c| *c).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending().await,
            }
        };

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = deadline => {
                let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!("FFmpeg timed out after {} seconds, killing process", secs);
                let _ = child.kill().await;
                return Err(MediaError::Timeout(secs));
            }
            _ = cancelled => {
                info!("FFmpeg cancelled, killing process");
                let _ = child.kill().await;
                return Err(MediaError::Cancelled);
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            let message = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("FFmpeg exited with non-zero status")
                .to_string();
            Err(MediaError::ffmpeg_failed(message, Some(stderr), status.code()))
        }
    }
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

/// Converts a downloaded source file into one output format.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Write `dest` in `format` and return its size in bytes.
    async fn transcode(&self, source: &Path, dest: &Path, format: AudioFormat) -> MediaResult<u64>;
}

/// [`Transcoder`] backed by the ffmpeg binary.
pub struct FfmpegTranscoder {
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, source: &Path, dest: &Path, format: AudioFormat) -> MediaResult<u64> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(MediaError::FileNotFound(source.to_path_buf()));
        }
        let cmd = FfmpegCommand::new(source, dest).for_format(format);
        FfmpegRunner::new().with_timeout(self.timeout).run(&cmd).await?;

        let size = tokio::fs::metadata(dest).await?.len();
        debug!(format = %format.as_str(), output = %dest.display(), size, "Transcoded");
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_args() {
        let args = FfmpegCommand::new("in.m4a", "out.mp3")
            .for_format(AudioFormat::Mp3)
            .build_args();
        assert_eq!(
            args,
            vec![
                "-y", "-v", "error", "-i", "in.m4a", "-vn", "-c:a", "libmp3lame", "-b:a", "320k",
                "out.mp3"
            ]
        );

        let wav = FfmpegCommand::new("in.m4a", "out.wav")
            .for_format(AudioFormat::Wav)
            .build_args();
        assert!(wav.windows(2).any(|w| w == ["-c:a", "pcm_s16le"]));

        let flac = FfmpegCommand::new("in.m4a", "out.flac")
            .for_format(AudioFormat::Flac)
            .build_args();
        assert!(flac.windows(2).any(|w| w == ["-c:a", "flac"]));
    }

    #[tokio::test]
    async fn test_missing_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = FfmpegTranscoder::default()
            .transcode(&dir.path().join("nope.m4a"), &dir.path().join("out.mp3"), AudioFormat::Mp3)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::FileNotFound(_)));
    }
}
