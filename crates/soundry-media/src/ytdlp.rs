//! Metadata, download and playlist listing through yt-dlp.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use soundry_models::{PlaylistEntry, Provider, ProviderRef, TrackMetadata};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};
use crate::identity::RequestIdentity;

const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 ",
    "(KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
);

/// Basename of the downloaded source file inside the destination dir.
const SOURCE_STEM: &str = "source";

#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: String,
    title: Option<String>,
    uploader: Option<String>,
    artist: Option<String>,
    creator: Option<String>,
    duration: Option<f64>,
}

impl VideoInfo {
    fn into_metadata(self) -> TrackMetadata {
        TrackMetadata {
            title: self.title.unwrap_or_else(|| "Unknown Title".to_string()),
            artist: self
                .artist
                .or(self.creator)
                .or(self.uploader)
                .unwrap_or_else(|| "Unknown Artist".to_string()),
            duration_secs: self.duration.map(|d| d.round() as u32),
            external_id: self.id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FlatPlaylist {
    title: Option<String>,
    #[serde(default)]
    entries: Vec<FlatEntry>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    url: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
}

/// yt-dlp invoker.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: String,
    timeout: Duration,
}

impl Default for YtDlp {
    fn default() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            timeout: Duration::from_secs(600),
        }
    }
}

impl YtDlp {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn check(&self) -> MediaResult<PathBuf> {
        which::which(&self.binary).map_err(|_| MediaError::YtDlpNotFound)
    }

    fn base_args(identity: &RequestIdentity) -> Vec<String> {
        let mut args = vec![
            "--no-warnings".to_string(),
            "--user-agent".to_string(),
            USER_AGENT.to_string(),
            "--referer".to_string(),
            "https://www.youtube.com/".to_string(),
        ];
        args.extend(identity.ytdlp_args());
        args
    }

    /// Run yt-dlp and return stdout, mapping failures through
    /// [`MediaError::from_tool_output`].
    async fn run(
        &self,
        args: &[String],
        fallback: fn(String) -> MediaError,
    ) -> MediaResult<String> {
        self.check()?;
        debug!("Running yt-dlp {}", args.join(" "));

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "yt-dlp timed out");
                return Err(MediaError::Timeout(self.timeout.as_secs()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("yt-dlp stderr: {}", stderr);
            let err = MediaError::from_tool_output(&stderr, fallback);
            if let MediaError::Blocked { reason, .. } = &err {
                warn!(reason = %reason, "Upstream block detected");
            }
            return Err(err);
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Fetch metadata for a single video URL.
    pub async fn fetch_metadata(
        &self,
        url: &str,
        identity: &RequestIdentity,
    ) -> MediaResult<TrackMetadata> {
        let mut args = Self::base_args(identity);
        args.extend(["-J", "--no-playlist", "--skip-download"].map(String::from));
        args.push(url.to_string());

        let stdout = self.run(&args, MediaError::metadata_failed).await?;
        let info: VideoInfo = serde_json::from_str(stdout.trim())?;
        Ok(info.into_metadata())
    }

    /// Download the best audio stream of `url` into `dest_dir`, returning
    /// the path of the written file.
    pub async fn download_audio(
        &self,
        url: &str,
        dest_dir: &Path,
        identity: &RequestIdentity,
    ) -> MediaResult<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let template = dest_dir.join(format!("{SOURCE_STEM}.%(ext)s"));

        let mut args = Self::base_args(identity);
        args.extend(
            [
                "--no-playlist",
                "--no-progress",
                "-f",
                "bestaudio[ext=m4a]/bestaudio/best",
                "--print",
                "after_move:filepath",
                "-o",
            ]
            .map(String::from),
        );
        args.push(template.to_string_lossy().into_owned());
        args.push(url.to_string());

        info!(url = %url, identity = %identity.label, "Downloading audio");
        let stdout = self.run(&args, MediaError::download_failed).await?;

        let path = match stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
            Some(printed) => PathBuf::from(printed),
            None => find_source_file(dest_dir).await?,
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(MediaError::download_failed("Output file not created"));
        }

        let size = tokio::fs::metadata(&path).await?.len();
        info!(
            output = %path.display(),
            size_mb = size as f64 / (1024.0 * 1024.0),
            "Downloaded audio successfully"
        );
        Ok(path)
    }

    /// List entries of a YouTube or SoundCloud playlist without resolving
    /// each one.
    pub async fn list_playlist(
        &self,
        url: &str,
        provider: Provider,
        identity: &RequestIdentity,
    ) -> MediaResult<(String, Vec<PlaylistEntry>)> {
        let mut args = Self::base_args(identity);
        args.extend(["--flat-playlist", "-J"].map(String::from));
        args.push(url.to_string());

        let stdout = self.run(&args, MediaError::metadata_failed).await?;
        let playlist: FlatPlaylist = serde_json::from_str(stdout.trim())?;
        let entries = playlist
            .entries
            .into_iter()
            .filter_map(|e| flat_entry_to_ref(e, provider))
            .collect();
        Ok((playlist.title.unwrap_or_else(|| "Playlist".to_string()), entries))
    }
}

fn flat_entry_to_ref(entry: FlatEntry, provider: Provider) -> Option<PlaylistEntry> {
    let external_id = match provider {
        Provider::Youtube => entry.id?,
        // SoundCloud flat entries carry the permalink; keep "user/track".
        Provider::Soundcloud => {
            let url = entry.url?;
            let parsed = url::Url::parse(&url).ok()?;
            parsed.path().trim_matches('/').to_string()
        }
        Provider::Spotify => return None,
    };
    Some(PlaylistEntry {
        source: ProviderRef::new(provider, external_id),
        title: entry.title,
        artist: entry.uploader,
        duration_secs: entry.duration.map(|d| d.round() as u32),
    })
}

async fn find_source_file(dir: &Path) -> MediaResult<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_source = path
            .file_stem()
            .is_some_and(|stem| stem == SOURCE_STEM);
        if is_source && path.extension().is_some_and(|ext| ext != "part") {
            return Ok(path);
        }
    }
    Err(MediaError::FileNotFound(dir.join(SOURCE_STEM)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_info_prefers_artist_over_uploader() {
        let info: VideoInfo = serde_json::from_str(
            r#"{
                "id": "dQw4w9WgXcQ", "title": "Never Gonna Give You Up",
                "uploader": "RickAstleyVEVO", "artist": "Rick Astley", "duration": 212.4
            }"#,
        )
        .unwrap();
        let meta = info.into_metadata();
        assert_eq!(meta.artist, "Rick Astley");
        assert_eq!(meta.duration_secs, Some(212));
        assert_eq!(meta.external_id, "dQw4w9WgXcQ");
    }

    #[test]
    fn test_flat_entries_map_to_refs() {
        let yt = flat_entry_to_ref(
            FlatEntry {
                id: Some("abcdefghijk".into()),
                url: None,
                title: Some("t".into()),
                uploader: None,
                duration: None,
            },
            Provider::Youtube,
        )
        .unwrap();
        assert_eq!(yt.source, ProviderRef::youtube("abcdefghijk"));

        let sc = flat_entry_to_ref(
            FlatEntry {
                id: Some("12345".into()),
                url: Some("https://soundcloud.com/artist/song".into()),
                title: None,
                uploader: None,
                duration: Some(61.0),
            },
            Provider::Soundcloud,
        )
        .unwrap();
        assert_eq!(sc.source.external_id, "artist/song");
        assert_eq!(sc.duration_secs, Some(61));
    }

    #[tokio::test]
    async fn test_find_source_file_skips_partials() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("source.m4a.part"), b"x").await.unwrap();
        assert!(find_source_file(dir.path()).await.is_err());

        tokio::fs::write(dir.path().join("source.webm"), b"x").await.unwrap();
        let found = find_source_file(dir.path()).await.unwrap();
        assert_eq!(found.file_name().unwrap(), "source.webm");
    }
}
