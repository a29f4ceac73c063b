//! Platform seams used by the worker pipeline and admission.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use soundry_models::{Playlist, Provider, ProviderRef, SourceKind, SourceUrl, TrackMetadata};

use crate::error::{MediaError, MediaResult};
use crate::identity::RequestIdentity;
use crate::search::YoutubeSearch;
use crate::spotify::{SpotifyClient, SpotifyCollection};
use crate::ytdlp::YtDlp;

/// Metadata, search and download against the upstream platforms.
#[async_trait]
pub trait MediaPlatform: Send + Sync {
    /// Title, artist and duration for a single track.
    async fn fetch_metadata(&self, source: &ProviderRef) -> MediaResult<TrackMetadata>;

    /// Resolve a search query to a downloadable YouTube track.
    async fn search(&self, query: &str, identity: &RequestIdentity) -> MediaResult<ProviderRef>;

    /// Download source audio for `url` into `dest_dir`.
    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        identity: &RequestIdentity,
    ) -> MediaResult<PathBuf>;
}

/// Expands playlist and album URLs into their tracks.
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    async fn expand(&self, source: &SourceUrl) -> MediaResult<Playlist>;
}

/// Production client combining yt-dlp, Spotify and YouTube search.
pub struct PlatformClient {
    ytdlp: YtDlp,
    search: YoutubeSearch,
    spotify: Option<Arc<SpotifyClient>>,
}

impl PlatformClient {
    pub fn new(ytdlp: YtDlp, spotify: Option<SpotifyClient>) -> Self {
        Self {
            ytdlp,
            search: YoutubeSearch::default(),
            spotify: spotify.map(Arc::new),
        }
    }

    fn spotify(&self) -> MediaResult<&SpotifyClient> {
        self.spotify
            .as_deref()
            .ok_or_else(|| {
                MediaError::Unsupported("Spotify credentials are not configured".to_string())
            })
    }
}

#[async_trait]
impl MediaPlatform for PlatformClient {
    async fn fetch_metadata(&self, source: &ProviderRef) -> MediaResult<TrackMetadata> {
        match source.provider {
            Provider::Spotify => self.spotify()?.track(&source.external_id).await,
            Provider::Youtube | Provider::Soundcloud => {
                self.ytdlp
                    .fetch_metadata(&source.canonical_url(), &RequestIdentity::direct())
                    .await
            }
        }
    }

    async fn search(&self, query: &str, identity: &RequestIdentity) -> MediaResult<ProviderRef> {
        let video_id = self.search.search(query, identity).await?;
        Ok(ProviderRef::youtube(video_id))
    }

    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        identity: &RequestIdentity,
    ) -> MediaResult<PathBuf> {
        self.ytdlp.download_audio(url, dest_dir, identity).await
    }
}

#[async_trait]
impl PlaylistSource for PlatformClient {
    async fn expand(&self, source: &SourceUrl) -> MediaResult<Playlist> {
        let (title, entries) = match (source.provider, source.kind) {
            (_, SourceKind::Track) => {
                return Err(MediaError::Unsupported(format!("{} is a single track", source.url)));
            }
            (Provider::Spotify, SourceKind::Playlist) => {
                self.spotify()?.collection(SpotifyCollection::Playlist, &source.id).await?
            }
            (Provider::Spotify, SourceKind::Album) => {
                self.spotify()?.collection(SpotifyCollection::Album, &source.id).await?
            }
            (provider, _) => {
                self.ytdlp
                    .list_playlist(&source.url, provider, &RequestIdentity::direct())
                    .await?
            }
        };
        Ok(Playlist { title, entries })
    }
}
