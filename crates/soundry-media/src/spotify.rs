//! Spotify Web API client (client-credentials flow).

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use soundry_models::{PlaylistEntry, Provider, ProviderRef, TrackMetadata};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE: &str = "https://api.spotify.com/v1";
const MAX_ATTEMPTS: u32 = 3;
/// Refresh this long before the token actually expires.
const TOKEN_MARGIN: Duration = Duration::from_secs(300);

/// Spotify credentials.
#[derive(Debug, Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
}

impl SpotifyConfig {
    /// `None` unless both `SPOTIFY_CLIENT_ID` and `SPOTIFY_CLIENT_SECRET` are set.
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("SPOTIFY_CLIENT_ID").ok().filter(|s| !s.is_empty())?;
        let client_secret = std::env::var("SPOTIFY_CLIENT_SECRET").ok().filter(|s| !s.is_empty())?;
        Some(Self {
            client_id,
            client_secret,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct Artist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    id: Option<String>,
    name: String,
    #[serde(default)]
    artists: Vec<Artist>,
    duration_ms: u64,
    #[serde(default)]
    is_local: bool,
}

impl SpotifyTrack {
    fn artist_names(&self) -> String {
        self.artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn duration_secs(&self) -> u32 {
        (self.duration_ms / 1000) as u32
    }

    fn into_entry(self) -> Option<PlaylistEntry> {
        if self.is_local {
            return None;
        }
        let artist = self.artist_names();
        let duration_secs = self.duration_secs();
        Some(PlaylistEntry {
            source: ProviderRef::new(Provider::Spotify, self.id?),
            title: Some(self.name),
            artist: Some(artist),
            duration_secs: Some(duration_secs),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    items: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    track: Option<SpotifyTrack>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

/// Collection kinds the client can expand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotifyCollection {
    Playlist,
    Album,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Spotify client with a shared, lazily refreshed access token.
pub struct SpotifyClient {
    http: reqwest::Client,
    config: SpotifyConfig,
    token: Mutex<Option<CachedToken>>,
}

impl SpotifyClient {
    pub fn new(config: SpotifyConfig) -> MediaResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> MediaResult<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response: TokenResponse = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
            .send()
            .await?
            .error_for_status()
            .map_err(|e| MediaError::spotify(format!("token request failed: {e}")))?
            .json()
            .await?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_MARGIN);
        info!(expires_in = response.expires_in, "Spotify access token refreshed");
        *guard = Some(CachedToken {
            value: response.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(response.access_token)
    }

    /// GET an API URL, honouring `Retry-After` on 429.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> MediaResult<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let token = self.access_token().await?;
            let response = self.http.get(url).bearer_auth(token).send().await?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_ATTEMPTS {
                let wait = retry_after(&response)
                    .unwrap_or_else(|| Duration::from_secs(1 << (attempt - 1)));
                warn!(attempt, wait_ms = wait.as_millis() as u64, "Spotify rate limit, retrying");
                tokio::time::sleep(wait).await;
                continue;
            }
            if response.status() == StatusCode::UNAUTHORIZED && attempt < MAX_ATTEMPTS {
                self.token.lock().await.take();
                continue;
            }
            if response.status() == StatusCode::NOT_FOUND {
                return Err(MediaError::Unsupported(format!("Spotify resource not found: {url}")));
            }

            return Ok(response.error_for_status()?.json().await?);
        }
    }

    /// Metadata for one track.
    pub async fn track(&self, id: &str) -> MediaResult<TrackMetadata> {
        let track: SpotifyTrack = self.get_json(&format!("{API_BASE}/tracks/{id}")).await?;
        debug!(track_id = id, title = %track.name, "Fetched Spotify track");
        Ok(TrackMetadata {
            artist: track.artist_names(),
            duration_secs: Some(track.duration_secs()),
            title: track.name,
            external_id: id.to_string(),
        })
    }

    /// Title and tracks of a playlist or album, following pagination.
    pub async fn collection(
        &self,
        kind: SpotifyCollection,
        id: &str,
    ) -> MediaResult<(String, Vec<PlaylistEntry>)> {
        let (meta_url, first_page) = match kind {
            SpotifyCollection::Playlist => (
                format!("{API_BASE}/playlists/{id}?fields=name"),
                format!("{API_BASE}/playlists/{id}/tracks?limit=100"),
            ),
            SpotifyCollection::Album => (
                format!("{API_BASE}/albums/{id}"),
                format!("{API_BASE}/albums/{id}/tracks?limit=50"),
            ),
        };
        let title = self.get_json::<Named>(&meta_url).await?.name;

        let mut entries = Vec::new();
        let mut next = Some(first_page);
        while let Some(url) = next {
            next = match kind {
                SpotifyCollection::Playlist => {
                    let page: Page<PlaylistItem> = self.get_json(&url).await?;
                    entries.extend(page.items.into_iter().filter_map(|i| i.track?.into_entry()));
                    page.next
                }
                SpotifyCollection::Album => {
                    let page: Page<SpotifyTrack> = self.get_json(&url).await?;
                    entries.extend(page.items.into_iter().filter_map(SpotifyTrack::into_entry));
                    page.next
                }
            };
        }

        info!(collection_id = id, tracks = entries.len(), "Expanded Spotify collection");
        Ok((title, entries))
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playlist_page_skips_local_and_missing_tracks() {
        let page: Page<PlaylistItem> = serde_json::from_str(
            r#"{
                "items": [
                    {"track": {
                        "id": "4uLU6hMCjMI75M1A2tKUQC", "name": "Song",
                        "artists": [{"name": "A"}, {"name": "B"}], "duration_ms": 213000
                    }},
                    {"track": {
                        "id": null, "name": "Local", "artists": [],
                        "duration_ms": 1000, "is_local": true
                    }},
                    {"track": null}
                ],
                "next": null
            }"#,
        )
        .unwrap();
        let entries: Vec<_> = page
            .items
            .into_iter()
            .filter_map(|i| i.track?.into_entry())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].artist.as_deref(), Some("A, B"));
        assert_eq!(entries[0].duration_secs, Some(213));
        assert_eq!(entries[0].source.provider, Provider::Spotify);
    }
}
