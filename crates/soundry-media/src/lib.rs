//! Media platform clients and audio transcoding.
//!
//! - [`ytdlp`]: metadata, download and playlist listing through yt-dlp
//! - [`spotify`]: Spotify Web API (tracks, playlists, albums)
//! - [`search`]: search query building and YouTube search resolution
//! - [`transcode`]: FFmpeg command runner and the [`Transcoder`] seam
//! - [`platform`]: the [`MediaPlatform`] / [`PlaylistSource`] seams

pub mod error;
pub mod identity;
pub mod platform;
pub mod search;
pub mod spotify;
pub mod transcode;
pub mod ytdlp;

pub use error::{critical_signal, FailureClass, MediaError, MediaResult};
pub use identity::{is_valid_netscape_cookies, validate_cookie_file, RequestIdentity};
pub use platform::{MediaPlatform, PlatformClient, PlaylistSource};
pub use search::{build_search_query, extract_video_id, YoutubeSearch};
pub use spotify::{SpotifyClient, SpotifyCollection, SpotifyConfig};
pub use transcode::{check_ffmpeg, FfmpegCommand, FfmpegRunner, FfmpegTranscoder, Transcoder};
pub use ytdlp::YtDlp;
