//! Resolve free-text track descriptions to YouTube videos by scraping the
//! public search results page.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{MediaError, MediaResult};
use crate::identity::RequestIdentity;

const SEARCH_URL: &str = "https://www.youtube.com/results?search_query=";
const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 ",
    "(KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
);
const MAX_JSON_DEPTH: usize = 15;

struct Patterns {
    feat: Regex,
    brackets: Regex,
    remix: Regex,
    spaces: Regex,
    initial_data: Regex,
    watch: Regex,
    video_id: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        feat: Regex::new(r"(?i)\s*[\(\[]\s*(feat\.?|ft\.?|featuring)\s[^\)\]]*[\)\]]").unwrap(),
        brackets: Regex::new(r"\s*\[[^\]]*\]").unwrap(),
        remix: Regex::new(r"(?i)\s*\([^\)]*remix[^\)]*\)").unwrap(),
        spaces: Regex::new(r"\s+").unwrap(),
        initial_data: Regex::new(r"(?s)var ytInitialData = (\{.+?\});</script>").unwrap(),
        watch: Regex::new(r"/watch\?v=([a-zA-Z0-9_-]{11})").unwrap(),
        video_id: Regex::new(r#""videoId"\s*:\s*"([a-zA-Z0-9_-]{11})""#).unwrap(),
    })
}

/// Build the search query for a track: featured artists, bracketed tags and
/// remix annotations are dropped from the title, commas in the artist
/// become spaces.
pub fn build_search_query(artist: &str, title: &str) -> String {
    let p = patterns();
    let title = p.feat.replace_all(title, "");
    let title = p.brackets.replace_all(&title, "");
    let title = p.remix.replace_all(&title, "");
    let artist = artist.replace(',', " ");
    let query = format!("{} {} official audio", artist.trim(), title.trim());
    p.spaces.replace_all(query.trim(), " ").into_owned()
}

/// Pull the first video id out of a search results page.
pub fn extract_video_id(html: &str) -> Option<String> {
    let p = patterns();
    if let Some(caps) = p.initial_data.captures(html) {
        if let Ok(data) = serde_json::from_str::<Value>(&caps[1]) {
            if let Some(id) = find_video_id(&data, 0) {
                return Some(id);
            }
        }
    }
    p.watch
        .captures(html)
        .or_else(|| p.video_id.captures(html))
        .map(|caps| caps[1].to_string())
}

fn find_video_id(value: &Value, depth: usize) -> Option<String> {
    if depth > MAX_JSON_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            if let Some(id) = map
                .get("videoRenderer")
                .and_then(|r| r.get("videoId"))
                .and_then(Value::as_str)
            {
                return Some(id.to_string());
            }
            map.values().find_map(|v| find_video_id(v, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|v| find_video_id(v, depth + 1)),
        _ => None,
    }
}

/// YouTube search scraper.
#[derive(Debug, Clone)]
pub struct YoutubeSearch {
    timeout: Duration,
}

impl Default for YoutubeSearch {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl YoutubeSearch {
    fn client(&self, identity: &RequestIdentity) -> MediaResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(self.timeout);
        if let Some(proxy) = &identity.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(builder.build()?)
    }

    /// Search once through `identity` and return the first video id.
    pub async fn search(&self, query: &str, identity: &RequestIdentity) -> MediaResult<String> {
        let url = format!("{SEARCH_URL}{}", urlencoding::encode(query));
        debug!(query, identity = %identity.label, "Searching YouTube");

        let html = self
            .client(identity)?
            .get(&url)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.5")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let video_id =
            extract_video_id(&html).ok_or_else(|| MediaError::NoSearchResult(query.to_string()))?;
        info!(query, video_id = %video_id, "Resolved search query");
        Ok(video_id)
    }
}
