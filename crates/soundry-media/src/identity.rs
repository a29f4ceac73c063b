//! Outbound network identity (proxy and cookie jar) used for a request.

use std::path::{Path, PathBuf};

/// What a platform call should present upstream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestIdentity {
    /// Label for logs, e.g. `cookie-1` or `direct`.
    pub label: String,
    pub proxy_url: Option<String>,
    pub cookies_path: Option<PathBuf>,
}

impl RequestIdentity {
    pub fn direct() -> Self {
        Self {
            label: "direct".to_string(),
            proxy_url: None,
            cookies_path: None,
        }
    }

    /// yt-dlp flags selecting this identity.
    pub fn ytdlp_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(proxy) = &self.proxy_url {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        if let Some(cookies) = &self.cookies_path {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
        args
    }

    /// Proxy host for logs, without credentials.
    pub fn proxy_host(&self) -> Option<String> {
        let proxy = self.proxy_url.as_deref()?;
        let without_scheme = proxy.split_once("://").map_or(proxy, |(_, rest)| rest);
        let host = without_scheme
            .rsplit_once('@')
            .map_or(without_scheme, |(_, host)| host);
        Some(host.trim_end_matches('/').to_string())
    }
}

/// Whether `content` looks like a Netscape cookie jar: a known header or at
/// least one tab-separated line with the seven cookie fields.
pub fn is_valid_netscape_cookies(content: &str) -> bool {
    if content.starts_with("# Netscape HTTP Cookie File")
        || content.starts_with("# HTTP Cookie File")
    {
        return true;
    }
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .any(|l| l.split('\t').count() >= 6)
}

/// Read and validate a cookie file.
pub async fn validate_cookie_file(path: &Path) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => is_valid_netscape_cookies(&content),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ytdlp_args() {
        let identity = RequestIdentity {
            label: "cookie-1".into(),
            proxy_url: Some("http://user:pw@proxy.local:8080".into()),
            cookies_path: Some(PathBuf::from("/cookies/a.txt")),
        };
        assert_eq!(
            identity.ytdlp_args(),
            vec!["--proxy", "http://user:pw@proxy.local:8080", "--cookies", "/cookies/a.txt"]
        );
        assert_eq!(identity.proxy_host().as_deref(), Some("proxy.local:8080"));
        assert!(RequestIdentity::direct().ytdlp_args().is_empty());
    }

    #[test]
    fn test_cookie_validation() {
        assert!(is_valid_netscape_cookies("# Netscape HTTP Cookie File\n"));
        assert!(is_valid_netscape_cookies(
            ".youtube.com\tTRUE\t/\tTRUE\t0\tPREF\tf6=40000000"
        ));
        assert!(!is_valid_netscape_cookies("{\"cookies\": []}"));
    }

    #[tokio::test]
    async fn test_cookie_file_validation() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.txt");
        tokio::fs::write(&good, "# Netscape HTTP Cookie File\n").await.unwrap();
        assert!(validate_cookie_file(&good).await);
        assert!(!validate_cookie_file(&dir.path().join("missing.txt")).await);
    }
}
