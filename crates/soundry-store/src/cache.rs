//! Expiring key/value cache for resolver and metadata lookups.
//!
//! Entries live for 24 hours from their last write. Reads past the expiry
//! report a miss and delete the stale row. Cache failures never fail the
//! caller: they are logged and treated as misses.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use soundry_models::Clock;
use sqlx::SqlitePool;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::time::{from_ms, to_ms};

pub const CACHE_TTL_HOURS: i64 = 24;

/// Independent key spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    /// Search query -> resolved media URL.
    Resolver,
    /// Canonical URL -> track metadata.
    Metadata,
}

impl CacheNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheNamespace::Resolver => "resolver",
            CacheNamespace::Metadata => "metadata",
        }
    }
}

impl fmt::Display for CacheNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait CacheRepository: Send + Sync {
    async fn get(
        &self,
        namespace: CacheNamespace,
        key: &str,
    ) -> StoreResult<Option<(String, DateTime<Utc>)>>;
    async fn upsert(
        &self,
        namespace: CacheNamespace,
        key: &str,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn delete(&self, namespace: CacheNamespace, key: &str) -> StoreResult<()>;
    async fn keys(&self, namespace: CacheNamespace) -> StoreResult<Vec<String>>;
}

pub struct SqlxCacheRepository {
    pool: SqlitePool,
}

impl SqlxCacheRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheRepository for SqlxCacheRepository {
    async fn get(
        &self,
        namespace: CacheNamespace,
        key: &str,
    ) -> StoreResult<Option<(String, DateTime<Utc>)>> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT value, expires_at FROM cache_entries WHERE namespace = ? AND key = ?",
        )
        .bind(namespace.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value, expires_at)| (value, from_ms(expires_at))))
    }

    async fn upsert(
        &self,
        namespace: CacheNamespace,
        key: &str,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (namespace, key, value, expires_at) VALUES (?, ?, ?, ?)
            ON CONFLICT (namespace, key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(namespace.as_str())
        .bind(key)
        .bind(value)
        .bind(to_ms(expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, namespace: CacheNamespace, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM cache_entries WHERE namespace = ? AND key = ?")
            .bind(namespace.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys(&self, namespace: CacheNamespace) -> StoreResult<Vec<String>> {
        let keys =
            sqlx::query_scalar("SELECT key FROM cache_entries WHERE namespace = ? ORDER BY key")
                .bind(namespace.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(keys)
    }
}

/// TTL cache on top of a [`CacheRepository`].
#[derive(Clone)]
pub struct TtlCache {
    repo: Arc<dyn CacheRepository>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl TtlCache {
    pub fn new(repo: Arc<dyn CacheRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            clock,
            ttl: Duration::hours(CACHE_TTL_HOURS),
        }
    }

    pub async fn get(&self, namespace: CacheNamespace, key: &str) -> Option<String> {
        let entry = match self.repo.get(namespace, key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(%namespace, key, error = %e, "Cache read failed");
                return None;
            }
        };

        let (value, expires_at) = entry;
        if self.clock.now() < expires_at {
            debug!(%namespace, key, "Cache hit");
            return Some(value);
        }

        debug!(%namespace, key, "Evicting expired cache entry");
        if let Err(e) = self.repo.delete(namespace, key).await {
            warn!(%namespace, key, error = %e, "Failed to evict expired cache entry");
        }
        None
    }

    pub async fn set(&self, namespace: CacheNamespace, key: &str, value: &str) {
        let expires_at = self.clock.now() + self.ttl;
        if let Err(e) = self.repo.upsert(namespace, key, value, expires_at).await {
            warn!(%namespace, key, error = %e, "Cache write failed");
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        namespace: CacheNamespace,
        key: &str,
    ) -> Option<T> {
        let raw = self.get(namespace, key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(%namespace, key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize + Sync>(
        &self,
        namespace: CacheNamespace,
        key: &str,
        value: &T,
    ) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(namespace, key, &raw).await,
            Err(e) => warn!(%namespace, key, error = %e, "Failed to encode cache entry"),
        }
    }

    /// Keys currently stored in `namespace`, expired or not.
    pub async fn entries(&self, namespace: CacheNamespace) -> StoreResult<Vec<String>> {
        self.repo.keys(namespace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use soundry_models::{ManualClock, TrackMetadata};

    async fn cache_with_clock() -> (TtlCache, Arc<ManualClock>) {
        let db = Database::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::default());
        (TtlCache::new(db.cache(), clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_value_expires_after_24h() {
        let (cache, clock) = cache_with_clock().await;
        cache.set(CacheNamespace::Resolver, "k", "v").await;

        clock.advance(Duration::hours(23));
        assert_eq!(cache.get(CacheNamespace::Resolver, "k").await.as_deref(), Some("v"));

        clock.advance(Duration::hours(1) + Duration::milliseconds(1));
        assert!(cache.get(CacheNamespace::Resolver, "k").await.is_none());
        assert!(cache.entries(CacheNamespace::Resolver).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let (cache, _) = cache_with_clock().await;
        cache.set(CacheNamespace::Resolver, "k", "resolved").await;
        assert!(cache.get(CacheNamespace::Metadata, "k").await.is_none());

        cache.set(CacheNamespace::Metadata, "k", "meta").await;
        assert_eq!(cache.get(CacheNamespace::Resolver, "k").await.as_deref(), Some("resolved"));
    }

    #[tokio::test]
    async fn test_set_refreshes_expiry() {
        let (cache, clock) = cache_with_clock().await;
        cache.set(CacheNamespace::Resolver, "k", "old").await;
        clock.advance(Duration::hours(20));
        cache.set(CacheNamespace::Resolver, "k", "new").await;
        clock.advance(Duration::hours(20));
        assert_eq!(cache.get(CacheNamespace::Resolver, "k").await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_structured_payload() {
        let (cache, _) = cache_with_clock().await;
        let meta = TrackMetadata {
            title: "Song".into(),
            artist: "Band".into(),
            duration_secs: Some(215),
            external_id: "dQw4w9WgXcQ".into(),
        };
        cache.set_json(CacheNamespace::Metadata, "url", &meta).await;
        let back: Option<TrackMetadata> = cache.get_json(CacheNamespace::Metadata, "url").await;
        assert_eq!(back, Some(meta));
    }
}
