//! Shared safe-mode flag.
//!
//! Set by the circuit breaker when it opens and consulted by every dispatcher
//! process, so it lives in Redis rather than process memory.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::error::QueueResult;

pub const SAFE_MODE_KEY: &str = "soundry:circuit:open";

#[async_trait]
pub trait SafeModeFlag: Send + Sync {
    async fn set(&self) -> QueueResult<()>;
    async fn clear(&self) -> QueueResult<()>;
    async fn is_set(&self) -> QueueResult<bool>;
}

pub struct RedisSafeMode {
    client: redis::Client,
    key: String,
}

impl RedisSafeMode {
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            key: SAFE_MODE_KEY.to_string(),
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

#[async_trait]
impl SafeModeFlag for RedisSafeMode {
    async fn set(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set::<_, _, ()>(&self.key, "true").await?;
        debug!(key = %self.key, "Safe mode flag set");
        Ok(())
    }

    async fn clear(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(&self.key).await?;
        debug!(key = %self.key, "Safe mode flag cleared");
        Ok(())
    }

    async fn is_set(&self) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.exists(&self.key).await?)
    }
}

/// Process-local flag for single-process runs and tests.
#[derive(Debug, Default)]
pub struct LocalSafeMode {
    open: AtomicBool,
}

#[async_trait]
impl SafeModeFlag for LocalSafeMode {
    async fn set(&self) -> QueueResult<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> QueueResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_set(&self) -> QueueResult<bool> {
        Ok(self.open.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_flag_round_trip() {
        let flag = LocalSafeMode::default();
        assert!(!flag.is_set().await.unwrap());
        flag.set().await.unwrap();
        flag.set().await.unwrap();
        assert!(flag.is_set().await.unwrap());
        flag.clear().await.unwrap();
        assert!(!flag.is_set().await.unwrap());
    }
}
