//! Persistence layer for Soundry.
//!
//! SQLite via sqlx. Timestamps are stored as epoch milliseconds. Every
//! operation that participates in dedupe or status changes is a single
//! conditional statement or a transaction, so concurrent workers never
//! create duplicate tracks or move a track backwards.

pub mod cache;
pub mod error;
pub mod sessions;
pub mod time;
pub mod tracks;

mod rows;

pub use cache::{CacheNamespace, CacheRepository, SqlxCacheRepository, TtlCache, CACHE_TTL_HOURS};
pub use error::{StoreError, StoreResult};
pub use sessions::{RemovedItem, SessionRepository, SqlxSessionRepository, WorkItem};
pub use tracks::{SqlxTrackRepository, TrackRepository};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DEFAULT_POOL_SIZE: u32 = 8;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Handle to the database with its repositories.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `database_url` and migrate it.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_POOL_SIZE)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!(url = %database_url, "Database initialized");
        Ok(db)
    }

    /// A private in-memory database, used by tests and dev runs.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // A single connection that never idles out, or the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tracks(&self) -> Arc<dyn TrackRepository> {
        Arc::new(SqlxTrackRepository::new(self.pool.clone()))
    }

    pub fn sessions(&self) -> Arc<dyn SessionRepository> {
        Arc::new(SqlxSessionRepository::new(self.pool.clone()))
    }

    pub fn cache(&self) -> Arc<dyn CacheRepository> {
        Arc::new(SqlxCacheRepository::new(self.pool.clone()))
    }
}
