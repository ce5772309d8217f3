//! Persistence and lifecycle core for bulk requests.
//!
//! A bulk request is a user-submitted batch of namespace operations that
//! expands into per-path targets. This crate owns the request lifecycle
//! (with an in-process read cache), the target rows, the permissions row of
//! each request, and the archiver that moves stale terminal requests into a
//! write-once archive table.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bulk_store::{BulkDb, BulkRequest, RequestStore, Restriction, StoreConfig, Subject};
//!
//! let config = StoreConfig::default();
//! let db = BulkDb::connect(&config).await?;
//! let store = RequestStore::new(&db, &config)?;
//!
//! let request = store
//!     .store(&Subject::new(1000, 100), &Restriction::None, BulkRequest::new("PIN"), &paths)
//!     .await?;
//! let queued = store.next(None, None, 10).await?;
//! ```

mod archive;
mod archiver;
mod cache;
mod config;
mod criterion;
mod error;
mod permissions;
mod request_dao;
mod request_store;
mod scheduler;
mod schema;
mod subject;
mod target_store;
mod types;

pub use archive::ArchiveStore;
pub use archiver::{LeadershipListener, RequestArchiver, SweepReport};
pub use cache::LoadingCache;
pub use config::StoreConfig;
pub use criterion::{Criterion, DbValue, SortColumn};
pub use error::{BulkError, Result};
pub use permissions::{PermissionsStore, RequestPermissions};
pub use request_dao::{RequestDao, RequestUpdate};
pub use request_store::RequestStore;
pub use scheduler::TaskScheduler;
pub use subject::{Restriction, Subject, ROOT_UID};
pub use target_store::{NewTarget, TargetStore};
pub use types::*;

pub use bulk_ids::RequestUid;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Connection pool over the bulk tables.
#[derive(Clone)]
pub struct BulkDb {
    pool: SqlitePool,
}

impl BulkDb {
    /// Open or create a database file at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let db = Self::with_options(options, 5, false).await?;

        info!(path = %path.display(), "Bulk database opened");
        Ok(db)
    }

    /// Connect using the configured URL (`sqlite:<path>` or `sqlite::memory:`).
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let url = config.database_url.as_str();
        if !url.starts_with("sqlite:") {
            return Err(BulkError::Config(format!(
                "unsupported database URL '{}', expected sqlite:",
                url
            )));
        }
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| BulkError::Config(format!("invalid database URL '{}': {}", url, e)))?
            .create_if_missing(true);

        let db = if is_memory_url(url) {
            Self::with_options(options, 1, true).await?
        } else {
            Self::with_options(options, config.max_connections.max(1), false).await?
        };

        info!(url, "Bulk database connected");
        Ok(db)
    }

    /// Private in-memory database (for testing).
    ///
    /// A single connection is kept open for the life of the pool, since each
    /// SQLite memory connection is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::with_options(options, 1, true).await
    }

    async fn with_options(
        options: SqliteConnectOptions,
        max_connections: u32,
        memory: bool,
    ) -> Result<Self> {
        let mut options = options.foreign_keys(true);
        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);

        if memory {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_secs(5));
        }

        let pool = pool_options.connect_with(options).await?;
        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Current time as milliseconds since Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
