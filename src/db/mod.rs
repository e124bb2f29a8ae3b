//! Item state persistence
//!
//! SQLite behind a fixed-size sqlx pool. Connections are only ever borrowed for one query
//! or one transaction and go back to the pool when dropped.

pub mod item_states;
pub mod scan_ledger;

use std::path::Path;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

pub use item_states::{ItemStateRepository, StateCounts, StoredState};
pub use scan_ledger::{LedgerEntry, ScanLedgerRepository};

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the state database with a pool of `max_connections`
    pub async fn connect(path: &Path, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!(path = %path.display(), pool_size = max_connections, "State database ready");
        Ok(db)
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn item_states(&self) -> ItemStateRepository {
        ItemStateRepository::new(self.pool.clone())
    }

    pub fn scan_ledger(&self) -> ScanLedgerRepository {
        ScanLedgerRepository::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
