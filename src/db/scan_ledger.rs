//! Scan ledger repository
//!
//! Remembers which items have been examined and the upstream timestamp they had at the
//! time, so healthy unchanged items are not examined again on every run.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct LedgerEntry {
    pub item_id: String,
    pub library_id: String,
    pub item_updated_at: Option<DateTime<Utc>>,
    pub last_scanned_at: DateTime<Utc>,
}

pub struct ScanLedgerRepository {
    pool: SqlitePool,
}

impl ScanLedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_many(
        &self,
        item_ids: &[String],
    ) -> Result<HashMap<String, LedgerEntry>, sqlx::Error> {
        if item_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT item_id, library_id, item_updated_at, last_scanned_at \
             FROM scan_ledger WHERE item_id IN (",
        );
        let mut ids = query.separated(", ");
        for id in item_ids {
            ids.push_bind(id.as_str());
        }
        ids.push_unseparated(")");

        let entries = query
            .build_query_as::<LedgerEntry>()
            .fetch_all(&self.pool)
            .await?;
        Ok(entries
            .into_iter()
            .map(|e| (e.item_id.clone(), e))
            .collect())
    }

    /// Record that an item was examined
    pub async fn touch(
        &self,
        item_id: &str,
        library_id: &str,
        item_updated_at: Option<DateTime<Utc>>,
        scanned_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO scan_ledger (item_id, library_id, item_updated_at, last_scanned_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(item_id) DO UPDATE SET
                library_id = excluded.library_id,
                item_updated_at = excluded.item_updated_at,
                last_scanned_at = excluded.last_scanned_at
            "#,
        )
        .bind(item_id)
        .bind(library_id)
        .bind(item_updated_at)
        .bind(scanned_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_for_library(&self, library_id: &str) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM scan_ledger WHERE library_id = ?")
                .bind(library_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scan_ledger")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
