//! Item state repository
//!
//! Active records live in `item_state`, dead ones in `item_state_archive`. Every change
//! is one transaction, so an item is never in both tables or in neither halfway through
//! a move.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};

use crate::services::escalation::{ItemState, ItemStatus, StateChange};

const COLUMNS: &str = "item_id, library_id, status, failure_count, next_retry_at, last_error, \
                       last_checked_at, item_updated_at, first_failed_at";

/// Item state row from database
#[derive(Debug, Clone, sqlx::FromRow)]
struct ItemStateRecord {
    item_id: String,
    library_id: String,
    status: String,
    failure_count: i64,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_checked_at: DateTime<Utc>,
    item_updated_at: Option<DateTime<Utc>>,
    first_failed_at: DateTime<Utc>,
}

impl TryFrom<ItemStateRecord> for ItemState {
    type Error = sqlx::Error;

    fn try_from(row: ItemStateRecord) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<ItemStatus>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        // An unknown category from an older build is not worth failing the item over
        let last_error = row.last_error.and_then(|e| e.parse().ok());

        Ok(ItemState {
            item_id: row.item_id,
            library_id: row.library_id,
            status,
            failure_count: u32::try_from(row.failure_count).unwrap_or(0),
            next_retry_at: row.next_retry_at,
            last_error,
            last_checked_at: row.last_checked_at,
            item_updated_at: row.item_updated_at,
            first_failed_at: row.first_failed_at,
        })
    }
}

/// Where an item's record currently lives
#[derive(Debug, Clone, PartialEq)]
pub enum StoredState {
    Active(ItemState),
    Archived(ItemState),
}

impl StoredState {
    pub fn state(&self) -> &ItemState {
        match self {
            StoredState::Active(s) | StoredState::Archived(s) => s,
        }
    }

    pub fn into_state(self) -> ItemState {
        match self {
            StoredState::Active(s) | StoredState::Archived(s) => s,
        }
    }
}

/// Record counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub failing: i64,
    pub recovered: i64,
    pub dead: i64,
}

pub struct ItemStateRepository {
    pool: SqlitePool,
}

impl ItemStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load an item's record from either table
    pub async fn get(&self, item_id: &str) -> Result<Option<StoredState>, sqlx::Error> {
        let active = sqlx::query_as::<_, ItemStateRecord>(&format!(
            "SELECT {COLUMNS} FROM item_state WHERE item_id = ?"
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = active {
            return Ok(Some(StoredState::Active(row.try_into()?)));
        }

        let archived = sqlx::query_as::<_, ItemStateRecord>(&format!(
            "SELECT {COLUMNS} FROM item_state_archive WHERE item_id = ?"
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        match archived {
            Some(row) => Ok(Some(StoredState::Archived(row.try_into()?))),
            None => Ok(None),
        }
    }

    /// Load the records of a batch of items, keyed by item id
    pub async fn get_many(
        &self,
        item_ids: &[String],
    ) -> Result<HashMap<String, StoredState>, sqlx::Error> {
        let mut states = HashMap::new();
        if item_ids.is_empty() {
            return Ok(states);
        }

        for row in self.select_in("item_state_archive", item_ids).await? {
            let state: ItemState = row.try_into()?;
            states.insert(state.item_id.clone(), StoredState::Archived(state));
        }
        // Active rows win should an item ever be in both tables
        for row in self.select_in("item_state", item_ids).await? {
            let state: ItemState = row.try_into()?;
            states.insert(state.item_id.clone(), StoredState::Active(state));
        }
        Ok(states)
    }

    async fn select_in(
        &self,
        table: &str,
        item_ids: &[String],
    ) -> Result<Vec<ItemStateRecord>, sqlx::Error> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM {table} WHERE item_id IN ("));
        let mut ids = query.separated(", ");
        for id in item_ids {
            ids.push_bind(id.as_str());
        }
        ids.push_unseparated(")");

        query
            .build_query_as::<ItemStateRecord>()
            .fetch_all(&self.pool)
            .await
    }

    /// Persist a state change atomically
    pub async fn apply(&self, change: &StateChange, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
        match change {
            StateChange::Unchanged => Ok(()),
            StateChange::Upsert(state) => {
                let mut tx = self.pool.begin().await?;
                delete_from(&mut tx, "item_state_archive", &state.item_id).await?;
                upsert_active(&mut tx, state).await?;
                tx.commit().await
            }
            StateChange::Archive(state) => {
                let mut tx = self.pool.begin().await?;
                delete_from(&mut tx, "item_state", &state.item_id).await?;
                upsert_archive(&mut tx, state, now).await?;
                tx.commit().await
            }
            StateChange::Remove(item_id) => {
                let mut tx = self.pool.begin().await?;
                delete_from(&mut tx, "item_state", item_id).await?;
                delete_from(&mut tx, "item_state_archive", item_id).await?;
                tx.commit().await
            }
        }
    }

    /// Forget an item in both tables. Returns whether anything was deleted.
    pub async fn reset(&self, item_id: &str) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let active = delete_from(&mut tx, "item_state", item_id).await?;
        let archived = delete_from(&mut tx, "item_state_archive", item_id).await?;
        tx.commit().await?;
        Ok(active + archived > 0)
    }

    pub async fn counts(&self) -> Result<StateCounts, sqlx::Error> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM item_state GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StateCounts {
            dead: self.count_dead().await?,
            ..Default::default()
        };
        for (status, count) in rows {
            match status.parse::<ItemStatus>() {
                Ok(ItemStatus::Failing) => counts.failing += count,
                Ok(ItemStatus::Recovered) => counts.recovered += count,
                _ => {}
            }
        }
        Ok(counts)
    }

    pub async fn count_dead(&self) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM item_state_archive")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Most recently archived dead items
    pub async fn list_dead(&self, limit: i64) -> Result<Vec<ItemState>, sqlx::Error> {
        let rows = sqlx::query_as::<_, ItemStateRecord>(&format!(
            "SELECT {COLUMNS} FROM item_state_archive ORDER BY archived_at DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ItemState::try_from).collect()
    }
}

async fn delete_from(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    item_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(&format!("DELETE FROM {table} WHERE item_id = ?"))
        .bind(item_id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

async fn upsert_active(
    tx: &mut Transaction<'_, Sqlite>,
    state: &ItemState,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        r#"
        INSERT INTO item_state ({COLUMNS})
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(item_id) DO UPDATE SET
            library_id = excluded.library_id,
            status = excluded.status,
            failure_count = excluded.failure_count,
            next_retry_at = excluded.next_retry_at,
            last_error = excluded.last_error,
            last_checked_at = excluded.last_checked_at,
            item_updated_at = excluded.item_updated_at
        "#
    ))
    .bind(&state.item_id)
    .bind(&state.library_id)
    .bind(state.status.as_str())
    .bind(i64::from(state.failure_count))
    .bind(state.next_retry_at)
    .bind(state.last_error.map(|e| e.as_str()))
    .bind(state.last_checked_at)
    .bind(state.item_updated_at)
    .bind(state.first_failed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_archive(
    tx: &mut Transaction<'_, Sqlite>,
    state: &ItemState,
    archived_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        r#"
        INSERT INTO item_state_archive ({COLUMNS}, archived_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(item_id) DO UPDATE SET
            library_id = excluded.library_id,
            status = excluded.status,
            failure_count = excluded.failure_count,
            next_retry_at = excluded.next_retry_at,
            last_error = excluded.last_error,
            last_checked_at = excluded.last_checked_at,
            item_updated_at = excluded.item_updated_at,
            archived_at = excluded.archived_at
        "#
    ))
    .bind(&state.item_id)
    .bind(&state.library_id)
    .bind(state.status.as_str())
    .bind(i64::from(state.failure_count))
    .bind(state.next_retry_at)
    .bind(state.last_error.map(|e| e.as_str()))
    .bind(state.last_checked_at)
    .bind(state.item_updated_at)
    .bind(state.first_failed_at)
    .bind(archived_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
