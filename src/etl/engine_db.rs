//! Engine database: durable sync cursor and progress statistics.
//!
//! Lives in the same SQLite file as the indexed records so the cursor survives restarts
//! alongside the data it describes.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Row, Sqlite, SqlitePool};

/// Embedded SQL schema
const SCHEMA_SQL: &str = include_str!("../../sql/engine_schema.sql");

const EXTRACTOR_TYPE: &str = "sync_engine";

fn cursor_key(indexer_id: &str) -> String {
    format!("last_block:{indexer_id}")
}

/// Tracks the last fully processed block per indexer.
#[derive(Debug, Clone)]
pub struct EngineDb {
    pool: SqlitePool,
}

impl EngineDb {
    /// Wraps `pool` and loads the engine schema.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let db = Self { pool };
        db.load_schema_from_sql().await?;
        tracing::info!(target: "auco::etl::engine_db", "Engine database schema initialized");
        Ok(db)
    }

    async fn load_schema_from_sql(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql_lines: Vec<&str> = statement
                .lines()
                .filter(|line| {
                    let trimmed = line.trim();
                    !trimmed.is_empty() && !trimmed.starts_with("--")
                })
                .collect();

            if sql_lines.is_empty() {
                continue;
            }

            let clean_sql = sql_lines.join("\n");
            let first_line = clean_sql.lines().next().unwrap_or_default();

            tracing::debug!(target: "auco::etl::engine_db", "Executing SQL: {}", first_line);

            sqlx::query(&clean_sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to execute SQL: {first_line}"))?;
        }
        Ok(())
    }

    /// Last fully processed block, or `None` when the indexer never committed one.
    pub async fn get_cursor(&self, indexer_id: &str) -> Result<Option<u64>> {
        let row = sqlx::query(
            "SELECT state_value FROM extractor_state WHERE extractor_type = ? AND state_key = ?",
        )
        .bind(EXTRACTOR_TYPE)
        .bind(cursor_key(indexer_id))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read sync cursor")?;

        row.map(|r| {
            let value: String = r.get(0);
            value
                .parse::<u64>()
                .with_context(|| format!("Corrupt sync cursor for {indexer_id}: {value:?}"))
        })
        .transpose()
    }

    /// Overwrites the cursor without touching the head statistics.
    pub async fn set_cursor(&self, indexer_id: &str, block_number: u64) -> Result<()> {
        upsert_cursor(&self.pool, indexer_id, block_number).await
    }

    /// Sets the head block and adds `events` to the handled-events counter.
    pub async fn update_head(&self, indexer_id: &str, block_number: u64, events: u64) -> Result<()> {
        upsert_head(&self.pool, indexer_id, block_number, events).await
    }

    /// Advances the cursor to `block_number` and updates the head, atomically.
    pub async fn commit_block(&self, indexer_id: &str, block_number: u64, events: u64) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin cursor commit")?;
        upsert_cursor(&mut *tx, indexer_id, block_number).await?;
        upsert_head(&mut *tx, indexer_id, block_number, events).await?;
        tx.commit().await.context("Failed to commit cursor")?;
        Ok(())
    }

    /// Head block and total handled events for `indexer_id`.
    pub async fn get_head(&self, indexer_id: &str) -> Result<(u64, u64)> {
        let row = sqlx::query("SELECT block_number, event_count FROM head WHERE id = ?")
            .bind(indexer_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read head")?;

        Ok(row.map_or((0, 0), |r| {
            let block_number: i64 = r.get(0);
            let event_count: i64 = r.get(1);
            (block_number as u64, event_count as u64)
        }))
    }

    pub async fn get_stat(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM stats WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get(0)))
    }

    pub async fn set_stat(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO stats (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Engine statistics as a JSON-friendly struct
    pub async fn get_stats(&self, indexer_id: &str) -> Result<EngineStats> {
        let (current_block, total_events) = self.get_head(indexer_id).await?;
        let cursor = self.get_cursor(indexer_id).await?;
        let start_time = self.get_stat("start_time").await?.unwrap_or_default();

        Ok(EngineStats {
            cursor,
            current_block,
            total_events,
            start_time,
        })
    }
}

async fn upsert_cursor<'e, E>(executor: E, indexer_id: &str, block_number: u64) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO extractor_state (extractor_type, state_key, state_value, updated_at) \
         VALUES (?, ?, ?, strftime('%s', 'now')) \
         ON CONFLICT(extractor_type, state_key) \
         DO UPDATE SET state_value = excluded.state_value, updated_at = strftime('%s', 'now')",
    )
    .bind(EXTRACTOR_TYPE)
    .bind(cursor_key(indexer_id))
    .bind(block_number.to_string())
    .execute(executor)
    .await
    .context("Failed to write sync cursor")?;

    Ok(())
}

async fn upsert_head<'e, E>(executor: E, indexer_id: &str, block_number: u64, events: u64) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO head (id, block_number, event_count) VALUES (?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET block_number = excluded.block_number, \
         event_count = head.event_count + excluded.event_count",
    )
    .bind(indexer_id)
    .bind(block_number as i64)
    .bind(events as i64)
    .execute(executor)
    .await
    .context("Failed to update head")?;

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub cursor: Option<u64>,
    pub current_block: u64,
    pub total_events: u64,
    pub start_time: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::store::RecordStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn cursor_is_absent_until_first_commit() {
        let store = RecordStore::in_memory().await.unwrap();
        let db = EngineDb::new(store.pool().clone()).await.unwrap();

        assert_eq!(db.get_cursor("devnet").await.unwrap(), None);
        assert_eq!(db.get_head("devnet").await.unwrap(), (0, 0));

        db.commit_block("devnet", 4, 2).await.unwrap();
        db.commit_block("devnet", 5, 1).await.unwrap();

        assert_eq!(db.get_cursor("devnet").await.unwrap(), Some(5));
        assert_eq!(db.get_head("devnet").await.unwrap(), (5, 3));
    }

    #[tokio::test]
    async fn cursors_are_scoped_per_indexer() {
        let store = RecordStore::in_memory().await.unwrap();
        let db = EngineDb::new(store.pool().clone()).await.unwrap();

        db.set_cursor("devnet", 10).await.unwrap();
        db.update_head("devnet", 10, 3).await.unwrap();
        db.set_cursor("sepolia", 900).await.unwrap();

        assert_eq!(db.get_cursor("devnet").await.unwrap(), Some(10));
        assert_eq!(db.get_cursor("sepolia").await.unwrap(), Some(900));
        assert_eq!(db.get_cursor("mainnet").await.unwrap(), None);
        assert_eq!(db.get_head("devnet").await.unwrap(), (10, 3));
        assert_eq!(db.get_head("sepolia").await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn cursor_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("indexer.db");

        let store = RecordStore::open(&path).await.unwrap();
        let db = EngineDb::new(store.pool().clone()).await.unwrap();
        db.commit_block("devnet", 42, 7).await.unwrap();
        db.set_stat("start_time", "1700000000").await.unwrap();
        store.close().await;

        let store = RecordStore::open(&path).await.unwrap();
        let db = EngineDb::new(store.pool().clone()).await.unwrap();
        let stats = db.get_stats("devnet").await.unwrap();
        assert_eq!(
            stats,
            EngineStats {
                cursor: Some(42),
                current_block: 42,
                total_events: 7,
                start_time: "1700000000".to_string(),
            }
        );
    }
}
