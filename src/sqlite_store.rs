//! SQLite-backed [`WatermarkStore`] and [`IndexStore`].
//!
//! Every lock transition is a single conditional `UPDATE`; whether the
//! caller won is read from `rows_affected()`, so two processes sharing the
//! database file cannot both acquire a category.

use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use itsm_sync_core::embedding::vec_to_blob;
use itsm_sync_core::models::{Category, EmbeddedChunk, SyncState, SyncStatus};
use itsm_sync_core::store::{IndexStore, WatermarkStore};

const STATE_COLUMNS: &str = "category, watermark, status, last_attempt_at, last_completed_at, records_processed, error_message";

/// `sync_state` table.
#[derive(Clone)]
pub struct SqliteWatermarkStore {
    pool: SqlitePool,
}

impl SqliteWatermarkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row(row: &SqliteRow) -> Result<SyncState> {
        let category: String = row.get("category");
        let status: String = row.get("status");
        let records: i64 = row.get("records_processed");
        Ok(SyncState {
            category: category
                .parse()
                .map_err(|e| anyhow!("corrupt sync_state row: {}", e))?,
            watermark: row.get("watermark"),
            status: status.parse()?,
            last_attempt_at: row.get("last_attempt_at"),
            last_completed_at: row.get("last_completed_at"),
            records_processed: records.max(0) as u64,
            error_message: row.get("error_message"),
        })
    }
}

#[async_trait]
impl WatermarkStore for SqliteWatermarkStore {
    async fn ensure(&self, category: Category) -> Result<SyncState> {
        sqlx::query("INSERT INTO sync_state (category) VALUES (?) ON CONFLICT(category) DO NOTHING")
            .bind(category.as_str())
            .execute(&self.pool)
            .await?;

        self.get(category)
            .await?
            .ok_or_else(|| anyhow!("sync_state row for {} vanished after insert", category))
    }

    async fn get(&self, category: Category) -> Result<Option<SyncState>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sync_state WHERE category = ?",
            STATE_COLUMNS
        ))
        .bind(category.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list(&self) -> Result<Vec<SyncState>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sync_state ORDER BY category",
            STATE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn set_watermark(
        &self,
        category: Category,
        fence: i64,
        watermark: i64,
        records: u64,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_state
            SET watermark = ?, records_processed = ?, last_completed_at = ?,
                status = 'completed', error_message = NULL
            WHERE category = ? AND status = 'running' AND last_attempt_at = ?
            "#,
        )
        .bind(watermark)
        .bind(records as i64)
        .bind(now)
        .bind(category.as_str())
        .bind(fence)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_watermark(&self, category: Category, fence: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_state SET watermark = 0, records_processed = 0
            WHERE category = ? AND status = 'running' AND last_attempt_at = ?
            "#,
        )
        .bind(category.as_str())
        .bind(fence)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, category: Category, fence: i64, message: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_state SET status = 'failed', error_message = ?
            WHERE category = ? AND status = 'running' AND last_attempt_at = ?
            "#,
        )
        .bind(message)
        .bind(category.as_str())
        .bind(fence)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_acquire(&self, category: Category, now: i64) -> Result<Option<i64>> {
        let fence: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE sync_state
            SET status = 'running',
                last_attempt_at = MAX(?, COALESCE(last_attempt_at + 1, ?)),
                error_message = NULL
            WHERE category = ? AND status != 'running'
            RETURNING last_attempt_at
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(category.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(fence)
    }

    async fn release(&self, category: Category, fence: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_state SET status = 'idle'
            WHERE category = ? AND status = 'running' AND last_attempt_at = ?
            "#,
        )
        .bind(category.as_str())
        .bind(fence)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn has_stale_lock(&self, category: Category, cutoff: i64) -> Result<bool> {
        let stale: bool = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) > 0 FROM sync_state
            WHERE category = ? AND status = 'running' AND last_attempt_at < ?
            "#,
        )
        .bind(category.as_str())
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(stale)
    }

    async fn release_stale(&self, cutoff: i64, message: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_state SET status = 'failed', error_message = ?
            WHERE status = 'running' AND last_attempt_at < ?
            "#,
        )
        .bind(message)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn is_any_running(&self) -> Result<bool> {
        let running: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sync_state WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await?;
        Ok(running)
    }
}

/// `artifacts` table. Vectors are stored as little-endian f32 BLOBs.
#[derive(Clone)]
pub struct SqliteIndexStore {
    pool: SqlitePool,
}

impl SqliteIndexStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn delete_by_source_record(&self, category: Category, source_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM artifacts WHERE category = ? AND source_id = ?")
            .bind(category.as_str())
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn store_batch(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for item in chunks {
            let chunk = &item.chunk;
            let metadata_json = serde_json::to_string(&chunk.metadata)
                .context("Failed to serialize chunk metadata")?;
            sqlx::query(
                r#"
                INSERT INTO artifacts (id, category, source_id, chunk_type, sequence, content,
                                       hash, metadata_json, model, dims, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    chunk_type = excluded.chunk_type,
                    content = excluded.content,
                    hash = excluded.hash,
                    metadata_json = excluded.metadata_json,
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    created_at = excluded.created_at
                "#,
            )
            .bind(&chunk.chunk_id)
            .bind(chunk.category.as_str())
            .bind(&chunk.source_id)
            .bind(chunk.chunk_type.as_str())
            .bind(chunk.sequence)
            .bind(&chunk.content)
            .bind(&chunk.hash)
            .bind(&metadata_json)
            .bind(&item.model)
            .bind(item.vector.len() as i64)
            .bind(vec_to_blob(&item.vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_category(&self, category: Category) -> Result<u64> {
        let result = sqlx::query("DELETE FROM artifacts WHERE category = ?")
            .bind(category.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn source_ids(&self, category: Category) -> Result<HashSet<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT source_id FROM artifacts WHERE category = ?")
                .bind(category.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    async fn count_by_category(&self) -> Result<BTreeMap<Category, u64>> {
        let rows = sqlx::query("SELECT category, COUNT(*) AS n FROM artifacts GROUP BY category")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let name: String = row.get("category");
            let n: i64 = row.get("n");
            match name.parse::<Category>() {
                Ok(category) => {
                    counts.insert(category, n.max(0) as u64);
                }
                Err(_) => tracing::warn!(category = %name, "ignoring artifacts with unknown category"),
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use super::*;
    use crate::migrate::migrate_pool;
    use itsm_sync_core::models::{ChunkType, TextChunk};
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;
    use tempfile::TempDir;

    async fn pool(tmp: &TempDir) -> SqlitePool {
        let path = tmp.path().join("state.sqlite");
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        pool
    }

    fn artifact(category: Category, source_id: &str, seq: i64) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: TextChunk {
                chunk_id: format!("{}-{}-{}", category, source_id, seq),
                category,
                source_id: source_id.to_string(),
                chunk_type: ChunkType::Description,
                sequence: seq,
                content: format!("text {}", seq),
                hash: "h".to_string(),
                metadata: Map::new(),
            },
            vector: vec![0.5, 1.5],
            model: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteWatermarkStore::new(pool(&tmp).await);

        let row = store.ensure(Category::Incident).await.unwrap();
        assert_eq!(row.status, SyncStatus::Idle);
        assert_eq!(row.watermark, 0);

        assert_eq!(store.try_acquire(Category::Incident, 100).await.unwrap(), Some(100));
        assert_eq!(store.try_acquire(Category::Incident, 101).await.unwrap(), None);

        assert!(store
            .set_watermark(Category::Incident, 100, 42, 3, 200)
            .await
            .unwrap());
        let row = store.get(Category::Incident).await.unwrap().unwrap();
        assert_eq!(row.watermark, 42);
        assert_eq!(row.records_processed, 3);
        assert_eq!(row.status, SyncStatus::Completed);
        assert_eq!(row.last_attempt_at, Some(100));
        assert_eq!(row.last_completed_at, Some(200));

        // completed row is not released back to idle
        assert!(!store.release(Category::Incident, 100).await.unwrap());

        assert_eq!(store.try_acquire(Category::Incident, 300).await.unwrap(), Some(300));
        assert!(store.mark_failed(Category::Incident, 300, "boom").await.unwrap());
        let row = store.get(Category::Incident).await.unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("boom"));
        assert_eq!(row.watermark, 42);
    }

    #[tokio::test]
    async fn test_acquire_requires_row() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteWatermarkStore::new(pool(&tmp).await);
        assert_eq!(store.try_acquire(Category::WorkOrder, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_stale_only_old_running_rows() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteWatermarkStore::new(pool(&tmp).await);
        store.ensure(Category::Incident).await.unwrap();
        store.ensure(Category::WorkOrder).await.unwrap();
        store.try_acquire(Category::Incident, 1_000).await.unwrap();
        store.try_acquire(Category::WorkOrder, 5_000).await.unwrap();

        assert!(store.has_stale_lock(Category::Incident, 2_000).await.unwrap());
        assert!(!store.has_stale_lock(Category::WorkOrder, 2_000).await.unwrap());
        assert_eq!(store.release_stale(2_000, "timeout").await.unwrap(), 1);

        let states = store.list().await.unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].category, Category::Incident);
        assert_eq!(states[0].status, SyncStatus::Failed);
        assert_eq!(states[1].status, SyncStatus::Running);
        assert!(store.is_any_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_keeps_status() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteWatermarkStore::new(pool(&tmp).await);
        store.ensure(Category::ChangeRequest).await.unwrap();
        store.try_acquire(Category::ChangeRequest, 1).await.unwrap();
        assert!(store.reset_watermark(Category::ChangeRequest, 1).await.unwrap());
        let row = store.get(Category::ChangeRequest).await.unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::Running);
        assert_eq!(row.watermark, 0);
    }

    #[tokio::test]
    async fn test_writes_after_reclaim_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteWatermarkStore::new(pool(&tmp).await);
        store.ensure(Category::Incident).await.unwrap();
        store.try_acquire(Category::Incident, 1_000).await.unwrap();
        assert!(store
            .set_watermark(Category::Incident, 1_000, 500, 2, 1_010)
            .await
            .unwrap());

        // first holder stalls; its lock is failed as stale and retaken
        store.try_acquire(Category::Incident, 2_000).await.unwrap();
        assert_eq!(store.release_stale(6_000, "timeout").await.unwrap(), 1);
        assert_eq!(store.try_acquire(Category::Incident, 6_000).await.unwrap(), Some(6_000));

        assert!(!store
            .set_watermark(Category::Incident, 2_000, 100, 1, 6_100)
            .await
            .unwrap());
        assert!(!store.reset_watermark(Category::Incident, 2_000).await.unwrap());
        assert!(!store
            .mark_failed(Category::Incident, 2_000, "late failure")
            .await
            .unwrap());
        assert!(!store.release(Category::Incident, 2_000).await.unwrap());

        let row = store.get(Category::Incident).await.unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::Running);
        assert_eq!(row.last_attempt_at, Some(6_000));
        assert_eq!(row.watermark, 500);
        assert!(row.error_message.is_none());
        assert_eq!(store.try_acquire(Category::Incident, 6_001).await.unwrap(), None);

        assert!(store.release(Category::Incident, 6_000).await.unwrap());
        // same-second reacquire still gets a fresh fence
        assert_eq!(store.try_acquire(Category::Incident, 6_000).await.unwrap(), Some(6_001));
    }

    #[tokio::test]
    async fn test_index_store_replace_and_counts() {
        let tmp = TempDir::new().unwrap();
        let index = SqliteIndexStore::new(pool(&tmp).await);

        index
            .store_batch(&[
                artifact(Category::Incident, "INC1", 0),
                artifact(Category::Incident, "INC1", 1),
                artifact(Category::Incident, "INC2", 0),
                artifact(Category::WorkOrder, "WO1", 0),
            ])
            .await
            .unwrap();

        let counts = index.count_by_category().await.unwrap();
        assert_eq!(counts.get(&Category::Incident), Some(&3));
        assert_eq!(counts.get(&Category::WorkOrder), Some(&1));

        assert_eq!(
            index
                .delete_by_source_record(Category::Incident, "INC1")
                .await
                .unwrap(),
            2
        );
        let ids = index.source_ids(Category::Incident).await.unwrap();
        assert_eq!(ids, HashSet::from(["INC2".to_string()]));

        assert_eq!(index.delete_by_category(Category::WorkOrder).await.unwrap(), 1);
        assert!(index.source_ids(Category::WorkOrder).await.unwrap().is_empty());
    }
}
