//! In-memory [`WatermarkStore`] and [`IndexStore`] implementations.
//!
//! Each store keeps its data behind a single `std::sync::RwLock`, so every
//! conditional transition is evaluated and applied under one write guard,
//! which gives the same atomicity as a single SQL `UPDATE … WHERE`.
//! Used by engine tests and by embedders of the core crate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{Category, EmbeddedChunk, SyncState, SyncStatus};

use super::{IndexStore, WatermarkStore};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

/// In-memory sync state rows.
#[derive(Default)]
pub struct InMemoryWatermarkStore {
    rows: RwLock<BTreeMap<Category, SyncState>>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a row wholesale. Test hook for simulating crashed holders.
    pub fn put(&self, state: SyncState) -> Result<()> {
        write(&self.rows)?.insert(state.category, state);
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn ensure(&self, category: Category) -> Result<SyncState> {
        let mut rows = write(&self.rows)?;
        Ok(rows
            .entry(category)
            .or_insert_with(|| SyncState::new(category))
            .clone())
    }

    async fn get(&self, category: Category) -> Result<Option<SyncState>> {
        Ok(read(&self.rows)?.get(&category).cloned())
    }

    async fn list(&self) -> Result<Vec<SyncState>> {
        let mut states: Vec<SyncState> = read(&self.rows)?.values().cloned().collect();
        states.sort_by(|a, b| a.category.as_str().cmp(b.category.as_str()));
        Ok(states)
    }

    async fn set_watermark(
        &self,
        category: Category,
        fence: i64,
        watermark: i64,
        records: u64,
        now: i64,
    ) -> Result<bool> {
        let mut rows = write(&self.rows)?;
        match rows.get_mut(&category) {
            Some(row) if holds(row, fence) => {
                row.watermark = watermark;
                row.records_processed = records;
                row.last_completed_at = Some(now);
                row.status = SyncStatus::Completed;
                row.error_message = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_watermark(&self, category: Category, fence: i64) -> Result<bool> {
        let mut rows = write(&self.rows)?;
        match rows.get_mut(&category) {
            Some(row) if holds(row, fence) => {
                row.watermark = 0;
                row.records_processed = 0;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, category: Category, fence: i64, message: &str) -> Result<bool> {
        let mut rows = write(&self.rows)?;
        match rows.get_mut(&category) {
            Some(row) if holds(row, fence) => {
                row.status = SyncStatus::Failed;
                row.error_message = Some(message.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_acquire(&self, category: Category, now: i64) -> Result<Option<i64>> {
        let mut rows = write(&self.rows)?;
        match rows.get_mut(&category) {
            Some(row) if row.status != SyncStatus::Running => {
                let fence = row.last_attempt_at.map_or(now, |prev| now.max(prev + 1));
                row.status = SyncStatus::Running;
                row.last_attempt_at = Some(fence);
                row.error_message = None;
                Ok(Some(fence))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, category: Category, fence: i64) -> Result<bool> {
        let mut rows = write(&self.rows)?;
        match rows.get_mut(&category) {
            Some(row) if holds(row, fence) => {
                row.status = SyncStatus::Idle;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn has_stale_lock(&self, category: Category, cutoff: i64) -> Result<bool> {
        Ok(read(&self.rows)?
            .get(&category)
            .map(|row| is_stale(row, cutoff))
            .unwrap_or(false))
    }

    async fn release_stale(&self, cutoff: i64, message: &str) -> Result<u64> {
        let mut released = 0;
        for row in write(&self.rows)?.values_mut() {
            if is_stale(row, cutoff) {
                row.status = SyncStatus::Failed;
                row.error_message = Some(message.to_string());
                released += 1;
            }
        }
        Ok(released)
    }

    async fn is_any_running(&self) -> Result<bool> {
        Ok(read(&self.rows)?
            .values()
            .any(|row| row.status == SyncStatus::Running))
    }
}

/// The row is still locked by the acquire that stamped `fence`.
fn holds(row: &SyncState, fence: i64) -> bool {
    row.status == SyncStatus::Running && row.last_attempt_at == Some(fence)
}

fn is_stale(row: &SyncState, cutoff: i64) -> bool {
    row.status == SyncStatus::Running && row.last_attempt_at.is_some_and(|at| at < cutoff)
}

/// In-memory artifact index keyed by chunk id.
#[derive(Default)]
pub struct InMemoryIndexStore {
    artifacts: RwLock<HashMap<String, EmbeddedChunk>>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all artifacts for one record, ordered by sequence.
    pub fn artifacts_for(&self, category: Category, source_id: &str) -> Result<Vec<EmbeddedChunk>> {
        let mut found: Vec<EmbeddedChunk> = read(&self.artifacts)?
            .values()
            .filter(|a| a.chunk.category == category && a.chunk.source_id == source_id)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.chunk.sequence);
        Ok(found)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(read(&self.artifacts)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn delete_by_source_record(&self, category: Category, source_id: &str) -> Result<u64> {
        let mut artifacts = write(&self.artifacts)?;
        let before = artifacts.len();
        artifacts.retain(|_, a| !(a.chunk.category == category && a.chunk.source_id == source_id));
        Ok((before - artifacts.len()) as u64)
    }

    async fn store_batch(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
        let mut artifacts = write(&self.artifacts)?;
        for c in chunks {
            artifacts.insert(c.chunk.chunk_id.clone(), c.clone());
        }
        Ok(())
    }

    async fn delete_by_category(&self, category: Category) -> Result<u64> {
        let mut artifacts = write(&self.artifacts)?;
        let before = artifacts.len();
        artifacts.retain(|_, a| a.chunk.category != category);
        Ok((before - artifacts.len()) as u64)
    }

    async fn source_ids(&self, category: Category) -> Result<HashSet<String>> {
        Ok(read(&self.artifacts)?
            .values()
            .filter(|a| a.chunk.category == category)
            .map(|a| a.chunk.source_id.clone())
            .collect())
    }

    async fn count_by_category(&self) -> Result<BTreeMap<Category, u64>> {
        let mut counts = BTreeMap::new();
        for a in read(&self.artifacts)?.values() {
            *counts.entry(a.chunk.category).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let store = InMemoryWatermarkStore::new();
        let first = store.ensure(Category::Incident).await.unwrap();
        assert_eq!(first.watermark, 0);
        assert_eq!(first.status, SyncStatus::Idle);

        assert_eq!(store.try_acquire(Category::Incident, 90).await.unwrap(), Some(90));
        store
            .set_watermark(Category::Incident, 90, 42, 1, 100)
            .await
            .unwrap();
        let second = store.ensure(Category::Incident).await.unwrap();
        assert_eq!(second.watermark, 42);
    }

    #[tokio::test]
    async fn test_acquire_without_row_fails() {
        let store = InMemoryWatermarkStore::new();
        assert_eq!(store.try_acquire(Category::Incident, 10).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let store = InMemoryWatermarkStore::new();
        store.ensure(Category::WorkOrder).await.unwrap();

        assert_eq!(store.try_acquire(Category::WorkOrder, 10).await.unwrap(), Some(10));
        assert_eq!(store.try_acquire(Category::WorkOrder, 11).await.unwrap(), None);

        let row = store.get(Category::WorkOrder).await.unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::Running);
        assert_eq!(row.last_attempt_at, Some(10));

        assert!(!store.release(Category::WorkOrder, 11).await.unwrap());
        assert!(store.release(Category::WorkOrder, 10).await.unwrap());
        assert!(!store.release(Category::WorkOrder, 10).await.unwrap());
        assert_eq!(store.try_acquire(Category::WorkOrder, 12).await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn test_reacquire_in_same_second_gets_new_fence() {
        let store = InMemoryWatermarkStore::new();
        store.ensure(Category::Incident).await.unwrap();
        let first = store.try_acquire(Category::Incident, 10).await.unwrap().unwrap();
        assert!(store.set_watermark(Category::Incident, first, 7, 1, 10).await.unwrap());

        let second = store.try_acquire(Category::Incident, 10).await.unwrap().unwrap();
        assert_eq!(second, 11);
        // the finished holder's trailing release must not free the new lock
        assert!(!store.release(Category::Incident, first).await.unwrap());
        assert!(store.release(Category::Incident, second).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_leaves_completed_alone() {
        let store = InMemoryWatermarkStore::new();
        store.ensure(Category::Incident).await.unwrap();
        store.try_acquire(Category::Incident, 10).await.unwrap();
        assert!(store
            .set_watermark(Category::Incident, 10, 20, 3, 11)
            .await
            .unwrap());

        assert!(!store.release(Category::Incident, 10).await.unwrap());
        let row = store.get(Category::Incident).await.unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::Completed);
        assert_eq!(row.records_processed, 3);
        assert_eq!(row.last_completed_at, Some(11));
    }

    #[tokio::test]
    async fn test_reclaimed_lock_ignores_previous_holder() {
        let store = InMemoryWatermarkStore::new();
        store.ensure(Category::Incident).await.unwrap();
        store.try_acquire(Category::Incident, 10).await.unwrap();
        assert!(store.set_watermark(Category::Incident, 10, 50, 1, 11).await.unwrap());

        // second holder takes over after the first one's lock went stale
        store.try_acquire(Category::Incident, 100).await.unwrap();
        store.release_stale(200, "timeout").await.unwrap();
        store.try_acquire(Category::Incident, 300).await.unwrap();

        assert!(!store.set_watermark(Category::Incident, 100, 5, 1, 301).await.unwrap());
        assert!(!store.reset_watermark(Category::Incident, 100).await.unwrap());
        assert!(!store.mark_failed(Category::Incident, 100, "late").await.unwrap());
        assert!(!store.release(Category::Incident, 100).await.unwrap());

        let row = store.get(Category::Incident).await.unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::Running);
        assert_eq!(row.last_attempt_at, Some(300));
        assert_eq!(row.watermark, 50);
        assert!(row.error_message.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_exactly_one_wins() {
        let store = Arc::new(InMemoryWatermarkStore::new());
        store.ensure(Category::ChangeRequest).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_acquire(Category::ChangeRequest, i).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_release_stale_only_old_locks() {
        let store = InMemoryWatermarkStore::new();
        store.ensure(Category::Incident).await.unwrap();
        store.ensure(Category::WorkOrder).await.unwrap();
        store.try_acquire(Category::Incident, 100).await.unwrap();
        store.try_acquire(Category::WorkOrder, 500).await.unwrap();

        assert!(store.has_stale_lock(Category::Incident, 200).await.unwrap());
        assert!(!store.has_stale_lock(Category::WorkOrder, 200).await.unwrap());

        let released = store.release_stale(200, "timeout").await.unwrap();
        assert_eq!(released, 1);

        let incident = store.get(Category::Incident).await.unwrap().unwrap();
        assert_eq!(incident.status, SyncStatus::Failed);
        assert_eq!(incident.error_message.as_deref(), Some("timeout"));
        let work_order = store.get(Category::WorkOrder).await.unwrap().unwrap();
        assert_eq!(work_order.status, SyncStatus::Running);
    }

    fn artifact(category: Category, source_id: &str, seq: i64) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: crate::models::TextChunk {
                chunk_id: format!("{}-{}-{}", category, source_id, seq),
                category,
                source_id: source_id.to_string(),
                chunk_type: crate::models::ChunkType::Description,
                sequence: seq,
                content: "text".to_string(),
                hash: "h".to_string(),
                metadata: BTreeMap::new(),
            },
            vector: vec![1.0, 0.0],
            model: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_index_delete_by_record_and_category() {
        let index = InMemoryIndexStore::new();
        index
            .store_batch(&[
                artifact(Category::Incident, "INC1", 0),
                artifact(Category::Incident, "INC1", 1),
                artifact(Category::Incident, "INC2", 0),
                artifact(Category::WorkOrder, "WO1", 0),
            ])
            .await
            .unwrap();

        assert_eq!(
            index
                .delete_by_source_record(Category::Incident, "INC1")
                .await
                .unwrap(),
            2
        );
        let ids = index.source_ids(Category::Incident).await.unwrap();
        assert_eq!(ids, HashSet::from(["INC2".to_string()]));

        assert_eq!(index.delete_by_category(Category::Incident).await.unwrap(), 1);
        let counts = index.count_by_category().await.unwrap();
        assert_eq!(counts.get(&Category::WorkOrder), Some(&1));
        assert_eq!(counts.get(&Category::Incident), None);
    }
}
