//! Drives every configured [`CategoryPipeline`].
//!
//! The coordinator holds no lock of its own. Categories run one after the
//! other and each pipeline takes its own category lock, so overlapping
//! invocations (scheduler tick, manual trigger, a second process) are safe:
//! whichever arrives second is skipped per category.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{EngineResult, SyncError};
use crate::lock::LockManager;
use crate::models::{Category, SyncResult, SyncState, SyncStatus};
use crate::pipeline::{CategoryPipeline, ReconcileResult, DEFAULT_RECONCILE_BATCH_SIZE};
use crate::store::{IndexStore, WatermarkStore};

/// Results of one `run_all` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub started_at: i64,
    pub finished_at: i64,
    pub results: Vec<SyncResult>,
}

impl SyncReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.is_skipped()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded() - self.skipped()
    }

    pub fn records_processed(&self) -> u64 {
        self.results.iter().map(|r| r.records_processed).sum()
    }

    pub fn artifacts_created(&self) -> u64 {
        self.results.iter().map(|r| r.artifacts_created).sum()
    }
}

/// Results of one hard-delete reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub results: Vec<ReconcileResult>,
}

impl ReconcileReport {
    pub fn removed(&self) -> u64 {
        self.results.iter().map(|r| r.removed).sum()
    }
}

/// Snapshot used by `status` reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatistics {
    pub states: Vec<SyncState>,
    pub artifacts: BTreeMap<Category, u64>,
    pub total_artifacts: u64,
    /// `running` if any category is running, else `error` if any failed,
    /// else `idle`.
    pub overall: &'static str,
}

pub struct SyncCoordinator {
    pipelines: BTreeMap<Category, CategoryPipeline>,
    state: Arc<dyn WatermarkStore>,
    index: Arc<dyn IndexStore>,
    locks: LockManager,
    reconcile_batch_size: usize,
}

impl SyncCoordinator {
    pub fn new(state: Arc<dyn WatermarkStore>, index: Arc<dyn IndexStore>, locks: LockManager) -> Self {
        Self {
            pipelines: BTreeMap::new(),
            state,
            index,
            locks,
            reconcile_batch_size: DEFAULT_RECONCILE_BATCH_SIZE,
        }
    }

    /// Register a pipeline, replacing any earlier one for its category.
    pub fn with_pipeline(mut self, pipeline: CategoryPipeline) -> Self {
        self.pipelines.insert(pipeline.category(), pipeline);
        self
    }

    pub fn with_reconcile_batch_size(mut self, batch_size: usize) -> Self {
        self.reconcile_batch_size = batch_size.max(1);
        self
    }

    /// Configured categories in run order.
    pub fn categories(&self) -> Vec<Category> {
        self.pipelines.keys().copied().collect()
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// Run every configured category once, sequentially.
    pub async fn run_all(&self) -> SyncReport {
        let started_at = self.locks.now();
        match self.state.is_any_running().await {
            Ok(true) => warn!("a sync appears to be running already, categories it holds will be skipped"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "could not check for running syncs"),
        }
        info!(categories = self.pipelines.len(), "starting scheduled sync");

        let mut results = Vec::with_capacity(self.pipelines.len());
        for pipeline in self.pipelines.values() {
            results.push(pipeline.run().await);
        }

        let report = SyncReport {
            started_at,
            finished_at: self.locks.now(),
            results,
        };
        info!(
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            records = report.records_processed(),
            artifacts = report.artifacts_created(),
            "sync finished"
        );
        report
    }

    /// Incremental run of one category.
    pub async fn run_category(&self, name: &str) -> EngineResult<SyncResult> {
        Ok(self.pipeline(name)?.run().await)
    }

    /// Full resync of one category. Unknown or unconfigured names are
    /// rejected before any lock is taken.
    pub async fn force_full_sync(&self, name: &str) -> EngineResult<SyncResult> {
        Ok(self.pipeline(name)?.force_full_sync().await)
    }

    /// Clear a category's artifacts and rewind its watermark.
    ///
    /// `Ok(None)` when a sync currently holds the category.
    pub async fn reset_category(&self, name: &str) -> EngineResult<Option<u64>> {
        let pipeline = self.pipeline(name)?;
        let deleted = pipeline.reset().await?;
        match deleted {
            Some(n) => info!(category = %pipeline.category(), deleted = n, "reset category"),
            None => warn!(category = %pipeline.category(), "reset skipped, sync in progress"),
        }
        Ok(deleted)
    }

    /// Hard-delete reconciliation across all configured categories.
    pub async fn reconcile_deletes(&self) -> ReconcileReport {
        let mut results = Vec::with_capacity(self.pipelines.len());
        for pipeline in self.pipelines.values() {
            results.push(pipeline.reconcile_deletes(self.reconcile_batch_size).await);
        }
        let report = ReconcileReport { results };
        info!(removed = report.removed(), "reconciliation finished");
        report
    }

    /// Stale-lock recovery across every category.
    pub async fn release_stale(&self) -> EngineResult<u64> {
        Ok(self.locks.release_stale().await?)
    }

    /// State rows for all configured categories. Categories never synced
    /// are reported as fresh `idle` rows without being persisted.
    pub async fn states(&self) -> EngineResult<Vec<SyncState>> {
        let mut rows: BTreeMap<Category, SyncState> = self
            .state
            .list()
            .await?
            .into_iter()
            .map(|s| (s.category, s))
            .collect();
        for category in self.pipelines.keys() {
            rows.entry(*category).or_insert_with(|| SyncState::new(*category));
        }
        Ok(rows.into_values().collect())
    }

    pub async fn statistics(&self) -> EngineResult<SyncStatistics> {
        let states = self.states().await?;
        let artifacts = self.index.count_by_category().await?;
        let total_artifacts = artifacts.values().sum();
        let overall = if states.iter().any(|s| s.status == SyncStatus::Running) {
            "running"
        } else if states.iter().any(|s| s.status == SyncStatus::Failed) {
            "error"
        } else {
            "idle"
        };
        Ok(SyncStatistics {
            states,
            artifacts,
            total_artifacts,
            overall,
        })
    }

    fn pipeline(&self, name: &str) -> EngineResult<&CategoryPipeline> {
        let category: Category = name.parse()?;
        self.pipelines
            .get(&category)
            .ok_or_else(|| SyncError::CategoryNotConfigured(category.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ParagraphChunker;
    use crate::clock::ManualClock;
    use crate::lock::DEFAULT_LOCK_TIMEOUT_MINUTES;
    use crate::pipeline::tests::{record, FakeEmbedder, FakeExtractor, NOW};
    use crate::store::memory::{InMemoryIndexStore, InMemoryWatermarkStore};

    struct Setup {
        state: Arc<InMemoryWatermarkStore>,
        index: Arc<InMemoryIndexStore>,
        clock: Arc<ManualClock>,
        extractors: BTreeMap<Category, Arc<FakeExtractor>>,
        coordinator: SyncCoordinator,
    }

    fn setup(categories: &[Category], fail_on: Option<&str>) -> Setup {
        let state = Arc::new(InMemoryWatermarkStore::new());
        let index = Arc::new(InMemoryIndexStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let locks = LockManager::new(state.clone(), clock.clone(), DEFAULT_LOCK_TIMEOUT_MINUTES);
        let embedder = Arc::new(FakeEmbedder {
            fail_on: fail_on.map(str::to_string),
        });

        let mut coordinator = SyncCoordinator::new(state.clone(), index.clone(), locks.clone());
        let mut extractors = BTreeMap::new();
        for (i, category) in categories.iter().enumerate() {
            let id = format!("{}-{}", category, i);
            let extractor = Arc::new(FakeExtractor::new(
                *category,
                vec![record(*category, &id, 100 + i as i64, &format!("body of {}", id))],
            ));
            coordinator = coordinator.with_pipeline(CategoryPipeline::new(
                extractor.clone(),
                Arc::new(ParagraphChunker::new(250)),
                embedder.clone(),
                index.clone(),
                state.clone(),
                locks.clone(),
            ));
            extractors.insert(*category, extractor);
        }

        Setup {
            state,
            index,
            clock,
            extractors,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_run_all_syncs_every_category() {
        let s = setup(&Category::ALL, None);
        let report = s.coordinator.run_all().await;

        assert_eq!(report.results.len(), 4);
        assert_eq!(report.succeeded(), 4);
        assert_eq!(report.records_processed(), 4);
        let counts = s.index.count_by_category().await.unwrap();
        assert_eq!(counts.len(), 4);
        for state in s.coordinator.states().await.unwrap() {
            assert_eq!(state.status, SyncStatus::Completed);
            assert!(state.watermark >= 100);
        }
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let s = setup(&[Category::Incident, Category::WorkOrder], Some("Incident"));
        let report = s.coordinator.run_all().await;

        assert_eq!(report.failed(), 1);
        assert_eq!(report.succeeded(), 1);
        let incident = s.state.get(Category::Incident).await.unwrap().unwrap();
        assert_eq!(incident.status, SyncStatus::Failed);
        assert_eq!(incident.watermark, 0);
        let work_order = s.state.get(Category::WorkOrder).await.unwrap().unwrap();
        assert_eq!(work_order.status, SyncStatus::Completed);

        let stats = s.coordinator.statistics().await.unwrap();
        assert_eq!(stats.overall, "error");
    }

    #[tokio::test]
    async fn test_held_category_is_skipped_others_run() {
        let s = setup(&[Category::Incident, Category::WorkOrder], None);
        assert!(s
            .coordinator
            .lock_manager()
            .try_acquire(Category::Incident)
            .await
            .unwrap()
            .is_some());

        let report = s.coordinator.run_all().await;
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(
            report.results[0].error_message(),
            Some("Sync already in progress for Incident")
        );
        assert_eq!(s.coordinator.statistics().await.unwrap().overall, "running");
    }

    #[tokio::test]
    async fn test_crashed_holder_recovered_on_next_run_all() {
        let s = setup(&[Category::Incident], None);
        assert!(s
            .coordinator
            .lock_manager()
            .try_acquire(Category::Incident)
            .await
            .unwrap()
            .is_some());
        s.clock.advance_minutes(90);

        let report = s.coordinator.run_all().await;
        assert_eq!(report.succeeded(), 1);
    }

    #[tokio::test]
    async fn test_force_full_sync_rejects_unknown_before_locking() {
        let s = setup(&[Category::Incident], None);

        let err = s.coordinator.force_full_sync("Problem").await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownCategory(_)));
        let err = s.coordinator.force_full_sync("WorkOrder").await.unwrap_err();
        assert!(matches!(err, SyncError::CategoryNotConfigured(_)));
        assert!(s.state.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_full_sync_restarts_from_zero() {
        let s = setup(&[Category::Incident], None);
        s.coordinator.run_all().await;
        let extractor = &s.extractors[&Category::Incident];

        let result = s.coordinator.force_full_sync("incident").await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.records_processed, 1);
        assert_eq!(*extractor.calls.lock().unwrap(), vec![0, 0]);
        let row = s.state.get(Category::Incident).await.unwrap().unwrap();
        assert_eq!(row.watermark, 100);
    }

    #[tokio::test]
    async fn test_reset_category_and_reconcile() {
        let s = setup(&[Category::Incident, Category::ChangeRequest], None);
        s.coordinator.run_all().await;

        // backend dropped the change request
        s.extractors[&Category::ChangeRequest].set_records(vec![]);
        let report = s.coordinator.reconcile_deletes().await;
        assert_eq!(report.removed(), 1);

        let deleted = s.coordinator.reset_category("Incident").await.unwrap();
        assert_eq!(deleted, Some(2));
        assert_eq!(s.index.len().unwrap(), 0);
        let row = s.state.get(Category::Incident).await.unwrap().unwrap();
        assert_eq!(row.watermark, 0);
    }

    #[tokio::test]
    async fn test_states_include_unsynced_categories() {
        let s = setup(&[Category::Incident, Category::KnowledgeArticle], None);
        let states = s.coordinator.states().await.unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|st| st.status == SyncStatus::Idle));
        assert_eq!(s.coordinator.statistics().await.unwrap().overall, "idle");
    }
}
