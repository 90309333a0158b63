//! One category's synchronization run.
//!
//! A run is `fetch changed → re-derive artifacts → replace in index →
//! advance watermark`, executed while holding the category lock:
//!
//! 1. Read the watermark.
//! 2. Extract records modified strictly after it. None: the run completes
//!    with the watermark unchanged.
//! 3. Attach work logs to the changed records.
//! 4. For each record in turn: delete its old artifacts, chunk, embed, store,
//!    and track the greatest modification time seen.
//! 5. Write the greatest *processed* timestamp as the new watermark.
//!
//! Any error in 2–4 aborts the remaining records, marks the row `failed`,
//! and leaves the watermark where it was. Step 4's delete-then-insert makes
//! reprocessing a record idempotent, so the next run simply refetches
//! everything the failed run touched.
//!
//! State writes are fenced on the run's [`LockToken`]. A run that outlived
//! the lock timeout and was reclaimed finds its watermark write rejected and
//! ends as failed without touching the row.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info, instrument, warn};

use crate::embedding::{embed_chunks, Embedder};
use crate::lock::{LockManager, LockToken};
use crate::models::{Category, Record, SyncResult};
use crate::source::{Chunker, Extractor};
use crate::store::{IndexStore, WatermarkStore};

/// Default number of chunks sent to the embedder per call.
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 32;

/// Default number of ids per existence check during reconciliation.
pub const DEFAULT_RECONCILE_BATCH_SIZE: usize = 100;

/// Outcome of a hard-delete reconciliation pass for one category.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ReconcileResult {
    pub category: Category,
    /// Indexed records whose existence was checked.
    pub checked: u64,
    /// Records whose artifacts were removed because the backend no longer
    /// has them.
    pub removed: u64,
    /// Lock was held by a sync run.
    pub skipped: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Default)]
struct RunProgress {
    records: u64,
    artifacts: u64,
}

/// Sync pipeline for a single category.
#[derive(Clone)]
pub struct CategoryPipeline {
    category: Category,
    extractor: Arc<dyn Extractor>,
    chunker: Arc<dyn Chunker>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn IndexStore>,
    state: Arc<dyn WatermarkStore>,
    locks: LockManager,
    embed_batch_size: usize,
}

impl CategoryPipeline {
    /// The pipeline's category is the extractor's.
    pub fn new(
        extractor: Arc<dyn Extractor>,
        chunker: Arc<dyn Chunker>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn IndexStore>,
        state: Arc<dyn WatermarkStore>,
        locks: LockManager,
    ) -> Self {
        Self {
            category: extractor.category(),
            extractor,
            chunker,
            embedder,
            index,
            state,
            locks,
            embed_batch_size: DEFAULT_EMBED_BATCH_SIZE,
        }
    }

    pub fn with_embed_batch_size(mut self, batch_size: usize) -> Self {
        self.embed_batch_size = batch_size.max(1);
        self
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Incremental run. Skipped when the lock is held.
    #[instrument(name = "sync_run", skip(self), fields(category = %self.category))]
    pub async fn run(&self) -> SyncResult {
        let Some(token) = self.locks.recover_and_acquire(self.category).await else {
            return SyncResult::skipped(self.category);
        };
        info!("lock acquired for sync");

        let result = self.run_locked(token).await;
        self.locks.release_logged(token).await;
        result
    }

    /// Full resync: rewind the watermark to `0`, drop every artifact of the
    /// category, then run normally. All under the same lock as [`run`], so a
    /// concurrent scheduled run is simply skipped.
    ///
    /// [`run`]: CategoryPipeline::run
    #[instrument(name = "full_sync", skip(self), fields(category = %self.category))]
    pub async fn force_full_sync(&self) -> SyncResult {
        let Some(token) = self.locks.recover_and_acquire(self.category).await else {
            return SyncResult::skipped(self.category);
        };
        warn!("starting FULL sync, all existing artifacts for this category will be deleted");

        let result = match self.reset_locked(token).await {
            Ok(deleted) => {
                info!(deleted, "cleared category before full sync");
                self.run_locked(token).await
            }
            Err(e) => self.fail(token, RunProgress::default(), e).await,
        };
        self.locks.release_logged(token).await;
        result
    }

    /// Administrative clear: delete every artifact and rewind the watermark.
    ///
    /// Returns `Ok(None)` when the lock is held.
    pub async fn reset(&self) -> Result<Option<u64>> {
        let Some(token) = self.locks.recover_and_acquire(self.category).await else {
            return Ok(None);
        };
        let result = self.reset_locked(token).await;
        self.locks.release_logged(token).await;
        result.map(Some)
    }

    /// Remove artifacts of records the backend no longer has.
    ///
    /// Indexed ids are checked in batches; a batch whose check fails is
    /// treated as entirely alive so nothing is deleted on doubt.
    #[instrument(name = "reconcile", skip(self), fields(category = %self.category))]
    pub async fn reconcile_deletes(&self, batch_size: usize) -> ReconcileResult {
        let mut result = ReconcileResult {
            category: self.category,
            checked: 0,
            removed: 0,
            skipped: false,
            error_message: None,
        };
        let Some(token) = self.locks.recover_and_acquire(self.category).await else {
            result.skipped = true;
            return result;
        };

        if let Err(e) = self.reconcile_locked(batch_size.max(1), &mut result).await {
            error!(error = %e, "hard-delete reconciliation failed");
            result.error_message = Some(format!("{:#}", e));
        }
        self.locks.release_logged(token).await;
        result
    }

    async fn reconcile_locked(&self, batch_size: usize, result: &mut ReconcileResult) -> Result<()> {
        let mut stored: Vec<String> = self.index.source_ids(self.category).await?.into_iter().collect();
        stored.sort();
        if stored.is_empty() {
            return Ok(());
        }
        info!(count = stored.len(), "checking indexed records for deletion");

        for batch in stored.chunks(batch_size) {
            result.checked += batch.len() as u64;
            let alive = match self.extractor.check_existence(batch).await {
                Ok(alive) => alive,
                Err(e) => {
                    warn!(error = %e, "existence check failed, assuming batch is still present");
                    continue;
                }
            };
            for id in batch.iter().filter(|id| !alive.contains(*id)) {
                self.index.delete_by_source_record(self.category, id).await?;
                result.removed += 1;
            }
        }

        info!(removed = result.removed, "hard-delete reconciliation complete");
        Ok(())
    }

    async fn reset_locked(&self, token: LockToken) -> Result<u64> {
        if !self.state.reset_watermark(self.category, token.fence()).await? {
            bail!("sync lock for {} was reclaimed; nothing reset", self.category);
        }
        self.index.delete_by_category(self.category).await
    }

    async fn run_locked(&self, token: LockToken) -> SyncResult {
        let mut progress = RunProgress::default();
        match self.execute(token, &mut progress).await {
            Ok(()) => {
                info!(
                    records = progress.records,
                    artifacts = progress.artifacts,
                    "sync completed"
                );
                SyncResult::completed(self.category, progress.records, progress.artifacts)
            }
            Err(e) => self.fail(token, progress, e).await,
        }
    }

    async fn fail(&self, token: LockToken, progress: RunProgress, err: anyhow::Error) -> SyncResult {
        let message = format!("{:#}", err);
        error!(
            error = %message,
            records = progress.records,
            "sync failed, watermark not advanced"
        );
        match self
            .state
            .mark_failed(self.category, token.fence(), &message)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("sync lock was reclaimed, failure not recorded on the state row"),
            Err(e) => error!(error = %e, "could not record sync failure"),
        }
        SyncResult::failed(self.category, progress.records, progress.artifacts, message)
    }

    async fn execute(&self, token: LockToken, progress: &mut RunProgress) -> Result<()> {
        let watermark = self.state.ensure(self.category).await?.watermark;
        info!(watermark, "syncing records modified since watermark");

        let mut records = self
            .extractor
            .extract_modified_since(watermark)
            .await
            .with_context(|| format!("extracting {} records", self.category))?;
        info!(count = records.len(), "found modified records");

        if records.is_empty() {
            self.commit_watermark(token, watermark, 0).await?;
            return Ok(());
        }

        self.attach_work_logs(&mut records).await?;

        let mut max_seen = watermark;
        for record in &records {
            progress.artifacts += self.replace_record(record).await?;
            progress.records += 1;
            if let Some(ts) = record.modified_at {
                max_seen = max_seen.max(ts);
            }
        }

        self.commit_watermark(token, max_seen, progress.records).await?;
        info!(watermark = max_seen, records = progress.records, "advanced watermark");
        Ok(())
    }

    async fn commit_watermark(&self, token: LockToken, watermark: i64, records: u64) -> Result<()> {
        let applied = self
            .state
            .set_watermark(self.category, token.fence(), watermark, records, self.locks.now())
            .await?;
        if !applied {
            bail!(
                "sync lock for {} was reclaimed; watermark not advanced",
                self.category
            );
        }
        Ok(())
    }

    async fn attach_work_logs(&self, records: &mut [Record]) -> Result<()> {
        let ids: Vec<String> = records.iter().map(|r| r.source_id.clone()).collect();
        let mut logs = self
            .extractor
            .work_logs(&ids)
            .await
            .with_context(|| format!("fetching {} work logs", self.category))?;
        if logs.is_empty() {
            return Ok(());
        }
        for record in records.iter_mut() {
            if let Some(entries) = logs.remove(&record.source_id) {
                record.work_logs = entries;
            }
        }
        Ok(())
    }

    /// Delete-then-insert for one record. Returns the artifacts written.
    async fn replace_record(&self, record: &Record) -> Result<u64> {
        self.index
            .delete_by_source_record(self.category, &record.source_id)
            .await
            .with_context(|| format!("deleting artifacts of {}", record.source_id))?;

        let chunks = self.chunker.chunk(record);
        let count = chunks.len() as u64;
        let embedded = embed_chunks(self.embedder.as_ref(), chunks, self.embed_batch_size)
            .await
            .with_context(|| format!("embedding {}", record.source_id))?;

        self.index
            .store_batch(&embedded)
            .await
            .with_context(|| format!("storing artifacts of {}", record.source_id))?;
        Ok(count)
    }
}
