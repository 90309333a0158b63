//! Storage abstractions for the sync engine.
//!
//! [`WatermarkStore`] owns the per-category [`SyncState`] rows. The row is
//! also the lock, so every state transition is exposed as a named operation
//! that an implementation must perform as one atomic single-row statement
//! (for SQL backends: one `UPDATE … WHERE …` whose affected-row count is the
//! answer). Callers never read-modify-write a row.
//!
//! Writes made on behalf of a lock holder are fenced: they carry the
//! `last_attempt_at` value the holder's [`try_acquire`](WatermarkStore::try_acquire)
//! wrote and only apply while the row is still `running` with that value.
//! A holder whose lock was reclaimed as stale therefore changes nothing.
//!
//! [`IndexStore`] is the downstream artifact index the pipeline replaces
//! records in.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Category, EmbeddedChunk, SyncState};

/// Persisted per-category sync state and lock.
///
/// # Operations
///
/// | Method | Transition |
/// |--------|------------|
/// | [`ensure`](WatermarkStore::ensure) | create the row (watermark `0`, `idle`) if absent |
/// | [`set_watermark`](WatermarkStore::set_watermark) | fenced: → `completed`, new watermark + count |
/// | [`reset_watermark`](WatermarkStore::reset_watermark) | fenced: watermark → `0`, status untouched |
/// | [`mark_failed`](WatermarkStore::mark_failed) | fenced: → `failed` with message |
/// | [`try_acquire`](WatermarkStore::try_acquire) | → `running` where status ≠ `running`, returns the fence |
/// | [`release`](WatermarkStore::release) | fenced: → `idle` |
///
/// A fenced transition applies only where status = `running` and
/// `last_attempt_at` = `fence`, and returns whether it applied.
/// | [`release_stale`](WatermarkStore::release_stale) | `running` older than cutoff → `failed` |
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Get or create the row for `category`.
    async fn ensure(&self, category: Category) -> Result<SyncState>;

    /// Read the row for `category`, if it exists. May be stale.
    async fn get(&self, category: Category) -> Result<Option<SyncState>>;

    /// All rows, ordered by category name.
    async fn list(&self) -> Result<Vec<SyncState>>;

    /// Record a completed run: new watermark, record count, completion time.
    async fn set_watermark(
        &self,
        category: Category,
        fence: i64,
        watermark: i64,
        records: u64,
        now: i64,
    ) -> Result<bool>;

    /// Rewind the watermark to `0` (and the record count) without touching
    /// the status. Used by full resync while the caller holds the lock.
    async fn reset_watermark(&self, category: Category, fence: i64) -> Result<bool>;

    /// Record a failed run with a diagnostic message.
    async fn mark_failed(&self, category: Category, fence: i64, message: &str) -> Result<bool>;

    /// Atomically move the row to `running` unless it already is.
    ///
    /// Stamps `last_attempt_at` with `now`, bumped past the previous stamp
    /// when needed so no two acquires of a row share a value. Returns that
    /// stamp (the fence for the holder's later writes), or `None` when the
    /// lock was not acquired.
    async fn try_acquire(&self, category: Category, now: i64) -> Result<Option<i64>>;

    /// Move the row from `running` back to `idle`. Returns `false` when the
    /// row was not running under `fence` (already released, completed,
    /// failed, or reclaimed by another holder).
    async fn release(&self, category: Category, fence: i64) -> Result<bool>;

    /// Whether `category` is `running` with `last_attempt_at < cutoff`.
    async fn has_stale_lock(&self, category: Category, cutoff: i64) -> Result<bool>;

    /// Fail every `running` row with `last_attempt_at < cutoff`.
    ///
    /// Returns the number of rows released.
    async fn release_stale(&self, cutoff: i64, message: &str) -> Result<u64>;

    /// Whether any row is currently `running`. Advisory only.
    async fn is_any_running(&self) -> Result<bool>;
}

/// The artifact index (chunks + embeddings) keyed by source record.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Delete every artifact derived from one source record.
    ///
    /// Returns the number of artifacts removed.
    async fn delete_by_source_record(&self, category: Category, source_id: &str) -> Result<u64>;

    /// Insert a batch of embedded chunks.
    async fn store_batch(&self, chunks: &[EmbeddedChunk]) -> Result<()>;

    /// Delete every artifact of a category. Returns the number removed.
    async fn delete_by_category(&self, category: Category) -> Result<u64>;

    /// Distinct source ids currently indexed for a category.
    async fn source_ids(&self, category: Category) -> Result<HashSet<String>>;

    /// Artifact counts per category.
    async fn count_by_category(&self) -> Result<BTreeMap<Category, u64>>;
}
