//! Sync orchestration for the CLI.
//!
//! Wires configuration into a [`SyncCoordinator`] (SQLite stores, REST
//! extractors, the configured embedder) and implements the `sync`,
//! `status`, `release-stale`, `reconcile`, and `reset` commands, which print
//! their summaries to stdout.

use std::sync::Arc;

use anyhow::{bail, Result};
use sqlx::SqlitePool;

use itsm_sync_core::chunk::ParagraphChunker;
use itsm_sync_core::clock::SystemClock;
use itsm_sync_core::coordinator::SyncCoordinator;
use itsm_sync_core::embedding::Embedder;
use itsm_sync_core::lock::LockManager;
use itsm_sync_core::models::{RunOutcome, SyncResult};
use itsm_sync_core::pipeline::CategoryPipeline;
use itsm_sync_core::source::Extractor;

use crate::config::Config;
use crate::connector_itsm::RestExtractor;
use crate::db;
use crate::embedding::create_embedder;
use crate::migrate;
use crate::sqlite_store::{SqliteIndexStore, SqliteWatermarkStore};

/// Coordinator over the configured categories with REST extractors and the
/// configured embedding provider.
pub fn build_coordinator(config: &Config, pool: SqlitePool) -> Result<SyncCoordinator> {
    let embedder = create_embedder(&config.embedding)?;
    let mut extractors: Vec<Arc<dyn Extractor>> = Vec::new();
    for category in config.sync.parsed_categories()? {
        extractors.push(Arc::new(RestExtractor::new(category, &config.source)?));
    }
    Ok(assemble_coordinator(config, pool, extractors, embedder))
}

/// Coordinator from explicit collaborators, sharing one SQLite pool for
/// state and artifacts.
pub fn assemble_coordinator(
    config: &Config,
    pool: SqlitePool,
    extractors: Vec<Arc<dyn Extractor>>,
    embedder: Arc<dyn Embedder>,
) -> SyncCoordinator {
    let state = Arc::new(SqliteWatermarkStore::new(pool.clone()));
    let index = Arc::new(SqliteIndexStore::new(pool));
    let locks = LockManager::new(
        state.clone(),
        Arc::new(SystemClock),
        config.sync.lock_timeout_minutes,
    );
    let chunker = Arc::new(ParagraphChunker::new(config.chunking.max_tokens));

    let mut coordinator = SyncCoordinator::new(state.clone(), index.clone(), locks.clone())
        .with_reconcile_batch_size(config.sync.reconcile_batch_size);
    for extractor in extractors {
        coordinator = coordinator.with_pipeline(
            CategoryPipeline::new(
                extractor,
                chunker.clone(),
                embedder.clone(),
                index.clone(),
                state.clone(),
                locks.clone(),
            )
            .with_embed_batch_size(config.sync.embed_batch_size),
        );
    }
    coordinator
}

async fn open(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(pool)
}

/// `sync <all|Category> [--full]`. Fails if any category failed; skipped
/// categories are reported but are not an error.
pub async fn run_sync(config: &Config, target: &str, full: bool) -> Result<()> {
    let pool = open(config).await?;
    let coordinator = build_coordinator(config, pool.clone())?;

    let results = if target.eq_ignore_ascii_case("all") {
        if full {
            let mut results = Vec::new();
            for category in coordinator.categories() {
                results.push(coordinator.force_full_sync(category.as_str()).await?);
            }
            results
        } else {
            coordinator.run_all().await.results
        }
    } else if full {
        vec![coordinator.force_full_sync(target).await?]
    } else {
        vec![coordinator.run_category(target).await?]
    };

    for result in &results {
        print_result(result);
    }
    pool.close().await;

    let failed = results
        .iter()
        .filter(|r| matches!(r.outcome, RunOutcome::Failed(_)))
        .count();
    if failed > 0 {
        bail!("{} of {} categories failed", failed, results.len());
    }
    println!("ok");
    Ok(())
}

fn print_result(result: &SyncResult) {
    println!("sync {}", result.category);
    println!("  records processed: {}", result.records_processed);
    println!("  artifacts created: {}", result.artifacts_created);
    match &result.outcome {
        RunOutcome::Completed => println!("  status: completed"),
        RunOutcome::Skipped(reason) => println!("  status: skipped ({})", reason),
        RunOutcome::Failed(message) => println!("  status: failed ({})", message),
    }
}

/// `status`: state rows and artifact counts.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    let coordinator = build_coordinator(config, pool.clone())?;

    let stats = coordinator.statistics().await?;
    println!("itsm-sync status: {}", stats.overall);
    println!();
    println!(
        "  {:<18} {:<10} {:>12} {:>8} {:>10}   {}",
        "CATEGORY", "STATUS", "WATERMARK", "RECORDS", "ARTIFACTS", "LAST COMPLETED"
    );
    println!("  {}", "-".repeat(84));
    for s in &stats.states {
        println!(
            "  {:<18} {:<10} {:>12} {:>8} {:>10}   {}",
            s.category.as_str(),
            s.status.as_str(),
            s.watermark,
            s.records_processed,
            stats.artifacts.get(&s.category).copied().unwrap_or(0),
            s.last_completed_at
                .map(format_ts_iso)
                .unwrap_or_else(|| "never".to_string())
        );
        if let Some(message) = &s.error_message {
            println!("    error: {}", message);
        }
    }
    println!();
    println!("  total artifacts: {}", stats.total_artifacts);

    pool.close().await;
    Ok(())
}

/// `release-stale`: stale-lock recovery now.
pub async fn run_release_stale(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    let state = Arc::new(SqliteWatermarkStore::new(pool.clone()));
    let locks = LockManager::new(state, Arc::new(SystemClock), config.sync.lock_timeout_minutes);
    let released = locks.release_stale().await?;
    println!("released stale locks: {}", released);
    pool.close().await;
    Ok(())
}

/// `reconcile`: hard-delete reconciliation across configured categories.
pub async fn run_reconcile(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    let coordinator = build_coordinator(config, pool.clone())?;
    let report = coordinator.reconcile_deletes().await;

    for r in &report.results {
        println!("reconcile {}", r.category);
        if r.skipped {
            println!("  skipped: sync in progress");
            continue;
        }
        println!("  checked: {}", r.checked);
        println!("  removed: {}", r.removed);
        if let Some(message) = &r.error_message {
            println!("  error: {}", message);
        }
    }
    println!("total removed: {}", report.removed());
    pool.close().await;
    Ok(())
}

/// `reset <Category>`: delete the category's artifacts and zero its watermark.
pub async fn run_reset(config: &Config, category: &str) -> Result<()> {
    let pool = open(config).await?;
    let coordinator = build_coordinator(config, pool.clone())?;
    let outcome = coordinator.reset_category(category).await;
    pool.close().await;

    match outcome? {
        Some(deleted) => {
            println!("reset {}", category);
            println!("  artifacts deleted: {}", deleted);
            println!("ok");
            Ok(())
        }
        None => bail!("Sync already in progress for {}; try again later", category),
    }
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ts_iso() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_ts_iso(1_700_000_000), "2023-11-14T22:13:20Z");
    }
}
