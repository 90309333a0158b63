//! Per-category mutual exclusion on top of the [`WatermarkStore`].
//!
//! There is no separate lock service: the category's `sync_state` row is the
//! lock. Acquiring is one conditional transition to `running`; a row stuck in
//! `running` longer than the timeout belonged to a crashed holder and is
//! failed by [`LockManager::release_stale`], which runs before every acquire.
//!
//! ```text
//!   idle/completed/failed ──try_acquire──▶ running ──release──▶ idle
//!                                            │
//!                           older than timeout (crash)
//!                                            ▼
//!                                  release_stale → failed
//! ```
//!
//! A successful acquire hands back a [`LockToken`] carrying the row's new
//! `last_attempt_at`. Every later write by that holder is fenced on it, so a
//! holder that stalled past the timeout and lost its lock cannot overwrite
//! the state left by whoever reclaimed it.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::models::Category;
use crate::store::WatermarkStore;

/// Default age after which a `running` row is considered abandoned.
pub const DEFAULT_LOCK_TIMEOUT_MINUTES: i64 = 60;

/// Diagnostic written to rows failed by stale-lock recovery.
pub const STALE_LOCK_MESSAGE: &str = "Lock timeout - sync process may have crashed";

/// Proof of holding a category's lock; the fence for the holder's writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken {
    category: Category,
    acquired_at: i64,
}

impl LockToken {
    pub fn category(&self) -> Category {
        self.category
    }

    /// The `last_attempt_at` stamped by the acquire.
    pub fn fence(&self) -> i64 {
        self.acquired_at
    }
}

/// Acquires, releases, and repairs per-category sync locks.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn WatermarkStore>,
    clock: Arc<dyn Clock>,
    timeout_minutes: i64,
}

impl LockManager {
    /// `timeout_minutes` must exceed the slowest legitimate run, or a live
    /// lock will be reclaimed.
    pub fn new(store: Arc<dyn WatermarkStore>, clock: Arc<dyn Clock>, timeout_minutes: i64) -> Self {
        Self {
            store,
            clock,
            timeout_minutes,
        }
    }

    pub fn timeout_minutes(&self) -> i64 {
        self.timeout_minutes
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    fn cutoff(&self) -> i64 {
        self.clock.now() - self.timeout_minutes * 60
    }

    /// Take the lock for `category`, creating its state row on first use.
    ///
    /// Returns `None` when another run holds it.
    pub async fn try_acquire(&self, category: Category) -> Result<Option<LockToken>> {
        self.store.ensure(category).await?;
        let fence = self.store.try_acquire(category, self.clock.now()).await?;
        Ok(fence.map(|acquired_at| LockToken {
            category,
            acquired_at,
        }))
    }

    /// Give the lock back. A no-op when the run already moved the row to
    /// `completed` or `failed`, or the lock was reclaimed.
    pub async fn release(&self, token: LockToken) -> Result<bool> {
        self.store.release(token.category, token.acquired_at).await
    }

    /// Whether `category` is held by a run older than the timeout.
    pub async fn detect_stale(&self, category: Category) -> Result<bool> {
        self.store.has_stale_lock(category, self.cutoff()).await
    }

    /// Fail every lock older than the timeout. Returns how many were freed.
    pub async fn release_stale(&self) -> Result<u64> {
        let released = self
            .store
            .release_stale(self.cutoff(), STALE_LOCK_MESSAGE)
            .await?;
        if released > 0 {
            warn!(
                released,
                timeout_minutes = self.timeout_minutes,
                "released stale sync locks"
            );
        }
        Ok(released)
    }

    /// Stale-lock recovery followed by an acquire attempt, as done before
    /// every run.
    ///
    /// Persistence errors count as "not acquired": the caller skips the run
    /// and the next scheduled invocation retries.
    pub async fn recover_and_acquire(&self, category: Category) -> Option<LockToken> {
        match self.detect_stale(category).await {
            Ok(true) => {
                warn!(
                    %category,
                    timeout_minutes = self.timeout_minutes,
                    "detected stale lock, releasing it"
                );
                if let Err(e) = self.release_stale().await {
                    error!(%category, error = %e, "stale lock release failed");
                }
            }
            Ok(false) => {}
            Err(e) => {
                error!(%category, error = %e, "stale lock check failed");
            }
        }

        match self.try_acquire(category).await {
            Ok(Some(token)) => {
                debug!(%category, fence = token.fence(), "lock acquired");
                Some(token)
            }
            Ok(None) => {
                warn!(%category, "failed to acquire sync lock, another sync may be running");
                None
            }
            Err(e) => {
                error!(%category, error = %e, "lock acquisition failed, skipping run");
                None
            }
        }
    }

    /// Release, logging instead of propagating persistence errors.
    pub async fn release_logged(&self, token: LockToken) {
        let category = token.category;
        match self.release(token).await {
            Ok(_) => debug!(%category, "released sync lock"),
            Err(e) => error!(%category, error = %e, "failed to release sync lock"),
        }
    }
}
