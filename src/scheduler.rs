//! Periodic driver for `run_all` and hard-delete reconciliation.
//!
//! A single task owns both intervals, so a scheduled sync and a scheduled
//! reconciliation never overlap within one process. Overlap with manual
//! triggers or other processes is handled by the category locks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use itsm_sync_core::coordinator::SyncCoordinator;

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub sync_every: Duration,
    pub reconcile_every: Duration,
}

/// Run until `shutdown` resolves. The first sync starts immediately; the
/// first reconciliation waits one full reconcile interval.
pub async fn run_scheduler<F>(coordinator: Arc<SyncCoordinator>, schedule: Schedule, shutdown: F)
where
    F: Future<Output = ()>,
{
    let mut sync_tick = interval(schedule.sync_every);
    sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reconcile_tick = interval_at(
        Instant::now() + schedule.reconcile_every,
        schedule.reconcile_every,
    );
    reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        sync_every_secs = schedule.sync_every.as_secs(),
        reconcile_every_secs = schedule.reconcile_every.as_secs(),
        "scheduler started"
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("scheduler stopping");
                break;
            }
            _ = sync_tick.tick() => {
                let report = coordinator.run_all().await;
                if report.failed() > 0 {
                    warn!(failed = report.failed(), "scheduled sync finished with failures");
                }
            }
            _ = reconcile_tick.tick() => {
                coordinator.reconcile_deletes().await;
            }
        }
    }
}
