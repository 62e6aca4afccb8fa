//! Periodic janitor for caches and the task queue

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::services::cache::CacheRegistry;
use crate::services::task_queue::TaskQueueManager;

/// What one maintenance pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired_cache_entries: usize,
    pub stuck_tasks: usize,
    pub old_tasks: usize,
    pub worker_restarted: bool,
}

/// Run every maintenance step once
pub fn run_once(
    caches: &CacheRegistry,
    queue: &TaskQueueManager,
    completed_max_age_hours: u64,
) -> MaintenanceReport {
    let report = MaintenanceReport {
        expired_cache_entries: caches.cleanup_expired(),
        stuck_tasks: queue.force_cleanup_stuck(),
        worker_restarted: queue.restart_worker_if_needed(),
        old_tasks: queue.cleanup_old(completed_max_age_hours),
    };

    if report.worker_restarted || report.stuck_tasks > 0 {
        warn!(
            stuck_tasks = report.stuck_tasks,
            worker_restarted = report.worker_restarted,
            "Maintenance repaired the task queue"
        );
    }
    debug!(
        expired_cache_entries = report.expired_cache_entries,
        old_tasks = report.old_tasks,
        "Maintenance pass finished"
    );
    report
}

/// Spawn the janitor; it runs every `interval` until `shutdown` fires
pub fn spawn(
    caches: Arc<CacheRegistry>,
    queue: TaskQueueManager,
    interval: Duration,
    completed_max_age_hours: u64,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        info!(interval_secs = interval.as_secs_f64(), "Maintenance loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    run_once(&caches, &queue, completed_max_age_hours);
                }
            }
        }
        info!("Maintenance loop stopped");
    })
}
