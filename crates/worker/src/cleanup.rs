//! Periodic retention sweep of finished jobs.
//!
//! Spawns nothing itself: [`run`] is the loop body, intended for
//! `tokio::spawn`, and exits when its [`CancellationToken`] fires.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::orchestrator::JobOrchestrator;

/// Shortest accepted sweep interval; `tokio::time::interval` panics on zero.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Run [`JobOrchestrator::cleanup`] every `interval` until `cancel` fires.
///
/// The first sweep runs immediately. Failures are logged and the loop
/// carries on with the next tick. Intervals below one second are raised
/// to one second.
pub async fn run(
    orchestrator: Arc<JobOrchestrator>,
    retention_days: u32,
    interval: Duration,
    cancel: CancellationToken,
) {
    let interval = interval.max(MIN_INTERVAL);
    tracing::info!(
        retention_days,
        interval_secs = interval.as_secs(),
        "Job retention cleaner started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job retention cleaner stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = orchestrator.cleanup(retention_days).await {
                    tracing::error!(error = %e, "Job retention cleanup failed");
                }
            }
        }
    }
}
