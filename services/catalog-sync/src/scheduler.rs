// =============================================================================
// SCHEDULER MODULE
// =============================================================================
// Optional in-process trigger for full syncs, for deployments without an
// external cron hitting GET /sync. It goes through SyncJob like any other
// caller, so it can never overlap with an HTTP-triggered run.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::error::SyncError;
use crate::job::SyncJob;
use crate::models::{SyncMode, SyncOutcome};

/// Spawn the periodic full sync. The first run happens one `every` after
/// start-up, not immediately.
pub fn spawn(job: Arc<SyncJob>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        // A run longer than the interval pushes the next one back
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = every.as_secs(), "Catalog sync scheduler started");

        loop {
            ticker.tick().await;
            let mode = SyncMode::Full {
                page_size: job.default_page_size(),
            };

            match job.run(mode).await {
                Ok(SyncOutcome::Completed(report)) => {
                    info!(processed = report.processed, "Scheduled catalog sync finished");
                }
                Ok(SyncOutcome::Empty { warning, .. }) => {
                    info!(warning = %warning, "Scheduled catalog sync found nothing to do");
                }
                Err(SyncError::AlreadyRunning) => {
                    info!("Scheduled catalog sync skipped, another run is in progress");
                }
                Err(err) => {
                    error!(error = %err, "Scheduled catalog sync failed");
                }
            }
        }
    })
}
