// =============================================================================
// SYNC JOB MODULE
// =============================================================================
// Everything around a reconciliation run that isn't the reconciliation itself:
//   1. check credentials   (ConfigMissing, before any network call)
//   2. take the job lock   (AlreadyRunning if another run holds it)
//   3. run the reconciler, renewing the lock every third of its TTL
//   4. release the lock, whatever the outcome
//
// Both the HTTP trigger and the in-process scheduler go through here.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::{Config, SyncSettings, FACILZAP_TOKEN_VAR};
use crate::db::CatalogStore;
use crate::error::SyncError;
use crate::lock::{JobLock, LockToken};
use crate::models::{SyncMode, SyncOutcome};
use crate::reconciler::CatalogReconciler;
use crate::source::{CatalogSource, FacilZapClient};

pub struct SyncJob {
    settings: SyncSettings,
    /// `None` while no catalog token is configured
    source: Option<Arc<dyn CatalogSource>>,
    store: Arc<dyn CatalogStore>,
    lock: Arc<dyn JobLock>,
}

impl SyncJob {
    pub fn new(
        settings: SyncSettings,
        source: Option<Arc<dyn CatalogSource>>,
        store: Arc<dyn CatalogStore>,
        lock: Arc<dyn JobLock>,
    ) -> Self {
        Self {
            settings,
            source,
            store,
            lock,
        }
    }

    /// Wire the FacilZap client from configuration.
    ///
    /// A missing token is not an error here: the service starts, and every
    /// run fails with `ConfigMissing` until the token is set.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn CatalogStore>,
        lock: Arc<dyn JobLock>,
    ) -> Result<Self, SyncError> {
        let source: Option<Arc<dyn CatalogSource>> = match FacilZapClient::from_config(config) {
            Ok(client) => Some(Arc::new(client)),
            Err(SyncError::ConfigMissing(_)) => None,
            Err(err) => return Err(err),
        };
        Ok(Self::new(config.sync.clone(), source, store, lock))
    }

    /// Page size used when the caller doesn't pick one
    pub fn default_page_size(&self) -> u32 {
        self.settings.page_size
    }

    pub async fn run(&self, mode: SyncMode) -> Result<SyncOutcome, SyncError> {
        let source = self
            .source
            .clone()
            .ok_or(SyncError::ConfigMissing(FACILZAP_TOKEN_VAR))?;

        let token = self
            .lock
            .try_acquire()
            .await?
            .ok_or(SyncError::AlreadyRunning)?;

        let heartbeat = spawn_heartbeat(self.lock.clone(), token.clone(), self.settings.lock_ttl);

        let reconciler = CatalogReconciler::new(source, self.store.clone(), &self.settings);
        let result = reconciler.synchronize(mode).await;

        heartbeat.abort();
        // The TTL frees the lock eventually if this fails
        if let Err(err) = self.lock.release(token).await {
            warn!(error = %err, "Failed to release sync lock");
        }

        result
    }
}

/// Keep the lock alive for as long as the run takes.
fn spawn_heartbeat(lock: Arc<dyn JobLock>, token: LockToken, ttl: Duration) -> JoinHandle<()> {
    let period = (ttl / 3).max(Duration::from_secs(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            match lock.extend(&token).await {
                Ok(true) => debug!("Sync lock extended"),
                Ok(false) => {
                    error!("Sync lock lost while the run was still in progress");
                    break;
                }
                // Transient Redis trouble: the next tick tries again
                Err(err) => warn!(error = %err, "Failed to extend sync lock"),
            }
        }
    })
}
