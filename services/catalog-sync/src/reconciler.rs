// =============================================================================
// RECONCILER MODULE
// =============================================================================
// Makes the local `products` table match a remote catalog snapshot.
//
// PHASES (strictly sequential):
//   1. fetch            one page, or every page under a timeout
//   2. exclude          drop denylisted ids before any diffing
//   3. diff + upsert    fixed-size batches, one upsert call each
//   4. orphans          full runs only: exclude, then cascade-delete
//   5. report
//
// Each batch is its own commit boundary. If batch N fails, batches 0..N stay
// applied and the run stops with SyncError::Persistence.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncSettings;
use crate::db::CatalogStore;
use crate::error::{StoreError, SyncError};
use crate::metrics;
use crate::models::{
    CatalogMirror, ExcludedProduct, FieldChange, RemoteProduct, SyncLogEntry, SyncMode,
    SyncOutcome, SyncReport, EXCLUDED_BY_SYNC,
};
use crate::source::CatalogSource;

/// Warning returned when the remote answers with nothing
pub const EMPTY_CATALOG_WARNING: &str =
    "Remote catalog returned no products; local catalog left untouched";

pub struct CatalogReconciler {
    source: Arc<dyn CatalogSource>,
    store: Arc<dyn CatalogStore>,
    batch_size: usize,
    fetch_timeout: Duration,
}

/// Result of filtering the fetched set against the denylist
struct Candidates {
    products: Vec<RemoteProduct>,
    /// Every id the remote served, excluded or not
    remote_ids: HashSet<String>,
    skipped_excluded: usize,
}

#[derive(Default)]
struct BatchTally {
    new: usize,
    updated: usize,
    unchanged: usize,
    changes: Vec<FieldChange>,
}

#[derive(Default)]
struct OrphanTally {
    deleted: usize,
    deactivated: usize,
}

impl CatalogReconciler {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        store: Arc<dyn CatalogStore>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            source,
            store,
            batch_size: settings.batch_size.max(1),
            fetch_timeout: settings.fetch_timeout,
        }
    }

    /// Run one reconciliation.
    pub async fn synchronize(&self, mode: SyncMode) -> Result<SyncOutcome, SyncError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();

        info!(run_id = %run_id, mode = mode.label(), "Catalog sync started");
        let result = self.run(run_id, mode).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(SyncOutcome::Completed(report)) => {
                metrics::record_sync_run(mode.label(), "completed", elapsed);
                metrics::record_sync_report(report);
                info!(
                    run_id = %run_id,
                    processed = report.processed,
                    new = report.new,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    deleted = report.deleted,
                    deactivated = report.deactivated,
                    skipped_excluded = report.skipped_excluded,
                    elapsed_secs = elapsed,
                    "Catalog sync completed"
                );
            }
            Ok(SyncOutcome::Empty { .. }) => {
                metrics::record_sync_run(mode.label(), "empty", elapsed);
            }
            Err(err) => {
                metrics::record_sync_run(mode.label(), err.code(), elapsed);
                error!(run_id = %run_id, error = %err, "Catalog sync failed");
            }
        }

        result
    }

    async fn run(&self, run_id: Uuid, mode: SyncMode) -> Result<SyncOutcome, SyncError> {
        // ---------------------------------------------------------------------
        // 1. FETCH
        // ---------------------------------------------------------------------
        let fetched = self.fetch(mode).await?;
        if fetched.is_empty() {
            warn!(run_id = %run_id, mode = mode.label(), "{EMPTY_CATALOG_WARNING}");
            return Ok(SyncOutcome::Empty {
                warning: EMPTY_CATALOG_WARNING.to_string(),
                timestamp: Utc::now(),
            });
        }

        // ---------------------------------------------------------------------
        // 2. EXCLUDE
        // ---------------------------------------------------------------------
        let excluded = self.store.excluded_ids().await?;
        let candidates = select_candidates(fetched, &excluded);

        let timestamp = Utc::now();
        let mut report = SyncReport {
            processed: 0,
            new: 0,
            updated: 0,
            unchanged: 0,
            deleted: 0,
            deactivated: 0,
            skipped_excluded: candidates.skipped_excluded,
            timestamp,
        };

        // ---------------------------------------------------------------------
        // 3. DIFF + UPSERT, one batch at a time
        // ---------------------------------------------------------------------
        for (index, batch) in candidates.products.chunks(self.batch_size).enumerate() {
            let tally = self.apply_batch(run_id, mode, index, batch, timestamp).await?;
            report.processed += batch.len();
            report.new += tally.new;
            report.updated += tally.updated;
            report.unchanged += tally.unchanged;
        }

        // ---------------------------------------------------------------------
        // 4. ORPHANS (a partial fetch is never authoritative for deletion)
        // ---------------------------------------------------------------------
        if mode.is_full() {
            let orphans = self
                .remove_orphans(&candidates.remote_ids, &excluded)
                .await?;
            report.deleted = orphans.deleted;
            report.deactivated = orphans.deactivated;
        } else {
            debug!(run_id = %run_id, "Single-page sync, orphan detection skipped");
        }

        Ok(SyncOutcome::Completed(report))
    }

    async fn fetch(&self, mode: SyncMode) -> Result<Vec<RemoteProduct>, SyncError> {
        match mode {
            SyncMode::Full { page_size } => {
                let products = tokio::time::timeout(
                    self.fetch_timeout,
                    self.source.fetch_all(page_size),
                )
                .await
                .map_err(|_| SyncError::FetchTimeout(self.fetch_timeout))??;
                Ok(products)
            }
            SyncMode::SinglePage { page, page_size } => {
                let page = self.source.fetch_page(page, page_size).await?;
                Ok(page.products)
            }
        }
    }

    async fn apply_batch(
        &self,
        run_id: Uuid,
        mode: SyncMode,
        index: usize,
        batch: &[RemoteProduct],
        synced_at: DateTime<Utc>,
    ) -> Result<BatchTally, SyncError> {
        let started = Instant::now();
        let mirrors: Vec<CatalogMirror> = batch.iter().map(CatalogMirror::from_remote).collect();
        let ids: Vec<String> = mirrors.iter().map(|m| m.external_id.clone()).collect();

        let existing: HashMap<String, CatalogMirror> = self
            .store
            .find_by_external_ids(&ids)
            .await?
            .iter()
            .filter_map(|product| product.mirror())
            .map(|mirror| (mirror.external_id.clone(), mirror))
            .collect();

        let mut tally = BatchTally::default();
        for mirror in &mirrors {
            match existing.get(&mirror.external_id) {
                None => tally.new += 1,
                Some(stored) => {
                    let changes = mirror.changes_from(stored);
                    if changes.is_empty() {
                        tally.unchanged += 1;
                    } else {
                        tally.updated += 1;
                        tally.changes.extend(changes);
                    }
                }
            }
        }

        // Every record is written: refreshes last_synced_at and clears
        // is_new_product even when nothing else changed
        self.store.upsert_batch(&mirrors, synced_at).await?;

        metrics::record_sync_batch(started.elapsed().as_secs_f64());
        info!(
            run_id = %run_id,
            batch = index,
            size = mirrors.len(),
            new = tally.new,
            updated = tally.updated,
            unchanged = tally.unchanged,
            "Catalog batch upserted"
        );

        let entry = SyncLogEntry {
            run_id,
            mode: mode.label(),
            batch_index: index,
            new: tally.new,
            updated: tally.updated,
            unchanged: tally.unchanged,
            changes: std::mem::take(&mut tally.changes),
            created_at: Utc::now(),
        };
        // Fire-and-forget: a missing log row never fails the run
        if let Err(err) = self.store.append_sync_log(&entry).await {
            warn!(run_id = %run_id, batch = index, error = %err, "Failed to append sync log");
        }

        Ok(tally)
    }

    async fn remove_orphans(
        &self,
        remote_ids: &HashSet<String>,
        excluded: &HashSet<String>,
    ) -> Result<OrphanTally, SyncError> {
        let orphans: Vec<_> = self
            .store
            .catalog_entries()
            .await?
            .into_iter()
            .filter(|entry| {
                !remote_ids.contains(&entry.external_id) && !excluded.contains(&entry.external_id)
            })
            .collect();

        let mut tally = OrphanTally::default();
        if orphans.is_empty() {
            return Ok(tally);
        }
        info!(count = orphans.len(), "Removing products absent from the remote catalog");

        for orphan in orphans {
            // Excluded first: if we crash before the delete lands, the next
            // run sees an excluded id, not a brand-new product
            let record = ExcludedProduct {
                external_id: orphan.external_id.clone(),
                excluded_at: Utc::now(),
                excluded_by: EXCLUDED_BY_SYNC.to_string(),
            };
            if let Err(err) = self.store.record_exclusion(&record).await {
                error!(
                    external_id = %orphan.external_id,
                    error = %err,
                    "Could not record exclusion, leaving orphan in place"
                );
                continue;
            }

            match remove_product(self.store.as_ref(), orphan.id, &orphan.external_id).await {
                Ok(Removal::Deleted) => tally.deleted += 1,
                Ok(Removal::Deactivated) => tally.deactivated += 1,
                Err(err) => error!(
                    external_id = %orphan.external_id,
                    error = %err,
                    "Orphan deactivation failed"
                ),
            }
        }

        Ok(tally)
    }
}

/// How a product left the storefront
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Deleted,
    /// The cascade failed and was rolled back; the row stays, inactive
    Deactivated,
}

/// Cascade-delete a product, deactivating it when the delete fails.
///
/// Callers record the exclusion first, so a product that ends up only
/// deactivated is still kept out of later syncs.
pub async fn remove_product(
    store: &dyn CatalogStore,
    id: Uuid,
    external_id: &str,
) -> Result<Removal, StoreError> {
    match store.delete_product_cascade(id).await {
        Ok(()) => {
            debug!(external_id = %external_id, "Product deleted");
            Ok(Removal::Deleted)
        }
        Err(err) => {
            warn!(
                external_id = %external_id,
                error = %err,
                "Product delete failed, deactivating instead"
            );
            store.deactivate_product(id).await?;
            Ok(Removal::Deactivated)
        }
    }
}

/// Admin delete: denylist the external id, then remove the local product
/// carrying it, if there is one.
pub async fn exclude_product(
    store: &dyn CatalogStore,
    record: &ExcludedProduct,
) -> Result<Option<Removal>, StoreError> {
    store.record_exclusion(record).await?;

    let local = store
        .find_by_external_ids(std::slice::from_ref(&record.external_id))
        .await?;
    let mut removal = None;
    for product in local {
        removal = Some(remove_product(store, product.id, &record.external_id).await?);
    }
    Ok(removal)
}

/// Drop excluded ids and duplicates, keeping remote order.
fn select_candidates(fetched: Vec<RemoteProduct>, excluded: &HashSet<String>) -> Candidates {
    let mut remote_ids = HashSet::with_capacity(fetched.len());
    let mut products = Vec::with_capacity(fetched.len());
    let mut skipped_excluded = 0;

    for product in fetched {
        if !remote_ids.insert(product.external_id.clone()) {
            warn!(
                external_id = %product.external_id,
                "Duplicate product in remote catalog, keeping first"
            );
            continue;
        }
        if excluded.contains(&product.external_id) {
            skipped_excluded += 1;
            continue;
        }
        products.push(product);
    }

    Candidates {
        products,
        remote_ids,
        skipped_excluded,
    }
}
