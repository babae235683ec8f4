// =============================================================================
// TEST DOUBLES
// =============================================================================
// In-memory stand-ins for the remote catalog, the datastore and the job lock.
//
// InMemoryStore mirrors the SQL semantics of Database: the upsert only
// refreshes mirror fields on conflict, and a failed cascade leaves every row
// in place, as a rolled-back transaction would.
// =============================================================================

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use uuid::Uuid;

use crate::db::CatalogStore;
use crate::error::{CatalogSourceError, StoreError, SyncError};
use crate::lock::{JobLock, LockToken};
use crate::models::{
    ApprovalState, CatalogEntry, CatalogMirror, ExcludedProduct, RemotePage, RemoteProduct,
    RemoteVariant, StoredProduct, SyncLogEntry,
};
use crate::source::CatalogSource;

// =============================================================================
// SCRIPTED SOURCE
// =============================================================================

pub struct ScriptedSource {
    pages: Vec<Vec<RemoteProduct>>,
    delay: Option<Duration>,
    max_pages: u32,
    advertise_page_count: bool,
    requested: Mutex<Vec<u32>>,
}

impl ScriptedSource {
    pub fn with_pages(pages: Vec<Vec<RemoteProduct>>) -> Self {
        Self {
            pages,
            delay: None,
            max_pages: u32::MAX,
            advertise_page_count: true,
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Everything on one page
    pub fn single(products: Vec<RemoteProduct>) -> Self {
        Self::with_pages(vec![products])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Serve pages without `total_pages`, like listings that omit it
    pub fn without_page_count(mut self) -> Self {
        self.advertise_page_count = false;
        self
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested.lock().unwrap().clone()
    }

    pub fn product(external_id: &str) -> RemoteProduct {
        RemoteProduct {
            external_id: external_id.to_string(),
            name: format!("Produto {external_id}"),
            base_price: Decimal::from_str("49.90").unwrap(),
            variants: vec![],
            images: vec![format!("https://cdn.example/{external_id}.jpg")],
            barcode: None,
            stock: Some(10),
        }
    }

    pub fn product_with_variants(external_id: &str, stocks: &[i32]) -> RemoteProduct {
        RemoteProduct {
            variants: stocks
                .iter()
                .map(|stock| RemoteVariant {
                    color: Some("Preto".to_string()),
                    size: Some("M".to_string()),
                    stock: *stock,
                    price: None,
                })
                .collect(),
            ..Self::product(external_id)
        }
    }
}

#[async_trait]
impl CatalogSource for ScriptedSource {
    async fn fetch_page(
        &self,
        page: u32,
        _page_size: u32,
    ) -> Result<RemotePage, CatalogSourceError> {
        self.requested.lock().unwrap().push(page);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let products = page
            .checked_sub(1)
            .and_then(|index| self.pages.get(index as usize))
            .cloned()
            .unwrap_or_default();

        Ok(RemotePage {
            products,
            total_pages: self
                .advertise_page_count
                .then(|| self.pages.len() as u32),
            skipped: 0,
        })
    }

    fn max_pages(&self) -> u32 {
        self.max_pages
    }
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

#[derive(Default)]
struct State {
    products: BTreeMap<Uuid, StoredProduct>,
    excluded: BTreeMap<String, ExcludedProduct>,
    /// (table, product_id)
    links: Vec<(&'static str, Uuid)>,
    logs: Vec<SyncLogEntry>,
    upsert_calls: usize,
    fail_upsert_call: Option<usize>,
    fail_delete: HashSet<Uuid>,
    fail_log: bool,
    /// Mutations in the order they happened, e.g. "exclude:Y", "delete:Y"
    events: Vec<String>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog product as if imported by an earlier sync
    pub fn stored(external_id: &str) -> StoredProduct {
        let now = Utc::now();
        let mirror = CatalogMirror::from_remote(&ScriptedSource::product(external_id));
        let approval = ApprovalState::pending();
        StoredProduct {
            id: Uuid::new_v4(),
            external_id: Some(mirror.external_id),
            name: mirror.name,
            base_price: mirror.base_price,
            stock: mirror.stock,
            images: Json(mirror.images),
            barcode: mirror.barcode,
            variants: Json(mirror.variants),
            active: approval.active,
            admin_approved: approval.admin_approved,
            admin_rejected: approval.admin_rejected,
            is_new_product: false,
            last_synced_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn seed(&self, product: StoredProduct) -> Uuid {
        let id = product.id;
        self.state.lock().unwrap().products.insert(id, product);
        id
    }

    pub fn seed_link(&self, table: &'static str, product_id: Uuid) {
        self.state.lock().unwrap().links.push((table, product_id));
    }

    pub fn exclude(&self, external_id: &str, by: &str) {
        self.state.lock().unwrap().excluded.insert(
            external_id.to_string(),
            ExcludedProduct {
                external_id: external_id.to_string(),
                excluded_at: Utc::now(),
                excluded_by: by.to_string(),
            },
        );
    }

    /// Make the n-th upsert call (1-indexed) fail
    pub fn fail_upsert_on_call(&self, call: usize) {
        self.state.lock().unwrap().fail_upsert_call = Some(call);
    }

    pub fn fail_delete_of(&self, id: Uuid) {
        self.state.lock().unwrap().fail_delete.insert(id);
    }

    pub fn fail_sync_log(&self) {
        self.state.lock().unwrap().fail_log = true;
    }

    pub fn product(&self, external_id: &str) -> Option<StoredProduct> {
        self.state
            .lock()
            .unwrap()
            .products
            .values()
            .find(|p| p.external_id.as_deref() == Some(external_id))
            .cloned()
    }

    pub fn product_count(&self) -> usize {
        self.state.lock().unwrap().products.len()
    }

    pub fn exclusion(&self, external_id: &str) -> Option<ExcludedProduct> {
        self.state.lock().unwrap().excluded.get(external_id).cloned()
    }

    pub fn links_of(&self, product_id: Uuid) -> usize {
        self.state
            .lock()
            .unwrap()
            .links
            .iter()
            .filter(|(_, id)| *id == product_id)
            .count()
    }

    pub fn upsert_calls(&self) -> usize {
        self.state.lock().unwrap().upsert_calls
    }

    pub fn logs(&self) -> Vec<SyncLogEntry> {
        self.state.lock().unwrap().logs.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn excluded_ids(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.state.lock().unwrap().excluded.keys().cloned().collect())
    }

    async fn find_by_external_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<StoredProduct>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .products
            .values()
            .filter(|p| p.external_id.as_ref().is_some_and(|id| ids.contains(id)))
            .cloned()
            .collect())
    }

    async fn upsert_batch(
        &self,
        rows: &[CatalogMirror],
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.upsert_calls += 1;
        if state.fail_upsert_call == Some(state.upsert_calls) {
            return Err(StoreError::Rejected("upsert refused".to_string()));
        }

        for mirror in rows {
            let existing = state
                .products
                .values()
                .find(|p| p.external_id.as_deref() == Some(mirror.external_id.as_str()))
                .map(|p| p.id);

            match existing.and_then(|id| state.products.get_mut(&id)) {
                Some(product) => {
                    product.name = mirror.name.clone();
                    product.base_price = mirror.base_price;
                    product.stock = mirror.stock;
                    product.images = Json(mirror.images.clone());
                    product.barcode = mirror.barcode.clone();
                    product.variants = Json(mirror.variants.clone());
                    product.is_new_product = false;
                    product.last_synced_at = Some(synced_at);
                    product.updated_at = synced_at;
                }
                None => {
                    let pending = ApprovalState::pending();
                    let product = StoredProduct {
                        id: Uuid::new_v4(),
                        external_id: Some(mirror.external_id.clone()),
                        name: mirror.name.clone(),
                        base_price: mirror.base_price,
                        stock: mirror.stock,
                        images: Json(mirror.images.clone()),
                        barcode: mirror.barcode.clone(),
                        variants: Json(mirror.variants.clone()),
                        active: pending.active,
                        admin_approved: pending.admin_approved,
                        admin_rejected: pending.admin_rejected,
                        is_new_product: true,
                        last_synced_at: Some(synced_at),
                        created_at: synced_at,
                        updated_at: synced_at,
                    };
                    state.products.insert(product.id, product);
                }
            }
        }
        Ok(())
    }

    async fn catalog_entries(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .products
            .values()
            .filter_map(|p| {
                p.external_id.clone().map(|external_id| CatalogEntry {
                    id: p.id,
                    external_id,
                })
            })
            .collect())
    }

    async fn record_exclusion(&self, record: &ExcludedProduct) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("exclude:{}", record.external_id));
        state
            .excluded
            .entry(record.external_id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn delete_product_cascade(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_delete.contains(&id) {
            return Err(StoreError::Rejected("delete refused".to_string()));
        }
        let external_id = state
            .products
            .get(&id)
            .and_then(|p| p.external_id.clone())
            .unwrap_or_default();
        state.links.retain(|(_, product_id)| *product_id != id);
        state.products.remove(&id);
        state.events.push(format!("delete:{external_id}"));
        Ok(())
    }

    async fn deactivate_product(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(product) = state.products.get_mut(&id) {
            product.active = false;
        }
        Ok(())
    }

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_log {
            return Err(StoreError::Rejected("log table unavailable".to_string()));
        }
        state.logs.push(entry.clone());
        Ok(())
    }
}

// =============================================================================
// COUNTING LOCK
// =============================================================================

/// A lock that is either always free or always held elsewhere
pub struct CountingLock {
    busy: bool,
    attempts: AtomicUsize,
    extensions: AtomicUsize,
    releases: AtomicUsize,
}

impl CountingLock {
    pub fn free() -> Self {
        Self {
            busy: false,
            attempts: AtomicUsize::new(0),
            extensions: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    pub fn busy() -> Self {
        Self {
            busy: true,
            ..Self::free()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn extensions(&self) -> usize {
        self.extensions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobLock for CountingLock {
    async fn try_acquire(&self) -> Result<Option<LockToken>, SyncError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok((!self.busy).then(LockToken::generate))
    }

    async fn extend(&self, _token: &LockToken) -> Result<bool, SyncError> {
        self.extensions.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn release(&self, _token: LockToken) -> Result<(), SyncError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
