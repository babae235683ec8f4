// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures used throughout the service.
//
// THREE FAMILIES:
// - Remote side:  RemoteProduct / RemoteVariant, the canonical shape the
//                 catalog adapter produces (aliases are resolved in dto.rs)
// - Local side:   StoredProduct (a `products` row) split into CatalogMirror
//                 (owned by the reconciler) and ApprovalState (owned by the
//                 admin approval endpoints)
// - Run results:  SyncMode, SyncReport, SyncOutcome and the HTTP DTOs
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{types::Json, FromRow};
use uuid::Uuid;

/// Scale of the `products.base_price` column (NUMERIC(12,2)).
/// Prices are rounded to it before comparison so a re-sync of unchanged data
/// never reports a spurious price change.
pub const PRICE_SCALE: u32 = 2;

// =============================================================================
// REMOTE CATALOG
// =============================================================================

/// One purchasable variant of a remote product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVariant {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Never negative; the adapter clamps bad values to 0
    pub stock: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
}

/// A product as served by the remote catalog, read-only for one sync run.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteProduct {
    /// Identifier assigned by the remote system; the sole join key
    pub external_id: String,
    pub name: String,
    pub base_price: Decimal,
    pub variants: Vec<RemoteVariant>,
    /// Display order is significant
    pub images: Vec<String>,
    pub barcode: Option<String>,
    /// Product-level stock, only consulted when there are no variants
    pub stock: Option<i32>,
}

impl RemoteProduct {
    /// Stock the local row should carry.
    ///
    /// With variants the sum of variant stocks wins and any product-level
    /// figure is ignored, so the two can never drift apart.
    pub fn total_stock(&self) -> i32 {
        if self.variants.is_empty() {
            return self.stock.unwrap_or(0).max(0);
        }
        self.variants
            .iter()
            .fold(0i32, |acc, v| acc.saturating_add(v.stock.max(0)))
    }
}

/// One page of the remote listing.
#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub products: Vec<RemoteProduct>,
    /// `None` when the listing doesn't advertise a page count
    pub total_pages: Option<u32>,
    /// Records on this page that could not be turned into a product
    pub skipped: usize,
}

// =============================================================================
// LOCAL CATALOG
// =============================================================================

/// The reconciler-owned half of a local product.
///
/// Every field here is overwritten on every sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogMirror {
    pub external_id: String,
    pub name: String,
    pub base_price: Decimal,
    pub stock: i32,
    pub images: Vec<String>,
    pub barcode: Option<String>,
    pub variants: Vec<RemoteVariant>,
}

impl CatalogMirror {
    /// Normalize a remote record into the local shape.
    pub fn from_remote(remote: &RemoteProduct) -> Self {
        Self {
            external_id: remote.external_id.clone(),
            name: remote.name.trim().to_string(),
            base_price: remote.base_price.round_dp(PRICE_SCALE),
            stock: remote.total_stock(),
            images: remote.images.clone(),
            barcode: remote.barcode.clone(),
            variants: remote
                .variants
                .iter()
                .map(|v| RemoteVariant {
                    stock: v.stock.max(0),
                    price: v.price.map(|p| p.round_dp(PRICE_SCALE)),
                    ..v.clone()
                })
                .collect(),
        }
    }

    /// Field-level differences between the stored mirror and this one.
    ///
    /// Used for reporting only; callers upsert regardless of the result.
    pub fn changes_from(&self, stored: &CatalogMirror) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        let mut check = |field: &'static str, old: serde_json::Value, new: serde_json::Value| {
            if old != new {
                changes.push(FieldChange {
                    external_id: self.external_id.clone(),
                    field,
                    old,
                    new,
                });
            }
        };

        check("name", json!(stored.name), json!(self.name));
        // Compare decimals numerically; their JSON strings differ by scale
        if stored.base_price != self.base_price {
            check(
                "base_price",
                json!(stored.base_price.to_string()),
                json!(self.base_price.to_string()),
            );
        }
        check("stock", json!(stored.stock), json!(self.stock));
        check("images", json!(stored.images), json!(self.images));
        check("barcode", json!(stored.barcode), json!(self.barcode));
        if stored.variants != self.variants {
            check("variants", json!(stored.variants), json!(self.variants));
        }

        changes
    }
}

/// The admin-owned half of a local product.
///
/// Only the approval endpoints write these columns. The reconciler sets
/// them exactly once, at insert time, to [`ApprovalState::pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApprovalState {
    pub active: bool,
    pub admin_approved: bool,
    pub admin_rejected: bool,
}

impl ApprovalState {
    /// State of every freshly imported product: hidden, awaiting review
    pub const fn pending() -> Self {
        Self {
            active: false,
            admin_approved: false,
            admin_rejected: false,
        }
    }

    pub fn approve(self) -> Self {
        Self {
            admin_approved: true,
            admin_rejected: false,
            ..self
        }
    }

    /// Rejected products are always taken off the storefront
    pub fn reject(self) -> Self {
        Self {
            active: false,
            admin_approved: false,
            admin_rejected: true,
        }
    }

    /// Only approved products may go live; deactivation is always allowed.
    pub fn set_active(self, active: bool) -> Result<Self, ApprovalError> {
        if active && !self.admin_approved {
            return Err(ApprovalError::NotApproved);
        }
        Ok(Self { active, ..self })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("product must be approved before it can be activated")]
    NotApproved,
}

/// A row of the `products` table.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StoredProduct {
    /// Datastore-generated primary key
    pub id: Uuid,

    /// `None` for products created by hand rather than imported
    pub external_id: Option<String>,

    pub name: String,
    pub base_price: Decimal,
    pub stock: i32,
    pub images: Json<Vec<String>>,
    pub barcode: Option<String>,
    pub variants: Json<Vec<RemoteVariant>>,

    pub active: bool,
    pub admin_approved: bool,
    pub admin_rejected: bool,

    /// True until the first sync after creation
    pub is_new_product: bool,

    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredProduct {
    /// Reconciler-owned view; `None` for hand-made products
    pub fn mirror(&self) -> Option<CatalogMirror> {
        Some(CatalogMirror {
            external_id: self.external_id.clone()?,
            name: self.name.clone(),
            base_price: self.base_price,
            stock: self.stock,
            images: self.images.0.clone(),
            barcode: self.barcode.clone(),
            variants: self.variants.0.clone(),
        })
    }

    pub fn approval(&self) -> ApprovalState {
        ApprovalState {
            active: self.active,
            admin_approved: self.admin_approved,
            admin_rejected: self.admin_rejected,
        }
    }
}

/// Minimal projection used by orphan detection.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub external_id: String,
}

/// A row of the admin-maintained denylist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ExcludedProduct {
    pub external_id: String,
    pub excluded_at: DateTime<Utc>,
    pub excluded_by: String,
}

/// `excluded_by` value for orphans recorded by the reconciler
pub const EXCLUDED_BY_SYNC: &str = "sync";

// =============================================================================
// SYNC RUN
// =============================================================================

/// What a run fetches, and therefore whether it may delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Walk every page; authoritative for orphan deletion
    Full { page_size: u32 },
    /// One page only; never deletes
    SinglePage { page: u32, page_size: u32 },
}

impl SyncMode {
    pub fn label(&self) -> &'static str {
        match self {
            SyncMode::Full { .. } => "full",
            SyncMode::SinglePage { .. } => "page",
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, SyncMode::Full { .. })
    }
}

/// A single field that changed for one product
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub external_id: String,
    pub field: &'static str,
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

/// One `sync_logs` row, appended after each batch
#[derive(Debug, Clone, Serialize)]
pub struct SyncLogEntry {
    pub run_id: Uuid,
    pub mode: &'static str,
    pub batch_index: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub changes: Vec<FieldChange>,
    pub created_at: DateTime<Utc>,
}

/// Counts for a completed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Products upserted (after exclusion filtering)
    pub processed: usize,
    pub new: usize,
    /// Existing products with at least one changed field
    pub updated: usize,
    pub unchanged: usize,
    /// Orphans removed with their dependent rows
    pub deleted: usize,
    /// Orphans whose delete failed and were soft-deactivated instead
    pub deactivated: usize,
    /// Remote products dropped because they are on the excluded list
    pub skipped_excluded: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// The remote returned nothing; the local catalog was left untouched
    Empty {
        warning: String,
        timestamp: DateTime<Utc>,
    },
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================

/// Body of `POST /sync`
///
/// # Example JSON
/// ```json
/// { "page": 2, "length": 50 }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncRequest {
    pub page: Option<u32>,
    pub length: Option<u32>,
}

impl SyncRequest {
    /// `page` present means a single-page sync; anything else is a full sync
    pub fn into_mode(self, default_page_size: u32) -> SyncMode {
        let page_size = self.length.filter(|l| *l > 0).unwrap_or(default_page_size);
        match self.page {
            Some(page) => SyncMode::SinglePage {
                page: page.max(1),
                page_size,
            },
            None => SyncMode::Full { page_size },
        }
    }
}

/// Body returned by `/sync`
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SyncResponse {
    Completed {
        ok: bool,
        processed: usize,
        new: usize,
        updated: usize,
        unchanged: usize,
        deleted: usize,
        deactivated: usize,
        imported: usize,
        timestamp: DateTime<Utc>,
    },
    Empty {
        ok: bool,
        imported: usize,
        warning: String,
    },
}

impl From<SyncOutcome> for SyncResponse {
    fn from(outcome: SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Completed(report) => SyncResponse::Completed {
                ok: true,
                processed: report.processed,
                new: report.new,
                updated: report.updated,
                unchanged: report.unchanged,
                deleted: report.deleted,
                deactivated: report.deactivated,
                imported: report.processed,
                timestamp: report.timestamp,
            },
            SyncOutcome::Empty { warning, .. } => SyncResponse::Empty {
                ok: true,
                imported: 0,
                warning,
            },
        }
    }
}

/// Review status filter for the product listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

/// Query parameters for `GET /api/v1/products`
#[derive(Debug, Deserialize)]
pub struct ProductListParams {
    pub status: Option<ReviewStatus>,

    #[serde(default = "default_page")]
    pub page: i64,

    #[serde(default = "default_per_page")]
    pub per_page: i64,
}

fn default_page() -> i64 {
    1
}
fn default_per_page() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub struct ProductListResponse {
    pub items: Vec<StoredProduct>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

/// Body of `PUT /api/v1/products/:id/active`
#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}

/// Body of `POST /api/v1/excluded`
#[derive(Debug, Deserialize)]
pub struct ExclusionRequest {
    pub external_id: String,
    pub excluded_by: String,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub redis: bool,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn variant(stock: i32) -> RemoteVariant {
        RemoteVariant {
            color: None,
            size: None,
            stock,
            price: None,
        }
    }

    fn remote(variants: Vec<RemoteVariant>, stock: Option<i32>) -> RemoteProduct {
        RemoteProduct {
            external_id: "FZ-1".to_string(),
            name: "Vestido Midi".to_string(),
            base_price: Decimal::from_str("89.90").unwrap(),
            variants,
            images: vec!["https://cdn/1.jpg".to_string()],
            barcode: None,
            stock,
        }
    }

    #[test]
    fn test_stock_is_sum_of_variants() {
        let product = remote(vec![variant(3), variant(5), variant(0)], Some(99));
        assert_eq!(product.total_stock(), 8);
    }

    #[test]
    fn test_stock_falls_back_to_direct_field() {
        assert_eq!(remote(vec![], Some(12)).total_stock(), 12);
        assert_eq!(remote(vec![], None).total_stock(), 0);
        assert_eq!(remote(vec![], Some(-4)).total_stock(), 0);
    }

    #[test]
    fn test_stock_sum_saturates() {
        let product = remote(vec![variant(i32::MAX), variant(10)], None);
        assert_eq!(product.total_stock(), i32::MAX);
    }

    #[test]
    fn test_mirror_rounds_price_to_column_scale() {
        let mut product = remote(vec![], None);
        product.base_price = Decimal::from_str("10.999").unwrap();
        let mirror = CatalogMirror::from_remote(&product);
        assert_eq!(mirror.base_price, Decimal::from_str("11.00").unwrap());
    }

    #[test]
    fn test_changes_detects_price_and_stock() {
        let before = CatalogMirror::from_remote(&remote(vec![variant(2)], None));
        let mut changed = remote(vec![variant(7)], None);
        changed.base_price = Decimal::from_str("99.90").unwrap();
        let after = CatalogMirror::from_remote(&changed);

        let fields: Vec<_> = after.changes_from(&before).iter().map(|c| c.field).collect();
        assert!(fields.contains(&"base_price"));
        assert!(fields.contains(&"stock"));
        assert!(!fields.contains(&"name"));
    }

    #[test]
    fn test_changes_ignores_price_scale() {
        let before = CatalogMirror::from_remote(&remote(vec![], None));
        let mut after = before.clone();
        after.base_price = Decimal::from_str("89.9").unwrap();
        assert!(after.changes_from(&before).is_empty());
    }

    #[test]
    fn test_approval_transitions() {
        let pending = ApprovalState::pending();
        assert_eq!(pending.set_active(true), Err(ApprovalError::NotApproved));

        let live = pending.approve().set_active(true).unwrap();
        assert!(live.active && live.admin_approved && !live.admin_rejected);

        let rejected = live.reject();
        assert!(!rejected.active && !rejected.admin_approved && rejected.admin_rejected);

        assert!(rejected.set_active(false).is_ok());
    }

    #[test]
    fn test_sync_request_modes() {
        assert_eq!(
            SyncRequest::default().into_mode(100),
            SyncMode::Full { page_size: 100 }
        );
        assert_eq!(
            SyncRequest { page: Some(2), length: Some(50) }.into_mode(100),
            SyncMode::SinglePage { page: 2, page_size: 50 }
        );
        assert_eq!(
            SyncRequest { page: Some(0), length: Some(0) }.into_mode(100),
            SyncMode::SinglePage { page: 1, page_size: 100 }
        );
    }

    #[test]
    fn test_empty_outcome_serializes_warning() {
        let body = serde_json::to_value(SyncResponse::from(SyncOutcome::Empty {
            warning: "no products".to_string(),
            timestamp: Utc::now(),
        }))
        .unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["imported"], 0);
        assert_eq!(body["warning"], "no products");
    }
}
