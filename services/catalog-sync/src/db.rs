// =============================================================================
// DATABASE MODULE
// =============================================================================
// PostgreSQL access for the catalog, the exclusion list and the sync log.
//
// NOTES:
// - CatalogStore is the narrow surface the reconciler needs; Database
//   implements it with SQLx, tests implement it in memory
// - The upsert never names approval columns in its UPDATE clause, so the
//   reconciler cannot overwrite admin decisions even by mistake
// - Approval columns are written only by the `*_product` admin methods below
// =============================================================================

use std::collections::HashSet;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::{AppError, StoreError};
use crate::metrics;
use crate::models::{
    ApprovalState, CatalogEntry, CatalogMirror, ExcludedProduct, ReviewStatus, StoredProduct,
    SyncLogEntry,
};

const PRODUCT_COLUMNS: &str = "id, external_id, name, base_price, stock, images, barcode, \
     variants, active, admin_approved, admin_rejected, is_new_product, last_synced_at, \
     created_at, updated_at";

// -----------------------------------------------------------------------------
// STORE TRAIT
// -----------------------------------------------------------------------------
/// Datastore operations used by a reconciliation run.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Every external id on the denylist
    async fn excluded_ids(&self) -> Result<HashSet<String>, StoreError>;

    /// Existing products for a batch, looked up by external id
    async fn find_by_external_ids(&self, ids: &[String])
        -> Result<Vec<StoredProduct>, StoreError>;

    /// Insert-or-update keyed by external id, in one call.
    ///
    /// New rows get [`ApprovalState::pending`] and `is_new_product = true`;
    /// existing rows only get their mirror fields refreshed and
    /// `is_new_product` cleared.
    async fn upsert_batch(
        &self,
        rows: &[CatalogMirror],
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// All products that came from the catalog (non-null external id)
    async fn catalog_entries(&self) -> Result<Vec<CatalogEntry>, StoreError>;

    /// Add to the denylist; a no-op if already present
    async fn record_exclusion(&self, record: &ExcludedProduct) -> Result<(), StoreError>;

    /// Remove dependent rows, then the product, atomically
    async fn delete_product_cascade(&self, id: Uuid) -> Result<(), StoreError>;

    /// Soft-delete fallback
    async fn deactivate_product(&self, id: Uuid) -> Result<(), StoreError>;

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<(), StoreError>;
}

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create tables and indexes if they don't exist.
    ///
    /// Link tables reference `products(id)` without ON DELETE CASCADE; the
    /// reconciler removes them explicitly, in dependency order.
    pub async fn run_migrations(&self) -> Result<()> {
        let statements: [(&str, &str); 9] = [
            (
                "products table",
                r#"
                CREATE TABLE IF NOT EXISTS products (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),

                    -- Join key to the remote catalog; NULL for hand-made products
                    external_id VARCHAR(100) UNIQUE,

                    -- Mirror of the remote record, rewritten every sync
                    name VARCHAR(500) NOT NULL,
                    base_price NUMERIC(12, 2) NOT NULL DEFAULT 0,
                    stock INTEGER NOT NULL DEFAULT 0,
                    images JSONB NOT NULL DEFAULT '[]'::jsonb,
                    barcode VARCHAR(100),
                    variants JSONB NOT NULL DEFAULT '[]'::jsonb,

                    -- Owned by the admin approval workflow
                    active BOOLEAN NOT NULL DEFAULT FALSE,
                    admin_approved BOOLEAN NOT NULL DEFAULT FALSE,
                    admin_rejected BOOLEAN NOT NULL DEFAULT FALSE,

                    is_new_product BOOLEAN NOT NULL DEFAULT TRUE,
                    last_synced_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                    CONSTRAINT non_negative_stock CHECK (stock >= 0)
                )
                "#,
            ),
            (
                "excluded_products table",
                r#"
                CREATE TABLE IF NOT EXISTS excluded_products (
                    external_id VARCHAR(100) PRIMARY KEY,
                    excluded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    excluded_by VARCHAR(255) NOT NULL
                )
                "#,
            ),
            (
                "reseller_product_prices table",
                r#"
                CREATE TABLE IF NOT EXISTS reseller_product_prices (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    reseller_id UUID NOT NULL,
                    product_id UUID NOT NULL REFERENCES products(id),
                    margin_percent NUMERIC(6, 2),
                    custom_price NUMERIC(12, 2),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "reseller_products table",
                r#"
                CREATE TABLE IF NOT EXISTS reseller_products (
                    reseller_id UUID NOT NULL,
                    product_id UUID NOT NULL REFERENCES products(id),
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (reseller_id, product_id)
                )
                "#,
            ),
            (
                "product_categories table",
                r#"
                CREATE TABLE IF NOT EXISTS product_categories (
                    product_id UUID NOT NULL REFERENCES products(id),
                    category_id UUID NOT NULL,
                    PRIMARY KEY (product_id, category_id)
                )
                "#,
            ),
            (
                "sync_logs table",
                r#"
                CREATE TABLE IF NOT EXISTS sync_logs (
                    id BIGSERIAL PRIMARY KEY,
                    run_id UUID NOT NULL,
                    mode VARCHAR(20) NOT NULL,
                    batch_index INTEGER NOT NULL,
                    new_count INTEGER NOT NULL,
                    updated_count INTEGER NOT NULL,
                    unchanged_count INTEGER NOT NULL,
                    changes JSONB NOT NULL DEFAULT '[]'::jsonb,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "products review index",
                "CREATE INDEX IF NOT EXISTS idx_products_review \
                 ON products(admin_approved, admin_rejected)",
            ),
            (
                "reseller_products index",
                "CREATE INDEX IF NOT EXISTS idx_reseller_products_product \
                 ON reseller_products(product_id)",
            ),
            (
                "sync_logs index",
                "CREATE INDEX IF NOT EXISTS idx_sync_logs_run ON sync_logs(run_id)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create {what}"))?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // ADMIN: PRODUCT REVIEW
    // -------------------------------------------------------------------------

    /// List products, optionally filtered by review status
    pub async fn list_products(
        &self,
        status: Option<ReviewStatus>,
        page: i64,
        per_page: i64,
    ) -> Result<(Vec<StoredProduct>, i64), sqlx::Error> {
        let filter = match status {
            None => "TRUE",
            Some(ReviewStatus::Pending) => "admin_approved = FALSE AND admin_rejected = FALSE",
            Some(ReviewStatus::Approved) => "admin_approved = TRUE",
            Some(ReviewStatus::Rejected) => "admin_rejected = TRUE",
        };
        let offset = (page - 1) * per_page;
        let start = Instant::now();

        let items = sqlx::query_as::<_, StoredProduct>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE {filter} \
             ORDER BY created_at DESC, id LIMIT $1 OFFSET $2"
        ))
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM products WHERE {filter}"))
                .fetch_one(&self.pool)
                .await?;

        metrics::record_db_query("select", start.elapsed().as_secs_f64());
        Ok((items, total.0))
    }

    pub async fn get_product(&self, id: Uuid) -> Result<Option<StoredProduct>, sqlx::Error> {
        sqlx::query_as::<_, StoredProduct>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Apply an approval transition under a row lock.
    ///
    /// `transition` receives the current state and returns the next one or
    /// a reason to refuse. Any admin decision also clears `is_new_product`.
    pub async fn update_approval<F>(
        &self,
        id: Uuid,
        transition: F,
    ) -> Result<StoredProduct, AppError>
    where
        F: FnOnce(ApprovalState) -> Result<ApprovalState, AppError> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, StoredProduct>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("product not found: {id}")))?;

        let next = transition(current.approval())?;

        let updated = sqlx::query_as::<_, StoredProduct>(&format!(
            "UPDATE products \
             SET active = $1, admin_approved = $2, admin_rejected = $3, \
                 is_new_product = FALSE, updated_at = NOW() \
             WHERE id = $4 \
             RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(next.active)
        .bind(next.admin_approved)
        .bind(next.admin_rejected)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    // -------------------------------------------------------------------------
    // ADMIN: EXCLUSION LIST
    // -------------------------------------------------------------------------

    pub async fn list_exclusions(&self) -> Result<Vec<ExcludedProduct>, sqlx::Error> {
        sqlx::query_as::<_, ExcludedProduct>(
            "SELECT external_id, excluded_at, excluded_by FROM excluded_products \
             ORDER BY excluded_at DESC",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Returns `false` when the id was not on the list
    pub async fn remove_exclusion(&self, external_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM excluded_products WHERE external_id = $1")
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

#[async_trait]
impl CatalogStore for Database {
    async fn excluded_ids(&self) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT external_id FROM excluded_products")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn find_by_external_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<StoredProduct>, StoreError> {
        let start = Instant::now();
        let rows = sqlx::query_as::<_, StoredProduct>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE external_id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        metrics::record_db_query("select", start.elapsed().as_secs_f64());
        Ok(rows)
    }

    async fn upsert_batch(
        &self,
        rows: &[CatalogMirror],
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let pending = ApprovalState::pending();

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO products (external_id, name, base_price, stock, images, barcode, \
             variants, active, admin_approved, admin_rejected, is_new_product, last_synced_at) ",
        );
        builder.push_values(rows, |mut row, mirror| {
            row.push_bind(mirror.external_id.clone())
                .push_bind(mirror.name.clone())
                .push_bind(mirror.base_price)
                .push_bind(mirror.stock)
                .push_bind(Json(mirror.images.clone()))
                .push_bind(mirror.barcode.clone())
                .push_bind(Json(mirror.variants.clone()))
                .push_bind(pending.active)
                .push_bind(pending.admin_approved)
                .push_bind(pending.admin_rejected)
                .push_bind(true)
                .push_bind(synced_at);
        });
        // Approval columns never appear in this list
        builder.push(
            " ON CONFLICT (external_id) DO UPDATE SET \
               name = EXCLUDED.name, \
               base_price = EXCLUDED.base_price, \
               stock = EXCLUDED.stock, \
               images = EXCLUDED.images, \
               barcode = EXCLUDED.barcode, \
               variants = EXCLUDED.variants, \
               is_new_product = FALSE, \
               last_synced_at = EXCLUDED.last_synced_at, \
               updated_at = NOW()",
        );

        builder.build().execute(&self.pool).await?;
        metrics::record_db_query("upsert", start.elapsed().as_secs_f64());
        Ok(())
    }

    async fn catalog_entries(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, CatalogEntry>(
            "SELECT id, external_id FROM products WHERE external_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_exclusion(&self, record: &ExcludedProduct) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO excluded_products (external_id, excluded_at, excluded_by)
            VALUES ($1, $2, $3)
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(&record.external_id)
        .bind(record.excluded_at)
        .bind(&record.excluded_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_product_cascade(&self, id: Uuid) -> Result<(), StoreError> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;

        // Dependency order: pricing overrides, reseller links, category links
        for table in ["reseller_product_prices", "reseller_products", "product_categories"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE product_id = $1"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        metrics::record_db_query("delete", start.elapsed().as_secs_f64());
        Ok(())
    }

    async fn deactivate_product(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE products SET active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_logs
                (run_id, mode, batch_index, new_count, updated_count, unchanged_count,
                 changes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.run_id)
        .bind(entry.mode)
        .bind(entry.batch_index as i32)
        .bind(entry.new as i32)
        .bind(entry.updated as i32)
        .bind(entry.unchanged as i32)
        .bind(Json(&entry.changes))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
