// =============================================================================
// CATALOG SYNC SERVICE - Main Entry Point
// =============================================================================
// Keeps the local product catalog of the reseller platform in step with the
// FacilZap catalog API.
//
// WHAT THIS SERVICE DOES:
// - Pulls the remote catalog page by page and upserts it in batches
// - Leaves admin approval decisions untouched on every sync
// - Removes products that disappeared upstream (full syncs only) and keeps
//   them out through the exclusion list
// - Exposes the approval and exclusion admin APIs
// - Exposes Prometheus metrics for observability
// - Uses Redis as a cross-replica lock so sync runs never overlap
// =============================================================================

// -----------------------------------------------------------------------------
// MODULE DECLARATIONS
// -----------------------------------------------------------------------------
mod config;      // Configuration loading (config.rs)
mod db;          // Datastore operations (db.rs)
mod dto;         // Remote catalog payload shapes (dto.rs)
mod error;       // Error types (error.rs)
mod handlers;    // HTTP request handlers (handlers.rs)
mod job;         // Credential check + lock around a run (job.rs)
mod lock;        // Redis job lock (lock.rs)
mod metrics;     // Prometheus metrics setup (metrics.rs)
mod models;      // Data structures (models.rs)
mod reconciler;  // The reconciliation routine (reconciler.rs)
mod scheduler;   // Optional periodic trigger (scheduler.rs)
mod source;      // Remote catalog client (source.rs)

#[cfg(test)]
mod test_support;

// -----------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------
use axum::{
    routing::{delete, get, post, put},
    Router,
};

use std::sync::Arc;

use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::job::SyncJob;
use crate::lock::{RedisJobLock, SYNC_JOB_NAME};
use crate::metrics::setup_metrics;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
pub struct AppState {
    // Database connection pool
    pub db: Database,

    // Redis connection, shared with the job lock
    pub redis: redis::aio::ConnectionManager,

    // Prometheus metrics handle
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,

    // Entry point for every sync run (HTTP and scheduler)
    pub sync_job: Arc<SyncJob>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok();

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // Example: RUST_LOG=info,catalog_sync=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,catalog_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Catalog Sync Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        port = config.port,
        catalog_url = %config.facilzap_api_url,
        token_configured = config.facilzap_token.is_some(),
        "Configuration loaded"
    );
    if config.facilzap_token.is_none() {
        tracing::warn!("FACILZAP_TOKEN is not set, sync requests will fail until it is");
    }

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Connect to PostgreSQL database
    // -------------------------------------------------------------------------
    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    // -------------------------------------------------------------------------
    // STEP 6: Connect to Redis
    // -------------------------------------------------------------------------
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    info!("Connected to Redis");

    // -------------------------------------------------------------------------
    // STEP 7: Build the sync job and the optional scheduler
    // -------------------------------------------------------------------------
    let lock = RedisJobLock::new(redis_conn.clone(), SYNC_JOB_NAME, config.sync.lock_ttl);

    let sync_job = Arc::new(SyncJob::from_config(
        &config,
        Arc::new(db.clone()),
        Arc::new(lock),
    )?);

    if let Some(every) = config.sync.interval {
        scheduler::spawn(sync_job.clone(), every);
    } else {
        info!("SYNC_INTERVAL_SECS not set, syncs run only when /sync is called");
    }

    let state = Arc::new(AppState {
        db,
        redis: redis_conn,
        metrics_handle,
        sync_job,
    });

    // -------------------------------------------------------------------------
    // STEP 8: Define routes
    // -------------------------------------------------------------------------
    let app = Router::new()
        // ----- Health & Readiness Endpoints -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))

        // ----- Metrics Endpoint -----
        .route("/metrics", get(handlers::metrics_handler))

        // ----- Sync Trigger -----
        // GET for cron callers, POST for admins (optionally one page)
        .route("/sync", get(handlers::sync_get).post(handlers::sync_post))

        // ----- Product Approval API -----
        .route("/api/v1/products", get(handlers::list_products))
        .route("/api/v1/products/:id", get(handlers::get_product))
        .route("/api/v1/products/:id/approve", post(handlers::approve_product))
        .route("/api/v1/products/:id/reject", post(handlers::reject_product))
        .route("/api/v1/products/:id/active", put(handlers::set_product_active))

        // ----- Exclusion List API -----
        .route(
            "/api/v1/excluded",
            get(handlers::list_excluded).post(handlers::add_excluded),
        )
        .route("/api/v1/excluded/:external_id", delete(handlers::remove_excluded))

        // ----- Middleware Layers -----
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // -------------------------------------------------------------------------
    // STEP 9: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Catalog Sync Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
