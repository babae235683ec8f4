// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers (controller layer).
//
// GROUPS:
// - probes:     /health, /ready, /metrics
// - sync:       GET /sync (cron), POST /sync (admin, optional page)
// - approval:   /api/v1/products/...  (sole writers of approval columns)
// - exclusions: /api/v1/excluded/...
// =============================================================================

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::job::SyncJob;
use crate::metrics;
use crate::models::*;
use crate::reconciler;
use crate::AppState;

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "catalog-sync".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe: PostgreSQL and Redis must both answer
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;

    let redis_healthy = redis::cmd("PING")
        .query_async::<_, String>(&mut state.redis.clone())
        .await
        .is_ok();

    let all_healthy = db_healthy && redis_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Prometheus metrics endpoint
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// SYNC ENDPOINTS
// =============================================================================

/// Full synchronization, meant for external cron schedulers
///
/// GET /sync
pub async fn sync_get(State(state): State<Arc<AppState>>) -> AppResult<Json<SyncResponse>> {
    let mode = SyncMode::Full {
        page_size: state.sync_job.default_page_size(),
    };
    run_sync(&state.sync_job, "GET", mode).await
}

/// Full or single-page synchronization
///
/// POST /sync
///
/// # Request Body (optional)
/// ```json
/// { "page": 2, "length": 50 }
/// ```
/// Without `page` the whole catalog is synchronized and orphans are removed.
/// A body that isn't a valid request answers 400 and runs nothing.
pub async fn sync_post(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> AppResult<Json<SyncResponse>> {
    let request = parse_sync_request(&body)?;
    let mode = request.into_mode(state.sync_job.default_page_size());
    run_sync(&state.sync_job, "POST", mode).await
}

/// An empty body is a full sync with defaults; anything else must be a
/// well-formed request, whatever the content type says.
fn parse_sync_request(body: &[u8]) -> AppResult<SyncRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(SyncRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("invalid sync request: {e}")))
}

async fn run_sync(job: &SyncJob, method: &str, mode: SyncMode) -> AppResult<Json<SyncResponse>> {
    let start = Instant::now();
    tracing::info!(mode = mode.label(), "Sync requested over HTTP");

    let result = job.run(mode).await.map_err(AppError::Sync);
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(err) => err.status_code(),
    };
    metrics::record_http_request(method, "/sync", status.as_u16(), start.elapsed().as_secs_f64());

    result.map(|outcome| Json(SyncResponse::from(outcome)))
}

// =============================================================================
// PRODUCT APPROVAL ENDPOINTS
// =============================================================================

/// List products, optionally by review status
///
/// GET /api/v1/products?status=pending&page=1&per_page=20
pub async fn list_products(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProductListParams>,
) -> AppResult<Json<ProductListResponse>> {
    let start = Instant::now();

    let page = params.page.max(1);
    let per_page = params.per_page.clamp(1, 100);

    let (items, total) = state.db.list_products(params.status, page, per_page).await?;

    metrics::record_http_request(
        "GET",
        "/api/v1/products",
        200,
        start.elapsed().as_secs_f64(),
    );

    Ok(Json(ProductListResponse {
        items,
        total,
        page,
        per_page,
    }))
}

/// GET /api/v1/products/:id
pub async fn get_product(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<StoredProduct>> {
    let product = state
        .db
        .get_product(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("product not found: {id}")))?;
    Ok(Json(product))
}

/// POST /api/v1/products/:id/approve
pub async fn approve_product(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<StoredProduct>> {
    let start = Instant::now();
    let product = state
        .db
        .update_approval(id, |current| Ok(current.approve()))
        .await?;

    tracing::info!(product_id = %id, "Product approved");
    metrics::record_http_request(
        "POST",
        "/api/v1/products/:id/approve",
        200,
        start.elapsed().as_secs_f64(),
    );
    Ok(Json(product))
}

/// POST /api/v1/products/:id/reject
pub async fn reject_product(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<StoredProduct>> {
    let start = Instant::now();
    let product = state
        .db
        .update_approval(id, |current| Ok(current.reject()))
        .await?;

    tracing::info!(product_id = %id, "Product rejected");
    metrics::record_http_request(
        "POST",
        "/api/v1/products/:id/reject",
        200,
        start.elapsed().as_secs_f64(),
    );
    Ok(Json(product))
}

/// Put a product on or off the storefront
///
/// PUT /api/v1/products/:id/active
///
/// # Request Body
/// ```json
/// { "active": true }
/// ```
/// Activating an unapproved product answers 400.
pub async fn set_product_active(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<SetActiveRequest>,
) -> AppResult<Json<StoredProduct>> {
    let start = Instant::now();
    let product = state
        .db
        .update_approval(id, |current| {
            current
                .set_active(request.active)
                .map_err(|e| AppError::BadRequest(e.to_string()))
        })
        .await?;

    tracing::info!(product_id = %id, active = request.active, "Product visibility changed");
    metrics::record_http_request(
        "PUT",
        "/api/v1/products/:id/active",
        200,
        start.elapsed().as_secs_f64(),
    );
    Ok(Json(product))
}

// =============================================================================
// EXCLUSION LIST ENDPOINTS
// =============================================================================

/// GET /api/v1/excluded
pub async fn list_excluded(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<ExcludedProduct>>> {
    let records = state.db.list_exclusions().await?;
    Ok(Json(records))
}

/// Admin delete: denylist the id and remove the local product, if any
///
/// POST /api/v1/excluded
///
/// # Request Body
/// ```json
/// { "external_id": "12345", "excluded_by": "admin@c4franquias.com" }
/// ```
pub async fn add_excluded(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExclusionRequest>,
) -> AppResult<(StatusCode, Json<ExcludedProduct>)> {
    let external_id = request.external_id.trim().to_string();
    let excluded_by = request.excluded_by.trim().to_string();
    if external_id.is_empty() || excluded_by.is_empty() {
        return Err(AppError::BadRequest(
            "external_id and excluded_by are required".to_string(),
        ));
    }

    let record = ExcludedProduct {
        external_id,
        excluded_at: Utc::now(),
        excluded_by,
    };
    let removal = reconciler::exclude_product(&state.db, &record).await?;

    tracing::info!(
        external_id = %record.external_id,
        excluded_by = %record.excluded_by,
        removal = ?removal,
        "Product excluded from catalog sync"
    );
    Ok((StatusCode::CREATED, Json(record)))
}

/// Lift an exclusion; the product comes back on the next full sync
///
/// DELETE /api/v1/excluded/:external_id
pub async fn remove_excluded(
    State(state): State<Arc<AppState>>,
    Path(external_id): Path<String>,
) -> AppResult<StatusCode> {
    if state.db.remove_exclusion(&external_id).await? {
        tracing::info!(external_id = %external_id, "Exclusion lifted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!(
            "external id not excluded: {external_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::test_support::{CountingLock, InMemoryStore, ScriptedSource};
    use axum::{
        body::Body,
        extract::FromRequest,
        http::{header, Request},
        response::IntoResponse,
    };

    fn job(source: Option<ScriptedSource>, lock: CountingLock) -> SyncJob {
        SyncJob::new(
            SyncSettings::default(),
            source.map(|s| Arc::new(s) as Arc<dyn crate::source::CatalogSource>),
            Arc::new(InMemoryStore::new()),
            Arc::new(lock),
        )
    }

    async fn body_json(error: AppError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    /// Run a raw request body through the same extractor `sync_post` uses
    async fn mode_for(body: &'static str, content_type: Option<&str>) -> AppResult<SyncMode> {
        let mut request = Request::builder().method("POST").uri("/sync");
        if let Some(content_type) = content_type {
            request = request.header(header::CONTENT_TYPE, content_type);
        }
        let request = request.body(Body::from(body)).unwrap();

        let bytes = Bytes::from_request(request, &()).await.unwrap();
        parse_sync_request(&bytes).map(|r| r.into_mode(100))
    }

    #[tokio::test]
    async fn test_post_body_selects_sync_mode() {
        assert_eq!(
            mode_for("", None).await.unwrap(),
            SyncMode::Full { page_size: 100 }
        );
        assert_eq!(
            mode_for(r#"{"length": 25}"#, Some("application/json")).await.unwrap(),
            SyncMode::Full { page_size: 25 }
        );
        assert_eq!(
            mode_for(r#"{"page": 2}"#, Some("application/json")).await.unwrap(),
            SyncMode::SinglePage { page: 2, page_size: 100 }
        );
        // Content type is not required for a well-formed body
        assert_eq!(
            mode_for(r#"{"page": 2}"#, None).await.unwrap(),
            SyncMode::SinglePage { page: 2, page_size: 100 }
        );
    }

    #[tokio::test]
    async fn test_malformed_post_body_is_rejected_not_run_as_full_sync() {
        for body in [r#"{"page": "2"}"#, "{not json", r#"{"pagina": 2}"#] {
            let err = mode_for(body, Some("application/json")).await.unwrap_err();
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST, "body {body}");
        }
    }

    #[tokio::test]
    async fn test_completed_sync_response_shape() {
        let source = ScriptedSource::single(vec![
            ScriptedSource::product("A"),
            ScriptedSource::product("B"),
        ]);
        let job = job(Some(source), CountingLock::free());

        let Json(response) = run_sync(&job, "GET", SyncMode::Full { page_size: 100 })
            .await
            .unwrap();
        let body = serde_json::to_value(response).unwrap();

        assert_eq!(body["ok"], true);
        assert_eq!(body["processed"], 2);
        assert_eq!(body["imported"], 2);
        assert_eq!(body["new"], 2);
        assert_eq!(body["deleted"], 0);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_empty_catalog_response_shape() {
        let job = job(Some(ScriptedSource::with_pages(vec![])), CountingLock::free());

        let Json(response) = run_sync(&job, "GET", SyncMode::Full { page_size: 100 })
            .await
            .unwrap();
        let body = serde_json::to_value(response).unwrap();

        assert_eq!(body["ok"], true);
        assert_eq!(body["imported"], 0);
        assert!(body["warning"].is_string());
        assert!(body.get("processed").is_none());
    }

    #[tokio::test]
    async fn test_missing_token_answers_500_with_error_body() {
        let job = job(None, CountingLock::free());

        let err = run_sync(&job, "GET", SyncMode::Full { page_size: 100 })
            .await
            .unwrap_err();
        let (status, body) = body_json(err).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "CONFIG_MISSING");
        assert!(body["message"].as_str().unwrap().contains("FACILZAP_TOKEN"));
    }

    #[tokio::test]
    async fn test_concurrent_run_answers_409() {
        let source = ScriptedSource::single(vec![ScriptedSource::product("A")]);
        let job = job(Some(source), CountingLock::busy());

        let err = run_sync(&job, "POST", SyncMode::Full { page_size: 100 })
            .await
            .unwrap_err();
        let (status, body) = body_json(err).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "SYNC_IN_PROGRESS");
    }
}
