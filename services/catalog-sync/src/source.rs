// =============================================================================
// REMOTE CATALOG MODULE
// =============================================================================
// The paginated product listing of the external catalog, behind a trait so
// the reconciler can be driven by a scripted source in tests.
//
// The trait gives two calls:
// - fetch_page: one page, exactly as requested
// - fetch_all:  walks pages from 1 until exhaustion (default implementation),
//               and only ever returns a complete catalog
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};

use crate::config::Config;
use crate::dto;
use crate::error::{CatalogSourceError, SyncError};
use crate::models::{RemotePage, RemoteProduct};

const USER_AGENT: &str = concat!("catalog-sync/", env!("CARGO_PKG_VERSION"));

/// Upper bound on how much of an error body we keep for logs
const ERROR_BODY_LIMIT: usize = 512;

#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch one page (1-indexed).
    async fn fetch_page(&self, page: u32, page_size: u32)
        -> Result<RemotePage, CatalogSourceError>;

    /// Hard cap on pages walked by [`CatalogSource::fetch_all`]
    fn max_pages(&self) -> u32 {
        u32::MAX
    }

    /// Fetch the whole catalog, page after page, in order.
    ///
    /// Stops at the advertised page count or, when the listing doesn't give
    /// one, on the first empty page. The result is only returned when it is
    /// the complete catalog: a page with undecodable records fails with
    /// `Decode`, and running into `max_pages` fails with `Truncated`.
    async fn fetch_all(&self, page_size: u32) -> Result<Vec<RemoteProduct>, CatalogSourceError> {
        let mut products = Vec::new();
        let mut page = 1u32;

        loop {
            let batch = self.fetch_page(page, page_size).await?;
            if batch.skipped > 0 {
                return Err(CatalogSourceError::Decode(format!(
                    "page {page}: {} record(s) could not be decoded",
                    batch.skipped
                )));
            }

            let fetched = batch.products.len();
            products.extend(batch.products);

            tracing::debug!(
                page,
                fetched,
                total_pages = ?batch.total_pages,
                "Fetched catalog page"
            );

            if fetched == 0 || batch.total_pages.is_some_and(|total| page >= total) {
                break;
            }
            if page >= self.max_pages() {
                return Err(CatalogSourceError::Truncated {
                    max_pages: self.max_pages(),
                });
            }
            page += 1;
        }

        Ok(products)
    }
}

// -----------------------------------------------------------------------------
// FACILZAP CLIENT
// -----------------------------------------------------------------------------
/// reqwest-backed client for `GET {base}/produtos`.
#[derive(Clone)]
pub struct FacilZapClient {
    client: Client,
    base_url: String,
    token: String,
    max_pages: u32,
}

impl FacilZapClient {
    /// Build a client from configuration.
    ///
    /// Fails with `ConfigMissing` when no token is configured, before any
    /// request is made.
    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        let token = config.catalog_token()?.to_string();
        let client = Self::http_client(config.sync.request_timeout)
            .map_err(|e| SyncError::Fetch(CatalogSourceError::Transport(e)))?;

        Ok(Self {
            client,
            base_url: config.facilzap_api_url.trim_end_matches('/').to_string(),
            token,
            max_pages: config.sync.max_pages,
        })
    }

    fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
        Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
    }
}

#[async_trait]
impl CatalogSource for FacilZapClient {
    async fn fetch_page(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<RemotePage, CatalogSourceError> {
        let response = self
            .client
            .get(format!("{}/produtos", self.base_url))
            .bearer_auth(&self.token)
            .header(header::ACCEPT, "application/json")
            .query(&[("page", page), ("length", page_size)])
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(CatalogSourceError::Status {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }

        dto::decode_page(&body)
    }

    fn max_pages(&self) -> u32 {
        self.max_pages
    }
}
