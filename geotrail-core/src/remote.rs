//! HTTP client for the remote location store
//!
//! Speaks the PostgREST dialect used by hosted Postgres backends:
//!
//! - `POST {base_url}/locations` with a JSON array of rows
//! - `GET {base_url}/locations?order=timestamp.asc` for the full history
//!
//! Authentication is a static key sent both as `apikey` and as a bearer
//! token. Inserts ask for `return=representation` so the committed rows
//! come back carrying their `locationid`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};

use crate::config::RemoteConfig;
use crate::error::{Error, Result, SyncError};
use crate::types::LocationRecord;

/// Table / resource name on the remote
pub const LOCATIONS_RESOURCE: &str = "locations";

/// Remote persistence collaborator.
///
/// A batch insert is all-or-nothing: `Ok` means every row was accepted.
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Insert a batch; returns the committed rows when the remote echoes them
    async fn insert_batch(
        &self,
        records: &[LocationRecord],
    ) -> std::result::Result<Vec<LocationRecord>, SyncError>;

    /// Full history ordered by ascending timestamp
    async fn fetch_all(&self) -> std::result::Result<Vec<LocationRecord>, SyncError>;

    /// Whether the remote host answers at all (any HTTP status counts)
    async fn is_reachable(&self) -> bool;
}

/// HTTP client for the REST location store
pub struct RestLocationStore {
    http_client: reqwest::Client,
    base_url: String,
    max_retries: usize,
    retry_base_delay: Duration,
}

impl RestLocationStore {
    /// Create a new client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required fields.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Config("remote.base_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let mut key_value = HeaderValue::from_str(api_key)
                .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?;
            key_value.set_sensitive(true);
            headers.insert("apikey", key_value);

            let mut auth_value = HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?;
            auth_value.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth_value);
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(500),
        })
    }

    fn resource_url(&self) -> String {
        format!("{}/{}", self.base_url, LOCATIONS_RESOURCE)
    }

    /// One insert request, no retries
    async fn insert_once(
        &self,
        records: &[LocationRecord],
    ) -> std::result::Result<Vec<LocationRecord>, SyncError> {
        let response = self
            .http_client
            .post(self.resource_url())
            .header("Prefer", "return=representation")
            .json(records)
            .send()
            .await
            .map_err(|e| SyncError::NetworkFailure(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(rejected(response).await);
        }

        // Some deployments answer 201 with an empty body; that is still an
        // acceptance, just without the assigned ids.
        let body = response
            .bytes()
            .await
            .map_err(|e| SyncError::NetworkFailure(format!("failed to read response: {}", e)))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        match serde_json::from_slice::<Vec<LocationRecord>>(&body) {
            Ok(committed) => Ok(committed),
            Err(e) => {
                tracing::debug!(error = %e, "Insert response was not a row list; ignoring body");
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl LocationStore for RestLocationStore {
    /// Insert with retry logic
    ///
    /// Retries transient failures (network, 5xx, 429) with exponential backoff.
    async fn insert_batch(
        &self,
        records: &[LocationRecord],
    ) -> std::result::Result<Vec<LocationRecord>, SyncError> {
        let mut delay = self.retry_base_delay;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tracing::debug!(
                    "Retrying insert (attempt {}/{}), waiting {:?}",
                    attempt + 1,
                    self.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }

            match self.insert_once(records).await {
                Ok(committed) => return Ok(committed),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    tracing::warn!(error = %e, "Transient error inserting locations");
                }
                Err(e) => return Err(e),
            }
        }

        Err(SyncError::NetworkFailure("max retries exceeded".to_string()))
    }

    async fn fetch_all(&self) -> std::result::Result<Vec<LocationRecord>, SyncError> {
        let response = self
            .http_client
            .get(self.resource_url())
            .query(&[("select", "*"), ("order", "timestamp.asc")])
            .send()
            .await
            .map_err(|e| SyncError::NetworkFailure(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        response
            .json::<Vec<LocationRecord>>()
            .await
            .map_err(|e| SyncError::NetworkFailure(format!("failed to parse response: {}", e)))
    }

    async fn is_reachable(&self) -> bool {
        self.http_client
            .head(self.resource_url())
            .query(&[("limit", "1")])
            .send()
            .await
            .is_ok()
    }
}

async fn rejected(response: reqwest::Response) -> SyncError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    SyncError::RemoteRejected { status, body }
}
