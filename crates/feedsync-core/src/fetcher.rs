use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::error::{FeedSyncError, Result};
use crate::status::StatusDocument;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("cannot contact engine for system feeds list status: {0}")]
    Network(#[source] reqwest::Error),

    #[error("got bad response httpcode={code} data={body}")]
    BadStatus { code: u16, body: String },

    #[error("malformed body from system feeds list: {0}")]
    MalformedBody(#[source] serde_json::Error),
}

impl FetchError {
    /// A non-200 answer means the engine is up but not ready; keep polling.
    /// Transport failures and unparseable bodies are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::BadStatus { .. })
    }
}

// ---------------------------------------------------------------------------
// FeedsClient
// ---------------------------------------------------------------------------

/// Blocking client for the engine's `/system/feeds` endpoint.
pub struct FeedsClient {
    http: Client,
    base_url: String,
    user: String,
    password: String,
}

impl FeedsClient {
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        request_timeout: Duration,
        verify_tls: bool,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| FeedSyncError::Fetch(FetchError::Network(e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            password: password.into(),
        })
    }

    pub fn from_config(engine: &EngineConfig) -> Result<Self> {
        Self::new(
            engine.url.clone(),
            engine.user.clone(),
            engine.password.clone(),
            Duration::from_secs(engine.request_timeout_secs),
            engine.verify_tls,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn feeds_url(&self) -> String {
        format!("{}/system/feeds", self.base_url)
    }

    /// Endpoint that starts a feed sync when POSTed to.
    pub fn sync_url(&self) -> String {
        format!("{}?sync=true", self.feeds_url())
    }

    /// One `GET /system/feeds`, parsed.
    pub fn fetch_status(&self) -> std::result::Result<StatusDocument, FetchError> {
        let url = self.feeds_url();
        tracing::debug!(url = %url, "fetching feed status");

        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .map_err(FetchError::Network)?;

        let status = resp.status();
        let body = resp.text().map_err(FetchError::Network)?;

        if status != StatusCode::OK {
            return Err(FetchError::BadStatus {
                code: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(FetchError::MalformedBody)
    }
}
