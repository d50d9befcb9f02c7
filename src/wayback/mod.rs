//! Save Page Now (SPN2) client and the two state machines built on it.

pub mod poll;
pub mod submit;

pub use poll::{archive_url_for, is_inband_rate_limit, PollOutcome, Poller, Snapshot};
pub use submit::{JobHandle, SubmitOutcome, Submitter};

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::canonical::CanonicalUrl;
use crate::config::Config;
use crate::constants::{ARCHIVER_USER_AGENT, HARD_STATUS_CODES, TRANSIENT_STATUS_CODES};
use crate::store::StoreError;

/// Failures that escape a single submission or poll. The scheduler catches
/// these per URL; none of them abort the run.
#[derive(Debug, Error)]
pub enum WaybackError {
    #[error("request to the archive service failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("undecodable response from the archive service: {source}; body: {body}")]
    Decode {
        body: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to record job handle: {0}")]
    Store(#[from] StoreError),
    #[error("invalid archive service credentials: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("interrupted by shutdown")]
    Cancelled,
}

/// Why a URL was given up on. Every abandonment carries one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("HTTP {status} will not heal on retry: {body}")]
    Hard { status: u16, body: String },
    #[error("HTTP {status} persisted after {attempts} attempts")]
    TransientExhausted { status: u16, attempts: u32 },
    #[error("archive service broke its response contract ({detail}): {body}")]
    Protocol { detail: String, body: String },
    #[error("archive service reported an error: {message}")]
    Remote { message: String },
}

/// How a response status steers the retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// HTTP 429. Retried with a growing wait.
    RateLimited,
    /// Gateway errors. Retried after a fixed wait, a bounded number of times.
    Transient,
    /// Auth and connection faults. Never retried.
    Hard,
    /// Any other non-2xx status, 404 included. Never retried.
    Unexpected,
}

#[must_use]
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        429 => StatusClass::RateLimited,
        s if TRANSIENT_STATUS_CODES.contains(&s) => StatusClass::Transient,
        s if HARD_STATUS_CODES.contains(&s) => StatusClass::Hard,
        _ => StatusClass::Unexpected,
    }
}

/// Status and body of one API call.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

/// HTTP client for the save and status endpoints.
#[derive(Debug, Clone)]
pub struct WaybackClient {
    client: Client,
    endpoint: String,
    freshness_hint: String,
}

impl WaybackClient {
    /// Build a client from the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials are not valid header text or the
    /// HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, WaybackError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let (Some(access), Some(secret)) =
            (&config.wayback_access_key, &config.wayback_secret_key)
        {
            let mut value = HeaderValue::from_str(&format!("LOW {access}:{secret}"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(config.http_timeout)
            .connect_timeout(Duration::from_secs(15))
            .user_agent(ARCHIVER_USER_AGENT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.wayback_endpoint.clone(),
            freshness_hint: config.freshness_hint(),
        })
    }

    /// Ask the service to archive a URL.
    ///
    /// # Errors
    ///
    /// Returns an error on connection failure or an unreadable body.
    pub async fn request_save(
        &self,
        url: &CanonicalUrl,
        capture_outlinks: bool,
    ) -> Result<ApiResponse, WaybackError> {
        debug!(url = %url, capture_outlinks, "Submitting URL to Wayback Machine");

        let form = [
            ("url", url.as_str()),
            ("if_not_archived_within", self.freshness_hint.as_str()),
            ("capture_outlinks", if capture_outlinks { "1" } else { "0" }),
        ];
        let response = self.client.post(&self.endpoint).form(&form).send().await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(ApiResponse { status, body })
    }

    /// Query the state of a save job.
    ///
    /// # Errors
    ///
    /// Returns an error on connection failure or an unreadable body.
    pub async fn request_status(&self, job_id: &str) -> Result<ApiResponse, WaybackError> {
        let status_url = format!("{}status/{}", self.endpoint, urlencoding::encode(job_id));
        let response = self.client.get(&status_url).send().await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(ApiResponse { status, body })
    }
}

/// Sleep unless shutdown is requested first.
pub(crate) async fn pause(shutdown: &CancellationToken, wait: Duration) -> Result<(), WaybackError> {
    tokio::select! {
        () = tokio::time::sleep(wait) => Ok(()),
        () = shutdown.cancelled() => Err(WaybackError::Cancelled),
    }
}
