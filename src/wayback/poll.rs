//! Polling a job handle until it resolves.
//!
//! Remote states are `pending`, `success` and `error`. Rate limiting (HTTP 429
//! or the in-band message below) and gateway errors are local retry
//! conditions layered on top. Every loop here is bounded except the 429 wait,
//! whose individual waits are capped.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{classify_status, pause, Fault, StatusClass, WaybackClient, WaybackError};
use crate::config::Config;
use crate::constants::WAYBACK_WEB_BASE;
use crate::store::parse_timestamp;

/// The service sometimes reports rate limiting as a job error instead of a
/// 429, e.g. `"You have already reached the limit of active sessions"` or
/// `status_ext: "error:too-many-daily-captures"`. Matching one of these means
/// "wait and try later", not "this URL failed".
static INBAND_RATE_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:rate[ -]?limit(?:ed)?|too[ -]many[ -](?:requests|captures|daily[ -]captures|concurrent[ -]captures)|limit of active sessions|user-session-limit)\b",
    )
    .unwrap()
});

/// Upper bound on `original_job_id` links followed when looking for outlinks.
const MAX_ORIGINAL_HOPS: usize = 3;

/// Whether an error message is the in-band rate-limit signal.
#[must_use]
pub fn is_inband_rate_limit(message: &str) -> bool {
    INBAND_RATE_LIMIT.is_match(message)
}

/// Public snapshot URL for a capture.
#[must_use]
pub fn archive_url_for(timestamp: &str, original_url: &str) -> String {
    format!("{WAYBACK_WEB_BASE}/{timestamp}/{original_url}")
}

/// A resolved capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub timestamp: String,
    pub original_url: String,
    pub archive_url: String,
    /// `(url, job_id)` pairs for outlinks the service queued with this job.
    pub outlinks: Vec<(String, String)>,
    /// Set when the service folded this capture into an earlier job. The
    /// outlink map, if any, lives on that job.
    pub original_job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Success(Snapshot),
    Error(Fault),
    /// Patience ran out, or the service asked us to back off. The URL may be
    /// submitted again.
    TimedOut,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    #[serde(default)]
    status: String,
    timestamp: Option<String>,
    original_url: Option<String>,
    message: Option<String>,
    status_ext: Option<String>,
    outlinks: Option<Value>,
    original_job_id: Option<String>,
}

/// Drives status queries for job handles.
#[derive(Debug, Clone)]
pub struct Poller {
    client: Arc<WaybackClient>,
    config: Config,
    shutdown: CancellationToken,
}

impl Poller {
    pub fn new(client: Arc<WaybackClient>, config: Config, shutdown: CancellationToken) -> Self {
        Self {
            client,
            config,
            shutdown,
        }
    }

    /// Query the job until it succeeds, fails, or the pending budget runs out.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, a body that is not JSON, or when
    /// shutdown interrupts a wait.
    pub async fn resolve(&self, job_id: &str) -> Result<PollOutcome, WaybackError> {
        info!(job_id = %job_id, "Getting wayback URL for job");

        let mut pending_backoff = self.config.poll_backoff();
        let mut rate_limit_backoff = self.config.submit_backoff();
        let mut transient_attempts = 0u32;

        loop {
            let response = self.client.request_status(job_id).await?;

            match classify_status(response.status) {
                StatusClass::Success => {}
                StatusClass::RateLimited => {
                    let wait = rate_limit_backoff.next_wait();
                    info!(job_id = %job_id, wait_ms = wait.as_millis(), "Hit rate limit, waiting");
                    pause(&self.shutdown, wait).await?;
                    continue;
                }
                StatusClass::Transient => {
                    transient_attempts += 1;
                    if transient_attempts > self.config.max_transient_retries {
                        warn!(job_id = %job_id, status = response.status, "Transient fault did not clear. Giving up");
                        return Ok(PollOutcome::Error(Fault::TransientExhausted {
                            status: response.status,
                            attempts: transient_attempts,
                        }));
                    }
                    warn!(job_id = %job_id, status = response.status, body = %response.body, "Transient server fault, waiting before retry");
                    pause(&self.shutdown, self.config.transient_wait).await?;
                    continue;
                }
                StatusClass::Hard | StatusClass::Unexpected => {
                    warn!(job_id = %job_id, status = response.status, body = %response.body, "Status request failed");
                    return Ok(PollOutcome::Error(Fault::Hard {
                        status: response.status,
                        body: response.body,
                    }));
                }
            }

            let payload: StatusPayload =
                serde_json::from_str(&response.body).map_err(|source| WaybackError::Decode {
                    body: response.body.clone(),
                    source,
                })?;

            match payload.status.as_str() {
                "pending" => {
                    let next = pending_backoff.peek();
                    if pending_backoff.elapsed() + next > self.config.poll_timeout {
                        warn!(
                            job_id = %job_id,
                            waited_ms = pending_backoff.elapsed().as_millis(),
                            "Job still pending after the poll budget. Skipping"
                        );
                        return Ok(PollOutcome::TimedOut);
                    }
                    let wait = pending_backoff.next_wait();
                    debug!(job_id = %job_id, wait_ms = wait.as_millis(), "Pending, waiting");
                    pause(&self.shutdown, wait).await?;
                }
                "success" => return Ok(success(job_id, payload, &response.body)),
                "error" => return self.remote_error(job_id, payload).await,
                other => {
                    warn!(job_id = %job_id, status = %other, body = %response.body, "Unexpected job status");
                    return Ok(PollOutcome::Error(Fault::Protocol {
                        detail: format!("unexpected status '{other}'"),
                        body: response.body,
                    }));
                }
            }
        }
    }

    /// Outlink handles recorded on the job a deduplicated capture points back
    /// to. Follows at most [`MAX_ORIGINAL_HOPS`] links and never revisits a job.
    ///
    /// # Errors
    ///
    /// Same as [`Poller::resolve`].
    pub async fn original_outlinks(
        &self,
        original_job_id: &str,
    ) -> Result<Vec<(String, String)>, WaybackError> {
        let mut seen = HashSet::new();
        let mut next = Some(original_job_id.to_string());

        while let Some(job_id) = next.take() {
            if seen.len() >= MAX_ORIGINAL_HOPS || !seen.insert(job_id.clone()) {
                warn!(job_id = %job_id, "Stopped following original jobs for outlinks");
                break;
            }
            debug!(job_id = %job_id, "Getting outlinks from original job");
            match self.resolve(&job_id).await? {
                PollOutcome::Success(snapshot) if !snapshot.outlinks.is_empty() => {
                    return Ok(snapshot.outlinks);
                }
                PollOutcome::Success(snapshot) => next = snapshot.original_job_id,
                PollOutcome::Error(fault) => {
                    warn!(job_id = %job_id, reason = %fault, "Original job has no usable outlinks");
                }
                PollOutcome::TimedOut => {
                    warn!(job_id = %job_id, "Original job did not resolve");
                }
            }
        }
        Ok(Vec::new())
    }

    async fn remote_error(
        &self,
        job_id: &str,
        payload: StatusPayload,
    ) -> Result<PollOutcome, WaybackError> {
        let message = payload.message.unwrap_or_default();
        let status_ext = payload.status_ext.unwrap_or_default();

        if is_inband_rate_limit(&message) || is_inband_rate_limit(&status_ext) {
            warn!(
                job_id = %job_id,
                message = %message,
                wait_secs = self.config.transient_wait.as_secs_f64(),
                "Rate limited while polling, dropping this attempt"
            );
            pause(&self.shutdown, self.config.transient_wait).await?;
            return Ok(PollOutcome::TimedOut);
        }

        error!(job_id = %job_id, message = %message, status_ext = %status_ext, "Could not get status");
        let message = if status_ext.is_empty() {
            message
        } else {
            format!("{status_ext}: {message}")
        };
        Ok(PollOutcome::Error(Fault::Remote { message }))
    }
}

fn success(job_id: &str, payload: StatusPayload, body: &str) -> PollOutcome {
    let (Some(timestamp), Some(original_url)) = (payload.timestamp, payload.original_url) else {
        error!(job_id = %job_id, body = %body, "Missing timestamp or original URL");
        return PollOutcome::Error(Fault::Protocol {
            detail: "success without timestamp or original_url".to_string(),
            body: body.to_string(),
        });
    };

    // The completed table rejects rows it cannot parse, so a bad timestamp
    // must fail this URL instead of reaching disk.
    if parse_timestamp(&timestamp).is_none() {
        error!(job_id = %job_id, timestamp = %timestamp, "Snapshot timestamp is not in wayback format");
        return PollOutcome::Error(Fault::Protocol {
            detail: format!("invalid snapshot timestamp '{timestamp}'"),
            body: body.to_string(),
        });
    }

    PollOutcome::Success(Snapshot {
        archive_url: archive_url_for(&timestamp, &original_url),
        outlinks: outlink_jobs(payload.outlinks.as_ref()),
        original_job_id: payload
            .original_job_id
            .filter(|id| !id.is_empty() && id.as_str() != job_id),
        timestamp,
        original_url,
    })
}

/// Outlinks come back as `{url: job_id}` when the job captured them and as a
/// plain list when an earlier job already had. Only the map form carries handles.
fn outlink_jobs(outlinks: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Object(map)) = outlinks else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(url, job_id)| job_id.as_str().map(|id| (url.clone(), id.to_string())))
        .collect()
}
