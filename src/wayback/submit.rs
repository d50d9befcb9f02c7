//! Turning a URL into a job handle.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{classify_status, pause, Fault, StatusClass, WaybackClient, WaybackError};
use crate::canonical::CanonicalUrl;
use crate::config::Config;
use crate::store::StateStore;

/// A save job the service accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    /// Taken from the job-id table instead of a new submission.
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(JobHandle),
    Abandoned(Fault),
}

#[derive(Debug, Deserialize)]
struct SaveResponse {
    job_id: Option<String>,
}

/// Obtains job handles, reusing known ones and submitting otherwise.
#[derive(Debug, Clone)]
pub struct Submitter {
    client: Arc<WaybackClient>,
    store: Arc<StateStore>,
    config: Config,
    shutdown: CancellationToken,
}

impl Submitter {
    pub fn new(
        client: Arc<WaybackClient>,
        store: Arc<StateStore>,
        config: Config,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            store,
            config,
            shutdown,
        }
    }

    /// Return the URL's handle from the job-id table, or submit it.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, if the new handle cannot be
    /// recorded, or if shutdown interrupts a wait.
    pub async fn submit(
        &self,
        url: &CanonicalUrl,
        capture_outlinks: bool,
    ) -> Result<SubmitOutcome, WaybackError> {
        if let Some(job_id) = self.store.job_id(url).await {
            debug!(url = %url, job_id = %job_id, "Job id already known, not resubmitting");
            return Ok(SubmitOutcome::Accepted(JobHandle {
                job_id,
                reused: true,
            }));
        }
        self.resubmit(url, capture_outlinks).await
    }

    /// Submit the URL regardless of any known handle. The new handle replaces
    /// the old one in the job-id table.
    ///
    /// # Errors
    ///
    /// Same as [`Submitter::submit`].
    pub async fn resubmit(
        &self,
        url: &CanonicalUrl,
        capture_outlinks: bool,
    ) -> Result<SubmitOutcome, WaybackError> {
        info!(url = %url, capture_outlinks, "Sending archive request");

        let mut rate_limit_backoff = self.config.submit_backoff();
        let mut transient_attempts = 0u32;

        loop {
            let response = self.client.request_save(url, capture_outlinks).await?;

            match classify_status(response.status) {
                StatusClass::Success => return self.accept(url, &response.body).await,
                StatusClass::RateLimited => {
                    let wait = rate_limit_backoff.next_wait();
                    info!(url = %url, wait_ms = wait.as_millis(), "Hit rate limit, waiting");
                    pause(&self.shutdown, wait).await?;
                }
                StatusClass::Transient => {
                    transient_attempts += 1;
                    if transient_attempts > self.config.max_transient_retries {
                        warn!(url = %url, status = response.status, body = %response.body, "Transient fault did not clear. Giving up");
                        return Ok(SubmitOutcome::Abandoned(Fault::TransientExhausted {
                            status: response.status,
                            attempts: transient_attempts,
                        }));
                    }
                    warn!(
                        url = %url,
                        status = response.status,
                        attempt = transient_attempts,
                        wait_secs = self.config.transient_wait.as_secs_f64(),
                        "Transient server fault, waiting before retry"
                    );
                    pause(&self.shutdown, self.config.transient_wait).await?;
                }
                StatusClass::Hard => {
                    warn!(url = %url, status = response.status, body = %response.body, "Auth or connection fault. Giving up");
                    return Ok(SubmitOutcome::Abandoned(Fault::Hard {
                        status: response.status,
                        body: response.body,
                    }));
                }
                StatusClass::Unexpected => {
                    warn!(url = %url, status = response.status, body = %response.body, "Archive request failed");
                    return Ok(SubmitOutcome::Abandoned(Fault::Hard {
                        status: response.status,
                        body: response.body,
                    }));
                }
            }
        }
    }

    async fn accept(&self, url: &CanonicalUrl, body: &str) -> Result<SubmitOutcome, WaybackError> {
        let job_id = serde_json::from_str::<SaveResponse>(body)
            .ok()
            .and_then(|r| r.job_id)
            .filter(|id| !id.is_empty());

        let Some(job_id) = job_id else {
            warn!(url = %url, body = %body, "Should have a job id but none was returned");
            return Ok(SubmitOutcome::Abandoned(Fault::Protocol {
                detail: "missing job_id".to_string(),
                body: body.to_string(),
            }));
        };

        // Persist before handing out so a crash cannot lose the job.
        self.store.record_job_id(url, &job_id).await?;
        info!(url = %url, job_id = %job_id, "Archive job accepted");

        Ok(SubmitOutcome::Accepted(JobHandle {
            job_id,
            reused: false,
        }))
    }
}
