//! Chunked submit-then-poll scheduling of a candidate list.
//!
//! Query URLs run first: they are submitted with outlink capture, and the
//! outlink handles they return are written to the job-id table so that the
//! link URLs later in the run reuse them instead of submitting again.
//! Each chunk is fully submitted and then fully polled before the next one
//! starts, which caps outstanding remote jobs at one chunk.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::candidates::{CandidateUrl, UrlKind};
use crate::canonical::{canonicalize, strip_controls, CanonicalUrl};
use crate::config::Config;
use crate::store::StateStore;
use crate::wayback::{
    JobHandle, PollOutcome, Poller, Snapshot, SubmitOutcome, Submitter, WaybackClient,
    WaybackError,
};
use crate::writer::ResultWriter;

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub candidates: usize,
    pub skipped_invalid: usize,
    pub skipped_fresh: usize,
    pub submitted: usize,
    pub reused: usize,
    pub resubmitted: usize,
    pub outlinks_seeded: usize,
    pub archived: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub interrupted: usize,
}

/// URLs left to work on after canonicalization, dedup and the freshness filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub queries: Vec<CanonicalUrl>,
    pub links: Vec<CanonicalUrl>,
}

#[derive(Debug)]
struct Job {
    url: CanonicalUrl,
    kind: UrlKind,
    handle: JobHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobResult {
    Archived,
    Failed,
    TimedOut,
    Interrupted,
}

#[derive(Debug)]
struct JobReport {
    result: JobResult,
    resubmitted: usize,
    outlinks_seeded: usize,
}

impl JobReport {
    const fn new(result: JobResult, resubmitted: usize) -> Self {
        Self {
            result,
            resubmitted,
            outlinks_seeded: 0,
        }
    }
}

pub struct BatchScheduler {
    config: Config,
    store: Arc<StateStore>,
    submitter: Submitter,
    poller: Poller,
    shutdown: CancellationToken,
}

impl BatchScheduler {
    pub fn new(
        config: Config,
        client: Arc<WaybackClient>,
        store: Arc<StateStore>,
        shutdown: CancellationToken,
    ) -> Self {
        let submitter = Submitter::new(
            Arc::clone(&client),
            Arc::clone(&store),
            config.clone(),
            shutdown.clone(),
        );
        let poller = Poller::new(client, config.clone(), shutdown.clone());
        Self {
            config,
            store,
            submitter,
            poller,
            shutdown,
        }
    }

    /// Canonicalize, dedup and filter the candidates, then split them by kind.
    ///
    /// A URL listed as both kinds is treated as a query. Non-HTTP URLs and
    /// URLs completed inside the freshness window are dropped.
    pub fn plan(&self, candidates: &[CandidateUrl], summary: &mut RunSummary) -> Plan {
        summary.candidates += candidates.len();

        let mut order = Vec::new();
        let mut kinds: HashMap<CanonicalUrl, UrlKind> = HashMap::new();

        for candidate in candidates {
            if !is_web_url(&candidate.raw) {
                warn!(url = %candidate.raw, "Skipping non-HTTP URL");
                summary.skipped_invalid += 1;
                continue;
            }
            let url = canonicalize(&candidate.raw);
            match kinds.get_mut(&url) {
                Some(kind) => {
                    if candidate.kind == UrlKind::Query {
                        *kind = UrlKind::Query;
                    }
                }
                None => {
                    kinds.insert(url.clone(), candidate.kind);
                    order.push(url);
                }
            }
        }

        let mut plan = Plan::default();
        for url in order {
            if let Some(done) = self.store.fresh_completion(&url) {
                info!(url = %url, archive_url = %done.archive_url, "Already archived recently, skipping");
                summary.skipped_fresh += 1;
                continue;
            }
            match kinds[&url] {
                UrlKind::Query => plan.queries.push(url),
                UrlKind::Link => plan.links.push(url),
            }
        }
        plan
    }

    /// Archive every candidate that is not already fresh in the completed table.
    ///
    /// Per-URL failures are logged and counted, never returned. The result
    /// writer is always drained and flushed before this returns, including
    /// after a shutdown request.
    ///
    /// # Errors
    ///
    /// Returns an error only if the completed table cannot be written.
    pub async fn run(&self, candidates: &[CandidateUrl]) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let plan = self.plan(candidates, &mut summary);
        info!(
            queries = plan.queries.len(),
            links = plan.links.len(),
            skipped_fresh = summary.skipped_fresh,
            "Planned run"
        );

        let writer = ResultWriter::spawn(
            self.store
                .completed_log()
                .context("Failed to open completed table")?,
        );

        let outcome = self.run_plan(&plan, &writer, &mut summary).await;
        let written = writer.finish().await?;
        outcome?;

        info!(
            candidates = summary.candidates,
            skipped_fresh = summary.skipped_fresh,
            skipped_invalid = summary.skipped_invalid,
            submitted = summary.submitted,
            reused = summary.reused,
            resubmitted = summary.resubmitted,
            outlinks_seeded = summary.outlinks_seeded,
            archived = summary.archived,
            written,
            failed = summary.failed,
            timed_out = summary.timed_out,
            interrupted = summary.interrupted,
            "Run finished"
        );
        Ok(summary)
    }

    async fn run_plan(
        &self,
        plan: &Plan,
        writer: &ResultWriter,
        summary: &mut RunSummary,
    ) -> Result<()> {
        for (urls, kind) in [(&plan.queries, UrlKind::Query), (&plan.links, UrlKind::Link)] {
            info!(kind = %kind, count = urls.len(), "Archiving URLs");
            for (index, chunk) in urls.chunks(self.config.chunk_size).enumerate() {
                if self.shutdown.is_cancelled() {
                    summary.interrupted += remaining(urls.len(), index, self.config.chunk_size);
                    if kind == UrlKind::Query {
                        summary.interrupted += plan.links.len();
                    }
                    warn!(kind = %kind, "Shutdown requested, not starting further chunks");
                    return Ok(());
                }
                let start = index * self.config.chunk_size;
                info!(
                    kind = %kind,
                    "Now getting items {} through {} of {}",
                    start,
                    start + chunk.len(),
                    urls.len()
                );
                self.run_chunk(chunk, kind, writer, summary).await?;
            }
        }
        Ok(())
    }

    async fn run_chunk(
        &self,
        chunk: &[CanonicalUrl],
        kind: UrlKind,
        writer: &ResultWriter,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mut jobs = Vec::with_capacity(chunk.len());

        for (position, url) in chunk.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                summary.interrupted += chunk.len() - position;
                break;
            }
            match self.submitter.submit(url, kind.captures_outlinks()).await {
                Ok(SubmitOutcome::Accepted(handle)) => {
                    if handle.reused {
                        summary.reused += 1;
                    } else {
                        summary.submitted += 1;
                    }
                    jobs.push(Job {
                        url: url.clone(),
                        kind,
                        handle,
                    });
                }
                Ok(SubmitOutcome::Abandoned(fault)) => {
                    warn!(url = %url, reason = %fault, "Abandoned archive request");
                    summary.failed += 1;
                }
                Err(WaybackError::Cancelled) => {
                    warn!(url = %url, "Archive request interrupted by shutdown");
                    summary.interrupted += chunk.len() - position;
                    break;
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Archive request failed");
                    summary.failed += 1;
                }
            }
        }

        if self.shutdown.is_cancelled() {
            // Handles are already in the job-id table; the next run polls them.
            summary.interrupted += jobs.len();
            return Ok(());
        }

        let reports: Vec<Result<JobReport>> = stream::iter(jobs)
            .map(|job| self.drive(job, writer))
            .buffer_unordered(self.config.poll_concurrency)
            .collect()
            .await;

        for report in reports {
            let report = report?;
            summary.resubmitted += report.resubmitted;
            summary.outlinks_seeded += report.outlinks_seeded;
            match report.result {
                JobResult::Archived => summary.archived += 1,
                JobResult::Failed => summary.failed += 1,
                JobResult::TimedOut => summary.timed_out += 1,
                JobResult::Interrupted => summary.interrupted += 1,
            }
        }
        Ok(())
    }

    /// Poll one job to a final outcome, resubmitting when the handle gave up.
    async fn drive(&self, job: Job, writer: &ResultWriter) -> Result<JobReport> {
        let Job {
            url,
            kind,
            mut handle,
        } = job;
        let mut resubmitted = 0usize;

        loop {
            let outcome = match self.poller.resolve(&handle.job_id).await {
                Ok(outcome) => outcome,
                Err(WaybackError::Cancelled) => {
                    warn!(url = %url, job_id = %handle.job_id, "Polling interrupted by shutdown");
                    return Ok(JobReport::new(JobResult::Interrupted, resubmitted));
                }
                Err(e) => {
                    warn!(url = %url, job_id = %handle.job_id, error = %e, "Status check failed");
                    return Ok(JobReport::new(JobResult::Failed, resubmitted));
                }
            };

            let retry = match &outcome {
                PollOutcome::TimedOut => true,
                PollOutcome::Error(_) => handle.reused,
                PollOutcome::Success(_) => false,
            };
            if retry && resubmitted < self.config.max_resubmits as usize {
                resubmitted += 1;
                info!(
                    url = %url,
                    stale_job_id = %handle.job_id,
                    attempt = resubmitted,
                    "Job gave up, requesting a new one"
                );
                match self.submitter.resubmit(&url, false).await {
                    Ok(SubmitOutcome::Accepted(fresh)) => {
                        handle = fresh;
                        continue;
                    }
                    Ok(SubmitOutcome::Abandoned(fault)) => {
                        warn!(url = %url, reason = %fault, "Abandoned archive request");
                        return Ok(JobReport::new(JobResult::Failed, resubmitted));
                    }
                    Err(WaybackError::Cancelled) => {
                        warn!(url = %url, "Archive request interrupted by shutdown");
                        return Ok(JobReport::new(JobResult::Interrupted, resubmitted));
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "Archive request failed");
                        return Ok(JobReport::new(JobResult::Failed, resubmitted));
                    }
                }
            }

            let outlinks_seeded = match &outcome {
                PollOutcome::Success(snapshot) => {
                    self.seed_outlinks(&url, kind, snapshot).await
                }
                _ => 0,
            };

            writer.record(&url, &outcome).await?;

            let result = match outcome {
                PollOutcome::Success(_) => JobResult::Archived,
                PollOutcome::Error(_) => JobResult::Failed,
                PollOutcome::TimedOut => JobResult::TimedOut,
            };
            return Ok(JobReport {
                result,
                resubmitted,
                outlinks_seeded,
            });
        }
    }

    /// Record outlink handles for URLs that have none, so later chunks reuse them.
    ///
    /// A deduplicated query capture carries no outlink map of its own; the map
    /// is read from the earlier job it points to.
    async fn seed_outlinks(
        &self,
        source: &CanonicalUrl,
        kind: UrlKind,
        snapshot: &Snapshot,
    ) -> usize {
        let outlinks = match &snapshot.original_job_id {
            Some(original) if kind == UrlKind::Query && snapshot.outlinks.is_empty() => {
                info!(url = %source, original_job_id = %original, "Capture was deduplicated, reading outlinks from original job");
                match self.poller.original_outlinks(original).await {
                    Ok(outlinks) => outlinks,
                    Err(e) => {
                        warn!(url = %source, original_job_id = %original, error = %e, "Failed to read outlinks from original job");
                        Vec::new()
                    }
                }
            }
            _ => snapshot.outlinks.clone(),
        };

        let mut seeded = 0;
        for (raw, job_id) in &outlinks {
            let url = canonicalize(raw);
            if self.store.fresh_completion(&url).is_some() {
                continue;
            }
            match self.store.record_job_id_if_absent(&url, job_id).await {
                Ok(true) => seeded += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(url = %url, job_id = %job_id, error = %e, "Failed to record outlink job id");
                }
            }
        }
        if seeded > 0 {
            info!(url = %source, seeded, "Recorded outlink job ids");
        }
        seeded
    }
}

fn is_web_url(raw: &str) -> bool {
    Url::parse(strip_controls(raw)).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

fn remaining(total: usize, chunk_index: usize, chunk_size: usize) -> usize {
    total.saturating_sub(chunk_index * chunk_size)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::store::{CompletedLog, CompletedRecord};

    fn scheduler_with_completed(dir: &std::path::Path, completed: &[&str]) -> BatchScheduler {
        let completed_path = dir.join("wayback_urls.csv");
        let mut log = CompletedLog::open(&completed_path).unwrap();
        let now = Utc::now().format("%Y%m%d%H%M%S").to_string();
        for url in completed {
            let url = canonicalize(url);
            log.append(&CompletedRecord {
                timestamp: now.clone(),
                archive_url: format!("http://web.archive.org/web/{now}/{url}"),
                url,
            })
            .unwrap();
        }
        drop(log);

        let config = Config::for_testing();
        let store = StateStore::open(
            &dir.join("job_ids.csv"),
            &completed_path,
            Duration::from_secs(3600),
            Utc::now(),
        )
        .unwrap();
        let client = WaybackClient::new(&config).unwrap();
        BatchScheduler::new(
            config,
            Arc::new(client),
            Arc::new(store),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_plan_dedups_and_prefers_query() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with_completed(dir.path(), &[]);
        let candidates = vec![
            CandidateUrl::new("https://example.com/a?x=1 ", UrlKind::Link),
            CandidateUrl::new("https://example.com/a?x=1%20", UrlKind::Query),
            CandidateUrl::new("https://example.com/b", UrlKind::Link),
            CandidateUrl::new("https://example.com/b", UrlKind::Link),
        ];

        let mut summary = RunSummary::default();
        let plan = scheduler.plan(&candidates, &mut summary);

        assert_eq!(plan.queries, vec![canonicalize("https://example.com/a?x=1%20")]);
        assert_eq!(plan.links, vec![canonicalize("https://example.com/b")]);
        assert_eq!(summary.candidates, 4);
    }

    #[test]
    fn test_plan_skips_fresh_and_non_web() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with_completed(dir.path(), &["https://example.com/done"]);
        let candidates = vec![
            CandidateUrl::new("https://example.com/done", UrlKind::Link),
            CandidateUrl::new("javascript:void(0)", UrlKind::Link),
            CandidateUrl::new("https://example.com/new", UrlKind::Link),
        ];

        let mut summary = RunSummary::default();
        let plan = scheduler.plan(&candidates, &mut summary);

        assert!(plan.queries.is_empty());
        assert_eq!(plan.links, vec![canonicalize("https://example.com/new")]);
        assert_eq!(summary.skipped_fresh, 1);
        assert_eq!(summary.skipped_invalid, 1);
    }

    #[test]
    fn test_remaining() {
        assert_eq!(remaining(40, 2, 15), 10);
        assert_eq!(remaining(40, 3, 15), 0);
    }
}
