//! Single writer task for the completed table.
//!
//! Pollers may run concurrently, so completions go through a channel to one
//! blocking task that owns the file handle. Dropping every sender (via
//! [`ResultWriter::finish`]) drains the channel and flushes the file.

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::canonical::CanonicalUrl;
use crate::store::{CompletedLog, CompletedRecord, StoreError};
use crate::wayback::PollOutcome;

const CHANNEL_CAPACITY: usize = 64;

pub struct ResultWriter {
    tx: mpsc::Sender<CompletedRecord>,
    task: JoinHandle<Result<usize, StoreError>>,
}

impl ResultWriter {
    /// Start the writer task on top of an open completed-table appender.
    #[must_use]
    pub fn spawn(mut log: CompletedLog) -> Self {
        let (tx, mut rx) = mpsc::channel::<CompletedRecord>(CHANNEL_CAPACITY);

        let task = tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
            let mut written = 0usize;
            while let Some(record) = rx.blocking_recv() {
                log.append(&record)?;
                debug!(url = %record.url, archive_url = %record.archive_url, "Recorded snapshot");
                written += 1;
            }
            log.flush()?;
            Ok(written)
        });

        Self { tx, task }
    }

    /// Record the outcome for one URL. Successes are appended to the completed
    /// table; everything else is only logged, which leaves the URL eligible
    /// for a later run. Returns whether a record was appended.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer task has stopped (its own error is
    /// reported by [`ResultWriter::finish`]).
    pub async fn record(&self, url: &CanonicalUrl, outcome: &PollOutcome) -> Result<bool> {
        match outcome {
            PollOutcome::Success(snapshot) => {
                let record = CompletedRecord {
                    timestamp: snapshot.timestamp.clone(),
                    url: url.clone(),
                    archive_url: snapshot.archive_url.clone(),
                };
                self.tx
                    .send(record)
                    .await
                    .map_err(|_| anyhow!("Result writer stopped before {url} could be recorded"))?;
                Ok(true)
            }
            PollOutcome::Error(fault) => {
                warn!(url = %url, reason = %fault, "Did not get a wayback URL");
                Ok(false)
            }
            PollOutcome::TimedOut => {
                warn!(url = %url, "Gave up waiting for a wayback URL");
                Ok(false)
            }
        }
    }

    /// Close the channel, wait for pending records to hit disk, and return how
    /// many were written.
    ///
    /// # Errors
    ///
    /// Returns an error if any append or the final flush failed.
    pub async fn finish(self) -> Result<usize> {
        drop(self.tx);
        let written = self
            .task
            .await
            .context("Result writer task panicked")?
            .context("Failed to write completed table")?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::canonical::canonicalize;
    use crate::store::load_completed;
    use crate::wayback::{Fault, Snapshot};

    fn snapshot(timestamp: &str, url: &str) -> PollOutcome {
        PollOutcome::Success(Snapshot {
            timestamp: timestamp.to_string(),
            original_url: url.to_string(),
            archive_url: crate::wayback::archive_url_for(timestamp, url),
            outlinks: Vec::new(),
            original_job_id: None,
        })
    }

    #[tokio::test]
    async fn test_only_successes_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wayback_urls.csv");
        let writer = ResultWriter::spawn(CompletedLog::open(&path).unwrap());

        let ok = canonicalize("https://example.com/ok");
        let failed = canonicalize("https://example.com/failed");
        let slow = canonicalize("https://example.com/slow");
        let now = Utc::now().format("%Y%m%d%H%M%S").to_string();

        assert!(writer.record(&ok, &snapshot(&now, ok.as_str())).await.unwrap());
        assert!(!writer
            .record(
                &failed,
                &PollOutcome::Error(Fault::Remote {
                    message: "nope".to_string()
                })
            )
            .await
            .unwrap());
        assert!(!writer.record(&slow, &PollOutcome::TimedOut).await.unwrap());
        assert_eq!(writer.finish().await.unwrap(), 1);

        let completed = load_completed(&path, Duration::from_secs(3600), Utc::now()).unwrap();
        assert_eq!(completed.len(), 1);
        assert!(completed.contains_key(&ok));
    }
}
