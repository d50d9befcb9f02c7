//! Append-only CSV tables that carry work across runs.
//!
//! Two tables live on disk:
//!
//! - the job-id table (`url,job_id`), which never expires: a known handle is
//!   reused instead of submitting the URL again;
//! - the completed table (`timestamp,url,archive_url`), which is the dedup
//!   boundary and also the run's output. Staleness is decided when reading,
//!   nothing is ever rewritten or compacted.

mod completed;
mod job_ids;

pub use completed::{
    load_completed, parse_timestamp, CompletedEntry, CompletedLog, CompletedRecord,
};
pub use job_ids::{load_job_ids, JobIdTable};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::canonical::CanonicalUrl;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read or write CSV in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("corrupt record in {} at line {line}: {reason}", path.display())]
    Corrupt {
        path: PathBuf,
        line: u64,
        reason: String,
    },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Process-wide view of both tables.
///
/// Loaded once at startup. The job-id table is updated in memory and on disk
/// as handles are obtained; the completed snapshot is read-only for the run
/// (new completions are appended through [`CompletedLog`]).
#[derive(Debug)]
pub struct StateStore {
    job_ids: Mutex<JobIdTable>,
    completed: HashMap<CanonicalUrl, CompletedEntry>,
    completed_path: PathBuf,
}

impl StateStore {
    /// Load both tables.
    ///
    /// Completed records older than `freshness_window` relative to `now` are
    /// left out of the in-memory snapshot.
    ///
    /// # Errors
    ///
    /// Fails if either file exists but cannot be read or holds a corrupt row.
    /// Treating an unreadable table as empty would resubmit everything.
    pub fn open(
        job_ids_path: &Path,
        completed_path: &Path,
        freshness_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let job_ids = JobIdTable::open(job_ids_path)?;
        let completed = load_completed(completed_path, freshness_window, now)?;

        info!(
            job_ids = job_ids.len(),
            fresh_completed = completed.len(),
            "Loaded persisted state"
        );

        Ok(Self {
            job_ids: Mutex::new(job_ids),
            completed,
            completed_path: completed_path.to_path_buf(),
        })
    }

    /// The known job handle for a URL, if any.
    pub async fn job_id(&self, url: &CanonicalUrl) -> Option<String> {
        self.job_ids.lock().await.get(url).map(str::to_string)
    }

    /// Durably record a handle for a URL, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written to disk.
    pub async fn record_job_id(&self, url: &CanonicalUrl, job_id: &str) -> Result<(), StoreError> {
        self.job_ids.lock().await.append(url, job_id)
    }

    /// Record a handle only if the URL has none yet. Returns whether it was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written to disk.
    pub async fn record_job_id_if_absent(
        &self,
        url: &CanonicalUrl,
        job_id: &str,
    ) -> Result<bool, StoreError> {
        let mut table = self.job_ids.lock().await;
        if table.get(url).is_some() {
            return Ok(false);
        }
        table.append(url, job_id)?;
        Ok(true)
    }

    /// The completion for a URL if it happened inside the freshness window.
    #[must_use]
    pub fn fresh_completion(&self, url: &CanonicalUrl) -> Option<&CompletedEntry> {
        self.completed.get(url)
    }

    /// Open an appender on the completed table.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for appending.
    pub fn completed_log(&self) -> Result<CompletedLog, StoreError> {
        CompletedLog::open(&self.completed_path)
    }
}
