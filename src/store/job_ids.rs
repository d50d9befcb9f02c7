use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use super::StoreError;
use crate::canonical::{canonicalize, CanonicalUrl};

/// Read every `url,job_id` row. Later rows win, so a resubmitted URL maps to
/// its newest handle. A missing file is an empty table.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, or a row does not
/// have exactly two non-empty fields.
pub fn load_job_ids(path: &Path) -> Result<HashMap<CanonicalUrl, String>, StoreError> {
    let mut entries = HashMap::new();
    if !path.exists() {
        return Ok(entries);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| StoreError::csv(path, e))?;

    for record in reader.records() {
        let record = record.map_err(|e| StoreError::csv(path, e))?;
        let line = record.position().map_or(0, |p| p.line());
        match (record.get(0), record.get(1), record.len()) {
            (Some(url), Some(job_id), 2) if !url.is_empty() && !job_id.is_empty() => {
                entries.insert(canonicalize(url), job_id.to_string());
            }
            _ => {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    line,
                    reason: format!("expected url,job_id but found {} fields", record.len()),
                });
            }
        }
    }

    Ok(entries)
}

/// The job-id table: loaded entries plus an append handle on the file.
pub struct JobIdTable {
    path: PathBuf,
    entries: HashMap<CanonicalUrl, String>,
    writer: csv::Writer<File>,
}

impl JobIdTable {
    /// Load the table and open it for appending.
    ///
    /// # Errors
    ///
    /// See [`load_job_ids`]; also fails if the file cannot be opened for writing.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let entries = load_job_ids(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file),
        })
    }

    #[must_use]
    pub fn get(&self, url: &CanonicalUrl) -> Option<&str> {
        self.entries.get(url).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append one row and sync it to disk before updating the in-memory map.
    /// Writing the same pair twice only duplicates a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be written or synced.
    pub fn append(&mut self, url: &CanonicalUrl, job_id: &str) -> Result<(), StoreError> {
        self.writer
            .write_record([url.as_str(), job_id])
            .map_err(|e| StoreError::csv(&self.path, e))?;
        self.writer
            .flush()
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.writer
            .get_ref()
            .sync_data()
            .map_err(|e| StoreError::io(&self.path, e))?;

        self.entries.insert(url.clone(), job_id.to_string());
        Ok(())
    }
}

impl fmt::Debug for JobIdTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobIdTable")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}
