use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

use super::StoreError;
use crate::canonical::{canonicalize, CanonicalUrl};
use crate::constants::WAYBACK_TIMESTAMP_FORMAT;

/// One row of the completed table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRecord {
    /// Snapshot timestamp as assigned by the archive service.
    pub timestamp: String,
    pub url: CanonicalUrl,
    pub archive_url: String,
}

/// What the in-memory completed table keeps per URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedEntry {
    pub timestamp: String,
    pub archive_url: String,
}

/// Parse a snapshot timestamp (`YYYYmmddHHMMSS`, UTC).
#[must_use]
pub fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(timestamp, WAYBACK_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Read the completed table, keeping only rows archived within
/// `freshness_window` of `now`. Older rows stay on disk untouched. When a URL
/// appears more than once the newest timestamp wins.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, a row does not have
/// three fields, or a timestamp does not parse.
pub fn load_completed(
    path: &Path,
    freshness_window: Duration,
    now: DateTime<Utc>,
) -> Result<HashMap<CanonicalUrl, CompletedEntry>, StoreError> {
    let mut entries: HashMap<CanonicalUrl, CompletedEntry> = HashMap::new();
    if !path.exists() {
        return Ok(entries);
    }

    let window = chrono::Duration::from_std(freshness_window).unwrap_or(chrono::Duration::MAX);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| StoreError::csv(path, e))?;

    for record in reader.records() {
        let record = record.map_err(|e| StoreError::csv(path, e))?;
        let line = record.position().map_or(0, |p| p.line());
        let corrupt = |reason: String| StoreError::Corrupt {
            path: path.to_path_buf(),
            line,
            reason,
        };

        if record.len() != 3 {
            return Err(corrupt(format!(
                "expected timestamp,url,archive_url but found {} fields",
                record.len()
            )));
        }
        let (timestamp, url, archive_url) = (&record[0], &record[1], &record[2]);
        let archived_at = parse_timestamp(timestamp)
            .ok_or_else(|| corrupt(format!("invalid timestamp '{timestamp}'")))?;

        if now.signed_duration_since(archived_at) > window {
            continue;
        }

        let url = canonicalize(url);
        let newer = entries
            .get(&url)
            .map_or(true, |existing| existing.timestamp.as_str() <= timestamp);
        if newer {
            entries.insert(
                url,
                CompletedEntry {
                    timestamp: timestamp.to_string(),
                    archive_url: archive_url.to_string(),
                },
            );
        }
    }

    Ok(entries)
}

/// Append handle on the completed table.
pub struct CompletedLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CompletedLog {
    /// Open the completed table for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file),
        })
    }

    /// Append one record and sync it to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written or synced.
    pub fn append(&mut self, record: &CompletedRecord) -> Result<(), StoreError> {
        self.writer
            .write_record([
                record.timestamp.as_str(),
                record.url.as_str(),
                record.archive_url.as_str(),
            ])
            .map_err(|e| StoreError::csv(&self.path, e))?;
        self.flush()
    }

    /// Flush buffered rows and sync the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or sync fails.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.writer
            .flush()
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.writer
            .get_ref()
            .sync_data()
            .map_err(|e| StoreError::io(&self.path, e))
    }
}

impl fmt::Debug for CompletedLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletedLog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
