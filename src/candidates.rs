//! Candidate URLs handed over by the result-page extraction step.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

/// Where a candidate URL came from on the result page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrlKind {
    /// The result page itself. Archived with outlink capture.
    Query,
    /// A link found on a result page.
    Link,
}

impl UrlKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Link => "link",
        }
    }

    /// Whether the archive service should also capture the page's outlinks.
    #[must_use]
    pub const fn captures_outlinks(self) -> bool {
        matches!(self, Self::Query)
    }
}

impl fmt::Display for UrlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UrlKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "query" => Ok(Self::Query),
            "link" => Ok(Self::Link),
            other => bail!("unknown url kind '{other}', expected 'query' or 'link'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateUrl {
    pub raw: String,
    pub kind: UrlKind,
}

impl CandidateUrl {
    pub fn new(raw: impl Into<String>, kind: UrlKind) -> Self {
        Self {
            raw: raw.into(),
            kind,
        }
    }
}

/// Read `url,kind` rows from a headerless CSV file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, a row does not have exactly two
/// fields, or a kind is neither `query` nor `link`.
pub fn load_candidates(path: &Path) -> Result<Vec<CandidateUrl>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to open candidate list: {}", path.display()))?;

    let mut candidates = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let line = index + 1;
        let record = record
            .with_context(|| format!("Failed to read {} line {line}", path.display()))?;
        if record.len() != 2 {
            bail!(
                "{} line {line}: expected 2 fields (url,kind), found {}",
                path.display(),
                record.len()
            );
        }
        let kind = record[1]
            .parse()
            .with_context(|| format!("{} line {line}", path.display()))?;
        candidates.push(CandidateUrl::new(&record[0], kind));
    }

    Ok(candidates)
}
