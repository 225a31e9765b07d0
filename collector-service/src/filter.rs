//! Tracked-meter filter persistence.
//!
//! The filter lives in a small comma-separated file next to the database so
//! the dashboard layer can rewrite it and the collector can pick it up on
//! the next (re)launch. An empty or missing file means discovery mode:
//! every broadcasting meter is accepted.

use std::fs;
use std::io;
use std::path::Path;

/// The set of tracked meter IDs. Empty means discovery mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet(Vec<String>);

impl FilterSet {
    pub fn new(ids: impl IntoIterator<Item = String>) -> Self {
        Self(
            ids.into_iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
        )
    }

    pub fn ids(&self) -> &[String] {
        &self.0
    }

    pub fn is_discovery(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a parsed reading for `meter_id` should be accepted. Applied
    /// at parse time regardless of whether the decoder filtered upstream.
    pub fn accepts(&self, meter_id: &str) -> bool {
        self.0.is_empty() || self.0.iter().any(|id| id == meter_id)
    }

    /// Decoder `-filterid` argument value, `None` in discovery mode.
    pub fn filter_arg(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.join(","))
        }
    }
}

/// Read the filter file; missing or unreadable files fall back to
/// discovery mode rather than blocking ingestion.
pub fn read_filter_ids(path: &Path) -> FilterSet {
    match fs::read_to_string(path) {
        Ok(raw) => FilterSet::new(raw.split(',').map(str::to_string)),
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(error = %e, path = %path.display(), "failed to read filter file, using discovery mode");
            }
            FilterSet::default()
        }
    }
}

pub fn write_filter_ids(path: &Path, filter: &FilterSet) -> io::Result<()> {
    fs::write(path, filter.ids().join(","))
}
