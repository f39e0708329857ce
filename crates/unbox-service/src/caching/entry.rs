use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::archive::{ArchiveFormat, Listing};

/// An archive that has been downloaded and listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Normalized paths of the files in the archive, sorted and without duplicates.
    pub contents: Vec<String>,
    /// Maps normalized paths to the names stored in the archive, for the names that differ.
    pub normalised_paths: Option<BTreeMap<String, String>>,
    /// Last modification of the archive at the origin, in milliseconds since the epoch.
    pub date: i64,
    /// Size of the archive file in bytes.
    pub size: u64,
    pub format: ArchiveFormat,
}

impl CacheEntry {
    pub fn new(listing: Listing, date: i64, size: u64, format: ArchiveFormat) -> Self {
        Self {
            contents: listing.contents,
            normalised_paths: listing.normalised_paths,
            date,
            size,
            format,
        }
    }

    /// Whether the archive contains a file at the normalized `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.contents
            .binary_search_by(|probe| probe.as_str().cmp(path))
            .is_ok()
    }

    /// The name under which the file at the normalized `path` is stored in the archive.
    pub fn original_path<'a>(&'a self, path: &'a str) -> &'a str {
        self.normalised_paths
            .as_ref()
            .and_then(|paths| paths.get(path))
            .map_or(path, String::as_str)
    }

    /// The files whose path ends with `suffix`.
    pub fn find<'a>(&'a self, suffix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.contents
            .iter()
            .map(String::as_str)
            .filter(move |path| path.ends_with(suffix))
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.date)
    }
}
