use std::collections::{BTreeMap, BTreeSet};

use super::normalize_path;

/// The files contained in an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    /// Normalized file paths, sorted ascending and without duplicates.
    pub contents: Vec<String>,
    /// Maps normalized paths back to the names stored in the archive.
    ///
    /// Only present if at least one name needed normalization, and then only containing the
    /// names that changed.
    pub normalised_paths: Option<BTreeMap<String, String>>,
}

impl Listing {
    /// Builds a listing from the raw names printed by a listing tool.
    ///
    /// Directory entries (names ending in `/`) and blank lines are skipped.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let originals: BTreeSet<String> = names
            .into_iter()
            .map(Into::into)
            .filter(|name| !name.trim().is_empty() && !name.ends_with('/'))
            .collect();

        let mut normalised_paths = BTreeMap::new();
        let mut contents = BTreeSet::new();
        for original in &originals {
            let normalized = normalize_path(original);
            if normalized == original.as_str() {
                contents.insert(original.clone());
                continue;
            }

            // A name that is already stored in normalized form wins over one that needs mapping.
            let normalized = normalized.into_owned();
            if !originals.contains(&normalized) && !normalised_paths.contains_key(&normalized) {
                normalised_paths.insert(normalized.clone(), original.clone());
            }
            contents.insert(normalized);
        }

        Self {
            contents: contents.into_iter().collect(),
            normalised_paths: (!normalised_paths.is_empty()).then_some(normalised_paths),
        }
    }

    /// Parses the newline separated output of a listing tool.
    pub fn parse(output: &str) -> Self {
        Self::from_names(output.lines())
    }
}
