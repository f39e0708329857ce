//! Archive formats and the external tools used to look inside them.

use std::fmt;
use std::str::FromStr;

mod listing;
mod normalize;
mod tools;

pub use listing::Listing;
pub use normalize::normalize_path;
pub use tools::{ArchiveTool, CommandTool, FileStream, Tools};

/// An archive format supported by the cache.
///
/// The format determines the file extension of the cached archive and the tool family used to
/// list and extract it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarZ,
    Tgz,
}

impl ArchiveFormat {
    /// All supported formats.
    pub const ALL: [ArchiveFormat; 4] = [Self::Zip, Self::TarGz, Self::TarZ, Self::Tgz];

    /// The tag of this format, which is also the extension of the cached file.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
            Self::TarZ => "tar.z",
            Self::Tgz => "tgz",
        }
    }

    /// Determines the format from the extension of a repository path.
    ///
    /// The extension is matched case-insensitively, so `foo.tar.Z` is a [`TarZ`](Self::TarZ)
    /// archive.
    pub fn from_path(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        // `tar.gz` has to be matched before anything that could be a suffix of it.
        [Self::TarGz, Self::TarZ, Self::Tgz, Self::Zip]
            .into_iter()
            .find(|format| {
                lower
                    .strip_suffix(format.as_str())
                    .is_some_and(|stem| stem.ends_with('.') && stem.len() > 1)
            })
    }

    /// Parses a format tag as it appears in cached file names.
    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(ext))
    }

    /// Whether this format is handled by `tar` rather than `unzip`.
    pub fn is_tar(self) -> bool {
        !matches!(self, Self::Zip)
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown [`ArchiveFormat`] tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown archive format `{0}`")]
pub struct UnknownFormat(pub String);

impl FromStr for ArchiveFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| UnknownFormat(s.to_owned()))
    }
}
