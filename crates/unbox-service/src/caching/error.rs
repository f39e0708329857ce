use std::error::Error;

use thiserror::Error;

/// An error that happens while fetching, inspecting or extracting an archive.
///
/// This error is cloneable so that every caller waiting on the same download receives it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchiveError {
    /// The hash or path does not correspond to any archive known to the index.
    #[error("unknown archive `{0}`")]
    UnknownHash(String),
    /// The archive is known, but has been blocked from being unboxed.
    #[error("archive `{0}` is blocked")]
    Blocked(String),
    /// The archive has a file extension that is not handled.
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),
    /// The archive could not be downloaded.
    ///
    /// The attached string contains the reason, such as the origin's response status or a
    /// connection failure.
    #[error("failed to fetch archive: {0}")]
    OriginFetchError(String),
    /// The origin response had no usable `Last-Modified` header.
    #[error("could not parse last-modified header")]
    MissingDateHeader,
    /// Listing the contents of the archive failed.
    ///
    /// The attached string contains the diagnostics of the listing tool.
    #[error("failed to read archive: {0}")]
    ArchiveReadError(String),
    /// Extracting a file from the archive, or detecting its type, failed.
    ///
    /// The attached string contains the diagnostics of the extraction tool.
    #[error("failed to extract file: {0}")]
    ExtractionError(String),
    /// The extracted file is larger than the requested buffer size.
    #[error("file exceeds the maximum buffer size of {0} bytes")]
    BufferLimitExceeded(u64),
    /// An unexpected local error, which has been logged where it happened.
    #[error("internal error")]
    InternalError,
}

impl ArchiveError {
    #[track_caller]
    pub fn from_std_error<E: Error + 'static>(e: E) -> Self {
        let dynerr: &dyn Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Creates an [`OriginFetchError`](Self::OriginFetchError) from the root cause of `error`.
    pub fn fetch_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        Self::OriginFetchError(error_string)
    }

    /// A short name for this error, used as a metrics tag.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::UnknownHash(_) => "unknown_hash",
            Self::Blocked(_) => "blocked",
            Self::UnsupportedFormat(_) => "unsupported",
            Self::OriginFetchError(_) => "fetch",
            Self::MissingDateHeader => "missing_date",
            Self::ArchiveReadError(_) => "read",
            Self::ExtractionError(_) => "extraction",
            Self::BufferLimitExceeded(_) => "buffer_limit",
            Self::InternalError => "internal",
        }
    }
}

impl From<std::io::Error> for ArchiveError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for ArchiveError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<reqwest::Error> for ArchiveError {
    fn from(error: reqwest::Error) -> Self {
        Self::fetch_error(&error)
    }
}

/// The result of an archive operation.
pub type ArchiveResult<T = ()> = Result<T, ArchiveError>;
