use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::DateTime;
use filetime::FileTime;
use futures::future::BoxFuture;
use futures::FutureExt;
use url::Url;

use crate::archive::{ArchiveFormat, Listing, Tools};
use crate::config::Config;
use crate::download::DownloadService;
use crate::index::ContentIndex;

use super::{ArchiveError, ArchiveResult, CacheEntry};

/// Downloads archives into the cache directory and inspects them.
pub trait ArchiveStore: Send + Sync + 'static {
    /// The directory holding the cached archives.
    fn cache_dir(&self) -> &Path;

    /// Creates the directories used by this store.
    fn prepare(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.cache_dir())
    }

    /// Downloads the archive with the given hash into [`file_path`](Self::file_path).
    ///
    /// On failure, no file is left behind.
    fn download<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, ArchiveResult<CacheEntry>>;

    /// Lists the contents of the archive at `path`.
    fn list_contents<'a>(
        &'a self,
        path: &'a Path,
        format: ArchiveFormat,
    ) -> BoxFuture<'a, ArchiveResult<Listing>>;

    /// The path of a cached archive.
    fn file_path(&self, hash: &str, format: ArchiveFormat) -> PathBuf {
        self.cache_dir().join(cache_file_name(hash, format))
    }

    /// Deletes a cached archive.
    ///
    /// A file that is already gone is not an error. Other errors are logged.
    fn remove(&self, hash: &str, format: ArchiveFormat) {
        let path = self.file_path(hash, format);
        if let Err(e) = catch_not_found(|| std::fs::remove_file(&path)) {
            let dynerr: &dyn std::error::Error = &e;
            tracing::error!(error = dynerr, "Failed to remove cache file {}", path.display());
        }
    }
}

/// An [`ArchiveStore`] fetching archives from the origin over HTTP.
pub struct OriginStore {
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
    origin: Url,
    index: Arc<ContentIndex>,
    downloader: Arc<DownloadService>,
    tools: Tools,
}

impl fmt::Debug for OriginStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginStore")
            .field("cache_dir", &self.cache_dir)
            .field("tmp_dir", &self.tmp_dir)
            .field("origin", &self.origin.as_str())
            .finish()
    }
}

impl OriginStore {
    pub fn new(
        config: &Config,
        index: Arc<ContentIndex>,
        downloader: Arc<DownloadService>,
        tools: Tools,
    ) -> Self {
        Self {
            cache_dir: config.cache_dir(),
            tmp_dir: config.tmp_dir(),
            origin: config.origin.clone(),
            index,
            downloader,
            tools,
        }
    }

    /// The origin URL of an archive.
    fn archive_url(&self, path: &str) -> ArchiveResult<Url> {
        let mut url = self.origin.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ArchiveError::OriginFetchError(format!("invalid origin URL {}", self.origin))
            })?
            .pop_if_empty()
            .extend(path.split('/'));
        Ok(url)
    }

    async fn fetch(&self, hash: &str) -> ArchiveResult<CacheEntry> {
        let path = self
            .index
            .lookup_path(hash)
            .ok_or_else(|| ArchiveError::UnknownHash(hash.to_owned()))?;
        let format = ArchiveFormat::from_path(&path)
            .ok_or_else(|| ArchiveError::UnsupportedFormat(path.clone()))?;
        let url = self.archive_url(&path)?;

        tracing::info!("Downloading cache entry {hash} ({path})");

        // The temporary file is deleted when it is dropped, so every early return below cleans
        // up after itself.
        let temp_file = tempfile::Builder::new()
            .prefix(hash)
            .suffix(&format!(".{format}"))
            .tempfile_in(&self.tmp_dir)?;
        let mut destination = tokio::fs::File::from_std(temp_file.reopen()?);
        let downloaded = self.downloader.download(url, &mut destination).await?;
        drop(destination);

        let date = downloaded
            .last_modified
            .as_deref()
            .and_then(parse_last_modified)
            .ok_or(ArchiveError::MissingDateHeader)?;
        filetime::set_file_mtime(temp_file.path(), file_time(date))?;
        let size = temp_file.as_file().metadata()?.len();

        let listing = self.list_contents(temp_file.path(), format).await?;

        temp_file
            .persist(self.file_path(hash, format))
            .map_err(|e| ArchiveError::from_std_error(e.error))?;

        Ok(CacheEntry::new(listing, date, size, format))
    }
}

impl ArchiveStore for OriginStore {
    fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn prepare(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        clear_tmp(&self.tmp_dir)
    }

    fn download<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, ArchiveResult<CacheEntry>> {
        self.fetch(hash).boxed()
    }

    fn list_contents<'a>(
        &'a self,
        path: &'a Path,
        format: ArchiveFormat,
    ) -> BoxFuture<'a, ArchiveResult<Listing>> {
        async move { self.tools.get(format)?.list(path).await }.boxed()
    }
}

/// The name of the cached file of an archive, `<hash>.<format>`.
pub fn cache_file_name(hash: &str, format: ArchiveFormat) -> String {
    format!("{hash}.{format}")
}

/// Removes and recreates the directory of in-progress downloads.
pub fn clear_tmp(tmp: &Path) -> io::Result<()> {
    if tmp.exists() {
        std::fs::remove_dir_all(tmp)?;
    }
    std::fs::create_dir_all(tmp)
}

/// Parses a `Last-Modified` header into milliseconds since the epoch.
fn parse_last_modified(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.timestamp_millis())
}

pub(super) fn file_time(date: i64) -> FileTime {
    FileTime::from_unix_time(
        date.div_euclid(1000),
        (date.rem_euclid(1000) * 1_000_000) as u32,
    )
}

/// Reads a file time back into milliseconds since the epoch.
pub(super) fn date_from_file_time(time: FileTime) -> i64 {
    time.unix_seconds() * 1000 + i64::from(time.nanoseconds() / 1_000_000)
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
