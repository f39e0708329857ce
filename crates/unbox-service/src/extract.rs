//! Extraction of single files from cached archives.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use humantime_serde::re::humantime::format_duration;

use crate::archive::{FileStream, Tools};
use crate::caching::{ArchiveError, ArchiveResult, CacheEntry, cache_file_name};
use crate::config::Config;

/// Extracts files from the archives in the cache directory.
///
/// Paths are given in their normalized form, as they appear in [`CacheEntry::contents`], and
/// are mapped back to the names stored in the archive. Whether the archive actually contains
/// the requested path is not checked.
#[derive(Debug, Clone)]
pub struct Extractor {
    cache_dir: PathBuf,
    tools: Tools,
    max_buffer: u64,
    timeout: Duration,
}

impl Extractor {
    pub fn new(config: &Config, tools: Tools) -> Self {
        Self::with_limits(
            config.cache_dir(),
            tools,
            config.caches.max_buffer,
            config.extract_timeout,
        )
    }

    pub fn with_limits(
        cache_dir: PathBuf,
        tools: Tools,
        max_buffer: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            cache_dir,
            tools,
            max_buffer,
            timeout,
        }
    }

    /// The default cap of [`get_file_buffer`](Self::get_file_buffer).
    pub fn max_buffer(&self) -> u64 {
        self.max_buffer
    }

    fn archive_path(&self, hash: &str, entry: &CacheEntry) -> PathBuf {
        self.cache_dir.join(cache_file_name(hash, entry.format))
    }

    /// Streams a file out of an archive.
    ///
    /// The stream is not bounded in size or time. Failures of the extraction tool only show up
    /// once the stream has ended, and are logged.
    pub fn get_file_stream(
        &self,
        hash: &str,
        entry: &CacheEntry,
        path: &str,
    ) -> ArchiveResult<FileStream> {
        let tool = self.tools.get(entry.format)?;
        tool.extract_stream(&self.archive_path(hash, entry), entry.original_path(path))
    }

    /// Reads a file out of an archive into memory.
    ///
    /// Files larger than `max_size`, or the configured `max_buffer` if not given, fail with
    /// [`BufferLimitExceeded`](ArchiveError::BufferLimitExceeded).
    pub async fn get_file_buffer(
        &self,
        hash: &str,
        entry: &CacheEntry,
        path: &str,
        max_size: Option<u64>,
    ) -> ArchiveResult<Bytes> {
        let tool = self.tools.get(entry.format)?;
        let archive = self.archive_path(hash, entry);
        let max_size = max_size.unwrap_or(self.max_buffer);
        let extraction = tool.extract_buffer(&archive, entry.original_path(path), max_size);
        self.bounded("buffer", path, extraction).await
    }

    /// Detects the MIME type of a file in an archive from its contents.
    pub async fn get_file_type(
        &self,
        hash: &str,
        entry: &CacheEntry,
        path: &str,
    ) -> ArchiveResult<String> {
        let tool = self.tools.get(entry.format)?;
        let archive = self.archive_path(hash, entry);
        let sniffing = tool.sniff_type(&archive, entry.original_path(path));
        self.bounded("sniff", path, sniffing).await
    }

    /// Applies the extraction timeout to `future` and records failures.
    async fn bounded<T, F>(&self, mode: &'static str, path: &str, future: F) -> ArchiveResult<T>
    where
        F: Future<Output = ArchiveResult<T>>,
    {
        let result = tokio::time::timeout(self.timeout, future)
            .await
            .unwrap_or_else(|_| {
                Err(ArchiveError::ExtractionError(format!(
                    "{path}: extraction timed out after {}",
                    format_duration(self.timeout)
                )))
            });

        if let Err(err) = &result {
            metric!(counter("extract.failed") += 1, "mode" => mode, "reason" => err.as_tag());
            tracing::debug!("Failed to extract {path}: {err}");
        }
        result
    }
}
