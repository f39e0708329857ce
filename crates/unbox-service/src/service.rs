//! Provides the [`UnboxService`] and a way to initialize it.
//!
//! The service ties together the content index, the archive cache and the extraction engine.
//! It is created once from the [`Config`] and then shared by all consumers.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::archive::{FileStream, Tools};
use crate::caching::{
    ArchiveCache, ArchiveError, ArchiveResult, ArchiveStore, CacheEntry, OriginStore,
};
use crate::config::Config;
use crate::download::DownloadService;
use crate::extract::Extractor;
use crate::index::{self, ContentIndex, IndexData};
use crate::mime;

/// The archive cache and resolution engine.
#[derive(Debug, Clone)]
pub struct UnboxService {
    index: Arc<ContentIndex>,
    cache: ArchiveCache,
    extractor: Extractor,
}

impl UnboxService {
    /// Creates the service and all of its parts.
    ///
    /// This clears the directory of in-progress downloads, restores the cache from disk, and
    /// loads the stored index data, if there is any. Cached archives that are outdated
    /// according to the stored index are purged.
    pub async fn create(config: &Config) -> Result<Self> {
        let index = Arc::new(ContentIndex::new());
        let downloader = DownloadService::new(config).context("failed to create HTTP client")?;
        let tools = Tools::default();

        let store: Arc<dyn ArchiveStore> = Arc::new(OriginStore::new(
            config,
            Arc::clone(&index),
            downloader,
            tools.clone(),
        ));
        let cache = ArchiveCache::new(store, &config.caches);
        cache.init().await.context("failed to initialize cache")?;
        cache.subscribe(&index);

        let data_path = config.index_data_path();
        match IndexData::load(&data_path)? {
            Some(data) => index.update(&data),
            None => tracing::info!("No index data found at {}", data_path.display()),
        }

        let extractor = Extractor::new(config, tools);
        Ok(Self::from_parts(index, cache, extractor))
    }

    pub fn from_parts(index: Arc<ContentIndex>, cache: ArchiveCache, extractor: Extractor) -> Self {
        Self {
            index,
            cache,
            extractor,
        }
    }

    pub fn index(&self) -> &Arc<ContentIndex> {
        &self.index
    }

    pub fn cache(&self) -> &ArchiveCache {
        &self.cache
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Resolves an archive URL or repository path to the hash of the archive.
    ///
    /// Symlinks are followed. Archives on the block list fail with
    /// [`Blocked`](ArchiveError::Blocked).
    pub fn resolve(&self, archive: &str) -> ArchiveResult<String> {
        let path = index::repository_path(archive)
            .ok_or_else(|| ArchiveError::UnknownHash(archive.to_owned()))?;
        let hash = self
            .index
            .resolve_path(path)
            .ok_or_else(|| ArchiveError::UnknownHash(path.to_owned()))?;
        if self.index.is_blocked(&hash) {
            return Err(ArchiveError::Blocked(path.to_owned()));
        }
        Ok(hash)
    }

    /// Resolves an archive and fetches it through the cache.
    pub async fn open(&self, archive: &str) -> ArchiveResult<(String, Arc<CacheEntry>)> {
        let hash = self.resolve(archive)?;
        let entry = self.cache.get(&hash).await?;
        Ok((hash, entry))
    }

    /// Streams a file out of a cached archive.
    pub fn get_file_stream(
        &self,
        hash: &str,
        entry: &CacheEntry,
        path: &str,
    ) -> ArchiveResult<FileStream> {
        self.extractor.get_file_stream(hash, entry, path)
    }

    /// Determines the content type of a file in a cached archive.
    ///
    /// Well known extensions are answered from a fixed table. Vague types and unknown
    /// extensions are sniffed from the file contents; if that fails, the table entry is used
    /// when there is one.
    pub async fn content_type(
        &self,
        hash: &str,
        entry: &CacheEntry,
        path: &str,
    ) -> ArchiveResult<String> {
        let known = mime::from_extension(path);
        if let Some(ty) = known
            && !mime::needs_detection(ty)
        {
            return Ok(ty.to_owned());
        }

        match self.extractor.get_file_type(hash, entry, path).await {
            Ok(detected) => Ok(detected),
            Err(err) => match known {
                Some(ty) => {
                    tracing::warn!("Failed to detect the type of {path}: {err}");
                    Ok(ty.to_owned())
                }
                None => Err(err),
            },
        }
    }
}
