use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;
use futures::{StreamExt, stream};

use crate::archive::ArchiveFormat;

use super::directory::Slot;
use super::store::date_from_file_time;
use super::{ArchiveCache, ArchiveError, CacheEntry};

impl ArchiveCache {
    /// Reinstalls the archives found in the cache directory.
    ///
    /// Every archive is listed again, and the file modification time is used as its date. Files
    /// that cannot be listed, or whose names are not of the form `<hash>.<format>`, are deleted.
    /// When there are several files for one hash, only the first one is kept.
    /// Archives are restored in the order they are found, with the first one becoming the most
    /// recently used.
    ///
    /// Returns the number of restored archives.
    pub async fn restore_from_disk(&self) -> io::Result<usize> {
        let store = Arc::clone(&self.inner.store);
        let cache_dir = store.cache_dir().to_owned();

        let mut files = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&cache_dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        let restored: Vec<_> = stream::iter(files)
            .map(|path| self.restore_file(path))
            .buffered(self.inner.restore_concurrency)
            .collect()
            .await;

        let mut state = self.inner.state.lock().unwrap();
        let mut count = 0;
        for (path, hash, entry) in restored.into_iter().flatten() {
            if state.slots.contains_key(&hash) {
                tracing::info!("Removing duplicate cache file {}", path.display());
                remove_file(&path);
                continue;
            }
            state.size += entry.size;
            state.lru.push_back(hash.clone());
            state.slots.insert(hash, Slot::Resolved(Arc::new(entry)));
            count += 1;
        }
        state.evict(&self.inner.limits, store.as_ref());
        state.report();

        tracing::info!(
            "Cache initialized with {} entries, {} bytes total",
            state.lru.len(),
            state.size
        );
        metric!(counter("caches.restored") += count as i64);

        Ok(count)
    }

    async fn restore_file(&self, path: PathBuf) -> Option<(PathBuf, String, CacheEntry)> {
        let store = self.inner.store.as_ref();
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("");

        let Some((hash, format)) = parse_file_name(name) else {
            tracing::info!("Removing unknown cache file {}", path.display());
            remove_file(&path);
            return None;
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                let dynerr: &dyn std::error::Error = &e;
                tracing::error!(error = dynerr, "Failed to stat cache file {}", path.display());
                return None;
            }
        };
        let date = date_from_file_time(FileTime::from_last_modification_time(&metadata));

        let hash = hash.to_owned();
        let listed = store.list_contents(&path, format).await;
        match listed {
            Ok(listing) => {
                let entry = CacheEntry::new(listing, date, metadata.len(), format);
                Some((path, hash, entry))
            }
            // This was logged already and is not a problem of the file.
            Err(ArchiveError::InternalError) => None,
            Err(err) => {
                tracing::info!("Removing unreadable cache file {name}: {err}");
                remove_file(&path);
                None
            }
        }
    }
}

/// Splits a cache file name into its hash and format.
fn parse_file_name(name: &str) -> Option<(&str, ArchiveFormat)> {
    let (hash, extension) = name.split_once('.')?;
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some((hash, ArchiveFormat::from_extension(extension)?))
}

fn remove_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        let dynerr: &dyn std::error::Error = &e;
        tracing::error!(error = dynerr, "Failed to remove cache file {}", path.display());
    }
}
