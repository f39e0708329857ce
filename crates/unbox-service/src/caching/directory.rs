use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};

use crate::config::CacheConfig;
use crate::index::ContentIndex;

use super::{ArchiveError, ArchiveResult, ArchiveStore, CacheEntry};

type DownloadChannel = Shared<oneshot::Receiver<ArchiveResult<Arc<CacheEntry>>>>;

/// The state of a hash in the cache.
#[derive(Clone)]
pub(super) enum Slot {
    /// The archive has been downloaded and listed.
    Resolved(Arc<CacheEntry>),
    /// The archive is being downloaded. Every request for it waits on the same download.
    Pending(DownloadChannel),
}

/// The bounds of an [`ArchiveCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    /// Maximum number of slots, including pending downloads.
    pub max_entries: usize,
    /// Maximum total size of the downloaded archives.
    pub max_size: u64,
}

impl From<&CacheConfig> for CacheLimits {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_entries: config.max_entries,
            max_size: config.max_size,
        }
    }
}

/// A summary of the cache contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Archives that have been downloaded.
    pub entries: usize,
    /// Downloads in flight.
    pub pending: usize,
    /// Total size of the downloaded archives.
    pub size: u64,
}

/// Bookkeeping of the cache, only ever accessed under the [`ArchiveCache`] lock.
#[derive(Default)]
pub(super) struct CacheState {
    pub(super) slots: HashMap<String, Slot>,
    /// Hashes of all slots, most recently used first.
    pub(super) lru: VecDeque<String>,
    /// Total size of the resolved entries.
    pub(super) size: u64,
}

impl CacheState {
    /// Moves `hash` to the front of the LRU.
    fn touch(&mut self, hash: &str) {
        if let Some(pos) = self.lru.iter().position(|h| h == hash) {
            if pos == 0 {
                return;
            }
            if let Some(hash) = self.lru.remove(pos) {
                self.lru.push_front(hash);
            }
        }
    }

    /// Removes a slot along with its LRU position and accounted size.
    pub(super) fn remove_slot(&mut self, hash: &str) -> Option<Slot> {
        let slot = self.slots.remove(hash)?;
        if let Some(pos) = self.lru.iter().position(|h| h == hash) {
            self.lru.remove(pos);
        }
        if let Slot::Resolved(entry) = &slot {
            self.size = self.size.saturating_sub(entry.size);
        }
        Some(slot)
    }

    fn exceeds(&self, limits: &CacheLimits) -> bool {
        self.slots.len() > limits.max_entries || self.size > limits.max_size
    }

    /// Removes the least recently used resolved entries until both bounds hold.
    ///
    /// Pending downloads are never evicted, so this may stop with the bounds still exceeded.
    pub(super) fn evict(&mut self, limits: &CacheLimits, store: &dyn ArchiveStore) -> usize {
        let mut evicted = 0;
        while self.exceeds(limits) {
            let Some(pos) = self
                .lru
                .iter()
                .rposition(|hash| matches!(self.slots.get(hash), Some(Slot::Resolved(_))))
            else {
                break;
            };
            let Some(hash) = self.lru.remove(pos) else {
                break;
            };
            if let Some(Slot::Resolved(entry)) = self.slots.remove(&hash) {
                self.size = self.size.saturating_sub(entry.size);
                tracing::debug!("Evicting cache entry {hash}.{}", entry.format);
                store.remove(&hash, entry.format);
            }
            evicted += 1;
        }

        if evicted > 0 {
            metric!(counter("caches.evicted") += evicted as i64);
        }
        evicted
    }

    pub(super) fn stats(&self) -> CacheStats {
        let entries = self
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Resolved(_)))
            .count();
        CacheStats {
            entries,
            pending: self.slots.len() - entries,
            size: self.size,
        }
    }

    pub(super) fn report(&self) {
        let stats = self.stats();
        metric!(gauge("caches.entries") = stats.entries as u64);
        metric!(gauge("caches.size") = stats.size);
    }
}

pub(super) struct CacheInner {
    pub(super) state: Mutex<CacheState>,
    pub(super) store: Arc<dyn ArchiveStore>,
    pub(super) limits: CacheLimits,
    pub(super) restore_concurrency: usize,
}

impl CacheInner {
    /// Replaces the pending slot of `hash` with the outcome of its download.
    fn install(&self, hash: &str, result: &ArchiveResult<Arc<CacheEntry>>) {
        let mut state = self.state.lock().unwrap();
        let pending = matches!(state.slots.get(hash), Some(Slot::Pending(_)));

        match result {
            Ok(entry) if pending => {
                state
                    .slots
                    .insert(hash.to_owned(), Slot::Resolved(Arc::clone(entry)));
                state.size += entry.size;
                if state.exceeds(&self.limits) {
                    state.evict(&self.limits, self.store.as_ref());
                }
                state.report();
            }
            Ok(entry) => {
                // Nobody is waiting for this archive anymore.
                self.store.remove(hash, entry.format);
            }
            Err(_) if pending => {
                state.remove_slot(hash);
            }
            Err(_) => {}
        }
    }
}

/// Clears the pending slot of a download task that ended without installing its result.
struct PendingGuard {
    inner: Arc<CacheInner>,
    hash: Option<String>,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.hash = None;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let Some(hash) = self.hash.take() else {
            return;
        };
        if let Ok(mut state) = self.inner.state.lock()
            && matches!(state.slots.get(&hash), Some(Slot::Pending(_)))
        {
            tracing::error!("Download of {hash} ended without a result");
            state.remove_slot(&hash);
        }
    }
}

/// The directory of cached archives.
///
/// This is cheap to clone, all clones share the same cache.
#[derive(Clone)]
pub struct ArchiveCache {
    pub(super) inner: Arc<CacheInner>,
}

impl fmt::Debug for ArchiveCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveCache")
            .field("cache_dir", &self.inner.store.cache_dir())
            .field("limits", &self.inner.limits)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ArchiveCache {
    pub fn new(store: Arc<dyn ArchiveStore>, config: &CacheConfig) -> Self {
        Self::with_limits(store, config.into(), config.restore_concurrency)
    }

    pub fn with_limits(
        store: Arc<dyn ArchiveStore>,
        limits: CacheLimits,
        restore_concurrency: usize,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::default()),
                store,
                limits,
                restore_concurrency: restore_concurrency.max(1),
            }),
        }
    }

    pub fn store(&self) -> &dyn ArchiveStore {
        self.inner.store.as_ref()
    }

    /// Prepares the cache directories and restores the archives cached on disk.
    ///
    /// Returns the number of restored archives.
    pub async fn init(&self) -> std::io::Result<usize> {
        self.inner.store.prepare()?;
        self.restore_from_disk().await
    }

    /// Returns the cached archive with the given hash, downloading it if necessary.
    ///
    /// Concurrent requests for an archive that is not cached yet share a single download,
    /// and all of them receive its result. A failed download is not cached, so the next request
    /// tries again.
    pub async fn get(&self, hash: &str) -> ArchiveResult<Arc<CacheEntry>> {
        metric!(counter("caches.access") += 1);

        let channel = {
            let mut state = self.inner.state.lock().unwrap();
            match state.slots.get(hash).cloned() {
                Some(Slot::Resolved(entry)) => {
                    metric!(counter("caches.hit") += 1);
                    state.touch(hash);
                    return Ok(entry);
                }
                Some(Slot::Pending(channel)) => {
                    metric!(counter("caches.coalesced") += 1);
                    state.touch(hash);
                    channel
                }
                None => {
                    metric!(counter("caches.miss") += 1);
                    state.lru.push_front(hash.to_owned());
                    let channel = self.spawn_download(hash.to_owned());
                    state
                        .slots
                        .insert(hash.to_owned(), Slot::Pending(channel.clone()));
                    if state.exceeds(&self.inner.limits) {
                        state.evict(&self.inner.limits, self.inner.store.as_ref());
                    }
                    channel
                }
            }
        };

        channel.await.unwrap_or(Err(ArchiveError::InternalError))
    }

    /// Spawns the download of an archive as a separate task.
    ///
    /// The task keeps running when the requests waiting for it are dropped, and installs its
    /// result in the cache once it is done.
    fn spawn_download(&self, hash: String) -> DownloadChannel {
        let (sender, receiver) = oneshot::channel();
        let mut guard = PendingGuard {
            inner: Arc::clone(&self.inner),
            hash: Some(hash.clone()),
        };

        let task = async move {
            let inner = Arc::clone(&guard.inner);
            let result = inner.store.download(&hash).await.map(Arc::new);

            match &result {
                Ok(entry) => {
                    metric!(counter("caches.download") += 1, "status" => "ok");
                    metric!(time_raw("caches.download.size") = entry.size);
                }
                Err(err) => {
                    metric!(counter("caches.download") += 1, "status" => err.as_tag());
                    tracing::warn!(
                        error = err as &dyn std::error::Error,
                        "Failed to download cache entry {hash}"
                    );
                }
            }

            // Install before sending, so that callers either get this result or start over.
            inner.install(&hash, &result);
            guard.disarm();
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(task);

        receiver.shared()
    }

    /// Evicts least recently used archives until the cache is within its bounds.
    ///
    /// Returns the number of evicted archives.
    pub fn evict(&self) -> usize {
        let mut state = self.inner.state.lock().unwrap();
        let evicted = state.evict(&self.inner.limits, self.inner.store.as_ref());
        state.report();
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.state.lock().unwrap().stats()
    }

    /// The hashes in the cache, most recently used first.
    pub fn hashes(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .lru
            .iter()
            .cloned()
            .collect()
    }

    /// Purges outdated archives whenever `index` is updated.
    pub fn subscribe(&self, index: &ContentIndex) {
        let inner: Weak<CacheInner> = Arc::downgrade(&self.inner);
        index.on_update(move |snapshot| {
            if let Some(inner) = inner.upgrade() {
                ArchiveCache { inner }.purge(snapshot);
            }
        });
    }
}
