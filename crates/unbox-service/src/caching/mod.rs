//! # Archive cache
//!
//! Archives are downloaded from the origin on first use and kept in a local cache directory
//! until they are evicted or become outdated.
//!
//! ## Layers
//!
//! - The [`ArchiveStore`] downloads a single archive into the cache directory and lists its
//!   contents. The [`OriginStore`] fetches archives over HTTP from the configured origin.
//! - The [`ArchiveCache`] keeps track of which archives are cached. It deduplicates concurrent
//!   requests for the same archive, so that each archive is only downloaded once, and evicts the
//!   least recently used archives once the cache is full.
//!
//! Each cached archive is stored as a `<hash>.<format>` file in the cache directory, with its
//! modification time set to the date the archive was last modified at the origin. That is all
//! that is needed to restore the cache after a restart, see [`ArchiveCache::restore_from_disk`].
//!
//! Downloads are written into a `tmp` directory next to the cache directory and only moved into
//! place once they have been fully written and listed.
//!
//! ## Eviction
//!
//! The cache is bounded by both the number of archives ([`CacheConfig::max_entries`]) and their
//! total size ([`CacheConfig::max_size`]). Archives that are still being downloaded count towards
//! the number of entries, but are never evicted.
//!
//! Whenever the repository index is refreshed, archives whose date no longer matches the index
//! are purged, see [`ArchiveCache::purge`].
//!
//! ## Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.hit`: Accesses served by an archive already in the cache.
//! - `caches.coalesced`: Accesses joining a download that is already in flight.
//! - `caches.miss`: Accesses starting a new download.
//! - `caches.download`: Finished downloads, tagged with their `status`.
//! - `caches.download.size`: Sizes of downloaded archives.
//! - `caches.evicted` / `caches.purged`: Archives removed from the cache.
//! - `caches.entries` / `caches.size`: Gauges of the cache contents.
//!
//! [`CacheConfig::max_entries`]: crate::config::CacheConfig::max_entries
//! [`CacheConfig::max_size`]: crate::config::CacheConfig::max_size

mod directory;
mod entry;
mod error;
mod purge;
mod restore;
mod store;

pub use directory::{ArchiveCache, CacheLimits, CacheStats};
pub use entry::CacheEntry;
pub use error::{ArchiveError, ArchiveResult};
pub use store::{ArchiveStore, OriginStore, cache_file_name, clear_tmp};

#[cfg(test)]
mod tests;
