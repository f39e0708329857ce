use crate::index::IndexSnapshot;

use super::ArchiveCache;
use super::directory::Slot;

impl ArchiveCache {
    /// Removes archives that are outdated according to `snapshot`.
    ///
    /// An archive is outdated if its hash is missing from the snapshot, or if its date differs.
    /// Pending downloads are left alone. Afterwards the cache is checked for consistency with the
    /// cache directory, and any mismatch is logged.
    ///
    /// Returns the number of removed archives.
    pub fn purge(&self, snapshot: &IndexSnapshot) -> usize {
        let store = self.inner.store.as_ref();
        let mut state = self.inner.state.lock().unwrap();

        let outdated: Vec<String> = state
            .slots
            .iter()
            .filter_map(|(hash, slot)| match slot {
                Slot::Resolved(entry) if snapshot.get(hash) != Some(&entry.date) => {
                    Some(hash.clone())
                }
                _ => None,
            })
            .collect();

        for hash in &outdated {
            if let Some(Slot::Resolved(entry)) = state.remove_slot(hash) {
                tracing::info!("Removing outdated cache file {hash}.{}", entry.format);
                store.remove(hash, entry.format);
            }
        }

        let stats = state.stats();
        let lru_len = state.lru.len();
        let slots = state.slots.len();
        state.report();
        drop(state);

        if !outdated.is_empty() {
            metric!(counter("caches.purged") += outdated.len() as i64);
        }

        match std::fs::read_dir(store.cache_dir()) {
            Ok(read_dir) => {
                let files = read_dir
                    .filter_map(Result::ok)
                    .filter(|entry| entry.file_type().is_ok_and(|ty| ty.is_file()))
                    .count();
                if files != stats.entries || slots != lru_len {
                    tracing::warn!(
                        "Cache has inconsistent data: {} entries, {} LRU entries, {} files",
                        slots,
                        lru_len,
                        files
                    );
                }
            }
            Err(e) => {
                let dynerr: &dyn std::error::Error = &e;
                tracing::warn!(error = dynerr, "Failed to check the cache directory");
            }
        }

        outdated.len()
    }
}
