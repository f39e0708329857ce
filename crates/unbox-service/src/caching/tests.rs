use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::sync::Semaphore;

use unbox_test as test;

use crate::archive::{ArchiveFormat, Listing};
use crate::index::{ContentIndex, IndexData, IndexSnapshot};

use super::store::file_time;
use super::*;

const DATE: i64 = 1_445_412_480_000;

/// An [`ArchiveStore`] that "downloads" archives by writing their listing into the cache
/// directory.
///
/// Listing a file returns its lines, unless the file contains `corrupt`.
#[derive(Default)]
struct FakeStore {
    cache_dir: PathBuf,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    downloads: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    sizes: Mutex<HashMap<String, u64>>,
}

impl FakeStore {
    fn new(cache_dir: &Path) -> Arc<Self> {
        std::fs::create_dir_all(cache_dir).unwrap();
        Arc::new(Self {
            cache_dir: cache_dir.to_owned(),
            ..Default::default()
        })
    }

    /// Makes downloads of `hash` wait until [`release`](Self::release) is called.
    fn gate(&self, hash: &str) {
        self.gates
            .lock()
            .unwrap()
            .insert(hash.to_owned(), Arc::new(Semaphore::new(0)));
    }

    fn release(&self, hash: &str) {
        if let Some(gate) = self.gates.lock().unwrap().get(hash) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    fn set_failing(&self, hash: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(hash.to_owned());
        } else {
            set.remove(hash);
        }
    }

    fn set_size(&self, hash: &str, size: u64) {
        self.sizes.lock().unwrap().insert(hash.to_owned(), size);
    }

    fn downloads(&self, hash: &str) -> usize {
        self.downloads
            .lock()
            .unwrap()
            .get(hash)
            .copied()
            .unwrap_or_default()
    }

    fn has_file(&self, hash: &str) -> bool {
        self.file_path(hash, ArchiveFormat::Zip).exists()
    }

    async fn fake_download(&self, hash: &str) -> ArchiveResult<CacheEntry> {
        *self
            .downloads
            .lock()
            .unwrap()
            .entry(hash.to_owned())
            .or_default() += 1;

        let gate = self.gates.lock().unwrap().get(hash).cloned();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }

        if self.failing.lock().unwrap().contains(hash) {
            return Err(ArchiveError::OriginFetchError(format!(
                "Error accessing {hash}: 404 Not Found"
            )));
        }

        let size = self.sizes.lock().unwrap().get(hash).copied().unwrap_or(10);
        std::fs::write(self.file_path(hash, ArchiveFormat::Zip), "a.txt\n")?;
        Ok(CacheEntry::new(
            Listing::parse("a.txt\n"),
            DATE,
            size,
            ArchiveFormat::Zip,
        ))
    }
}

impl ArchiveStore for FakeStore {
    fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn download<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, ArchiveResult<CacheEntry>> {
        self.fake_download(hash).boxed()
    }

    fn list_contents<'a>(
        &'a self,
        path: &'a Path,
        _format: ArchiveFormat,
    ) -> BoxFuture<'a, ArchiveResult<Listing>> {
        async move {
            let contents = std::fs::read_to_string(path)?;
            if contents.contains("corrupt") {
                return Err(ArchiveError::ArchiveReadError(format!(
                    "{}: unzip error: exit status: 9",
                    path.display()
                )));
            }
            Ok(Listing::parse(&contents))
        }
        .boxed()
    }
}

fn cache(store: &Arc<FakeStore>, max_entries: usize, max_size: u64) -> ArchiveCache {
    let store: Arc<dyn ArchiveStore> = store.clone();
    ArchiveCache::with_limits(
        store,
        CacheLimits {
            max_entries,
            max_size,
        },
        4,
    )
}

/// Yields to the runtime until `condition` holds.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_concurrent_gets_download_once() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());
    let cache = cache(&store, 10, 1000);

    let results = join_all((0..5).map(|_| cache.get("aaa"))).await;

    assert_eq!(store.downloads("aaa"), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
    }
    assert_eq!(
        cache.stats(),
        CacheStats {
            entries: 1,
            pending: 0,
            size: 10
        }
    );
}

#[tokio::test]
async fn test_error_is_shared_and_retried() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());
    let cache = cache(&store, 10, 1000);
    store.set_failing("bad", true);

    let results = join_all((0..3).map(|_| cache.get("bad"))).await;
    assert_eq!(store.downloads("bad"), 1);
    for result in results {
        assert_eq!(
            result,
            Err(ArchiveError::OriginFetchError(
                "Error accessing bad: 404 Not Found".into()
            ))
        );
    }
    assert_eq!(cache.stats(), CacheStats::default());
    assert!(cache.hashes().is_empty());

    store.set_failing("bad", false);
    assert!(cache.get("bad").await.is_ok());
    assert_eq!(store.downloads("bad"), 2);
}

#[tokio::test]
async fn test_evicts_least_recently_used() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());
    let cache = cache(&store, 2, 1000);

    for hash in ["aaa", "bbb", "ccc"] {
        cache.get(hash).await.unwrap();
    }

    assert_eq!(cache.hashes(), ["ccc", "bbb"]);
    assert!(!store.has_file("aaa"));
    assert!(store.has_file("bbb"));
    assert!(store.has_file("ccc"));
}

#[tokio::test]
async fn test_hit_refreshes_lru() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());
    let cache = cache(&store, 2, 1000);

    for hash in ["aaa", "bbb", "aaa", "ccc"] {
        cache.get(hash).await.unwrap();
    }

    assert_eq!(cache.hashes(), ["ccc", "aaa"]);
    assert_eq!(store.downloads("aaa"), 1);
    assert!(!store.has_file("bbb"));
}

#[tokio::test]
async fn test_evicts_by_size() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());
    let cache = cache(&store, 10, 25);

    for hash in ["aaa", "bbb", "ccc"] {
        cache.get(hash).await.unwrap();
    }

    assert_eq!(cache.hashes(), ["ccc", "bbb"]);
    assert_eq!(cache.stats().size, 20);

    // An archive bigger than the whole cache pushes everything out, itself included.
    store.set_size("big", 100);
    let big = cache.get("big").await.unwrap();
    assert_eq!(big.size, 100);
    assert_eq!(cache.stats(), CacheStats::default());
    assert!(!store.has_file("big"));
}

#[tokio::test]
async fn test_pending_is_never_evicted() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());
    let cache = cache(&store, 1, 1000);
    store.gate("aaa");

    let pending = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("aaa").await }
    });
    wait_until(|| store.downloads("aaa") == 1).await;

    // `bbb` is the only resolved entry, so it is the one that has to go.
    cache.get("bbb").await.unwrap();
    assert_eq!(
        cache.stats(),
        CacheStats {
            entries: 0,
            pending: 1,
            size: 0
        }
    );
    assert_eq!(cache.hashes(), ["aaa"]);

    store.release("aaa");
    pending.await.unwrap().unwrap();
    assert_eq!(cache.hashes(), ["aaa"]);
    assert_eq!(cache.stats().entries, 1);
}

#[tokio::test]
async fn test_download_outlives_requester() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());
    let cache = cache(&store, 10, 1000);
    store.gate("aaa");

    let result = tokio::time::timeout(Duration::from_millis(50), cache.get("aaa")).await;
    assert!(result.is_err());
    assert_eq!(cache.stats().pending, 1);

    store.release("aaa");
    wait_until(|| cache.stats().entries == 1).await;

    cache.get("aaa").await.unwrap();
    assert_eq!(store.downloads("aaa"), 1);
}

#[tokio::test]
async fn test_purge() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());
    let cache = cache(&store, 10, 1000);

    for hash in ["aaa", "bbb", "ccc"] {
        cache.get(hash).await.unwrap();
    }

    let snapshot = IndexSnapshot::from([("aaa".to_owned(), DATE), ("bbb".to_owned(), DATE + 1)]);
    assert_eq!(cache.purge(&snapshot), 2);

    assert_eq!(cache.hashes(), ["aaa"]);
    assert_eq!(cache.stats().size, 10);
    assert!(store.has_file("aaa"));
    assert!(!store.has_file("bbb"));
    assert!(!store.has_file("ccc"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

    assert_eq!(cache.purge(&snapshot), 0);
}

#[tokio::test]
async fn test_purge_keeps_pending() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());
    let cache = cache(&store, 10, 1000);
    store.gate("aaa");

    let pending = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("aaa").await }
    });
    wait_until(|| store.downloads("aaa") == 1).await;

    assert_eq!(cache.purge(&IndexSnapshot::new()), 0);
    assert_eq!(cache.stats().pending, 1);

    store.release("aaa");
    pending.await.unwrap().unwrap();
    assert_eq!(cache.stats().entries, 1);
}

#[tokio::test]
async fn test_index_update_purges() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());
    let cache = cache(&store, 10, 1000);
    let index = ContentIndex::new();
    cache.subscribe(&index);

    cache.get("aaa").await.unwrap();
    cache.get("bbb").await.unwrap();

    let mut data = IndexData::default();
    data.files.push(("bbb".into(), "games/b.zip".into(), DATE));
    index.update(&data);

    assert_eq!(cache.hashes(), ["bbb"]);
    assert!(!store.has_file("aaa"));
}

#[tokio::test]
async fn test_restore_from_disk() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());

    let write = |name: &str, contents: &str| {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        filetime::set_file_mtime(&path, file_time(DATE)).unwrap();
    };
    write("aaa.zip", "./a.txt\nsub/\nsub/b.txt\n");
    write("bbb.zip", "corrupt");
    write("ccc.tar.gz", "x\n");
    write("notes.txt", "not an archive");
    std::fs::create_dir(dir.path().join("subdir")).unwrap();

    let cache = cache(&store, 10, 1000);
    assert_eq!(cache.init().await.unwrap(), 2);

    assert_eq!(cache.hashes(), ["aaa", "ccc"]);
    assert!(!dir.path().join("bbb.zip").exists());
    assert!(!dir.path().join("notes.txt").exists());
    assert!(dir.path().join("subdir").exists());

    let entry = cache.get("aaa").await.unwrap();
    assert_eq!(store.downloads("aaa"), 0);
    assert_eq!(entry.date, DATE);
    assert_eq!(entry.size, 23);
    assert_eq!(entry.contents, ["a.txt", "sub/b.txt"]);
    assert_eq!(entry.original_path("a.txt"), "./a.txt");

    let entry = cache.get("ccc").await.unwrap();
    assert_eq!(entry.format, ArchiveFormat::TarGz);
}

#[tokio::test]
async fn test_restore_removes_duplicates() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());
    std::fs::write(dir.path().join("aaa.tar.gz"), "a.txt\n").unwrap();
    std::fs::write(dir.path().join("aaa.zip"), "b.txt\n").unwrap();

    let cache = cache(&store, 10, 1000);
    assert_eq!(cache.init().await.unwrap(), 1);

    let entry = cache.get("aaa").await.unwrap();
    assert_eq!(entry.format, ArchiveFormat::TarGz);
    assert_eq!(entry.contents, ["a.txt"]);
    assert!(dir.path().join("aaa.tar.gz").exists());
    assert!(!dir.path().join("aaa.zip").exists());
    assert_eq!(cache.stats().size, 6);
}

#[tokio::test]
async fn test_restore_evicts_to_bounds() {
    test::setup();
    let dir = test::tempdir();
    let store = FakeStore::new(dir.path());
    for name in ["aaa.zip", "bbb.zip", "ccc.zip"] {
        std::fs::write(dir.path().join(name), "a.txt\n").unwrap();
    }

    let cache = cache(&store, 2, 1000);
    assert_eq!(cache.init().await.unwrap(), 3);

    // The last restored archive is the least recently used one.
    assert_eq!(cache.hashes(), ["aaa", "bbb"]);
    assert!(!store.has_file("ccc"));
}
