//! The index of archives available at the origin.
//!
//! The index maps repository paths to stable hashes and last-modified dates. It is refreshed
//! periodically from the repository's master index, and every refresh is announced to the
//! listeners registered with [`ContentIndex::on_update`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tempfile::NamedTempFile;

use crate::archive::ArchiveFormat;

/// The version of the stored [`IndexData`] format.
///
/// Stored data of another version is ignored.
pub const INDEX_DATA_VERSION: u32 = 7;

/// How many symlinks are followed when resolving a path.
const MAX_SYMLINK_DEPTH: usize = 16;

/// Hosts archive URLs are accepted from.
const ARCHIVE_HOSTS: &[&str] = &["ifarchive.org", "www.ifarchive.org", "mirror.ifarchive.org"];

/// Maps archive hashes to their last-modified dates in milliseconds since the epoch.
pub type IndexSnapshot = HashMap<String, i64>;

type Listener = Box<dyn Fn(&IndexSnapshot) + Send + Sync>;

/// The contents of the repository index, as produced by parsing the master index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexData {
    /// `(hash, path, date)` of every archive.
    pub files: Vec<(String, String, i64)>,
    /// `(path, target)` of every symlink, relative to the repository root.
    pub symlinks: Vec<(String, String)>,
    /// Hashes of archives that must not be unboxed.
    pub meta_blocks: Vec<String>,
    pub version: u32,
}

impl Default for IndexData {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            symlinks: Vec::new(),
            meta_blocks: Vec::new(),
            version: INDEX_DATA_VERSION,
        }
    }
}

impl IndexData {
    /// Adds an archive and returns its hash.
    pub fn add_file(&mut self, path: &str, date: i64) -> String {
        let hash = archive_hash(path);
        self.files.push((hash.clone(), path.to_owned(), date));
        hash
    }

    pub fn add_symlink(&mut self, path: &str, target: &str) {
        self.symlinks.push((path.to_owned(), target.to_owned()));
    }

    pub fn block(&mut self, hash: &str) {
        self.meta_blocks.push(hash.to_owned());
    }

    /// Loads stored index data.
    ///
    /// Returns `None` if nothing has been stored yet, or if the stored data has an outdated
    /// format.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("failed to read index data"),
        };

        #[derive(Deserialize)]
        struct Version {
            version: u32,
        }
        let Version { version } =
            serde_json::from_slice(&contents).context("failed to parse index data")?;
        if version != INDEX_DATA_VERSION {
            tracing::info!("Stored index data is in old format (version {version})");
            return Ok(None);
        }

        let data = serde_json::from_slice(&contents).context("failed to parse index data")?;
        Ok(Some(data))
    }

    /// Atomically replaces the stored index data.
    pub fn store(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).context("failed to create index data directory")?;

        let mut temp_file = NamedTempFile::new_in(dir).context("failed to create index data")?;
        serde_json::to_writer(&mut temp_file, self).context("failed to write index data")?;
        temp_file
            .persist(path)
            .context("failed to persist index data")?;
        Ok(())
    }
}

/// Computes the stable hash of an archive from its repository path.
///
/// This is the first 48 bits of the SHA-512 digest of the path, in base 36, padded to 10
/// characters.
pub fn archive_hash(path: &str) -> String {
    let digest = Sha512::digest(path.as_bytes());
    let value = digest[..6]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    format!("{:0>10}", to_base36(value))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut digits = Vec::new();
    loop {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    digits.iter().rev().map(|&digit| digit as char).collect()
}

/// Extracts the repository path from an archive URL.
///
/// Accepts URLs on the repository hosts, with or without the `if-archive/` prefix, as well as
/// bare repository paths.
pub fn repository_path(input: &str) -> Option<&str> {
    let input = input.trim();
    let Some(rest) = input
        .strip_prefix("https://")
        .or_else(|| input.strip_prefix("http://"))
    else {
        let path = input.trim_start_matches('/');
        let path = path.strip_prefix("if-archive/").unwrap_or(path);
        return (!path.is_empty() && !path.contains("://")).then_some(path);
    };

    let (host, path) = rest.split_once('/')?;
    if !ARCHIVE_HOSTS.contains(&host) {
        return None;
    }
    let path = path.strip_prefix("if-archive/").unwrap_or(path);
    (!path.is_empty()).then_some(path)
}

#[derive(Debug, Default)]
struct IndexMaps {
    path_to_hash: HashMap<String, String>,
    hash_to_path: HashMap<String, String>,
    hash_to_date: IndexSnapshot,
    symlinked_files: HashMap<String, String>,
    symlinked_dirs: HashMap<String, String>,
    blocked: HashSet<String>,
}

impl IndexMaps {
    fn from_data(data: &IndexData) -> Self {
        let mut maps = Self::default();
        for (hash, path, date) in &data.files {
            maps.hash_to_date.insert(hash.clone(), *date);
            maps.hash_to_path.insert(hash.clone(), path.clone());
            maps.path_to_hash.insert(path.clone(), hash.clone());
        }

        for (path, target) in &data.symlinks {
            let path = path.trim_matches('/').to_owned();
            let target = target.trim_matches('/').to_owned();
            if ArchiveFormat::from_path(&path).is_some() {
                maps.symlinked_files.insert(path, target);
            } else {
                maps.symlinked_dirs.insert(path, target);
            }
        }

        maps.blocked = data.meta_blocks.iter().cloned().collect();
        maps
    }

    /// Rewrites the longest symlinked directory prefix of `path`.
    fn follow_dir_symlink(&self, path: &str) -> Option<String> {
        let mut end = path.len();
        while let Some(pos) = path[..end].rfind('/') {
            if let Some(target) = self.symlinked_dirs.get(&path[..pos]) {
                return Some(format!("{target}{}", &path[pos..]));
            }
            end = pos;
        }
        None
    }
}

/// The in-memory repository index.
#[derive(Default)]
pub struct ContentIndex {
    maps: RwLock<IndexMaps>,
    listeners: Mutex<Vec<Listener>>,
}

impl fmt::Debug for ContentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let maps = self.maps.read().unwrap();
        f.debug_struct("ContentIndex")
            .field("archives", &maps.hash_to_path.len())
            .field("symlinked_dirs", &maps.symlinked_dirs.len())
            .field("symlinked_files", &maps.symlinked_files.len())
            .field("blocked", &maps.blocked.len())
            .finish()
    }
}

impl ContentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the index with `data` and notifies all listeners.
    pub fn update(&self, data: &IndexData) {
        let maps = IndexMaps::from_data(data);
        tracing::info!(
            "Index: found {} hash entries, {} symlinked dirs, {} symlinked files, {} blocked files",
            maps.hash_to_path.len(),
            maps.symlinked_dirs.len(),
            maps.symlinked_files.len(),
            maps.blocked.len(),
        );
        metric!(gauge("index.archives") = maps.hash_to_path.len() as u64);

        let snapshot = maps.hash_to_date.clone();
        *self.maps.write().unwrap() = maps;

        for listener in self.listeners.lock().unwrap().iter() {
            listener(&snapshot);
        }
    }

    /// Registers a function called with a fresh snapshot after every [`update`](Self::update).
    pub fn on_update<F>(&self, listener: F)
    where
        F: Fn(&IndexSnapshot) + Send + Sync + 'static,
    {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    pub fn lookup_hash(&self, path: &str) -> Option<String> {
        self.maps.read().unwrap().path_to_hash.get(path).cloned()
    }

    pub fn lookup_path(&self, hash: &str) -> Option<String> {
        self.maps.read().unwrap().hash_to_path.get(hash).cloned()
    }

    pub fn lookup_date(&self, hash: &str) -> Option<i64> {
        self.maps.read().unwrap().hash_to_date.get(hash).copied()
    }

    /// The dates of all archives.
    pub fn snapshot(&self) -> IndexSnapshot {
        self.maps.read().unwrap().hash_to_date.clone()
    }

    pub fn len(&self) -> usize {
        self.maps.read().unwrap().hash_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up the hash of the archive at `path`, following symlinks.
    pub fn resolve_path(&self, path: &str) -> Option<String> {
        let maps = self.maps.read().unwrap();
        let mut path = path.trim_matches('/').to_owned();
        for _ in 0..MAX_SYMLINK_DEPTH {
            if let Some(hash) = maps.path_to_hash.get(&path) {
                return Some(hash.clone());
            }
            path = match maps.symlinked_files.get(&path) {
                Some(target) => target.clone(),
                None => maps.follow_dir_symlink(&path)?,
            };
        }
        tracing::debug!("Too many symlinks resolving {path}");
        None
    }

    pub fn is_blocked(&self, hash: &str) -> bool {
        self.maps.read().unwrap().blocked.contains(hash)
    }
}
