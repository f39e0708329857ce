use unbox_service::config::Config;
use unbox_service::index::IndexData;
use unbox_service::service::UnboxService;
use unbox_test as test;

pub use test::{OriginServer, TempDir};

/// The date of [`test::LAST_MODIFIED`] in milliseconds since the epoch.
pub const DATE: i64 = 1_445_412_480_000;

/// A service under test along with the origin it downloads from.
///
/// The data directory is deleted when this is dropped. Keep it alive until the test has
/// finished.
pub struct TestService {
    pub service: UnboxService,
    pub origin: OriginServer,
    pub config: Config,
    pub data_dir: TempDir,
}

/// Setup tests and create a test service.
///
/// The service downloads from a local [`OriginServer`] and keeps its cache in a temporary data
/// directory. The `update_config` closure can modify the configuration before the service is
/// created.
pub async fn setup_service(update_config: impl FnOnce(&mut Config)) -> TestService {
    test::setup();

    let data_dir = test::tempdir();
    let origin = OriginServer::new();

    let mut config = Config {
        data_dir: data_dir.path().to_owned(),
        origin: origin.origin(),
        ..Default::default()
    };
    update_config(&mut config);

    let service = UnboxService::create(&config).await.unwrap();

    TestService {
        service,
        origin,
        config,
        data_dir,
    }
}

/// Builds index data listing the given repository paths, all dated [`DATE`].
pub fn index_data(paths: &[&str]) -> IndexData {
    let mut data = IndexData::default();
    for path in paths {
        data.add_file(path, DATE);
    }
    data
}

impl TestService {
    /// Serves `contents` at `path` and replaces the index with `paths`.
    pub fn publish(&self, path: &str, contents: impl Into<Vec<u8>>, paths: &[&str]) {
        self.origin.add(path, contents, Some(test::LAST_MODIFIED));
        self.service.index().update(&index_data(paths));
    }

    /// The names of all files in the cache directory, sorted.
    pub fn cached_files(&self) -> Vec<String> {
        list_dir(&self.config.cache_dir())
    }

    /// The names of all files in the directory of in-progress downloads, sorted.
    pub fn tmp_files(&self) -> Vec<String> {
        list_dir(&self.config.tmp_dir())
    }
}

fn list_dir(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
