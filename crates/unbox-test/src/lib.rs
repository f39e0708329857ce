//! Helpers for testing the unbox service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function (e.g.
//!    `let _data_dir = test::tempdir()`).
//!
//!  - When using [`OriginServer`], make sure that the server is held until all requests to
//!    it have been made. If the server is dropped, all connections to it fail.
//!
//!  - Tests that shell out to `unzip`, `tar` or `file` should start with [`require_tool!`], so
//!    that they are skipped on machines without these tools.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{self, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;
pub use which;

/// A `Last-Modified` date to serve archives with.
///
/// This is `1445412480000` in milliseconds since the epoch.
pub const LAST_MODIFIED: &str = "Wed, 21 Oct 2015 07:28:00 GMT";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the unbox crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("unbox_service=trace,unbox=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Skips the current test if the given program cannot be found on the `PATH`.
#[macro_export]
macro_rules! require_tool {
    ($tool:expr) => {
        if $crate::which::which($tool).is_err() {
            println!("Skipping due to missing tool `{}`", $tool);
            return;
        }
    };
}

/// Builds a zip archive in memory.
///
/// Entries ending in `/` are added as directories, all other entries as stored files.
pub fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);

    for (name, contents) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
    }

    writer.finish().unwrap().into_inner()
}

/// Builds a compressed tarball at `path` using the `tar` command.
///
/// The compression is picked from the extension: `.tar.Z` uses `compress`, anything else gzip.
/// Entry names are stored exactly as given, so `./a.txt` shows up as `./a.txt` in the listing
/// of the archive.
pub fn tar_archive(path: &Path, entries: &[(&str, &[u8])]) {
    let staging = tempdir();
    for (name, contents) in entries {
        let file = staging.path().join(name.trim_start_matches("./"));
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(file, contents).unwrap();
    }

    let create = if path.to_string_lossy().ends_with(".tar.Z") {
        "-cZf"
    } else {
        "-czf"
    };
    let status = Command::new("tar")
        .arg(create)
        .arg(path)
        .arg("-C")
        .arg(staging.path())
        .arg("--")
        .args(entries.iter().map(|(name, _)| name))
        .status()
        .unwrap();
    assert!(status.success(), "tar failed with {status}");
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Clone)]
struct OriginFile {
    contents: Vec<u8>,
    last_modified: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct OriginState {
    files: Arc<Mutex<HashMap<String, OriginFile>>>,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

async fn serve_file(
    State(state): State<OriginState>,
    extract::Path(path): extract::Path<String>,
) -> Response {
    *state.hits.lock().unwrap().entry(path.clone()).or_default() += 1;

    let file = state.files.lock().unwrap().get(&path).cloned();
    let Some(file) = file else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut headers = HeaderMap::new();
    if let Some(date) = file.last_modified {
        headers.insert(header::LAST_MODIFIED, HeaderValue::from_str(&date).unwrap());
    }
    (headers, file.contents).into_response()
}

/// A stand-in for the archive origin, serving files under `/if-archive/`.
pub struct OriginServer {
    server: Server,
    state: OriginState,
}

impl OriginServer {
    pub fn new() -> Self {
        let state = OriginState::default();
        let router = Router::new()
            .route("/if-archive/*path", get(serve_file))
            .with_state(state.clone());

        Self {
            server: Server::with_router(router),
            state,
        }
    }

    /// Serves `contents` at the repository `path`, with a `Last-Modified` header if given.
    pub fn add(&self, path: &str, contents: impl Into<Vec<u8>>, last_modified: Option<&str>) {
        self.state.files.lock().unwrap().insert(
            path.to_owned(),
            OriginFile {
                contents: contents.into(),
                last_modified: last_modified.map(str::to_owned),
            },
        );
    }

    /// The base URL of the repository, to be used as the configured origin.
    pub fn origin(&self) -> Url {
        self.server.url("if-archive/")
    }

    /// The URL of the file at the repository `path`.
    pub fn url(&self, path: &str) -> Url {
        self.server.url(&format!("if-archive/{path}"))
    }

    /// The number of requests made for the repository `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.state
            .hits
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or_default()
    }
}

impl Default for OriginServer {
    fn default() -> Self {
        Self::new()
    }
}
