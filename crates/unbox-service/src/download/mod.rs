//! Downloads archives from the origin.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use humantime_serde::re::humantime::format_duration;
use reqwest::{Client, header};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::caching::{ArchiveError, ArchiveResult};
use crate::config::Config;

/// The user agent sent with every request to the origin.
pub const USER_AGENT: &str = concat!("unbox/", env!("CARGO_PKG_VERSION"));

/// Various timeouts for all the downloads.
#[derive(Debug, Clone, Copy)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The upper limit for downloading a single archive.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The parts of a response needed once its body has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    /// The raw `Last-Modified` header, if the response had one.
    pub last_modified: Option<String>,
    /// The number of bytes written.
    pub size: u64,
}

/// A service which downloads files from the origin.
#[derive(Debug)]
pub struct DownloadService {
    client: Client,
    timeouts: DownloadTimeouts,
}

impl DownloadService {
    pub fn new(config: &Config) -> reqwest::Result<Arc<Self>> {
        Self::with_timeouts(DownloadTimeouts::from_config(config))
    }

    pub fn with_timeouts(timeouts: DownloadTimeouts) -> reqwest::Result<Arc<Self>> {
        let client = Client::builder()
            .hickory_dns(true)
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.max_download)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Arc::new(Self { client, timeouts }))
    }

    /// Downloads `url` into `destination`.
    ///
    /// The body is streamed to the file. A response with a status other than `2xx`, a
    /// connection failure or a download exceeding the maximum download time fails with
    /// [`OriginFetchError`](ArchiveError::OriginFetchError).
    pub async fn download(
        &self,
        url: Url,
        destination: &mut File,
    ) -> ArchiveResult<DownloadedFile> {
        let timeout = self.timeouts.max_download;
        let result =
            match tokio::time::timeout(timeout, self.download_inner(&url, destination)).await {
                Ok(result) => result,
                Err(_) => Err(ArchiveError::OriginFetchError(format!(
                    "download of {url} timed out after {}",
                    format_duration(timeout)
                ))),
            };

        let status = match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        };
        metric!(counter("downloads") += 1, "status" => status);
        if let Ok(downloaded) = &result {
            metric!(time_raw("downloads.size") = downloaded.size);
        }
        if let Err(err) = &result {
            tracing::debug!(error = err as &dyn std::error::Error, "failed to download {url}");
        }

        result
    }

    async fn download_inner(
        &self,
        url: &Url,
        destination: &mut File,
    ) -> ArchiveResult<DownloadedFile> {
        tracing::debug!("Fetching archive from `{}`", url);

        let response = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!("Unexpected status code from `{url}`: {status}");
            return Err(ArchiveError::OriginFetchError(format!(
                "Error accessing {url}: {status}"
            )));
        }

        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let mut size = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            destination.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        destination.flush().await?;

        Ok(DownloadedFile {
            last_modified,
            size,
        })
    }
}
