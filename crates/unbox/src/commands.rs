//! Implementations of the subcommands.
use std::io::Write;
use std::path::Path;

use anyhow::{Result, bail};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use unbox_service::archive::normalize_path;
use unbox_service::config::Config;
use unbox_service::service::UnboxService;

/// Prints the files in `archive`, optionally only those ending in `find`.
pub async fn list(config: &Config, archive: &str, find: Option<&str>) -> Result<()> {
    let service = UnboxService::create(config).await?;
    let (_, entry) = service.open(archive).await?;

    let mut stdout = std::io::stdout().lock();
    match find {
        Some(suffix) => {
            for path in entry.find(suffix) {
                writeln!(stdout, "{path}")?;
            }
        }
        None => {
            for path in &entry.contents {
                writeln!(stdout, "{path}")?;
            }
        }
    }
    Ok(())
}

/// Streams a file out of `archive` to `output`, or to stdout.
pub async fn extract(
    config: &Config,
    archive: &str,
    file: &str,
    output: Option<&Path>,
) -> Result<()> {
    let service = UnboxService::create(config).await?;
    let (hash, entry) = service.open(archive).await?;

    let path = normalize_path(file);
    if !entry.contains(&path) {
        bail!("{archive} does not contain {path}");
    }

    let stream = service.get_file_stream(&hash, &entry, &path)?;
    let mut reader = StreamReader::new(stream);

    let written = match output {
        Some(output) => {
            let mut file = tokio::fs::File::create(output).await?;
            copy_all(&mut reader, &mut file).await?
        }
        None => copy_all(&mut reader, &mut tokio::io::stdout()).await?,
    };

    tracing::debug!("Extracted {path} from {archive}, {written} bytes");
    Ok(())
}

async fn copy_all<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let written = tokio::io::copy(reader, writer).await?;
    writer.flush().await?;
    Ok(written)
}

/// Prints the content type of a file in `archive`.
pub async fn file_type(config: &Config, archive: &str, file: &str) -> Result<()> {
    let service = UnboxService::create(config).await?;
    let (hash, entry) = service.open(archive).await?;

    let path = normalize_path(file);
    if !entry.contains(&path) {
        bail!("{archive} does not contain {path}");
    }

    let mime = service.content_type(&hash, &entry, &path).await?;
    println!("{mime}");
    Ok(())
}

/// Restores the cache, purges archives outdated according to the stored index, and evicts
/// archives until the cache is within its bounds.
pub async fn cleanup(config: &Config) -> Result<()> {
    // Creating the service restores the cache and purges it against the stored index.
    let service = UnboxService::create(config).await?;
    if service.index().is_empty() {
        tracing::warn!("No index data available, outdated archives are kept");
    }

    let evicted = service.cache().evict();
    let stats = service.cache().stats();
    tracing::info!(
        "Cache cleaned up: {} archives evicted, {} archives left, {} bytes total",
        evicted,
        stats.entries,
        stats.size
    );
    Ok(())
}
