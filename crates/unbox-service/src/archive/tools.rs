use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

use crate::caching::{ArchiveError, ArchiveResult};

use super::{ArchiveFormat, Listing};

/// A stream of bytes of a file extracted from an archive.
pub type FileStream = BoxStream<'static, io::Result<Bytes>>;

/// Looks inside archives of one format.
pub trait ArchiveTool: Send + Sync + fmt::Debug {
    /// Lists the files contained in the archive at `archive`.
    ///
    /// Fails with [`ArchiveReadError`](ArchiveError::ArchiveReadError) if the archive cannot
    /// be read.
    fn list<'a>(&'a self, archive: &'a Path) -> BoxFuture<'a, ArchiveResult<Listing>>;

    /// Starts extracting `file` and returns its contents as a stream.
    ///
    /// Failures that only become known once the extraction has finished are logged, but are
    /// not reported through the stream.
    fn extract_stream(&self, archive: &Path, file: &str) -> ArchiveResult<FileStream>;

    /// Extracts `file` into memory.
    ///
    /// Fails with [`BufferLimitExceeded`](ArchiveError::BufferLimitExceeded) if the file is
    /// larger than `max_size` bytes.
    fn extract_buffer<'a>(
        &'a self,
        archive: &'a Path,
        file: &'a str,
        max_size: u64,
    ) -> BoxFuture<'a, ArchiveResult<Bytes>>;

    /// Detects the MIME type of `file` from its contents.
    fn sniff_type<'a>(&'a self, archive: &'a Path, file: &'a str)
    -> BoxFuture<'a, ArchiveResult<String>>;
}

/// An [`ArchiveTool`] that runs `tar` or `unzip`, and `file` for type detection.
#[derive(Debug, Clone, Copy)]
pub struct CommandTool {
    format: ArchiveFormat,
}

impl CommandTool {
    pub fn for_format(format: ArchiveFormat) -> Self {
        Self { format }
    }

    fn program(&self) -> &'static str {
        if self.format.is_tar() { "tar" } else { "unzip" }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(self.program());
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn list_command(&self, archive: &Path) -> Command {
        let mut command = self.command();
        match self.format {
            ArchiveFormat::Zip => command.arg("-Z1"),
            _ => command.arg("-tf"),
        };
        command.arg(archive);
        command
    }

    fn extract_command(&self, archive: &Path, file: &str) -> Command {
        let mut command = self.command();
        match self.format {
            ArchiveFormat::Zip => command
                .arg("-p")
                .arg(archive)
                .arg(escape_unzip_pattern(file)),
            ArchiveFormat::TarZ => command.arg("-xOZf").arg(archive).arg("--").arg(file),
            ArchiveFormat::TarGz | ArchiveFormat::Tgz => {
                command.arg("-xOzf").arg(archive).arg("--").arg(file)
            }
        };
        command
    }

    /// Checks the exit status of `tar` or `unzip`.
    ///
    /// `unzip` exits with `1` when it succeeded with warnings, which is not a failure.
    fn check_status(&self, status: ExitStatus) -> Result<(), String> {
        match status.code() {
            Some(0) => Ok(()),
            Some(1) if self.format == ArchiveFormat::Zip => Ok(()),
            Some(_) => Err(status.to_string()),
            // Terminated by a signal.
            None => Err(format!("SIGNAL ({status})")),
        }
    }
}

impl ArchiveTool for CommandTool {
    fn list<'a>(&'a self, archive: &'a Path) -> BoxFuture<'a, ArchiveResult<Listing>> {
        async move {
            let program = self.program();
            let output = self
                .list_command(archive)
                .output()
                .await
                .map_err(ArchiveError::from_std_error)?;

            let stderr = String::from_utf8_lossy(&output.stderr);
            log_stderr(program, archive, &stderr);
            if let Err(reason) = self.check_status(output.status) {
                return Err(ArchiveError::ArchiveReadError(format!(
                    "{}: {program} error: {reason}: {}",
                    archive.display(),
                    stderr.trim()
                )));
            }

            Ok(Listing::parse(&String::from_utf8_lossy(&output.stdout)))
        }
        .boxed()
    }

    fn extract_stream(&self, archive: &Path, file: &str) -> ArchiveResult<FileStream> {
        let program = self.program();
        let mut child = self
            .extract_command(archive, file)
            .spawn()
            .map_err(ArchiveError::from_std_error)?;
        let stdout = child.stdout.take().ok_or(ArchiveError::InternalError)?;
        let stderr = collect_stderr(child.stderr.take());

        let tool = *self;
        let file = file.to_owned();
        let archive = archive.to_owned();
        let finish = stream::once(async move {
            let status = child.wait().await;
            let stderr = stderr.await.unwrap_or_default();
            log_stderr(program, &archive, &stderr);
            match status {
                Ok(status) => {
                    if let Err(reason) = tool.check_status(status) {
                        metric!(counter("extract.failed") += 1, "mode" => "stream");
                        tracing::warn!(
                            archive = %archive.display(),
                            "{file}: {program} error: {reason}"
                        );
                    }
                }
                Err(e) => {
                    let dynerr: &dyn std::error::Error = &e;
                    tracing::error!(error = dynerr, "failed to wait for {program}");
                }
            }
            None::<io::Result<Bytes>>
        })
        .filter_map(future::ready);

        Ok(ReaderStream::new(stdout).chain(finish).boxed())
    }

    fn extract_buffer<'a>(
        &'a self,
        archive: &'a Path,
        file: &'a str,
        max_size: u64,
    ) -> BoxFuture<'a, ArchiveResult<Bytes>> {
        async move {
            let program = self.program();
            let mut child = self
                .extract_command(archive, file)
                .spawn()
                .map_err(ArchiveError::from_std_error)?;
            let stdout = child.stdout.take().ok_or(ArchiveError::InternalError)?;
            let stderr = collect_stderr(child.stderr.take());

            let mut buffer = Vec::new();
            stdout
                .take(max_size.saturating_add(1))
                .read_to_end(&mut buffer)
                .await?;

            if buffer.len() as u64 > max_size {
                let _ = child.kill().await;
                stderr.abort();
                return Err(ArchiveError::BufferLimitExceeded(max_size));
            }

            let status = child.wait().await?;
            let stderr = stderr.await.unwrap_or_default();
            log_stderr(program, archive, &stderr);
            self.check_status(status).map_err(|reason| {
                ArchiveError::ExtractionError(format!(
                    "{file}: {program} error: {reason}: {}",
                    stderr.trim()
                ))
            })?;

            Ok(Bytes::from(buffer))
        }
        .boxed()
    }

    fn sniff_type<'a>(
        &'a self,
        archive: &'a Path,
        file: &'a str,
    ) -> BoxFuture<'a, ArchiveResult<String>> {
        async move {
            let program = self.program();
            let mut extractor = self
                .extract_command(archive, file)
                .spawn()
                .map_err(ArchiveError::from_std_error)?;
            let mut extracted = extractor.stdout.take().ok_or(ArchiveError::InternalError)?;
            let extractor_stderr = collect_stderr(extractor.stderr.take());

            let mut sniffer = Command::new("file")
                .args(["-i", "-"])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(ArchiveError::from_std_error)?;
            let mut stdin = sniffer.stdin.take().ok_or(ArchiveError::InternalError)?;

            let feed = async move {
                let copied = tokio::io::copy(&mut extracted, &mut stdin).await;
                drop(stdin);
                match copied {
                    // `file` stops reading once it has seen enough.
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        tokio::io::copy(&mut extracted, &mut tokio::io::sink())
                            .await
                            .map(drop)
                    }
                    other => other.map(drop),
                }
            };

            let (fed, sniffed) = tokio::join!(feed, sniffer.wait_with_output());
            let extracted_status = extractor.wait().await?;
            let sniffed = sniffed?;
            fed?;

            let mut stderr = extractor_stderr.await.unwrap_or_default();
            stderr.push_str(&String::from_utf8_lossy(&sniffed.stderr));
            log_stderr(program, archive, &stderr);

            let failed = self
                .check_status(extracted_status)
                .err()
                .or_else(|| (!sniffed.status.success()).then(|| sniffed.status.to_string()));
            if let Some(reason) = failed {
                return Err(ArchiveError::ExtractionError(format!(
                    "{file}: {program}|file error: {reason}: {}",
                    stderr.trim()
                )));
            }

            let description = String::from_utf8_lossy(&sniffed.stdout);
            let description = description.trim();
            let description = description
                .strip_prefix("/dev/stdin:")
                .unwrap_or(description);
            Ok(description.trim().to_owned())
        }
        .boxed()
    }
}

/// Reads all of a child's stderr in the background.
fn collect_stderr(stderr: Option<ChildStderr>) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut stderr) = stderr {
            // Whatever was read before an error is still worth logging.
            let _ = stderr.read_to_end(&mut buffer).await;
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn log_stderr(program: &str, archive: &Path, stderr: &str) {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        tracing::warn!(archive = %archive.display(), "{program} error: {stderr}");
    }
}

/// Escapes the characters `unzip` interprets in file arguments.
///
/// Wildcards are wrapped in brackets and backslashes are doubled. A leading `-` is bracketed
/// as well, so that the name is not taken for an option.
fn escape_unzip_pattern(file: &str) -> String {
    let mut escaped = String::with_capacity(file.len() + 2);
    for (i, c) in file.chars().enumerate() {
        match c {
            '[' | '*' | '?' => {
                escaped.push('[');
                escaped.push(c);
                escaped.push(']');
            }
            '-' if i == 0 => escaped.push_str("[-]"),
            '\\' => escaped.push_str("\\\\"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// The [`ArchiveTool`] to use for every [`ArchiveFormat`].
#[derive(Debug, Clone)]
pub struct Tools {
    tools: HashMap<ArchiveFormat, Arc<dyn ArchiveTool>>,
}

impl Tools {
    /// Replaces the tool used for `format`.
    pub fn with_tool(mut self, format: ArchiveFormat, tool: Arc<dyn ArchiveTool>) -> Self {
        self.tools.insert(format, tool);
        self
    }

    pub fn get(&self, format: ArchiveFormat) -> ArchiveResult<&dyn ArchiveTool> {
        self.tools
            .get(&format)
            .map(|tool| tool.as_ref())
            .ok_or_else(|| ArchiveError::UnsupportedFormat(format.to_string()))
    }
}

impl Default for Tools {
    fn default() -> Self {
        let tools = ArchiveFormat::ALL
            .into_iter()
            .map(|format| {
                let tool: Arc<dyn ArchiveTool> = Arc::new(CommandTool::for_format(format));
                (format, tool)
            })
            .collect();
        Self { tools }
    }
}
