//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use unbox_service::config::Config;
use unbox_service::metrics;

use crate::commands;
use crate::logging;

/// Unbox commands.
#[derive(Subcommand)]
enum Command {
    /// List the files in an archive.
    List {
        /// Repository path or URL of the archive.
        archive: String,

        /// Only list files whose path ends with this suffix.
        #[arg(long)]
        find: Option<String>,
    },

    /// Extract a single file from an archive.
    Extract {
        /// Repository path or URL of the archive.
        archive: String,

        /// Path of the file within the archive.
        file: String,

        /// Write the file here instead of to stdout.
        #[arg(long, short, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Print the content type of a file in an archive.
    FileType {
        /// Repository path or URL of the archive.
        archive: String,

        /// Path of the file within the archive.
        file: String,
    },

    /// Clean the local cache.
    Cleanup,
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "unbox", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime has not been started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("unbox")
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Command::List { archive, find } => commands::list(&config, &archive, find.as_deref())
                .await
                .context("failed to list archive"),
            Command::Extract {
                archive,
                file,
                output,
            } => commands::extract(&config, &archive, &file, output.as_deref())
                .await
                .context("failed to extract file"),
            Command::FileType { archive, file } => commands::file_type(&config, &archive, &file)
                .await
                .context("failed to detect content type"),
            Command::Cleanup => commands::cleanup(&config)
                .await
                .context("failed to clean up cache"),
        }
    })
}
