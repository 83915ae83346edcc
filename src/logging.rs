//! Logging setup: console output plus an optional append-only log file

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_FILE_NAME: &str = "source-syncer.log";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Use `debug` instead of `level`
    pub verbose: bool,
    /// Only errors reach the console
    pub silent: bool,
    /// Directory of the log file; `None` disables the file sink
    pub directory: Option<PathBuf>,
}

/// Install the global subscriber. Returns the log file path when one is written.
pub fn init_logging(options: &LogOptions) -> Result<Option<PathBuf>> {
    let default_level = if options.verbose {
        "debug"
    } else if options.level.trim().is_empty() {
        "info"
    } else {
        options.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console = fmt::layer().with_filter(if options.silent {
        LevelFilter::ERROR
    } else {
        LevelFilter::TRACE
    });

    let (file_layer, log_path) = match &options.directory {
        Some(directory) => {
            let (file, path) = open_log_file(directory)?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to install logging subscriber")?;

    Ok(log_path)
}

/// Open (creating if needed) the log file inside `directory` for appending.
pub fn open_log_file(directory: &Path) -> Result<(File, PathBuf)> {
    fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {:?}", directory))?;

    let path = directory.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {:?}", path))?;

    Ok((file, path))
}
