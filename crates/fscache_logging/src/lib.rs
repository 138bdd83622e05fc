//! Shared logging setup for the fscache binaries.
//!
//! The daemon logs to stderr and to a size-rotated file under
//! `$FSCACHE_HOME/logs`. Short-lived scan workers log to stderr only.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "fscache=info,fscache_worker=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration shared by fscache binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror the file filter on stderr instead of warnings only.
    pub verbose: bool,
    /// Write a rotated log file in addition to stderr.
    pub to_file: bool,
}

/// Initialize tracing for a binary.
///
/// `RUST_LOG` overrides the default filter for both outputs.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose || !config.to_file {
        filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    if !config.to_file {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            )
            .init();
        return Ok(());
    }

    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = SharedRollingWriter::new(&log_dir, config.app_name)
        .context("Failed to initialize rolling log writer")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// The fscache home directory: `$FSCACHE_HOME` or `~/.fscache`.
pub fn fscache_home() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var("FSCACHE_HOME") {
        return Ok(PathBuf::from(override_path));
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".fscache"))
}

/// The logs directory: `<home>/logs`.
pub fn logs_dir() -> Result<PathBuf> {
    Ok(fscache_home()?.join("logs"))
}

/// Ensure the logs directory exists and return it.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir()?;
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-based rotation: `name.log` -> `name.log.1` -> ... -> `name.log.{max_files-1}`.
struct RotatingFile {
    dir: PathBuf,
    base_name: String,
    max_files: usize,
    max_size: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    fn open(dir: &Path, base_name: &str, max_files: usize, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut rotating = Self {
            dir: dir.to_path_buf(),
            base_name: sanitize_name(base_name),
            max_files: max_files.max(1),
            max_size,
            file: None,
            written: 0,
        };
        rotating.reopen()?;
        if rotating.written > rotating.max_size {
            rotating.rotate()?;
        }
        Ok(rotating)
    }

    fn path(&self, index: usize) -> PathBuf {
        if index == 0 {
            self.dir.join(format!("{}.log", self.base_name))
        } else {
            self.dir.join(format!("{}.log.{}", self.base_name, index))
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(0))?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let last = self.max_files - 1;
        if last > 0 {
            let oldest = self.path(last);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for index in (0..last).rev() {
                let src = self.path(index);
                if src.exists() {
                    fs::rename(&src, self.path(index + 1))?;
                }
            }
        }

        self.reopen()
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
struct SharedRollingWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl SharedRollingWriter {
    fn new(dir: &Path, base_name: &str) -> Result<Self> {
        let file = RotatingFile::open(dir, base_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {}", base_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRollingWriter {
    type Writer = SharedRollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for SharedRollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
