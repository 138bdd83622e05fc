//! One scan: walk a job's root, keep the files whose path matches, capture them.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use fscache_protocol::ScanOutcome;
use regex::Regex;
use rmpv::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::walker::TreeWalker;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan of job '{0}' was cancelled")]
    Cancelled(String),
}

/// Regex matched against the full path, anchored at the start only.
///
/// `data\.p$` does not match `/m/a/data.p`; write `^.*/data\.p$` instead.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{})", pattern))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// The pattern as written, without the added anchor.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for PathPattern {}

/// What gets cached for each matching file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CaptureMode {
    /// The file's full bytes.
    #[default]
    Content,
    /// A msgpack map `{size, mtime, mode, is_file}`.
    Metadata,
}

impl CaptureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureMode::Content => "content",
            CaptureMode::Metadata => "metadata",
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "content" => Ok(CaptureMode::Content),
            "metadata" => Ok(CaptureMode::Metadata),
            other => Err(format!(
                "unknown capture mode '{}' (expected content or metadata)",
                other
            )),
        }
    }
}

/// Everything a worker needs to run one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    pub name: String,
    pub root: PathBuf,
    pub pattern: PathPattern,
    pub capture: CaptureMode,
}

/// Run one full scan.
///
/// Returns [`ScanOutcome::PreconditionFailed`] without walking when the root
/// is missing or not a directory. A matched symlink is captured when it
/// resolves to a regular file; dangling links and links to directories are
/// skipped. Matched files that fail to read, and paths that are not valid
/// UTF-8, are skipped with a warning.
pub fn run_scan(job: &ScanJob, cancel: &CancellationToken) -> Result<ScanOutcome, ScanError> {
    if !job.root.is_dir() {
        info!(
            "Job '{}': root {} is not a directory, skipping walk",
            job.name,
            job.root.display()
        );
        return Ok(ScanOutcome::PreconditionFailed);
    }

    let mut walker = TreeWalker::new(&job.root).with_cancel(cancel.clone());
    let mut matches = BTreeMap::new();
    let mut visited = 0usize;

    for entry in walker.by_ref() {
        visited += 1;

        let Some(path) = entry.path.to_str() else {
            warn!("Job '{}': skipping non UTF-8 path {:?}", job.name, entry.path);
            continue;
        };
        if !job.pattern.is_match(path) {
            continue;
        }
        let Some(metadata) = regular_file_metadata(&entry.path, entry.metadata) else {
            continue;
        };

        match capture(job.capture, &entry.path, &metadata) {
            Ok(blob) => {
                matches.insert(path.to_string(), blob);
            }
            Err(e) => warn!("Job '{}': failed to capture {}: {}", job.name, path, e),
        }
    }

    if cancel.is_cancelled() {
        return Err(ScanError::Cancelled(job.name.clone()));
    }

    debug!(
        "Job '{}': visited {} entries, {} matched, {} skipped",
        job.name,
        visited,
        matches.len(),
        walker.skipped()
    );
    Ok(ScanOutcome::Matches(matches))
}

/// Metadata of the regular file behind `path`, following one symlink level
/// through the OS. The walker never descends into the link either way.
fn regular_file_metadata(path: &Path, lstat: Metadata) -> Option<Metadata> {
    if lstat.is_file() {
        return Some(lstat);
    }
    if !lstat.file_type().is_symlink() {
        return None;
    }
    match std::fs::metadata(path) {
        Ok(target) if target.is_file() => Some(target),
        Ok(_) => None,
        Err(e) => {
            debug!("Dangling symlink {}: {}", path.display(), e);
            None
        }
    }
}

fn capture(mode: CaptureMode, path: &Path, metadata: &Metadata) -> std::io::Result<Vec<u8>> {
    match mode {
        CaptureMode::Content => std::fs::read(path),
        CaptureMode::Metadata => encode_metadata(metadata),
    }
}

fn encode_metadata(metadata: &Metadata) -> std::io::Result<Vec<u8>> {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    let value = Value::Map(vec![
        (Value::from("size"), Value::from(metadata.len())),
        (Value::from("mtime"), Value::from(mtime)),
        (Value::from("mode"), Value::from(file_mode(metadata))),
        (Value::from("is_file"), Value::from(metadata.is_file())),
    ]);

    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value)?;
    Ok(buf)
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.mode()
}

#[cfg(not(unix))]
fn file_mode(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
